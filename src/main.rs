mod cli;

use clap::{Parser, Subcommand};

use cli::cost::CostArgs;
use cli::hoistable::HoistableArgs;
use cli::optimize::OptimizeArgs;

#[derive(Parser)]
#[command(
    name = "nestopt",
    version,
    about = "Loop-nest optimizer for finite-element assembly kernels"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rewrite kernels at an optimization level
    Optimize(OptimizeArgs),
    /// Print the FLOP report of a kernel
    Cost(CostArgs),
    /// Project the hoistable subexpressions of a kernel
    Hoistable(HoistableArgs),
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Optimize(args) => cli::optimize::run(args),
        Command::Cost(args) => cli::cost::run(args),
        Command::Hoistable(args) => cli::hoistable::run(args),
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
