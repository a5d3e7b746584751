//! `nestopt cost`: static FLOP accounting of a kernel.

use std::path::PathBuf;

use clap::Args;

use nestopt::ast::navigate;
use nestopt::cost::weighted_flops;
use nestopt::kernel::KernelFile;
use nestopt::session::Session;

#[derive(Args)]
pub struct CostArgs {
    /// Kernel JSON file
    pub input: PathBuf,
}

pub fn run(args: CostArgs) -> Result<(), String> {
    let kernel = KernelFile::load(&args.input)?;
    let sess = Session::build(kernel.ast, kernel.root)
        .map_err(|e| format!("{}: {}", kernel.name, e))?;

    println!("Kernel: {}", kernel.name);
    let mut total = 0u64;
    for target in &sess.targets {
        let nest = target.info.loops();
        let cost = weighted_flops(&sess.ast, target.stmt, &nest);
        let lhs = sess.ast.repr(sess.ast.writer_lhs(target.stmt));
        let dims = target.info.dims(&sess.ast).join(", ");
        println!("  {:<12} loops ({})  {:>10} flops", lhs, dims, cost);
        total += cost;
    }
    // Statements outside the rewrite targets still cost flops
    for w in navigate::writers_in(&sess.ast, sess.root) {
        if sess.targets.iter().any(|t| t.stmt == w) {
            continue;
        }
        total += nestopt::cost::flops(&sess.ast, w);
    }
    println!("  {:<12} {:>21} flops", "TOTAL", total);
    Ok(())
}
