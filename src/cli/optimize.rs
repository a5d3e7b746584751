//! `nestopt optimize`: rewrite one or more kernels.

use std::path::PathBuf;

use clap::Args;
use rayon::prelude::*;

use nestopt::kernel::KernelFile;
use nestopt::session::{OptLevel, RewriteConfig, Session};

#[derive(Args)]
pub struct OptimizeArgs {
    /// Kernel JSON files
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,
    /// Optimization level (0..4)
    #[arg(long, default_value_t = 2)]
    pub level: u8,
    /// Write the optimized kernel back as JSON beside the input
    /// (`<name>.opt.json`) instead of printing it
    #[arg(long)]
    pub output: bool,
    /// Emit the optimization log as JSON instead of the text report
    #[arg(long)]
    pub json_log: bool,
    /// Preserve factorization opportunities over maximal hoisting
    #[arg(long)]
    pub max_sharing: bool,
    /// Reuse textually identical hoisted expressions
    #[arg(long)]
    pub global_cse: bool,
}

pub fn run(args: OptimizeArgs) -> Result<(), String> {
    let level = OptLevel::from_u8(args.level)
        .ok_or_else(|| format!("invalid level {}, expected 0..4", args.level))?;
    let cfg = RewriteConfig {
        level,
        max_sharing: args.max_sharing,
        global_cse: args.global_cse,
        ..Default::default()
    };

    // Sessions are independent, so kernels optimize in parallel
    let outcomes: Vec<Result<String, String>> = args
        .inputs
        .par_iter()
        .map(|path| {
            let kernel = KernelFile::load(path)?;
            let mut sess = Session::build(kernel.ast, kernel.root)
                .map_err(|e| format!("{}: {}", kernel.name, e))?;
            sess.optimize(&cfg).map_err(|e| format!("{}: {}", kernel.name, e))?;

            let mut out = String::new();
            if args.output {
                let optimized = KernelFile::new(&kernel.name, sess.ast, sess.root);
                let path = path.with_extension("opt.json");
                optimized.save(&path)?;
                out.push_str(&format!("{} -> {}\n", kernel.name, path.display()));
            } else {
                out.push_str(&format!("// kernel: {}\n", kernel.name));
                out.push_str(&sess.ast.pretty(sess.root));
            }
            if args.json_log {
                out.push_str(&sess.log.to_json());
                out.push('\n');
            } else {
                out.push_str(&sess.log.format_report());
            }
            Ok(out)
        })
        .collect();

    let mut failed = false;
    for outcome in outcomes {
        match outcome {
            Ok(text) => print!("{}", text),
            Err(e) => {
                eprintln!("error: {}", e);
                failed = true;
            }
        }
    }
    if failed {
        Err("some kernels failed".to_string())
    } else {
        Ok(())
    }
}
