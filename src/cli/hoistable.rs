//! `nestopt hoistable`: look-ahead projection of hoistable groups.

use std::path::PathBuf;

use clap::Args;

use nestopt::kernel::KernelFile;
use nestopt::rewrite::{HoistMode, Rewriter};
use nestopt::session::Session;

#[derive(Args)]
pub struct HoistableArgs {
    /// Kernel JSON file
    pub input: PathBuf,
    /// Hoisting mode: normal, aggressive, only_const, only_domain,
    /// only_outdomain
    #[arg(long, default_value = "normal")]
    pub mode: String,
}

fn parse_mode(s: &str) -> Result<HoistMode, String> {
    match s {
        "normal" => Ok(HoistMode::Normal),
        "aggressive" => Ok(HoistMode::Aggressive),
        "only_const" => Ok(HoistMode::OnlyConst),
        "only_domain" => Ok(HoistMode::OnlyDomain),
        "only_outdomain" => Ok(HoistMode::OnlyOutdomain),
        other => Err(format!("unknown hoisting mode `{}`", other)),
    }
}

pub fn run(args: HoistableArgs) -> Result<(), String> {
    let mode = parse_mode(&args.mode)?;
    let kernel = KernelFile::load(&args.input)?;
    let mut sess = Session::build(kernel.ast, kernel.root)
        .map_err(|e| format!("{}: {}", kernel.name, e))?;

    let targets = sess.targets.clone();
    for target in targets {
        let lhs = sess.ast.repr(sess.ast.writer_lhs(target.stmt));
        println!("target {} ({} mode):", lhs, args.mode);
        let mut rw = Rewriter::new(&mut sess, target.stmt, target.info.clone());
        let groups = rw.hoistable(mode);
        if groups.is_empty() {
            println!("  nothing hoistable");
            continue;
        }
        for (dep, exprs) in groups {
            let dep = if dep.is_empty() {
                "const".to_string()
            } else {
                dep.join(", ")
            };
            for e in exprs {
                println!("  [{}]  {}", dep, sess.ast.repr(e));
            }
        }
    }
    Ok(())
}
