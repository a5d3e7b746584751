pub mod analysis;
pub mod ast;
pub mod cost;
pub mod error;
pub mod inspect;
pub mod kernel;
pub mod meta;
pub mod rewrite;
pub mod session;

// Re-exports — the names most callers need
pub use analysis::{ExpressionGraph, HoistedRegistry};
pub use error::{ErrorKind, Result, RewriteError};
pub use inspect::Target;
pub use meta::MetaExpr;
pub use rewrite::{
    CoverSolver, ExpandMode, ExpandOptions, FactorMode, GreedyCover, HoistMode, LicmOptions,
    Rewriter,
};
pub use session::{OptLevel, RewriteConfig, Session};
