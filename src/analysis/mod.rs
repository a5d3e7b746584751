//! Shared analyses consumed by the rewriting passes: loop-dependence
//! analysis, the read-after-write expression graph, and the registry
//! of hoisted temporaries.

pub mod graph;
pub mod hoisted;
pub mod lda;

pub use graph::ExpressionGraph;
pub use hoisted::{HoistedInfo, HoistedRegistry};
pub use lda::{lda_by_name, lda_by_occurrence, OccurrenceDeps};
