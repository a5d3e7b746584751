//! Static operation-count model and the optimization log.
//!
//! `flops` walks an expression and counts floating-point additions,
//! subtractions, multiplications and divisions. Every mutating pass
//! reports a `PassRecord` (flops before and after, per target) through
//! a caller-provided sink; degenerate situations the passes skip over
//! are recorded as notes rather than errors.

use serde::{Deserialize, Serialize};

use crate::ast::{Ast, Node, NodeId};

/// Estimated floating-point operation count of the subtree at `id`.
///
/// Binary arithmetic counts one operation per node; negation is free
/// (sign flips fold into adjacent operations); calls are opaque and
/// contribute only their argument costs.
pub fn flops(ast: &Ast, id: NodeId) -> u64 {
    match ast.node(id) {
        Node::Bin { lhs, rhs, .. } => 1 + flops(ast, *lhs) + flops(ast, *rhs),
        Node::Symbol(_) | Node::FlatBlock(_) | Node::Table { .. } => 0,
        _ => ast.children(id).into_iter().map(|c| flops(ast, c)).sum(),
    }
}

/// FLOP count of a statement weighted by the trip counts of the loops
/// in `nest` (outermost first). Symbolic extents weigh 1.
pub fn weighted_flops(ast: &Ast, stmt: NodeId, nest: &[NodeId]) -> u64 {
    let trip: u64 = nest
        .iter()
        .map(|l| ast.loop_extent(*l).as_const().unwrap_or(1).max(1))
        .product();
    flops(ast, stmt) * trip
}

// ─── Optimization log ─────────────────────────────────────────────

/// One mutating pass applied to one target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassRecord {
    pub pass: String,
    pub target: String,
    pub flops_before: u64,
    pub flops_after: u64,
}

/// A non-fatal condition a pass skipped over.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub pass: String,
    pub message: String,
}

/// Where the engine sends its diagnostics.
pub trait RecordSink {
    fn record(&mut self, record: PassRecord);
    fn note(&mut self, note: Note);
}

/// Vec-backed sink, the default for sessions and tests.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RecordLog {
    pub records: Vec<PassRecord>,
    pub notes: Vec<Note>,
}

impl RecordSink for RecordLog {
    fn record(&mut self, record: PassRecord) {
        self.records.push(record);
    }

    fn note(&mut self, note: Note) {
        self.notes.push(note);
    }
}

impl RecordLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Human-readable report of all recorded passes.
    pub fn format_report(&self) -> String {
        let mut out = String::from("Optimization report:\n");
        let width = self
            .records
            .iter()
            .map(|r| r.pass.len())
            .max()
            .unwrap_or(4)
            .max(4);
        for r in &self.records {
            let delta = r.flops_after as i64 - r.flops_before as i64;
            out.push_str(&format!(
                "  {:<w$}  {:>8} -> {:>8}  ({:+})  {}\n",
                r.pass,
                r.flops_before,
                r.flops_after,
                delta,
                r.target,
                w = width
            ));
        }
        if let (Some(first), Some(last)) = (self.records.first(), self.records.last()) {
            out.push_str(&format!(
                "  {:<w$}  {:>8} -> {:>8}\n",
                "TOTAL",
                first.flops_before,
                last.flops_after,
                w = width
            ));
        }
        for n in &self.notes {
            out.push_str(&format!("  note [{}]: {}\n", n.pass, n.message));
        }
        out
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("log serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Ast, Extent, WriteOp};

    #[test]
    fn test_flops_counts_binary_ops() {
        let mut ast = Ast::new();
        let x = ast.var("X", &["i"]);
        let y = ast.var("Y", &["j"]);
        let c = ast.var("c", &[]);
        let p = ast.prod(x, y);
        let e = ast.prod(p, c);
        assert_eq!(flops(&ast, e), 2);
        let z = ast.var("Z", &["i"]);
        let s = ast.sum(e, z);
        assert_eq!(flops(&ast, s), 3);
    }

    #[test]
    fn test_flops_through_writer() {
        let mut ast = Ast::new();
        let lhs = ast.var("A", &["i"]);
        let x = ast.var("X", &["i"]);
        let y = ast.var("Y", &["i"]);
        let rhs = ast.sum(x, y);
        let w = ast.writer(WriteOp::Incr, lhs, rhs);
        assert_eq!(flops(&ast, w), 1);
    }

    #[test]
    fn test_weighted_flops() {
        let mut ast = Ast::new();
        let lhs = ast.var("A", &["i"]);
        let x = ast.var("X", &["i"]);
        let y = ast.var("Y", &["i"]);
        let rhs = ast.prod(x, y);
        let w = ast.writer(WriteOp::Assign, lhs, rhs);
        let b = ast.block(vec![w]);
        let fi = ast.for_loop("i", Extent::Const(4), b);
        assert_eq!(weighted_flops(&ast, w, &[fi]), 4);
    }

    #[test]
    fn test_report_format() {
        let mut log = RecordLog::new();
        log.record(PassRecord {
            pass: "licm".into(),
            target: "A[i][j]".into(),
            flops_before: 18,
            flops_after: 12,
        });
        log.note(Note {
            pass: "unpick".into(),
            message: "loop over `k` has symbolic trip count".into(),
        });
        let report = log.format_report();
        assert!(report.contains("Optimization report:"));
        assert!(report.contains("licm"));
        assert!(report.contains("(-6)"));
        assert!(report.contains("TOTAL"));
        assert!(report.contains("note [unpick]"));
    }

    #[test]
    fn test_log_json_roundtrip() {
        let mut log = RecordLog::new();
        log.record(PassRecord {
            pass: "expand".into(),
            target: "A[i][j]".into(),
            flops_before: 10,
            flops_after: 12,
        });
        let json = log.to_json();
        let parsed: RecordLog = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.records, log.records);
    }
}
