//! A rewrite session: one kernel, one AST, one set of shared state.
//!
//! The session owns the AST, the expression graph, the hoisted
//! registry, the declaration table, the record log, and the two
//! monotonically increasing counters that keep synthesized names
//! unique. Sessions are independent: optimizing two kernels in
//! parallel means two sessions, never one shared.

use indexmap::IndexMap;

use crate::analysis::{ExpressionGraph, HoistedRegistry};
use crate::ast::{Ast, NodeId};
use crate::cost::{weighted_flops, RecordLog};
use crate::error::Result;
use crate::inspect::{inspect, Target};
use crate::rewrite::{
    ExpandMode, ExpandOptions, FactorMode, HoistMode, LicmOptions, Rewriter,
};

/// Optimization levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    /// No rewriting.
    O0,
    /// Loop-invariant code motion only.
    O1,
    /// Expansion, factorization and code motion to a fixed point.
    O2,
    /// As O2; block-sparsity elimination is delegated externally.
    O3,
    /// As O3, plus reduction pre-evaluation.
    O4,
}

impl OptLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OptLevel::O0),
            1 => Some(OptLevel::O1),
            2 => Some(OptLevel::O2),
            3 => Some(OptLevel::O3),
            4 => Some(OptLevel::O4),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OptLevel::O0 => 0,
            OptLevel::O1 => 1,
            OptLevel::O2 => 2,
            OptLevel::O3 => 3,
            OptLevel::O4 => 4,
        }
    }
}

/// Configuration the facade recognizes.
#[derive(Clone, Debug)]
pub struct RewriteConfig {
    pub level: OptLevel,
    /// Repeat {extract; hoist} to a fixed point within licm.
    pub iterative: bool,
    /// Preserve factorization opportunities across shared symbols.
    pub max_sharing: bool,
    /// Reuse textually identical hoisted expressions.
    pub global_cse: bool,
    /// Forbid folding expanded factors into hoisted temporaries.
    pub not_aggregate: bool,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        RewriteConfig {
            level: OptLevel::O2,
            iterative: true,
            max_sharing: false,
            global_cse: false,
            not_aggregate: false,
        }
    }
}

impl RewriteConfig {
    pub fn for_level(level: OptLevel) -> Self {
        RewriteConfig {
            level,
            ..Default::default()
        }
    }

    fn licm_options(&self) -> LicmOptions {
        LicmOptions {
            iterative: self.iterative,
            max_sharing: self.max_sharing,
            global_cse: self.global_cse,
        }
    }

    fn expand_options(&self) -> ExpandOptions {
        ExpandOptions {
            not_aggregate: self.not_aggregate,
        }
    }
}

/// Fixed-point rounds are cut off after this many iterations.
const MAX_ROUNDS: usize = 8;

pub struct Session {
    pub ast: Ast,
    /// The header: the root block holding declarations and nests.
    pub root: NodeId,
    pub graph: ExpressionGraph,
    pub hoisted: HoistedRegistry,
    pub decls: IndexMap<String, NodeId>,
    pub targets: Vec<Target>,
    pub log: RecordLog,
    expr_counter: u32,
    handler_counter: u32,
}

impl Session {
    /// Inspect and validate a kernel, producing a fresh session.
    pub fn build(ast: Ast, root: NodeId) -> Result<Self> {
        let inspection = inspect(&ast, root)?;
        Ok(Session {
            ast,
            root,
            graph: ExpressionGraph::new(),
            hoisted: HoistedRegistry::new(),
            decls: inspection.decls,
            targets: inspection.targets,
            log: RecordLog::new(),
            expr_counter: 0,
            handler_counter: 0,
        })
    }

    pub(crate) fn next_expr_id(&mut self) -> u32 {
        let id = self.expr_counter;
        self.expr_counter += 1;
        id
    }

    pub(crate) fn next_handler_id(&mut self) -> u32 {
        let id = self.handler_counter;
        self.handler_counter += 1;
        id
    }

    /// Current counter values `(expr, handler)`.
    pub fn counters(&self) -> (u32, u32) {
        (self.expr_counter, self.handler_counter)
    }

    /// Zero the name counters at a session boundary.
    pub fn reset(&mut self) {
        self.expr_counter = 0;
        self.handler_counter = 0;
    }

    /// Total modelled cost of one target: the target statement under
    /// its nest plus every hoisted definition under its wrap loop.
    pub fn target_cost(&self, target: &Target) -> u64 {
        let nest = target.info.loops();
        let mut cost = weighted_flops(&self.ast, target.stmt, &nest);
        for (_, info) in self.hoisted.iter() {
            let wraps: Vec<NodeId> = info.wrap_loop.into_iter().collect();
            cost += weighted_flops(&self.ast, info.stmt, &wraps);
        }
        cost
    }

    /// Run the configured level over every rewrite target.
    pub fn optimize(&mut self, cfg: &RewriteConfig) -> Result<()> {
        if cfg.level == OptLevel::O0 {
            return Ok(());
        }
        let targets = self.targets.clone();
        for target in targets {
            match cfg.level {
                OptLevel::O0 => {}
                OptLevel::O1 => {
                    let mut rw = Rewriter::new(self, target.stmt, target.info.clone());
                    rw.licm(HoistMode::Normal, &cfg.licm_options())?;
                }
                OptLevel::O2 | OptLevel::O3 | OptLevel::O4 => {
                    self.rewrite_to_fixed_point(&target, cfg)?;
                    if cfg.level == OptLevel::O4 {
                        let mut rw = Rewriter::new(self, target.stmt, target.info.clone());
                        rw.preevaluate()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// The level-2 sequence: reassociate, expand, factorize, hoist,
    /// repeated while the modelled cost keeps dropping.
    fn rewrite_to_fixed_point(&mut self, target: &Target, cfg: &RewriteConfig) -> Result<()> {
        let mut last_cost = self.target_cost(target);
        for _ in 0..MAX_ROUNDS {
            {
                let mut rw = Rewriter::new(self, target.stmt, target.info.clone());
                rw.reassociate();
                rw.expand(ExpandMode::Standard, cfg.expand_options())?;
                rw.factorize(FactorMode::Standard)?;
                rw.licm(HoistMode::Normal, &cfg.licm_options())?;
            }
            let cost = self.target_cost(target);
            if cost >= last_cost {
                break;
            }
            last_cost = cost;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Extent, ScalarType, WriteOp};

    fn kernel() -> Session {
        // A[i][j] += X[i] * Y[j] * C
        let mut ast = Ast::new();
        let da = ast.decl(
            ScalarType::Double,
            "A",
            vec![Extent::Const(3), Extent::Const(3)],
        );
        let dx = ast.decl(ScalarType::Double, "X", vec![Extent::Const(3)]);
        let dy = ast.decl(ScalarType::Double, "Y", vec![Extent::Const(3)]);
        let dc = ast.decl(ScalarType::Double, "C", vec![]);
        let lhs = ast.var("A", &["i", "j"]);
        let x = ast.var("X", &["i"]);
        let y = ast.var("Y", &["j"]);
        let c = ast.var("C", &[]);
        let xy = ast.prod(x, y);
        let rhs = ast.prod(xy, c);
        let w = ast.writer(WriteOp::Incr, lhs, rhs);
        let jb = ast.block(vec![w]);
        let fj = ast.for_loop("j", Extent::Const(3), jb);
        let ib = ast.block(vec![fj]);
        let fi = ast.for_loop("i", Extent::Const(3), ib);
        let root = ast.root(vec![da, dx, dy, dc, fi]);
        Session::build(ast, root).unwrap()
    }

    #[test]
    fn test_counters_monotonic_and_reset() {
        let mut sess = kernel();
        let a = sess.next_expr_id();
        let b = sess.next_expr_id();
        let c = sess.next_handler_id();
        assert!(b > a);
        assert_eq!(c, 0);
        sess.reset();
        assert_eq!(sess.counters(), (0, 0));
        assert_eq!(sess.next_expr_id(), 0);
    }

    #[test]
    fn test_level0_is_noop() {
        let mut sess = kernel();
        let before = sess.ast.pretty(sess.root);
        sess.optimize(&RewriteConfig::for_level(OptLevel::O0)).unwrap();
        assert_eq!(sess.ast.pretty(sess.root), before);
        assert!(sess.log.records.is_empty());
    }

    #[test]
    fn test_level1_reduces_cost() {
        let mut sess = kernel();
        let target = sess.targets[0].clone();
        let before = sess.target_cost(&target);
        sess.optimize(&RewriteConfig::for_level(OptLevel::O1)).unwrap();
        let after = sess.target_cost(&target);
        assert_eq!(before, 18);
        assert_eq!(after, 12);
    }

    #[test]
    fn test_level2_never_worse_than_level1() {
        let mut s1 = kernel();
        let t1 = s1.targets[0].clone();
        s1.optimize(&RewriteConfig::for_level(OptLevel::O1)).unwrap();
        let c1 = s1.target_cost(&t1);

        let mut s2 = kernel();
        let t2 = s2.targets[0].clone();
        s2.optimize(&RewriteConfig::for_level(OptLevel::O2)).unwrap();
        let c2 = s2.target_cost(&t2);
        assert!(c2 <= c1, "O2 cost {} vs O1 cost {}", c2, c1);
    }

    #[test]
    fn test_optimize_emits_records() {
        let mut sess = kernel();
        sess.optimize(&RewriteConfig::for_level(OptLevel::O2)).unwrap();
        assert!(!sess.log.records.is_empty());
        let report = sess.log.format_report();
        assert!(report.contains("A[i][j]"));
    }

    #[test]
    fn test_levels_parse() {
        assert_eq!(OptLevel::from_u8(0), Some(OptLevel::O0));
        assert_eq!(OptLevel::from_u8(4), Some(OptLevel::O4));
        assert_eq!(OptLevel::from_u8(5), None);
        assert_eq!(OptLevel::O3.as_u8(), 3);
    }
}
