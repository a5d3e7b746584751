//! Hoistable-subexpression extraction.
//!
//! A post-order classification of the target's right-hand side. Every
//! subtree is labelled `Ext` (could still grow into a larger hoistable
//! expression) or `Stop` (a hoisting boundary was emitted at or below
//! this node). Extraction happens at the boundaries where two sides
//! with conflicting loop dependencies meet.

use indexmap::IndexMap;

use crate::analysis::OccurrenceDeps;
use crate::ast::{navigate, Ast, Node, NodeId};
use crate::meta::MetaExpr;

/// What subexpressions a hoisting round may lift.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HoistMode {
    /// Subexpressions depending on at most one loop.
    Normal,
    /// Any dependency arity; N-dimensional temporaries permitted.
    Aggressive,
    /// Only subexpressions constant in every loop.
    OnlyConst,
    /// Only subexpressions depending on at least one domain loop.
    OnlyDomain,
    /// Only subexpressions independent of the domain loops.
    OnlyOutdomain,
}

impl HoistMode {
    pub fn as_str(self) -> &'static str {
        match self {
            HoistMode::Normal => "normal",
            HoistMode::Aggressive => "aggressive",
            HoistMode::OnlyConst => "only_const",
            HoistMode::OnlyDomain => "only_domain",
            HoistMode::OnlyOutdomain => "only_outdomain",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Ext,
    Stop,
}

/// Hoistable groups keyed by their ordered dependency tuple.
pub type Extracted = IndexMap<Vec<String>, Vec<NodeId>>;

pub(crate) struct Extractor<'a> {
    ast: &'a Ast,
    mode: HoistMode,
    look_ahead: bool,
    lda: &'a OccurrenceDeps,
    dims: Vec<String>,
    domain: Vec<String>,
    out_domain: Vec<String>,
    extracted: Extracted,
}

impl<'a> Extractor<'a> {
    pub fn run(
        ast: &'a Ast,
        info: &MetaExpr,
        mode: HoistMode,
        look_ahead: bool,
        lda: &'a OccurrenceDeps,
        rhs: NodeId,
    ) -> Extracted {
        let dims = info.dims(ast);
        let mut ex = Extractor {
            ast,
            mode,
            look_ahead,
            lda,
            domain: info.domain_dims().to_vec(),
            out_domain: info.out_domain_dims(ast),
            dims,
            extracted: IndexMap::new(),
        };
        ex.classify(rhs);
        ex.ordered()
    }

    /// Keys sorted by the nest position of their first dimension,
    /// constants first; values keep discovery order.
    fn ordered(mut self) -> Extracted {
        let dims = std::mem::take(&mut self.dims);
        let pos = |dep: &Vec<String>| {
            dep.first()
                .and_then(|d| dims.iter().position(|x| x == d))
                .map(|p| p + 1)
                .unwrap_or(0)
        };
        self.extracted.sort_by(|k1, _, k2, _| pos(k1).cmp(&pos(k2)));
        self.extracted
    }

    fn nest_order(&self, mut dep: Vec<String>) -> Vec<String> {
        dep.sort_by_key(|d| self.dims.iter().position(|x| x == d).unwrap_or(usize::MAX));
        dep.dedup();
        dep
    }

    fn union(&self, a: &[String], b: &[String]) -> Vec<String> {
        let mut out: Vec<String> = a.to_vec();
        out.extend(b.iter().cloned());
        self.nest_order(out)
    }

    fn classify(&mut self, id: NodeId) -> (Vec<String>, Kind) {
        match self.ast.node(id) {
            Node::Symbol(_) => {
                let dep = self
                    .lda
                    .get(&id)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|d| self.dims.contains(d))
                    .collect();
                (self.nest_order(dep), Kind::Ext)
            }
            Node::Par(c) | Node::Neg(c) => self.classify(*c),
            Node::FunCall { args, .. } => {
                let args = args.clone();
                self.classify_call(&args)
            }
            Node::Ternary {
                cond,
                then_val,
                else_val,
            } => {
                let children = vec![*cond, *then_val, *else_val];
                self.classify_call(&children)
            }
            Node::Bin { lhs, rhs, .. } => {
                let (l, r) = (*lhs, *rhs);
                let (dep_l, info_l) = self.classify(l);
                let (dep_r, info_r) = self.classify(r);
                let dep_n = self.union(&dep_l, &dep_r);
                self.combine(l, r, dep_l, dep_r, dep_n, info_l, info_r)
            }
            // Opaque constructs: left alone, never hoisted.
            _ => (Vec::new(), Kind::Stop),
        }
    }

    /// Calls and ternaries are hoistable only as a whole: `Ext` iff
    /// every child is `Ext`.
    fn classify_call(&mut self, children: &[NodeId]) -> (Vec<String>, Kind) {
        let mut dep = Vec::new();
        let mut kind = Kind::Ext;
        for c in children {
            let (d, k) = self.classify(*c);
            dep = self.union(&dep, &d);
            if k == Kind::Stop {
                kind = Kind::Stop;
            }
        }
        (dep, kind)
    }

    fn combine(
        &mut self,
        l: NodeId,
        r: NodeId,
        dep_l: Vec<String>,
        dep_r: Vec<String>,
        dep_n: Vec<String>,
        info_l: Kind,
        info_r: Kind,
    ) -> (Vec<String>, Kind) {
        match (info_l, info_r) {
            (Kind::Ext, Kind::Ext) => {
                if dep_l == dep_r {
                    return (dep_l, Kind::Ext);
                }
                if dep_l.is_empty() || dep_r.is_empty() {
                    return self.combine_const(l, r, dep_l, dep_r, dep_n);
                }
                let l_sub = is_subset(&dep_l, &dep_r);
                let r_sub = is_subset(&dep_r, &dep_l);
                if l_sub || r_sub {
                    // One dependency set contains the other: try to
                    // extract one side, preferring the subtree that
                    // carries more work.
                    let (rich, rich_dep, poor, poor_dep) = if l_sub {
                        (r, dep_r, l, dep_l)
                    } else {
                        (l, dep_l, r, dep_r)
                    };
                    let poor_bigger = navigate::count_nodes(self.ast, poor)
                        > navigate::count_nodes(self.ast, rich);
                    let (cand, cand_dep) = if poor_bigger {
                        (poor, poor_dep)
                    } else {
                        (rich, rich_dep)
                    };
                    if !self.try_extract(cand, &cand_dep) {
                        return (dep_n, Kind::Ext);
                    }
                    (dep_n, Kind::Stop)
                } else {
                    // Disjoint non-empty dependencies
                    if self.mode == HoistMode::Aggressive {
                        // Still hoistable wholesale, as an N-D temporary
                        return (dep_n, Kind::Ext);
                    }
                    self.try_extract(l, &dep_l);
                    self.try_extract(r, &dep_r);
                    (dep_n, Kind::Stop)
                }
            }
            (Kind::Ext, Kind::Stop) => {
                self.try_extract(l, &dep_l);
                (dep_n, Kind::Stop)
            }
            (Kind::Stop, Kind::Ext) => {
                self.try_extract(r, &dep_r);
                (dep_n, Kind::Stop)
            }
            (Kind::Stop, Kind::Stop) => (dep_n, Kind::Stop),
        }
    }

    /// One side is loop-constant, the other is not.
    fn combine_const(
        &mut self,
        l: NodeId,
        r: NodeId,
        dep_l: Vec<String>,
        dep_r: Vec<String>,
        dep_n: Vec<String>,
    ) -> (Vec<String>, Kind) {
        let (konst, other, dep_other) = if dep_l.is_empty() {
            (l, r, dep_r)
        } else {
            (r, l, dep_l)
        };
        match self.mode {
            HoistMode::Normal | HoistMode::OnlyConst | HoistMode::OnlyOutdomain => {
                // When the loop-dependent side stays clear of the
                // domain loops, the constant folds into the growing
                // invariant chunk. Otherwise try the constant side,
                // then the other; failing both, keep growing.
                let domain_touches = dep_other.iter().any(|d| self.domain.contains(d));
                if !domain_touches {
                    return (dep_n, Kind::Ext);
                }
                if self.try_extract(konst, &[]) || self.try_extract(other, &dep_other) {
                    (dep_n, Kind::Stop)
                } else {
                    (dep_n, Kind::Ext)
                }
            }
            HoistMode::Aggressive => {
                self.try_extract(other, &dep_other);
                (dep_n, Kind::Stop)
            }
            HoistMode::OnlyDomain => {
                let took = self.try_extract(konst, &[]) || self.try_extract(other, &dep_other);
                if took {
                    (dep_n, Kind::Stop)
                } else {
                    (dep_n, Kind::Ext)
                }
            }
        }
    }

    /// Record `id` as hoistable with dependency `dep` when the mode
    /// admits it. Bare symbols are never extracted.
    fn try_extract(&mut self, id: NodeId, dep: &[String]) -> bool {
        if matches!(self.ast.node(id), Node::Symbol(_)) {
            return false;
        }
        let should = match self.mode {
            HoistMode::Normal => dep.len() <= 1,
            HoistMode::Aggressive => true,
            HoistMode::OnlyConst => dep.is_empty(),
            HoistMode::OnlyDomain => dep.iter().any(|d| self.domain.contains(d)),
            HoistMode::OnlyOutdomain => dep.iter().all(|d| self.out_domain.contains(d)),
        };
        if should || self.look_ahead {
            self.extracted
                .entry(dep.to_vec())
                .or_default()
                .push(id);
        }
        should
    }
}

fn is_subset(a: &[String], b: &[String]) -> bool {
    a.iter().all(|x| b.contains(x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::lda_by_occurrence;
    use crate::ast::{Ast, Extent, ScalarType, WriteOp};

    /// for i { for j { A[i][j] += <rhs>; } }, domain (i, j)
    fn harness(build: impl FnOnce(&mut Ast) -> NodeId) -> (Ast, MetaExpr, NodeId, NodeId) {
        let mut ast = Ast::new();
        let rhs = build(&mut ast);
        let lhs = ast.var("A", &["i", "j"]);
        let w = ast.writer(WriteOp::Incr, lhs, rhs);
        let jb = ast.block(vec![w]);
        let fj = ast.for_loop("j", Extent::Const(3), jb);
        let ib = ast.block(vec![fj]);
        let fi = ast.for_loop("i", Extent::Const(3), ib);
        let root = ast.root(vec![fi]);
        let info = MetaExpr::new(
            ScalarType::Double,
            vec![(fi, root), (fj, ib)],
            vec!["i".into(), "j".into()],
        );
        (ast, info, root, rhs)
    }

    #[test]
    fn test_invariant_product_extracted() {
        // X[i]*c against Y[j]: disjoint deps, both sides offered
        let (ast, info, root, rhs) = harness(|ast| {
            let x = ast.var("X", &["i"]);
            let c = ast.var("c", &[]);
            let p = ast.prod(x, c);
            let y = ast.var("Y", &["j"]);
            ast.prod(p, y)
        });
        let lda = lda_by_occurrence(&ast, root);
        let got = Extractor::run(&ast, &info, HoistMode::Normal, false, &lda, rhs);
        assert_eq!(got.len(), 1);
        let (dep, exprs) = got.first().unwrap();
        assert_eq!(dep, &vec!["i".to_string()]);
        assert_eq!(exprs.len(), 1);
        assert_eq!(ast.repr(exprs[0]), "X[i] * c");
    }

    #[test]
    fn test_bare_symbols_never_extracted() {
        let (ast, info, root, rhs) = harness(|ast| {
            let x = ast.var("X", &["i"]);
            let y = ast.var("Y", &["j"]);
            ast.prod(x, y)
        });
        let lda = lda_by_occurrence(&ast, root);
        let got = Extractor::run(&ast, &info, HoistMode::Normal, false, &lda, rhs);
        assert!(got.is_empty());
    }

    #[test]
    fn test_normal_rejects_two_dim_subtrees() {
        // (X[i] + Z[i][j]) * Y[j]: union {i,j} exceeds normal's arity
        let (ast, info, root, rhs) = harness(|ast| {
            let x = ast.var("X", &["i"]);
            let z = ast.var("Z", &["i", "j"]);
            let s = ast.sum(x, z);
            let y = ast.var("Y", &["j"]);
            ast.prod(s, y)
        });
        let lda = lda_by_occurrence(&ast, root);
        let got = Extractor::run(&ast, &info, HoistMode::Normal, false, &lda, rhs);
        assert!(got.is_empty());
    }

    #[test]
    fn test_aggressive_accepts_two_dim_subtrees() {
        let (ast, info, root, rhs) = harness(|ast| {
            let x = ast.var("X", &["i"]);
            let z = ast.var("Z", &["i", "j"]);
            let s = ast.sum(x, z);
            let y = ast.var("Y", &["j"]);
            ast.prod(s, y)
        });
        let lda = lda_by_occurrence(&ast, root);
        let got = Extractor::run(&ast, &info, HoistMode::Aggressive, false, &lda, rhs);
        assert_eq!(got.len(), 1);
        let (dep, exprs) = got.first().unwrap();
        assert_eq!(dep, &vec!["i".to_string(), "j".to_string()]);
        assert_eq!(ast.repr(exprs[0]), "X[i] + Z[i][j]");
    }

    #[test]
    fn test_only_const_extracts_constant_product() {
        // ((a*b) * X[i]) * Y[j]: a*b is the only admissible candidate
        let (ast, info, root, rhs) = harness(|ast| {
            let a = ast.var("a", &[]);
            let b = ast.var("b", &[]);
            let p = ast.prod(a, b);
            let x = ast.var("X", &["i"]);
            let y = ast.var("Y", &["j"]);
            let q = ast.prod(p, x);
            ast.prod(q, y)
        });
        let lda = lda_by_occurrence(&ast, root);
        let got = Extractor::run(&ast, &info, HoistMode::OnlyConst, false, &lda, rhs);
        assert_eq!(got.len(), 1);
        let (dep, exprs) = got.first().unwrap();
        assert!(dep.is_empty());
        assert_eq!(ast.repr(exprs[0]), "a * b");
    }

    #[test]
    fn test_look_ahead_projects_without_requiring_mode() {
        let (ast, info, root, rhs) = harness(|ast| {
            let x = ast.var("X", &["i"]);
            let z = ast.var("Z", &["i", "j"]);
            let s = ast.sum(x, z);
            let y = ast.var("Y", &["j"]);
            ast.prod(s, y)
        });
        let lda = lda_by_occurrence(&ast, root);
        let got = Extractor::run(&ast, &info, HoistMode::Normal, true, &lda, rhs);
        // Look-ahead records the rejected candidate as well
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn test_key_ordering_constants_first() {
        // c*d conflicts with X[i]; X[i]*e conflicts with Y[j]
        let (ast, info, root, rhs) = harness(|ast| {
            let c = ast.var("c", &[]);
            let d = ast.var("d", &[]);
            let cd = ast.prod(c, d);
            let x = ast.var("X", &["i"]);
            let e = ast.var("e", &[]);
            let xe = ast.prod(x, e);
            let y = ast.var("Y", &["j"]);
            let yj = ast.prod(xe, y);
            let par = ast.par(yj);
            ast.prod(cd, par)
        });
        let lda = lda_by_occurrence(&ast, root);
        let got = Extractor::run(&ast, &info, HoistMode::Normal, false, &lda, rhs);
        let keys: Vec<&Vec<String>> = got.keys().collect();
        assert!(keys.len() >= 2);
        assert!(keys[0].is_empty(), "constant group must sort first: {:?}", keys);
        assert_eq!(keys[1], &vec!["i".to_string()]);
    }
}
