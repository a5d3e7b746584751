//! Generalized loop-invariant code motion.
//!
//! Repeats {extract; hoist} until the extractor finds nothing new.
//! Hoisted groups are placed as far out in the nest as their
//! dependency tuple allows while keeping temporary storage small,
//! wrapped in synthesized copies of the loops they still vary along,
//! and substituted back into the target's right-hand side.

use indexmap::{IndexMap, IndexSet};

use crate::analysis::hoisted::HoistedInfo;
use crate::analysis::OccurrenceDeps;
use crate::ast::{navigate, Node, NodeId, Symbol, WriteOp};
use crate::error::{Result, RewriteError};
use crate::meta::MetaExpr;
use crate::rewrite::extract::{Extractor, HoistMode};
use crate::session::Session;

/// Knobs of a `licm` invocation.
#[derive(Clone, Debug)]
pub struct LicmOptions {
    /// Repeat {extract; hoist} to a fixed point.
    pub iterative: bool,
    /// Skip groups where hoisting would destroy factorization
    /// opportunities across subexpressions sharing the same symbols.
    pub max_sharing: bool,
    /// Reuse a previously hoisted temporary whose defining expression
    /// is textually identical.
    pub global_cse: bool,
}

impl Default for LicmOptions {
    fn default() -> Self {
        LicmOptions {
            iterative: true,
            max_sharing: false,
            global_cse: false,
        }
    }
}

/// Where one hoisted group goes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Placement {
    place: NodeId,
    anchor: Option<NodeId>,
    /// Loop templates to copy around the group, outermost first.
    wrap: Vec<NodeId>,
}

#[derive(Default)]
struct Pending {
    decls: Vec<NodeId>,
    stmts: Vec<NodeId>,
    names: Vec<String>,
}

pub(crate) struct Hoister<'s> {
    pub sess: &'s mut Session,
    pub stmt: NodeId,
    pub info: &'s MetaExpr,
    pub expr_id: u32,
    round: u32,
}

impl<'s> Hoister<'s> {
    pub fn new(sess: &'s mut Session, stmt: NodeId, info: &'s MetaExpr, expr_id: u32) -> Self {
        Hoister {
            sess,
            stmt,
            info,
            expr_id,
            round: 0,
        }
    }

    /// Rounds continue across invocations on the same target so that
    /// synthesized names never collide.
    pub fn set_round(&mut self, round: u32) {
        self.round = round;
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Look-ahead projection: classify without mutating.
    pub fn extract(&mut self, mode: HoistMode, lda: &OccurrenceDeps) -> super::extract::Extracted {
        let rhs = self.sess.ast.writer_rhs(self.stmt);
        Extractor::run(&self.sess.ast, self.info, mode, true, lda, rhs)
    }

    pub fn licm(&mut self, mode: HoistMode, opts: &LicmOptions) -> Result<()> {
        let mut lda = crate::analysis::lda_by_occurrence(&self.sess.ast, self.sess.root);
        let mut mapper: IndexMap<Placement, Pending> = IndexMap::new();

        loop {
            self.round += 1;
            let rhs = self.sess.ast.writer_rhs(self.stmt);
            let extracted = Extractor::run(&self.sess.ast, self.info, mode, false, &lda, rhs);
            if extracted.is_empty() {
                break;
            }
            let mut progressed = false;
            for (dep, subexprs) in extracted {
                let subexprs = self.filter(&dep, subexprs, opts, &lda);
                if subexprs.is_empty() {
                    continue;
                }
                self.check_typeable(&subexprs)?;
                let placement = self.placement(mode, &dep, &subexprs);
                progressed |=
                    self.synthesize(&dep, &subexprs, &placement, opts, &mut lda, &mut mapper);
            }
            if !progressed || !opts.iterative {
                break;
            }
        }

        self.insert_pending(mapper);
        Ok(())
    }

    /// Textual uniquification plus the max-sharing partition filter.
    fn filter(
        &self,
        dep: &[String],
        subexprs: Vec<NodeId>,
        opts: &LicmOptions,
        lda: &OccurrenceDeps,
    ) -> Vec<NodeId> {
        let ast = &self.sess.ast;
        let mut seen = IndexSet::new();
        let mut unique = Vec::new();
        for e in subexprs {
            if seen.insert(ast.repr(e)) {
                unique.push(e);
            }
        }

        if opts.max_sharing {
            if dep == self.info.dims(ast).as_slice() {
                return Vec::new();
            }
            // Names whose occurrences carry exactly this dependency
            let mut sharing: IndexSet<String> = IndexSet::new();
            for (occ, d) in lda.iter() {
                if d.as_slice() == dep {
                    if let Some(name) = ast.as_symbol(*occ).and_then(|s| s.name()) {
                        sharing.insert(name.to_string());
                    }
                }
            }
            let mut partitions: IndexMap<Vec<String>, Vec<NodeId>> = IndexMap::new();
            for e in &unique {
                let mut key: Vec<String> = navigate::symbol_names_in(ast, *e)
                    .into_iter()
                    .filter(|n| sharing.contains(n))
                    .collect();
                key.sort();
                partitions.entry(key).or_default().push(*e);
            }
            for (shared, partition) in partitions {
                if partition.len() > shared.len() {
                    unique.retain(|e| !partition.contains(e));
                }
            }
        }
        unique
    }

    /// Fatal if a subexpression references an undeclared, unhoisted
    /// symbol: its temporary's type cannot be inferred.
    fn check_typeable(&self, subexprs: &[NodeId]) -> Result<()> {
        let ast = &self.sess.ast;
        for e in subexprs {
            for name in navigate::symbol_names_in(ast, *e) {
                if !self.sess.decls.contains_key(&name) && !self.sess.hoisted.contains(&name) {
                    return Err(RewriteError::untyped(format!(
                        "cannot infer the type of hoisted expression through `{}`",
                        name
                    ))
                    .with_context(ast.repr(*e)));
                }
            }
        }
        Ok(())
    }

    /// The six-case placement policy.
    fn placement(&self, mode: HoistMode, dep: &[String], subexprs: &[NodeId]) -> Placement {
        let ast = &self.sess.ast;
        let dims_loops = self.info.loops_from_dims(ast);
        let all_dims: Vec<String> = dims_loops.keys().cloned().collect();
        let outermost = self.info.outermost_loop();
        let header = self
            .info
            .outermost_parent()
            .unwrap_or(self.sess.root);

        let next_after = |d: &str| -> Option<NodeId> {
            self.info
                .next_loop_after(ast, d)
                .or(Some(self.stmt))
        };

        match dep.len() {
            0 => Placement {
                place: header,
                anchor: outermost,
                wrap: Vec::new(),
            },
            1 => {
                let d = &dep[0];
                let d_loop = dims_loops[d.as_str()];
                if outermost.is_some_and(|l| navigate::is_perfect_loop(ast, l)) {
                    Placement {
                        place: header,
                        anchor: outermost,
                        wrap: vec![d_loop],
                    }
                } else if dims_loops.len() > 1 {
                    Placement {
                        place: ast.loop_body(d_loop),
                        anchor: next_after(d),
                        wrap: Vec::new(),
                    }
                } else {
                    Placement {
                        place: ast.loop_body(d_loop),
                        anchor: Some(self.stmt),
                        wrap: Vec::new(),
                    }
                }
            }
            _ => {
                let covers_nest = dep.len() == all_dims.len()
                    && dep.iter().all(|d| all_dims.contains(d));
                let none_written = subexprs.iter().all(|e| {
                    navigate::symbol_names_in(ast, *e)
                        .iter()
                        .all(|n| !self.sess.graph.is_written(n))
                });
                let last_loop = dims_loops[dep.last().unwrap().as_str()];
                if mode == HoistMode::Aggressive && covers_nest && none_written {
                    Placement {
                        place: header,
                        anchor: outermost,
                        wrap: dims_loops.values().copied().collect(),
                    }
                } else if !navigate::is_perfect_loop(ast, last_loop) {
                    Placement {
                        place: ast.loop_body(last_loop),
                        anchor: next_after(dep.last().unwrap()),
                        wrap: Vec::new(),
                    }
                } else {
                    let first_loop = dims_loops[dep[0].as_str()];
                    Placement {
                        place: ast.loop_body(first_loop),
                        anchor: next_after(&dep[0]),
                        wrap: dep[1..]
                            .iter()
                            .map(|d| dims_loops[d.as_str()])
                            .collect(),
                    }
                }
            }
        }
    }

    /// Create temporaries for one group and substitute them into the
    /// target. Returns true if any substitution happened.
    fn synthesize(
        &mut self,
        dep: &[String],
        subexprs: &[NodeId],
        placement: &Placement,
        opts: &LicmOptions,
        lda: &mut OccurrenceDeps,
        mapper: &mut IndexMap<Placement, Pending>,
    ) -> bool {
        let wrap_dims: Vec<String> = placement
            .wrap
            .iter()
            .map(|l| self.sess.ast.loop_dim(*l).to_string())
            .collect();
        let wrap_sizes: Vec<_> = placement
            .wrap
            .iter()
            .map(|l| self.sess.ast.loop_extent(*l).clone())
            .collect();

        let mut progressed = false;
        for (i, e) in subexprs.iter().enumerate() {
            let e_repr = self.sess.ast.repr(*e);
            let reused = opts
                .global_cse
                .then(|| self.sess.hoisted.symbol_for_expr(&e_repr))
                .flatten()
                .map(|s| s.to_string());

            let (name, fresh) = match reused {
                Some(name) => (name, false),
                None => {
                    let dep_tag = if dep.is_empty() {
                        "c".to_string()
                    } else {
                        dep.join("_")
                    };
                    (
                        format!("{}_{}_{}_{}", dep_tag, self.expr_id, self.round, i),
                        true,
                    )
                }
            };

            let dims_ref: Vec<&str> = wrap_dims.iter().map(|d| d.as_str()).collect();
            let template = self
                .sess
                .ast
                .symbol(Symbol::var(&name, &dims_ref));
            let inserted = self.sess.ast.replace_matching(self.stmt, *e, template);
            if inserted.is_empty() {
                continue;
            }
            progressed = true;
            for occ in &inserted {
                lda.insert(*occ, dep.to_vec());
            }

            if fresh {
                let rhs_copy = self.sess.ast.clone_subtree(*e);
                let lhs = self.sess.ast.symbol(Symbol::var(&name, &dims_ref));
                let assign = self.sess.ast.writer(WriteOp::Assign, lhs, rhs_copy);
                let decl = self
                    .sess
                    .ast
                    .decl(self.info.ty, &name, wrap_sizes.clone());
                self.sess.decls.insert(name.clone(), decl);

                self.sess.graph.add_dependency(&self.sess.ast, &name, rhs_copy);
                if inserted.len() > 1 {
                    self.sess.graph.add_self_edge(&name);
                }

                let pending = mapper.entry(placement.clone()).or_default();
                pending.decls.push(decl);
                pending.stmts.push(assign);
                pending.names.push(name);
            } else if inserted.len() > 1 {
                self.sess.graph.add_self_edge(&name);
            }
        }
        progressed
    }

    /// Build wrap loops and insert every pending group at its anchor.
    fn insert_pending(&mut self, mapper: IndexMap<Placement, Pending>) {
        for (placement, pending) in mapper {
            let Pending {
                decls,
                stmts,
                names,
            } = pending;
            let (wrap_loop, mut code) = if placement.wrap.is_empty() {
                let mut code = decls.clone();
                code.extend(stmts.iter().copied());
                (None, code)
            } else {
                let innermost_template = *placement.wrap.last().unwrap();
                let mut looped = self
                    .sess
                    .ast
                    .wrap_in_loop(innermost_template, stmts.clone());
                for template in placement.wrap[..placement.wrap.len() - 1].iter().rev() {
                    looped = self.sess.ast.wrap_in_loop(*template, vec![looped]);
                }
                let mut code = decls.clone();
                code.push(looped);
                (Some(looped), code)
            };

            let children = self.sess.ast.block_children(placement.place);
            let at = placement
                .anchor
                .and_then(|a| children.iter().position(|c| *c == a))
                .or_else(|| {
                    children
                        .iter()
                        .position(|c| matches!(self.sess.ast.node(*c), Node::For { .. }))
                })
                .unwrap_or(0);
            let target = self.sess.ast.block_children_mut(placement.place);
            target.splice(at..at, code.drain(..));

            for ((name, stmt), decl) in names.iter().zip(stmts.iter()).zip(decls.iter()) {
                let rhs = self.sess.ast.writer_rhs(*stmt);
                let repr = self.sess.ast.repr(rhs);
                self.sess.hoisted.insert(
                    name,
                    HoistedInfo {
                        stmt: *stmt,
                        decl: *decl,
                        wrap_loop,
                        place: placement.place,
                    },
                    Some(repr),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Ast, Extent};
    use crate::session::Session;

    /// A[i][j] += X[i] * Y[j] * C within perfect loops i, j.
    fn session_scenario_basic() -> Session {
        let mut ast = Ast::new();
        let da = ast.decl(
            crate::ast::ScalarType::Double,
            "A",
            vec![Extent::Const(3), Extent::Const(3)],
        );
        let dx = ast.decl(crate::ast::ScalarType::Double, "X", vec![Extent::Const(3)]);
        let dy = ast.decl(crate::ast::ScalarType::Double, "Y", vec![Extent::Const(3)]);
        let dc = ast.decl(crate::ast::ScalarType::Double, "C", vec![]);
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
    fn test_basic_licm_hoists_invariant_product() {
        let mut sess = session_scenario_basic();
        let target = sess.targets[0].clone();
        let mut rw = crate::rewrite::Rewriter::new(&mut sess, target.stmt, target.info);
        rw.licm(HoistMode::Normal, &LicmOptions::default()).unwrap();

        assert_eq!(sess.hoisted.len(), 1);
        let (name, info) = sess.hoisted.iter().next().unwrap();
        assert!(name.starts_with("i_"), "dep-tagged name, got {}", name);
        assert!(info.wrap_loop.is_some());
        let def = sess.ast.repr(info.stmt);
        assert!(
            def.contains("= C * X[i];"),
            "hoisted definition, got {}",
            def
        );
        let rhs = sess.ast.writer_rhs(target.stmt);
        let rhs_repr = sess.ast.repr(rhs);
        assert!(
            rhs_repr.contains(name.as_str()) && rhs_repr.contains("Y[j]"),
            "substituted rhs, got {}",
            rhs_repr
        );
    }

    #[test]
    fn test_licm_is_idempotent() {
        let mut sess = session_scenario_basic();
        let target = sess.targets[0].clone();
        {
            let mut rw = crate::rewrite::Rewriter::new(&mut sess, target.stmt, target.info.clone());
            rw.licm(HoistMode::Normal, &LicmOptions::default()).unwrap();
        }
        let after_first = sess.ast.pretty(sess.root);
        let hoisted_count = sess.hoisted.len();
        {
            let mut rw = crate::rewrite::Rewriter::new(&mut sess, target.stmt, target.info);
            rw.licm(HoistMode::Normal, &LicmOptions::default()).unwrap();
        }
        assert_eq!(sess.hoisted.len(), hoisted_count);
        assert_eq!(sess.ast.pretty(sess.root), after_first);
    }

    #[test]
    fn test_hoisted_placement_outside_nest() {
        let mut sess = session_scenario_basic();
        let target = sess.targets[0].clone();
        let root = sess.root;
        let mut rw = crate::rewrite::Rewriter::new(&mut sess, target.stmt, target.info);
        rw.licm(HoistMode::Normal, &LicmOptions::default()).unwrap();
        // The wrap loop sits in the header, before the i loop
        let (_, info) = sess.hoisted.iter().next().unwrap();
        assert_eq!(info.place, root);
        let children = sess.ast.block_children(root);
        let wrap_pos = children
            .iter()
            .position(|c| Some(*c) == info.wrap_loop)
            .expect("wrap loop in header");
        let nest_pos = children
            .iter()
            .position(|c| {
                matches!(sess.ast.node(*c), Node::For { .. }) && Some(*c) != info.wrap_loop
            })
            .expect("original nest still in header");
        assert!(wrap_pos < nest_pos);
    }

    #[test]
    fn test_flop_count_drops() {
        let mut sess = session_scenario_basic();
        let target = sess.targets[0].clone();
        let nest = target.info.loops();
        let before = crate::cost::weighted_flops(&sess.ast, target.stmt, &nest);
        let mut rw = crate::rewrite::Rewriter::new(&mut sess, target.stmt, target.info.clone());
        rw.licm(HoistMode::Normal, &LicmOptions::default()).unwrap();
        // 2*|i|*|j| = 18 before; |i| + |i|*|j| = 12 after
        assert_eq!(before, 18);
        let (_, hinfo) = sess.hoisted.iter().next().unwrap();
        let hoist_cost =
            crate::cost::weighted_flops(&sess.ast, hinfo.stmt, &[hinfo.wrap_loop.unwrap()]);
        let after = crate::cost::weighted_flops(&sess.ast, target.stmt, &nest) + hoist_cost;
        assert_eq!(after, 12);
        assert!(after < before);
    }
}
