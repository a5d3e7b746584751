//! Algebraic expansion: distribute products over sums.
//!
//! Post-order over the right-hand side. Each subtree is labelled
//! `Expand` (a list of leaves the enclosing product may distribute
//! over) or `Group` (an opaque factor). When a product pairs an
//! `Expand` side with a `Group` side, the group factor is multiplied
//! into every leaf. Where a leaf is a previously hoisted temporary,
//! the factor is folded into the temporary's defining statement
//! instead, so no new multiplication survives in the inner loop.

use std::collections::HashMap;

use crate::analysis::hoisted::HoistedInfo;
use crate::ast::{navigate, Ast, BinOp, Node, NodeId, Symbol, WriteOp};
use crate::meta::MetaExpr;
use crate::session::Session;

/// Predicate deciding which symbol occurrences trigger distribution.
pub type SymbolPred<'p> = &'p dyn Fn(&Symbol) -> bool;

#[derive(Clone, Copy, Debug, Default)]
pub struct ExpandOptions {
    /// Do not try to fold expanded factors into hoisted temporaries.
    pub not_aggregate: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Expand,
    Group,
}

/// Deduplicates identical aggregations within a pass, keyed by the
/// textual forms of the expanded symbol and the grouped factor.
#[derive(Default)]
struct Cache {
    map: HashMap<(String, String), String>,
    hits: HashMap<(String, String), u32>,
}

impl Cache {
    fn retrieve(&mut self, key: &(String, String)) -> Option<String> {
        let found = self.map.get(key).cloned();
        if found.is_some() {
            *self.hits.entry(key.clone()).or_insert(0) += 1;
        }
        found
    }

    /// Drop every entry resolving to `name`; true if any dropped entry
    /// had been served from the cache.
    fn invalidate(&mut self, name: &str) -> bool {
        let stale: Vec<(String, String)> = self
            .map
            .iter()
            .filter(|(_, v)| v.as_str() == name)
            .map(|(k, _)| k.clone())
            .collect();
        let mut was_hit = false;
        for k in stale {
            self.map.remove(&k);
            if self.hits.get(&k).copied().unwrap_or(0) > 0 {
                was_hit = true;
            }
        }
        was_hit
    }

    fn add(&mut self, key: (String, String), name: String) {
        self.map.insert(key, name);
    }
}

pub(crate) struct Expander<'s> {
    pub sess: &'s mut Session,
    pub stmt: NodeId,
    pub info: &'s MetaExpr,
    pub handler_id: u32,
    expansions: Vec<NodeId>,
    cache: Cache,
    exp_count: usize,
}

impl<'s> Expander<'s> {
    pub fn new(sess: &'s mut Session, stmt: NodeId, info: &'s MetaExpr, handler_id: u32) -> Self {
        Expander {
            sess,
            stmt,
            info,
            handler_id,
            expansions: Vec::new(),
            cache: Cache::default(),
            exp_count: 0,
        }
    }

    pub fn expand(&mut self, should_expand: SymbolPred, opts: ExpandOptions) {
        self.expansions.clear();
        let rhs = self.sess.ast.writer_rhs(self.stmt);
        self.expand_node(rhs, self.stmt, should_expand);
        if !opts.not_aggregate {
            for expansion in std::mem::take(&mut self.expansions) {
                self.aggregate(expansion, should_expand);
            }
        }
    }

    fn expand_node(
        &mut self,
        id: NodeId,
        parent: NodeId,
        pred: SymbolPred,
    ) -> (Vec<NodeId>, Kind) {
        match self.sess.ast.node(id) {
            Node::Symbol(s) => {
                let kind = if pred(s) { Kind::Expand } else { Kind::Group };
                (vec![id], kind)
            }
            Node::Par(c) => {
                let c = *c;
                self.expand_node(c, id, pred)
            }
            Node::Bin {
                op: BinOp::Mul,
                lhs,
                rhs,
            } => {
                let (l, r) = (*lhs, *rhs);
                let (l_exps, l_kind) = self.expand_node(l, id, pred);
                let (r_exps, r_kind) = self.expand_node(r, id, pred);
                if l_kind == Kind::Group && r_kind == Kind::Group {
                    return (vec![id], Kind::Group);
                }
                // Children may have been rewritten during recursion
                let (l, r) = match self.sess.ast.node(id) {
                    Node::Bin { lhs, rhs, .. } => (*lhs, *rhs),
                    _ => unreachable!(),
                };
                let (grp, expandable, exps) = if l_kind == Kind::Group {
                    (l, r, r_exps)
                } else {
                    (r, l, l_exps)
                };
                self.expansions.retain(|e| *e != grp);
                let mut produced = Vec::new();
                for exp in exps {
                    let grp_copy = self.sess.ast.clone_subtree(grp);
                    let prod = self.sess.ast.prod(exp, grp_copy);
                    if expandable == exp {
                        // The whole expandable side is the leaf
                        self.sess.ast.replace_child(id, exp, prod);
                    } else {
                        self.sess.ast.replace_id(expandable, exp, prod);
                    }
                    self.expansions.push(prod);
                    produced.push(prod);
                }
                // The product node dissolves into its expanded side,
                // which substitution may just have rewritten
                let expanded_now = match self.sess.ast.node(id) {
                    Node::Bin { lhs, rhs, .. } => {
                        if l_kind == Kind::Group {
                            *rhs
                        } else {
                            *lhs
                        }
                    }
                    _ => unreachable!(),
                };
                self.sess.ast.replace_id(parent, id, expanded_now);
                (produced, Kind::Expand)
            }
            Node::Bin {
                op: BinOp::Add | BinOp::Sub,
                lhs,
                rhs,
            } => {
                let (l, r) = (*lhs, *rhs);
                let (l_exps, l_kind) = self.expand_node(l, id, pred);
                let (r_exps, r_kind) = self.expand_node(r, id, pred);
                if l_kind == Kind::Expand && r_kind == Kind::Expand {
                    let mut exps = l_exps;
                    exps.extend(r_exps);
                    (exps, Kind::Expand)
                } else {
                    (vec![id], Kind::Group)
                }
            }
            Node::Bin {
                op: BinOp::Div, ..
            }
            | Node::FunCall { .. }
            | Node::Ternary { .. }
            | Node::Neg(_) => {
                // Expand within, but the node itself is opaque
                for c in self.sess.ast.children(id) {
                    self.expand_node(c, id, pred);
                }
                (vec![id], Kind::Group)
            }
            _ => (vec![id], Kind::Group),
        }
    }

    /// Try to fold the grouped factor of `expansion` into the hoisted
    /// temporary it multiplies.
    fn aggregate(&mut self, expansion: NodeId, pred: SymbolPred) {
        let (exp_side, grp_side) = match self.sess.ast.node(expansion) {
            Node::Bin {
                op: BinOp::Mul,
                lhs,
                rhs,
            } => (*lhs, *rhs),
            _ => return,
        };

        // The expanded side must reference a hoisted temporary
        let Some(exp_sym) = navigate::symbols_in(&self.sess.ast, exp_side)
            .into_iter()
            .find(|s| {
                self.sess
                    .ast
                    .as_symbol(*s)
                    .is_some_and(|sym| {
                        sym.name()
                            .is_some_and(|n| self.sess.hoisted.contains(n))
                            && pred(sym)
                    })
            })
        else {
            return;
        };
        let exp_name = self
            .sess
            .ast
            .as_symbol(exp_sym)
            .and_then(|s| s.name())
            .expect("hoisted symbol has a name")
            .to_string();

        let key = (
            self.sess.ast.repr(exp_sym),
            self.sess.ast.repr(grp_side),
        );
        if let Some(cached) = self.cache.retrieve(&key) {
            self.redirect(expansion, exp_side, exp_sym, &cached);
            return;
        }

        let hinfo = *self.sess.hoisted.get(&exp_name).expect("registered temporary");

        // The grouped factor must not vary along any loop beyond the
        // temporary's own wrap dimensions
        let wrap_dims: Vec<String> = self
            .sess
            .ast
            .as_symbol(self.sess.ast.writer_lhs(hinfo.stmt))
            .map(|s| s.loop_dims().iter().map(|d| d.to_string()).collect())
            .unwrap_or_default();
        let lda = crate::analysis::lda_by_name(&self.sess.ast, self.sess.root);
        for name in navigate::symbol_names_in(&self.sess.ast, grp_side) {
            if let Some(deps) = lda.get(&name) {
                if deps.iter().any(|d| !wrap_dims.contains(d)) {
                    return;
                }
            }
        }

        if !self.sess.graph.is_read(&exp_name) && !self.cache.invalidate(&exp_name) {
            // Fold in place: t = f(...)  becomes  t = f(...) * grp
            let old_rhs = self.sess.ast.writer_rhs(hinfo.stmt);
            let grp_copy = self.sess.ast.clone_subtree(grp_side);
            let new_rhs = self.sess.ast.prod(old_rhs, grp_copy);
            self.sess.ast.set_writer_rhs(hinfo.stmt, new_rhs);
            self.sess
                .graph
                .add_dependency(&self.sess.ast, &exp_name, grp_copy);
            let repr = self.sess.ast.repr(new_rhs);
            self.sess.hoisted.refresh_expr(&exp_name, repr);
            self.redirect(expansion, exp_side, exp_sym, &exp_name);
            return;
        }

        // The temporary is read elsewhere: shadow it instead
        let new_name = format!("{}_EXP_{}_{}", exp_name, self.handler_id, self.exp_count);
        self.exp_count += 1;

        let exp_copy = self.sess.ast.clone_subtree(exp_sym);
        let grp_copy = self.sess.ast.clone_subtree(grp_side);
        let expr = self.sess.ast.prod(exp_copy, grp_copy);
        let rank_dims: Vec<String> = wrap_dims.clone();
        let dims_ref: Vec<&str> = rank_dims.iter().map(|d| d.as_str()).collect();
        let new_lhs = self.sess.ast.symbol(Symbol::var(&new_name, &dims_ref));
        let new_stmt = self.sess.ast.writer(WriteOp::Assign, new_lhs, expr);

        // Definition goes beside the original's
        if let Some(wl) = hinfo.wrap_loop {
            let body = self.sess.ast.loop_body(wl);
            self.sess.ast.block_children_mut(body).push(new_stmt);
        } else {
            let children = self.sess.ast.block_children_mut(hinfo.place);
            let at = children
                .iter()
                .position(|c| *c == hinfo.stmt)
                .map(|p| p + 1)
                .unwrap_or(children.len());
            children.insert(at, new_stmt);
        }

        let (decl_ty, decl_rank) = match self.sess.ast.node(hinfo.decl) {
            Node::Decl { ty, rank, .. } => (*ty, rank.clone()),
            _ => (self.info.ty, Vec::new()),
        };
        let new_decl = self.sess.ast.decl(decl_ty, &new_name, decl_rank);
        let children = self.sess.ast.block_children_mut(hinfo.place);
        let at = children
            .iter()
            .position(|c| *c == hinfo.decl)
            .map(|p| p + 1)
            .unwrap_or(0);
        children.insert(at, new_decl);
        self.sess.decls.insert(new_name.clone(), new_decl);

        let repr = self.sess.ast.repr(expr);
        self.sess.hoisted.insert(
            &new_name,
            HoistedInfo {
                stmt: new_stmt,
                decl: new_decl,
                wrap_loop: hinfo.wrap_loop,
                place: hinfo.place,
            },
            Some(repr),
        );
        self.sess
            .graph
            .add_dependency(&self.sess.ast, &new_name, expr);
        self.cache.add(key, new_name.clone());
        self.redirect(expansion, exp_side, exp_sym, &new_name);
    }

    /// Collapse the expansion to its expanded side, dropping the
    /// aggregated factor, and rename the temporary if aggregation
    /// created a shadow.
    fn redirect(&mut self, expansion: NodeId, exp_side: NodeId, exp_sym: NodeId, name: &str) {
        self.sess.ast.replace_id(self.stmt, expansion, exp_side);
        if let Some(sym) = self.sess.ast.as_symbol_mut(exp_sym) {
            if sym.name() != Some(name) {
                sym.atom = crate::ast::Atom::Var(name.to_string());
            }
        }
    }
}

/// The `standard` expansion/factorization dimension: the tuple of
/// domain dimensions occurring most often across the symbols of
/// `rhs`. Ties prefer the tuple carried by fewer distinct symbol
/// names (collection then coalesces more), then the lexicographically
/// smaller tuple. Falls back to out-of-domain dimensions when no
/// domain dimension occurs.
pub(crate) fn standard_dimension(
    ast: &Ast,
    info: &MetaExpr,
    rhs: NodeId,
) -> Option<Vec<String>> {
    let domain: Vec<String> = info.domain_dims().to_vec();
    let out_domain = info.out_domain_dims(ast);
    for dims in [domain, out_domain] {
        if dims.is_empty() {
            continue;
        }
        let mut counts: Vec<(Vec<String>, usize, Vec<String>)> = Vec::new();
        for s in navigate::symbols_in(ast, rhs) {
            let Some(sym) = ast.as_symbol(s) else { continue };
            let occ: Vec<String> = sym
                .loop_dims()
                .iter()
                .filter(|d| dims.iter().any(|x| x == *d))
                .map(|d| d.to_string())
                .collect();
            if occ.is_empty() {
                continue;
            }
            let name = sym.name().unwrap_or_default().to_string();
            match counts.iter_mut().find(|(k, _, _)| *k == occ) {
                Some((_, n, names)) => {
                    *n += 1;
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
                None => counts.push((occ, 1, vec![name])),
            }
        }
        if let Some(best) = counts.into_iter().max_by(|(ka, na, nma), (kb, nb, nmb)| {
            na.cmp(nb)
                .then_with(|| nmb.len().cmp(&nma.len()))
                .then_with(|| kb.cmp(ka))
        }) {
            return Some(best.0);
        }
    }
    None
}
