//! Cost-driven unpicking of common-subexpression chains.
//!
//! Surveys the linear loops in the header (typically the wrap loops
//! earlier hoisting produced), builds a per-loop trace of written
//! temporaries with their dependency level and estimated operation
//! count, then searches for the window of levels whose inlining plus
//! re-factorization minimizes the modelled cost. When a window wins
//! against keeping the chain, the temporaries are pushed into their
//! consumers, the consumers re-expanded and re-factorized, and common
//! subexpressions re-hoisted across them.

use indexmap::{IndexMap, IndexSet};

use crate::analysis::lda_by_name;
use crate::ast::{navigate, Ast, BinOp, Node, NodeId};
use crate::cost::{flops, Note, RecordSink};
use crate::error::Result;
use crate::meta::MetaExpr;
use crate::rewrite::expand::ExpandOptions;
use crate::rewrite::extract::HoistMode;
use crate::rewrite::hoist::LicmOptions;
use crate::session::Session;

/// One written (or read-only leaf) value in a loop's trace.
#[derive(Clone, Debug)]
struct Temporary {
    /// Writer statement, or the symbol occurrence for leaves.
    node: NodeId,
    level: i64,
    cost: u64,
    /// Per-read symbol repr, the multiplications it sits under.
    reads_costs: IndexMap<String, u64>,
    /// Left-hand sides that read this value.
    is_read: Vec<String>,
}

impl Temporary {
    fn leaf(node: NodeId) -> Self {
        Temporary {
            node,
            level: -1,
            cost: 0,
            reads_costs: IndexMap::new(),
            is_read: Vec::new(),
        }
    }

    fn key(&self, ast: &Ast) -> String {
        match ast.node(self.node) {
            Node::Writer { lhs, .. } => ast.repr(*lhs),
            _ => ast.repr(self.node),
        }
    }

    fn lhs(&self, ast: &Ast) -> Option<NodeId> {
        ast.writer_parts(self.node).map(|(_, lhs, _)| lhs)
    }

    fn rhs(&self, ast: &Ast) -> Option<NodeId> {
        ast.writer_parts(self.node).map(|(_, _, rhs)| rhs)
    }

    /// Reads surviving projection onto the outer loop.
    fn project(&self) -> u64 {
        self.reads_costs.len() as u64
    }
}

type Trace = IndexMap<String, Temporary>;

pub(crate) fn unpick(sess: &mut Session, stmt: NodeId, info: &MetaExpr) -> Result<()> {
    let lda = lda_by_name(&sess.ast, sess.root);
    let target_loops: IndexSet<NodeId> = info.loops().into_iter().collect();

    // Candidate loops: linear, not part of the target's own nest
    let loops = loops_with_stack(&sess.ast, sess.root);
    let mut candidates: Vec<(NodeId, Vec<(NodeId, NodeId)>)> = Vec::new();
    for (l, stack) in loops {
        if !sess.ast.loop_is_linear(l) || target_loops.contains(&l) {
            continue;
        }
        if sess.ast.loop_extent(l).as_const().is_none() {
            sess.log.note(Note {
                pass: "unpick".into(),
                message: format!(
                    "loop over `{}` has a symbolic trip count",
                    sess.ast.loop_dim(l)
                ),
            });
            continue;
        }
        candidates.push((l, stack));
    }

    let mut global_trace: Trace = IndexMap::new();
    let mut traces: Vec<(NodeId, Vec<(NodeId, NodeId)>, Trace)> = Vec::new();
    for (l, stack) in candidates {
        let trace = analyze_loop(&sess.ast, l, info, &lda, &global_trace);
        if !trace.is_empty() {
            for (k, v) in &trace {
                global_trace.insert(k.clone(), v.clone());
            }
            traces.push((l, stack, trace));
        }
    }

    for (l, stack, mut trace) in traces {
        let size = sess.ast.loop_extent(l).as_const().unwrap_or(1);
        let levels = group_by_level(&trace);
        let level_keys: Vec<i64> = levels.keys().copied().collect();
        let (Some(&min_level), Some(&max_level)) =
            (level_keys.iter().min(), level_keys.iter().max())
        else {
            continue;
        };
        if min_level == max_level {
            continue;
        }

        let baseline = cost_cse(&trace, &levels, size, min_level, max_level);
        let mut best = (min_level, min_level, u64::MAX);
        for lo in &level_keys {
            let local = cost_fact(&trace, &levels, size, *lo, max_level);
            if local.2 < best.2 {
                best = local;
            }
        }
        if best.2 >= baseline || best.1 <= best.0 {
            continue;
        }

        for level in (best.0 + 1)..=best.1 {
            push_temporaries(sess, l, &mut trace, level, &global_trace);
            transform_temporaries(sess, info, l, &stack, &trace, level)?;
        }
    }

    // A loop emptied by pushing disappears
    cleanup_empty_loops(sess);
    Ok(())
}

fn loops_with_stack(ast: &Ast, root: NodeId) -> Vec<(NodeId, Vec<(NodeId, NodeId)>)> {
    fn rec(
        ast: &Ast,
        id: NodeId,
        parent: NodeId,
        stack: &mut Vec<(NodeId, NodeId)>,
        out: &mut Vec<(NodeId, Vec<(NodeId, NodeId)>)>,
    ) {
        if matches!(ast.node(id), Node::For { .. }) {
            stack.push((id, parent));
            out.push((id, stack.clone()));
            rec(ast, ast.loop_body(id), id, stack, out);
            stack.pop();
            return;
        }
        for c in ast.children(id) {
            rec(ast, c, id, stack, out);
        }
    }
    let mut out = Vec::new();
    let mut stack = Vec::new();
    rec(ast, root, root, &mut stack, &mut out);
    out
}

/// Multiplication depth of each domain-dependent symbol in `expr`.
fn sym_costs(
    ast: &Ast,
    expr: NodeId,
    info: &MetaExpr,
    lda: &IndexMap<String, IndexSet<String>>,
) -> IndexMap<String, u64> {
    let domain = info.domain_dims();
    let eligible = |name: &str| {
        lda.get(name)
            .map(|deps| deps.iter().any(|d| domain.contains(d)))
            .unwrap_or(false)
    };
    let mut costs: IndexMap<String, u64> = IndexMap::new();
    fn walk(
        ast: &Ast,
        id: NodeId,
        found: u64,
        eligible: &dyn Fn(&str) -> bool,
        costs: &mut IndexMap<String, u64>,
    ) {
        match ast.node(id) {
            Node::Symbol(sym) => {
                if sym.name().is_some_and(|n| eligible(n)) {
                    *costs.entry(ast.repr(id)).or_insert(0) += found;
                }
            }
            Node::Bin {
                op: BinOp::Mul | BinOp::Div,
                ..
            } => {
                let op = match ast.node(id) {
                    Node::Bin { op, .. } => *op,
                    _ => unreachable!(),
                };
                for leaf in navigate::explore_chain(ast, id, op) {
                    walk(ast, leaf, found + 1, eligible, costs);
                }
            }
            _ => {
                for c in ast.children(id) {
                    walk(ast, c, found, eligible, costs);
                }
            }
        }
    }
    walk(ast, expr, 0, &eligible, &mut costs);
    costs
}

fn analyze_loop(
    ast: &Ast,
    loop_id: NodeId,
    info: &MetaExpr,
    lda: &IndexMap<String, IndexSet<String>>,
    global_trace: &Trace,
) -> Trace {
    let mut trace: Trace = IndexMap::new();
    let body = ast.loop_body(loop_id);
    for stmt in ast.block_children(body).to_vec() {
        let Some((_, lhs, rhs)) = ast.writer_parts(stmt) else {
            continue;
        };
        let costs = sym_costs(ast, rhs, info, lda);
        let lhs_repr = ast.repr(lhs);
        for (read_repr, _) in &costs {
            if let Some(known) = global_trace.get(read_repr) {
                if !trace.contains_key(read_repr) {
                    let mut carried = known.clone();
                    carried.level = -1;
                    trace.insert(read_repr.clone(), carried);
                }
            } else {
                let occ = navigate::symbols_in(ast, rhs)
                    .into_iter()
                    .find(|s| ast.repr(*s) == *read_repr)
                    .unwrap_or(rhs);
                trace
                    .entry(read_repr.clone())
                    .or_insert_with(|| Temporary::leaf(occ));
            }
            trace
                .get_mut(read_repr)
                .expect("read entry present")
                .is_read
                .push(lhs_repr.clone());
        }
        let level = costs
            .keys()
            .filter_map(|r| trace.get(r).map(|t| t.level))
            .max()
            .unwrap_or(-1)
            + 1;
        let temp = Temporary {
            node: stmt,
            level,
            cost: flops(ast, rhs),
            reads_costs: costs,
            is_read: Vec::new(),
        };
        trace.insert(lhs_repr, temp);
    }
    trace
}

fn group_by_level(trace: &Trace) -> IndexMap<i64, Vec<String>> {
    let mut levels: IndexMap<i64, Vec<String>> = IndexMap::new();
    for (k, t) in trace {
        levels.entry(t.level).or_default().push(k.clone());
    }
    levels.sort_keys();
    levels
}

fn cost_cse(
    trace: &Trace,
    levels: &IndexMap<i64, Vec<String>>,
    size: u64,
    lo: i64,
    hi: i64,
) -> u64 {
    let mut cost = 0u64;
    for (level, keys) in levels {
        if *level < lo || *level > hi {
            continue;
        }
        cost += keys
            .iter()
            .filter_map(|k| trace.get(k))
            .map(|t| t.cost)
            .sum::<u64>();
    }
    cost * size
}

/// Model the cost of pushing levels `(lo, hi]` into their consumers
/// and re-factorizing. Returns the best `(lo, hi*, cost)`.
fn cost_fact(
    trace: &Trace,
    levels: &IndexMap<i64, Vec<String>>,
    size: u64,
    lo: i64,
    hi: i64,
) -> (i64, i64, u64) {
    let cse_of = |from: i64, to: i64| -> u64 {
        let mut c = 0u64;
        for (level, keys) in levels {
            if *level < from || *level > to {
                continue;
            }
            c += keys
                .iter()
                .filter_map(|k| trace.get(k))
                .map(|t| t.cost)
                .sum::<u64>();
        }
        c * size
    };

    let min_level = levels.keys().copied().min().unwrap_or(-1);
    let kept_cost = cse_of(min_level, lo);

    let mut new_trace: Trace = trace.clone();
    let mut best = (lo, lo, u64::MAX);
    let mut total_outloop = 0u64;

    for (level, keys) in levels.iter().filter(|(l, _)| **l > lo && **l <= hi) {
        let mut level_inloop = 0u64;
        for key in keys {
            let t = trace.get(key).expect("trace entry");
            let mut reads: Vec<String> = Vec::new();
            for (read, cost) in &t.reads_costs {
                let sub = new_trace.get(read).expect("read in trace");
                if sub.reads_costs.is_empty() {
                    reads.push(read.clone());
                } else {
                    reads.extend(sub.reads_costs.keys().cloned());
                }
                total_outloop += sub.project() * cost;
            }
            let fact_syms: IndexSet<String> = reads.iter().cloned().collect();
            total_outloop += (reads.len() - fact_syms.len()) as u64;
            level_inloop += (2 * fact_syms.len() as u64).saturating_sub(1);
            let entry = new_trace.get_mut(key).expect("trace entry");
            entry.reads_costs = fact_syms.iter().map(|s| (s.clone(), 1)).collect();
        }
        // Temporaries below this level that are read from elsewhere
        // keep their in-loop cost
        for (_, keys2) in levels.iter().filter(|(l2, _)| **l2 < *level) {
            for k2 in keys2 {
                let t2 = trace.get(k2).expect("trace entry");
                let escapes = t2.is_read.iter().any(|r| {
                    new_trace
                        .get(r)
                        .map(|rt| rt.level > *level)
                        .unwrap_or(true)
                });
                if escapes {
                    level_inloop += t2.cost;
                }
            }
        }
        let uptolevel =
            kept_cost + total_outloop + size * level_inloop + cse_of(level + 1, hi);
        if uptolevel < best.2 {
            best = (lo, *level, uptolevel);
        }
    }
    best
}

/// Inline the definitions of level `cur_level - 1` into their readers.
fn push_temporaries(
    sess: &mut Session,
    loop_id: NodeId,
    trace: &mut Trace,
    cur_level: i64,
    global_trace: &Trace,
) {
    let pushed: Vec<String> = trace
        .iter()
        .filter(|(_, t)| t.level == cur_level - 1 && t.rhs(&sess.ast).is_some())
        .map(|(k, _)| k.clone())
        .collect();

    // Remove the defining statements of fully local temporaries
    let body = sess.ast.loop_body(loop_id);
    for key in &pushed {
        let t = &trace[key.as_str()];
        let local = t.is_read.iter().all(|r| trace.contains_key(r));
        if local {
            let node = t.node;
            sess.ast.block_children_mut(body).retain(|c| *c != node);
        }
    }

    // Substitute each pushed symbol by its right-hand side in every
    // reader at this loop
    for key in &pushed {
        let (lhs, rhs, readers, pushed_reads) = {
            let t = &trace[key.as_str()];
            (
                t.lhs(&sess.ast).expect("pushed writer lhs"),
                t.rhs(&sess.ast).expect("pushed writer rhs"),
                t.is_read.clone(),
                t.reads_costs.clone(),
            )
        };
        for reader in readers {
            let Some(rt) = trace.get(&reader) else {
                continue;
            };
            let reader_node = rt.node;
            sess.ast.replace_matching(reader_node, lhs, rhs);
            let rt = trace.get_mut(&reader).expect("reader entry");
            if let Some(cost) = rt.reads_costs.shift_remove(key) {
                let sources = global_trace
                    .get(key)
                    .map(|g| g.reads_costs.clone())
                    .unwrap_or(pushed_reads.clone());
                if sources.is_empty() {
                    *rt.reads_costs.entry(key.clone()).or_insert(0) += cost;
                } else {
                    for (p, p_c) in sources {
                        *rt.reads_costs.entry(p).or_insert(0) += cost + p_c;
                    }
                }
            }
        }
    }
}

/// Re-expand, re-factorize and re-hoist the consumers of a pushed
/// level.
fn transform_temporaries(
    sess: &mut Session,
    info: &MetaExpr,
    loop_id: NodeId,
    stack: &[(NodeId, NodeId)],
    trace: &Trace,
    level: i64,
) -> Result<()> {
    let consumers: Vec<(NodeId, Vec<String>)> = trace
        .values()
        .filter(|t| t.level == level && t.rhs(&sess.ast).is_some())
        .map(|t| (t.node, t.reads_costs.keys().cloned().collect()))
        .collect();

    let dim = sess.ast.loop_dim(loop_id).to_string();
    for (node, reads) in consumers {
        let sub_info = MetaExpr::new(info.ty, stack.to_vec(), vec![dim.clone()]);
        let mut rw = crate::rewrite::Rewriter::new(sess, node, sub_info);
        rw.replacediv();
        rw.expand_all(ExpandOptions { not_aggregate: true });
        let mut adhoc = IndexMap::new();
        for r in reads {
            // Reads are reprs like `t[j]`; collect by base name
            let base = r.split('[').next().unwrap_or(&r).to_string();
            adhoc.insert(base, Vec::new());
        }
        rw.factorize_adhoc(adhoc);
        rw.factorize_heuristic();
        rw.licm(
            HoistMode::OnlyOutdomain,
            &LicmOptions {
                global_cse: true,
                ..Default::default()
            },
        )?;
    }
    Ok(())
}

fn cleanup_empty_loops(sess: &mut Session) {
    let loops = navigate::loops_in(&sess.ast, sess.root);
    for (l, parent) in loops.into_iter().rev() {
        let body = sess.ast.loop_body(l);
        if sess.ast.block_children(body).is_empty() {
            if matches!(
                sess.ast.node(parent),
                Node::Block { .. } | Node::Root { .. }
            ) {
                sess.ast.block_children_mut(parent).retain(|c| *c != l);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Extent, ScalarType, WriteOp};

    /// Header: for j { t0[j] = B[j] + C[j]; t1[j] = t0[j] * D[j]; }
    /// Target nest: A[i][j] += X[i] * t1[j]
    fn session_with_chain() -> (Session, NodeId) {
        let mut ast = Ast::new();
        let mut decls = Vec::new();
        for (n, rank) in [
            ("A", vec![Extent::Const(3), Extent::Const(3)]),
            ("B", vec![Extent::Const(3)]),
            ("C", vec![Extent::Const(3)]),
            ("D", vec![Extent::Const(3)]),
            ("X", vec![Extent::Const(3)]),
            ("t0", vec![Extent::Const(3)]),
            ("t1", vec![Extent::Const(3)]),
        ] {
            decls.push(ast.decl(ScalarType::Double, n, rank));
        }
        let t0l = ast.var("t0", &["j"]);
        let b = ast.var("B", &["j"]);
        let c = ast.var("C", &["j"]);
        let bc = ast.sum(b, c);
        let s0 = ast.writer(WriteOp::Assign, t0l, bc);
        let t1l = ast.var("t1", &["j"]);
        let t0r = ast.var("t0", &["j"]);
        let d = ast.var("D", &["j"]);
        let t0d = ast.prod(t0r, d);
        let s1 = ast.writer(WriteOp::Assign, t1l, t0d);
        let cse_body = ast.block(vec![s0, s1]);
        let cse_loop = ast.for_loop("j", Extent::Const(3), cse_body);

        let lhs = ast.var("A", &["i", "j"]);
        let x = ast.var("X", &["i"]);
        let t1r = ast.var("t1", &["j"]);
        let rhs = ast.prod(x, t1r);
        let w = ast.writer(WriteOp::Incr, lhs, rhs);
        if let Node::Writer { pragma, .. } = ast.node_mut(w) {
            *pragma = Some("pyop2 assembly(i,j)".to_string());
        }
        let jb = ast.block(vec![w]);
        let fj = ast.for_loop("j", Extent::Const(3), jb);
        let ib = ast.block(vec![fj]);
        let fi = ast.for_loop("i", Extent::Const(3), ib);
        decls.push(cse_loop);
        decls.push(fi);
        let root = ast.root(decls);
        let sess = Session::build(ast, root).unwrap();
        (sess, w)
    }

    #[test]
    fn test_unpick_preserves_optimal_chain() {
        // The modelled cost of inlining this chain exceeds keeping it,
        // so the trace is analyzed but nothing moves.
        let (mut sess, w) = session_with_chain();
        let target = sess.targets[0].clone();
        assert_eq!(target.stmt, w);
        let before = sess.ast.pretty(sess.root);
        unpick(&mut sess, target.stmt, &target.info).unwrap();
        assert_eq!(sess.ast.pretty(sess.root), before);
    }

    #[test]
    fn test_symbolic_trip_count_noted_not_fatal() {
        let mut ast = Ast::new();
        let da = ast.decl(ScalarType::Double, "A", vec![Extent::Const(3)]);
        let db = ast.decl(ScalarType::Double, "B", vec![Extent::Const(3)]);
        let dt = ast.decl(ScalarType::Double, "t", vec![Extent::Const(3)]);
        let tl = ast.var("t", &["k"]);
        let b = ast.var("B", &["k"]);
        let two = ast.num(2.0);
        let b2 = ast.prod(b, two);
        let s = ast.writer(WriteOp::Assign, tl, b2);
        let kb = ast.block(vec![s]);
        let fk = ast.for_loop("k", Extent::Sym("n".into()), kb);
        let lhs = ast.var("A", &["i"]);
        let t = ast.var("t", &["i"]);
        let w = ast.writer(WriteOp::Incr, lhs, t);
        if let Node::Writer { pragma, .. } = ast.node_mut(w) {
            *pragma = Some("pyop2 assembly(i)".to_string());
        }
        let ib = ast.block(vec![w]);
        let fi = ast.for_loop("i", Extent::Const(3), ib);
        let root = ast.root(vec![da, db, dt, fk, fi]);
        let mut sess = Session::build(ast, root).unwrap();
        let target = sess.targets[0].clone();
        unpick(&mut sess, target.stmt, &target.info).unwrap();
        assert!(sess
            .log
            .notes
            .iter()
            .any(|n| n.pass == "unpick" && n.message.contains("symbolic")));
    }

    #[test]
    fn test_trace_levels() {
        let (sess, _) = session_with_chain();
        let target = &sess.targets[0];
        let lda = lda_by_name(&sess.ast, sess.root);
        let loops = loops_with_stack(&sess.ast, sess.root);
        let cse_loop = loops
            .iter()
            .find(|(l, _)| {
                sess.ast.loop_dim(*l) == "j" && !target.info.loops().contains(l)
            })
            .map(|(l, _)| *l)
            .unwrap();
        let trace = analyze_loop(
            &sess.ast,
            cse_loop,
            &target.info,
            &lda,
            &IndexMap::new(),
        );
        assert_eq!(trace["t0[j]"].level, 0);
        assert_eq!(trace["t1[j]"].level, 1);
        assert_eq!(trace["B[j]"].level, -1);
        // t0 is read by t1
        assert_eq!(trace["t0[j]"].is_read, vec!["t1[j]".to_string()]);
        // D sits under one multiplication in t1's rhs
        assert_eq!(trace["t1[j]"].reads_costs["D[j]"], 1);
        assert_eq!(trace["t1[j]"].reads_costs["t0[j]"], 1);
    }

    #[test]
    fn test_cleanup_removes_emptied_loops() {
        let mut ast = Ast::new();
        let da = ast.decl(ScalarType::Double, "A", vec![Extent::Const(3)]);
        let empty = ast.block(vec![]);
        let fk = ast.for_loop("k", Extent::Const(4), empty);
        let lhs = ast.var("A", &["i"]);
        let one = ast.num(1.0);
        let w = ast.writer(WriteOp::Incr, lhs, one);
        let ib = ast.block(vec![w]);
        let fi = ast.for_loop("i", Extent::Const(3), ib);
        let root = ast.root(vec![da, fk, fi]);
        let mut sess = Session::build(ast, root).unwrap();
        cleanup_empty_loops(&mut sess);
        let dims: Vec<&str> = navigate::loops_in(&sess.ast, sess.root)
            .iter()
            .map(|(l, _)| sess.ast.loop_dim(*l))
            .collect();
        assert_eq!(dims, vec!["i"]);
    }
}
