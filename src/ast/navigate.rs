//! AST navigation: symbol collection, loop-nest queries, operator
//! chains. These are the traversal primitives every rewriting pass is
//! built from.

use super::{Ast, BinOp, Node, NodeId};

/// All `Symbol` occurrences below `root` (inclusive), in post-order.
pub fn symbols_in(ast: &Ast, root: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    collect_symbols(ast, root, &mut out);
    out
}

fn collect_symbols(ast: &Ast, id: NodeId, out: &mut Vec<NodeId>) {
    for c in ast.children(id) {
        collect_symbols(ast, c, out);
    }
    if matches!(ast.node(id), Node::Symbol(_)) {
        out.push(id);
    }
}

/// Distinct variable names referenced below `root`, in discovery order.
pub fn symbol_names_in(ast: &Ast, root: NodeId) -> Vec<String> {
    let mut seen = Vec::new();
    for id in symbols_in(ast, root) {
        if let Some(name) = ast.as_symbol(id).and_then(|s| s.name()) {
            if !seen.iter().any(|n| n == name) {
                seen.push(name.to_string());
            }
        }
    }
    seen
}

/// Number of nodes in the subtree rooted at `root`.
pub fn count_nodes(ast: &Ast, root: NodeId) -> usize {
    1 + ast
        .children(root)
        .into_iter()
        .map(|c| count_nodes(ast, c))
        .sum::<usize>()
}

/// All `Writer` statements below `root`, in pre-order.
pub fn writers_in(ast: &Ast, root: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    walk_pre(ast, root, &mut |ast, id| {
        if matches!(ast.node(id), Node::Writer { .. }) {
            out.push(id);
        }
    });
    out
}

/// All `For` loops below `root` paired with their parent node,
/// in pre-order.
pub fn loops_in(ast: &Ast, root: NodeId) -> Vec<(NodeId, NodeId)> {
    let mut out = Vec::new();
    fn rec(ast: &Ast, id: NodeId, parent: NodeId, out: &mut Vec<(NodeId, NodeId)>) {
        if matches!(ast.node(id), Node::For { .. }) {
            out.push((id, parent));
        }
        for c in ast.children(id) {
            rec(ast, c, id, out);
        }
    }
    for c in ast.children(root) {
        rec(ast, c, root, &mut out);
    }
    out
}

/// Innermost loops of the nests rooted below `node`.
pub fn inner_loops(ast: &Ast, node: NodeId) -> Vec<NodeId> {
    fn find(ast: &Ast, id: NodeId, loops: &mut Vec<NodeId>) -> bool {
        match ast.node(id) {
            Node::Writer { .. } => false,
            Node::Block { children, .. } | Node::Root { children } => {
                let mut found = false;
                for c in children.clone() {
                    found |= find(ast, c, loops);
                }
                found
            }
            Node::For { body, .. } => {
                if !find(ast, *body, loops) {
                    loops.push(id);
                }
                true
            }
            _ => false,
        }
    }
    let mut loops = Vec::new();
    find(ast, node, &mut loops);
    loops
}

/// True if `loop_id` roots a perfect loop nest: every level contains
/// either a single statement or, at the innermost level only, a run
/// of writers.
pub fn is_perfect_loop(ast: &Ast, loop_id: NodeId) -> bool {
    fn check(ast: &Ast, id: NodeId, found_block: bool) -> bool {
        match ast.node(id) {
            Node::Writer { .. } => true,
            Node::For { body, .. } => {
                if found_block {
                    return false;
                }
                check(ast, *body, false)
            }
            Node::Block { children, .. } => {
                if children.len() == 1 {
                    return check(ast, children[0], found_block);
                }
                children.clone().iter().all(|c| check(ast, *c, true))
            }
            _ => false,
        }
    }
    matches!(ast.node(loop_id), Node::For { .. }) && check(ast, loop_id, false)
}

/// Flatten a chain of same-op binary nodes rooted at `node` into its
/// leaves, left to right. A non-matching node is its own single leaf.
pub fn explore_chain(ast: &Ast, node: NodeId, op: BinOp) -> Vec<NodeId> {
    let mut out = Vec::new();
    fn rec(ast: &Ast, id: NodeId, op: BinOp, out: &mut Vec<NodeId>) {
        match ast.node(id) {
            Node::Bin {
                op: node_op,
                lhs,
                rhs,
            } if *node_op == op => {
                rec(ast, *lhs, op, out);
                rec(ast, *rhs, op, out);
            }
            _ => out.push(id),
        }
    }
    rec(ast, node, op, &mut out);
    out
}

/// Flatten a mixed additive chain (`+` and `-`) into signed addends.
/// The bool is true when the addend is subtracted.
pub fn explore_additive_chain(ast: &Ast, node: NodeId) -> Vec<(NodeId, bool)> {
    let mut out = Vec::new();
    fn rec(ast: &Ast, id: NodeId, negate: bool, out: &mut Vec<(NodeId, bool)>) {
        match ast.node(id) {
            Node::Bin {
                op: BinOp::Add,
                lhs,
                rhs,
            } => {
                rec(ast, *lhs, negate, out);
                rec(ast, *rhs, negate, out);
            }
            Node::Bin {
                op: BinOp::Sub,
                lhs,
                rhs,
            } => {
                rec(ast, *lhs, negate, out);
                rec(ast, *rhs, !negate, out);
            }
            _ => out.push((id, negate)),
        }
    }
    rec(ast, node, false, &mut out);
    out
}

/// All `Div` nodes below `root`, in post-order.
pub fn divs_in(ast: &Ast, root: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    fn rec(ast: &Ast, id: NodeId, out: &mut Vec<NodeId>) {
        for c in ast.children(id) {
            rec(ast, c, out);
        }
        if matches!(ast.node(id), Node::Bin { op: BinOp::Div, .. }) {
            out.push(id);
        }
    }
    rec(ast, root, &mut out);
    out
}

/// Pre-order walk calling `f` on every node below and including `root`.
pub fn walk_pre<F: FnMut(&Ast, NodeId)>(ast: &Ast, root: NodeId, f: &mut F) {
    f(ast, root);
    for c in ast.children(root) {
        walk_pre(ast, c, f);
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Extent, WriteOp};
    use super::*;
    use crate::ast::Ast;

    fn nest_2d(ast: &mut Ast) -> (NodeId, NodeId) {
        // for i { for j { A[i][j] += X[i]*Y[j]; } }
        let lhs = ast.var("A", &["i", "j"]);
        let x = ast.var("X", &["i"]);
        let y = ast.var("Y", &["j"]);
        let rhs = ast.prod(x, y);
        let w = ast.writer(WriteOp::Incr, lhs, rhs);
        let jb = ast.block(vec![w]);
        let fj = ast.for_loop("j", Extent::Const(3), jb);
        let ib = ast.block(vec![fj]);
        let fi = ast.for_loop("i", Extent::Const(4), ib);
        (fi, w)
    }

    #[test]
    fn test_symbols_in_postorder() {
        let mut ast = Ast::new();
        let (_, w) = nest_2d(&mut ast);
        let syms = symbols_in(&ast, w);
        let names: Vec<_> = syms
            .iter()
            .filter_map(|s| ast.as_symbol(*s).and_then(|s| s.name()))
            .collect();
        assert_eq!(names, vec!["X", "Y", "A"]);
    }

    #[test]
    fn test_inner_loops() {
        let mut ast = Ast::new();
        let (fi, _) = nest_2d(&mut ast);
        let root = ast.root(vec![fi]);
        let inner = inner_loops(&ast, root);
        assert_eq!(inner.len(), 1);
        assert_eq!(ast.loop_dim(inner[0]), "j");
    }

    #[test]
    fn test_loops_in_order() {
        let mut ast = Ast::new();
        let (fi, _) = nest_2d(&mut ast);
        let root = ast.root(vec![fi]);
        let fors = loops_in(&ast, root);
        let dims: Vec<_> = fors.iter().map(|(l, _)| ast.loop_dim(*l)).collect();
        assert_eq!(dims, vec!["i", "j"]);
    }

    #[test]
    fn test_perfect_loop() {
        let mut ast = Ast::new();
        let (fi, _) = nest_2d(&mut ast);
        assert!(is_perfect_loop(&ast, fi));
    }

    #[test]
    fn test_imperfect_loop() {
        let mut ast = Ast::new();
        // for i { t[i] = X[i]; for j { A[i][j] += t[i]*Y[j]; } }
        let tl = ast.var("t", &["i"]);
        let x = ast.var("X", &["i"]);
        let pre = ast.writer(WriteOp::Assign, tl, x);
        let lhs = ast.var("A", &["i", "j"]);
        let t = ast.var("t", &["i"]);
        let y = ast.var("Y", &["j"]);
        let rhs = ast.prod(t, y);
        let w = ast.writer(WriteOp::Incr, lhs, rhs);
        let jb = ast.block(vec![w]);
        let fj = ast.for_loop("j", Extent::Const(3), jb);
        let ib = ast.block(vec![pre, fj]);
        let fi = ast.for_loop("i", Extent::Const(4), ib);
        assert!(!is_perfect_loop(&ast, fi));
    }

    #[test]
    fn test_explore_chain() {
        let mut ast = Ast::new();
        let a = ast.var("a", &[]);
        let b = ast.var("b", &[]);
        let c = ast.var("c", &[]);
        let chain = ast.chain(BinOp::Mul, vec![a, b, c]);
        let leaves = explore_chain(&ast, chain, BinOp::Mul);
        assert_eq!(leaves, vec![a, b, c]);
        // A sum is a single leaf of a product chain
        let d = ast.var("d", &[]);
        let s = ast.sum(c, d);
        let top = ast.prod(chain, s);
        let leaves = explore_chain(&ast, top, BinOp::Mul);
        assert_eq!(leaves.len(), 4);
        assert_eq!(leaves[3], s);
    }

    #[test]
    fn test_additive_chain_signs() {
        let mut ast = Ast::new();
        let a = ast.var("a", &[]);
        let b = ast.var("b", &[]);
        let c = ast.var("c", &[]);
        let s = ast.sub(a, b);
        let top = ast.sum(s, c);
        let addends = explore_additive_chain(&ast, top);
        let signs: Vec<bool> = addends.iter().map(|(_, n)| *n).collect();
        assert_eq!(signs, vec![false, true, false]);
    }
}
