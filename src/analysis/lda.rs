//! Loop-dependence analysis.
//!
//! A single pre-order traversal maintaining the stack of enclosing
//! loop dimensions. At each symbol occurrence, the dependency set is
//! the subset of the loop stack appearing in the symbol's rank, in
//! loop-stack order. Idempotent and side-effect free.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};

use crate::ast::{Ast, Node, NodeId};

/// Dependencies keyed by symbol occurrence (node id).
pub type OccurrenceDeps = HashMap<NodeId, Vec<String>>;

/// Per-occurrence loop dependencies below `root`.
pub fn lda_by_occurrence(ast: &Ast, root: NodeId) -> OccurrenceDeps {
    let mut out = HashMap::new();
    let mut stack = Vec::new();
    by_occurrence(ast, root, &mut stack, &mut out);
    out
}

fn by_occurrence(ast: &Ast, id: NodeId, stack: &mut Vec<String>, out: &mut OccurrenceDeps) {
    match ast.node(id) {
        Node::Symbol(sym) => {
            let dims = sym.loop_dims();
            let deps: Vec<String> = stack
                .iter()
                .filter(|d| dims.contains(&d.as_str()))
                .cloned()
                .collect();
            out.insert(id, deps);
        }
        Node::For { dim, body, .. } => {
            stack.push(dim.clone());
            by_occurrence(ast, *body, stack, out);
            stack.pop();
        }
        _ => {
            for c in ast.children(id) {
                by_occurrence(ast, c, stack, out);
            }
        }
    }
}

/// Per-name loop dependencies below `root`: the union over all
/// occurrences of that name, preserving loop-stack order.
pub fn lda_by_name(ast: &Ast, root: NodeId) -> IndexMap<String, IndexSet<String>> {
    let mut out: IndexMap<String, IndexSet<String>> = IndexMap::new();
    let mut stack = Vec::new();
    by_name(ast, root, &mut stack, &mut out);
    out
}

fn by_name(
    ast: &Ast,
    id: NodeId,
    stack: &mut Vec<String>,
    out: &mut IndexMap<String, IndexSet<String>>,
) {
    match ast.node(id) {
        Node::Symbol(sym) => {
            if let Some(name) = sym.name() {
                let dims = sym.loop_dims();
                let entry = out.entry(name.to_string()).or_default();
                for d in stack.iter() {
                    if dims.contains(&d.as_str()) {
                        entry.insert(d.clone());
                    }
                }
            }
        }
        Node::For { dim, body, .. } => {
            stack.push(dim.clone());
            by_name(ast, *body, stack, out);
            stack.pop();
        }
        _ => {
            for c in ast.children(id) {
                by_name(ast, c, stack, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Extent, WriteOp};

    fn kernel() -> (Ast, NodeId, NodeId) {
        // for i { for j { A[i][j] += X[i] * c; } }
        let mut ast = Ast::new();
        let lhs = ast.var("A", &["i", "j"]);
        let x = ast.var("X", &["i"]);
        let c = ast.var("c", &[]);
        let rhs = ast.prod(x, c);
        let w = ast.writer(WriteOp::Incr, lhs, rhs);
        let jb = ast.block(vec![w]);
        let fj = ast.for_loop("j", Extent::Const(3), jb);
        let ib = ast.block(vec![fj]);
        let fi = ast.for_loop("i", Extent::Const(4), ib);
        let root = ast.root(vec![fi]);
        (ast, root, x)
    }

    #[test]
    fn test_by_occurrence() {
        let (ast, root, x) = kernel();
        let lda = lda_by_occurrence(&ast, root);
        assert_eq!(lda[&x], vec!["i".to_string()]);
    }

    #[test]
    fn test_by_name_union_and_order() {
        let (ast, root, _) = kernel();
        let lda = lda_by_name(&ast, root);
        let a: Vec<&String> = lda["A"].iter().collect();
        assert_eq!(a, vec!["i", "j"]);
        assert!(lda["c"].is_empty());
        let x: Vec<&String> = lda["X"].iter().collect();
        assert_eq!(x, vec!["i"]);
    }

    #[test]
    fn test_idempotent() {
        let (ast, root, _) = kernel();
        let first = lda_by_name(&ast, root);
        let second = lda_by_name(&ast, root);
        assert_eq!(first, second);
    }

    #[test]
    fn test_rank_dim_outside_nest_is_ignored() {
        // A symbol indexed by a dim that is not an enclosing loop has
        // no dependency on the nest.
        let mut ast = Ast::new();
        let s = ast.var("B", &["k"]);
        let lhs = ast.var("A", &["i"]);
        let w = ast.writer(WriteOp::Assign, lhs, s);
        let b = ast.block(vec![w]);
        let fi = ast.for_loop("i", Extent::Const(2), b);
        let root = ast.root(vec![fi]);
        let lda = lda_by_occurrence(&ast, root);
        assert!(lda[&s].is_empty());
    }
}
