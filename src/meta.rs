//! Per-target expression metadata.
//!
//! A `MetaExpr` describes one rewrite target: the writer statement's
//! scalar type, the ordered tuple of enclosing loops with their parent
//! blocks, and the partition of those loops into domain loops (whose
//! iteration variables index the writer's left-hand side) and
//! out-of-domain loops (the rest, typically quadrature/reduction).

use indexmap::IndexMap;

use crate::ast::{Ast, NodeId, ScalarType};

#[derive(Clone, Debug)]
pub struct MetaExpr {
    pub ty: ScalarType,
    /// Enclosing `(loop, parent block)` pairs, outermost first.
    loops_info: Vec<(NodeId, NodeId)>,
    /// Domain dimensions, in nest order.
    domain: Vec<String>,
}

impl MetaExpr {
    pub fn new(ty: ScalarType, loops_info: Vec<(NodeId, NodeId)>, domain: Vec<String>) -> Self {
        MetaExpr {
            ty,
            loops_info,
            domain,
        }
    }

    pub fn loops_info(&self) -> &[(NodeId, NodeId)] {
        &self.loops_info
    }

    pub fn loops(&self) -> Vec<NodeId> {
        self.loops_info.iter().map(|(l, _)| *l).collect()
    }

    /// All enclosing loop dimensions, outermost first.
    pub fn dims(&self, ast: &Ast) -> Vec<String> {
        self.loops_info
            .iter()
            .map(|(l, _)| ast.loop_dim(*l).to_string())
            .collect()
    }

    pub fn domain_dims(&self) -> &[String] {
        &self.domain
    }

    pub fn out_domain_dims(&self, ast: &Ast) -> Vec<String> {
        self.dims(ast)
            .into_iter()
            .filter(|d| !self.domain.contains(d))
            .collect()
    }

    pub fn domain_loops(&self, ast: &Ast) -> Vec<(NodeId, NodeId)> {
        self.loops_info
            .iter()
            .filter(|(l, _)| self.domain.iter().any(|d| d == ast.loop_dim(*l)))
            .copied()
            .collect()
    }

    pub fn out_domain_loops(&self, ast: &Ast) -> Vec<(NodeId, NodeId)> {
        self.loops_info
            .iter()
            .filter(|(l, _)| !self.domain.iter().any(|d| d == ast.loop_dim(*l)))
            .copied()
            .collect()
    }

    /// Number of domain loops.
    pub fn dimension(&self) -> usize {
        self.domain.len()
    }

    pub fn outermost_loop(&self) -> Option<NodeId> {
        self.loops_info.first().map(|(l, _)| *l)
    }

    pub fn outermost_parent(&self) -> Option<NodeId> {
        self.loops_info.first().map(|(_, p)| *p)
    }

    pub fn innermost_loop(&self) -> Option<NodeId> {
        self.loops_info.last().map(|(l, _)| *l)
    }

    /// Ordered map from dimension name to its loop.
    pub fn loops_from_dims(&self, ast: &Ast) -> IndexMap<String, NodeId> {
        self.loops_info
            .iter()
            .map(|(l, _)| (ast.loop_dim(*l).to_string(), *l))
            .collect()
    }

    /// The loop at the nest level just inside `dim`'s loop, if any.
    pub fn next_loop_after(&self, ast: &Ast, dim: &str) -> Option<NodeId> {
        let pos = self
            .loops_info
            .iter()
            .position(|(l, _)| ast.loop_dim(*l) == dim)?;
        self.loops_info.get(pos + 1).map(|(l, _)| *l)
    }

    pub fn loop_of_dim(&self, ast: &Ast, dim: &str) -> Option<NodeId> {
        self.loops_info
            .iter()
            .find(|(l, _)| ast.loop_dim(*l) == dim)
            .map(|(l, _)| *l)
    }

    /// Drop a loop from the metadata after it has been removed from
    /// the tree (reduction elimination).
    pub fn remove_loop(&mut self, loop_id: NodeId) {
        self.loops_info.retain(|(l, _)| *l != loop_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Extent, WriteOp};

    fn meta_2d() -> (Ast, MetaExpr) {
        // for q { for i { for j { A[i][j] += ...; } } }, domain (i, j)
        let mut ast = Ast::new();
        let lhs = ast.var("A", &["i", "j"]);
        let one = ast.num(1.0);
        let w = ast.writer(WriteOp::Incr, lhs, one);
        let jb = ast.block(vec![w]);
        let fj = ast.for_loop("j", Extent::Const(3), jb);
        let ib = ast.block(vec![fj]);
        let fi = ast.for_loop("i", Extent::Const(3), ib);
        let qb = ast.block(vec![fi]);
        let fq = ast.for_loop("q", Extent::Const(6), qb);
        let root = ast.root(vec![fq]);
        let info = MetaExpr::new(
            ScalarType::Double,
            vec![(fq, root), (fi, qb), (fj, ib)],
            vec!["i".into(), "j".into()],
        );
        (ast, info)
    }

    #[test]
    fn test_dims_partition() {
        let (ast, info) = meta_2d();
        assert_eq!(info.dims(&ast), vec!["q", "i", "j"]);
        assert_eq!(info.domain_dims(), &["i", "j"]);
        assert_eq!(info.out_domain_dims(&ast), vec!["q"]);
        assert_eq!(info.dimension(), 2);
    }

    #[test]
    fn test_loop_lookup() {
        let (ast, info) = meta_2d();
        let li = info.loop_of_dim(&ast, "i").unwrap();
        assert_eq!(ast.loop_dim(li), "i");
        let next = info.next_loop_after(&ast, "i").unwrap();
        assert_eq!(ast.loop_dim(next), "j");
        assert!(info.next_loop_after(&ast, "j").is_none());
    }

    #[test]
    fn test_remove_loop() {
        let (ast, mut info) = meta_2d();
        let lq = info.loop_of_dim(&ast, "q").unwrap();
        info.remove_loop(lq);
        assert_eq!(info.dims(&ast), vec!["i", "j"]);
        assert!(info.out_domain_dims(&ast).is_empty());
    }
}
