//! Read-after-write expression graph.
//!
//! Nodes are symbol names; an edge `s -> t` records that the value
//! bound to `s` was computed from `t`. Self-edges mark symbols that
//! are both written and read within the same region and must not be
//! inlined or expanded in place.

use std::collections::HashMap;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::ast::{navigate, Ast, NodeId};

#[derive(Debug, Default)]
pub struct ExpressionGraph {
    graph: StableDiGraph<String, ()>,
    names: HashMap<String, NodeIndex>,
}

impl ExpressionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn node_for(&mut self, name: &str) -> NodeIndex {
        if let Some(ix) = self.names.get(name) {
            return *ix;
        }
        let ix = self.graph.add_node(name.to_string());
        self.names.insert(name.to_string(), ix);
        ix
    }

    /// Record that `lhs` is computed from every symbol appearing in
    /// `rhs`. Re-assigning a symbol that already has outgoing edges
    /// additionally records a self-edge.
    pub fn add_dependency(&mut self, ast: &Ast, lhs: &str, rhs: NodeId) {
        if self.is_written(lhs) {
            self.add_edge(lhs, lhs);
        }
        for name in navigate::symbol_names_in(ast, rhs) {
            self.add_edge(lhs, &name);
        }
    }

    pub fn add_edge(&mut self, from: &str, to: &str) {
        let f = self.node_for(from);
        let t = self.node_for(to);
        if self.graph.edges_connecting(f, t).next().is_none() {
            self.graph.add_edge(f, t, ());
        }
    }

    pub fn add_self_edge(&mut self, name: &str) {
        self.add_edge(name, name);
    }

    /// True iff some other value was computed from `name`.
    pub fn is_read(&self, name: &str) -> bool {
        self.names
            .get(name)
            .map(|ix| {
                self.graph
                    .edges_directed(*ix, Direction::Incoming)
                    .next()
                    .is_some()
            })
            .unwrap_or(false)
    }

    /// True iff `name` has been assigned a computed value.
    pub fn is_written(&self, name: &str) -> bool {
        self.names
            .get(name)
            .map(|ix| {
                self.graph
                    .edges_directed(*ix, Direction::Outgoing)
                    .next()
                    .is_some()
            })
            .unwrap_or(false)
    }

    /// Edge lookup: with `target`, whether `name -> target` exists;
    /// without, whether `name` has any outgoing edge.
    pub fn has_dep(&self, name: &str, target: Option<&str>) -> bool {
        match target {
            None => self.is_written(name),
            Some(t) => {
                let (Some(f), Some(tix)) = (self.names.get(name), self.names.get(t)) else {
                    return false;
                };
                self.graph.edges_connecting(*f, *tix).next().is_some()
            }
        }
    }

    /// Whether `name` sits on a directed cycle (self-edges included).
    pub fn has_cycle_through(&self, name: &str) -> bool {
        let Some(start) = self.names.get(name) else {
            return false;
        };
        let mut stack: Vec<NodeIndex> = self
            .graph
            .edges_directed(*start, Direction::Outgoing)
            .map(|e| e.target())
            .collect();
        let mut seen = Vec::new();
        while let Some(ix) = stack.pop() {
            if ix == *start {
                return true;
            }
            if seen.contains(&ix) {
                continue;
            }
            seen.push(ix);
            stack.extend(
                self.graph
                    .edges_directed(ix, Direction::Outgoing)
                    .map(|e| e.target()),
            );
        }
        false
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Names `name` depends on, in insertion order.
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        let Some(ix) = self.names.get(name) else {
            return Vec::new();
        };
        let mut out: Vec<String> = self
            .graph
            .edges_directed(*ix, Direction::Outgoing)
            .map(|e| self.graph[e.target()].clone())
            .collect();
        out.reverse();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Ast;

    #[test]
    fn test_dependency_edges() {
        let mut ast = Ast::new();
        let x = ast.var("X", &["i"]);
        let c = ast.var("c", &[]);
        let rhs = ast.prod(x, c);
        let mut g = ExpressionGraph::new();
        g.add_dependency(&ast, "t0", rhs);
        assert!(g.is_written("t0"));
        assert!(g.is_read("X"));
        assert!(g.is_read("c"));
        assert!(g.has_dep("t0", Some("X")));
        assert!(!g.has_dep("X", Some("t0")));
    }

    #[test]
    fn test_reassignment_adds_self_edge() {
        let mut ast = Ast::new();
        let a = ast.var("a", &[]);
        let b = ast.var("b", &[]);
        let mut g = ExpressionGraph::new();
        g.add_dependency(&ast, "t", a);
        assert!(!g.has_dep("t", Some("t")));
        g.add_dependency(&ast, "t", b);
        assert!(g.has_dep("t", Some("t")));
        assert!(g.has_cycle_through("t"));
    }

    #[test]
    fn test_cycle_detection() {
        let mut g = ExpressionGraph::new();
        g.add_edge("a", "b");
        g.add_edge("b", "c");
        assert!(!g.has_cycle_through("a"));
        g.add_edge("c", "a");
        assert!(g.has_cycle_through("a"));
        assert!(g.has_cycle_through("b"));
    }

    #[test]
    fn test_unknown_names() {
        let g = ExpressionGraph::new();
        assert!(!g.is_read("nope"));
        assert!(!g.is_written("nope"));
        assert!(!g.has_dep("nope", Some("other")));
        assert!(!g.has_cycle_through("nope"));
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let mut g = ExpressionGraph::new();
        g.add_edge("a", "b");
        g.add_edge("a", "b");
        assert_eq!(g.dependencies_of("a"), vec!["b".to_string()]);
    }
}
