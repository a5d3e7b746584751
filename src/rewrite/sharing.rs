//! Sharing-graph-driven rewriting.
//!
//! Builds a graph whose nodes are the symbols eligible for collection
//! and whose edges join symbols co-occurring in the same addend of the
//! target's top-level sum. Factorizing by a symbol covers every addend
//! it touches, so picking the factorization sequence is a minimum
//! vertex cover: every edge must be covered by at least one chosen
//! endpoint. The solver is isolated behind `CoverSolver`; the shipped
//! implementation is a deterministic greedy cover, which is also the
//! documented fallback when no exact solver is available.

use indexmap::{IndexMap, IndexSet};

use petgraph::graph::{NodeIndex, UnGraph};

use crate::ast::{navigate, Ast, BinOp, NodeId};
use crate::meta::MetaExpr;

/// Chooses a set of vertices covering every edge.
pub trait CoverSolver {
    /// Returns indices into `nodes`, or None when the instance cannot
    /// be solved (callers fall back to heuristic factorization).
    fn cover(&self, nodes: &[String], edges: &[(usize, usize)]) -> Option<Vec<usize>>;
}

/// Deterministic greedy cover: repeatedly take the highest-degree
/// vertex, ties broken by first appearance.
pub struct GreedyCover;

impl CoverSolver for GreedyCover {
    fn cover(&self, nodes: &[String], edges: &[(usize, usize)]) -> Option<Vec<usize>> {
        let mut uncovered: Vec<(usize, usize)> = edges.to_vec();
        let mut chosen = Vec::new();
        while !uncovered.is_empty() {
            let mut degree = vec![0usize; nodes.len()];
            for (a, b) in &uncovered {
                degree[*a] += 1;
                degree[*b] += 1;
            }
            let best = (0..nodes.len()).max_by_key(|i| (degree[*i], nodes.len() - i))?;
            if degree[best] == 0 {
                return None;
            }
            chosen.push(best);
            uncovered.retain(|(a, b)| *a != best && *b != best);
        }
        Some(chosen)
    }
}

/// The sharing graph of one expression.
pub(crate) struct SharingGraph {
    pub nodes: Vec<String>,
    pub edges: Vec<(usize, usize)>,
}

impl SharingGraph {
    /// Symbols sharing an addend of the top-level sum of `rhs`.
    /// Only symbols appearing in at least two addends become nodes.
    pub fn build(ast: &Ast, info: &MetaExpr, rhs: NodeId) -> Self {
        let domain = info.domain_dims();
        let addends = navigate::explore_additive_chain(ast, rhs);

        // Which addends each eligible symbol occurs in
        let mut occurrences: IndexMap<String, IndexSet<usize>> = IndexMap::new();
        let mut per_addend: Vec<IndexSet<String>> = Vec::new();
        for (i, (addend, _)) in addends.iter().enumerate() {
            let mut here = IndexSet::new();
            for s in navigate::symbols_in(ast, *addend) {
                let Some(sym) = ast.as_symbol(s) else { continue };
                if sym.name().is_none() {
                    continue;
                }
                if !sym.loop_dims().iter().any(|d| domain.iter().any(|x| x == d)) {
                    continue;
                }
                let repr = ast.repr(s);
                occurrences.entry(repr.clone()).or_default().insert(i);
                here.insert(repr);
            }
            per_addend.push(here);
        }

        let nodes: Vec<String> = occurrences
            .iter()
            .filter(|(_, ixs)| ixs.len() >= 2)
            .map(|(s, _)| s.clone())
            .collect();
        let index_of: IndexMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();

        let mut edges: IndexSet<(usize, usize)> = IndexSet::new();
        for here in &per_addend {
            let present: Vec<usize> = here
                .iter()
                .filter_map(|s| index_of.get(s.as_str()).copied())
                .collect();
            for (i, a) in present.iter().enumerate() {
                for b in present.iter().skip(i + 1) {
                    let (lo, hi) = if a < b { (*a, *b) } else { (*b, *a) };
                    edges.insert((lo, hi));
                }
            }
        }
        SharingGraph {
            nodes,
            edges: edges.into_iter().collect(),
        }
    }

    /// petgraph view, for diagnostics and tests.
    pub fn as_graph(&self) -> UnGraph<String, ()> {
        let mut g = UnGraph::new_undirected();
        let ixs: Vec<NodeIndex> = self
            .nodes
            .iter()
            .map(|n| g.add_node(n.clone()))
            .collect();
        for (a, b) in &self.edges {
            g.add_edge(ixs[*a], ixs[*b], ());
        }
        g
    }

    /// Base variable names of the chosen cover first, then the rest,
    /// the order factorizations must be applied in.
    pub fn factorization_order(&self, solver: &dyn CoverSolver) -> Option<Vec<String>> {
        let chosen = solver.cover(&self.nodes, &self.edges)?;
        let mut order: Vec<String> = chosen
            .iter()
            .map(|i| base_name(&self.nodes[*i]))
            .collect();
        for (i, n) in self.nodes.iter().enumerate() {
            if !chosen.contains(&i) {
                let base = base_name(n);
                if !order.contains(&base) {
                    order.push(base);
                }
            }
        }
        order.dedup();
        Some(order)
    }
}

fn base_name(repr: &str) -> String {
    repr.split('[').next().unwrap_or(repr).to_string()
}
