//! Registry of hoisted temporaries.
//!
//! Insertion-ordered map from a synthesized temporary's name to where
//! it lives: the defining statement, its declaration, the wrapping
//! loop (when the value is a vector), and the block the definition was
//! placed in. A reverse index from defining-expression text supports
//! global common-subexpression reuse.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::ast::NodeId;

#[derive(Clone, Copy, Debug)]
pub struct HoistedInfo {
    /// The defining `Assign`/`Incr` statement.
    pub stmt: NodeId,
    /// The `Decl` of the temporary.
    pub decl: NodeId,
    /// The synthesized loop wrapping `stmt`, if the value is a vector.
    pub wrap_loop: Option<NodeId>,
    /// The block `stmt` (or its wrap loop) was inserted into.
    pub place: NodeId,
}

#[derive(Debug, Default)]
pub struct HoistedRegistry {
    entries: IndexMap<String, HoistedInfo>,
    by_expr: HashMap<String, String>,
}

impl HoistedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hoisted temporary. `expr_repr` is the textual form
    /// of the defining right-hand side at registration time.
    pub fn insert(&mut self, name: &str, info: HoistedInfo, expr_repr: Option<String>) {
        self.entries.insert(name.to_string(), info);
        if let Some(repr) = expr_repr {
            self.by_expr.entry(repr).or_insert_with(|| name.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<&HoistedInfo> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// The temporary already defined by an expression textually equal
    /// to `expr_repr`, if any.
    pub fn symbol_for_expr(&self, expr_repr: &str) -> Option<&str> {
        self.by_expr.get(expr_repr).map(|s| s.as_str())
    }

    /// Re-key the reverse index after `name`'s defining expression was
    /// rewritten in place.
    pub fn refresh_expr(&mut self, name: &str, new_repr: String) {
        self.by_expr.retain(|_, v| v != name);
        self.by_expr.entry(new_repr).or_insert_with(|| name.to_string());
    }

    pub fn remove(&mut self, name: &str) -> Option<HoistedInfo> {
        self.by_expr.retain(|_, v| v != name);
        self.entries.shift_remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HoistedInfo)> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All defining statements, in registration order.
    pub fn all_stmts(&self) -> Vec<NodeId> {
        self.entries.values().map(|i| i.stmt).collect()
    }

    /// Distinct wrap loops, in registration order.
    pub fn all_loops(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        for info in self.entries.values() {
            if let Some(l) = info.wrap_loop {
                if !out.contains(&l) {
                    out.push(l);
                }
            }
        }
        out
    }

    /// Names of temporaries whose wrap loop is `loop_id`.
    pub fn names_in_loop(&self, loop_id: NodeId) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, i)| i.wrap_loop == Some(loop_id))
            .map(|(n, _)| n.clone())
            .collect()
    }
}
