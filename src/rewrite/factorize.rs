//! Factorization: collect common multiplicands across the addends of
//! a sum and extract them as a shared multiplier.
//!
//! Each addend is modelled as a `Term`: the *operands* (symbols the
//! active rule collects) times the *factors* (everything else). Terms
//! with equal operand lists merge, summing their factors. The rewrite
//! is sum-of-products to product-of-sums, the inverse of expansion.

use indexmap::IndexMap;

use crate::ast::{navigate, Ast, Atom, BinOp, Node, NodeId, Symbol};
use crate::session::Session;

pub type SymbolPred<'p> = &'p dyn Fn(&Symbol) -> bool;

#[derive(Clone, Debug, Default)]
pub struct FactorizeOptions {
    /// Collect per-sum most-shared symbols when no global rule applies.
    pub heuristic: bool,
    /// Per-symbol allowed co-operand sets; a term whose factors already
    /// contain a forbidden co-operand is left uncollected.
    pub adhoc: IndexMap<String, Vec<String>>,
}

/// One addend: a product of operands (collected) and factors (carried).
#[derive(Clone, Debug)]
struct Term {
    operands: Vec<NodeId>,
    factors: Vec<NodeId>,
    negated: bool,
}

impl Term {
    fn opaque(node: NodeId) -> Self {
        Term {
            operands: Vec::new(),
            factors: vec![node],
            negated: false,
        }
    }

    fn process(ast: &Ast, symbols: Vec<NodeId>, pred: SymbolPred) -> Self {
        let mut operands = Vec::new();
        let mut factors = Vec::new();
        for s in symbols {
            let is_operand = ast.as_symbol(s).map(|sym| pred(sym)).unwrap_or(false);
            if is_operand {
                operands.push(s);
            } else {
                factors.push(s);
            }
        }
        Term {
            operands,
            factors,
            negated: false,
        }
    }

    fn add_operands(&mut self, ast: &Ast, ops: &[NodeId]) {
        for o in ops {
            if !self.operands.iter().any(|x| ast.subtree_eq(*x, *o)) {
                self.operands.push(*o);
            }
        }
    }

    fn add_factors(&mut self, ast: &Ast, fs: &[NodeId]) {
        for f in fs {
            if !self.factors.iter().any(|x| ast.subtree_eq(*x, *f)) {
                self.factors.push(*f);
            }
        }
    }

    fn operands_ast(&self, ast: &mut Ast) -> NodeId {
        ast.chain(BinOp::Mul, self.operands.clone())
    }

    fn factors_ast(&self, ast: &mut Ast) -> NodeId {
        ast.chain(BinOp::Mul, self.factors.clone())
    }

    fn operands_key(&self, ast: &Ast) -> String {
        self.operands
            .iter()
            .map(|o| ast.repr(*o))
            .collect::<Vec<_>>()
            .join("*")
    }

    fn body_ast(&self, ast: &mut Ast) -> NodeId {
        let is_unit_factors = |t: &Term, ast: &Ast| {
            t.factors.len() == 1
                && ast
                    .as_symbol(t.factors[0])
                    .and_then(|s| s.as_num())
                    .is_some_and(|v| v == 1.0)
        };
        if self.factors.is_empty() || (!self.operands.is_empty() && is_unit_factors(self, ast)) {
            self.operands_ast(ast)
        } else if self.operands.is_empty() {
            self.factors_ast(ast)
        } else {
            let o = self.operands_ast(ast);
            let f = self.factors_ast(ast);
            ast.prod(o, f)
        }
    }
}

pub(crate) struct Factorizer<'s> {
    pub sess: &'s mut Session,
    pub stmt: NodeId,
    opts: FactorizeOptions,
}

impl<'s> Factorizer<'s> {
    pub fn new(sess: &'s mut Session, stmt: NodeId, opts: FactorizeOptions) -> Self {
        Factorizer { sess, stmt, opts }
    }

    pub fn factorize(&mut self, pred: SymbolPred) {
        let rhs = self.sess.ast.writer_rhs(self.stmt);
        self.factorize_node(rhs, self.stmt, pred);
    }

    fn factorize_node(&mut self, id: NodeId, parent: NodeId, pred: SymbolPred) -> Term {
        match self.sess.ast.node(id) {
            Node::Symbol(_) => Term::process(&self.sess.ast, vec![id], pred),
            Node::Par(c) => {
                let c = *c;
                self.factorize_node(c, id, pred)
            }
            Node::Bin {
                op: BinOp::Div, ..
            }
            | Node::FunCall { .. }
            | Node::Ternary { .. }
            | Node::Neg(_) => {
                // Factorize within, then carry the node as an opaque factor
                for c in self.sess.ast.children(id) {
                    self.factorize_node(c, id, pred);
                }
                Term::opaque(id)
            }
            Node::Bin {
                op: BinOp::Mul, ..
            } => self.factorize_product(id, pred),
            Node::Bin {
                op: BinOp::Add | BinOp::Sub,
                ..
            } => self.factorize_sum(id, parent, pred),
            _ => Term::opaque(id),
        }
    }

    fn factorize_product(&mut self, id: NodeId, pred: SymbolPred) -> Term {
        let leaves = navigate::explore_chain(&self.sess.ast, id, BinOp::Mul);
        let mut symbols = Vec::new();
        let mut others = Vec::new();
        for leaf in leaves {
            if matches!(self.sess.ast.node(leaf), Node::Symbol(_)) {
                symbols.push(leaf);
            } else {
                others.push(leaf);
            }
        }
        let symbols = self.premultiply(symbols);
        let mut term = Term::process(&self.sess.ast, symbols, pred);
        for n in others {
            let sub = self.factorize_node(n, id, pred);
            let ops = sub.operands.clone();
            let fs = sub.factors.clone();
            term.add_operands(&self.sess.ast, &ops);
            term.add_factors(&self.sess.ast, &fs);
        }
        term
    }

    /// Fold all numeric literals of a product chain into one literal.
    fn premultiply(&mut self, symbols: Vec<NodeId>) -> Vec<NodeId> {
        let (nums, others): (Vec<NodeId>, Vec<NodeId>) = symbols.into_iter().partition(|s| {
            self.sess
                .ast
                .as_symbol(*s)
                .and_then(|sym| sym.as_num())
                .is_some()
        });
        if nums.len() <= 1 {
            let mut out = nums;
            out.extend(others);
            return out;
        }
        let product: f64 = nums
            .iter()
            .filter_map(|s| self.sess.ast.as_symbol(*s).and_then(|sym| sym.as_num()))
            .product();
        let mut out = Vec::new();
        if product != 1.0 {
            out.push(self.sess.ast.num(product));
        }
        out.extend(others);
        out
    }

    fn factorize_sum(&mut self, id: NodeId, parent: NodeId, pred: SymbolPred) -> Term {
        let addends = navigate::explore_additive_chain(&self.sess.ast, id);
        let mut terms: Vec<Term> = addends
            .iter()
            .map(|(n, neg)| {
                let mut t = self.factorize_node(*n, id, pred);
                t.negated ^= *neg;
                t
            })
            .collect();

        self.simplify_sum(&mut terms);
        if self.opts.heuristic {
            self.heuristic_collection(&mut terms);
        }

        // Group terms by operand list; ad-hoc-filtered terms stay alone
        let mut grouped: IndexMap<String, (NodeId, Vec<(NodeId, bool)>)> = IndexMap::new();
        for (i, t) in terms.into_iter().enumerate() {
            let factor = if t.factors.is_empty() {
                self.sess.ast.num(1.0)
            } else {
                t.factors_ast(&mut self.sess.ast)
            };
            if t.operands.is_empty() {
                grouped
                    .entry(format!("#bare{}", i))
                    .or_insert_with(|| (factor, Vec::new()))
                    .1
                    .push((factor, t.negated));
                continue;
            }
            let key = if self.adhoc_forbids(&t) {
                format!("#skip{}", i)
            } else {
                t.operands_key(&self.sess.ast)
            };
            let operand = t.operands_ast(&mut self.sess.ast);
            grouped
                .entry(key)
                .or_insert_with(|| (operand, Vec::new()))
                .1
                .push((factor, t.negated));
        }

        let mut rebuilt_terms: Vec<(NodeId, bool)> = Vec::new();
        for (key, (operand, factors)) in grouped {
            if key.starts_with("#bare") {
                let (f, neg) = factors[0];
                rebuilt_terms.push((f, neg));
                continue;
            }
            let node = self.rebuild_group(operand, &factors);
            rebuilt_terms.push((node, false));
        }

        let rebuilt = self.chain_signed(&rebuilt_terms);
        self.sess.ast.replace_id(parent, id, rebuilt);
        Term::opaque(rebuilt)
    }

    /// `operand * (f1 +/- f2 ...)`, eliding unit factor sums.
    fn rebuild_group(&mut self, operand: NodeId, factors: &[(NodeId, bool)]) -> NodeId {
        let all_units = factors.iter().all(|(f, neg)| {
            !neg && self
                .sess
                .ast
                .as_symbol(*f)
                .and_then(|s| s.as_num())
                .is_some_and(|v| v == 1.0)
        });
        if all_units && factors.len() == 1 {
            return operand;
        }
        let factor_sum = self.chain_signed(factors);
        // A parenthesized multi-factor sum keeps the repr unambiguous
        let factor_sum = if factors.len() > 1 {
            self.sess.ast.par(factor_sum)
        } else {
            factor_sum
        };
        self.sess.ast.prod(operand, factor_sum)
    }

    fn chain_signed(&mut self, parts: &[(NodeId, bool)]) -> NodeId {
        let mut iter = parts.iter().copied();
        let Some((first, first_neg)) = iter.next() else {
            return self.sess.ast.num(0.0);
        };
        let mut acc = if first_neg {
            self.sess.ast.neg(first)
        } else {
            first
        };
        for (part, neg) in iter {
            acc = if neg {
                self.sess.ast.sub(acc, part)
            } else {
                self.sess.ast.sum(acc, part)
            };
        }
        acc
    }

    /// Replace syntactically identical terms with one term carrying a
    /// numeric multiplicity factor.
    fn simplify_sum(&mut self, terms: &mut Vec<Term>) {
        let mut unique: IndexMap<String, Term> = IndexMap::new();
        let mut multiplicity: IndexMap<String, usize> = IndexMap::new();
        for t in terms.drain(..) {
            let probe = t.clone();
            let body = probe.body_ast(&mut self.sess.ast);
            let key = format!(
                "{}{}",
                if t.negated { "-" } else { "" },
                self.sess.ast.repr(body)
            );
            *multiplicity.entry(key.clone()).or_insert(0) += 1;
            unique.entry(key).or_insert(t);
        }
        for (key, t) in unique.iter_mut() {
            let n = multiplicity[key];
            if n > 1 {
                let count = self.sess.ast.num(n as f64);
                t.factors.push(count);
            }
        }
        terms.extend(unique.into_values());
    }

    /// With no global rule, adopt symbols shared across terms as
    /// operands: first any symbol occurring in every term, otherwise a
    /// greedy pick of symbols covering at least two unassigned terms.
    fn heuristic_collection(&mut self, terms: &mut [Term]) {
        if terms.iter().any(|t| !t.operands.is_empty()) {
            return;
        }
        let mut tracker: IndexMap<String, Vec<usize>> = IndexMap::new();
        for (i, t) in terms.iter().enumerate() {
            for f in &t.factors {
                if matches!(self.sess.ast.node(*f), Node::Symbol(_)) {
                    let key = self.sess.ast.repr(*f);
                    let entry = tracker.entry(key).or_default();
                    if !entry.contains(&i) {
                        entry.push(i);
                    }
                }
            }
        }
        let mut chosen: Vec<(String, Vec<usize>)> = tracker
            .iter()
            .filter(|(_, ts)| ts.len() == terms.len())
            .map(|(s, ts)| (s.clone(), ts.clone()))
            .collect();
        if chosen.is_empty() {
            let mut handled: Vec<usize> = Vec::new();
            for (s, ts) in &tracker {
                if ts.len() > 1 && ts.iter().all(|t| !handled.contains(t)) {
                    chosen.push((s.clone(), ts.clone()));
                    handled.extend(ts.iter().copied());
                }
            }
        }
        for (sym_repr, ts) in chosen {
            for i in ts {
                let t = &mut terms[i];
                let picked: Vec<NodeId> = t
                    .factors
                    .iter()
                    .copied()
                    .filter(|f| self.sess.ast.repr(*f) == sym_repr)
                    .collect();
                t.factors.retain(|f| self.sess.ast.repr(*f) != sym_repr);
                t.add_operands(&self.sess.ast, &picked);
            }
        }
    }

    /// Ad-hoc mode: refuse to collect a term whose factors contain a
    /// co-operand forbidden for its operand symbol.
    fn adhoc_forbids(&self, term: &Term) -> bool {
        if self.opts.adhoc.is_empty() || term.operands.len() != 1 {
            return false;
        }
        let Some(op_sym) = self.sess.ast.as_symbol(term.operands[0]) else {
            return false;
        };
        let Some(name) = op_sym.name() else {
            return false;
        };
        let Some(allowed) = self.opts.adhoc.get(name) else {
            return false;
        };
        if allowed.is_empty() {
            return false;
        }
        for f in &term.factors {
            for s in navigate::symbol_names_in(&self.sess.ast, *f) {
                if !allowed.contains(&s) {
                    return true;
                }
            }
        }
        false
    }
}

/// Predicate for ad-hoc mode: symbols named in the map are collected.
pub(crate) fn adhoc_pred(adhoc: &IndexMap<String, Vec<String>>) -> impl Fn(&Symbol) -> bool + '_ {
    move |s: &Symbol| match &s.atom {
        Atom::Var(n) => adhoc.contains_key(n),
        Atom::Num(_) => false,
    }
}
