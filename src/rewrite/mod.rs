//! The expression rewriter.
//!
//! `Rewriter` composes the transformation passes over one target
//! writer statement: loop-invariant code motion, expansion,
//! factorization, reassociation, division replacement, reduction
//! pre-evaluation, sharing-graph rewriting, and CSE unpicking. Every
//! mutating pass reports its FLOP delta to the session log.

pub mod expand;
pub mod extract;
pub mod factorize;
pub mod hoist;
pub mod preevaluate;
pub mod sharing;
pub mod unpick;

use indexmap::IndexMap;

use crate::analysis::lda_by_name;
use crate::ast::{navigate, Atom, BinOp, Node, NodeId, Symbol};
use crate::cost::{flops, PassRecord, RecordSink};
use crate::error::Result;
use crate::meta::MetaExpr;
use crate::session::Session;

pub use expand::ExpandOptions;
pub use extract::{Extracted, HoistMode};
pub use factorize::FactorizeOptions;
pub use hoist::LicmOptions;
pub use sharing::{CoverSolver, GreedyCover};

/// Expansion strategies.
#[derive(Clone, Debug)]
pub enum ExpandMode {
    /// Along the dimension tuple occurring most often in the symbols.
    Standard,
    /// Along the given dimensions.
    Dimensions(Vec<String>),
    /// Symbols depending on any of the expression's dimensions.
    All,
    /// Symbols depending on the domain dimensions.
    Domain,
    /// Symbols not confined to the domain dimensions.
    Outdomain,
}

/// Factorization strategies, mirroring the expansion strategies plus
/// collection of constants, caller-directed ad-hoc collection, and the
/// per-sum heuristic.
#[derive(Clone, Debug)]
pub enum FactorMode {
    Standard,
    Dimensions(Vec<String>),
    All,
    Domain,
    Outdomain,
    Constants,
    Adhoc(IndexMap<String, Vec<String>>),
    Heuristic,
}

pub struct Rewriter<'s> {
    pub(crate) sess: &'s mut Session,
    pub(crate) stmt: NodeId,
    pub(crate) info: MetaExpr,
    expr_id: u32,
    licm_round: u32,
}

impl<'s> Rewriter<'s> {
    pub fn new(sess: &'s mut Session, stmt: NodeId, info: MetaExpr) -> Self {
        let expr_id = sess.next_expr_id();
        Rewriter {
            sess,
            stmt,
            info,
            expr_id,
            licm_round: 0,
        }
    }

    pub fn session(&mut self) -> &mut Session {
        self.sess
    }

    pub fn info(&self) -> &MetaExpr {
        &self.info
    }

    fn rhs(&self) -> NodeId {
        self.sess.ast.writer_rhs(self.stmt)
    }

    fn target_name(&self) -> String {
        self.sess.ast.repr(self.sess.ast.writer_lhs(self.stmt))
    }

    fn record(&mut self, pass: &str, before: u64) {
        let after = flops(&self.sess.ast, self.rhs());
        let target = self.target_name();
        self.sess.log.record(PassRecord {
            pass: pass.to_string(),
            target,
            flops_before: before,
            flops_after: after,
        });
    }

    // ── Loop-invariant code motion ────────────────────────────────

    /// Hoist subexpressions per `mode`. Product chains are
    /// canonicalized first so textual deduplication of hoistable
    /// subtrees is stable.
    pub fn licm(&mut self, mode: HoistMode, opts: &LicmOptions) -> Result<&mut Self> {
        let before = flops(&self.sess.ast, self.rhs());
        self.reassociate();
        let round = self.licm_round;
        let mut hoister =
            hoist::Hoister::new(self.sess, self.stmt, &self.info, self.expr_id);
        hoister.set_round(round);
        hoister.licm(mode, opts)?;
        self.licm_round = hoister.round();
        self.record(&format!("licm:{}", mode.as_str()), before);
        Ok(self)
    }

    /// Look-ahead projection of the hoistable groups, no mutation.
    pub fn hoistable(&mut self, mode: HoistMode) -> Extracted {
        let lda = crate::analysis::lda_by_occurrence(&self.sess.ast, self.sess.root);
        let mut hoister =
            hoist::Hoister::new(self.sess, self.stmt, &self.info, self.expr_id);
        hoister.extract(mode, &lda)
    }

    // ── Expansion ─────────────────────────────────────────────────

    pub fn expand(&mut self, mode: ExpandMode, opts: ExpandOptions) -> Result<&mut Self> {
        let Some(pred) = self.symbol_pred(PredRule::from_expand(&mode)) else {
            return Ok(self);
        };
        let before = flops(&self.sess.ast, self.rhs());
        let handler_id = self.sess.next_handler_id();
        let mut expander =
            expand::Expander::new(self.sess, self.stmt, &self.info, handler_id);
        expander.expand(&*pred, opts);
        self.record("expand", before);
        Ok(self)
    }

    pub fn expand_all(&mut self, opts: ExpandOptions) -> &mut Self {
        let _ = self.expand(ExpandMode::All, opts);
        self
    }

    // ── Factorization ─────────────────────────────────────────────

    pub fn factorize(&mut self, mode: FactorMode) -> Result<&mut Self> {
        let (rule, opts) = match mode {
            FactorMode::Standard => (PredRule::Standard, FactorizeOptions::default()),
            FactorMode::Dimensions(d) => (PredRule::Dimensions(d), FactorizeOptions::default()),
            FactorMode::All => (PredRule::All, FactorizeOptions::default()),
            FactorMode::Domain => (PredRule::Domain, FactorizeOptions::default()),
            FactorMode::Outdomain => (PredRule::Outdomain, FactorizeOptions::default()),
            FactorMode::Constants => (PredRule::Constants, FactorizeOptions::default()),
            FactorMode::Heuristic => (
                PredRule::Nothing,
                FactorizeOptions {
                    heuristic: true,
                    ..Default::default()
                },
            ),
            FactorMode::Adhoc(adhoc) => {
                let opts = FactorizeOptions {
                    heuristic: false,
                    adhoc: adhoc.clone(),
                };
                (PredRule::Adhoc(adhoc), opts)
            }
        };
        let Some(pred) = self.symbol_pred(rule) else {
            return Ok(self);
        };
        let before = flops(&self.sess.ast, self.rhs());
        let mut factorizer = factorize::Factorizer::new(self.sess, self.stmt, opts);
        factorizer.factorize(&*pred);
        self.record("factorize", before);
        Ok(self)
    }

    pub fn factorize_adhoc(&mut self, adhoc: IndexMap<String, Vec<String>>) -> &mut Self {
        let _ = self.factorize(FactorMode::Adhoc(adhoc));
        self
    }

    pub fn factorize_heuristic(&mut self) -> &mut Self {
        let _ = self.factorize(FactorMode::Heuristic);
        self
    }

    // ── Reassociation ─────────────────────────────────────────────

    /// Canonicalize product chains: recursed non-symbol operands
    /// first, then symbols ordered by `(rank, atom)`.
    pub fn reassociate(&mut self) -> &mut Self {
        let rhs = self.rhs();
        reassociate_node(self.sess, rhs, self.stmt);
        self
    }

    // ── Division replacement ──────────────────────────────────────

    /// `x / literal` becomes `x * (1/literal)`; any other divisor `d`
    /// becomes `x * (1 / d)`, exposing the product to factorization.
    pub fn replacediv(&mut self) -> &mut Self {
        let before = flops(&self.sess.ast, self.rhs());
        let rhs = self.rhs();
        let divs = navigate::divs_in(&self.sess.ast, rhs);
        for div in divs {
            let (lhs, denom) = match self.sess.ast.node(div) {
                Node::Bin {
                    op: BinOp::Div,
                    lhs,
                    rhs,
                } => (*lhs, *rhs),
                _ => continue,
            };
            let literal = self
                .sess
                .ast
                .as_symbol(denom)
                .and_then(|s| s.as_num())
                .filter(|v| *v != 0.0);
            let new = match literal {
                Some(v) => {
                    let inv = self.sess.ast.num(1.0 / v);
                    self.sess.ast.prod(lhs, inv)
                }
                None => {
                    let one = self.sess.ast.num(1.0);
                    let inv = self.sess.ast.div(one, denom);
                    self.sess.ast.prod(lhs, inv)
                }
            };
            if self.rhs() == div {
                self.sess.ast.set_writer_rhs(self.stmt, new);
            } else {
                self.sess.ast.replace_id(self.stmt, div, new);
            }
        }
        self.record("replacediv", before);
        self
    }

    // ── Reduction pre-evaluation ──────────────────────────────────

    pub fn preevaluate(&mut self) -> Result<&mut Self> {
        let before = flops(&self.sess.ast, self.rhs());
        preevaluate::preevaluate(self.sess, self.stmt, &mut self.info)?;
        self.record("preevaluate", before);
        Ok(self)
    }

    // ── Sharing-graph rewrite ─────────────────────────────────────

    pub fn sgrewrite(&mut self) -> Result<&mut Self> {
        self.sgrewrite_with(&GreedyCover)
    }

    pub fn sgrewrite_with(&mut self, solver: &dyn CoverSolver) -> Result<&mut Self> {
        let rhs = self.rhs();
        let sg = sharing::SharingGraph::build(&self.sess.ast, &self.info, rhs);
        if sg.edges.is_empty() {
            return Ok(self);
        }
        let Some(order) = sg.factorization_order(solver) else {
            // Unsolvable instance: heuristic fallback
            self.sess.log.note(crate::cost::Note {
                pass: "sgrewrite".into(),
                message: "cover instance unsolved, using heuristic factorization".into(),
            });
            self.factorize(FactorMode::Heuristic)?;
            self.licm(HoistMode::OnlyOutdomain, &LicmOptions::default())?;
            return Ok(self);
        };
        self.expand(
            ExpandMode::Domain,
            ExpandOptions {
                not_aggregate: true,
            },
        )?;
        for name in order {
            let mut adhoc = IndexMap::new();
            adhoc.insert(name, Vec::new());
            self.factorize(FactorMode::Adhoc(adhoc))?;
        }
        self.licm(HoistMode::Normal, &LicmOptions::default())?;
        Ok(self)
    }

    // ── CSE unpicking ─────────────────────────────────────────────

    pub fn unpick(&mut self) -> Result<&mut Self> {
        let before = flops(&self.sess.ast, self.rhs());
        let stmt = self.stmt;
        let info = self.info.clone();
        unpick::unpick(self.sess, stmt, &info)?;
        self.record("unpick", before);
        Ok(self)
    }

    // ── Predicate resolution ──────────────────────────────────────

    fn symbol_pred(&self, rule: PredRule) -> Option<Box<dyn Fn(&Symbol) -> bool>> {
        match rule {
            PredRule::Standard => {
                let rhs = self.sess.ast.writer_rhs(self.stmt);
                let dims = expand::standard_dimension(&self.sess.ast, &self.info, rhs)?;
                Some(Box::new(move |s: &Symbol| {
                    dims.iter().all(|d| s.loop_dims().iter().any(|x| x == d))
                }))
            }
            PredRule::Dimensions(dims) => Some(Box::new(move |s: &Symbol| {
                dims.iter().all(|d| s.loop_dims().iter().any(|x| x == d))
            })),
            PredRule::All => {
                let lda = lda_by_name(&self.sess.ast, self.sess.root);
                let dims = self.info.dims(&self.sess.ast);
                Some(Box::new(move |s: &Symbol| {
                    deps_of(&lda, s).is_some_and(|deps| deps.iter().any(|d| dims.contains(d)))
                }))
            }
            PredRule::Domain => {
                let lda = lda_by_name(&self.sess.ast, self.sess.root);
                let domain = self.info.domain_dims().to_vec();
                Some(Box::new(move |s: &Symbol| {
                    deps_of(&lda, s).is_some_and(|deps| deps.iter().any(|d| domain.contains(d)))
                }))
            }
            PredRule::Outdomain => {
                let lda = lda_by_name(&self.sess.ast, self.sess.root);
                let domain = self.info.domain_dims().to_vec();
                Some(Box::new(move |s: &Symbol| {
                    deps_of(&lda, s)
                        .is_some_and(|deps| !deps.iter().all(|d| domain.contains(d)))
                }))
            }
            PredRule::Constants => {
                let lda = lda_by_name(&self.sess.ast, self.sess.root);
                Some(Box::new(move |s: &Symbol| {
                    deps_of(&lda, s).map(|deps| deps.is_empty()).unwrap_or(true)
                }))
            }
            PredRule::Adhoc(adhoc) => Some(Box::new(move |s: &Symbol| match &s.atom {
                Atom::Var(n) => adhoc.contains_key(n),
                Atom::Num(_) => false,
            })),
            PredRule::Nothing => Some(Box::new(|_: &Symbol| false)),
        }
    }
}

enum PredRule {
    Standard,
    Dimensions(Vec<String>),
    All,
    Domain,
    Outdomain,
    Constants,
    Adhoc(IndexMap<String, Vec<String>>),
    Nothing,
}

impl PredRule {
    fn from_expand(mode: &ExpandMode) -> Self {
        match mode {
            ExpandMode::Standard => PredRule::Standard,
            ExpandMode::Dimensions(d) => PredRule::Dimensions(d.clone()),
            ExpandMode::All => PredRule::All,
            ExpandMode::Domain => PredRule::Domain,
            ExpandMode::Outdomain => PredRule::Outdomain,
        }
    }
}

fn deps_of(
    lda: &IndexMap<String, indexmap::IndexSet<String>>,
    s: &Symbol,
) -> Option<Vec<String>> {
    let name = s.name()?;
    lda.get(name).map(|deps| deps.iter().cloned().collect())
}

/// Sort the symbols of every product chain by `(rank, atom)`:
/// constants and scalars drift left, array references right, making
/// textually-equal reorderings canonical.
fn reassociate_node(sess: &mut Session, id: NodeId, parent: NodeId) {
    match sess.ast.node(id) {
        Node::Symbol(_) | Node::Bin { op: BinOp::Div, .. } => {}
        Node::Par(c) => {
            let c = *c;
            reassociate_node(sess, c, id);
        }
        Node::Bin {
            op: BinOp::Mul, ..
        } => {
            let leaves = navigate::explore_chain(&sess.ast, id, BinOp::Mul);
            let (mut symbols, others): (Vec<NodeId>, Vec<NodeId>) = leaves
                .into_iter()
                .partition(|l| matches!(sess.ast.node(*l), Node::Symbol(_)));
            for n in &others {
                reassociate_node(sess, *n, id);
            }
            symbols.sort_by_key(|s| {
                let sym = sess.ast.as_symbol(*s).expect("symbol leaf");
                let rank: Vec<String> = sym
                    .rank
                    .iter()
                    .map(|r| match r {
                        crate::ast::Index::Dim(d) => d.clone(),
                        crate::ast::Index::Num(n) => n.to_string(),
                    })
                    .collect();
                let atom = match &sym.atom {
                    Atom::Num(v) => format!("\u{0}{}", v),
                    Atom::Var(n) => n.clone(),
                };
                (rank.len(), rank, atom)
            });
            let mut parts = others;
            parts.extend(symbols);
            let rebuilt = sess.ast.chain(BinOp::Mul, parts);
            if parent == id {
                return;
            }
            if !sess.ast.replace_id(parent, id, rebuilt) {
                // id was the direct rhs of a writer
                if sess.ast.writer_parts(parent).is_some() {
                    sess.ast.set_writer_rhs(parent, rebuilt);
                }
            }
        }
        _ => {
            for c in sess.ast.children(id) {
                reassociate_node(sess, c, id);
            }
        }
    }
}
