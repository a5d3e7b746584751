//! Arena AST for C-like numeric kernels.
//!
//! Nodes live in a flat `Vec` and refer to their children by `NodeId`,
//! so a parent can be rewritten without chasing ownership cycles. Every
//! `Symbol` occurrence is its own node: two references to the same array
//! at different index tuples are distinct nodes with distinct ids.

pub mod display;
pub mod navigate;

use serde::{Deserialize, Serialize};

// ─── Node identity ────────────────────────────────────────────────

/// Index of a node in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ─── Scalar model ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    Double,
    Float,
    Int,
}

impl ScalarType {
    pub fn as_c(self) -> &'static str {
        match self {
            ScalarType::Double => "double",
            ScalarType::Float => "float",
            ScalarType::Int => "int",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Qualifier {
    Static,
    Const,
    Restrict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Local,
    External,
}

// ─── Symbols ──────────────────────────────────────────────────────

/// What a symbol names: a variable or a numeric literal.
/// Literals are symbols so that constant folding and factorization
/// treat them uniformly with variables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Atom {
    Var(String),
    Num(f64),
}

/// One entry of a symbol's rank: a loop dimension or a constant index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Index {
    Dim(String),
    Num(i64),
}

impl Index {
    pub fn as_dim(&self) -> Option<&str> {
        match self {
            Index::Dim(d) => Some(d),
            Index::Num(_) => None,
        }
    }
}

/// A symbol occurrence: atom plus the index tuple it is accessed with.
/// `offset` holds an optional per-rank `(stride, base)` affine access.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub atom: Atom,
    pub rank: Vec<Index>,
    pub offset: Option<Vec<(i64, i64)>>,
}

impl Symbol {
    pub fn var(name: &str, dims: &[&str]) -> Self {
        Symbol {
            atom: Atom::Var(name.to_string()),
            rank: dims.iter().map(|d| Index::Dim(d.to_string())).collect(),
            offset: None,
        }
    }

    pub fn scalar(name: &str) -> Self {
        Symbol::var(name, &[])
    }

    pub fn num(value: f64) -> Self {
        Symbol {
            atom: Atom::Num(value),
            rank: Vec::new(),
            offset: None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match &self.atom {
            Atom::Var(n) => Some(n),
            Atom::Num(_) => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self.atom {
            Atom::Num(v) => Some(v),
            Atom::Var(_) => None,
        }
    }

    /// Loop dimensions appearing in the rank, in rank order.
    pub fn loop_dims(&self) -> Vec<&str> {
        self.rank.iter().filter_map(|r| r.as_dim()).collect()
    }

    /// True for literals and for symbols indexed only by constants.
    pub fn is_const(&self) -> bool {
        match self.atom {
            Atom::Num(_) => true,
            Atom::Var(_) => self.rank.iter().all(|r| matches!(r, Index::Num(_))),
        }
    }
}

// ─── Operators ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        }
    }
}

/// Statement forms that write through their left-hand side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Assign,
    Incr,
    Decr,
    IMul,
    IDiv,
}

impl WriteOp {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteOp::Assign => "=",
            WriteOp::Incr => "+=",
            WriteOp::Decr => "-=",
            WriteOp::IMul => "*=",
            WriteOp::IDiv => "/=",
        }
    }

    /// Reductions accumulate into the left-hand side.
    pub fn is_reduction(self) -> bool {
        !matches!(self, WriteOp::Assign)
    }
}

/// Trip count of a loop, possibly symbolic.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Extent {
    Const(u64),
    Sym(String),
}

impl Extent {
    pub fn as_const(&self) -> Option<u64> {
        match self {
            Extent::Const(n) => Some(*n),
            Extent::Sym(_) => None,
        }
    }
}

// ─── Nodes ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Symbol(Symbol),
    Bin {
        op: BinOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Neg(NodeId),
    Par(NodeId),
    FunCall {
        name: String,
        args: Vec<NodeId>,
    },
    Ternary {
        cond: NodeId,
        then_val: NodeId,
        else_val: NodeId,
    },
    Writer {
        op: WriteOp,
        lhs: NodeId,
        rhs: NodeId,
        pragma: Option<String>,
    },
    Decl {
        ty: ScalarType,
        name: String,
        rank: Vec<Extent>,
        init: Option<NodeId>,
        quals: Vec<Qualifier>,
        scope: Scope,
    },
    For {
        dim: String,
        start: i64,
        extent: Extent,
        step: i64,
        body: NodeId,
        pragma: Option<String>,
    },
    Block {
        children: Vec<NodeId>,
        open_scope: bool,
    },
    Root {
        children: Vec<NodeId>,
    },
    /// Verbatim text passed through untouched.
    FlatBlock(String),
    /// A dense numeric table (row-major), used as a declaration init.
    Table {
        dims: Vec<u64>,
        values: Vec<f64>,
    },
}

// ─── Arena ────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Ast {
    nodes: Vec<Node>,
}

impl Ast {
    pub fn new() -> Self {
        Ast { nodes: Vec::new() }
    }

    pub fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ── Builders ──────────────────────────────────────────────────

    pub fn symbol(&mut self, sym: Symbol) -> NodeId {
        self.push(Node::Symbol(sym))
    }

    pub fn var(&mut self, name: &str, dims: &[&str]) -> NodeId {
        self.push(Node::Symbol(Symbol::var(name, dims)))
    }

    pub fn num(&mut self, value: f64) -> NodeId {
        self.push(Node::Symbol(Symbol::num(value)))
    }

    pub fn bin(&mut self, op: BinOp, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.push(Node::Bin { op, lhs, rhs })
    }

    pub fn sum(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.bin(BinOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.bin(BinOp::Sub, lhs, rhs)
    }

    pub fn prod(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.bin(BinOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.bin(BinOp::Div, lhs, rhs)
    }

    pub fn neg(&mut self, child: NodeId) -> NodeId {
        self.push(Node::Neg(child))
    }

    pub fn par(&mut self, child: NodeId) -> NodeId {
        self.push(Node::Par(child))
    }

    pub fn writer(&mut self, op: WriteOp, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.push(Node::Writer {
            op,
            lhs,
            rhs,
            pragma: None,
        })
    }

    pub fn decl(&mut self, ty: ScalarType, name: &str, rank: Vec<Extent>) -> NodeId {
        self.push(Node::Decl {
            ty,
            name: name.to_string(),
            rank,
            init: None,
            quals: Vec::new(),
            scope: Scope::Local,
        })
    }

    pub fn for_loop(&mut self, dim: &str, extent: Extent, body: NodeId) -> NodeId {
        self.push(Node::For {
            dim: dim.to_string(),
            start: 0,
            extent,
            step: 1,
            body,
            pragma: None,
        })
    }

    pub fn block(&mut self, children: Vec<NodeId>) -> NodeId {
        self.push(Node::Block {
            children,
            open_scope: false,
        })
    }

    pub fn root(&mut self, children: Vec<NodeId>) -> NodeId {
        self.push(Node::Root { children })
    }

    /// Left-associated chain of `op` over `parts`. A single part is
    /// returned as is; an empty chain is a literal 1 for products and
    /// 0 for sums.
    pub fn chain(&mut self, op: BinOp, parts: Vec<NodeId>) -> NodeId {
        let mut iter = parts.into_iter();
        let first = match iter.next() {
            Some(p) => p,
            None => {
                let unit = if op == BinOp::Mul { 1.0 } else { 0.0 };
                return self.num(unit);
            }
        };
        iter.fold(first, |acc, p| self.bin(op, acc, p))
    }

    // ── Structure queries ─────────────────────────────────────────

    /// Children of `id`, in syntactic order.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        match self.node(id) {
            Node::Symbol(_) | Node::FlatBlock(_) | Node::Table { .. } => Vec::new(),
            Node::Bin { lhs, rhs, .. } => vec![*lhs, *rhs],
            Node::Neg(c) | Node::Par(c) => vec![*c],
            Node::FunCall { args, .. } => args.clone(),
            Node::Ternary {
                cond,
                then_val,
                else_val,
            } => vec![*cond, *then_val, *else_val],
            Node::Writer { lhs, rhs, .. } => vec![*lhs, *rhs],
            Node::Decl { init, .. } => init.iter().copied().collect(),
            Node::For { body, .. } => vec![*body],
            Node::Block { children, .. } => children.clone(),
            Node::Root { children } => children.clone(),
        }
    }

    /// Overwrite the `idx`-th child slot of `parent`.
    pub fn set_child(&mut self, parent: NodeId, idx: usize, new: NodeId) {
        match self.node_mut(parent) {
            Node::Bin { lhs, rhs, .. } => *[lhs, rhs][idx] = new,
            Node::Neg(c) | Node::Par(c) => {
                debug_assert_eq!(idx, 0);
                *c = new;
            }
            Node::FunCall { args, .. } => args[idx] = new,
            Node::Ternary {
                cond,
                then_val,
                else_val,
            } => *[cond, then_val, else_val][idx] = new,
            Node::Writer { lhs, rhs, .. } => *[lhs, rhs][idx] = new,
            Node::Decl { init, .. } => *init = Some(new),
            Node::For { body, .. } => *body = new,
            Node::Block { children, .. } => children[idx] = new,
            Node::Root { children } => children[idx] = new,
            Node::Symbol(_) | Node::FlatBlock(_) | Node::Table { .. } => {
                unreachable!("leaf nodes have no child slots")
            }
        }
    }

    /// Replace `old` with `new` wherever it appears as a direct child
    /// of `parent`. Returns true if a slot was rewritten.
    pub fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) -> bool {
        let children = self.children(parent);
        let mut hit = false;
        for (i, c) in children.iter().enumerate() {
            if *c == old {
                self.set_child(parent, i, new);
                hit = true;
            }
        }
        hit
    }

    /// Deep-copy the subtree rooted at `id`, producing fresh node
    /// identities throughout.
    pub fn clone_subtree(&mut self, id: NodeId) -> NodeId {
        let node = self.node(id).clone();
        let copy = match node {
            Node::Symbol(_) | Node::FlatBlock(_) | Node::Table { .. } => node,
            Node::Bin { op, lhs, rhs } => {
                let lhs = self.clone_subtree(lhs);
                let rhs = self.clone_subtree(rhs);
                Node::Bin { op, lhs, rhs }
            }
            Node::Neg(c) => {
                let c = self.clone_subtree(c);
                Node::Neg(c)
            }
            Node::Par(c) => {
                let c = self.clone_subtree(c);
                Node::Par(c)
            }
            Node::FunCall { name, args } => {
                let args = args.into_iter().map(|a| self.clone_subtree(a)).collect();
                Node::FunCall { name, args }
            }
            Node::Ternary {
                cond,
                then_val,
                else_val,
            } => {
                let cond = self.clone_subtree(cond);
                let then_val = self.clone_subtree(then_val);
                let else_val = self.clone_subtree(else_val);
                Node::Ternary {
                    cond,
                    then_val,
                    else_val,
                }
            }
            Node::Writer {
                op,
                lhs,
                rhs,
                pragma,
            } => {
                let lhs = self.clone_subtree(lhs);
                let rhs = self.clone_subtree(rhs);
                Node::Writer {
                    op,
                    lhs,
                    rhs,
                    pragma,
                }
            }
            Node::Decl {
                ty,
                name,
                rank,
                init,
                quals,
                scope,
            } => {
                let init = init.map(|i| self.clone_subtree(i));
                Node::Decl {
                    ty,
                    name,
                    rank,
                    init,
                    quals,
                    scope,
                }
            }
            Node::For {
                dim,
                start,
                extent,
                step,
                body,
                pragma,
            } => {
                let body = self.clone_subtree(body);
                Node::For {
                    dim,
                    start,
                    extent,
                    step,
                    body,
                    pragma,
                }
            }
            Node::Block {
                children,
                open_scope,
            } => {
                let children = children
                    .into_iter()
                    .map(|c| self.clone_subtree(c))
                    .collect();
                Node::Block {
                    children,
                    open_scope,
                }
            }
            Node::Root { children } => {
                let children = children
                    .into_iter()
                    .map(|c| self.clone_subtree(c))
                    .collect();
                Node::Root { children }
            }
        };
        self.push(copy)
    }

    /// Structural equality of two subtrees, independent of node ids.
    pub fn subtree_eq(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return true;
        }
        match (self.node(a), self.node(b)) {
            (Node::Symbol(x), Node::Symbol(y)) => x == y,
            (Node::FlatBlock(x), Node::FlatBlock(y)) => x == y,
            (
                Node::Table { dims: d1, values: v1 },
                Node::Table { dims: d2, values: v2 },
            ) => d1 == d2 && v1 == v2,
            (Node::Bin { op: o1, .. }, Node::Bin { op: o2, .. }) if o1 != o2 => false,
            (Node::Writer { op: o1, .. }, Node::Writer { op: o2, .. }) if o1 != o2 => false,
            (
                Node::For {
                    dim: d1,
                    start: s1,
                    extent: e1,
                    step: t1,
                    ..
                },
                Node::For {
                    dim: d2,
                    start: s2,
                    extent: e2,
                    step: t2,
                    ..
                },
            ) if (d1, s1, e1, t1) != (d2, s2, e2, t2) => false,
            (
                Node::FunCall { name: n1, .. },
                Node::FunCall { name: n2, .. },
            ) if n1 != n2 => false,
            (
                Node::Decl {
                    ty: t1,
                    name: n1,
                    rank: r1,
                    quals: q1,
                    ..
                },
                Node::Decl {
                    ty: t2,
                    name: n2,
                    rank: r2,
                    quals: q2,
                    ..
                },
            ) if (t1, n1, r1, q1) != (t2, n2, r2, q2) => false,
            (x, y) if std::mem::discriminant(x) != std::mem::discriminant(y) => false,
            _ => {
                let ca = self.children(a);
                let cb = self.children(b);
                ca.len() == cb.len()
                    && ca.iter().zip(cb.iter()).all(|(x, y)| self.subtree_eq(*x, *y))
            }
        }
    }

    // ── Occurrence replacement ────────────────────────────────────

    /// Replace every subtree below `root` that is structurally equal
    /// to `needle` with a fresh copy of `replacement`. Matching
    /// subtrees are not descended into. Returns the ids of the copies
    /// inserted, one per replacement.
    pub fn replace_matching(
        &mut self,
        root: NodeId,
        needle: NodeId,
        replacement: NodeId,
    ) -> Vec<NodeId> {
        let mut inserted = Vec::new();
        self.replace_matching_inner(root, needle, replacement, &mut inserted);
        inserted
    }

    fn replace_matching_inner(
        &mut self,
        root: NodeId,
        needle: NodeId,
        replacement: NodeId,
        inserted: &mut Vec<NodeId>,
    ) {
        let children = self.children(root);
        for (i, c) in children.into_iter().enumerate() {
            if self.subtree_eq(c, needle) {
                let copy = self.clone_subtree(replacement);
                self.set_child(root, i, copy);
                inserted.push(copy);
            } else {
                self.replace_matching_inner(c, needle, replacement, inserted);
            }
        }
    }

    /// Replace the single occurrence of the node `target` (by identity)
    /// below `root`. Returns true if found.
    pub fn replace_id(&mut self, root: NodeId, target: NodeId, new: NodeId) -> bool {
        let children = self.children(root);
        for (i, c) in children.into_iter().enumerate() {
            if c == target {
                self.set_child(root, i, new);
                return true;
            }
            if self.replace_id(c, target, new) {
                return true;
            }
        }
        false
    }

    // ── Block surgery ─────────────────────────────────────────────

    /// Mutable access to the child list of a Block or Root.
    pub fn block_children_mut(&mut self, id: NodeId) -> &mut Vec<NodeId> {
        match self.node_mut(id) {
            Node::Block { children, .. } | Node::Root { children } => children,
            other => panic!("expected block-like node, found {:?}", other),
        }
    }

    pub fn block_children(&self, id: NodeId) -> &[NodeId] {
        match self.node(id) {
            Node::Block { children, .. } | Node::Root { children } => children,
            other => panic!("expected block-like node, found {:?}", other),
        }
    }

    /// Body block of a For node.
    pub fn loop_body(&self, id: NodeId) -> NodeId {
        match self.node(id) {
            Node::For { body, .. } => *body,
            other => panic!("expected For, found {:?}", other),
        }
    }

    pub fn loop_dim(&self, id: NodeId) -> &str {
        match self.node(id) {
            Node::For { dim, .. } => dim,
            other => panic!("expected For, found {:?}", other),
        }
    }

    pub fn loop_extent(&self, id: NodeId) -> &Extent {
        match self.node(id) {
            Node::For { extent, .. } => extent,
            other => panic!("expected For, found {:?}", other),
        }
    }

    /// Affine-increment check: the only loops the rewriter touches.
    pub fn loop_is_linear(&self, id: NodeId) -> bool {
        match self.node(id) {
            Node::For { step, .. } => *step >= 1,
            _ => false,
        }
    }

    /// A copy of the loop header of `template` wrapped around `body`.
    pub fn wrap_in_loop(&mut self, template: NodeId, stmts: Vec<NodeId>) -> NodeId {
        let (dim, start, extent, step) = match self.node(template) {
            Node::For {
                dim,
                start,
                extent,
                step,
                ..
            } => (dim.clone(), *start, extent.clone(), *step),
            other => panic!("expected For, found {:?}", other),
        };
        let body = self.block(stmts);
        self.push(Node::For {
            dim,
            start,
            extent,
            step,
            body,
            pragma: None,
        })
    }

    pub fn writer_parts(&self, id: NodeId) -> Option<(WriteOp, NodeId, NodeId)> {
        match self.node(id) {
            Node::Writer { op, lhs, rhs, .. } => Some((*op, *lhs, *rhs)),
            _ => None,
        }
    }

    pub fn writer_rhs(&self, id: NodeId) -> NodeId {
        self.writer_parts(id).expect("writer statement").2
    }

    pub fn writer_lhs(&self, id: NodeId) -> NodeId {
        self.writer_parts(id).expect("writer statement").1
    }

    pub fn set_writer_rhs(&mut self, id: NodeId, new_rhs: NodeId) {
        match self.node_mut(id) {
            Node::Writer { rhs, .. } => *rhs = new_rhs,
            other => panic!("expected Writer, found {:?}", other),
        }
    }

    pub fn as_symbol(&self, id: NodeId) -> Option<&Symbol> {
        match self.node(id) {
            Node::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_symbol_mut(&mut self, id: NodeId) -> Option<&mut Symbol> {
        match self.node_mut(id) {
            Node::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn decl_name(&self, id: NodeId) -> &str {
        match self.node(id) {
            Node::Decl { name, .. } => name,
            other => panic!("expected Decl, found {:?}", other),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small_expr(ast: &mut Ast) -> NodeId {
        // X[i]*Y[j] + X[i]*Y[j]
        let x1 = ast.var("X", &["i"]);
        let y1 = ast.var("Y", &["j"]);
        let p1 = ast.prod(x1, y1);
        let x2 = ast.var("X", &["i"]);
        let y2 = ast.var("Y", &["j"]);
        let p2 = ast.prod(x2, y2);
        ast.sum(p1, p2)
    }

    #[test]
    fn test_subtree_eq_ignores_identity() {
        let mut ast = Ast::new();
        let e = small_expr(&mut ast);
        let (l, r) = match ast.node(e) {
            Node::Bin { lhs, rhs, .. } => (*lhs, *rhs),
            _ => unreachable!(),
        };
        assert_ne!(l, r);
        assert!(ast.subtree_eq(l, r));
    }

    #[test]
    fn test_clone_subtree_is_fresh() {
        let mut ast = Ast::new();
        let e = small_expr(&mut ast);
        let before = ast.len();
        let copy = ast.clone_subtree(e);
        assert!(ast.len() > before);
        assert_ne!(copy, e);
        assert!(ast.subtree_eq(copy, e));
    }

    #[test]
    fn test_replace_matching_counts_occurrences() {
        let mut ast = Ast::new();
        let e = small_expr(&mut ast);
        let x = ast.var("X", &["i"]);
        let y = ast.var("Y", &["j"]);
        let needle = ast.prod(x, y);
        let t = ast.var("t", &[]);
        let inserted = ast.replace_matching(e, needle, t);
        assert_eq!(inserted.len(), 2);
        for id in inserted {
            assert_eq!(ast.as_symbol(id).and_then(|s| s.name()), Some("t"));
        }
    }

    #[test]
    fn test_replace_matching_does_not_descend_into_match() {
        let mut ast = Ast::new();
        // (a*b)*(a*b): replacing a*b must yield t*t, not touch inners
        let a1 = ast.var("a", &[]);
        let b1 = ast.var("b", &[]);
        let p1 = ast.prod(a1, b1);
        let a2 = ast.var("a", &[]);
        let b2 = ast.var("b", &[]);
        let p2 = ast.prod(a2, b2);
        let top = ast.prod(p1, p2);
        let a = ast.var("a", &[]);
        let b = ast.var("b", &[]);
        let needle = ast.prod(a, b);
        let t = ast.var("t", &[]);
        let inserted = ast.replace_matching(top, needle, t);
        assert_eq!(inserted.len(), 2);
    }

    #[test]
    fn test_chain_builders() {
        let mut ast = Ast::new();
        let a = ast.var("a", &[]);
        let b = ast.var("b", &[]);
        let c = ast.var("c", &[]);
        let chain = ast.chain(BinOp::Mul, vec![a, b, c]);
        match ast.node(chain) {
            Node::Bin { op: BinOp::Mul, lhs, .. } => {
                assert!(matches!(ast.node(*lhs), Node::Bin { op: BinOp::Mul, .. }));
            }
            other => panic!("expected product chain, found {:?}", other),
        }
        let empty = ast.chain(BinOp::Mul, vec![]);
        assert_eq!(ast.as_symbol(empty).and_then(|s| s.as_num()), Some(1.0));
    }

    #[test]
    fn test_symbol_is_const() {
        assert!(Symbol::num(2.0).is_const());
        assert!(Symbol {
            atom: Atom::Var("W".into()),
            rank: vec![Index::Num(0)],
            offset: None,
        }
        .is_const());
        assert!(!Symbol::var("A", &["i"]).is_const());
    }

    #[test]
    fn test_wrap_in_loop_copies_header() {
        let mut ast = Ast::new();
        let body = ast.block(vec![]);
        let template = ast.for_loop("i", Extent::Const(4), body);
        let s = ast.var("t", &["i"]);
        let zero = ast.num(0.0);
        let init = ast.writer(WriteOp::Assign, s, zero);
        let wrapped = ast.wrap_in_loop(template, vec![init]);
        assert_eq!(ast.loop_dim(wrapped), "i");
        assert_eq!(ast.loop_extent(wrapped), &Extent::Const(4));
        assert_eq!(ast.block_children(ast.loop_body(wrapped)).len(), 1);
    }
}
