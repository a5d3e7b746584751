//! Textual rendering of AST subtrees.
//!
//! `repr` produces a deterministic single-line form used both for
//! display and as the equality key when deduplicating hoistable
//! subexpressions. `pretty` produces an indented listing for humans.

use super::{Ast, Atom, BinOp, Extent, Index, Node, NodeId, Qualifier, Symbol};

fn fmt_num(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

fn fmt_index(idx: &Index, offset: Option<(i64, i64)>) -> String {
    match idx {
        Index::Num(n) => format!("{}", n),
        Index::Dim(d) => match offset {
            None | Some((1, 0)) => d.clone(),
            Some((1, b)) => format!("{} + {}", d, b),
            Some((s, 0)) => format!("{}*{}", s, d),
            Some((s, b)) => format!("{}*{} + {}", s, d, b),
        },
    }
}

pub fn fmt_symbol(sym: &Symbol) -> String {
    let mut out = match &sym.atom {
        Atom::Var(n) => n.clone(),
        Atom::Num(v) => fmt_num(*v),
    };
    for (i, r) in sym.rank.iter().enumerate() {
        let ofs = sym.offset.as_ref().and_then(|o| o.get(i)).copied();
        out.push('[');
        out.push_str(&fmt_index(r, ofs));
        out.push(']');
    }
    out
}

fn precedence(op: BinOp) -> u8 {
    match op {
        BinOp::Add | BinOp::Sub => 1,
        BinOp::Mul | BinOp::Div => 2,
    }
}

impl Ast {
    /// Single-line textual form of the subtree at `id`.
    pub fn repr(&self, id: NodeId) -> String {
        match self.node(id) {
            Node::Symbol(s) => fmt_symbol(s),
            Node::Bin { op, lhs, rhs } => {
                let l = self.child_repr(*lhs, *op, false);
                let r = self.child_repr(*rhs, *op, true);
                format!("{} {} {}", l, op.as_str(), r)
            }
            Node::Neg(c) => {
                let inner = self.repr(*c);
                if matches!(self.node(*c), Node::Bin { .. }) {
                    format!("-({})", inner)
                } else {
                    format!("-{}", inner)
                }
            }
            Node::Par(c) => format!("({})", self.repr(*c)),
            Node::FunCall { name, args } => {
                let args: Vec<String> = args.iter().map(|a| self.repr(*a)).collect();
                format!("{}({})", name, args.join(", "))
            }
            Node::Ternary {
                cond,
                then_val,
                else_val,
            } => format!(
                "({} ? {} : {})",
                self.repr(*cond),
                self.repr(*then_val),
                self.repr(*else_val)
            ),
            Node::Writer { op, lhs, rhs, .. } => {
                format!("{} {} {};", self.repr(*lhs), op.as_str(), self.repr(*rhs))
            }
            Node::Decl {
                ty,
                name,
                rank,
                init,
                quals,
                ..
            } => {
                let mut out = String::new();
                for q in quals {
                    out.push_str(match q {
                        Qualifier::Static => "static ",
                        Qualifier::Const => "const ",
                        Qualifier::Restrict => "restrict ",
                    });
                }
                out.push_str(ty.as_c());
                out.push(' ');
                out.push_str(name);
                for r in rank {
                    match r {
                        Extent::Const(n) => out.push_str(&format!("[{}]", n)),
                        Extent::Sym(s) => out.push_str(&format!("[{}]", s)),
                    }
                }
                if let Some(i) = init {
                    out.push_str(" = ");
                    out.push_str(&self.repr(*i));
                }
                out.push(';');
                out
            }
            Node::For {
                dim,
                start,
                extent,
                step,
                body,
                ..
            } => {
                let bound = match extent {
                    Extent::Const(n) => format!("{}", *n as i64 + start),
                    Extent::Sym(s) => s.clone(),
                };
                let incr = if *step == 1 {
                    format!("{}++", dim)
                } else {
                    format!("{} += {}", dim, step)
                };
                format!(
                    "for (int {d} = {start}; {d} < {bound}; {incr}) {body}",
                    d = dim,
                    start = start,
                    bound = bound,
                    incr = incr,
                    body = self.repr(*body)
                )
            }
            Node::Block { children, .. } | Node::Root { children } => {
                let inner: Vec<String> = children.iter().map(|c| self.repr(*c)).collect();
                format!("{{ {} }}", inner.join(" "))
            }
            Node::FlatBlock(text) => text.clone(),
            Node::Table { dims, values } => fmt_table(dims, values),
        }
    }

    fn child_repr(&self, child: NodeId, parent_op: BinOp, is_rhs: bool) -> String {
        let inner = self.repr(child);
        if let Node::Bin { op, .. } = self.node(child) {
            let needs_paren = precedence(*op) < precedence(parent_op)
                || (is_rhs
                    && precedence(*op) == precedence(parent_op)
                    && matches!(op, BinOp::Sub | BinOp::Div));
            if needs_paren {
                return format!("({})", inner);
            }
        }
        inner
    }

    /// Indented multi-line listing of the subtree at `id`.
    pub fn pretty(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.pretty_inner(id, 0, &mut out);
        out
    }

    fn pretty_inner(&self, id: NodeId, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        match self.node(id) {
            Node::Root { children } | Node::Block { children, .. } => {
                for c in children.clone() {
                    self.pretty_inner(c, depth, out);
                }
            }
            Node::For {
                dim,
                start,
                extent,
                step,
                body,
                ..
            } => {
                let bound = match extent {
                    Extent::Const(n) => format!("{}", *n as i64 + start),
                    Extent::Sym(s) => s.clone(),
                };
                let incr = if *step == 1 {
                    format!("{}++", dim)
                } else {
                    format!("{} += {}", dim, step)
                };
                out.push_str(&format!(
                    "{pad}for (int {d} = {start}; {d} < {bound}; {incr}) {{\n",
                    pad = pad,
                    d = dim,
                    start = start,
                    bound = bound,
                    incr = incr
                ));
                self.pretty_inner(*body, depth + 1, out);
                out.push_str(&format!("{}}}\n", pad));
            }
            _ => {
                out.push_str(&pad);
                out.push_str(&self.repr(id));
                out.push('\n');
            }
        }
    }
}

fn fmt_table(dims: &[u64], values: &[f64]) -> String {
    fn rec(dims: &[u64], values: &[f64]) -> String {
        match dims.split_first() {
            None | Some((_, [])) => {
                let cells: Vec<String> = values.iter().map(|v| fmt_num(*v)).collect();
                format!("{{{}}}", cells.join(", "))
            }
            Some((first, rest)) => {
                let chunk = values.len() / *first as usize;
                let rows: Vec<String> = values.chunks(chunk).map(|c| rec(rest, c)).collect();
                format!("{{{}}}", rows.join(", "))
            }
        }
    }
    if dims.is_empty() {
        values.first().map(|v| fmt_num(*v)).unwrap_or_default()
    } else {
        rec(dims, values)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Ast, BinOp, Extent, Symbol, WriteOp};
    use super::*;

    #[test]
    fn test_symbol_repr() {
        assert_eq!(fmt_symbol(&Symbol::var("A", &["i", "j"])), "A[i][j]");
        assert_eq!(fmt_symbol(&Symbol::num(2.0)), "2");
        assert_eq!(fmt_symbol(&Symbol::num(0.5)), "0.5");
    }

    #[test]
    fn test_offset_repr() {
        let mut s = Symbol::var("A", &["i"]);
        s.offset = Some(vec![(2, 1)]);
        assert_eq!(fmt_symbol(&s), "A[2*i + 1]");
    }

    #[test]
    fn test_precedence_parens() {
        let mut ast = Ast::new();
        let a = ast.var("a", &[]);
        let b = ast.var("b", &[]);
        let s = ast.sum(a, b);
        let c = ast.var("c", &[]);
        let p = ast.prod(s, c);
        assert_eq!(ast.repr(p), "(a + b) * c");
    }

    #[test]
    fn test_product_repr_no_spurious_parens() {
        let mut ast = Ast::new();
        let a = ast.var("a", &[]);
        let b = ast.var("b", &[]);
        let c = ast.var("c", &[]);
        let chain = ast.chain(BinOp::Mul, vec![a, b, c]);
        assert_eq!(ast.repr(chain), "a * b * c");
    }

    #[test]
    fn test_writer_repr() {
        let mut ast = Ast::new();
        let lhs = ast.var("A", &["i", "j"]);
        let x = ast.var("X", &["i"]);
        let y = ast.var("Y", &["j"]);
        let rhs = ast.prod(x, y);
        let w = ast.writer(WriteOp::Incr, lhs, rhs);
        assert_eq!(ast.repr(w), "A[i][j] += X[i] * Y[j];");
    }

    #[test]
    fn test_for_pretty() {
        let mut ast = Ast::new();
        let lhs = ast.var("t", &["i"]);
        let x = ast.var("X", &["i"]);
        let w = ast.writer(WriteOp::Assign, lhs, x);
        let body = ast.block(vec![w]);
        let f = ast.for_loop("i", Extent::Const(3), body);
        let text = ast.pretty(f);
        assert!(text.contains("for (int i = 0; i < 3; i++) {"));
        assert!(text.contains("  t[i] = X[i];"));
    }

    #[test]
    fn test_table_repr() {
        assert_eq!(fmt_table(&[2, 2], &[1.0, 2.0, 3.0, 4.0]), "{{1, 2}, {3, 4}}");
        assert_eq!(fmt_table(&[3], &[1.0, 0.5, 2.0]), "{1, 0.5, 2}");
    }
}
