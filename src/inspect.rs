//! Kernel inspection.
//!
//! One traversal over the kernel collects the declaration table, the
//! loop nests, and the rewrite targets: writer statements tagged with
//! an assembly pragma, or, absent pragmas, the writers whose left-hand
//! side is indexed by enclosing loop dimensions. Inspection also
//! validates the input: affine loops only, declared symbols only,
//! recognized pragmas only.

use indexmap::IndexMap;

use crate::ast::{navigate, Ast, Node, NodeId, ScalarType};
use crate::error::{Result, RewriteError};
use crate::meta::MetaExpr;

/// A rewrite target: the writer statement and its metadata.
#[derive(Clone, Debug)]
pub struct Target {
    pub stmt: NodeId,
    pub info: MetaExpr,
}

/// Everything the rewriter needs to know about a kernel.
#[derive(Clone, Debug, Default)]
pub struct Inspection {
    /// Declarations by name, in declaration order.
    pub decls: IndexMap<String, NodeId>,
    /// All loops paired with their parent, in pre-order.
    pub fors: Vec<(NodeId, NodeId)>,
    /// Rewrite targets, in discovery order.
    pub targets: Vec<Target>,
}

/// Pragmas understood on `For` nodes.
const PRAGMA_INTEGRATION: &str = "pyop2 integration";
const PRAGMA_ITSPACE: &str = "pyop2 itspace";
/// Pragma prefix understood on writer statements.
const PRAGMA_ASSEMBLY: &str = "pyop2 assembly";

pub fn inspect(ast: &Ast, root: NodeId) -> Result<Inspection> {
    let mut out = Inspection::default();
    let mut stack: Vec<(NodeId, NodeId)> = Vec::new();
    walk(ast, root, root, &mut stack, &mut out)?;

    if out.targets.is_empty() {
        derive_targets(ast, root, &mut out)?;
    }

    check_declared(ast, root, &out)?;
    Ok(out)
}

fn walk(
    ast: &Ast,
    id: NodeId,
    parent: NodeId,
    stack: &mut Vec<(NodeId, NodeId)>,
    out: &mut Inspection,
) -> Result<()> {
    match ast.node(id) {
        Node::Decl { name, .. } => {
            out.decls.insert(name.clone(), id);
        }
        Node::For {
            step,
            body,
            pragma,
            dim,
            ..
        } => {
            if *step < 1 {
                return Err(RewriteError::malformed(format!(
                    "loop over `{}` has non-affine increment {}",
                    dim, step
                ))
                .with_context(ast.repr(id)));
            }
            if let Some(p) = pragma {
                if p != PRAGMA_INTEGRATION && p != PRAGMA_ITSPACE {
                    return Err(RewriteError::malformed(format!("unknown pragma `{}`", p))
                        .with_context(ast.repr(id)));
                }
            }
            out.fors.push((id, parent));
            stack.push((id, parent));
            walk(ast, *body, id, stack, out)?;
            stack.pop();
            return Ok(());
        }
        Node::Writer { pragma, .. } => {
            if let Some(p) = pragma.clone() {
                if let Some(args) = p.strip_prefix(PRAGMA_ASSEMBLY) {
                    let target = build_target(ast, id, args, stack)?;
                    out.targets.push(target);
                } else {
                    return Err(RewriteError::malformed(format!("unknown pragma `{}`", p))
                        .with_context(ast.repr(id)));
                }
            }
        }
        _ => {}
    }
    for c in ast.children(id) {
        walk(ast, c, id, stack, out)?;
    }
    Ok(())
}

fn build_target(
    ast: &Ast,
    stmt: NodeId,
    pragma_args: &str,
    stack: &[(NodeId, NodeId)],
) -> Result<Target> {
    if stack.is_empty() {
        return Err(
            RewriteError::malformed("assembly statement outside of any loop")
                .with_context(ast.repr(stmt)),
        );
    }
    let args = pragma_args.trim().trim_start_matches('(').trim_end_matches(')');
    let declared: Vec<&str> = args.split(',').map(|s| s.trim()).collect();
    let nest_dims: Vec<&str> = stack.iter().map(|(l, _)| ast.loop_dim(*l)).collect();
    for d in &declared {
        if !nest_dims.contains(d) {
            return Err(RewriteError::malformed(format!(
                "assembly dimension `{}` is not an enclosing loop",
                d
            ))
            .with_context(ast.repr(stmt)));
        }
    }
    // Domain dims in nest order, not pragma order
    let domain: Vec<String> = nest_dims
        .iter()
        .filter(|d| declared.contains(d))
        .map(|d| d.to_string())
        .collect();
    let ty = lhs_type(ast, stmt)?;
    Ok(Target {
        stmt,
        info: MetaExpr::new(ty, stack.to_vec(), domain),
    })
}

/// When no assembly pragma is present, treat every writer whose LHS is
/// indexed by enclosing loop dimensions as a target.
fn derive_targets(ast: &Ast, root: NodeId, out: &mut Inspection) -> Result<()> {
    fn rec(
        ast: &Ast,
        id: NodeId,
        parent: NodeId,
        stack: &mut Vec<(NodeId, NodeId)>,
        out: &mut Inspection,
    ) -> Result<()> {
        match ast.node(id) {
            Node::For { body, .. } => {
                stack.push((id, parent));
                rec(ast, *body, id, stack, out)?;
                stack.pop();
                Ok(())
            }
            Node::Writer { .. } => visit_writer(ast, id, stack, out),
            _ => {
                for c in ast.children(id) {
                    rec(ast, c, id, stack, out)?;
                }
                Ok(())
            }
        }
    }
    fn visit_writer(
        ast: &Ast,
        id: NodeId,
        stack: &[(NodeId, NodeId)],
        out: &mut Inspection,
    ) -> Result<()> {
        if stack.is_empty() {
            return Ok(());
        }
        let lhs = ast.writer_lhs(id);
        let lhs_dims: Vec<String> = ast
            .as_symbol(lhs)
            .map(|s| s.loop_dims().iter().map(|d| d.to_string()).collect())
            .unwrap_or_default();
        let domain: Vec<String> = stack
            .iter()
            .map(|(l, _)| ast.loop_dim(*l).to_string())
            .filter(|d| lhs_dims.contains(d))
            .collect();
        if !domain.is_empty() {
            let ty = lhs_type(ast, id)?;
            out.targets.push(Target {
                stmt: id,
                info: MetaExpr::new(ty, stack.to_vec(), domain),
            });
        }
        Ok(())
    }
    let mut stack: Vec<(NodeId, NodeId)> = Vec::new();
    rec(ast, root, root, &mut stack, out)
}

fn lhs_type(ast: &Ast, stmt: NodeId) -> Result<ScalarType> {
    let lhs = ast.writer_lhs(stmt);
    let name = ast
        .as_symbol(lhs)
        .and_then(|s| s.name())
        .ok_or_else(|| {
            RewriteError::malformed("writer left-hand side is not a symbol")
                .with_context(ast.repr(stmt))
        })?;
    Ok(find_decl_type(ast, name).unwrap_or(ScalarType::Double))
}

fn find_decl_type(ast: &Ast, name: &str) -> Option<ScalarType> {
    for id in (0..ast.len()).map(|i| NodeId(i as u32)) {
        if let Node::Decl { name: n, ty, .. } = ast.node(id) {
            if n == name {
                return Some(*ty);
            }
        }
    }
    None
}

/// Every variable symbol must have a declaration.
fn check_declared(ast: &Ast, root: NodeId, out: &Inspection) -> Result<()> {
    for name in navigate::symbol_names_in(ast, root) {
        if !out.decls.contains_key(&name) {
            return Err(RewriteError::missing_decl(&name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Extent, Node, WriteOp};

    fn kernel_with_pragma(pragma: Option<&str>) -> (Ast, NodeId) {
        let mut ast = Ast::new();
        let da = ast.decl(ScalarType::Double, "A", vec![Extent::Const(3), Extent::Const(3)]);
        let dx = ast.decl(ScalarType::Double, "X", vec![Extent::Const(3)]);
        let dy = ast.decl(ScalarType::Double, "Y", vec![Extent::Const(3)]);
        let lhs = ast.var("A", &["i", "j"]);
        let x = ast.var("X", &["i"]);
        let y = ast.var("Y", &["j"]);
        let rhs = ast.prod(x, y);
        let w = ast.writer(WriteOp::Incr, lhs, rhs);
        if let Some(p) = pragma {
            if let Node::Writer { pragma, .. } = ast.node_mut(w) {
                *pragma = Some(p.to_string());
            }
        }
        let jb = ast.block(vec![w]);
        let fj = ast.for_loop("j", Extent::Const(3), jb);
        let ib = ast.block(vec![fj]);
        let fi = ast.for_loop("i", Extent::Const(3), ib);
        let root = ast.root(vec![da, dx, dy, fi]);
        (ast, root)
    }

    #[test]
    fn test_pragma_target() {
        let (ast, root) = kernel_with_pragma(Some("pyop2 assembly(i,j)"));
        let insp = inspect(&ast, root).unwrap();
        assert_eq!(insp.targets.len(), 1);
        let t = &insp.targets[0];
        assert_eq!(t.info.domain_dims(), &["i", "j"]);
        assert_eq!(t.info.dims(&ast), vec!["i", "j"]);
    }

    #[test]
    fn test_derived_target_without_pragma() {
        let (ast, root) = kernel_with_pragma(None);
        let insp = inspect(&ast, root).unwrap();
        assert_eq!(insp.targets.len(), 1);
        assert_eq!(insp.targets[0].info.domain_dims(), &["i", "j"]);
    }

    #[test]
    fn test_unknown_pragma_is_fatal() {
        let (ast, root) = kernel_with_pragma(Some("pyop2 blocked(4)"));
        let err = inspect(&ast, root).unwrap_err();
        assert!(err.message.contains("unknown pragma"));
    }

    #[test]
    fn test_missing_decl_is_fatal() {
        let mut ast = Ast::new();
        let da = ast.decl(ScalarType::Double, "A", vec![Extent::Const(3)]);
        let lhs = ast.var("A", &["i"]);
        let z = ast.var("Z", &["i"]);
        let w = ast.writer(WriteOp::Incr, lhs, z);
        let b = ast.block(vec![w]);
        let fi = ast.for_loop("i", Extent::Const(3), b);
        let root = ast.root(vec![da, fi]);
        let err = inspect(&ast, root).unwrap_err();
        assert!(err.message.contains("`Z`"));
    }

    #[test]
    fn test_decl_table_order() {
        let (ast, root) = kernel_with_pragma(None);
        let insp = inspect(&ast, root).unwrap();
        let names: Vec<&String> = insp.decls.keys().collect();
        assert_eq!(names, vec!["A", "X", "Y"]);
    }

    #[test]
    fn test_fors_preorder() {
        let (ast, root) = kernel_with_pragma(None);
        let insp = inspect(&ast, root).unwrap();
        let dims: Vec<&str> = insp.fors.iter().map(|(l, _)| ast.loop_dim(*l)).collect();
        assert_eq!(dims, vec!["i", "j"]);
    }
}
