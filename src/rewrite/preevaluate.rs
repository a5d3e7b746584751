//! Reduction pre-evaluation.
//!
//! For a reduction target whose out-of-domain loops are perfect and
//! whose right-hand side reads only hoisted tables, the reduction is
//! pushed into the hoisted loops: each hoisted `Assign` becomes an
//! `Incr`, the table ranks shrink by the reduction dimensions, and the
//! reduction loop disappears from the main nest. Tables whose inputs
//! are compile-time constants are then evaluated and emitted as
//! `static const` data at the top of the header; identical tables
//! collapse to one.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::ast::{navigate, Ast, BinOp, Index, Node, NodeId, Qualifier, WriteOp};
use crate::cost::{Note, RecordSink};
use crate::error::Result;
use crate::meta::MetaExpr;
use crate::session::Session;

pub(crate) fn preevaluate(sess: &mut Session, stmt: NodeId, info: &mut MetaExpr) -> Result<()> {
    let Some((op, _, rhs)) = sess.ast.writer_parts(stmt) else {
        return Ok(());
    };
    if !op.is_reduction() {
        return Ok(());
    }
    let reduction_loops = info.out_domain_loops(&sess.ast);
    if reduction_loops.is_empty() {
        return Ok(());
    }
    if reduction_loops
        .iter()
        .any(|(l, _)| !navigate::is_perfect_loop(&sess.ast, *l))
    {
        return Ok(());
    }

    // Conservative skip: hoisted tables must be indexed by nest
    // dimensions (or constants) only
    let expr_dims = info.dims(&sess.ast);
    for stmt_id in sess.hoisted.all_stmts() {
        for s in navigate::symbols_in(&sess.ast, stmt_id) {
            let Some(sym) = sess.ast.as_symbol(s) else { continue };
            for r in &sym.rank {
                if let Index::Dim(d) = r {
                    if !expr_dims.contains(d) {
                        sess.log.note(Note {
                            pass: "preevaluate".into(),
                            message: format!(
                                "hoisted table indexed by `{}`, outside the nest",
                                d
                            ),
                        });
                        return Ok(());
                    }
                }
            }
        }
    }

    // Every non-constant read must be a hoisted table
    let reducible: Vec<NodeId> = navigate::symbols_in(&sess.ast, rhs)
        .into_iter()
        .filter(|s| {
            sess.ast
                .as_symbol(*s)
                .map(|sym| !sym.is_const())
                .unwrap_or(false)
        })
        .collect();
    let mut reducible_names: Vec<String> = Vec::new();
    for s in &reducible {
        let Some(name) = sess.ast.as_symbol(*s).and_then(|sym| sym.name()) else {
            return Ok(());
        };
        if !sess.hoisted.contains(name) {
            return Ok(());
        }
        if !reducible_names.iter().any(|n| n == name) {
            reducible_names.push(name.to_string());
        }
    }
    if reducible_names.is_empty() {
        return Ok(());
    }

    // 1) Push each reduction into the hoisted loops
    let red_dims: Vec<String> = reduction_loops
        .iter()
        .map(|(l, _)| sess.ast.loop_dim(*l).to_string())
        .collect();
    for name in &reducible_names {
        let hinfo = *sess.hoisted.get(name).expect("hoisted table");
        let Some((_, lhs, _)) = sess.ast.writer_parts(hinfo.stmt) else {
            continue;
        };
        // Assign becomes a reduction over the dropped dims
        if let Node::Writer { op, .. } = sess.ast.node_mut(hinfo.stmt) {
            *op = WriteOp::Incr;
        }
        let dropped = shrink_rank(&mut sess.ast, lhs, &red_dims);
        if let Node::Decl { rank, .. } = sess.ast.node_mut(hinfo.decl) {
            if dropped <= rank.len() {
                rank.drain(..dropped);
            }
        }
    }

    // 2) Remove the reduction loops from the main nest
    for (l, p) in &reduction_loops {
        let body = sess.ast.loop_body(*l);
        let inner: Vec<NodeId> = sess.ast.block_children(body).to_vec();
        let children = sess.ast.block_children_mut(*p);
        if let Some(at) = children.iter().position(|c| c == l) {
            children.splice(at..=at, inner);
        }
        info.remove_loop(*l);
    }

    // 3) Shrink the ranks of the reduced reads in the target
    for s in &reducible {
        shrink_rank(&mut sess.ast, *s, &red_dims);
    }

    // 4) Evaluate hoisted tables that are compile-time constants
    let mut tables: HashMap<String, (Vec<u64>, Vec<f64>)> = HashMap::new();
    for id in decl_ids(&sess.ast, sess.root) {
        if let Node::Decl {
            name,
            init: Some(init),
            ..
        } = sess.ast.node(id)
        {
            if let Node::Table { dims, values } = sess.ast.node(*init) {
                tables.insert(name.clone(), (dims.clone(), values.clone()));
            }
        }
    }

    let mut dedup: IndexMap<String, String> = IndexMap::new();
    for wrap in sess.hoisted.all_loops() {
        let Some(evals) = evaluate_loop(&sess.ast, wrap, &tables) else {
            sess.log.note(Note {
                pass: "preevaluate".into(),
                message: "hoisted loop reads non-constant data, left in place".into(),
            });
            continue;
        };
        for (name, (dims, values)) in &evals {
            tables.insert(name.clone(), (dims.clone(), values.clone()));
        }

        let names: Vec<String> = evals.keys().cloned().collect();
        for name in &names {
            let (dims, values) = evals[name.as_str()].clone();
            let table_key = format!("{:?}:{:?}", dims, values);
            if let Some(first) = dedup.get(&table_key) {
                // Identical table already emitted: redirect and drop
                let first = first.clone();
                redirect_symbol(sess, stmt, name, &first);
                let hinfo = sess.hoisted.remove(name).expect("registered table");
                remove_from_block(&mut sess.ast, hinfo.place, hinfo.decl);
                sess.decls.shift_remove(name);
                continue;
            }
            dedup.insert(table_key, name.clone());
            let hinfo = *sess.hoisted.get(name).expect("registered table");
            let table = sess.ast.push(Node::Table { dims, values });
            if let Node::Decl { init, quals, .. } = sess.ast.node_mut(hinfo.decl) {
                *init = Some(table);
                *quals = vec![Qualifier::Static, Qualifier::Const];
            }
            sess.hoisted.remove(name);
            // The constant table moves to the top of the header
            remove_from_block(&mut sess.ast, hinfo.place, hinfo.decl);
            sess.ast.block_children_mut(sess.root).insert(0, hinfo.decl);
            remove_from_block(&mut sess.ast, hinfo.place, wrap);
        }
    }
    if !dedup.is_empty() {
        let banner = sess.ast.push(Node::FlatBlock("// Precomputed tables".into()));
        sess.ast.block_children_mut(sess.root).insert(0, banner);
    }
    Ok(())
}

/// Drop the given dims from a symbol's rank; returns how many were
/// dropped.
fn shrink_rank(ast: &mut Ast, sym: NodeId, dims: &[String]) -> usize {
    let Some(s) = ast.as_symbol_mut(sym) else {
        return 0;
    };
    let before = s.rank.len();
    s.rank.retain(|r| match r {
        Index::Dim(d) => !dims.contains(d),
        Index::Num(_) => true,
    });
    before - s.rank.len()
}

fn decl_ids(ast: &Ast, root: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    navigate::walk_pre(ast, root, &mut |ast, id| {
        if matches!(ast.node(id), Node::Decl { .. }) {
            out.push(id);
        }
    });
    out
}

fn remove_from_block(ast: &mut Ast, block: NodeId, node: NodeId) {
    if matches!(ast.node(block), Node::Block { .. } | Node::Root { .. }) {
        ast.block_children_mut(block).retain(|c| *c != node);
    }
}

fn redirect_symbol(sess: &mut Session, stmt: NodeId, from: &str, to: &str) {
    for s in navigate::symbols_in(&sess.ast, stmt) {
        if let Some(sym) = sess.ast.as_symbol_mut(s) {
            if sym.name() == Some(from) {
                sym.atom = crate::ast::Atom::Var(to.to_string());
            }
        }
    }
}

// ─── Constant evaluation ──────────────────────────────────────────

/// Run one hoisted loop nest numerically. Returns per-written-table
/// `(dims, values)`, or None when a read has no constant table.
fn evaluate_loop(
    ast: &Ast,
    wrap: NodeId,
    tables: &HashMap<String, (Vec<u64>, Vec<f64>)>,
) -> Option<IndexMap<String, (Vec<u64>, Vec<f64>)>> {
    // Collect the loop nest dims and the writers at its core
    let mut dims: Vec<(String, u64)> = Vec::new();
    let mut cursor = wrap;
    let writers = loop {
        let Node::For {
            dim, extent, body, ..
        } = ast.node(cursor)
        else {
            return None;
        };
        dims.push((dim.clone(), extent.as_const()?));
        let children = ast.block_children(*body);
        let inner_loop = children
            .iter()
            .find(|c| matches!(ast.node(**c), Node::For { .. }));
        match inner_loop {
            Some(l) => cursor = *l,
            None => {
                break children
                    .iter()
                    .filter(|c| ast.writer_parts(**c).is_some())
                    .copied()
                    .collect::<Vec<_>>()
            }
        }
    };
    if writers.is_empty() {
        return None;
    }

    let mut scratch = tables.clone();
    let mut out: IndexMap<String, (Vec<u64>, Vec<f64>)> = IndexMap::new();
    for w in writers {
        let (op, lhs, rhs) = ast.writer_parts(w)?;
        let lsym = ast.as_symbol(lhs)?;
        let name = lsym.name()?.to_string();
        let out_dims: Vec<String> = lsym.loop_dims().iter().map(|d| d.to_string()).collect();
        let shape: Vec<u64> = out_dims
            .iter()
            .map(|d| {
                dims.iter()
                    .find(|(dd, _)| dd == d)
                    .map(|(_, n)| *n)
                    .unwrap_or(1)
            })
            .collect();
        let len: u64 = shape.iter().product::<u64>().max(1);
        let mut values = vec![0.0f64; len as usize];

        let mut env: HashMap<String, i64> = HashMap::new();
        let mut ok = true;
        iterate(&dims, 0, &mut env, &mut |env| {
            let Some(v) = eval_expr(ast, rhs, env, &scratch) else {
                ok = false;
                return;
            };
            let mut flat = 0usize;
            for (d, n) in out_dims.iter().zip(shape.iter()) {
                flat = flat * *n as usize + env[d] as usize;
            }
            match op {
                WriteOp::Assign => values[flat] = v,
                WriteOp::Incr => values[flat] += v,
                WriteOp::Decr => values[flat] -= v,
                WriteOp::IMul => values[flat] *= v,
                WriteOp::IDiv => values[flat] /= v,
            }
        });
        if !ok {
            return None;
        }
        scratch.insert(name.clone(), (shape.clone(), values.clone()));
        out.insert(name, (shape, values));
    }
    Some(out)
}

fn iterate(
    dims: &[(String, u64)],
    at: usize,
    env: &mut HashMap<String, i64>,
    f: &mut dyn FnMut(&HashMap<String, i64>),
) {
    if at == dims.len() {
        f(env);
        return;
    }
    let (name, extent) = &dims[at];
    for v in 0..*extent {
        env.insert(name.clone(), v as i64);
        iterate(dims, at + 1, env, f);
    }
    env.remove(name);
}

fn eval_expr(
    ast: &Ast,
    id: NodeId,
    env: &HashMap<String, i64>,
    tables: &HashMap<String, (Vec<u64>, Vec<f64>)>,
) -> Option<f64> {
    match ast.node(id) {
        Node::Symbol(sym) => {
            if let Some(v) = sym.as_num() {
                return Some(v);
            }
            let name = sym.name()?;
            let (dims, values) = tables.get(name)?;
            let mut flat = 0usize;
            for (r, n) in sym.rank.iter().zip(dims.iter()) {
                let ix = match r {
                    Index::Num(k) => *k,
                    Index::Dim(d) => *env.get(d)?,
                };
                if ix < 0 || ix as u64 >= *n {
                    return None;
                }
                flat = flat * *n as usize + ix as usize;
            }
            values.get(flat).copied()
        }
        Node::Bin { op, lhs, rhs } => {
            let l = eval_expr(ast, *lhs, env, tables)?;
            let r = eval_expr(ast, *rhs, env, tables)?;
            Some(match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => l / r,
            })
        }
        Node::Neg(c) => eval_expr(ast, *c, env, tables).map(|v| -v),
        Node::Par(c) => eval_expr(ast, *c, env, tables),
        Node::Ternary {
            cond,
            then_val,
            else_val,
        } => {
            let c = eval_expr(ast, *cond, env, tables)?;
            if c != 0.0 {
                eval_expr(ast, *then_val, env, tables)
            } else {
                eval_expr(ast, *else_val, env, tables)
            }
        }
        // Calls and anything else are not compile-time evaluable
        _ => None,
    }
}
