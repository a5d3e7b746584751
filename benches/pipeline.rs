//! Rewriting pipeline benchmark.
//!
//! Measures session construction and the full level-2 sequence
//! (reassociate, expand, factorize, hoist to a fixed point) on a
//! synthetic bilinear-form kernel with a configurable number of
//! invariant factors.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use nestopt::ast::{Ast, BinOp, Extent, Node, NodeId, ScalarType, WriteOp};
use nestopt::session::{OptLevel, RewriteConfig, Session};

/// `A[i][j] += (X0[i] + ... + Xn[i]) * Y[j] * C0 * ... * Cm` under
/// a quadrature loop.
fn synthetic_kernel(n_terms: usize, n_consts: usize) -> (Ast, NodeId) {
    let mut ast = Ast::new();
    let mut children = Vec::new();
    children.push(ast.decl(
        ScalarType::Double,
        "A",
        vec![Extent::Const(6), Extent::Const(6)],
    ));
    let mut sum_parts = Vec::new();
    for t in 0..n_terms {
        let name = format!("X{}", t);
        children.push(ast.decl(ScalarType::Double, &name, vec![Extent::Const(6)]));
        sum_parts.push(ast.var(&name, &["i"]));
    }
    children.push(ast.decl(ScalarType::Double, "Y", vec![Extent::Const(6)]));
    let mut prod_parts = Vec::new();
    let sum = ast.chain(BinOp::Add, sum_parts);
    prod_parts.push(ast.par(sum));
    prod_parts.push(ast.var("Y", &["j"]));
    for c in 0..n_consts {
        let name = format!("C{}", c);
        children.push(ast.decl(ScalarType::Double, &name, vec![]));
        prod_parts.push(ast.var(&name, &[]));
    }
    let rhs = ast.chain(BinOp::Mul, prod_parts);
    let lhs = ast.var("A", &["i", "j"]);
    let w = ast.writer(WriteOp::Incr, lhs, rhs);
    if let Node::Writer { pragma, .. } = ast.node_mut(w) {
        *pragma = Some("pyop2 assembly(i,j)".to_string());
    }
    let jb = ast.block(vec![w]);
    let fj = ast.for_loop("j", Extent::Const(6), jb);
    let ib = ast.block(vec![fj]);
    let fi = ast.for_loop("i", Extent::Const(6), ib);
    let qb = ast.block(vec![fi]);
    let fq = ast.for_loop("q", Extent::Const(8), qb);
    if let Node::For { pragma, .. } = ast.node_mut(fq) {
        *pragma = Some("pyop2 integration".to_string());
    }
    children.push(fq);
    let root = ast.root(children);
    (ast, root)
}

fn bench_session_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_build");
    for terms in [4usize, 16] {
        let (ast, root) = synthetic_kernel(terms, 3);
        group.bench_function(format!("{}_terms", terms), |b| {
            b.iter(|| Session::build(black_box(ast.clone()), root).unwrap())
        });
    }
    group.finish();
}

fn bench_level1(c: &mut Criterion) {
    let cfg = RewriteConfig::for_level(OptLevel::O1);
    let mut group = c.benchmark_group("licm");
    for terms in [4usize, 16] {
        let (ast, root) = synthetic_kernel(terms, 3);
        group.bench_function(format!("{}_terms", terms), |b| {
            b.iter(|| {
                let mut sess = Session::build(black_box(ast.clone()), root).unwrap();
                sess.optimize(&cfg).unwrap();
                sess
            })
        });
    }
    group.finish();
}

fn bench_level2(c: &mut Criterion) {
    let cfg = RewriteConfig::for_level(OptLevel::O2);
    let mut group = c.benchmark_group("level2_pipeline");
    for terms in [4usize, 16] {
        let (ast, root) = synthetic_kernel(terms, 3);
        group.bench_function(format!("{}_terms", terms), |b| {
            b.iter(|| {
                let mut sess = Session::build(black_box(ast.clone()), root).unwrap();
                sess.optimize(&cfg).unwrap();
                sess
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_session_build, bench_level1, bench_level2);
criterion_main!(benches);
