use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use xqcore_mil::core::{Builtin, CoreBuilder, CoreTree};
use xqcore_mil::engine::execute;
use xqcore_mil::engine::store::{Store, doc, elem, text};
use xqcore_mil::{CompileOptions, compile_core};

/// for $x in 1..n return for $y in 1..n return if ($x = $y) then $x else ()
fn pair_filter(n: i64) -> CoreTree {
    let mut b = CoreBuilder::new();
    let values: Vec<i64> = (1..=n).collect();
    let d1 = b.int_seq(&values);
    let d2 = b.int_seq(&values);
    let x = b.for_var("x", d1);
    let y = b.for_var("y", d2);
    let (xr, yr) = (b.var(x), b.var(y));
    let cond = b.eq(xr, yr);
    let xr2 = b.var(x);
    let none = b.empty();
    let filter = b.if_(cond, xr2, none);
    let inner = b.for_in(y, None, d2, filter);
    let outer = b.for_in(x, None, d1, inner);
    b.finish(outer)
}

/// for $i in doc("lib.xml")/lib/item return element row { string($i) }
fn rows() -> CoreTree {
    let mut b = CoreBuilder::new();
    let uri = b.str("lib.xml");
    let d = b.call(Builtin::Doc, &[uri]);
    let lib = b.child("lib", d);
    let items = b.child("item", lib);
    let i = b.for_var("i", items);
    let ir = b.var(i);
    let s = b.call(Builtin::String, &[ir]);
    let row = b.elem_named("row", s);
    let f = b.for_in(i, None, items, row);
    b.finish(f)
}

fn library() -> Store {
    let mut store = Store::new();
    let lib = (0..500).fold(elem("lib"), |lib, i| lib.child(elem("item").child(text(&format!("item {i}")))));
    store.load("lib.xml", doc().child(lib));
    store
}

fn benchmark_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile/pair_filter");
    for joins in [false, true] {
        let tree = pair_filter(50);
        let opts = CompileOptions::builder().recognize_joins(joins).comments(false).build();
        group.bench_with_input(BenchmarkId::from_parameter(if joins { "join" } else { "nested" }), &tree, |b, t| {
            b.iter(|| black_box(compile_core(black_box(t), &opts).expect("compile failure")));
        });
    }
    group.finish();
}

fn benchmark_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute/pair_filter");
    for joins in [false, true] {
        let opts = CompileOptions::builder().recognize_joins(joins).serialize_result(false).build();
        let program = compile_core(&pair_filter(200), &opts).expect("compile failure");
        group.bench_with_input(BenchmarkId::from_parameter(if joins { "join" } else { "nested" }), &program, |b, p| {
            b.iter(|| {
                let result = execute(p, &mut Store::new()).expect("execution failure");
                black_box(result.rows.len());
            });
        });
    }
    group.finish();

    let program = compile_core(&rows(), &CompileOptions::builder().serialize_result(false).build())
        .expect("compile failure");
    c.bench_function("execute/constructors", |b| {
        b.iter_batched(
            library,
            |mut store| black_box(execute(&program, &mut store).expect("execution failure").rows.len()),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, benchmark_compile, benchmark_execute);
criterion_main!(benches);
