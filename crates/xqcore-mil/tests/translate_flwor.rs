use rstest::rstest;
use xqcore_mil::core::{Builtin, CoreBuilder, CoreTree};
use xqcore_mil::engine::store::Store;
use xqcore_mil::engine::{Item, QueryResult, execute};
use xqcore_mil::{CompileOptions, compile_core};

fn run_with(tree: &CoreTree, opts: &CompileOptions) -> QueryResult {
    let program = compile_core(tree, opts).unwrap();
    execute(&program, &mut Store::new()).unwrap()
}

fn run(tree: &CoreTree) -> Vec<Item> {
    run_with(tree, &CompileOptions::default()).items()
}

fn ints(v: &[i64]) -> Vec<Item> {
    v.iter().copied().map(Item::Int).collect()
}

#[rstest]
fn filter_with_constant_keeps_one_row() {
    // for $x in (1,2,3) return if ($x = 2) then $x else ()
    let mut b = CoreBuilder::new();
    let d = b.int_seq(&[1, 2, 3]);
    let x = b.for_var("x", d);
    let xr = b.var(x);
    let two = b.int(2);
    let cond = b.eq(xr, two);
    let xr2 = b.var(x);
    let none = b.empty();
    let filter = b.if_(cond, xr2, none);
    let f = b.for_in(x, None, d, filter);
    let tree = b.finish(f);

    let out = run_with(&tree, &CompileOptions::default());
    assert_eq!(out.rows.len(), 1);
    assert_eq!(out.rows[0].iter, 1);
    assert_eq!(out.rows[0].pos, 1);
    assert_eq!(out.rows[0].item, Item::Int(2));
}

#[rstest]
fn nested_loops_see_outer_variables() {
    // for $x in (1,2) return for $y in (10,20) return $x + $y
    let mut b = CoreBuilder::new();
    let d1 = b.int_seq(&[1, 2]);
    let d2 = b.int_seq(&[10, 20]);
    let x = b.for_var("x", d1);
    let y = b.for_var("y", d2);
    let (xr, yr) = (b.var(x), b.var(y));
    let sum = b.call(Builtin::Plus, &[xr, yr]);
    let inner = b.for_in(y, None, d2, sum);
    let outer = b.for_in(x, None, d1, inner);
    let tree = b.finish(outer);
    assert_eq!(run(&tree), ints(&[11, 21, 12, 22]));
}

#[rstest]
fn let_bound_sequence_is_reused() {
    // let $a := (1,2) return ($a, $a)
    let mut b = CoreBuilder::new();
    let d = b.int_seq(&[1, 2]);
    let a = b.let_var("a", d);
    let (r1, r2) = (b.var(a), b.var(a));
    let body = b.seq(r1, r2);
    let q = b.let_in(a, d, body);
    let tree = b.finish(q);
    assert_eq!(run(&tree), ints(&[1, 2, 1, 2]));
}

#[rstest]
fn positional_variable_counts_from_one() {
    // for $x at $i in ("a","b","c") return $i
    let mut b = CoreBuilder::new();
    let d = b.str_seq(&["a", "b", "c"]);
    let x = b.for_var("x", d);
    let i = b.pos_var("i");
    let ir = b.var(i);
    let f = b.for_in(x, Some(i), d, ir);
    let tree = b.finish(f);
    assert_eq!(run(&tree), ints(&[1, 2, 3]));
}

#[rstest]
#[case(false, &[1, 2, 3])]
#[case(true, &[3, 2, 1])]
fn order_by_sorts_iterations(#[case] descending: bool, #[case] expected: &[i64]) {
    // for $x in (3,1,2) order by $x return $x
    let mut b = CoreBuilder::new();
    let d = b.int_seq(&[3, 1, 2]);
    let x = b.for_var("x", d);
    let (key, ret) = (b.var(x), b.var(x));
    let body = b.order_by(key, descending, ret);
    let f = b.for_in(x, None, d, body);
    let tree = b.finish(f);
    assert_eq!(run(&tree), ints(expected));
}

#[rstest]
fn loop_over_nothing_yields_nothing() {
    let mut b = CoreBuilder::new();
    let d = b.empty();
    let x = b.for_var("x", d);
    let xr = b.var(x);
    let f = b.for_in(x, None, d, xr);
    let tree = b.finish(f);
    assert!(run(&tree).is_empty());
}

#[rstest]
fn non_boolean_condition_uses_effective_boolean_value() {
    // for $x in (0,1,2) return if ($x) then "y" else "n"
    let mut b = CoreBuilder::new();
    let d = b.int_seq(&[0, 1, 2]);
    let x = b.for_var("x", d);
    let xr = b.var(x);
    let (y, n) = (b.str("y"), b.str("n"));
    let body = b.if_(xr, y, n);
    let f = b.for_in(x, None, d, body);
    let tree = b.finish(f);
    let expected: Vec<Item> = ["n", "y", "y"].iter().map(|s| Item::Str(s.to_string())).collect();
    assert_eq!(run(&tree), expected);
}

#[rstest]
fn branch_results_keep_iteration_order() {
    // for $x in (1,2,3,4) return if ($x mod 2 = 0) then ($x, $x) else -$x
    let mut b = CoreBuilder::new();
    let d = b.int_seq(&[1, 2, 3, 4]);
    let x = b.for_var("x", d);
    let xr = b.var(x);
    let two = b.int(2);
    let m = b.call(Builtin::Mod, &[xr, two]);
    let zero = b.int(0);
    let cond = b.eq(m, zero);
    let (a, c) = (b.var(x), b.var(x));
    let pair = b.seq(a, c);
    let xr3 = b.var(x);
    let neg = b.call(Builtin::Negate, &[xr3]);
    let body = b.if_(cond, pair, neg);
    let f = b.for_in(x, None, d, body);
    let tree = b.finish(f);
    assert_eq!(run(&tree), ints(&[-1, 2, 2, -3, 4, 4]));
}

#[rstest]
#[case::plain(CompileOptions::default())]
#[case::unoptimized(CompileOptions::builder().optimize(false).comments(false).build())]
#[case::unsimplified(CompileOptions::builder().simplify(false).build())]
fn options_do_not_change_results(#[case] opts: CompileOptions) {
    // for $x in (1,2) return for $y in ($x, 5) return $y * $x
    let mut b = CoreBuilder::new();
    let d = b.int_seq(&[1, 2]);
    let x = b.for_var("x", d);
    let xr = b.var(x);
    let five = b.int(5);
    let d2 = b.seq(xr, five);
    let y = b.for_var("y", d2);
    let (yr, xr2) = (b.var(y), b.var(x));
    let prod = b.call(Builtin::Times, &[yr, xr2]);
    let inner = b.for_in(y, None, d2, prod);
    let outer = b.for_in(x, None, d, inner);
    let tree = b.finish(outer);
    assert_eq!(run_with(&tree, &opts).items(), ints(&[1, 5, 4, 10]));
}

#[rstest]
fn result_printer_writes_items() {
    let mut b = CoreBuilder::new();
    let q = b.int_seq(&[1, 2]);
    let tree = b.finish(q);
    let out = run_with(&tree, &CompileOptions::default());
    assert!(out.output.contains('1'));
    assert!(out.output.contains('2'));
    let quiet = run_with(&tree, &CompileOptions::builder().serialize_result(false).build());
    assert!(quiet.output.is_empty());
    assert_eq!(quiet.items(), ints(&[1, 2]));
}
