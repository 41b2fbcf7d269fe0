use rstest::rstest;
use xqcore_mil::core::{Builtin, CoreBuilder, CoreTree, SeqType};
use xqcore_mil::engine::store::Store;
use xqcore_mil::engine::{EngineOptions, Item, Machine, execute};
use xqcore_mil::{CompileOptions, ErrorClass, ErrorCode, compile_core};

fn run(tree: &CoreTree) -> Vec<Item> {
    let program = compile_core(tree, &CompileOptions::default()).unwrap();
    execute(&program, &mut Store::new()).unwrap().items()
}

fn ints(v: &[i64]) -> Vec<Item> {
    v.iter().copied().map(Item::Int).collect()
}

#[rstest]
fn function_is_called_for_every_iteration() {
    // declare function local:double($n as xs:integer) as xs:integer { $n * 2 };
    // for $x in (1,2,3) return local:double($x)
    let mut b = CoreBuilder::new();
    let (f, params) = b.declare_function("double", &[("n", SeqType::integer())], SeqType::integer());
    let n = b.var(params[0]);
    let two = b.int(2);
    let body = b.call(Builtin::Times, &[n, two]);
    b.define_function(f, body);

    let d = b.int_seq(&[1, 2, 3]);
    let x = b.for_var("x", d);
    let xr = b.var(x);
    let call = b.call_user(f, &[xr]);
    let q = b.for_in(x, None, d, call);
    let tree = b.finish(q);
    assert_eq!(run(&tree), ints(&[2, 4, 6]));
}

#[rstest]
fn recursion_stops_on_empty_loops() {
    // declare function local:fact($n as xs:integer) as xs:integer {
    //   if ($n le 1) then 1 else $n * local:fact($n - 1) };
    // for $x in (1,3,5) return local:fact($x)
    let mut b = CoreBuilder::new();
    let (f, params) = b.declare_function("fact", &[("n", SeqType::integer())], SeqType::integer());
    let n = params[0];
    let nr = b.var(n);
    let one = b.int(1);
    let cond = b.call(Builtin::Le, &[nr, one]);
    let base = b.int(1);
    let (n2, n3) = (b.var(n), b.var(n));
    let one2 = b.int(1);
    let dec = b.call(Builtin::Minus, &[n3, one2]);
    let rec = b.call_user(f, &[dec]);
    let prod = b.call(Builtin::Times, &[n2, rec]);
    let body = b.if_(cond, base, prod);
    b.define_function(f, body);

    let d = b.int_seq(&[1, 3, 5]);
    let x = b.for_var("x", d);
    let xr = b.var(x);
    let call = b.call_user(f, &[xr]);
    let q = b.for_in(x, None, d, call);
    let tree = b.finish(q);
    assert_eq!(run(&tree), ints(&[1, 6, 120]));
}

#[rstest]
fn unbounded_recursion_hits_the_call_depth_guard() {
    // declare function local:loop($n as xs:integer) as xs:integer { local:loop($n) }; local:loop(1)
    let mut b = CoreBuilder::new();
    let (f, params) = b.declare_function("loop", &[("n", SeqType::integer())], SeqType::integer());
    let n = b.var(params[0]);
    let body = b.call_user(f, &[n]);
    b.define_function(f, body);
    let one = b.int(1);
    let q = b.call_user(f, &[one]);
    let tree = b.finish(q);

    let program = compile_core(&tree, &CompileOptions::default()).unwrap();
    let mut store = Store::new();
    let err = Machine::new(&program, &mut store, EngineOptions { max_call_depth: 16 }).run().unwrap_err();
    assert_eq!(err.code(), None);
}

#[rstest]
fn globals_are_visible_in_loops() {
    // declare variable $g := (10, 20); for $x in (1,2) return $x + count($g)
    let mut b = CoreBuilder::new();
    let init = b.int_seq(&[10, 20]);
    let ty = b.tree().ty(init);
    let g = b.global_var("g", ty);
    b.define_global(g, init);
    let d = b.int_seq(&[1, 2]);
    let x = b.for_var("x", d);
    let xr = b.var(x);
    let gr = b.var(g);
    let c = b.call(Builtin::Count, &[gr]);
    let sum = b.call(Builtin::Plus, &[xr, c]);
    let q = b.for_in(x, None, d, sum);
    let tree = b.finish(q);
    assert_eq!(run(&tree), ints(&[3, 4]));
}

#[rstest]
fn functions_read_globals_they_do_not_receive() {
    // declare variable $base := 100;
    // declare function local:shift($n as xs:integer) as xs:integer { $n + $base };
    // for $x in (1,2) return local:shift($x)
    let mut b = CoreBuilder::new();
    let init = b.int(100);
    let base = b.global_var("base", SeqType::integer());
    b.define_global(base, init);
    let (f, params) = b.declare_function("shift", &[("n", SeqType::integer())], SeqType::integer());
    let (n, br) = (b.var(params[0]), b.var(base));
    let body = b.call(Builtin::Plus, &[n, br]);
    b.define_function(f, body);

    let d = b.int_seq(&[1, 2]);
    let x = b.for_var("x", d);
    let xr = b.var(x);
    let call = b.call_user(f, &[xr]);
    let q = b.for_in(x, None, d, call);
    let tree = b.finish(q);
    assert_eq!(run(&tree), ints(&[101, 102]));
}

#[rstest]
fn unused_parameter_is_not_packed() {
    // declare function local:k($a as xs:integer, $b as xs:string) as xs:integer { $a };
    let mut b = CoreBuilder::new();
    let (f, params) =
        b.declare_function("k", &[("a", SeqType::integer()), ("b", SeqType::string())], SeqType::integer());
    let body = b.var(params[0]);
    b.define_function(f, body);
    let (one, s) = (b.int(7), b.str("ignored"));
    let q = b.call_user(f, &[one, s]);
    let tree = b.finish(q);
    assert_eq!(run(&tree), ints(&[7]));
}

#[rstest]
fn global_may_read_a_later_global_through_a_function() {
    // declare variable $a := local:f();
    // declare function local:f() as xs:integer { $b };
    // declare variable $b := 5;
    // ($a, $b + 1)
    let mut b = CoreBuilder::new();
    let (f, _) = b.declare_function("f", &[], SeqType::integer());
    let a = b.global_var("a", SeqType::integer());
    let later = b.global_var("b", SeqType::integer());
    let call = b.call_user(f, &[]);
    b.define_global(a, call);
    let br = b.var(later);
    b.define_function(f, br);
    let five = b.int(5);
    b.define_global(later, five);
    let (ar, br2, one) = (b.var(a), b.var(later), b.int(1));
    let next = b.call(Builtin::Plus, &[br2, one]);
    let q = b.seq(ar, next);
    let tree = b.finish(q);
    assert_eq!(run(&tree), ints(&[5, 6]));
}

#[rstest]
fn circular_globals_are_a_query_error() {
    // declare variable $a := $b + 1; declare variable $b := $a; $a
    let mut b = CoreBuilder::new();
    let a = b.global_var("a", SeqType::integer());
    let c = b.global_var("b", SeqType::integer());
    let (cr, one) = (b.var(c), b.int(1));
    let init = b.call(Builtin::Plus, &[cr, one]);
    b.define_global(a, init);
    let ar = b.var(a);
    b.define_global(c, ar);
    let q = b.var(a);
    let tree = b.finish(q);
    let err = compile_core(&tree, &CompileOptions::default()).unwrap_err();
    assert_eq!(err.code, ErrorCode::XQST0054);
    assert_eq!(err.class(), ErrorClass::Query);
}
