use rstest::rstest;
use xqcore_mil::core::{AtomicType, Axis, Builtin, CoreBuilder, CoreTree, NodeId, NodeTest, QName};
use xqcore_mil::engine::store::{Store, doc, elem};
use xqcore_mil::engine::{Item, execute};
use xqcore_mil::{CompileOptions, ErrorCode, compile_core};

fn run(tree: &CoreTree) -> Vec<Item> {
    let program = compile_core(tree, &CompileOptions::default()).unwrap();
    execute(&program, &mut Store::new()).unwrap().items()
}

fn call(build: impl FnOnce(&mut CoreBuilder) -> NodeId) -> Vec<Item> {
    let mut b = CoreBuilder::new();
    let q = build(&mut b);
    run(&b.finish(q))
}

fn s(v: &str) -> Item {
    Item::Str(v.to_string())
}

#[rstest]
fn count_of_sequence() {
    let out = call(|b| {
        let d = b.int_seq(&[4, 5, 6]);
        b.call(Builtin::Count, &[d])
    });
    assert_eq!(out, vec![Item::Int(3)]);
}

#[rstest]
fn count_per_iteration_includes_zero() {
    // for $x in (0,1,2) return count(for $y in (1,2) return if ($y <= $x) then $y else ())
    let out = call(|b| {
        let d = b.int_seq(&[0, 1, 2]);
        let e = b.int_seq(&[1, 2]);
        let x = b.for_var("x", d);
        let y = b.for_var("y", e);
        let (yr, xr) = (b.var(y), b.var(x));
        let cond = b.call(Builtin::Le, &[yr, xr]);
        let yr2 = b.var(y);
        let none = b.empty();
        let filter = b.if_(cond, yr2, none);
        let inner = b.for_in(y, None, e, filter);
        let c = b.call(Builtin::Count, &[inner]);
        b.for_in(x, None, d, c)
    });
    assert_eq!(out, vec![Item::Int(0), Item::Int(1), Item::Int(2)]);
}

#[rstest]
#[case(Builtin::Empty, true)]
#[case(Builtin::Exists, false)]
fn emptiness_tests(#[case] f: Builtin, #[case] expected: bool) {
    let out = call(|b| {
        let d = b.empty();
        b.call(f, &[d])
    });
    assert_eq!(out, vec![Item::Bool(expected)]);
}

#[rstest]
fn not_and_boolean() {
    let out = call(|b| {
        let t = b.boolean(true);
        let n = b.call(Builtin::Not, &[t]);
        let s = b.str("");
        let e = b.call(Builtin::Boolean, &[s]);
        b.seq(n, e)
    });
    assert_eq!(out, vec![Item::Bool(false), Item::Bool(false)]);
}

#[rstest]
fn sum_min_max_of_integers() {
    let out = call(|b| {
        let d = b.int_seq(&[3, 9, 1]);
        let sum = b.call(Builtin::Sum, &[d]);
        let min = b.call(Builtin::Min, &[d]);
        let max = b.call(Builtin::Max, &[d]);
        b.seq_all(&[sum, min, max])
    });
    assert_eq!(out, vec![Item::Int(13), Item::Int(1), Item::Int(9)]);
}

#[rstest]
fn average_of_integers_is_decimal() {
    let out = call(|b| {
        let d = b.int_seq(&[1, 2, 3, 4]);
        b.call(Builtin::Avg, &[d])
    });
    assert_eq!(out, vec![Item::Dec(2.5)]);
}

#[rstest]
#[case(Builtin::Min, Item::Dbl(9.0))]
#[case(Builtin::Max, Item::Dbl(10.0))]
#[case(Builtin::Sum, Item::Dbl(19.0))]
fn aggregates_over_attribute_data_are_numeric(#[case] f: Builtin, #[case] expected: Item) {
    // f(data(doc("n.xml")/r/v/@n)) with @n = "10", "9"
    let mut store = Store::new();
    store.load(
        "n.xml",
        doc().child(elem("r").child(elem("v").attr("n", "10")).child(elem("v").attr("n", "9"))),
    );
    let mut b = CoreBuilder::new();
    let uri = b.str("n.xml");
    let d = b.call(Builtin::Doc, &[uri]);
    let r = b.child("r", d);
    let v = b.child("v", r);
    let n = b.step(Axis::Attribute, NodeTest::Name(QName::local("n")), v);
    let data = b.call(Builtin::Data, &[n]);
    let q = b.call(f, &[data]);
    let tree = b.finish(q);
    let program = compile_core(&tree, &CompileOptions::default()).unwrap();
    assert_eq!(execute(&program, &mut store).unwrap().items(), vec![expected]);
}

#[rstest]
fn sum_of_nothing_is_integer_zero() {
    let out = call(|b| {
        let none = b.empty();
        b.call(Builtin::Sum, &[none])
    });
    assert_eq!(out, vec![Item::Int(0)]);
}

#[rstest]
fn string_functions() {
    let out = call(|b| {
        let h = b.str("hello");
        let len = b.call(Builtin::StringLength, &[h]);
        let (a, c) = (b.str("ab"), b.str("cd"));
        let cat = b.call(Builtin::Concat, &[a, c]);
        let (hay, needle) = (b.str("abc"), b.str("bc"));
        let has = b.call(Builtin::Contains, &[hay, needle]);
        let i = b.int(42);
        let st = b.call(Builtin::String, &[i]);
        b.seq_all(&[len, cat, has, st])
    });
    assert_eq!(out, vec![Item::Int(5), s("abcd"), Item::Bool(true), s("42")]);
}

#[rstest]
#[case(Builtin::Plus, 7, 2, Item::Int(9))]
#[case(Builtin::Minus, 7, 2, Item::Int(5))]
#[case(Builtin::Times, 7, 2, Item::Int(14))]
#[case(Builtin::Div, 7, 2, Item::Dec(3.5))]
#[case(Builtin::IDiv, 7, 2, Item::Int(3))]
#[case(Builtin::Mod, 7, 2, Item::Int(1))]
fn integer_arithmetic(#[case] op: Builtin, #[case] a: i64, #[case] c: i64, #[case] expected: Item) {
    let out = call(|b| {
        let (x, y) = (b.int(a), b.int(c));
        b.call(op, &[x, y])
    });
    assert_eq!(out, vec![expected]);
}

#[rstest]
fn mixed_arithmetic_is_promoted() {
    let out = call(|b| {
        let (x, y) = (b.int(1), b.dbl(0.5));
        b.call(Builtin::Plus, &[x, y])
    });
    assert_eq!(out, vec![Item::Dbl(1.5)]);
}

#[rstest]
fn arithmetic_on_empty_is_empty() {
    // for $x in (1,2) return (if ($x = 1) then $x else ()) + 10
    let out = call(|b| {
        let d = b.int_seq(&[1, 2]);
        let x = b.for_var("x", d);
        let xr = b.var(x);
        let one = b.int(1);
        let cond = b.eq(xr, one);
        let xr2 = b.var(x);
        let none = b.empty();
        let opt = b.if_(cond, xr2, none);
        let ten = b.int(10);
        let sum = b.call(Builtin::Plus, &[opt, ten]);
        b.for_in(x, None, d, sum)
    });
    assert_eq!(out, vec![Item::Int(11)]);
}

#[rstest]
fn division_by_zero_at_run_time() {
    // for $x in (1,0) return 10 idiv $x
    let mut b = CoreBuilder::new();
    let d = b.int_seq(&[1, 0]);
    let x = b.for_var("x", d);
    let ten = b.int(10);
    let xr = b.var(x);
    let q = b.call(Builtin::IDiv, &[ten, xr]);
    let f = b.for_in(x, None, d, q);
    let tree = b.finish(f);
    let program = compile_core(&tree, &CompileOptions::default()).unwrap();
    let err = execute(&program, &mut Store::new()).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::FOAR0001));
}

#[rstest]
fn division_by_literal_zero_is_rejected() {
    let mut b = CoreBuilder::new();
    let (x, y) = (b.int(1), b.int(0));
    let q = b.call(Builtin::IDiv, &[x, y]);
    let tree = b.finish(q);
    let err = compile_core(&tree, &CompileOptions::default()).unwrap_err();
    assert_eq!(err.code, ErrorCode::FOAR0001);
}

#[rstest]
fn casts_convert_values() {
    let out = call(|b| {
        let i = b.int(3);
        let d = b.cast_to(AtomicType::Double, i);
        let st = b.str("12");
        let n = b.cast_to(AtomicType::Integer, st);
        let f = b.dec(2.5);
        let fs = b.cast_to(AtomicType::String, f);
        b.seq_all(&[d, n, fs])
    });
    assert_eq!(out, vec![Item::Dbl(3.0), Item::Int(12), s("2.5")]);
}

#[rstest]
fn failing_cast_raises_forg0001() {
    let mut b = CoreBuilder::new();
    let st = b.str("twelve");
    let q = b.cast_to(AtomicType::Integer, st);
    let tree = b.finish(q);
    let program = compile_core(&tree, &CompileOptions::default()).unwrap();
    let err = execute(&program, &mut Store::new()).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::FORG0001));
}

#[rstest]
fn wrong_arity_is_unknown_function() {
    let mut b = CoreBuilder::new();
    let (x, y) = (b.int(1), b.int(2));
    let q = b.call(Builtin::Count, &[x, y]);
    let tree = b.finish(q);
    let err = compile_core(&tree, &CompileOptions::builder().simplify(false).build()).unwrap_err();
    assert_eq!(err.code, ErrorCode::XPST0017);
}
