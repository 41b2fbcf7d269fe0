use proptest::prelude::*;
use rstest::rstest;
use xqcore_mil::core::{Builtin, CoreBuilder, CoreTree, NodeId};
use xqcore_mil::engine::store::Store;
use xqcore_mil::engine::{Item, execute};
use xqcore_mil::{CompileOptions, compile_core};

fn run(tree: &CoreTree, joins: bool) -> Vec<Item> {
    let opts = CompileOptions::builder().recognize_joins(joins).build();
    let program = compile_core(tree, &opts).unwrap();
    execute(&program, &mut Store::new()).unwrap().items()
}

/// for $x in d1 return for $y in d2 return if (cmp($x, $y)) then ($x, $y) else ()
fn pairs(d1: &[i64], d2: &[i64], cmp: Builtin) -> CoreTree {
    let mut b = CoreBuilder::new();
    let s1 = b.int_seq(d1);
    let s2 = b.int_seq(d2);
    let x = b.for_var("x", s1);
    let y = b.for_var("y", s2);
    let (xr, yr) = (b.var(x), b.var(y));
    let cond = b.call(cmp, &[xr, yr]);
    let (xr2, yr2) = (b.var(x), b.var(y));
    let pair = b.seq(xr2, yr2);
    let none = b.empty();
    let filter = b.if_(cond, pair, none);
    let inner = b.for_in(y, None, s2, filter);
    let outer = b.for_in(x, None, s1, inner);
    b.finish(outer)
}

#[rstest]
#[case(true)]
#[case(false)]
fn equi_join_returns_matching_pair(#[case] joins: bool) {
    let tree = pairs(&[1, 2], &[2, 3], Builtin::Eq);
    assert_eq!(run(&tree, joins), vec![Item::Int(2), Item::Int(2)]);
}

#[rstest]
#[case(Builtin::Lt, &[1, 2, 1, 3, 2, 3])]
#[case(Builtin::Ge, &[2, 2])]
#[case(Builtin::Ne, &[1, 2, 1, 3, 2, 3])]
fn theta_joins_follow_the_comparison(#[case] cmp: Builtin, #[case] expected: &[i64]) {
    let tree = pairs(&[1, 2], &[2, 3], cmp);
    let expected: Vec<Item> = expected.iter().copied().map(Item::Int).collect();
    assert_eq!(run(&tree, true), expected);
    assert_eq!(run(&tree, false), expected);
}

#[rstest]
fn join_keeps_positional_variable_of_the_input() {
    // for $x in (5,7) return for $y at $i in (7,5,7) return if ($y = $x) then $i else ()
    let mut b = CoreBuilder::new();
    let s1 = b.int_seq(&[5, 7]);
    let s2 = b.int_seq(&[7, 5, 7]);
    let x = b.for_var("x", s1);
    let y = b.for_var("y", s2);
    let i = b.pos_var("i");
    let (yr, xr) = (b.var(y), b.var(x));
    let cond = b.eq(yr, xr);
    let ir = b.var(i);
    let none = b.empty();
    let filter = b.if_(cond, ir, none);
    let inner = b.for_in(y, Some(i), s2, filter);
    let outer = b.for_in(x, None, s1, inner);
    let tree = b.finish(outer);
    let expected = vec![Item::Int(2), Item::Int(1), Item::Int(3)];
    assert_eq!(run(&tree, true), expected);
    assert_eq!(run(&tree, false), expected);
}

#[rstest]
fn independent_operand_is_lifted_through_loops() {
    // for $x in (1,2) return for $z in (0,0) return
    //   for $y in (1,2,3) return if ($y = $x) then $y else ()
    let mut b = CoreBuilder::new();
    let s1 = b.int_seq(&[1, 2]);
    let s0 = b.int_seq(&[0, 0]);
    let s2 = b.int_seq(&[1, 2, 3]);
    let x = b.for_var("x", s1);
    let z = b.for_var("z", s0);
    let y = b.for_var("y", s2);
    let (yr, xr) = (b.var(y), b.var(x));
    let cond = b.eq(yr, xr);
    let yr2 = b.var(y);
    let none = b.empty();
    let filter = b.if_(cond, yr2, none);
    let l3 = b.for_in(y, None, s2, filter);
    let l2 = b.for_in(z, None, s0, l3);
    let l1 = b.for_in(x, None, s1, l2);
    let tree = b.finish(l1);
    let expected: Vec<Item> = [1, 1, 2, 2].into_iter().map(Item::Int).collect();
    assert_eq!(run(&tree, true), expected);
    assert_eq!(run(&tree, false), expected);
}

/// Literal sequences of one atomic domain.
#[derive(Debug, Clone)]
enum Lits {
    Int(Vec<i64>),
    Dbl(Vec<f64>),
    Str(Vec<String>),
}

impl Lits {
    fn build(&self, b: &mut CoreBuilder) -> NodeId {
        let items: Vec<NodeId> = match self {
            Lits::Int(v) => v.iter().map(|x| b.int(*x)).collect(),
            Lits::Dbl(v) => v.iter().map(|x| b.dbl(*x)).collect(),
            Lits::Str(v) => v.iter().map(|x| b.str(x)).collect(),
        };
        b.seq_all(&items)
    }

    fn items(&self) -> Vec<Item> {
        match self {
            Lits::Int(v) => v.iter().copied().map(Item::Int).collect(),
            Lits::Dbl(v) => v.iter().copied().map(Item::Dbl).collect(),
            Lits::Str(v) => v.iter().cloned().map(Item::Str).collect(),
        }
    }
}

/// Two sequences of the same domain.
fn same_domain() -> impl Strategy<Value = (Lits, Lits)> {
    let ints = || prop::collection::vec(-4i64..4, 1..6);
    let dbls = || prop::collection::vec((-6i32..6).prop_map(|h| f64::from(h) / 2.0), 1..6);
    let strs = || prop::collection::vec("[a-c]{0,2}", 1..6);
    prop_oneof![
        (ints(), ints()).prop_map(|(a, b)| (Lits::Int(a), Lits::Int(b))),
        (dbls(), dbls()).prop_map(|(a, b)| (Lits::Dbl(a), Lits::Dbl(b))),
        (strs(), strs()).prop_map(|(a, b)| (Lits::Str(a), Lits::Str(b))),
    ]
}

fn holds<T: PartialOrd>(cmp: Builtin, a: &T, b: &T) -> bool {
    match cmp {
        Builtin::Eq => a == b,
        Builtin::Ne => a != b,
        Builtin::Lt => a < b,
        Builtin::Le => a <= b,
        Builtin::Gt => a > b,
        _ => a >= b,
    }
}

fn item_holds(cmp: Builtin, a: &Item, b: &Item) -> bool {
    match (a, b) {
        (Item::Int(x), Item::Int(y)) => holds(cmp, x, y),
        (Item::Dbl(x), Item::Dbl(y)) => holds(cmp, x, y),
        (Item::Str(x), Item::Str(y)) => holds(cmp, x, y),
        _ => false,
    }
}

/// for $x in d1 return if (some $z in d2 satisfies cmp($x, $z)) then $x else ()
fn quantified(d1: &Lits, d2: &Lits, cmp: Builtin) -> CoreTree {
    let mut b = CoreBuilder::new();
    let s1 = d1.build(&mut b);
    let s2 = d2.build(&mut b);
    let x = b.for_var("x", s1);
    let z = b.for_var("z", s2);
    let (xr, zr) = (b.var(x), b.var(z));
    let test = b.call(cmp, &[xr, zr]);
    let (yes, none) = (b.boolean(true), b.empty());
    let hit = b.if_(test, yes, none);
    let some = b.for_in(z, None, s2, hit);
    let cond = b.call(Builtin::Exists, &[some]);
    let (xr2, none) = (b.var(x), b.empty());
    let filter = b.if_(cond, xr2, none);
    let outer = b.for_in(x, None, s1, filter);
    b.finish(outer)
}

/// for $x in d1 return for $y in d2 return if (cmp($x + 1, $y)) then $y else ()
fn shifted(d1: &[i64], d2: &[i64], cmp: Builtin) -> CoreTree {
    let mut b = CoreBuilder::new();
    let s1 = b.int_seq(d1);
    let s2 = b.int_seq(d2);
    let x = b.for_var("x", s1);
    let y = b.for_var("y", s2);
    let (xr, one, yr) = (b.var(x), b.int(1), b.var(y));
    let next = b.call(Builtin::Plus, &[xr, one]);
    let cond = b.call(cmp, &[next, yr]);
    let (yr2, none) = (b.var(y), b.empty());
    let filter = b.if_(cond, yr2, none);
    let inner = b.for_in(y, None, s2, filter);
    let outer = b.for_in(x, None, s1, inner);
    b.finish(outer)
}

fn comparison() -> impl Strategy<Value = Builtin> {
    prop_oneof![
        Just(Builtin::Eq),
        Just(Builtin::Ne),
        Just(Builtin::Lt),
        Just(Builtin::Le),
        Just(Builtin::Gt),
        Just(Builtin::Ge),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    // Recognizing joins never changes what a query returns.
    #[test]
    fn join_rewrite_preserves_results(
        d1 in prop::collection::vec(-5i64..5, 2..6),
        d2 in prop::collection::vec(-5i64..5, 2..6),
        cmp in comparison(),
    ) {
        let tree = pairs(&d1, &d2, cmp);
        prop_assert_eq!(run(&tree, true), run(&tree, false));
    }

    // The quantified form keeps each outer item at most once.
    #[test]
    fn quantified_join_matches_direct_evaluation((d1, d2) in same_domain(), cmp in comparison()) {
        let tree = quantified(&d1, &d2, cmp);
        let (xs, zs) = (d1.items(), d2.items());
        let expected: Vec<Item> =
            xs.iter().filter(|x| zs.iter().any(|z| item_holds(cmp, x, z))).cloned().collect();
        prop_assert_eq!(run(&tree, true), expected.clone());
        prop_assert_eq!(run(&tree, false), expected);
    }

    // The loop-side operand may be any expression over the loop variable.
    #[test]
    fn computed_operand_join_matches_direct_evaluation(
        d1 in prop::collection::vec(-4i64..4, 1..6),
        d2 in prop::collection::vec(-4i64..4, 1..6),
        cmp in comparison(),
    ) {
        let tree = shifted(&d1, &d2, cmp);
        let expected: Vec<Item> = d1
            .iter()
            .flat_map(|x| d2.iter().filter(move |y| holds(cmp, &(x + 1), *y)).map(|y| Item::Int(*y)))
            .collect();
        prop_assert_eq!(run(&tree, true), expected.clone());
        prop_assert_eq!(run(&tree, false), expected);
    }

    // Double and string comparisons join like integer ones.
    #[test]
    fn join_over_each_domain_matches_direct_evaluation((d1, d2) in same_domain(), cmp in comparison()) {
        let mut b = CoreBuilder::new();
        let s1 = d1.build(&mut b);
        let s2 = d2.build(&mut b);
        let x = b.for_var("x", s1);
        let y = b.for_var("y", s2);
        let (xr, yr) = (b.var(x), b.var(y));
        let cond = b.call(cmp, &[xr, yr]);
        let (xr2, yr2) = (b.var(x), b.var(y));
        let pair = b.seq(xr2, yr2);
        let none = b.empty();
        let filter = b.if_(cond, pair, none);
        let inner = b.for_in(y, None, s2, filter);
        let outer = b.for_in(x, None, s1, inner);
        let tree = b.finish(outer);

        let (xs, ys) = (d1.items(), d2.items());
        let expected: Vec<Item> = xs
            .iter()
            .flat_map(|x| ys.iter().filter(move |y| item_holds(cmp, x, y)).flat_map(move |y| [x.clone(), y.clone()]))
            .collect();
        prop_assert_eq!(run(&tree, true), expected.clone());
        prop_assert_eq!(run(&tree, false), expected);
    }
}
