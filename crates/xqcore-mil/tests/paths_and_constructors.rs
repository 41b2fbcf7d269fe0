use rstest::{fixture, rstest};
use xqcore_mil::core::{Axis, Builtin, CoreBuilder, CoreTree, NodeId, NodeTest, NodeType, QName};
use xqcore_mil::engine::store::{Store, doc, elem, text};
use xqcore_mil::engine::{Item, execute};
use xqcore_mil::{CompileOptions, ErrorCode, compile_core};

#[fixture]
fn store() -> Store {
    let mut store = Store::new();
    store.load(
        "books.xml",
        doc().child(
            elem("lib")
                .child(elem("book").attr("id", "b1").child(elem("title").child(text("Dune"))))
                .child(elem("book").attr("id", "b2").child(elem("title").child(text("Emma")))),
        ),
    );
    store
}

fn texts(tree: &CoreTree, store: &mut Store) -> Vec<String> {
    let program = compile_core(tree, &CompileOptions::default()).unwrap();
    let items = execute(&program, store).unwrap().items();
    items.iter().map(|i| i.to_text(store)).collect()
}

fn library(b: &mut CoreBuilder) -> NodeId {
    let uri = b.str("books.xml");
    let d = b.call(Builtin::Doc, &[uri]);
    b.child("lib", d)
}

#[rstest]
fn child_steps_return_nodes_in_document_order(mut store: Store) {
    let mut b = CoreBuilder::new();
    let lib = library(&mut b);
    let books = b.child("book", lib);
    let titles = b.child("title", books);
    let tree = b.finish(titles);
    assert_eq!(texts(&tree, &mut store), vec!["Dune", "Emma"]);
}

#[rstest]
fn attribute_step(mut store: Store) {
    let mut b = CoreBuilder::new();
    let lib = library(&mut b);
    let books = b.child("book", lib);
    let ids = b.step(Axis::Attribute, NodeTest::Name(QName::local("id")), books);
    let tree = b.finish(ids);
    assert_eq!(texts(&tree, &mut store), vec!["b1", "b2"]);
}

#[rstest]
fn steps_inside_a_loop_stay_per_iteration(mut store: Store) {
    // for $b in doc("books.xml")/lib/book return count($b/title)
    let mut b = CoreBuilder::new();
    let lib = library(&mut b);
    let books = b.child("book", lib);
    let v = b.for_var("b", books);
    let br = b.var(v);
    let t = b.child("title", br);
    let c = b.call(Builtin::Count, &[t]);
    let f = b.for_in(v, None, books, c);
    let tree = b.finish(f);
    assert_eq!(texts(&tree, &mut store), vec!["1", "1"]);
}

#[rstest]
fn unknown_document_is_a_dynamic_error(mut store: Store) {
    let mut b = CoreBuilder::new();
    let uri = b.str("missing.xml");
    let d = b.call(Builtin::Doc, &[uri]);
    let tree = b.finish(d);
    let program = compile_core(&tree, &CompileOptions::default()).unwrap();
    let err = execute(&program, &mut store).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::FODC0002));
}

#[rstest]
fn step_over_atomic_context_is_rejected() {
    let mut b = CoreBuilder::new();
    let one = b.int(1);
    let s = b.child("a", one);
    let tree = b.finish(s);
    let err = compile_core(&tree, &CompileOptions::default()).unwrap_err();
    assert_eq!(err.code, ErrorCode::XPTY0019);
}

#[rstest]
fn impossible_axis_test_is_rejected() {
    let mut b = CoreBuilder::new();
    let r = b.root();
    let s = b.step(Axis::Attribute, NodeTest::Kind(NodeType::Element), r);
    let tree = b.finish(s);
    let err = compile_core(&tree, &CompileOptions::default()).unwrap_err();
    assert_eq!(err.code, ErrorCode::XQST0070);
}

#[rstest]
fn element_constructor_with_atomic_content(mut store: Store) {
    // element e { 1, "two" }
    let mut b = CoreBuilder::new();
    let one = b.int(1);
    let two = b.str("two");
    let content = b.seq(one, two);
    let e = b.elem_named("e", content);
    let tree = b.finish(e);
    assert_eq!(texts(&tree, &mut store), vec!["1 two"]);
}

#[rstest]
fn constructors_run_once_per_iteration(mut store: Store) {
    // for $x in ("a","b") return element w { attribute n { $x }, text { $x } }
    let mut b = CoreBuilder::new();
    let d = b.str_seq(&["a", "b"]);
    let x = b.for_var("x", d);
    let (x1, x2) = (b.var(x), b.var(x));
    let a = b.attr_named("n", x1);
    let t = b.text(x2);
    let content = b.seq(a, t);
    let w = b.elem_named("w", content);
    let f = b.for_in(x, None, d, w);
    let tree = b.finish(f);

    let program = compile_core(&tree, &CompileOptions::default()).unwrap();
    let items = execute(&program, &mut store).unwrap().items();
    assert_eq!(items.len(), 2);
    let Item::Node(first) = &items[0] else { panic!("expected a node, got {:?}", items[0]) };
    let first = *first;
    assert_eq!(store.string_value(first), "a");
    assert_eq!(store.attributes(first).len(), 1);
    assert_eq!(store.value(store.attributes(first)[0]), "a");
}

#[rstest]
fn copied_content_keeps_the_source_intact(mut store: Store) {
    // element copy { doc("books.xml")/lib/book }
    let mut b = CoreBuilder::new();
    let lib = library(&mut b);
    let books = b.child("book", lib);
    let e = b.elem_named("copy", books);
    let tree = b.finish(e);
    assert_eq!(texts(&tree, &mut store), vec!["DuneEmma"]);

    let mut b = CoreBuilder::new();
    let lib = library(&mut b);
    let books = b.child("book", lib);
    let tree = b.finish(books);
    assert_eq!(texts(&tree, &mut store), vec!["Dune", "Emma"]);
}
