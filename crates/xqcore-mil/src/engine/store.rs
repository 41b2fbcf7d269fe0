//! In-memory working set: loaded documents plus nodes constructed at run time.
//!
//! Nodes live in one arena and are addressed by [`NodeRef`]. Every node knows
//! the root of its tree and its preorder rank inside it, which together give
//! document order. Constructed trees are renumbered once they are complete.
//!
//! ```
//! use xqcore_mil::engine::store::{Store, doc, elem, text};
//!
//! // <people><person age="31">Ann</person></people>
//! let mut store = Store::new();
//! let d = store.load(
//!     "people.xml",
//!     doc().child(elem("people").child(elem("person").attr("age", "31").child(text("Ann")))),
//! );
//! assert_eq!(store.string_value(d), "Ann");
//! assert_eq!(store.document("people.xml"), Some(d));
//! ```
use std::cmp::Ordering;
use std::collections::HashMap;

use compact_str::CompactString;

use crate::core::{Axis, NodeTest, NodeType, QName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub u32);

impl NodeRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Document,
    Element,
    Attribute,
    Text,
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    name: Option<QName>,
    value: CompactString,
    parent: Option<NodeRef>,
    attributes: Vec<NodeRef>,
    children: Vec<NodeRef>,
    root: NodeRef,
    rank: u32,
}

#[derive(Debug, Default)]
pub struct Store {
    nodes: Vec<Node>,
    documents: HashMap<String, NodeRef>,
    context: Option<NodeRef>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a document under `uri`; the first one loaded becomes the context document.
    pub fn load(&mut self, uri: &str, builder: NodeBuilder) -> NodeRef {
        let root = self.build(builder);
        self.renumber(root);
        self.documents.insert(uri.to_string(), root);
        self.context.get_or_insert(root);
        root
    }

    pub fn set_context(&mut self, uri: &str) -> bool {
        match self.documents.get(uri) {
            Some(d) => {
                self.context = Some(*d);
                true
            }
            None => false,
        }
    }

    pub fn document(&self, uri: &str) -> Option<NodeRef> {
        self.documents.get(uri).copied()
    }

    pub fn context(&self) -> Option<NodeRef> {
        self.context
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node(&self, n: NodeRef) -> Option<&Node> {
        self.nodes.get(n.index())
    }

    pub fn contains(&self, n: NodeRef) -> bool {
        n.index() < self.nodes.len()
    }

    pub fn kind(&self, n: NodeRef) -> Option<NodeKind> {
        self.node(n).map(|x| x.kind)
    }

    pub fn name(&self, n: NodeRef) -> Option<&QName> {
        self.node(n).and_then(|x| x.name.as_ref())
    }

    pub fn parent(&self, n: NodeRef) -> Option<NodeRef> {
        self.node(n).and_then(|x| x.parent)
    }

    pub fn children(&self, n: NodeRef) -> &[NodeRef] {
        self.node(n).map_or(&[], |x| x.children.as_slice())
    }

    pub fn attributes(&self, n: NodeRef) -> &[NodeRef] {
        self.node(n).map_or(&[], |x| x.attributes.as_slice())
    }

    pub fn value(&self, n: NodeRef) -> &str {
        self.node(n).map_or("", |x| x.value.as_str())
    }

    pub fn string_value(&self, n: NodeRef) -> String {
        match self.kind(n) {
            Some(NodeKind::Text | NodeKind::Attribute) => self.value(n).to_string(),
            Some(NodeKind::Document | NodeKind::Element) => {
                let mut out = String::new();
                self.collect_text(n, &mut out);
                out
            }
            None => String::new(),
        }
    }

    fn collect_text(&self, n: NodeRef, out: &mut String) {
        for c in self.children(n) {
            match self.kind(*c) {
                Some(NodeKind::Text) => out.push_str(self.value(*c)),
                Some(NodeKind::Element) => self.collect_text(*c, out),
                _ => {}
            }
        }
    }

    pub fn document_order(&self, a: NodeRef, b: NodeRef) -> Ordering {
        let key = |n: NodeRef| self.node(n).map_or((u32::MAX, u32::MAX), |x| (x.root.0, x.rank));
        key(a).cmp(&key(b))
    }

    fn alloc(&mut self, kind: NodeKind, name: Option<QName>, value: CompactString) -> NodeRef {
        let id = NodeRef(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(Node {
            kind,
            name,
            value,
            parent: None,
            attributes: Vec::new(),
            children: Vec::new(),
            root: id,
            rank: 0,
        });
        id
    }

    pub fn new_element(&mut self, name: QName) -> NodeRef {
        self.alloc(NodeKind::Element, Some(name), CompactString::default())
    }

    pub fn new_attribute(&mut self, name: QName, value: &str) -> NodeRef {
        self.alloc(NodeKind::Attribute, Some(name), CompactString::from(value))
    }

    pub fn new_text(&mut self, value: &str) -> NodeRef {
        self.alloc(NodeKind::Text, None, CompactString::from(value))
    }

    /// Attach a parentless node; attributes go to the attribute list.
    pub fn adopt(&mut self, parent: NodeRef, child: NodeRef) {
        let is_attr = self.kind(child) == Some(NodeKind::Attribute);
        if let Some(c) = self.nodes.get_mut(child.index()) {
            c.parent = Some(parent);
        }
        if let Some(p) = self.nodes.get_mut(parent.index()) {
            if is_attr { p.attributes.push(child) } else { p.children.push(child) }
        }
    }

    /// Append text to the last text child of `parent`, or add a new text child.
    pub fn append_text(&mut self, parent: NodeRef, text: &str) {
        if let Some(&last) = self.children(parent).last()
            && self.kind(last) == Some(NodeKind::Text)
            && let Some(t) = self.nodes.get_mut(last.index())
        {
            t.value.push_str(text);
            return;
        }
        let t = self.new_text(text);
        self.adopt(parent, t);
    }

    pub fn is_parentless(&self, n: NodeRef) -> bool {
        self.node(n).is_some_and(|x| x.parent.is_none())
    }

    /// Copy the subtree rooted at `n`; a copied document contributes its children.
    pub fn deep_copy_into(&mut self, parent: NodeRef, n: NodeRef) {
        let Some(src) = self.node(n).cloned() else { return };
        match src.kind {
            NodeKind::Document => {
                for c in src.children {
                    self.deep_copy_into(parent, c);
                }
            }
            NodeKind::Text => self.append_text(parent, &src.value),
            NodeKind::Attribute => {
                let a = self.alloc(NodeKind::Attribute, src.name, src.value);
                self.adopt(parent, a);
            }
            NodeKind::Element => {
                let e = self.alloc(NodeKind::Element, src.name, CompactString::default());
                self.adopt(parent, e);
                for a in src.attributes {
                    self.deep_copy_into(e, a);
                }
                for c in src.children {
                    self.deep_copy_into(e, c);
                }
            }
        }
    }

    /// Assign root and preorder rank to every node below `root`.
    pub fn renumber(&mut self, root: NodeRef) {
        let mut rank = 0u32;
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            let (attrs, children) = match self.nodes.get_mut(n.index()) {
                Some(node) => {
                    node.root = root;
                    node.rank = rank;
                    rank += 1;
                    (node.attributes.clone(), node.children.clone())
                }
                None => continue,
            };
            for a in attrs {
                if let Some(node) = self.nodes.get_mut(a.index()) {
                    node.root = root;
                    node.rank = rank;
                    rank += 1;
                }
            }
            stack.extend(children.into_iter().rev());
        }
    }

    fn build(&mut self, b: NodeBuilder) -> NodeRef {
        let n = self.alloc(b.kind, b.name, b.value);
        for (name, value) in b.attributes {
            let a = self.new_attribute(name, &value);
            self.adopt(n, a);
        }
        for c in b.children {
            let c = self.build(c);
            self.adopt(n, c);
        }
        n
    }

    fn test_matches(&self, n: NodeRef, principal: NodeKind, test: &NodeTest) -> bool {
        let Some(kind) = self.kind(n) else { return false };
        match test {
            NodeTest::Kind(NodeType::Any) => true,
            NodeTest::Kind(NodeType::Document) => kind == NodeKind::Document,
            NodeTest::Kind(NodeType::Element) => kind == NodeKind::Element,
            NodeTest::Kind(NodeType::Attribute) => kind == NodeKind::Attribute,
            NodeTest::Kind(NodeType::Text) => kind == NodeKind::Text,
            NodeTest::Wildcard => kind == principal,
            NodeTest::Name(q) => {
                kind == principal
                    && self.name(n).is_some_and(|name| name.local == q.local && name.ns_uri == q.ns_uri)
            }
        }
    }

    fn descendants(&self, n: NodeRef, out: &mut Vec<NodeRef>) {
        for c in self.children(n) {
            out.push(*c);
            self.descendants(*c, out);
        }
    }

    fn siblings(&self, n: NodeRef) -> (&[NodeRef], Option<usize>) {
        if self.kind(n) == Some(NodeKind::Attribute) {
            return (&[], None);
        }
        match self.parent(n) {
            Some(p) => {
                let sibs = self.children(p);
                (sibs, sibs.iter().position(|s| *s == n))
            }
            None => (&[], None),
        }
    }

    fn ancestors_or_self(&self, n: NodeRef) -> Vec<NodeRef> {
        let mut out = vec![n];
        let mut cur = n;
        while let Some(p) = self.parent(cur) {
            out.push(p);
            cur = p;
        }
        out
    }

    /// Nodes reachable from `n` along `axis` that satisfy `test`, unordered.
    pub fn axis(&self, n: NodeRef, axis: Axis, test: &NodeTest) -> Vec<NodeRef> {
        let mut out = Vec::new();
        match axis {
            Axis::Child => out.extend_from_slice(self.children(n)),
            Axis::Descendant => self.descendants(n, &mut out),
            Axis::DescendantOrSelf => {
                out.push(n);
                self.descendants(n, &mut out);
            }
            Axis::SelfAxis => out.push(n),
            Axis::Attribute => out.extend_from_slice(self.attributes(n)),
            Axis::Parent => out.extend(self.parent(n)),
            Axis::Ancestor => out.extend(self.ancestors_or_self(n).into_iter().skip(1)),
            Axis::AncestorOrSelf => out.extend(self.ancestors_or_self(n)),
            Axis::FollowingSibling => {
                if let (sibs, Some(i)) = self.siblings(n) {
                    out.extend_from_slice(&sibs[i + 1..]);
                }
            }
            Axis::PrecedingSibling => {
                if let (sibs, Some(i)) = self.siblings(n) {
                    out.extend_from_slice(&sibs[..i]);
                }
            }
            Axis::Following | Axis::Preceding => {
                let following = axis == Axis::Following;
                for a in self.ancestors_or_self(n) {
                    if let (sibs, Some(i)) = self.siblings(a) {
                        let range = if following { &sibs[i + 1..] } else { &sibs[..i] };
                        for s in range {
                            out.push(*s);
                            self.descendants(*s, &mut out);
                        }
                    }
                }
            }
        }
        let principal = if axis == Axis::Attribute { NodeKind::Attribute } else { NodeKind::Element };
        out.retain(|m| self.test_matches(*m, principal, test));
        out
    }
}

/// Declarative description of a tree to load into a [`Store`].
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    kind: NodeKind,
    name: Option<QName>,
    value: CompactString,
    attributes: Vec<(QName, String)>,
    children: Vec<NodeBuilder>,
}

impl NodeBuilder {
    fn new(kind: NodeKind, name: Option<QName>, value: &str) -> Self {
        Self { kind, name, value: CompactString::from(value), attributes: Vec::new(), children: Vec::new() }
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.push((QName::local(name), value.to_string()));
        self
    }

    pub fn child(mut self, child: NodeBuilder) -> Self {
        self.children.push(child);
        self
    }

    pub fn children<I: IntoIterator<Item = NodeBuilder>>(mut self, it: I) -> Self {
        self.children.extend(it);
        self
    }
}

pub fn doc() -> NodeBuilder {
    NodeBuilder::new(NodeKind::Document, None, "")
}

pub fn elem(name: &str) -> NodeBuilder {
    NodeBuilder::new(NodeKind::Element, Some(QName::local(name)), "")
}

pub fn text(value: &str) -> NodeBuilder {
    NodeBuilder::new(NodeKind::Text, None, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(store: &mut Store) -> NodeRef {
        store.load(
            "t.xml",
            doc().child(
                elem("r")
                    .attr("a", "1")
                    .child(elem("x").child(text("one")))
                    .child(elem("y").child(elem("x").child(text("two")))),
            ),
        )
    }

    #[test]
    fn descendant_axis_with_name_test() {
        let mut store = Store::new();
        let d = sample(&mut store);
        let xs = store.axis(d, Axis::Descendant, &NodeTest::Name(QName::local("x")));
        let values: Vec<String> = xs.iter().map(|n| store.string_value(*n)).collect();
        assert_eq!(values, vec!["one", "two"]);
    }

    #[test]
    fn attributes_precede_children_in_document_order() {
        let mut store = Store::new();
        let d = sample(&mut store);
        let r = store.children(d)[0];
        let a = store.attributes(r)[0];
        let x = store.children(r)[0];
        assert_eq!(store.document_order(a, x), Ordering::Less);
        assert_eq!(store.document_order(r, a), Ordering::Less);
    }

    #[test]
    fn following_excludes_descendants() {
        let mut store = Store::new();
        let d = sample(&mut store);
        let r = store.children(d)[0];
        let x = store.children(r)[0];
        let f = store.axis(x, Axis::Following, &NodeTest::Wildcard);
        let names: Vec<String> = f.iter().filter_map(|n| store.name(*n)).map(|q| q.local.to_string()).collect();
        assert_eq!(names, vec!["y", "x"]);
    }
}
