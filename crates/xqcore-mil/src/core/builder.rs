//! Convenience construction of typed Core trees.
//!
//! The upstream type checker is not part of this crate, so the builder
//! attaches a minimal static type to every node it creates. The rules are
//! the obvious structural ones (literals, sequence concatenation, iteration,
//! builtin signatures); they are precise enough for the backend's decisions.
//!
//! ```
//! use xqcore_mil::core::{CoreBuilder, Builtin};
//!
//! // for $x in (1, 2, 3) return $x + 1
//! let mut b = CoreBuilder::new();
//! let input = b.int_seq(&[1, 2, 3]);
//! let x = b.for_var("x", input);
//! let xr = b.var(x);
//! let one = b.int(1);
//! let body = b.call(Builtin::Plus, &[xr, one]);
//! let f = b.for_in(x, None, input, body);
//! let tree = b.finish(f);
//! assert_eq!(tree.query().unwrap(), f);
//! ```
use compact_str::CompactString;
use smallvec::SmallVec;

use super::functions::{Builtin, FunRef};
use super::types::{AtomicType, ItemType, NodeType, Occurrence, SeqType};
use super::{Axis, CoreKind, CoreTree, FunId, FunctionDecl, GlobalDecl, NodeId, NodeTest, QName, VarId};

#[derive(Debug, Default)]
pub struct CoreBuilder {
    tree: CoreTree,
}

impl CoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tree(&self) -> &CoreTree {
        &self.tree
    }

    pub fn finish(mut self, query: NodeId) -> CoreTree {
        self.tree.query = Some(query);
        self.tree
    }

    fn atomic(&mut self, kind: CoreKind, a: AtomicType) -> NodeId {
        self.tree.add(kind, SeqType::atomic(a))
    }

    pub fn int(&mut self, v: i64) -> NodeId {
        self.atomic(CoreKind::Int(v), AtomicType::Integer)
    }

    pub fn dec(&mut self, v: f64) -> NodeId {
        self.atomic(CoreKind::Dec(v), AtomicType::Decimal)
    }

    pub fn dbl(&mut self, v: f64) -> NodeId {
        self.atomic(CoreKind::Dbl(v), AtomicType::Double)
    }

    pub fn str(&mut self, v: &str) -> NodeId {
        self.atomic(CoreKind::Str(CompactString::from(v)), AtomicType::String)
    }

    pub fn boolean(&mut self, v: bool) -> NodeId {
        let kind = if v { CoreKind::True } else { CoreKind::False };
        self.atomic(kind, AtomicType::Boolean)
    }

    pub fn empty(&mut self) -> NodeId {
        self.tree.add(CoreKind::Empty, SeqType::Empty)
    }

    pub fn root(&mut self) -> NodeId {
        self.tree.add(CoreKind::Root, SeqType::node(NodeType::Document))
    }

    pub fn seq(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let ty = self.tree.ty(a).concat(&self.tree.ty(b));
        self.tree.add(CoreKind::Seq(a, b), ty)
    }

    /// Right-nested concatenation of `items`; `()` for an empty slice.
    pub fn seq_all(&mut self, items: &[NodeId]) -> NodeId {
        match items {
            [] => self.empty(),
            [one] => *one,
            [first, rest @ ..] => {
                let tail = self.seq_all(rest);
                self.seq(*first, tail)
            }
        }
    }

    pub fn int_seq(&mut self, values: &[i64]) -> NodeId {
        let items: Vec<NodeId> = values.iter().map(|v| self.int(*v)).collect();
        self.seq_all(&items)
    }

    pub fn str_seq(&mut self, values: &[&str]) -> NodeId {
        let items: Vec<NodeId> = values.iter().map(|v| self.str(v)).collect();
        self.seq_all(&items)
    }

    /// Declare the variable of a `for` iterating over `input`.
    pub fn for_var(&mut self, name: &str, input: NodeId) -> VarId {
        let ty = match self.tree.ty(input).item() {
            Some(i) => SeqType::one(i),
            None => SeqType::Empty,
        };
        self.tree.new_var(name, false, ty)
    }

    pub fn pos_var(&mut self, name: &str) -> VarId {
        self.tree.new_var(name, false, SeqType::integer())
    }

    pub fn let_var(&mut self, name: &str, bound: NodeId) -> VarId {
        let ty = self.tree.ty(bound);
        self.tree.new_var(name, false, ty)
    }

    /// Declare a global; its initializer is attached with [`Self::define_global`].
    pub fn global_var(&mut self, name: &str, ty: SeqType) -> VarId {
        self.tree.new_var(name, true, ty)
    }

    pub fn define_global(&mut self, var: VarId, init: NodeId) {
        self.tree.globals.push(GlobalDecl { var, init });
    }

    pub fn var(&mut self, v: VarId) -> NodeId {
        let ty = self.tree.var(v).ty;
        self.tree.add(CoreKind::Var(v), ty)
    }

    pub fn for_in(&mut self, var: VarId, pos: Option<VarId>, input: NodeId, body: NodeId) -> NodeId {
        let ty = self.tree.ty(input).iterate(&self.tree.ty(body));
        self.tree.add(CoreKind::For { var, pos, input, body }, ty)
    }

    pub fn let_in(&mut self, var: VarId, bound: NodeId, body: NodeId) -> NodeId {
        let ty = self.tree.ty(body);
        self.tree.add(CoreKind::Let { var, bound, body }, ty)
    }

    pub fn order_by(&mut self, key: NodeId, descending: bool, body: NodeId) -> NodeId {
        let ty = self.tree.ty(body);
        self.tree.add(CoreKind::OrderBy { key, descending, body }, ty)
    }

    pub fn if_(&mut self, cond: NodeId, then: NodeId, otherwise: NodeId) -> NodeId {
        let ty = self.tree.ty(then).alternative(&self.tree.ty(otherwise));
        self.tree.add(CoreKind::If { cond, then, otherwise }, ty)
    }

    pub fn typeswitch(&mut self, input: NodeId, case: SeqType, then: NodeId, otherwise: NodeId) -> NodeId {
        let ty = self.tree.ty(then).alternative(&self.tree.ty(otherwise));
        self.tree.add(CoreKind::Typeswitch { input, case, then, otherwise }, ty)
    }

    pub fn step(&mut self, axis: Axis, test: NodeTest, context: NodeId) -> NodeId {
        let node = match (&test, axis) {
            (NodeTest::Kind(k), _) => *k,
            (_, Axis::Attribute) => NodeType::Attribute,
            _ => NodeType::Element,
        };
        self.tree.add(CoreKind::Step { axis, test, context }, SeqType::star(ItemType::Node(node)))
    }

    pub fn child(&mut self, name: &str, context: NodeId) -> NodeId {
        self.step(Axis::Child, NodeTest::Name(QName::local(name)), context)
    }

    pub fn tag(&mut self, name: QName) -> NodeId {
        self.atomic(CoreKind::Tag(name), AtomicType::QName)
    }

    pub fn elem(&mut self, tag: NodeId, content: NodeId) -> NodeId {
        self.tree.add(CoreKind::Elem { tag, content }, SeqType::node(NodeType::Element))
    }

    pub fn elem_named(&mut self, name: &str, content: NodeId) -> NodeId {
        let tag = self.tag(QName::local(name));
        self.elem(tag, content)
    }

    pub fn attr(&mut self, tag: NodeId, content: NodeId) -> NodeId {
        self.tree.add(CoreKind::Attr { tag, content }, SeqType::node(NodeType::Attribute))
    }

    pub fn attr_named(&mut self, name: &str, content: NodeId) -> NodeId {
        let tag = self.tag(QName::local(name));
        self.attr(tag, content)
    }

    pub fn text(&mut self, content: NodeId) -> NodeId {
        let ty = if self.tree.ty(content).is_empty() {
            SeqType::Empty
        } else {
            SeqType::node(NodeType::Text)
        };
        self.tree.add(CoreKind::Text(content), ty)
    }

    pub fn cast(&mut self, target: SeqType, input: NodeId) -> NodeId {
        self.tree.add(CoreKind::Cast { target, input }, target)
    }

    /// `cast as a` (exactly one) or `cast as a?` when the input may be empty.
    pub fn cast_to(&mut self, a: AtomicType, input: NodeId) -> NodeId {
        let occ = if self.tree.ty(input).may_be_empty() { Occurrence::Optional } else { Occurrence::One };
        self.cast(SeqType::Items(ItemType::Atomic(a), occ), input)
    }

    pub fn call(&mut self, f: Builtin, args: &[NodeId]) -> NodeId {
        let types: Vec<SeqType> = args.iter().map(|a| self.tree.ty(*a)).collect();
        let ty = f.result_type(&types);
        self.tree.add(CoreKind::Apply { fun: FunRef::Builtin(f), args: SmallVec::from_slice(args) }, ty)
    }

    pub fn eq(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.call(Builtin::Eq, &[a, b])
    }

    pub fn declare_function(
        &mut self,
        name: &str,
        params: &[(&str, SeqType)],
        ret: SeqType,
    ) -> (FunId, Vec<VarId>) {
        let vars: Vec<VarId> = params.iter().map(|(n, t)| self.tree.new_var(n, false, *t)).collect();
        let id = FunId(u32::try_from(self.tree.functions.len()).unwrap_or(u32::MAX));
        self.tree.functions.push(FunctionDecl { name: QName::local(name), params: vars.clone(), body: None, ret });
        (id, vars)
    }

    pub fn define_function(&mut self, id: FunId, body: NodeId) {
        if let Some(f) = self.tree.functions.get_mut(id.index()) {
            f.body = Some(body);
        }
    }

    pub fn call_user(&mut self, id: FunId, args: &[NodeId]) -> NodeId {
        let ty = self.tree.functions.get(id.index()).map_or(SeqType::Empty, |f| f.ret);
        self.tree.add(CoreKind::Apply { fun: FunRef::User(id), args: SmallVec::from_slice(args) }, ty)
    }
}
