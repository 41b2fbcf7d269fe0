//! The typed Core tree consumed by the backend.
//!
//! Nodes live in an append-only arena ([`CoreTree`]) and refer to their
//! children by [`NodeId`]. Passes that rewrite the tree never overwrite a
//! node: they allocate replacements and return the new id, so a subtree may
//! be shared by several parents without anyone observing a mutation.
use std::fmt;
use std::collections::HashSet;

use compact_str::CompactString;
use smallvec::SmallVec;
use string_cache::DefaultAtom;

use crate::runtime::Error;

pub mod builder;
pub mod functions;
pub mod pretty;
pub mod types;

pub use builder::CoreBuilder;
pub use functions::{ArithOp, Builtin, Comparison, FunRef};
pub use types::{AtomicType, ItemType, NodeType, Occurrence, SeqType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl FunId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Resolved qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    pub prefix: Option<DefaultAtom>,
    pub local: DefaultAtom,
    pub ns_uri: Option<DefaultAtom>,
}

impl QName {
    pub fn local(local: &str) -> Self {
        Self { prefix: None, local: DefaultAtom::from(local), ns_uri: None }
    }

    pub fn new(prefix: Option<&str>, local: &str, ns_uri: Option<&str>) -> Self {
        Self {
            prefix: prefix.map(DefaultAtom::from),
            local: DefaultAtom::from(local),
            ns_uri: ns_uri.map(DefaultAtom::from),
        }
    }

    /// `{uri}local` (Clark notation); the form stored in the QName container.
    pub fn clark(&self) -> String {
        match &self.ns_uri {
            Some(ns) => format!("{{{ns}}}{}", self.local),
            None => self.local.to_string(),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(p) => write!(f, "{p}:{}", self.local),
            None => f.write_str(&self.local),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    SelfAxis,
    Attribute,
    Parent,
    Ancestor,
    AncestorOrSelf,
    FollowingSibling,
    PrecedingSibling,
    Following,
    Preceding,
}

impl Axis {
    pub fn name(self) -> &'static str {
        match self {
            Axis::Child => "child",
            Axis::Descendant => "descendant",
            Axis::DescendantOrSelf => "descendant-or-self",
            Axis::SelfAxis => "self",
            Axis::Attribute => "attribute",
            Axis::Parent => "parent",
            Axis::Ancestor => "ancestor",
            Axis::AncestorOrSelf => "ancestor-or-self",
            Axis::FollowingSibling => "following-sibling",
            Axis::PrecedingSibling => "preceding-sibling",
            Axis::Following => "following",
            Axis::Preceding => "preceding",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeTest {
    /// `node()` or a specific kind test (`text()`, `element()`, ...).
    Kind(NodeType),
    /// Name test against the principal node kind of the axis.
    Name(QName),
    /// `*` against the principal node kind of the axis.
    Wildcard,
}

impl fmt::Display for NodeTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeTest::Kind(k) => f.write_str(k.name()),
            NodeTest::Name(q) => write!(f, "{q}"),
            NodeTest::Wildcard => f.write_str("*"),
        }
    }
}

/// Where a join operand's values come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandExpr {
    /// The operand was exactly the loop variable; the driving sequence itself
    /// supplies the values.
    BoundInput,
    Expr(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JoinOperand {
    pub expr: OperandExpr,
    /// Atomic type both sides are cast to before comparing.
    pub cast: Option<AtomicType>,
    /// Deepest nesting level of a variable the operand references from
    /// outside the loop; `None` when it references none.
    pub level: Option<u32>,
    /// The operand was collapsed out of a quantifier loop and may yield any
    /// number of values per iteration.
    pub nested: bool,
}

/// A recognized `for`/`if`-comparison pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinNode {
    pub var: VarId,
    pub pos: Option<VarId>,
    pub input: NodeId,
    pub fst: JoinOperand,
    pub snd: JoinOperand,
    pub cmp: Comparison,
    /// `cmp` was written as `cmp(snd, fst)`.
    pub switched: bool,
    pub ret: NodeId,
}

impl JoinNode {
    /// Comparison to apply as `fst <op> snd`.
    pub fn oriented(&self) -> Comparison {
        if self.switched { self.cmp.flip() } else { self.cmp }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoreKind {
    Empty,
    Str(CompactString),
    Int(i64),
    Dec(f64),
    Dbl(f64),
    True,
    False,
    Var(VarId),
    Seq(NodeId, NodeId),
    For { var: VarId, pos: Option<VarId>, input: NodeId, body: NodeId },
    Let { var: VarId, bound: NodeId, body: NodeId },
    /// Only valid as the direct body of a `For`.
    OrderBy { key: NodeId, descending: bool, body: NodeId },
    If { cond: NodeId, then: NodeId, otherwise: NodeId },
    Typeswitch { input: NodeId, case: SeqType, then: NodeId, otherwise: NodeId },
    Step { axis: Axis, test: NodeTest, context: NodeId },
    Root,
    Elem { tag: NodeId, content: NodeId },
    Attr { tag: NodeId, content: NodeId },
    Text(NodeId),
    Tag(QName),
    Cast { target: SeqType, input: NodeId },
    Apply { fun: FunRef, args: SmallVec<[NodeId; 4]> },
    Join(Box<JoinNode>),
}

impl CoreKind {
    pub fn children(&self) -> SmallVec<[NodeId; 4]> {
        let mut out = SmallVec::new();
        match self {
            CoreKind::Empty
            | CoreKind::Str(_)
            | CoreKind::Int(_)
            | CoreKind::Dec(_)
            | CoreKind::Dbl(_)
            | CoreKind::True
            | CoreKind::False
            | CoreKind::Var(_)
            | CoreKind::Root
            | CoreKind::Tag(_) => {}
            CoreKind::Seq(a, b) => out.extend([*a, *b]),
            CoreKind::For { input, body, .. } => out.extend([*input, *body]),
            CoreKind::Let { bound, body, .. } => out.extend([*bound, *body]),
            CoreKind::OrderBy { key, body, .. } => out.extend([*key, *body]),
            CoreKind::If { cond, then, otherwise } => out.extend([*cond, *then, *otherwise]),
            CoreKind::Typeswitch { input, then, otherwise, .. } => out.extend([*input, *then, *otherwise]),
            CoreKind::Step { context, .. } => out.push(*context),
            CoreKind::Elem { tag, content } | CoreKind::Attr { tag, content } => out.extend([*tag, *content]),
            CoreKind::Text(c) => out.push(*c),
            CoreKind::Cast { input, .. } => out.push(*input),
            CoreKind::Apply { args, .. } => out.extend(args.iter().copied()),
            CoreKind::Join(j) => {
                out.push(j.input);
                if let OperandExpr::Expr(e) = j.fst.expr {
                    out.push(e);
                }
                if let OperandExpr::Expr(e) = j.snd.expr {
                    out.push(e);
                }
                out.push(j.ret);
            }
        }
        out
    }

    /// Rebuild with every child replaced by `f(child)`; child order as in [`Self::children`].
    pub fn map_children(
        &self,
        mut f: impl FnMut(NodeId) -> Result<NodeId, Error>,
    ) -> Result<CoreKind, Error> {
        Ok(match self {
            CoreKind::Empty
            | CoreKind::Str(_)
            | CoreKind::Int(_)
            | CoreKind::Dec(_)
            | CoreKind::Dbl(_)
            | CoreKind::True
            | CoreKind::False
            | CoreKind::Var(_)
            | CoreKind::Root
            | CoreKind::Tag(_) => self.clone(),
            CoreKind::Seq(a, b) => CoreKind::Seq(f(*a)?, f(*b)?),
            CoreKind::For { var, pos, input, body } => {
                CoreKind::For { var: *var, pos: *pos, input: f(*input)?, body: f(*body)? }
            }
            CoreKind::Let { var, bound, body } => CoreKind::Let { var: *var, bound: f(*bound)?, body: f(*body)? },
            CoreKind::OrderBy { key, descending, body } => {
                CoreKind::OrderBy { key: f(*key)?, descending: *descending, body: f(*body)? }
            }
            CoreKind::If { cond, then, otherwise } => {
                CoreKind::If { cond: f(*cond)?, then: f(*then)?, otherwise: f(*otherwise)? }
            }
            CoreKind::Typeswitch { input, case, then, otherwise } => CoreKind::Typeswitch {
                input: f(*input)?,
                case: *case,
                then: f(*then)?,
                otherwise: f(*otherwise)?,
            },
            CoreKind::Step { axis, test, context } => {
                CoreKind::Step { axis: *axis, test: test.clone(), context: f(*context)? }
            }
            CoreKind::Elem { tag, content } => CoreKind::Elem { tag: f(*tag)?, content: f(*content)? },
            CoreKind::Attr { tag, content } => CoreKind::Attr { tag: f(*tag)?, content: f(*content)? },
            CoreKind::Text(c) => CoreKind::Text(f(*c)?),
            CoreKind::Cast { target, input } => CoreKind::Cast { target: *target, input: f(*input)? },
            CoreKind::Apply { fun, args } => {
                let mut out = SmallVec::with_capacity(args.len());
                for a in args {
                    out.push(f(*a)?);
                }
                CoreKind::Apply { fun: *fun, args: out }
            }
            CoreKind::Join(j) => {
                let mut j = (**j).clone();
                j.input = f(j.input)?;
                if let OperandExpr::Expr(e) = j.fst.expr {
                    j.fst.expr = OperandExpr::Expr(f(e)?);
                }
                if let OperandExpr::Expr(e) = j.snd.expr {
                    j.snd.expr = OperandExpr::Expr(f(e)?);
                }
                j.ret = f(j.ret)?;
                CoreKind::Join(Box::new(j))
            }
        })
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            CoreKind::Str(_) | CoreKind::Int(_) | CoreKind::Dec(_) | CoreKind::Dbl(_) | CoreKind::True | CoreKind::False
        )
    }

    pub fn is_constructor(&self) -> bool {
        matches!(self, CoreKind::Elem { .. } | CoreKind::Attr { .. } | CoreKind::Text(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            CoreKind::Empty => "empty",
            CoreKind::Str(_) => "str",
            CoreKind::Int(_) => "int",
            CoreKind::Dec(_) => "dec",
            CoreKind::Dbl(_) => "dbl",
            CoreKind::True => "true",
            CoreKind::False => "false",
            CoreKind::Var(_) => "var",
            CoreKind::Seq(..) => "seq",
            CoreKind::For { .. } => "for",
            CoreKind::Let { .. } => "let",
            CoreKind::OrderBy { .. } => "orderby",
            CoreKind::If { .. } => "ifthenelse",
            CoreKind::Typeswitch { .. } => "typeswitch",
            CoreKind::Step { .. } => "locstep",
            CoreKind::Root => "root",
            CoreKind::Elem { .. } => "elem",
            CoreKind::Attr { .. } => "attr",
            CoreKind::Text(_) => "text",
            CoreKind::Tag(_) => "tag",
            CoreKind::Cast { .. } => "seqcast",
            CoreKind::Apply { .. } => "apply",
            CoreKind::Join(_) => "join",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoreNode {
    pub kind: CoreKind,
    pub ty: SeqType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: CompactString,
    pub global: bool,
    pub ty: SeqType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalDecl {
    pub var: VarId,
    pub init: NodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: QName,
    pub params: Vec<VarId>,
    pub body: Option<NodeId>,
    pub ret: SeqType,
}

/// Arena holding a query body, its global variables and user functions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoreTree {
    nodes: Vec<CoreNode>,
    vars: Vec<Variable>,
    pub functions: Vec<FunctionDecl>,
    /// In declaration order; an initializer only sees earlier globals.
    pub globals: Vec<GlobalDecl>,
    pub query: Option<NodeId>,
}

impl CoreTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: CoreKind, ty: SeqType) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(CoreNode { kind, ty });
        id
    }

    pub fn new_var(&mut self, name: &str, global: bool, ty: SeqType) -> VarId {
        let id = VarId(u32::try_from(self.vars.len()).unwrap_or(u32::MAX));
        self.vars.push(Variable { name: CompactString::from(name), global, ty });
        id
    }

    pub fn node(&self, id: NodeId) -> &CoreNode {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: NodeId) -> &CoreKind {
        &self.nodes[id.index()].kind
    }

    pub fn ty(&self, id: NodeId) -> SeqType {
        self.nodes[id.index()].ty
    }

    pub fn var(&self, id: VarId) -> &Variable {
        &self.vars[id.index()]
    }

    pub fn vars(&self) -> impl Iterator<Item = (VarId, &Variable)> {
        self.vars.iter().enumerate().map(|(i, v)| (VarId(i as u32), v))
    }

    pub fn function(&self, id: FunId) -> Result<&FunctionDecl, Error> {
        self.functions
            .get(id.index())
            .ok_or_else(|| Error::malformed(format!("unknown function #{}", id.0)))
    }

    pub fn function_body(&self, id: FunId) -> Result<NodeId, Error> {
        let f = self.function(id)?;
        f.body.ok_or_else(|| Error::malformed(format!("function {} has no body", f.name)))
    }

    pub fn query(&self) -> Result<NodeId, Error> {
        self.query.ok_or_else(|| Error::malformed("Core tree has no query body"))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Allocate a copy of `id` with a different kind but the same type.
    pub fn replace(&mut self, id: NodeId, kind: CoreKind) -> NodeId {
        let ty = self.ty(id);
        self.add(kind, ty)
    }

    /// Number of references to `var` below `id`.
    pub fn count_uses(&self, id: NodeId, var: VarId) -> usize {
        let mut n = 0;
        self.walk(id, &mut |_, k| {
            if let CoreKind::Var(v) = k
                && *v == var
            {
                n += 1;
            }
        });
        n
    }

    pub fn uses_var(&self, id: NodeId, var: VarId) -> bool {
        self.count_uses(id, var) > 0
    }

    /// Variables referenced below `id` that are not bound below `id`.
    pub fn free_vars(&self, id: NodeId) -> Vec<VarId> {
        let mut bound = HashSet::new();
        let mut used = Vec::new();
        self.walk(id, &mut |_, k| match k {
            CoreKind::For { var, pos, .. } => {
                bound.insert(*var);
                if let Some(p) = pos {
                    bound.insert(*p);
                }
            }
            CoreKind::Let { var, .. } => {
                bound.insert(*var);
            }
            CoreKind::Join(j) => {
                bound.insert(j.var);
                if let Some(p) = j.pos {
                    bound.insert(p);
                }
                if j.fst.expr == OperandExpr::BoundInput || j.snd.expr == OperandExpr::BoundInput {
                    used.push(j.var);
                }
            }
            CoreKind::Var(v) => used.push(*v),
            _ => {}
        });
        let mut out = Vec::new();
        for v in used {
            if !bound.contains(&v) && !out.contains(&v) {
                out.push(v);
            }
        }
        out
    }

    pub fn contains_constructor(&self, id: NodeId) -> bool {
        let mut found = false;
        self.walk(id, &mut |_, k| found |= k.is_constructor());
        found
    }

    /// Pre-order visit of the subtree rooted at `id` (user function bodies are not entered).
    pub fn walk(&self, id: NodeId, f: &mut impl FnMut(NodeId, &CoreKind)) {
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let kind = self.kind(n);
            f(n, kind);
            let children = kind.children();
            stack.extend(children.into_iter().rev());
        }
    }

    /// Structural equality of two subtrees (ids may differ).
    pub fn same_shape(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return true;
        }
        let (na, nb) = (self.node(a), self.node(b));
        if na.ty != nb.ty {
            return false;
        }
        let ca = na.kind.children();
        let cb = nb.kind.children();
        let head_equal = match (&na.kind, &nb.kind) {
            (CoreKind::Join(x), CoreKind::Join(y)) => {
                x.var == y.var && x.pos == y.pos && x.cmp == y.cmp && x.switched == y.switched
                    && x.fst.cast == y.fst.cast
                    && x.snd.cast == y.snd.cast
            }
            (x, y) => {
                let strip = |k: &CoreKind| k.map_children(|_| Ok(NodeId(0))).ok();
                strip(x) == strip(y)
            }
        };
        head_equal && ca.len() == cb.len() && ca.iter().zip(cb.iter()).all(|(x, y)| self.same_shape(*x, *y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_vars_skip_locally_bound() {
        let mut b = CoreBuilder::new();
        let outer = b.global_var("g", SeqType::integer());
        let seq = b.int_seq(&[1, 2]);
        let x = b.for_var("x", seq);
        let gx = b.var(outer);
        let xx = b.var(x);
        let body = b.seq(xx, gx);
        let f = b.for_in(x, None, seq, body);
        let tree = b.finish(f);
        assert_eq!(tree.free_vars(f), vec![outer]);
    }

    #[test]
    fn same_shape_ignores_ids() {
        let mut b = CoreBuilder::new();
        let a = b.int(1);
        let c = b.int(1);
        let d = b.int(2);
        let s1 = b.seq(a, d);
        let s2 = b.seq(c, d);
        let tree = b.finish(s1);
        assert!(tree.same_shape(s1, s2));
        assert!(!tree.same_shape(a, d));
    }
}
