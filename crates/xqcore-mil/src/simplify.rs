//! Local Core rewrites applied before join recognition.
//!
//! The pass is bottom-up: children are simplified first, then at most one
//! rule is tried on the rebuilt node, and whatever a rule produces is
//! simplified again. Results are memoized per node id, which both keeps
//! shared subtrees shared and makes a second run over the output a no-op.
use std::collections::HashMap;

use smallvec::SmallVec;
use tracing::{debug, debug_span, trace};

use crate::context::CompileOptions;
use crate::core::{
    AtomicType, Builtin, CoreKind, CoreTree, FunRef, ItemType, NodeId, Occurrence, SeqType, VarId,
};
use crate::runtime::{Error, ErrorCode};

/// Simplify the query, every global initializer and every function body.
/// Returns the number of rules that fired.
pub fn simplify(tree: &mut CoreTree, options: &CompileOptions) -> Result<usize, Error> {
    let _span = debug_span!("simplify").entered();
    let mut s = Simplifier { tree, memo: HashMap::new(), rewrites: 0, dynamic_typeswitch: options.dynamic_typeswitch };

    for i in 0..s.tree.globals.len() {
        let init = s.tree.globals[i].init;
        let new = s.simplify(init)?;
        s.tree.globals[i].init = new;
    }
    for i in 0..s.tree.functions.len() {
        if let Some(body) = s.tree.functions[i].body {
            let new = s.simplify(body)?;
            s.tree.functions[i].body = Some(new);
        }
    }
    let q = s.tree.query()?;
    let new = s.simplify(q)?;
    s.tree.query = Some(new);

    debug!(rewrites = s.rewrites, "simplification finished");
    Ok(s.rewrites)
}

struct Simplifier<'t> {
    tree: &'t mut CoreTree,
    memo: HashMap<NodeId, NodeId>,
    rewrites: usize,
    dynamic_typeswitch: bool,
}

fn literal_zero(kind: &CoreKind) -> bool {
    match kind {
        CoreKind::Int(0) => true,
        CoreKind::Dec(v) | CoreKind::Dbl(v) => *v == 0.0,
        _ => false,
    }
}

impl Simplifier<'_> {
    fn simplify(&mut self, id: NodeId) -> Result<NodeId, Error> {
        if let Some(done) = self.memo.get(&id) {
            return Ok(*done);
        }
        let kind = self.tree.kind(id).clone();
        let rebuilt = kind.map_children(|c| self.simplify(c))?;
        let mut cur = if rebuilt == kind { id } else { self.tree.replace(id, rebuilt) };
        if let Some(next) = self.rule(cur)? {
            self.rewrites += 1;
            trace!(from = self.tree.kind(cur).name(), to = self.tree.kind(next).name(), "rewrite");
            cur = self.simplify(next)?;
        }
        self.memo.insert(id, cur);
        self.memo.insert(cur, cur);
        Ok(cur)
    }

    fn empty(&mut self) -> NodeId {
        self.tree.add(CoreKind::Empty, SeqType::Empty)
    }

    /// Replace every reference to `var` below `id` by `with`.
    fn substitute(&mut self, id: NodeId, var: VarId, with: NodeId) -> Result<NodeId, Error> {
        match self.tree.kind(id) {
            CoreKind::Var(v) if *v == var => return Ok(with),
            _ if !self.tree.uses_var(id, var) => return Ok(id),
            _ => {}
        }
        let kind = self.tree.kind(id).clone();
        let rebuilt = kind.map_children(|c| self.substitute(c, var, with))?;
        Ok(self.tree.replace(id, rebuilt))
    }

    /// The rewrite for `id`, if one applies. Children are already simplified.
    fn rule(&mut self, id: NodeId) -> Result<Option<NodeId>, Error> {
        let kind = self.tree.kind(id).clone();
        match kind {
            CoreKind::Seq(a, b) => Ok(if *self.tree.kind(a) == CoreKind::Empty {
                Some(b)
            } else if *self.tree.kind(b) == CoreKind::Empty {
                Some(a)
            } else {
                None
            }),
            CoreKind::Let { var, bound, body } => self.let_rule(var, bound, body),
            CoreKind::For { var, pos, input, body } => self.for_rule(var, pos, input, body),
            CoreKind::Cast { target, input } => self.cast_rule(target, input),
            CoreKind::Typeswitch { input, case, then, otherwise } => {
                let ty = self.tree.ty(input);
                if ty.is_subtype_of(&case) {
                    Ok(Some(then))
                } else if ty.is_disjoint_from(&case) {
                    Ok(Some(otherwise))
                } else if self.dynamic_typeswitch {
                    Ok(None)
                } else {
                    Err(Error::from_code(
                        ErrorCode::XPST0080,
                        format!("typeswitch case {case} cannot be decided for input of type {ty}"),
                    ))
                }
            }
            CoreKind::If { cond, then, otherwise } => Ok(match self.tree.kind(cond) {
                CoreKind::True => Some(then),
                CoreKind::False | CoreKind::Empty => Some(otherwise),
                _ => None,
            }),
            CoreKind::Apply { fun: FunRef::Builtin(b), args } => self.apply_rule(id, b, &args),
            CoreKind::Elem { tag, content } => {
                let ty = self.tree.ty(content);
                if ty.is_node_sequence() {
                    return Ok(None);
                }
                let wrapped = self.wrap(Builtin::ItemSeqToNodeSeq, content);
                Ok(Some(self.tree.replace(id, CoreKind::Elem { tag, content: wrapped })))
            }
            CoreKind::Attr { tag, content } => {
                if self.is_single_string(content) {
                    return Ok(None);
                }
                let wrapped = self.wrap(Builtin::ItemSeqToUntyped, content);
                Ok(Some(self.tree.replace(id, CoreKind::Attr { tag, content: wrapped })))
            }
            CoreKind::Text(content) => {
                if self.tree.ty(content).is_empty() {
                    return Ok(Some(self.empty()));
                }
                if self.is_single_string(content) {
                    return Ok(None);
                }
                let wrapped = self.wrap(Builtin::ItemSeqToUntyped, content);
                Ok(Some(self.tree.replace(id, CoreKind::Text(wrapped))))
            }
            _ => Ok(None),
        }
    }

    fn is_single_string(&self, id: NodeId) -> bool {
        let ty = self.tree.ty(id);
        ty.is_exactly_one() && matches!(ty.uniform_atomic(), Some(AtomicType::String | AtomicType::UntypedAtomic))
    }

    fn wrap(&mut self, f: Builtin, arg: NodeId) -> NodeId {
        let ty = f.result_type(&[self.tree.ty(arg)]);
        self.tree.add(CoreKind::Apply { fun: FunRef::Builtin(f), args: SmallVec::from_slice(&[arg]) }, ty)
    }

    fn let_rule(&mut self, var: VarId, bound: NodeId, body: NodeId) -> Result<Option<NodeId>, Error> {
        let uses = self.tree.count_uses(body, var);
        if uses == 0 {
            return Ok(Some(body));
        }
        if matches!(self.tree.kind(body), CoreKind::Var(v) if *v == var) {
            return Ok(Some(bound));
        }
        let trivial = {
            let k = self.tree.kind(bound);
            k.is_literal() || matches!(k, CoreKind::Var(_) | CoreKind::Empty)
        };
        if trivial || (uses == 1 && !self.tree.contains_constructor(bound)) {
            return self.substitute(body, var, bound).map(Some);
        }
        Ok(None)
    }

    fn for_rule(
        &mut self,
        var: VarId,
        pos: Option<VarId>,
        input: NodeId,
        body: NodeId,
    ) -> Result<Option<NodeId>, Error> {
        if pos.is_none() && matches!(self.tree.kind(body), CoreKind::Var(v) if *v == var) {
            return Ok(Some(input));
        }
        let ty = self.tree.ty(input);
        if ty.is_empty() {
            return Ok(Some(self.empty()));
        }
        if !ty.is_exactly_one() {
            return Ok(None);
        }
        // A single iteration: ordering is moot and the position is 1.
        let mut body = body;
        if let CoreKind::OrderBy { body: ret, .. } = self.tree.kind(body) {
            body = *ret;
        }
        if let Some(p) = pos {
            let one = self.tree.add(CoreKind::Int(1), SeqType::integer());
            body = self.substitute(body, p, one)?;
        }
        let ty = self.tree.ty(body);
        Ok(Some(self.tree.add(CoreKind::Let { var, bound: input, body }, ty)))
    }

    fn cast_rule(&mut self, target: SeqType, input: NodeId) -> Result<Option<NodeId>, Error> {
        let ty = self.tree.ty(input);
        if ty.is_subtype_of(&target) {
            return Ok(Some(input));
        }
        if let CoreKind::Cast { target: inner, input: inner_input } = self.tree.kind(input)
            && inner.item() == target.item()
        {
            let (inner_input, occ) = (*inner_input, inner.occurrence());
            // Keep the stricter cardinality of the two.
            let target = match (occ, target.occurrence()) {
                (Some(Occurrence::One), _) | (_, Some(Occurrence::One)) => target.with_occurrence(Occurrence::One),
                _ => target,
            };
            return Ok(Some(self.tree.add(CoreKind::Cast { target, input: inner_input }, target)));
        }
        if let (Some(from), Some(to)) = (ty.item().map(ItemType::atomized).and_then(ItemType::atomic), target.uniform_atomic())
            && !from.castable_to(to)
        {
            return Err(Error::from_code(
                ErrorCode::XPTY0004,
                format!("cannot cast {} to {}", from.name(), to.name()),
            ));
        }
        Ok(None)
    }

    fn cast_arg(&mut self, arg: NodeId, to: AtomicType) -> NodeId {
        let ty = self.tree.ty(arg);
        if ty.uniform_atomic() == Some(to) {
            return arg;
        }
        let occ = if ty.is_exactly_one() { Occurrence::One } else { Occurrence::Optional };
        let target = SeqType::Items(ItemType::Atomic(to), occ);
        self.tree.add(CoreKind::Cast { target, input: arg }, target)
    }

    fn apply_rule(&mut self, id: NodeId, b: Builtin, args: &[NodeId]) -> Result<Option<NodeId>, Error> {
        let (arith, cmp) = (b.arithmetic(), b.comparison());
        if (arith.is_none() && cmp.is_none()) || args.len() != 2 {
            return Ok(None);
        }
        let (ta, tb) = (self.tree.ty(args[0]), self.tree.ty(args[1]));
        if !ta.is_singleton_or_empty() || !tb.is_singleton_or_empty() {
            return Ok(None);
        }
        let (Some(a), Some(c)) = (ta.uniform_atomic(), tb.uniform_atomic()) else { return Ok(None) };
        let common = if arith.is_some() { a.promote(c) } else { a.comparison_domain(c) };
        let Some(common) = common else { return Ok(None) };

        let divisor_zero = {
            let mut d = args[1];
            while let CoreKind::Cast { input, .. } = self.tree.kind(d) {
                d = *input;
            }
            literal_zero(self.tree.kind(d))
        };
        if divisor_zero {
            let exact = matches!(common, AtomicType::Integer | AtomicType::Decimal);
            if b == Builtin::IDiv || (exact && matches!(b, Builtin::Div | Builtin::Mod)) {
                return Err(Error::from_code(ErrorCode::FOAR0001, format!("{b} by a literal zero")));
            }
        }

        let x = self.cast_arg(args[0], common);
        let y = self.cast_arg(args[1], common);
        if x == args[0] && y == args[1] {
            return Ok(None);
        }
        Ok(Some(self.tree.replace(id, CoreKind::Apply { fun: FunRef::Builtin(b), args: SmallVec::from_slice(&[x, y]) })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CoreBuilder, NodeType};
    use rstest::rstest;

    fn run(tree: &mut CoreTree) -> Result<usize, Error> {
        simplify(tree, &CompileOptions::default())
    }

    #[test]
    fn singleton_for_folds_into_its_body() {
        // for $x at $p in 5 return $x + $p
        let mut b = CoreBuilder::new();
        let five = b.int(5);
        let x = b.for_var("x", five);
        let p = b.pos_var("p");
        let (xr, pr) = (b.var(x), b.var(p));
        let body = b.call(Builtin::Plus, &[xr, pr]);
        let f = b.for_in(x, Some(p), five, body);
        let mut tree = b.finish(f);
        assert!(run(&mut tree).unwrap() >= 2);
        let CoreKind::Apply { args, .. } = tree.kind(tree.query().unwrap()) else { panic!("expected the addition") };
        assert_eq!(*tree.kind(args[0]), CoreKind::Int(5));
        assert_eq!(*tree.kind(args[1]), CoreKind::Int(1));
    }

    #[test]
    fn unused_let_and_empty_seq_vanish() {
        let mut b = CoreBuilder::new();
        let seven = b.int(7);
        let v = b.let_var("unused", seven);
        let s = b.str("kept");
        let none = b.empty();
        let body = b.seq(none, s);
        let l = b.let_in(v, seven, body);
        let mut tree = b.finish(l);
        run(&mut tree).unwrap();
        assert_eq!(*tree.kind(tree.query().unwrap()), CoreKind::Str("kept".into()));
    }

    #[test]
    fn second_run_is_a_fixed_point() {
        let mut b = CoreBuilder::new();
        let d = b.int_seq(&[1, 2, 3]);
        let x = b.for_var("x", d);
        let xr = b.var(x);
        let half = b.dbl(0.5);
        let cond = b.call(Builtin::Gt, &[xr, half]);
        let xr2 = b.var(x);
        let e = b.elem_named("v", xr2);
        let none = b.empty();
        let filter = b.if_(cond, e, none);
        let f = b.for_in(x, None, d, filter);
        let mut tree = b.finish(f);
        assert!(run(&mut tree).unwrap() > 0);
        let first = tree.query().unwrap();
        assert_eq!(run(&mut tree).unwrap(), 0);
        assert_eq!(tree.query().unwrap(), first);
    }

    #[test]
    fn comparison_operands_meet_in_the_common_domain() {
        let mut b = CoreBuilder::new();
        let i = b.int(1);
        let d = b.dbl(1.0);
        let cmp = b.eq(i, d);
        let mut tree = b.finish(cmp);
        run(&mut tree).unwrap();
        let CoreKind::Apply { args, .. } = tree.kind(tree.query().unwrap()) else { panic!("expected a comparison") };
        assert_eq!(tree.ty(args[0]).uniform_atomic(), Some(AtomicType::Double));
        assert!(matches!(tree.kind(args[0]), CoreKind::Cast { .. }));
        assert_eq!(args[1], d);
    }

    #[test]
    fn element_content_is_converted_to_nodes() {
        let mut b = CoreBuilder::new();
        let one = b.int(1);
        let e = b.elem_named("a", one);
        let mut tree = b.finish(e);
        run(&mut tree).unwrap();
        let CoreKind::Elem { content, .. } = tree.kind(tree.query().unwrap()) else { panic!("expected element") };
        assert!(matches!(
            tree.kind(*content),
            CoreKind::Apply { fun: FunRef::Builtin(Builtin::ItemSeqToNodeSeq), .. }
        ));
    }

    #[test]
    fn typeswitch_on_known_type_is_decided() {
        let mut b = CoreBuilder::new();
        let one = b.int(1);
        let yes = b.str("int");
        let no = b.str("other");
        let t = b.typeswitch(one, SeqType::integer(), yes, no);
        let mut tree = b.finish(t);
        run(&mut tree).unwrap();
        assert_eq!(tree.query().unwrap(), yes);

        let mut b = CoreBuilder::new();
        let root = b.root();
        let yes = b.str("int");
        let no = b.str("node");
        let t = b.typeswitch(root, SeqType::integer(), yes, no);
        let mut tree = b.finish(t);
        run(&mut tree).unwrap();
        assert_eq!(tree.query().unwrap(), no);
    }

    #[test]
    fn undecidable_typeswitch_without_runtime_test_is_rejected() {
        let mut b = CoreBuilder::new();
        let d = b.int(1);
        let s = b.str("a");
        let mixed = b.seq(d, s);
        let yes = b.str("ints");
        let no = b.str("other");
        let t = b.typeswitch(mixed, SeqType::star(ItemType::Atomic(AtomicType::Integer)), yes, no);
        let mut tree = b.finish(t);
        let opts = CompileOptions::builder().dynamic_typeswitch(false).build();
        let err = simplify(&mut tree, &opts).unwrap_err();
        assert_eq!(err.code, ErrorCode::XPST0080);
    }

    #[rstest]
    #[case::int_div(Builtin::Div, CoreKind::Int(0), true)]
    #[case::int_mod(Builtin::Mod, CoreKind::Int(0), true)]
    #[case::idiv_double(Builtin::IDiv, CoreKind::Dbl(0.0), true)]
    #[case::double_div(Builtin::Div, CoreKind::Dbl(0.0), false)]
    #[case::nonzero(Builtin::Div, CoreKind::Int(2), false)]
    fn division_by_literal_zero(#[case] op: Builtin, #[case] divisor: CoreKind, #[case] rejected: bool) {
        let mut b = CoreBuilder::new();
        let ten = b.int(10);
        let ty = match divisor {
            CoreKind::Dbl(_) => SeqType::atomic(AtomicType::Double),
            _ => SeqType::integer(),
        };
        let mut tree = b.finish(ten);
        let d = tree.add(divisor, ty);
        let call = tree.add(
            CoreKind::Apply { fun: FunRef::Builtin(op), args: SmallVec::from_slice(&[ten, d]) },
            op.result_type(&[SeqType::integer(), ty]),
        );
        tree.query = Some(call);
        let result = run(&mut tree);
        assert_eq!(result.is_err(), rejected);
        if let Err(e) = result {
            assert_eq!(e.code, ErrorCode::FOAR0001);
        }
    }

    #[test]
    fn impossible_cast_is_a_type_error() {
        let mut b = CoreBuilder::new();
        let t = b.boolean(true);
        let c = b.cast_to(AtomicType::QName, t);
        let mut tree = b.finish(c);
        assert_eq!(run(&mut tree).unwrap_err().code, ErrorCode::XPTY0004);
    }

    #[test]
    fn text_of_nothing_is_nothing() {
        let mut b = CoreBuilder::new();
        let none = b.empty();
        let t = b.text(none);
        let e = b.elem_named("a", t);
        let mut tree = b.finish(e);
        run(&mut tree).unwrap();
        let CoreKind::Elem { content, .. } = tree.kind(tree.query().unwrap()) else { panic!("expected element") };
        assert_eq!(*tree.kind(*content), CoreKind::Empty);
        assert_eq!(tree.ty(tree.query().unwrap()), SeqType::node(NodeType::Element));
    }
}
