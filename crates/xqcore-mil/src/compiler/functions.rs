//! Built-in functions, operators and user-defined function calls.
use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::core::{ArithOp, AtomicType, Builtin, Comparison, FunId, NodeId, SeqType};
use crate::mil::{AggrFn, Atom, BinOp, Expr, Extern, Kind, Name, Proc, Stmt, UnOp};
use crate::runtime::{Error, ErrorCode};
use crate::scope::LevelKind;

use super::interface::{Columns, Interface, Quad};
use super::scope::Level;
use super::{CResult, Translator, var};

fn aligned(a: &SeqType, b: &SeqType) -> bool {
    a.is_exactly_one() && b.is_exactly_one()
}

impl Translator<'_> {
    fn uniform_kind(&self, n: NodeId) -> Option<Kind> {
        self.tree.ty(n).uniform_atomic().map(Kind::from_atomic)
    }

    fn aggregate(&mut self, f: AggrFn, groups: &Name, values: &Name) -> Name {
        let lp = self.level().loop_.clone();
        self.emit(
            f.name(),
            Expr::Aggr { f, groups: Box::new(var(groups)), values: Box::new(var(values)), domain: Box::new(var(&lp)) },
        )
    }

    /// One bit per iteration of the current level.
    fn loop_typed(&self, values: Name, k: Kind) -> Quad {
        Quad::typed(self.level().loop_.clone(), None, values, k)
    }

    /// One value per iteration, `default` where the argument is empty.
    fn per_iteration(&mut self, arg: NodeId, want: Kind, default: Atom) -> CResult<Name> {
        let (iter, vals) = self.values_of(arg, Some(want))?;
        let lp = self.level().loop_.clone();
        Ok(self.emit("val", Expr::lookup(var(&lp), var(&iter), var(&vals), default)))
    }

    fn count_of(&mut self, arg: NodeId) -> CResult<Name> {
        let c = self.generic_of(arg)?;
        Ok(self.aggregate(AggrFn::Count, &c.iter, &c.iter))
    }

    /// Effective boolean value of `arg`, one bit per iteration.
    fn ebv(&mut self, arg: NodeId) -> CResult<Name> {
        let ty = self.tree.ty(arg);
        if ty.is_exactly_one() && ty.uniform_atomic() == Some(AtomicType::Boolean) {
            let (_, bits) = self.values_of(arg, Some(Kind::Bool))?;
            return Ok(bits);
        }
        let lp = self.level().loop_.clone();
        let c = self.generic_of(arg)?;
        Ok(self.emit("ebv", Expr::Call(Extern::Ebv, vec![var(&lp), var(&c.iter), var(&c.item), var(&c.kind)])))
    }

    pub(super) fn translate_builtin(&mut self, n: NodeId, b: Builtin, args: &[NodeId], want: Interface) -> CResult<Quad> {
        let (min, max) = b.arity();
        if args.len() < min || max.is_some_and(|m| args.len() > m) {
            warn!(function = %b, arity = args.len(), "unsupported built-in call");
            return Err(Error::from_code(ErrorCode::XPST0017, format!("{b} does not take {} arguments", args.len())));
        }
        if let Some(op) = b.arithmetic() {
            return self.arithmetic(op, args[0], args[1]);
        }
        if let Some(cmp) = b.comparison() {
            return self.comparison(cmp, args[0], args[1]);
        }
        let arg = args[0];
        match b {
            Builtin::Doc => self.translate_doc(arg),
            Builtin::Count => {
                let count = self.count_of(arg)?;
                Ok(self.loop_typed(count, Kind::Int))
            }
            Builtin::Empty | Builtin::Exists => {
                let count = self.count_of(arg)?;
                let op = if b == Builtin::Empty { BinOp::Eq } else { BinOp::Ne };
                let bits = self.emit("bit", Expr::map2(op, var(&count), Expr::int(0)));
                Ok(self.loop_typed(bits, Kind::Bool))
            }
            Builtin::Boolean => {
                let bits = self.ebv(arg)?;
                Ok(self.loop_typed(bits, Kind::Bool))
            }
            Builtin::Not => {
                let bits = self.ebv(arg)?;
                let bits = self.emit("bit", Expr::map1(UnOp::Not, var(&bits)));
                Ok(self.loop_typed(bits, Kind::Bool))
            }
            Builtin::Data | Builtin::TypedValue => self.atomize(arg),
            Builtin::String | Builtin::StringValue => {
                let lp = self.level().loop_.clone();
                let c = self.generic_of(arg)?;
                let s = self.emit("str", Expr::Call(Extern::Stringify, vec![var(&c.item), var(&c.kind)]));
                let s = self.emit("str", Expr::lookup(var(&lp), var(&c.iter), var(&s), Atom::str("")));
                Ok(self.loop_typed(s, Kind::Str))
            }
            Builtin::Sum => {
                let k = self.uniform_kind(n).unwrap_or(Kind::Dbl);
                let (iter, vals) = self.values_of(arg, Some(k))?;
                let sum = self.aggregate(AggrFn::Sum, &iter, &vals);
                let sum = match UnOp::cast_to(k) {
                    Some(op) => self.emit("sum", Expr::map1(op, var(&sum))),
                    None => sum,
                };
                Ok(self.loop_typed(sum, k))
            }
            Builtin::Avg | Builtin::Min | Builtin::Max => {
                if self.tree.ty(n).is_empty() {
                    return self.translate(arg, want);
                }
                let k = self.uniform_kind(n).unwrap_or(Kind::Dbl);
                let f = match b {
                    Builtin::Avg => AggrFn::Avg,
                    Builtin::Min => AggrFn::Min,
                    _ => AggrFn::Max,
                };
                let (iter, vals) = self.values_of(arg, Some(k))?;
                let agg = self.aggregate(f, &iter, &vals);
                let lp = self.level().loop_.clone();
                let hit = self.emit(
                    "sel",
                    Expr::select(Expr::map1(UnOp::IsNil, var(&agg)), BinOp::Eq, Expr::Const(Atom::Bit(false))),
                );
                let iter = self.emit("iter", Expr::fetch(var(&lp), var(&hit)));
                let vals = self.emit("val", Expr::fetch(var(&agg), var(&hit)));
                let vals = match UnOp::cast_to(k) {
                    Some(op) if k != Kind::Str => self.emit("val", Expr::map1(op, var(&vals))),
                    _ => vals,
                };
                Ok(Quad::typed(iter, None, vals, k))
            }
            Builtin::StringLength => {
                let s = self.per_iteration(arg, Kind::Str, Atom::str(""))?;
                let len = self.emit("len", Expr::map1(UnOp::StrLen, var(&s)));
                Ok(self.loop_typed(len, Kind::Int))
            }
            Builtin::Concat => {
                let mut acc = self.per_iteration(arg, Kind::Str, Atom::str(""))?;
                for a in &args[1..] {
                    let next = self.per_iteration(*a, Kind::Str, Atom::str(""))?;
                    acc = self.emit("str", Expr::map2(BinOp::Concat, var(&acc), var(&next)));
                }
                Ok(self.loop_typed(acc, Kind::Str))
            }
            Builtin::Contains => {
                let hay = self.per_iteration(args[0], Kind::Str, Atom::str(""))?;
                let needle = self.per_iteration(args[1], Kind::Str, Atom::str(""))?;
                let bits = self.emit("bit", Expr::map2(BinOp::Contains, var(&hay), var(&needle)));
                Ok(self.loop_typed(bits, Kind::Bool))
            }
            Builtin::DistinctDocOrder => {
                let q = self.translate(arg, Interface::Swapped)?;
                let c = self.generic(q)?;
                let r = self.emit(
                    "ddo",
                    Expr::Call(Extern::DistinctDocOrder, vec![var(&c.iter), var(&c.item), var(&c.kind)]),
                );
                Ok(self.unpack3(&r).into_quad(Interface::Generic))
            }
            Builtin::ItemSeqToNodeSeq => {
                let ty = self.tree.ty(arg);
                if ty.is_node_sequence() {
                    return self.translate(arg, want);
                }
                let q = self.translate(arg, Interface::NodeStructured)?;
                let structured = q.iface == Interface::NodeStructured || ty.is_atomic_sequence();
                let c = self.generic(q)?;
                let r = self.emit(
                    "nodes",
                    Expr::Call(Extern::ItemsToNodes, vec![var(&c.iter), var(&c.pos), var(&c.item), var(&c.kind)]),
                );
                let out = self.unpack3(&r);
                Ok(out.into_quad(if structured { Interface::NodeStructured } else { Interface::Generic }))
            }
            Builtin::ItemSeqToUntyped => {
                let c = self.generic_of(arg)?;
                let s = self.emit("str", Expr::Call(Extern::Stringify, vec![var(&c.item), var(&c.kind)]));
                let joined = self.aggregate(AggrFn::StrJoin, &c.iter, &s);
                Ok(self.loop_typed(joined, Kind::UntypedAtomic))
            }
            Builtin::Negate => {
                if self.tree.ty(n).is_empty() {
                    return self.translate(arg, want);
                }
                let k = match self.uniform_kind(n) {
                    Some(Kind::UntypedAtomic) | None => Kind::Dbl,
                    Some(k) => k,
                };
                let (iter, vals) = self.values_of(arg, Some(k))?;
                let neg = self.emit("neg", Expr::map1(UnOp::Neg, var(&vals)));
                Ok(Quad::typed(iter, None, neg, k))
            }
            Builtin::Plus
            | Builtin::Minus
            | Builtin::Times
            | Builtin::Div
            | Builtin::IDiv
            | Builtin::Mod
            | Builtin::Eq
            | Builtin::Ne
            | Builtin::Lt
            | Builtin::Le
            | Builtin::Gt
            | Builtin::Ge => Err(Error::internal(format!("{b} was not dispatched as an operator"))),
        }
    }

    /// `(iter, item, kind)` tuple to generic columns, positions renumbered.
    fn unpack3(&mut self, r: &Name) -> Columns {
        let iter = self.emit("iter", Expr::nth(var(r), 0));
        let item = self.emit("item", Expr::nth(var(r), 1));
        let kind = self.emit("kind", Expr::nth(var(r), 2));
        let pos = self.emit("pos", Expr::mark_grp(var(&iter)));
        Columns { iter, pos, item, kind }
    }

    fn atomize(&mut self, arg: NodeId) -> CResult<Quad> {
        if !self.tree.ty(arg).may_contain_nodes() {
            return self.translate(arg, Interface::Generic);
        }
        let c = self.generic_of(arg)?;
        let r = self.emit("atom", Expr::Call(Extern::Atomize, vec![var(&c.item), var(&c.kind)]));
        let item = self.emit("item", Expr::nth(var(&r), 0));
        let kind = self.emit("kind", Expr::nth(var(&r), 1));
        Ok(Columns { iter: c.iter, pos: c.pos, item, kind }.into_quad(Interface::Generic))
    }

    /// Both operands' values in `k`, paired per iteration.
    fn operands(&mut self, a: NodeId, b: NodeId, k: Option<Kind>) -> CResult<(Name, Name, Name)> {
        let (ta, tb) = (self.tree.ty(a), self.tree.ty(b));
        let (ia, va) = self.values_of(a, k)?;
        let (ib, vb) = self.values_of(b, k)?;
        if aligned(&ta, &tb) {
            return Ok((ia, va, vb));
        }
        let j = self.emit("pair", Expr::EquiJoin { left: Box::new(var(&ia)), right: Box::new(var(&ib)) });
        let iter = self.emit("iter", Expr::fetch(var(&ia), Expr::nth(var(&j), 0)));
        let l = self.emit("val", Expr::fetch(var(&va), Expr::nth(var(&j), 0)));
        let r = self.emit("val", Expr::fetch(var(&vb), Expr::nth(var(&j), 1)));
        Ok((iter, l, r))
    }

    fn arithmetic(&mut self, op: ArithOp, a: NodeId, b: NodeId) -> CResult<Quad> {
        let (ta, tb) = (self.tree.ty(a), self.tree.ty(b));
        if ta.is_empty() || tb.is_empty() {
            return Ok(self.empty(Interface::Generic));
        }
        let domain = match (ta.uniform_atomic(), tb.uniform_atomic()) {
            (Some(x), Some(y)) => x.promote(y).unwrap_or(AtomicType::Double),
            _ => AtomicType::Double,
        };
        let dk = Kind::from_atomic(domain);
        let exact = matches!(dk, Kind::Int | Kind::Dec);
        let (bop, rk) = match op {
            ArithOp::Add => (BinOp::Add, dk),
            ArithOp::Sub => (BinOp::Sub, dk),
            ArithOp::Mul => (BinOp::Mul, dk),
            ArithOp::Div if exact => (BinOp::DivChecked, Kind::Dec),
            ArithOp::Div => (BinOp::Div, dk),
            ArithOp::IDiv => (BinOp::IDiv, Kind::Int),
            ArithOp::Mod if exact => (BinOp::ModChecked, dk),
            ArithOp::Mod => (BinOp::Mod, dk),
        };
        let (iter, l, r) = self.operands(a, b, Some(dk))?;
        let vals = self.emit("arith", Expr::map2(bop, var(&l), var(&r)));
        Ok(Quad::typed(iter, None, vals, rk))
    }

    fn comparison(&mut self, cmp: Comparison, a: NodeId, b: NodeId) -> CResult<Quad> {
        let (ta, tb) = (self.tree.ty(a), self.tree.ty(b));
        if ta.is_empty() || tb.is_empty() {
            return Ok(self.empty(Interface::Generic));
        }
        let atomized = |t: SeqType| t.item().map(crate::core::ItemType::atomized).and_then(|i| i.atomic());
        let domain = match (atomized(ta), atomized(tb)) {
            (Some(x), Some(y)) => x.comparison_domain(y).map(Kind::from_atomic),
            _ => None,
        };
        let (iter, l, r) = self.operands(a, b, domain)?;
        let bits = self.emit("cmp", Expr::map2(BinOp::from_comparison(cmp), var(&l), var(&r)));
        Ok(Quad::typed(iter, None, bits, Kind::Bool))
    }

    /// Compile a user function body into a procedure taking the level-0
    /// names (`loop`, `outer`, `inner` and the environment) as parameters.
    pub(super) fn translate_function(&mut self, f: FunId) -> CResult<()> {
        let tree = self.tree;
        let decl = tree.function(f)?;
        let (Some(body), Some(name)) = (decl.body, self.proc_names.get(&f).cloned()) else { return Ok(()) };
        let fid = self.vars.function_scope(f)?;

        let mut live = BTreeSet::new();
        for p in &decl.params {
            if self.vars.is_used(*p) {
                live.insert(self.vars.vid(*p)?);
            }
        }
        for g in self.vars.function_globals(f) {
            live.insert(self.vars.vid(*g)?);
        }
        let root = Level::root(LevelKind::Loop(fid), live);
        let params = root.params();
        let result = [
            Name::from("res_iter"),
            Name::from("res_pos"),
            Name::from("res_item"),
            Name::from("res_kind"),
        ];
        let out = result.clone();
        let ((), body) = self.fragment(root, move |t| {
            t.comment(|| format!("function {}", decl.name));
            let c = t.generic_of(body)?;
            for (dst, src) in out.iter().zip(c.names()) {
                t.buf.assign(dst.clone(), var(src));
            }
            Ok(())
        })?;
        debug!(function = %decl.name, proc = %name, statements = body.len(), "function compiled");
        self.procs.push(Proc { name, params, body, result });
        Ok(())
    }

    /// Call a user function: pack the argument and global rows into an
    /// environment for the callee and run it once for the whole loop.
    pub(super) fn translate_call(&mut self, f: FunId, args: &[NodeId]) -> CResult<Quad> {
        let tree = self.tree;
        let decl = tree.function(f)?;
        let name = self.proc_names.get(&f).cloned().ok_or_else(|| {
            Error::from_code(ErrorCode::XPST0017, format!("function {} is declared without a body", decl.name))
        })?;
        if args.len() != decl.params.len() {
            return Err(Error::from_code(
                ErrorCode::XPST0017,
                format!("{} takes {} arguments, not {}", decl.name, decl.params.len(), args.len()),
            ));
        }
        let vars = self.vars;
        let lp = self.level().loop_.clone();

        let mut packed: Vec<(i64, Columns)> = Vec::new();
        for (p, a) in decl.params.iter().zip(args) {
            if vars.is_used(*p) {
                let c = self.generic_of(*a)?;
                packed.push((i64::from(vars.vid(*p)?), c));
            }
        }
        for g in vars.function_globals(f) {
            let vid = vars.vid(*g)?;
            let c = self.rows_of(vid)?;
            packed.push((i64::from(vid), c));
        }
        let vids: Vec<Name> =
            packed.iter().map(|(vid, c)| self.emit("vid", Expr::project(Expr::int(*vid), var(&c.iter)))).collect();
        let mut env = Vec::with_capacity(5);
        for i in 0..5 {
            let col = vids
                .iter()
                .zip(&packed)
                .map(|(vid, (_, c))| var([vid, &c.iter, &c.pos, &c.item, &c.kind][i]))
                .reduce(Expr::append)
                .unwrap_or_else(Expr::empty);
            env.push(var(&self.emit("arg", col)));
        }

        let out = Columns {
            iter: self.fresh("r_iter"),
            pos: self.fresh("r_pos"),
            item: self.fresh("r_item"),
            kind: self.fresh("r_kind"),
        };
        for n in out.names() {
            self.buf.push(Stmt::Declare(n.clone(), Some(Expr::empty())));
        }
        self.buf.begin();
        let mut call_args = vec![var(&lp), var(&lp), var(&lp)];
        call_args.extend(env);
        let r = self.emit("call", Expr::CallProc(name, call_args));
        for (i, n) in out.names().into_iter().enumerate() {
            self.buf.assign(n.clone(), Expr::nth(var(&r), i));
        }
        let stmts = self.buf.end();
        self.buf.push(Stmt::If { cond: Self::nonempty(&lp), then: stmts, otherwise: Vec::new() });
        Ok(out.into_quad(Interface::Generic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_operands_are_aligned() {
        use crate::core::{ItemType, SeqType};
        assert!(aligned(&SeqType::integer(), &SeqType::atomic(AtomicType::Double)));
        assert!(!aligned(&SeqType::integer(), &SeqType::opt(ItemType::Atomic(AtomicType::Double))));
    }
}
