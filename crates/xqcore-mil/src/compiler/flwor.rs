//! Sequences, `for`, `let`, conditionals and typeswitch.
use crate::core::{AtomicType, CoreKind, NodeId, SeqType, VarId};
use crate::mil::{Atom, BinOp, Container, Expr, Extern, Kind, Name, Stmt};
use crate::runtime::{Error, ErrorCode};

use super::interface::{Columns, Interface, Quad};
use super::{CResult, Translator, var};

impl Translator<'_> {
    pub(super) fn translate_seq(&mut self, a: NodeId, b: NodeId) -> CResult<Quad> {
        let qa = self.translate(a, Interface::NodeStructured)?;
        let qb = self.translate(b, Interface::NodeStructured)?;
        let structured = qa.iface == Interface::NodeStructured && qb.iface == Interface::NodeStructured;
        let ca = self.generic(qa)?;
        let cb = self.generic(qb)?;
        let merged = self.merge(&ca, &cb);
        Ok(merged.into_quad(if structured { Interface::NodeStructured } else { Interface::Generic }))
    }

    /// Interleave two results by iteration, `a` first within an iteration.
    fn merge(&mut self, a: &Columns, b: &Columns) -> Columns {
        let m = self.emit("merge", Expr::Merge { left: Box::new(var(&a.iter)), right: Box::new(var(&b.iter)) });
        let pick = |t: &mut Self, stem: &str, x: &Name, y: &Name| {
            t.emit(stem, Expr::fetch(Expr::append(var(x), var(y)), var(&m)))
        };
        let iter = pick(self, "iter", &a.iter, &b.iter);
        let item = pick(self, "item", &a.item, &b.item);
        let kind = pick(self, "kind", &a.kind, &b.kind);
        let pos = self.emit("pos", Expr::mark_grp(var(&iter)));
        Columns { iter, pos, item, kind }
    }

    pub(super) fn translate_for(
        &mut self,
        n: NodeId,
        v: VarId,
        pos: Option<VarId>,
        input: NodeId,
        body: NodeId,
    ) -> CResult<Quad> {
        let tree = self.tree;
        let q = self.generic_of(input)?;
        let fid = self.vars.scope_of(n)?;
        self.comment(|| format!("for ${} (scope {})", tree.var(v).name, fid.0));
        self.enter_loop(fid, &q.iter)?;
        self.bind_loop_vars(v, pos, &q)?;

        let (ret, order) = match tree.kind(body) {
            CoreKind::OrderBy { key, descending, body } => {
                let k = self.translate(*key, Interface::Generic)?;
                let (kiter, kvals) = self.values(k, None)?;
                (*body, Some((kiter, kvals, *descending)))
            }
            _ => (body, None),
        };
        let r = self.generic_of(ret)?;
        let out = self.map_back(&r, order);
        self.leave_level()?;
        Ok(out.into_quad(Interface::Generic))
    }

    /// Bind the loop variable (one item per inner iteration) and the
    /// positional variable of a freshly entered loop level.
    pub(super) fn bind_loop_vars(&mut self, v: VarId, pos: Option<VarId>, q: &Columns) -> CResult<()> {
        let inner = self.level().inner.clone();
        if self.vars.is_used(v) {
            let one = self.emit("pos", Expr::project(Expr::int(1), var(&inner)));
            let c = Columns { iter: inner.clone(), pos: one, item: q.item.clone(), kind: q.kind.clone() };
            let vid = self.vars.vid(v)?;
            self.bind(vid, &c);
        }
        if let Some(p) = pos
            && self.vars.is_used(p)
        {
            let ordinal = self.emit("ord", Expr::mark_grp(var(&q.iter)));
            let item = self.emit(
                "item",
                Expr::Intern { container: Container::Int, values: Box::new(var(&ordinal)) },
            );
            let one = self.emit("pos", Expr::project(Expr::int(1), var(&inner)));
            let kind = self.emit("kind", Expr::project(Expr::Const(Kind::Int.atom()), var(&inner)));
            let vid = self.vars.vid(p)?;
            self.bind(vid, &Columns { iter: inner, pos: one, item, kind });
        }
        Ok(())
    }

    pub(super) fn translate_let(&mut self, v: VarId, bound: NodeId, body: NodeId, want: Interface) -> CResult<Quad> {
        if self.vars.is_used(v) {
            let tree = self.tree;
            self.comment(|| format!("let ${}", tree.var(v).name));
            let c = self.generic_of(bound)?;
            let vid = self.vars.vid(v)?;
            self.bind(vid, &c);
        }
        self.translate(body, want)
    }

    pub(super) fn translate_if(&mut self, cond: NodeId, then: NodeId, otherwise: NodeId) -> CResult<Quad> {
        let lp = self.level().loop_.clone();
        let ty = self.tree.ty(cond);
        let then_iters = if ty.is_exactly_one() && ty.uniform_atomic() == Some(AtomicType::Boolean) {
            let (iter, bits) = self.values_of(cond, Some(Kind::Bool))?;
            let hit = Expr::select(var(&bits), BinOp::Eq, Expr::Const(Atom::Bit(true)));
            self.emit("then", Expr::fetch(var(&iter), hit))
        } else {
            let c = self.generic_of(cond)?;
            let bits = self.emit(
                "ebv",
                Expr::Call(Extern::Ebv, vec![var(&lp), var(&c.iter), var(&c.item), var(&c.kind)]),
            );
            let hit = Expr::select(var(&bits), BinOp::Eq, Expr::Const(Atom::Bit(true)));
            self.emit("then", Expr::fetch(var(&lp), hit))
        };
        self.branches(&then_iters, then, otherwise)
    }

    pub(super) fn translate_typeswitch(
        &mut self,
        input: NodeId,
        case: SeqType,
        then: NodeId,
        otherwise: NodeId,
    ) -> CResult<Quad> {
        let ty = self.tree.ty(input);
        let decided = ty.is_subtype_of(&case) || ty.is_disjoint_from(&case);
        if !self.options.dynamic_typeswitch && !decided {
            return Err(Error::from_code(
                ErrorCode::XPST0080,
                format!("typeswitch on {case} cannot be decided statically for an input of type {ty}"),
            ));
        }
        let lp = self.level().loop_.clone();
        let c = self.generic_of(input)?;
        let then_iters = self.emit(
            "case",
            Expr::Call(Extern::InstanceOf(case), vec![var(&lp), var(&c.iter), var(&c.item), var(&c.kind)]),
        );
        self.branches(&then_iters, then, otherwise)
    }

    /// Evaluate `then` for the iterations in `then_iters` and `otherwise`
    /// for the remaining ones; each branch only runs when it has iterations.
    fn branches(&mut self, then_iters: &Name, then: NodeId, otherwise: NodeId) -> CResult<Quad> {
        let lp = self.level().loop_.clone();
        let else_iters = self.emit("else", Expr::Diff { col: Box::new(var(&lp)), set: Box::new(var(then_iters)) });
        let t = self.branch_result("t");
        let e = self.branch_result("e");
        let qt = self.branch(then_iters, then, &t)?;
        let qe = self.branch(&else_iters, otherwise, &e)?;
        let merged = self.merge(&t, &e);
        let structured = qt == Interface::NodeStructured && qe == Interface::NodeStructured;
        Ok(merged.into_quad(if structured { Interface::NodeStructured } else { Interface::Generic }))
    }

    fn branch_result(&mut self, stem: &str) -> Columns {
        let mut name = |part: &str| {
            let n = self.fresh(&format!("{stem}{part}"));
            self.buf.push(Stmt::Declare(n.clone(), Some(Expr::empty())));
            n
        };
        Columns { iter: name("_iter"), pos: name("_pos"), item: name("_item"), kind: name("_kind") }
    }

    fn branch(&mut self, iters: &Name, body: NodeId, out: &Columns) -> CResult<Interface> {
        self.buf.begin();
        self.enter_branch(iters);
        let q = self.translate(body, Interface::NodeStructured)?;
        let iface = q.iface;
        let c = self.generic(q)?;
        for (dst, src) in out.names().into_iter().zip(c.names()) {
            self.buf.assign(dst.clone(), var(src));
        }
        self.leave_level()?;
        let stmts = self.buf.end();
        self.buf.push(Stmt::If { cond: Self::nonempty(iters), then: stmts, otherwise: Vec::new() });
        Ok(iface)
    }
}
