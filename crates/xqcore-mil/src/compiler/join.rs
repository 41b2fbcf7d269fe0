//! Loop-lifted evaluation of recognized joins.
//!
//! The independent operand is evaluated once, at the shallowest level its
//! variables allow, lifted to the join's enclosing level and then compared
//! against the dependent operand of every loop iteration in one theta-join.
//! Only the iterations with a match continue into the return clause.
use tracing::debug;

use crate::core::{JoinNode, JoinOperand, NodeId, OperandExpr};
use crate::mil::{BinOp, Expr, Kind, Name, UnOp};
use crate::runtime::{Error, ErrorCode};
use crate::scope::hoist_level;

use super::interface::{Interface, Quad, cast_op};
use super::{CResult, Translator, var};

impl Translator<'_> {
    /// `(iter, values)` of a join operand result, cast to the comparison kind.
    fn operand_values(&mut self, q: Quad, k: Option<Kind>) -> CResult<(Name, Name)> {
        let have = match q.iface {
            Interface::Typed(h) => Some(h),
            _ => None,
        };
        let (iter, raw) = self.values(q, None)?;
        let vals = self.cast_operand(&raw, have, k);
        Ok((iter, vals))
    }

    fn cast_operand(&mut self, raw: &Name, have: Option<Kind>, k: Option<Kind>) -> Name {
        let Some(k) = k else { return raw.clone() };
        let op = match have {
            Some(h) => cast_op(h, k),
            None if k == Kind::QName => None,
            None => UnOp::cast_to(k),
        };
        let Some(op) = op else { return raw.clone() };
        let vals = self.emit("jval", Expr::map1(op, var(raw)));
        self.check_castable(raw, &vals, k);
        vals
    }

    /// Evaluate the independent operand at its hoisting level and replicate
    /// its rows down to the current level.
    fn independent(&mut self, snd: &JoinOperand) -> CResult<(Name, Name)> {
        let OperandExpr::Expr(e) = snd.expr else {
            return Err(Error::malformed("the independent join operand cannot be the loop variable"));
        };
        let here = self.depth();
        let d = snd.level.ok_or_else(|| Error::from_code(ErrorCode::PFIN0003, "join operand has no independent level"))?
            as usize;
        if d > here {
            return Err(Error::from_code(
                ErrorCode::PFIN0003,
                format!("join operand level {d} is below the enclosing level {here}"),
            ));
        }
        let h = hoist_level(&self.level_kinds(), d);
        let k = snd.cast.map(Kind::from_atomic);

        let saved = self.levels.split_off(h + 1);
        let out = self.translate(e, k.map_or(Interface::Generic, Interface::Typed)).and_then(|q| self.operand_values(q, k));
        self.levels.extend(saved);
        let (mut iter, mut vals) = out?;

        for l in h + 1..=here {
            let (outer, inner) = (self.levels[l].outer.clone(), self.levels[l].inner.clone());
            let j = self.emit("lift", Expr::EquiJoin { left: Box::new(var(&outer)), right: Box::new(var(&iter)) });
            iter = self.emit("iter", Expr::fetch(var(&inner), Expr::nth(var(&j), 0)));
            vals = self.emit("jval", Expr::fetch(var(&vals), Expr::nth(var(&j), 1)));
        }
        debug!(level = d, hoisted = h, lifted = here - h, "independent join operand");
        Ok((iter, vals))
    }

    pub(super) fn translate_join(&mut self, n: NodeId, j: &JoinNode) -> CResult<Quad> {
        let tree = self.tree;
        self.comment(|| format!("join on ${} ({})", tree.var(j.var).name, j.oriented()));
        let q = self.generic_of(j.input)?;
        let (s_iter, s_vals) = self.independent(&j.snd)?;

        let fid = self.vars.scope_of(n)?;
        self.enter_loop(fid, &q.iter)?;
        self.bind_loop_vars(j.var, j.pos, &q)?;
        let (outer, inner) = (self.level().outer.clone(), self.level().inner.clone());

        let k = j.fst.cast.map(Kind::from_atomic);
        let (f_iter, f_vals) = match j.fst.expr {
            OperandExpr::BoundInput => {
                // One driving row per inner iteration.
                let raw = self.emit("val", Expr::Deref { items: Box::new(var(&q.item)), kinds: Box::new(var(&q.kind)) });
                let vals = self.cast_operand(&raw, None, k);
                (inner.clone(), vals)
            }
            OperandExpr::Expr(e) => {
                let q = self.translate(e, k.map_or(Interface::Generic, Interface::Typed))?;
                self.operand_values(q, k)?
            }
        };
        let f_outer = self.emit("iter", Expr::fetch(var(&outer), Expr::locate(var(&f_iter), var(&inner))));

        let theta = self.emit(
            "theta",
            Expr::ThetaJoin {
                left_iter: Box::new(var(&f_outer)),
                left_vals: Box::new(var(&f_vals)),
                right_iter: Box::new(var(&s_iter)),
                right_vals: Box::new(var(&s_vals)),
                op: BinOp::from_comparison(j.oriented()),
            },
        );
        let sat = self.emit("sat", Expr::Unique(Box::new(Expr::fetch(var(&f_iter), Expr::nth(var(&theta), 0)))));
        self.narrow(&sat);

        let r = self.generic_of(j.ret)?;
        let out = self.map_back(&r, None);
        self.leave_level()?;
        Ok(out.into_quad(Interface::Generic))
    }

    /// Restrict the current loop level to the iterations in `sat`.
    fn narrow(&mut self, sat: &Name) {
        let level = self.level().clone();
        let isel = self.emit("jsel", Expr::select_in(var(&level.inner), var(sat)));
        let esel = self.emit("jsel", Expr::select_in(var(&level.env.iter), var(sat)));
        for c in level.env.columns() {
            self.buf.assign(c.clone(), Expr::fetch(var(c), var(&esel)));
        }
        self.buf.assign(level.outer.clone(), Expr::fetch(var(&level.outer), var(&isel)));
        self.buf.assign(level.inner.clone(), Expr::fetch(var(&level.inner), var(&isel)));
    }
}
