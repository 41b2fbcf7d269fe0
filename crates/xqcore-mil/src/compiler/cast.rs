//! Sequence casts: cardinality checks plus per-kind value conversion.
use crate::core::{ItemType, NodeId, SeqType};
use crate::mil::{Atom, BinOp, Expr, Extern, Kind, Name, UnOp};
use crate::runtime::{Error, ErrorCode};

use super::interface::{Interface, Quad, atomic_of, cast_op};
use super::{CResult, Translator, var};

impl Translator<'_> {
    pub(super) fn translate_cast(&mut self, target: SeqType, input: NodeId) -> CResult<Quad> {
        let Some(a) = target.uniform_atomic() else {
            // Node and item targets only assert; the types were checked upstream.
            return self.translate(input, Interface::Generic);
        };
        let k = Kind::from_atomic(a);
        let ity = self.tree.ty(input);
        let c = self.generic_of(input)?;
        let (item, kind) = if ity.may_contain_nodes() {
            let r = self.emit("atom", Expr::Call(Extern::Atomize, vec![var(&c.item), var(&c.kind)]));
            (self.emit("item", Expr::nth(var(&r), 0)), self.emit("kind", Expr::nth(var(&r), 1)))
        } else {
            (c.item.clone(), c.kind.clone())
        };
        self.check_cardinality(&c.iter, target);

        let raw = self.emit("val", Expr::Deref { items: Box::new(var(&item)), kinds: Box::new(var(&kind)) });
        let from = ity.item().map(ItemType::atomized).and_then(ItemType::atomic);
        let cast = match from {
            Some(f) => {
                if !ity.is_empty() && !f.castable_to(a) {
                    return Err(Error::from_code(ErrorCode::XPTY0004, format!("{} cannot be cast to {}", f.name(), a.name())));
                }
                match cast_op(Kind::from_atomic(f), k) {
                    Some(op) => self.emit("cast", Expr::map1(op, var(&raw))),
                    None => raw.clone(),
                }
            }
            None => self.cast_mixed(&kind, &raw, k)?,
        };
        self.check_castable(&raw, &cast, k);
        Ok(Quad::typed(c.iter, Some(c.pos), cast, k))
    }

    /// Cast rows of several dynamic kinds, one kind at a time, reassembling
    /// the results in row order.
    fn cast_mixed(&mut self, kind: &Name, raw: &Name, k: Kind) -> CResult<Name> {
        let target = atomic_of(k).ok_or_else(|| Error::internal(format!("{} is not an atomic kind", k.name())))?;
        let mut rows: Option<(Name, Name)> = None;
        for from in Kind::ATOMIC {
            let Some(fa) = atomic_of(from) else { continue };
            let p = self.emit("ksel", Expr::select(var(kind), BinOp::Eq, Expr::Const(from.atom())));
            if !fa.castable_to(target) {
                self.raise_if(
                    Self::nonempty(&p),
                    ErrorCode::XPTY0004,
                    format!("{} cannot be cast to {}", fa.name(), target.name()),
                );
                continue;
            }
            let vals = Expr::fetch(var(raw), var(&p));
            let vals = match cast_op(from, k) {
                Some(op) => self.emit("cast", Expr::map1(op, vals)),
                None => self.emit("cast", vals),
            };
            rows = Some(match rows {
                None => (p, vals),
                Some((ps, vs)) => (
                    self.emit("ksel", Expr::append(var(&ps), var(&p))),
                    self.emit("cast", Expr::append(var(&vs), var(&vals))),
                ),
            });
        }
        let Some((positions, values)) = rows else { return Ok(self.emit("cast", Expr::empty())) };
        let perm = self.emit("perm", Expr::Sort(vec![(var(&positions), false)]));
        Ok(self.emit("cast", Expr::fetch(var(&values), var(&perm))))
    }

    /// Raise `XPTY0004` where an iteration's sequence violates the target's
    /// occurrence indicator.
    fn check_cardinality(&mut self, iter: &Name, target: SeqType) {
        let Some(occ) = target.occurrence() else { return };
        let lp = self.level().loop_.clone();
        if !occ.allows_empty() {
            self.raise_if(
                Expr::map2(BinOp::Ne, Expr::count(var(iter)), Expr::count(var(&lp))),
                ErrorCode::XPTY0004,
                format!("empty sequence where {target} is required"),
            );
        }
        if !occ.allows_many() {
            self.raise_if(
                Expr::map2(BinOp::Ne, Expr::count(Expr::Unique(Box::new(var(iter)))), Expr::count(var(iter))),
                ErrorCode::XPTY0004,
                format!("more than one item where {target} is required"),
            );
        }
    }

    /// Raise `FORG0001` when the conversion turned a value into nil.
    pub(super) fn check_castable(&mut self, raw: &Name, cast: &Name, k: Kind) {
        if raw == cast {
            return;
        }
        let nils = |n: &Name| Expr::count(Expr::select(Expr::map1(UnOp::IsNil, var(n)), BinOp::Eq, Expr::Const(Atom::Bit(true))));
        self.raise_if(
            Expr::map2(BinOp::Ne, nils(cast), nils(raw)),
            ErrorCode::FORG0001,
            format!("value not castable to {}", k.name()),
        );
    }
}
