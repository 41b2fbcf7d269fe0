//! Result interfaces and the conversions between them.
//!
//! Every translation case reports the interface it actually produced; the
//! caller reconciles with [`Translator::generic`] or [`Translator::values`].
use crate::core::{AtomicType, NodeId};
use crate::mil::{Expr, Kind, Name, UnOp};

use super::{CResult, Translator, var};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    /// `iter | pos | item | kind`; items are references resolved through `kind`.
    Generic,
    /// Raw values of a single atomic kind; no kind column.
    Typed(Kind),
    /// Generic columns over freshly constructed, parentless nodes that an
    /// enclosing constructor may adopt instead of copying.
    NodeStructured,
    /// Step output `(iter, item)` ordered by document order, then iteration.
    Swapped,
}

/// Variables holding one translated result.
#[derive(Debug, Clone, PartialEq)]
pub struct Quad {
    pub iter: Name,
    pub pos: Option<Name>,
    pub item: Name,
    pub kind: Option<Name>,
    pub iface: Interface,
}

/// A result in the generic interface, all four columns present.
#[derive(Debug, Clone, PartialEq)]
pub struct Columns {
    pub iter: Name,
    pub pos: Name,
    pub item: Name,
    pub kind: Name,
}

impl Columns {
    pub fn into_quad(self, iface: Interface) -> Quad {
        Quad { iter: self.iter, pos: Some(self.pos), item: self.item, kind: Some(self.kind), iface }
    }

    pub fn names(&self) -> [&Name; 4] {
        [&self.iter, &self.pos, &self.item, &self.kind]
    }
}

impl Quad {
    pub fn typed(iter: Name, pos: Option<Name>, values: Name, kind: Kind) -> Quad {
        Quad { iter, pos, item: values, kind: None, iface: Interface::Typed(kind) }
    }
}

pub(crate) fn atomic_of(k: Kind) -> Option<AtomicType> {
    Some(match k {
        Kind::Bool => AtomicType::Boolean,
        Kind::Int => AtomicType::Integer,
        Kind::Dec => AtomicType::Decimal,
        Kind::Dbl => AtomicType::Double,
        Kind::Str => AtomicType::String,
        Kind::UntypedAtomic => AtomicType::UntypedAtomic,
        Kind::QName => AtomicType::QName,
        Kind::Node | Kind::Attr => return None,
    })
}

/// Operation turning raw values of kind `from` into raw values of kind `to`,
/// `None` when the representation is already right.
pub(crate) fn cast_op(from: Kind, to: Kind) -> Option<UnOp> {
    let stringy = |k: Kind| matches!(k, Kind::Str | Kind::UntypedAtomic);
    if from == to || (stringy(from) && stringy(to)) {
        return None;
    }
    match to {
        Kind::Str | Kind::UntypedAtomic if from == Kind::Dec => Some(UnOp::DecToStr),
        Kind::Str | Kind::UntypedAtomic => Some(UnOp::ToStr),
        // QNames are kept in their Clark string form.
        Kind::QName => None,
        k => UnOp::cast_to(k),
    }
}

impl Translator<'_> {
    /// Item references for raw `values` of kind `k`.
    pub(super) fn refs(&mut self, values: &Name, k: Kind) -> Name {
        let e = match (k, k.container()) {
            (Kind::Bool, _) => Expr::map1(UnOp::BitToOid, var(values)),
            (_, Some(c)) => Expr::Intern { container: c, values: Box::new(var(values)) },
            (_, None) => return values.clone(),
        };
        self.emit("ref", e)
    }

    /// Bring a result into the generic interface.
    pub(super) fn generic(&mut self, q: Quad) -> CResult<Columns> {
        match q.iface {
            Interface::Generic | Interface::NodeStructured => match (q.pos, q.kind) {
                (Some(pos), Some(kind)) => Ok(Columns { iter: q.iter, pos, item: q.item, kind }),
                (pos, kind) => {
                    let pos = pos.unwrap_or_else(|| self.emit("pos", Expr::mark_grp(var(&q.iter))));
                    let kind = match kind {
                        Some(k) => k,
                        None => self.emit("kind", Expr::project(Expr::Const(Kind::Node.atom()), var(&q.iter))),
                    };
                    Ok(Columns { iter: q.iter, pos, item: q.item, kind })
                }
            },
            Interface::Typed(k) => {
                let item = self.refs(&q.item, k);
                let kind = self.emit("kind", Expr::project(Expr::Const(k.atom()), var(&q.iter)));
                let pos = match q.pos {
                    Some(p) => p,
                    None => self.emit("pos", Expr::mark_grp(var(&q.iter))),
                };
                Ok(Columns { iter: q.iter, pos, item, kind })
            }
            Interface::Swapped => {
                // A stable sort on the iteration keeps document order within each one.
                let perm = self.emit("perm", Expr::Sort(vec![(var(&q.iter), false)]));
                let iter = self.emit("iter", Expr::fetch(var(&q.iter), var(&perm)));
                let item = self.emit("item", Expr::fetch(var(&q.item), var(&perm)));
                let kind = match &q.kind {
                    Some(k) => self.emit("kind", Expr::fetch(var(k), var(&perm))),
                    None => self.emit("kind", Expr::project(Expr::Const(Kind::Node.atom()), var(&iter))),
                };
                let pos = self.emit("pos", Expr::mark_grp(var(&iter)));
                Ok(Columns { iter, pos, item, kind })
            }
        }
    }

    /// `(iter, raw values)` of a result, optionally cast into kind `want`.
    /// Nodes yield their string value.
    pub(super) fn values(&mut self, q: Quad, want: Option<Kind>) -> CResult<(Name, Name)> {
        let (iter, raw, have) = match q.iface {
            Interface::Typed(k) => (q.iter, q.item, Some(k)),
            _ => {
                let c = self.generic(q)?;
                let raw = self.emit("val", Expr::Deref { items: Box::new(var(&c.item)), kinds: Box::new(var(&c.kind)) });
                (c.iter, raw, None)
            }
        };
        let Some(want) = want else { return Ok((iter, raw)) };
        let op = match have {
            Some(have) => cast_op(have, want),
            None => match want {
                Kind::QName => None,
                k => UnOp::cast_to(k),
            },
        };
        Ok(match op {
            Some(op) => {
                let cast = self.emit("val", Expr::map1(op, var(&raw)));
                (iter, cast)
            }
            None => (iter, raw),
        })
    }

    pub(super) fn values_of(&mut self, n: NodeId, want: Option<Kind>) -> CResult<(Name, Name)> {
        let request = want.map_or(Interface::Generic, Interface::Typed);
        let q = self.translate(n, request)?;
        self.values(q, want)
    }

    pub(super) fn generic_of(&mut self, n: NodeId) -> CResult<Columns> {
        let q = self.translate(n, Interface::Generic)?;
        self.generic(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn casts_between_representations() {
        assert_eq!(cast_op(Kind::Int, Kind::Int), None);
        assert_eq!(cast_op(Kind::Str, Kind::UntypedAtomic), None);
        assert_eq!(cast_op(Kind::Dec, Kind::Str), Some(UnOp::DecToStr));
        assert_eq!(cast_op(Kind::Dbl, Kind::UntypedAtomic), Some(UnOp::ToStr));
        assert_eq!(cast_op(Kind::Str, Kind::QName), None);
        assert_eq!(cast_op(Kind::Int, Kind::Dbl), Some(UnOp::ToDbl));
        assert_eq!(cast_op(Kind::Str, Kind::Bool), Some(UnOp::ToBit));
    }

    #[test]
    fn every_atomic_kind_has_a_type() {
        for k in Kind::ATOMIC {
            let a = atomic_of(k).unwrap();
            assert_eq!(Kind::from_atomic(a), k);
        }
        assert_eq!(atomic_of(Kind::Attr), None);
    }
}
