//! Location steps, the context root and `fn:doc`.
use crate::core::{Axis, CoreKind, NodeId, NodeTest, NodeType};
use crate::mil::{Expr, Extern, Kind};
use crate::runtime::{Error, ErrorCode};

use super::interface::{Columns, Interface, Quad};
use super::{CResult, Translator, var};

/// Reject axis/test combinations that can never select anything.
fn check_step(axis: Axis, test: &NodeTest) -> CResult<()> {
    let NodeTest::Kind(k) = test else { return Ok(()) };
    let malformed = match axis {
        Axis::Attribute => matches!(k, NodeType::Element | NodeType::Text | NodeType::Document),
        Axis::Child
        | Axis::Descendant
        | Axis::FollowingSibling
        | Axis::PrecedingSibling
        | Axis::Following
        | Axis::Preceding => matches!(k, NodeType::Attribute | NodeType::Document),
        _ => false,
    };
    if malformed {
        return Err(Error::from_code(ErrorCode::XQST0070, format!("{}::{test} never selects a node", axis.name())));
    }
    Ok(())
}

impl Translator<'_> {
    pub(super) fn translate_step(&mut self, axis: Axis, test: &NodeTest, context: NodeId) -> CResult<Quad> {
        check_step(axis, test)?;
        let cty = self.tree.ty(context);
        if !cty.is_empty() && cty.is_atomic_sequence() {
            return Err(Error::from_code(
                ErrorCode::XPTY0019,
                format!("{}::{test} applied to a sequence of type {cty}", axis.name()),
            ));
        }
        // Consecutive steps consume each other's output without re-sorting.
        let want = if matches!(self.tree.kind(context), CoreKind::Step { .. }) { Interface::Swapped } else { Interface::Generic };
        let q = self.translate(context, want)?;
        let (iter, item, kind) = match (q.iface, q.kind) {
            (Interface::Swapped, Some(kind)) => (q.iter, q.item, kind),
            (iface, kind) => {
                let c = self.generic(Quad { kind, iface, ..q })?;
                (c.iter, c.item, c.kind)
            }
        };
        let r = self.emit(
            "step",
            Expr::Call(Extern::Step { axis, test: test.clone() }, vec![var(&iter), var(&item), var(&kind)]),
        );
        let s_iter = self.emit("iter", Expr::nth(var(&r), 0));
        let s_item = self.emit("item", Expr::nth(var(&r), 1));
        let k = if axis == Axis::Attribute { Kind::Attr } else { Kind::Node };
        let s_kind = self.emit("kind", Expr::project(Expr::Const(k.atom()), var(&s_iter)));
        Ok(Quad { iter: s_iter, pos: None, item: s_item, kind: Some(s_kind), iface: Interface::Swapped })
    }

    pub(super) fn translate_root(&mut self) -> Quad {
        let lp = self.level().loop_.clone();
        let r = self.emit("root", Expr::Call(Extern::ContextRoot, vec![var(&lp)]));
        let iter = self.emit("iter", Expr::nth(var(&r), 0));
        let item = self.emit("item", Expr::nth(var(&r), 1));
        let pos = self.emit("pos", Expr::project(Expr::int(1), var(&iter)));
        let kind = self.emit("kind", Expr::project(Expr::Const(Kind::Node.atom()), var(&iter)));
        Columns { iter, pos, item, kind }.into_quad(Interface::Generic)
    }

    pub(super) fn translate_doc(&mut self, uri: NodeId) -> CResult<Quad> {
        let c = self.generic_of(uri)?;
        let r = self.emit("doc", Expr::Call(Extern::Doc, vec![var(&c.iter), var(&c.item), var(&c.kind)]));
        let iter = self.emit("iter", Expr::nth(var(&r), 0));
        let item = self.emit("item", Expr::nth(var(&r), 1));
        let pos = self.emit("pos", Expr::mark_grp(var(&iter)));
        let kind = self.emit("kind", Expr::project(Expr::Const(Kind::Node.atom()), var(&iter)));
        Ok(Columns { iter, pos, item, kind }.into_quad(Interface::Generic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::QName;

    #[test]
    fn malformed_steps_are_rejected() {
        let err = check_step(Axis::Attribute, &NodeTest::Kind(NodeType::Element)).unwrap_err();
        assert_eq!(err.code, ErrorCode::XQST0070);
        assert!(check_step(Axis::Child, &NodeTest::Kind(NodeType::Document)).is_err());
        assert!(check_step(Axis::Child, &NodeTest::Kind(NodeType::Text)).is_ok());
        assert!(check_step(Axis::SelfAxis, &NodeTest::Kind(NodeType::Document)).is_ok());
        assert!(check_step(Axis::Attribute, &NodeTest::Name(QName::local("id"))).is_ok());
    }
}
