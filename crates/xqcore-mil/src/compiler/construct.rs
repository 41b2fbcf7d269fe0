//! Element, attribute and text constructors.
use crate::core::{AtomicType, NodeId};
use crate::mil::{AggrFn, Expr, Extern, Kind, Name};

use super::interface::{Columns, Interface, Quad};
use super::{CResult, Translator, var};

impl Translator<'_> {
    /// `(iter, qname refs)` of a constructor's name expression.
    fn tag_of(&mut self, tag: NodeId) -> CResult<(Name, Name)> {
        let (iter, names) = self.values_of(tag, Some(Kind::QName))?;
        let refs = self.refs(&names, Kind::QName);
        Ok((iter, refs))
    }

    /// One string per iteration of the current level from `content`: used
    /// as is when it is a single string, otherwise the items' string forms
    /// joined by spaces (the empty string for no items).
    pub(super) fn string_content(&mut self, content: NodeId) -> CResult<(Name, Name)> {
        let ty = self.tree.ty(content);
        if ty.is_exactly_one() && matches!(ty.uniform_atomic(), Some(AtomicType::String | AtomicType::UntypedAtomic)) {
            return self.values_of(content, Some(Kind::Str));
        }
        let lp = self.level().loop_.clone();
        let c = self.generic_of(content)?;
        let strings = self.emit("str", Expr::Call(Extern::Stringify, vec![var(&c.item), var(&c.kind)]));
        let joined = self.emit(
            "str",
            Expr::Aggr { f: AggrFn::StrJoin, groups: Box::new(var(&c.iter)), values: Box::new(var(&strings)), domain: Box::new(var(&lp)) },
        );
        Ok((lp, joined))
    }

    fn constructed(&mut self, r: &Name, k: Kind) -> Quad {
        let iter = self.emit("iter", Expr::nth(var(r), 0));
        let item = self.emit("item", Expr::nth(var(r), 1));
        let pos = self.emit("pos", Expr::project(Expr::int(1), var(&iter)));
        let kind = self.emit("kind", Expr::project(Expr::Const(k.atom()), var(&iter)));
        Columns { iter, pos, item, kind }.into_quad(Interface::NodeStructured)
    }

    pub(super) fn translate_elem(&mut self, tag: NodeId, content: NodeId) -> CResult<Quad> {
        let (t_iter, t_refs) = self.tag_of(tag)?;
        let q = self.translate(content, Interface::NodeStructured)?;
        let adopt = q.iface == Interface::NodeStructured;
        let c = self.generic(q)?;
        let r = self.emit(
            "elem",
            Expr::Call(
                Extern::ElemConstruct { adopt },
                vec![var(&t_iter), var(&t_refs), var(&c.iter), var(&c.item), var(&c.kind)],
            ),
        );
        Ok(self.constructed(&r, Kind::Node))
    }

    pub(super) fn translate_attr(&mut self, tag: NodeId, content: NodeId) -> CResult<Quad> {
        let (t_iter, t_refs) = self.tag_of(tag)?;
        let (v_iter, v_vals) = self.string_content(content)?;
        let r = self.emit(
            "attr",
            Expr::Call(Extern::AttrConstruct, vec![var(&t_iter), var(&t_refs), var(&v_iter), var(&v_vals)]),
        );
        Ok(self.constructed(&r, Kind::Attr))
    }

    pub(super) fn translate_text(&mut self, content: NodeId) -> CResult<Quad> {
        let (iter, vals) = self.string_content(content)?;
        let r = self.emit("text", Expr::Call(Extern::TextConstruct, vec![var(&iter), var(&vals)]));
        Ok(self.constructed(&r, Kind::Node))
    }
}
