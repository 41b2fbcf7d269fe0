use std::fmt;

use super::{CoreKind, CoreTree, FunRef, NodeId, OperandExpr, VarId};

/// Surface-like rendering of a Core subtree, used in traces and test failures.
pub struct Pretty<'a> {
    tree: &'a CoreTree,
    node: NodeId,
}

impl CoreTree {
    pub fn pretty(&self, node: NodeId) -> Pretty<'_> {
        Pretty { tree: self, node }
    }
}

impl Pretty<'_> {
    fn at(&self, node: NodeId) -> Pretty<'_> {
        Pretty { tree: self.tree, node }
    }
}

impl fmt::Display for Pretty<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.tree;
        let var = |v: VarId| t.var(v).name.clone();
        match t.kind(self.node) {
            CoreKind::Empty => f.write_str("()"),
            CoreKind::Str(s) => write!(f, "\"{s}\""),
            CoreKind::Int(i) => write!(f, "{i}"),
            CoreKind::Dec(d) => write!(f, "{d}dec"),
            CoreKind::Dbl(d) => write!(f, "{d}e0"),
            CoreKind::True => f.write_str("true()"),
            CoreKind::False => f.write_str("false()"),
            CoreKind::Var(v) => write!(f, "${}", var(*v)),
            CoreKind::Seq(a, b) => write!(f, "({}, {})", self.at(*a), self.at(*b)),
            CoreKind::For { var: v, pos, input, body } => {
                write!(f, "for ${}", var(*v))?;
                if let Some(p) = pos {
                    write!(f, " at ${}", var(*p))?;
                }
                write!(f, " in {} return {}", self.at(*input), self.at(*body))
            }
            CoreKind::Let { var: v, bound, body } => {
                write!(f, "let ${} := {} return {}", var(*v), self.at(*bound), self.at(*body))
            }
            CoreKind::OrderBy { key, descending, body } => {
                let dir = if *descending { " descending" } else { "" };
                write!(f, "order by {}{dir} return {}", self.at(*key), self.at(*body))
            }
            CoreKind::If { cond, then, otherwise } => {
                write!(f, "if ({}) then {} else {}", self.at(*cond), self.at(*then), self.at(*otherwise))
            }
            CoreKind::Typeswitch { input, case, then, otherwise } => write!(
                f,
                "typeswitch ({}) case {case} return {} default return {}",
                self.at(*input),
                self.at(*then),
                self.at(*otherwise)
            ),
            CoreKind::Step { axis, test, context } => {
                write!(f, "{}/{}::{test}", self.at(*context), axis.name())
            }
            CoreKind::Root => f.write_str("root()"),
            CoreKind::Elem { tag, content } => write!(f, "element {{{}}} {{{}}}", self.at(*tag), self.at(*content)),
            CoreKind::Attr { tag, content } => {
                write!(f, "attribute {{{}}} {{{}}}", self.at(*tag), self.at(*content))
            }
            CoreKind::Text(c) => write!(f, "text {{{}}}", self.at(*c)),
            CoreKind::Tag(q) => write!(f, "{q}"),
            CoreKind::Cast { target, input } => write!(f, "({} cast as {target})", self.at(*input)),
            CoreKind::Apply { fun, args } => {
                match fun {
                    FunRef::Builtin(b) => write!(f, "{b}(")?,
                    FunRef::User(id) => match t.functions.get(id.index()) {
                        Some(decl) => write!(f, "{}(", decl.name)?,
                        None => write!(f, "#fn{}(", id.index())?,
                    },
                }
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", self.at(*a))?;
                }
                f.write_str(")")
            }
            CoreKind::Join(j) => {
                let operand = |o: OperandExpr| match o {
                    OperandExpr::BoundInput => format!("${}", var(j.var)),
                    OperandExpr::Expr(e) => self.at(e).to_string(),
                };
                write!(
                    f,
                    "join ${} in {} on {} {} {}{} return {}",
                    var(j.var),
                    self.at(j.input),
                    operand(j.fst.expr),
                    j.oriented(),
                    operand(j.snd.expr),
                    if j.switched { " (switched)" } else { "" },
                    self.at(j.ret)
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::CoreBuilder;

    #[test]
    fn renders_flwor() {
        let mut b = CoreBuilder::new();
        let input = b.int_seq(&[1, 2]);
        let x = b.for_var("x", input);
        let xr = b.var(x);
        let f = b.for_in(x, None, input, xr);
        let tree = b.finish(f);
        assert_eq!(tree.pretty(f).to_string(), "for $x in (1, 2) return $x");
    }
}
