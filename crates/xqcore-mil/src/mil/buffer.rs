//! Emission buffer: the append-only sink the translator writes into.
//!
//! Statements are appended to the innermost open block. [`MilBuffer::finish`]
//! closes the root block and optionally runs a peephole pass that drops
//! statements whose removal cannot be observed.
use std::collections::HashSet;

use tracing::trace;

use super::{Atom, Expr, Name, Stmt};

#[derive(Debug)]
pub struct MilBuffer {
    blocks: Vec<Vec<Stmt>>,
}

impl Default for MilBuffer {
    fn default() -> Self {
        Self { blocks: vec![Vec::new()] }
    }
}

impl MilBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stmt: Stmt) {
        if let Some(b) = self.blocks.last_mut() {
            b.push(stmt);
        }
    }

    pub fn assign(&mut self, name: impl Into<Name>, e: Expr) {
        self.push(Stmt::Assign(name.into(), e));
    }

    pub fn comment(&mut self, text: impl Into<String>) {
        self.push(Stmt::Comment(text.into()));
    }

    /// Open a nested block; statements go there until [`Self::end`].
    pub fn begin(&mut self) {
        self.blocks.push(Vec::new());
    }

    pub fn end(&mut self) -> Vec<Stmt> {
        if self.blocks.len() > 1 { self.blocks.pop().unwrap_or_default() } else { Vec::new() }
    }

    pub fn depth(&self) -> usize {
        self.blocks.len() - 1
    }

    /// Close every open block and return the root statement list.
    pub fn finish(mut self, optimize: bool, comments: bool) -> Vec<Stmt> {
        while self.blocks.len() > 1 {
            let inner = self.end();
            self.push(Stmt::Block(inner));
        }
        let stmts = self.blocks.pop().unwrap_or_default();
        if optimize || !comments { peephole(stmts, optimize, comments) } else { stmts }
    }
}

/// Run the peephole rules to a fixed point.
pub fn peephole(mut stmts: Vec<Stmt>, optimize: bool, comments: bool) -> Vec<Stmt> {
    let mut before = count(&stmts);
    loop {
        stmts = pass(stmts, optimize, comments);
        let after = count(&stmts);
        trace!(before, after, "peephole pass");
        if after == before {
            return stmts;
        }
        before = after;
    }
}

fn count(stmts: &[Stmt]) -> usize {
    stmts
        .iter()
        .map(|s| match s {
            Stmt::Block(b) => 1 + count(b),
            Stmt::If { then, otherwise, .. } => 1 + count(then) + count(otherwise),
            _ => 1,
        })
        .sum()
}

fn reads(e: &Expr, name: &str) -> bool {
    let mut out = Vec::new();
    e.reads(&mut out);
    out.iter().any(|n| n == name)
}

fn pass(stmts: Vec<Stmt>, optimize: bool, comments: bool) -> Vec<Stmt> {
    let mut out: Vec<Stmt> = Vec::with_capacity(stmts.len());
    let mut freed: HashSet<Name> = HashSet::new();
    for s in stmts {
        let s = match s {
            Stmt::Comment(_) if !comments => continue,
            Stmt::Block(b) => {
                let b = pass(b, optimize, comments);
                if optimize && b.is_empty() {
                    continue;
                }
                Stmt::Block(b)
            }
            Stmt::If { cond, then, otherwise } => {
                let then = pass(then, optimize, comments);
                let otherwise = pass(otherwise, optimize, comments);
                if optimize {
                    match cond {
                        Expr::Const(Atom::Bit(true)) => {
                            out.extend(then);
                            continue;
                        }
                        Expr::Const(Atom::Bit(false)) => {
                            out.extend(otherwise);
                            continue;
                        }
                        ref c if then.is_empty() && otherwise.is_empty() && !c.has_effect() => continue,
                        _ => {}
                    }
                }
                Stmt::If { cond, then, otherwise }
            }
            other => other,
        };
        if !optimize {
            out.push(s);
            continue;
        }
        match &s {
            Stmt::Assign(n, Expr::Var(m)) if n == m => continue,
            Stmt::Free(n) => {
                if !freed.insert(n.clone()) {
                    continue;
                }
            }
            Stmt::Assign(n, e) => {
                freed.remove(n);
                // An overwritten store that was never read is dead.
                if let Some(Stmt::Assign(prev, pe)) = out.last()
                    && prev == n
                    && !pe.has_effect()
                    && !reads(e, n)
                {
                    out.pop();
                }
            }
            Stmt::Declare(n, _) => {
                freed.remove(n);
            }
            _ => {}
        }
        out.push(s);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mil::BinOp;

    #[test]
    fn drops_self_assignments_and_dead_stores() {
        let mut buf = MilBuffer::new();
        buf.assign("a", Expr::int(1));
        buf.assign("a", Expr::int(2));
        buf.assign("b", Expr::var("b"));
        buf.assign("c", Expr::int(3));
        buf.assign("c", Expr::map2(BinOp::Add, Expr::var("c"), Expr::int(1)));
        let out = buf.finish(true, true);
        assert_eq!(
            out,
            vec![
                Stmt::assign("a", Expr::int(2)),
                Stmt::assign("c", Expr::int(3)),
                Stmt::assign("c", Expr::map2(BinOp::Add, Expr::var("c"), Expr::int(1))),
            ]
        );
    }

    #[test]
    fn folds_constant_conditions_and_empty_blocks() {
        let stmts = vec![
            Stmt::If {
                cond: Expr::Const(Atom::Bit(false)),
                then: vec![Stmt::assign("x", Expr::int(1))],
                otherwise: vec![Stmt::assign("x", Expr::int(2))],
            },
            Stmt::Block(vec![Stmt::Comment("nothing".into())]),
            Stmt::Free(Name::from("x")),
            Stmt::Free(Name::from("x")),
        ];
        let out = peephole(stmts, true, false);
        assert_eq!(out, vec![Stmt::assign("x", Expr::int(2)), Stmt::Free(Name::from("x"))]);
    }

    #[test]
    fn unoptimized_keeps_everything_but_comments() {
        let mut buf = MilBuffer::new();
        buf.comment("hello");
        buf.assign("a", Expr::var("a"));
        assert_eq!(buf.finish(false, false), vec![Stmt::assign("a", Expr::var("a"))]);
    }
}
