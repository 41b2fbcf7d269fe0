//! Levels, environments and loop entry/exit.
use std::collections::BTreeSet;

use compact_str::format_compact;

use crate::context::ScopeId;
use crate::core::VarId;
use crate::mil::{Atom, BinOp, Expr, Name, Stmt};
use crate::runtime::{Error, ErrorCode};
use crate::scope::LevelKind;

use super::interface::{Columns, Interface, Quad};
use super::{CResult, Translator, var};

/// Environment columns `vid | iter | pos | item | kind` of one level.
#[derive(Debug, Clone)]
pub(super) struct Env {
    pub vid: Name,
    pub iter: Name,
    pub pos: Name,
    pub item: Name,
    pub kind: Name,
}

impl Env {
    fn new(n: u32) -> Env {
        Env {
            vid: format_compact!("v_vid{n:03}"),
            iter: format_compact!("v_iter{n:03}"),
            pos: format_compact!("v_pos{n:03}"),
            item: format_compact!("v_item{n:03}"),
            kind: format_compact!("v_kind{n:03}"),
        }
    }

    pub fn columns(&self) -> [&Name; 5] {
        [&self.vid, &self.iter, &self.pos, &self.item, &self.kind]
    }
}

#[derive(Debug, Clone)]
pub(super) struct Level {
    pub kind: LevelKind,
    /// Iterations live at this level.
    pub loop_: Name,
    /// For a loop level: the enclosing iteration of each row of `inner`.
    pub outer: Name,
    pub inner: Name,
    pub env: Env,
    /// Vids bound in `env`.
    pub live: BTreeSet<u32>,
}

impl Level {
    /// Level 0 of the query body or of a procedure, whose parameters carry
    /// the same names.
    pub fn root(kind: LevelKind, live: BTreeSet<u32>) -> Level {
        Level {
            kind,
            loop_: Name::from("loop000"),
            outer: Name::from("outer000"),
            inner: Name::from("inner000"),
            env: Env::new(0),
            live,
        }
    }

    pub fn params(&self) -> Vec<Name> {
        let mut out = vec![self.loop_.clone(), self.outer.clone(), self.inner.clone()];
        out.extend(self.env.columns().into_iter().cloned());
        out
    }
}

impl Translator<'_> {
    pub(super) fn level(&self) -> &Level {
        // The stack always holds the root while translating.
        &self.levels[self.levels.len() - 1]
    }

    fn level_mut(&mut self) -> &mut Level {
        let last = self.levels.len() - 1;
        &mut self.levels[last]
    }

    pub(super) fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    pub(super) fn level_kinds(&self) -> Vec<LevelKind> {
        self.levels.iter().map(|l| l.kind).collect()
    }

    fn next_level(&mut self) -> u32 {
        self.level_count += 1;
        self.level_count
    }

    /// Enter the loop scope `fid` driven by the rows of `iter`: every row
    /// becomes one iteration of the new level, and the variables the scope
    /// needs are replicated onto those iterations.
    pub(super) fn enter_loop(&mut self, fid: ScopeId, iter: &Name) -> CResult<()> {
        let n = self.next_level();
        let parent = self.level().clone();
        let outer = format_compact!("outer{n:03}");
        let inner = format_compact!("inner{n:03}");
        self.buf.assign(outer.clone(), var(iter));
        self.buf.assign(inner.clone(), Expr::Mark { col: Box::new(var(iter)), start: 1 });

        let env = Env::new(n);
        let vids = self.vars.expansion(fid);
        if let Some(v) = vids.iter().find(|v| !parent.live.contains(v)) {
            return Err(Error::from_code(
                ErrorCode::PFIN0001,
                format!("variable {v} is expanded into scope {} but not bound at level {}", fid.0, self.depth()),
            ));
        }
        if vids.is_empty() {
            for c in env.columns() {
                self.buf.assign(c.clone(), Expr::empty());
            }
        } else {
            let wanted = self.emit(
                "xvid",
                Expr::fetch(Expr::var("vu_vid"), Expr::select(Expr::var("vu_fid"), BinOp::Eq, Expr::int(i64::from(fid.0)))),
            );
            let sel = self.emit("xsel", Expr::select_in(var(&parent.env.vid), var(&wanted)));
            let picked: Vec<Name> =
                parent.env.columns().into_iter().map(|c| self.emit("xenv", Expr::fetch(var(c), var(&sel)))).collect();
            // picked[1] is the iteration column
            let j = self.emit("xjoin", Expr::EquiJoin { left: Box::new(var(&outer)), right: Box::new(var(&picked[1])) });
            for (i, (dst, src)) in env.columns().into_iter().zip(&picked).enumerate() {
                let e = if i == 1 {
                    Expr::fetch(var(&inner), Expr::nth(var(&j), 0))
                } else {
                    Expr::fetch(var(src), Expr::nth(var(&j), 1))
                };
                self.buf.assign(dst.clone(), e);
            }
        }
        self.levels.push(Level {
            kind: LevelKind::Loop(fid),
            loop_: inner.clone(),
            outer,
            inner,
            env,
            live: vids.into_iter().collect(),
        });
        Ok(())
    }

    /// Enter a conditional branch restricted to the iterations in `iters`.
    pub(super) fn enter_branch(&mut self, iters: &Name) {
        let n = self.next_level();
        let parent = self.level().clone();
        let env = Env::new(n);

        let copy: Vec<Stmt> = env
            .columns()
            .into_iter()
            .zip(parent.env.columns())
            .map(|(dst, src)| Stmt::Assign(dst.clone(), var(src)))
            .collect();
        self.buf.begin();
        let sel = self.emit("bsel", Expr::select_in(var(&parent.env.iter), var(iters)));
        for (dst, src) in env.columns().into_iter().zip(parent.env.columns()) {
            self.buf.assign(dst.clone(), Expr::fetch(var(src), var(&sel)));
        }
        let restrict = self.buf.end();
        self.buf.push(Stmt::If {
            cond: Expr::map2(BinOp::Eq, Expr::count(var(iters)), Expr::count(var(&parent.loop_))),
            then: copy,
            otherwise: restrict,
        });

        self.levels.push(Level {
            kind: LevelKind::Branch,
            loop_: iters.clone(),
            outer: iters.clone(),
            inner: iters.clone(),
            env,
            live: parent.live,
        });
    }

    /// Pop the current level and release its variables.
    pub(super) fn leave_level(&mut self) -> CResult<Level> {
        if self.levels.len() < 2 {
            return Err(Error::internal("leaving the root level"));
        }
        let Some(level) = self.levels.pop() else { return Err(Error::internal("level stack is empty")) };
        for c in level.env.columns() {
            self.buf.push(Stmt::Free(c.clone()));
        }
        if matches!(level.kind, LevelKind::Loop(_)) {
            self.buf.push(Stmt::Free(level.outer.clone()));
            self.buf.push(Stmt::Free(level.inner.clone()));
        }
        Ok(level)
    }

    /// Append the rows of `c` as variable `vid` of the current level.
    pub(super) fn bind(&mut self, vid: u32, c: &Columns) {
        let env = self.level().env.clone();
        self.buf.assign(
            env.vid.clone(),
            Expr::append(var(&env.vid), Expr::project(Expr::int(i64::from(vid)), var(&c.iter))),
        );
        for (dst, src) in [&env.iter, &env.pos, &env.item, &env.kind].into_iter().zip(c.names()) {
            self.buf.assign(dst.clone(), Expr::append(var(dst), var(src)));
        }
        self.level_mut().live.insert(vid);
    }

    /// The rows of variable `vid` in the current environment.
    pub(super) fn rows_of(&mut self, vid: u32) -> CResult<Columns> {
        if !self.level().live.contains(&vid) {
            return Err(Error::from_code(
                ErrorCode::PFIN0001,
                format!("variable {vid} is not bound at level {}", self.depth()),
            ));
        }
        let env = self.level().env.clone();
        let p = self.emit("vsel", Expr::select(var(&env.vid), BinOp::Eq, Expr::int(i64::from(vid))));
        let iter = self.emit("iter", Expr::fetch(var(&env.iter), var(&p)));
        let pos = self.emit("pos", Expr::fetch(var(&env.pos), var(&p)));
        let item = self.emit("item", Expr::fetch(var(&env.item), var(&p)));
        let kind = self.emit("kind", Expr::fetch(var(&env.kind), var(&p)));
        Ok(Columns { iter, pos, item, kind })
    }

    pub(super) fn lookup_var(&mut self, v: VarId) -> CResult<Quad> {
        let vid = self.vars.vid(v).map_err(|_| {
            Error::from_code(ErrorCode::PFIN0001, format!("${} has no variable table entry", self.tree.var(v).name))
        })?;
        Ok(self.rows_of(vid)?.into_quad(Interface::Generic))
    }

    /// Map the result `r` of the current loop level back to the enclosing
    /// iterations, optionally reordered by a per-iteration key.
    pub(super) fn map_back(&mut self, r: &Columns, order: Option<(Name, Name, bool)>) -> Columns {
        let (outer, inner) = (self.level().outer.clone(), self.level().inner.clone());
        let it = self.emit("iter", Expr::fetch(var(&outer), Expr::locate(var(&r.iter), var(&inner))));
        let (it, item, kind) = match order {
            None => (it, r.item.clone(), r.kind.clone()),
            Some((kiter, kvals, descending)) => {
                let key = self.emit("key", Expr::lookup(var(&r.iter), var(&kiter), var(&kvals), Atom::Nil));
                let perm = self.emit(
                    "perm",
                    Expr::Sort(vec![(var(&it), false), (var(&key), descending), (var(&r.iter), false), (var(&r.pos), false)]),
                );
                let it = self.emit("iter", Expr::fetch(var(&it), var(&perm)));
                let item = self.emit("item", Expr::fetch(var(&r.item), var(&perm)));
                let kind = self.emit("kind", Expr::fetch(var(&r.kind), var(&perm)));
                (it, item, kind)
            }
        };
        let pos = self.emit("pos", Expr::mark_grp(var(&it)));
        Columns { iter: it, pos, item, kind }
    }
}
