//! Loop-lifted translation of Core into MIL.
//!
//! Every expression is compiled once for all iterations of its enclosing
//! loops: its value is a relation `iter | pos | item | kind` (see
//! [`Interface`]) and a `for` body runs once over the rows of its level's
//! `loop` relation. Variables live in per-level environment columns
//! `vid | iter | pos | item | kind`; entering a loop replicates the
//! variables the loop body needs (its expansion) onto the new iterations.
use std::collections::{BTreeSet, HashMap};
use std::mem;

use compact_str::format_compact;
use tracing::{debug, trace};

use crate::context::{CompileOptions, ScopeId};
use crate::core::{CoreKind, CoreTree, FunId, FunRef, NodeId};
use crate::engine::value::AtomKey;
use crate::mil::{Atom, BinOp, Container, Expr, Extern, Kind, MilBuffer, MilProgram, Name, Proc, Stmt};
use crate::runtime::{Error, ErrorCode};
use crate::scope::{LevelKind, VarTable};

mod cast;
mod construct;
mod flwor;
mod functions;
pub mod interface;
mod join;
mod paths;
mod scope;

pub use interface::{Columns, Interface, Quad};
use scope::Level;

pub(crate) type CResult<T> = Result<T, Error>;

pub(crate) fn var(n: &Name) -> Expr {
    Expr::Var(n.clone())
}

/// Literal values interned by the prologue, one table per container, in
/// the order the containers will hand out their oids.
#[derive(Debug, Default)]
struct Literals {
    values: [Vec<Atom>; 5],
    index: HashMap<(Container, AtomKey), u64>,
}

impl Literals {
    fn intern(&mut self, c: Container, a: Atom) -> u64 {
        let table = &mut self.values[c.index()];
        *self.index.entry((c, AtomKey::from(&a))).or_insert_with(|| {
            table.push(a);
            table.len() as u64 - 1
        })
    }
}

pub struct Translator<'t> {
    tree: &'t CoreTree,
    vars: &'t VarTable,
    options: &'t CompileOptions,
    buf: MilBuffer,
    levels: Vec<Level>,
    literals: Literals,
    names: u32,
    level_count: u32,
    procs: Vec<Proc>,
    proc_names: HashMap<FunId, Name>,
}

/// Translate a (simplified, join-rewritten) Core tree into a MIL program.
pub fn translate(tree: &CoreTree, vars: &VarTable, options: &CompileOptions) -> Result<MilProgram, Error> {
    let mut t = Translator::new(tree, vars, options);

    for (i, f) in tree.functions.iter().enumerate() {
        if f.body.is_some() {
            t.proc_names.insert(FunId(i as u32), format_compact!("fn_{}_{i}", f.name.local));
        }
    }
    for i in 0..tree.functions.len() {
        t.translate_function(FunId(i as u32))?;
    }

    t.levels.push(Level::root(LevelKind::Loop(ScopeId(0)), BTreeSet::new()));
    for g in vars.global_order().iter().filter_map(|i| tree.globals.get(*i)) {
        if !vars.is_used(g.var) {
            continue;
        }
        t.comment(|| format!("declare variable ${}", tree.var(g.var).name));
        let c = t.generic_of(g.init)?;
        let vid = vars.vid(g.var)?;
        t.bind(vid, &c);
    }
    t.comment(|| "query body".to_string());
    let q = t.generic_of(tree.query()?)?;
    let result = [q.iter, q.pos, q.item, q.kind];

    let body = mem::take(&mut t.buf).finish(options.optimize, options.comments);
    let mut epilogue = Vec::new();
    if options.serialize_result {
        epilogue.push(Stmt::Exec(Expr::Call(Extern::PrintResult, result.iter().map(var).collect())));
    }
    let prologue = t.prologue();
    debug!(procs = t.procs.len(), names = t.names, levels = t.level_count, "program assembled");
    Ok(MilProgram { prologue, procs: t.procs, body, epilogue, result })
}

impl<'t> Translator<'t> {
    fn new(tree: &'t CoreTree, vars: &'t VarTable, options: &'t CompileOptions) -> Self {
        Self {
            tree,
            vars,
            options,
            buf: MilBuffer::new(),
            levels: Vec::new(),
            literals: Literals::default(),
            names: 0,
            level_count: 0,
            procs: Vec::new(),
            proc_names: HashMap::new(),
        }
    }

    fn fresh(&mut self, stem: &str) -> Name {
        self.names += 1;
        format_compact!("{stem}_{}", self.names)
    }

    /// Assign `e` to a fresh variable.
    pub(super) fn emit(&mut self, stem: &str, e: Expr) -> Name {
        let n = self.fresh(stem);
        self.buf.assign(n.clone(), e);
        n
    }

    fn comment(&mut self, text: impl FnOnce() -> String) {
        if self.options.comments {
            self.buf.comment(text());
        }
    }

    /// `if (cond) { raise code }`
    fn raise_if(&mut self, cond: Expr, code: ErrorCode, message: impl Into<String>) {
        self.buf.push(Stmt::If {
            cond,
            then: vec![Stmt::Raise { code, message: message.into() }],
            otherwise: Vec::new(),
        });
    }

    fn nonempty(n: &Name) -> Expr {
        Expr::map2(BinOp::Gt, Expr::count(var(n)), Expr::int(0))
    }

    /// Translate into a fresh buffer and level stack, restoring both afterwards.
    fn fragment<T>(&mut self, root: Level, f: impl FnOnce(&mut Self) -> CResult<T>) -> CResult<(T, Vec<Stmt>)> {
        let saved_buf = mem::take(&mut self.buf);
        let saved_levels = mem::replace(&mut self.levels, vec![root]);
        let out = f(self);
        let body = mem::replace(&mut self.buf, saved_buf).finish(self.options.optimize, self.options.comments);
        self.levels = saved_levels;
        Ok((out?, body))
    }

    /// No rows; vacuously node-structured when that is what the caller wants.
    fn empty(&mut self, want: Interface) -> Quad {
        let e = self.emit("empty", Expr::empty());
        let iface = if want == Interface::NodeStructured { want } else { Interface::Generic };
        Columns { iter: e.clone(), pos: e.clone(), item: e.clone(), kind: e }.into_quad(iface)
    }

    fn literal(&mut self, k: Kind, raw: Atom, want: Interface) -> Quad {
        let lp = self.level().loop_.clone();
        if want == Interface::Typed(k) {
            let values = self.emit("lit", Expr::project(Expr::Const(raw), var(&lp)));
            return Quad::typed(lp, None, values, k);
        }
        let item = match (k.container(), &raw) {
            (Some(c), _) => Atom::Oid(self.literals.intern(c, raw)),
            (None, Atom::Bit(b)) => Atom::Oid(u64::from(*b)),
            (None, other) => other.clone(),
        };
        let pos = self.emit("pos", Expr::project(Expr::int(1), var(&lp)));
        let item = self.emit("item", Expr::project(Expr::Const(item), var(&lp)));
        let kind = self.emit("kind", Expr::project(Expr::Const(k.atom()), var(&lp)));
        Columns { iter: lp, pos, item, kind }.into_quad(Interface::Generic)
    }

    /// Translate `n` for the current level. `want` is a hint: the result
    /// reports the interface it was actually produced in.
    pub(super) fn translate(&mut self, n: NodeId, want: Interface) -> CResult<Quad> {
        let tree = self.tree;
        trace!(node = n.index(), kind = tree.kind(n).name(), ?want, "translate");
        match tree.kind(n) {
            CoreKind::Empty => Ok(self.empty(want)),
            CoreKind::Int(i) => Ok(self.literal(Kind::Int, Atom::Int(*i), want)),
            CoreKind::Dec(d) => Ok(self.literal(Kind::Dec, Atom::Dbl(*d), want)),
            CoreKind::Dbl(d) => Ok(self.literal(Kind::Dbl, Atom::Dbl(*d), want)),
            CoreKind::Str(s) => Ok(self.literal(Kind::Str, Atom::Str(s.clone()), want)),
            CoreKind::True => Ok(self.literal(Kind::Bool, Atom::Bit(true), want)),
            CoreKind::False => Ok(self.literal(Kind::Bool, Atom::Bit(false), want)),
            CoreKind::Tag(q) => Ok(self.literal(Kind::QName, Atom::str(&q.clark()), want)),
            CoreKind::Var(v) => self.lookup_var(*v),
            CoreKind::Seq(a, b) => self.translate_seq(*a, *b),
            CoreKind::For { var, pos, input, body } => self.translate_for(n, *var, *pos, *input, *body),
            CoreKind::Let { var, bound, body } => self.translate_let(*var, *bound, *body, want),
            CoreKind::OrderBy { .. } => Err(Error::malformed("order by outside of a for body")),
            CoreKind::If { cond, then, otherwise } => self.translate_if(*cond, *then, *otherwise),
            CoreKind::Typeswitch { input, case, then, otherwise } => {
                self.translate_typeswitch(*input, *case, *then, *otherwise)
            }
            CoreKind::Step { axis, test, context } => self.translate_step(*axis, test, *context),
            CoreKind::Root => Ok(self.translate_root()),
            CoreKind::Elem { tag, content } => self.translate_elem(*tag, *content),
            CoreKind::Attr { tag, content } => self.translate_attr(*tag, *content),
            CoreKind::Text(content) => self.translate_text(*content),
            CoreKind::Cast { target, input } => self.translate_cast(*target, *input),
            CoreKind::Apply { fun: FunRef::Builtin(b), args } => self.translate_builtin(n, *b, args, want),
            CoreKind::Apply { fun: FunRef::User(f), args } => self.translate_call(*f, args),
            CoreKind::Join(j) => self.translate_join(n, j),
        }
    }

    fn prologue(&self) -> Vec<Stmt> {
        let mut out = Vec::new();
        for c in Container::ALL {
            let values = &self.literals.values[c.index()];
            if !values.is_empty() {
                out.push(Stmt::Exec(Expr::Intern { container: c, values: Box::new(Expr::Column(values.clone())) }));
            }
        }
        let usage = self.vars.usage_pairs();
        out.push(Stmt::assign("vu_fid", Expr::Column(usage.iter().map(|(f, _)| Atom::Int(i64::from(f.0))).collect())));
        out.push(Stmt::assign("vu_vid", Expr::Column(usage.iter().map(|(_, v)| Atom::Int(i64::from(*v))).collect())));

        let root = Level::root(LevelKind::Loop(ScopeId(0)), BTreeSet::new());
        out.push(Stmt::Assign(root.loop_.clone(), Expr::Column(vec![Atom::Oid(1)])));
        out.push(Stmt::Assign(root.outer.clone(), var(&root.loop_)));
        out.push(Stmt::Assign(root.inner.clone(), var(&root.loop_)));
        for c in root.env.columns() {
            out.push(Stmt::Assign(c.clone(), Expr::empty()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CompileContext;
    use crate::core::CoreBuilder;

    fn compile(tree: &CoreTree) -> MilProgram {
        let opts = CompileOptions::builder().comments(false).build();
        let mut ctx = CompileContext::new(opts.clone());
        let vars = VarTable::build(tree, &mut ctx).unwrap();
        translate(tree, &vars, &opts).unwrap()
    }

    #[test]
    fn literals_are_interned_once() {
        let mut b = CoreBuilder::new();
        let q = b.int_seq(&[7, 7, 8]);
        let tree = b.finish(q);
        let p = compile(&tree);
        let interns: Vec<_> = p
            .prologue
            .iter()
            .filter_map(|s| match s {
                Stmt::Exec(Expr::Intern { container: Container::Int, values }) => Some((**values).clone()),
                _ => None,
            })
            .collect();
        assert_eq!(interns, vec![Expr::Column(vec![Atom::Int(7), Atom::Int(8)])]);
    }

    #[test]
    fn result_printer_follows_the_option() {
        let mut b = CoreBuilder::new();
        let q = b.int(1);
        let tree = b.finish(q);
        let opts = CompileOptions::builder().serialize_result(false).build();
        let mut ctx = CompileContext::new(opts.clone());
        let vars = VarTable::build(&tree, &mut ctx).unwrap();
        assert!(translate(&tree, &vars, &opts).unwrap().epilogue.is_empty());
        assert_eq!(compile(&tree).epilogue.len(), 1);
    }

    #[test]
    fn order_by_needs_a_loop() {
        let mut b = CoreBuilder::new();
        let key = b.int(1);
        let body = b.int(2);
        let q = b.order_by(key, false, body);
        let tree = b.finish(q);
        let opts = CompileOptions::default();
        let mut ctx = CompileContext::new(opts.clone());
        let vars = VarTable::build(&tree, &mut ctx).unwrap();
        let err = translate(&tree, &vars, &opts).unwrap_err();
        assert_eq!(err.code, ErrorCode::PFIN0002);
    }
}
