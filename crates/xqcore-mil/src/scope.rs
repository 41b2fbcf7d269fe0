//! Variable table and expansion analysis.
//!
//! One walk over the (join-rewritten) tree assigns every variable a numeric
//! id ("vid"), the scope it is defined in and a use count, and records for
//! every scope which enclosing variables have to be expanded into it. The
//! walk pushes exactly the levels the translator pushes (a loop level per
//! `for` body or join, a branch level per conditional branch), so both agree
//! on level numbers.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, trace};

use crate::context::{CompileContext, ScopeId};
use crate::core::{CoreKind, CoreTree, FunId, FunRef, NodeId, OperandExpr, VarId};
use crate::runtime::{Error, ErrorCode};

/// One nesting level as seen by both the variable walk and the translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelKind {
    Loop(ScopeId),
    /// A conditional branch: same iterations as its parent, narrowed.
    Branch,
}

/// Level at which the independent side of a join is evaluated: the level
/// `d` of its deepest free variable, but never outside the innermost
/// enclosing conditional branch.
pub fn hoist_level(levels: &[LevelKind], d: usize) -> usize {
    let branch = levels.iter().rposition(|l| *l == LevelKind::Branch).unwrap_or(0);
    d.max(branch)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarInfo {
    pub vid: u32,
    /// Scope the variable is defined in.
    pub base: ScopeId,
    pub uses: u32,
}

#[derive(Debug, Default)]
pub struct VarTable {
    vars: HashMap<VarId, VarInfo>,
    usage: BTreeMap<ScopeId, BTreeSet<u32>>,
    scopes: HashMap<NodeId, ScopeId>,
    function_scopes: HashMap<FunId, ScopeId>,
    function_globals: HashMap<FunId, Vec<VarId>>,
    global_order: Vec<usize>,
}

impl VarTable {
    /// Build the table for the whole program (global initializers, user
    /// functions and the query body).
    pub fn build(tree: &CoreTree, ctx: &mut CompileContext) -> Result<VarTable, Error> {
        let function_globals = thread_globals(tree)?;
        let global_order = order_globals(tree, &function_globals)?;
        let mut table = VarTable { function_globals, global_order, ..VarTable::default() };
        let mut walk = Walk { tree, ctx, table: &mut table, frames: Vec::new(), in_function: false };

        walk.frames = vec![LevelKind::Loop(ScopeId(0))];
        for g in &tree.globals {
            walk.visit(g.init)?;
            walk.global(g.var);
        }
        for (i, f) in tree.functions.iter().enumerate() {
            let Some(body) = f.body else { continue };
            let fid = walk.ctx.fresh_function_scope();
            let id = FunId(i as u32);
            walk.table.function_scopes.insert(id, fid);
            walk.frames = vec![LevelKind::Loop(fid)];
            walk.in_function = true;
            for p in &f.params {
                walk.define(*p, fid);
            }
            walk.visit(body)?;
        }
        walk.frames = vec![LevelKind::Loop(ScopeId(0))];
        walk.in_function = false;
        walk.visit(tree.query()?)?;

        debug!(vars = table.vars.len(), scopes = table.scopes.len(), "variable table built");
        Ok(table)
    }

    pub fn info(&self, var: VarId) -> Result<VarInfo, Error> {
        self.vars
            .get(&var)
            .copied()
            .ok_or_else(|| Error::internal(format!("variable #{} has no table entry", var.index())))
    }

    pub fn vid(&self, var: VarId) -> Result<u32, Error> {
        Ok(self.info(var)?.vid)
    }

    /// A variable nobody reads need not be materialized.
    pub fn is_used(&self, var: VarId) -> bool {
        self.vars.get(&var).is_some_and(|v| v.uses > 0)
    }

    /// Scope introduced by a `for` or join node.
    pub fn scope_of(&self, node: NodeId) -> Result<ScopeId, Error> {
        self.scopes
            .get(&node)
            .copied()
            .ok_or_else(|| Error::internal(format!("node #{} introduces no scope", node.index())))
    }

    pub fn function_scope(&self, f: FunId) -> Result<ScopeId, Error> {
        self.function_scopes
            .get(&f)
            .copied()
            .ok_or_else(|| Error::internal(format!("function #{} has no scope", f.index())))
    }

    /// Vids replicated from the enclosing level into scope `fid`.
    pub fn expansion(&self, fid: ScopeId) -> Vec<u32> {
        self.usage.get(&fid).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    /// Global variables a function reads directly or through its callees.
    pub fn function_globals(&self, f: FunId) -> &[VarId] {
        self.function_globals.get(&f).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Indices into `tree.globals`, each after every global its
    /// initializer reads directly or through the functions it calls.
    pub fn global_order(&self) -> &[usize] {
        &self.global_order
    }

    /// `(fid, vid)` pairs of the whole usage table, in scope order.
    pub fn usage_pairs(&self) -> Vec<(ScopeId, u32)> {
        self.usage.iter().flat_map(|(f, vids)| vids.iter().map(move |v| (*f, *v))).collect()
    }
}

struct Walk<'t, 'c> {
    tree: &'t CoreTree,
    ctx: &'c mut CompileContext,
    table: &'c mut VarTable,
    frames: Vec<LevelKind>,
    in_function: bool,
}

impl Walk<'_, '_> {
    /// Loops inside function bodies number above the function's own scope.
    fn fresh_scope(&mut self) -> ScopeId {
        if self.in_function { self.ctx.fresh_function_scope() } else { self.ctx.fresh_scope() }
    }

    fn innermost_scope(&self) -> ScopeId {
        self.frames
            .iter()
            .rev()
            .find_map(|f| match f {
                LevelKind::Loop(fid) => Some(*fid),
                LevelKind::Branch => None,
            })
            .unwrap_or(ScopeId(0))
    }

    fn define(&mut self, var: VarId, base: ScopeId) {
        let vid = self.ctx.fresh_vid();
        trace!(var = var.index(), vid, fid = base.0, "define");
        self.table.vars.insert(var, VarInfo { vid, base, uses: 0 });
    }

    /// Globals get their vid at first sight, which may be a forward reference.
    fn global(&mut self, var: VarId) -> VarInfo {
        if let Some(info) = self.table.vars.get(&var) {
            return *info;
        }
        let vid = self.ctx.fresh_vid();
        let info = VarInfo { vid, base: ScopeId(0), uses: 0 };
        self.table.vars.insert(var, info);
        info
    }

    fn use_var(&mut self, var: VarId) -> Result<(), Error> {
        let info = if self.tree.var(var).global {
            self.global(var)
        } else {
            *self.table.vars.get(&var).ok_or_else(|| {
                Error::from_code(
                    ErrorCode::PFIN0001,
                    format!("${} is referenced outside of its scope", self.tree.var(var).name),
                )
            })?
        };
        if let Some(v) = self.table.vars.get_mut(&var) {
            v.uses += 1;
        }
        self.expand(info);
        Ok(())
    }

    /// Record `info.vid` in every loop scope between its definition and the use.
    fn expand(&mut self, info: VarInfo) {
        for frame in self.frames.iter().skip(1).rev() {
            match frame {
                LevelKind::Branch => continue,
                LevelKind::Loop(fid) if *fid > info.base => {
                    self.table.usage.entry(*fid).or_default().insert(info.vid);
                }
                LevelKind::Loop(_) => break,
            }
        }
    }

    fn nested<T>(&mut self, level: LevelKind, f: impl FnOnce(&mut Self) -> Result<T, Error>) -> Result<T, Error> {
        self.frames.push(level);
        let out = f(self);
        self.frames.pop();
        out
    }

    fn visit(&mut self, id: NodeId) -> Result<(), Error> {
        let tree = self.tree;
        match tree.kind(id) {
            CoreKind::Var(v) => self.use_var(*v)?,
            CoreKind::For { var, pos, input, body } => {
                self.visit(*input)?;
                let fid = self.fresh_scope();
                self.table.scopes.insert(id, fid);
                self.nested(LevelKind::Loop(fid), |w| {
                    w.define(*var, fid);
                    if let Some(p) = pos {
                        w.define(*p, fid);
                    }
                    w.visit(*body)
                })?;
            }
            CoreKind::Let { var, bound, body } => {
                self.visit(*bound)?;
                let base = self.innermost_scope();
                self.define(*var, base);
                self.visit(*body)?;
            }
            CoreKind::If { cond: test, then, otherwise } | CoreKind::Typeswitch { input: test, then, otherwise, .. } => {
                self.visit(*test)?;
                self.nested(LevelKind::Branch, |w| w.visit(*then))?;
                self.nested(LevelKind::Branch, |w| w.visit(*otherwise))?;
            }
            CoreKind::Join(j) => {
                self.visit(j.input)?;
                let fid = self.fresh_scope();
                self.table.scopes.insert(id, fid);
                if let OperandExpr::Expr(snd) = j.snd.expr {
                    let d = j.snd.level.ok_or_else(|| {
                        Error::from_code(ErrorCode::PFIN0003, "join operand has no independent level")
                    })? as usize;
                    if d >= self.frames.len() {
                        return Err(Error::from_code(
                            ErrorCode::PFIN0003,
                            format!("join operand level {d} is not below the loop level {}", self.frames.len()),
                        ));
                    }
                    let h = hoist_level(&self.frames, d);
                    let saved = self.frames.split_off(h + 1);
                    let out = self.visit(snd);
                    self.frames.extend(saved);
                    out?;
                }
                self.nested(LevelKind::Loop(fid), |w| {
                    w.define(j.var, fid);
                    if let Some(p) = j.pos {
                        w.define(p, fid);
                    }
                    if let OperandExpr::Expr(fst) = j.fst.expr {
                        w.visit(fst)?;
                    }
                    w.visit(j.ret)
                })?;
            }
            CoreKind::Apply { fun: FunRef::User(f), args } => {
                for a in args {
                    self.visit(*a)?;
                }
                let globals = self.table.function_globals.get(f).cloned().unwrap_or_default();
                for g in globals {
                    let info = self.global(g);
                    if let Some(v) = self.table.vars.get_mut(&g) {
                        v.uses += 1;
                    }
                    self.expand(info);
                }
            }
            other => {
                for c in other.children() {
                    self.visit(c)?;
                }
            }
        }
        Ok(())
    }
}

/// Direct global reads and callees of one function body.
fn direct_refs(tree: &CoreTree, body: NodeId) -> (BTreeSet<VarId>, Vec<FunId>) {
    let mut globals = BTreeSet::new();
    let mut callees = Vec::new();
    tree.walk(body, &mut |_, k| match k {
        CoreKind::Var(v) if tree.var(*v).global => {
            globals.insert(*v);
        }
        CoreKind::Apply { fun: FunRef::User(f), .. } if !callees.contains(f) => callees.push(*f),
        _ => {}
    });
    (globals, callees)
}

/// Globals each function needs packed into its call frame, closed over the
/// call graph. Functions on the active stack are not re-entered; a fixpoint
/// pass then settles the members of recursive cycles.
fn thread_globals(tree: &CoreTree) -> Result<HashMap<FunId, Vec<VarId>>, Error> {
    fn visit(
        tree: &CoreTree,
        f: FunId,
        active: &mut Vec<FunId>,
        refs: &mut HashMap<FunId, (BTreeSet<VarId>, Vec<FunId>)>,
    ) -> Result<(), Error> {
        if active.contains(&f) || refs.contains_key(&f) {
            return Ok(());
        }
        let Some(body) = tree.function(f)?.body else {
            refs.insert(f, (BTreeSet::new(), Vec::new()));
            return Ok(());
        };
        active.push(f);
        let (mut globals, callees) = direct_refs(tree, body);
        for c in &callees {
            visit(tree, *c, active, refs)?;
            if let Some((g, _)) = refs.get(c) {
                globals.extend(g.iter().copied());
            }
        }
        active.pop();
        refs.insert(f, (globals, callees));
        Ok(())
    }

    let mut refs = HashMap::new();
    let mut active = Vec::new();
    for i in 0..tree.functions.len() {
        visit(tree, FunId(i as u32), &mut active, &mut refs)?;
    }
    loop {
        let mut changed = false;
        let ids: Vec<FunId> = refs.keys().copied().collect();
        for f in ids {
            let callees = refs.get(&f).map(|(_, c)| c.clone()).unwrap_or_default();
            let mut extra: HashSet<VarId> = HashSet::new();
            for c in callees {
                if let Some((g, _)) = refs.get(&c) {
                    extra.extend(g.iter().copied());
                }
            }
            if let Some((g, _)) = refs.get_mut(&f) {
                for v in extra {
                    changed |= g.insert(v);
                }
            }
        }
        if !changed {
            break;
        }
    }
    Ok(refs.into_iter().map(|(f, (g, _))| (f, g.into_iter().collect())).collect())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Fresh,
    Active,
    Done,
}

/// Depth-first order of the global declarations over their read
/// dependencies; declaration order where there are none. A global that
/// reaches itself is a circular definition.
fn order_globals(tree: &CoreTree, function_globals: &HashMap<FunId, Vec<VarId>>) -> Result<Vec<usize>, Error> {
    fn visit(
        tree: &CoreTree,
        i: usize,
        deps: &[Vec<usize>],
        marks: &mut [Mark],
        order: &mut Vec<usize>,
    ) -> Result<(), Error> {
        match marks[i] {
            Mark::Done => return Ok(()),
            Mark::Active => {
                let name = &tree.var(tree.globals[i].var).name;
                return Err(Error::from_code(ErrorCode::XQST0054, format!("${name} depends on its own value")));
            }
            Mark::Fresh => {}
        }
        marks[i] = Mark::Active;
        for d in &deps[i] {
            visit(tree, *d, deps, marks, order)?;
        }
        marks[i] = Mark::Done;
        order.push(i);
        Ok(())
    }

    let index: HashMap<VarId, usize> = tree.globals.iter().enumerate().map(|(i, g)| (g.var, i)).collect();
    let deps: Vec<Vec<usize>> = tree
        .globals
        .iter()
        .map(|g| {
            let (mut reads, callees) = direct_refs(tree, g.init);
            for f in callees {
                reads.extend(function_globals.get(&f).into_iter().flatten().copied());
            }
            reads.iter().filter_map(|v| index.get(v).copied()).collect()
        })
        .collect();
    let mut marks = vec![Mark::Fresh; deps.len()];
    let mut order = Vec::with_capacity(deps.len());
    for i in 0..deps.len() {
        visit(tree, i, &deps, &mut marks, &mut order)?;
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CompileOptions;
    use crate::core::{Builtin, CoreBuilder, SeqType};

    #[test]
    fn outer_variable_is_expanded_into_the_inner_loop_only() {
        // for $x in (1,2) return for $y in (3,4) return $x
        let mut b = CoreBuilder::new();
        let d1 = b.int_seq(&[1, 2]);
        let d2 = b.int_seq(&[3, 4]);
        let x = b.for_var("x", d1);
        let y = b.for_var("y", d2);
        let xr = b.var(x);
        let inner = b.for_in(y, None, d2, xr);
        let outer = b.for_in(x, None, d1, inner);
        let tree = b.finish(outer);

        let mut ctx = CompileContext::new(CompileOptions::default());
        let table = VarTable::build(&tree, &mut ctx).unwrap();
        let fx = table.scope_of(outer).unwrap();
        let fy = table.scope_of(inner).unwrap();
        assert!(fy > fx);
        assert_eq!(table.expansion(fy), vec![table.vid(x).unwrap()]);
        assert!(table.expansion(fx).is_empty());
        assert!(table.is_used(x));
        assert!(!table.is_used(y));
    }

    #[test]
    fn function_globals_follow_the_call_graph() {
        let mut b = CoreBuilder::new();
        let g = b.global_var("g", SeqType::integer());
        let one = b.int(1);
        b.define_global(g, one);
        let (leaf, _) = b.declare_function("leaf", &[], SeqType::integer());
        let gr = b.var(g);
        b.define_function(leaf, gr);
        let (caller, _) = b.declare_function("caller", &[], SeqType::integer());
        let call = b.call_user(leaf, &[]);
        b.define_function(caller, call);
        let q = b.call_user(caller, &[]);
        let tree = b.finish(q);

        let mut ctx = CompileContext::new(CompileOptions::default());
        let table = VarTable::build(&tree, &mut ctx).unwrap();
        assert_eq!(table.function_globals(caller), &[g]);
        assert!(table.function_scope(leaf).unwrap().0 > crate::context::FUNCTION_SCOPE_BASE);
    }

    #[test]
    fn hoisting_stops_at_the_innermost_branch() {
        let levels = [LevelKind::Loop(ScopeId(0)), LevelKind::Loop(ScopeId(1)), LevelKind::Branch];
        assert_eq!(hoist_level(&levels, 0), 2);
        let levels = [LevelKind::Loop(ScopeId(0)), LevelKind::Branch, LevelKind::Loop(ScopeId(3))];
        assert_eq!(hoist_level(&levels, 0), 1);
        assert_eq!(hoist_level(&levels, 2), 2);
    }

    #[test]
    fn unknown_local_is_an_internal_error() {
        let mut b = CoreBuilder::new();
        let one = b.int(1);
        let stray = b.let_var("stray", one);
        let r = b.var(stray);
        let body = b.call(Builtin::Count, &[r]);
        let tree = b.finish(body);
        let mut ctx = CompileContext::new(CompileOptions::default());
        let err = VarTable::build(&tree, &mut ctx).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn globals_are_ordered_by_what_they_read() {
        // declare variable $a := local:f(); declare function local:f() { $b };
        // declare variable $b := 5; declare variable $c := $c;
        let mut b = CoreBuilder::new();
        let (f, _) = b.declare_function("f", &[], SeqType::integer());
        let a = b.global_var("a", SeqType::integer());
        let gb = b.global_var("b", SeqType::integer());
        let call = b.call_user(f, &[]);
        b.define_global(a, call);
        let br = b.var(gb);
        b.define_function(f, br);
        let five = b.int(5);
        b.define_global(gb, five);
        let q = b.var(a);
        let tree = b.finish(q);
        let mut ctx = CompileContext::new(CompileOptions::default());
        assert_eq!(VarTable::build(&tree, &mut ctx).unwrap().global_order(), &[1, 0]);

        let mut b = CoreBuilder::new();
        let c = b.global_var("c", SeqType::integer());
        let cr = b.var(c);
        b.define_global(c, cr);
        let q = b.var(c);
        let tree = b.finish(q);
        let mut ctx = CompileContext::new(CompileOptions::default());
        let err = VarTable::build(&tree, &mut ctx).unwrap_err();
        assert_eq!(err.code, ErrorCode::XQST0054);
        assert!(!err.is_internal());
    }
}
