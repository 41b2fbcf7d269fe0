//! Join recognition.
//!
//! Rewrites `for $v in E return if (cmp(A, B)) then R else ()` into a
//! [`JoinNode`] when exactly one of `A`, `B` depends on `$v` and the other
//! only on variables bound outside the loop. The quantified form
//! `some $z in Z satisfies cmp(A, B)` as the condition is collapsed first:
//! the operand that is `$z` is replaced by `Z` and marked as nested.
//!
//! Levels count exactly like the variable table and the translator: a `for`
//! body (and a join's operand/continuation) is one level below the loop,
//! and so is each conditional branch.
use std::collections::HashMap;

use tracing::{debug, debug_span, trace};

use crate::core::{
    AtomicType, Builtin, Comparison, CoreKind, CoreTree, FunRef, JoinNode, JoinOperand, NodeId, OperandExpr, VarId,
};
use crate::runtime::Error;

/// Recognize joins in the query body, global initializers and function
/// bodies. Returns the number of join nodes introduced.
pub fn recognize_joins(tree: &mut CoreTree) -> Result<usize, Error> {
    let _span = debug_span!("recognize_joins").entered();
    let mut r = Recognizer { tree, levels: HashMap::new(), joins: 0 };

    for i in 0..r.tree.globals.len() {
        let init = r.tree.globals[i].init;
        let new = r.rewrite(init, 0)?;
        r.tree.globals[i].init = new;
    }
    for i in 0..r.tree.functions.len() {
        let Some(body) = r.tree.functions[i].body else { continue };
        r.levels.clear();
        for p in r.tree.functions[i].params.clone() {
            r.levels.insert(p, 0);
        }
        let new = r.rewrite(body, 0)?;
        r.tree.functions[i].body = Some(new);
    }
    r.levels.clear();
    let q = r.tree.query()?;
    let new = r.rewrite(q, 0)?;
    r.tree.query = Some(new);

    debug!(joins = r.joins, "join recognition finished");
    Ok(r.joins)
}

struct Recognizer<'t> {
    tree: &'t mut CoreTree,
    /// Nesting level each local variable is bound at; globals are level 0.
    levels: HashMap<VarId, u32>,
    joins: usize,
}

/// A matched comparison before the independence checks.
struct Candidate {
    cmp: Comparison,
    operands: [NodeId; 2],
    /// Static operand types of the comparison as written.
    domains: [Option<AtomicType>; 2],
    /// Which operand was collapsed out of a quantifier.
    nested: [bool; 2],
    ret: NodeId,
}

impl Recognizer<'_> {
    fn rewrite(&mut self, id: NodeId, level: u32) -> Result<NodeId, Error> {
        let kind = self.tree.kind(id).clone();
        let new_kind = match &kind {
            CoreKind::For { var, pos, input, body } => {
                let input = self.rewrite(*input, level)?;
                self.levels.insert(*var, level + 1);
                if let Some(p) = pos {
                    self.levels.insert(*p, level + 1);
                }
                if let Some(join) = self.try_join(id, *var, *pos, input, *body, level)? {
                    return Ok(join);
                }
                let body = self.rewrite(*body, level + 1)?;
                CoreKind::For { var: *var, pos: *pos, input, body }
            }
            CoreKind::Let { var, bound, body } => {
                let bound = self.rewrite(*bound, level)?;
                self.levels.insert(*var, level);
                let body = self.rewrite(*body, level)?;
                CoreKind::Let { var: *var, bound, body }
            }
            CoreKind::If { cond, then, otherwise } => CoreKind::If {
                cond: self.rewrite(*cond, level)?,
                then: self.rewrite(*then, level + 1)?,
                otherwise: self.rewrite(*otherwise, level + 1)?,
            },
            CoreKind::Typeswitch { input, case, then, otherwise } => CoreKind::Typeswitch {
                input: self.rewrite(*input, level)?,
                case: *case,
                then: self.rewrite(*then, level + 1)?,
                otherwise: self.rewrite(*otherwise, level + 1)?,
            },
            CoreKind::Join(j) => {
                let mut j = (**j).clone();
                j.input = self.rewrite(j.input, level)?;
                self.levels.insert(j.var, level + 1);
                if let Some(p) = j.pos {
                    self.levels.insert(p, level + 1);
                }
                if let OperandExpr::Expr(e) = j.fst.expr {
                    j.fst.expr = OperandExpr::Expr(self.rewrite(e, level + 1)?);
                }
                j.ret = self.rewrite(j.ret, level + 1)?;
                CoreKind::Join(Box::new(j))
            }
            other => other.map_children(|c| self.rewrite(c, level))?,
        };
        Ok(if new_kind == kind { id } else { self.tree.replace(id, new_kind) })
    }

    /// The comparison `cmp(A, B)` of a filter condition, if it has one of
    /// the recognized shapes.
    fn comparison(&self, cond: NodeId) -> Option<(Comparison, NodeId, NodeId)> {
        match self.tree.kind(cond) {
            CoreKind::Apply { fun: FunRef::Builtin(b), args } if args.len() == 2 => {
                b.comparison().map(|c| (c, args[0], args[1]))
            }
            _ => None,
        }
    }

    /// `exists(Q)` or `not(empty(Q))`.
    fn existential(&self, cond: NodeId) -> Option<NodeId> {
        let one_arg = |id: NodeId, f: Builtin| match self.tree.kind(id) {
            CoreKind::Apply { fun: FunRef::Builtin(b), args } if *b == f && args.len() == 1 => Some(args[0]),
            _ => None,
        };
        one_arg(cond, Builtin::Exists).or_else(|| one_arg(cond, Builtin::Not).and_then(|e| one_arg(e, Builtin::Empty)))
    }

    fn domain(&self, id: NodeId) -> Option<AtomicType> {
        self.tree.ty(id).item().and_then(|i| i.atomized().atomic())
    }

    fn match_pattern(&self, body: NodeId) -> Option<Candidate> {
        let CoreKind::If { cond, then: ret, otherwise } = self.tree.kind(body) else { return None };
        if *self.tree.kind(*otherwise) != CoreKind::Empty {
            return None;
        }
        if let Some((cmp, a, b)) = self.comparison(*cond) {
            return Some(Candidate {
                cmp,
                operands: [a, b],
                domains: [self.domain(a), self.domain(b)],
                nested: [false, false],
                ret: *ret,
            });
        }

        // some $z in Z satisfies cmp(A, B)
        let q = self.existential(*cond)?;
        let CoreKind::For { var: z, pos: zpos, input: zin, body: zbody } = self.tree.kind(q) else { return None };
        if zpos.is_some_and(|p| self.tree.uses_var(*zbody, p)) {
            return None;
        }
        let CoreKind::If { cond: zcond, then: lit, otherwise: zelse } = self.tree.kind(*zbody) else { return None };
        if !self.tree.kind(*lit).is_literal() || *self.tree.kind(*zelse) != CoreKind::Empty {
            return None;
        }
        let (cmp, a, b) = self.comparison(*zcond)?;
        let is_z = |id: NodeId| matches!(self.tree.kind(self.strip(id, None)), CoreKind::Var(v) if v == z);
        let (operands, nested) = match (is_z(a), is_z(b)) {
            (true, false) if !self.tree.uses_var(b, *z) => ([*zin, b], [true, false]),
            (false, true) if !self.tree.uses_var(a, *z) => ([a, *zin], [false, true]),
            _ => return None,
        };
        Some(Candidate { cmp, operands, domains: [self.domain(a), self.domain(b)], nested, ret: *ret })
    }

    /// Drop atomization and casts to the comparison domain; the join casts
    /// both sides itself.
    fn strip(&self, mut id: NodeId, domain: Option<AtomicType>) -> NodeId {
        loop {
            match self.tree.kind(id) {
                CoreKind::Cast { target, input } if domain.is_none() || target.uniform_atomic() == domain => {
                    id = *input;
                }
                CoreKind::Apply { fun: FunRef::Builtin(Builtin::Data | Builtin::TypedValue), args } if args.len() == 1 => {
                    id = args[0];
                }
                _ => return id,
            }
        }
    }

    fn refs_loop(&self, id: NodeId, var: VarId, pos: Option<VarId>) -> bool {
        self.tree.uses_var(id, var) || pos.is_some_and(|p| self.tree.uses_var(id, p))
    }

    /// Deepest level of a free variable of `id`, ignoring `skip`.
    fn free_level(&self, id: NodeId, skip: &[VarId]) -> Option<u32> {
        self.tree
            .free_vars(id)
            .into_iter()
            .filter(|v| !skip.contains(v))
            .map(|v| self.levels.get(&v).copied().unwrap_or(0))
            .max()
    }

    fn contains_join(&self, id: NodeId) -> bool {
        let mut found = false;
        self.tree.walk(id, &mut |_, k| found |= matches!(k, CoreKind::Join(_)));
        found
    }

    fn try_join(
        &mut self,
        id: NodeId,
        var: VarId,
        pos: Option<VarId>,
        input: NodeId,
        body: NodeId,
        level: u32,
    ) -> Result<Option<NodeId>, Error> {
        let Some(c) = self.match_pattern(body) else { return Ok(None) };
        let [a, b] = c.operands;
        let (fst_side, switched) = match (self.refs_loop(a, var, pos), self.refs_loop(b, var, pos)) {
            (true, false) => (0, false),
            (false, true) => (1, true),
            // Comparisons independent of the loop stay nested loops.
            _ => return Ok(None),
        };
        let snd_side = 1 - fst_side;
        let (Some(da), Some(db)) = (c.domains[0], c.domains[1]) else { return Ok(None) };
        let Some(common) = da.comparison_domain(db) else { return Ok(None) };

        let fst = self.strip(c.operands[fst_side], Some(common));
        let snd = self.strip(c.operands[snd_side], Some(common));
        let snd_level = self.free_level(snd, &[]);
        let Some(d) = snd_level else {
            trace!(level, "constant filter operand, no join");
            return Ok(None);
        };
        if d > level || self.tree.contains_constructor(snd) || self.contains_join(snd) {
            return Ok(None);
        }

        let fst_expr = if matches!(self.tree.kind(fst), CoreKind::Var(v) if *v == var) {
            OperandExpr::BoundInput
        } else {
            OperandExpr::Expr(self.rewrite(fst, level + 1)?)
        };
        let skip: Vec<VarId> = std::iter::once(var).chain(pos).collect();
        let fst_level = self.free_level(fst, &skip);
        let ret = self.rewrite(c.ret, level + 1)?;

        let join = JoinNode {
            var,
            pos,
            input,
            fst: JoinOperand { expr: fst_expr, cast: Some(common), level: fst_level, nested: c.nested[fst_side] },
            snd: JoinOperand { expr: OperandExpr::Expr(snd), cast: Some(common), level: Some(d), nested: c.nested[snd_side] },
            cmp: c.cmp,
            switched,
            ret,
        };
        debug!(var = var.index(), level, snd_level = d, cmp = %c.cmp, switched, "join recognized");
        self.joins += 1;
        Ok(Some(self.tree.replace(id, CoreKind::Join(Box::new(join)))))
    }
}
