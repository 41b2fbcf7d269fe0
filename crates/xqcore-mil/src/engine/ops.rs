//! Column algebra and working-set operations.
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use compact_str::CompactString;
use itertools::Itertools;

use super::store::{NodeKind, NodeRef};
use super::value::{self, AtomKey, Column, Value, sort_order};
use super::{ExecError, Frame, Item, Machine, serialize};
use crate::core::{ItemType, NodeType, SeqType};
use crate::mil::{AggrFn, Atom, BinOp, Container, Expr, Extern, Kind};
use crate::runtime::ErrorCode;

fn oid(i: usize) -> Atom {
    Atom::Oid(i as u64)
}

fn position(a: &Atom) -> Result<Option<usize>, ExecError> {
    match a {
        Atom::Oid(o) => Ok(Some(*o as usize)),
        Atom::Nil => Ok(None),
        other => Err(ExecError::internal(format!("position {other:?} is not an oid"))),
    }
}

fn first_index(keys: &[Atom]) -> HashMap<AtomKey, usize> {
    let mut idx = HashMap::with_capacity(keys.len());
    for (i, k) in keys.iter().enumerate() {
        if !k.is_nil() {
            idx.entry(AtomKey::from(k)).or_insert(i);
        }
    }
    idx
}

fn key_set(set: &[Atom]) -> HashSet<AtomKey> {
    set.iter().map(AtomKey::from).collect()
}

fn is_true(a: &Atom) -> bool {
    matches!(a, Atom::Bit(true))
}

/// Rows grouped by consecutive equal keys, as `(key, range)`.
fn runs(keys: &[Atom]) -> Vec<(Atom, std::ops::Range<usize>)> {
    let mut out: Vec<(Atom, std::ops::Range<usize>)> = Vec::new();
    for (i, k) in keys.iter().enumerate() {
        match out.last_mut() {
            Some((prev, r)) if AtomKey::from(&*prev) == AtomKey::from(k) => r.end = i + 1,
            _ => out.push((k.clone(), i..i + 1)),
        }
    }
    out
}

fn aggregate(f: AggrFn, vals: &[&Atom]) -> Result<Atom, ExecError> {
    let vals: Vec<&Atom> = vals.iter().copied().filter(|a| !a.is_nil()).collect();
    Ok(match f {
        AggrFn::Count => Atom::Int(vals.len() as i64),
        AggrFn::Sum => {
            let mut acc = Atom::Int(0);
            for v in &vals {
                acc = value::binary(BinOp::Add, &acc, v)?;
            }
            acc
        }
        AggrFn::Avg => {
            if vals.is_empty() {
                return Ok(Atom::Nil);
            }
            let mut acc = Atom::Dbl(0.0);
            for v in &vals {
                acc = value::binary(BinOp::Add, &acc, v)?;
            }
            value::binary(BinOp::Div, &acc, &Atom::Int(vals.len() as i64))?
        }
        AggrFn::Min | AggrFn::Max => {
            let mut best: Option<&Atom> = None;
            for v in &vals {
                if matches!(v, Atom::Dbl(d) if d.is_nan()) {
                    return Ok(Atom::Dbl(f64::NAN));
                }
                best = match best {
                    None => Some(v),
                    Some(b) => {
                        let ord = value::compare(v, b).ok_or_else(|| {
                            ExecError::dynamic(ErrorCode::FORG0006, "min/max over incomparable values")
                        })?;
                        let better = if f == AggrFn::Min { ord == Ordering::Less } else { ord == Ordering::Greater };
                        Some(if better { v } else { b })
                    }
                };
            }
            best.cloned().unwrap_or(Atom::Nil)
        }
        AggrFn::StrJoin => {
            let parts: Vec<CompactString> = vals
                .iter()
                .filter_map(|v| match value::to_string(v) {
                    Atom::Str(s) => Some(s),
                    _ => None,
                })
                .collect();
            Atom::Str(CompactString::from(parts.iter().join(" ")))
        }
    })
}

fn item_type_matches(m: &Machine<'_>, t: ItemType, item: &Atom, kind: Kind) -> Result<bool, ExecError> {
    Ok(match t {
        ItemType::Item => true,
        ItemType::AnyAtomic => !kind.is_node(),
        ItemType::Numeric => matches!(kind, Kind::Int | Kind::Dec | Kind::Dbl),
        ItemType::Atomic(a) => Kind::from_atomic(a) == kind,
        ItemType::Node(n) => {
            if !kind.is_node() {
                return Ok(false);
            }
            let actual = m.store().kind(Machine::node_of(item)?);
            match n {
                NodeType::Any => true,
                NodeType::Document => actual == Some(NodeKind::Document),
                NodeType::Element => actual == Some(NodeKind::Element),
                NodeType::Attribute => actual == Some(NodeKind::Attribute),
                NodeType::Text => actual == Some(NodeKind::Text),
            }
        }
    })
}

impl Machine<'_> {
    fn scalar(&mut self, e: &Expr, frame: &mut Frame) -> Result<Atom, ExecError> {
        self.eval(e, frame)?.as_scalar()
    }

    pub(crate) fn eval_op(&mut self, e: &Expr, frame: &mut Frame) -> Result<Value, ExecError> {
        Ok(match e {
            Expr::Var(_) | Expr::Const(_) | Expr::Column(_) | Expr::CallProc(..) => self.eval(e, frame)?,
            Expr::Project { value, like } => {
                let v = self.scalar(value, frame)?;
                let n = match self.eval(like, frame)? {
                    Value::Scalar(_) => 1,
                    Value::Column(c) => c.len(),
                    Value::Tuple(t) => t.first().map_or(0, |c| c.len()),
                };
                Value::column(vec![v; n])
            }
            Expr::Count(e) => {
                let n = match self.eval(e, frame)? {
                    Value::Scalar(_) => 1,
                    Value::Column(c) => c.len(),
                    Value::Tuple(t) => t.first().map_or(0, |c| c.len()),
                };
                Value::Scalar(Atom::Int(n as i64))
            }
            Expr::Mark { col, start } => {
                let c = self.col(col, frame)?;
                Value::column((0..c.len() as u64).map(|i| Atom::Oid(start + i)).collect())
            }
            Expr::MarkGrp(col) => {
                let c = self.col(col, frame)?;
                let mut out = Vec::with_capacity(c.len());
                let mut n = 0i64;
                for i in 0..c.len() {
                    n = if i > 0 && AtomKey::from(&c[i]) == AtomKey::from(&c[i - 1]) { n + 1 } else { 1 };
                    out.push(Atom::Int(n));
                }
                Value::column(out)
            }
            Expr::Fetch { col, positions } => {
                let c = self.col(col, frame)?;
                let p = self.col(positions, frame)?;
                let mut out = Vec::with_capacity(p.len());
                for a in p.iter() {
                    out.push(match position(a)? {
                        Some(i) => c
                            .get(i)
                            .cloned()
                            .ok_or_else(|| ExecError::internal(format!("fetch position {i} beyond {}", c.len())))?,
                        None => Atom::Nil,
                    });
                }
                Value::column(out)
            }
            Expr::Select { col, op, value } => {
                let c = self.col(col, frame)?;
                let v = self.scalar(value, frame)?;
                let mut out = Vec::new();
                for (i, a) in c.iter().enumerate() {
                    let hit = match op {
                        BinOp::Eq => AtomKey::from(a) == AtomKey::from(&v),
                        BinOp::Ne => AtomKey::from(a) != AtomKey::from(&v),
                        op => is_true(&value::binary(*op, a, &v)?),
                    };
                    if hit {
                        out.push(oid(i));
                    }
                }
                Value::column(out)
            }
            Expr::SelectIn { col, set } => {
                let c = self.col(col, frame)?;
                let s = key_set(&self.col(set, frame)?);
                Value::column(c.iter().enumerate().filter(|(_, a)| s.contains(&AtomKey::from(*a))).map(|(i, _)| oid(i)).collect())
            }
            Expr::Diff { col, set } => {
                let c = self.col(col, frame)?;
                let s = key_set(&self.col(set, frame)?);
                Value::column(c.iter().filter(|a| !s.contains(&AtomKey::from(*a))).cloned().collect())
            }
            Expr::Locate { values, keys } => {
                let v = self.col(values, frame)?;
                let idx = first_index(&self.col(keys, frame)?);
                Value::column(v.iter().map(|a| idx.get(&AtomKey::from(a)).map_or(Atom::Nil, |i| oid(*i))).collect())
            }
            Expr::Lookup { probe, keys, values, default } => {
                let p = self.col(probe, frame)?;
                let idx = first_index(&self.col(keys, frame)?);
                let vals = self.col(values, frame)?;
                Value::column(
                    p.iter()
                        .map(|a| idx.get(&AtomKey::from(a)).and_then(|i| vals.get(*i)).cloned().unwrap_or_else(|| default.clone()))
                        .collect(),
                )
            }
            Expr::Map1 { op, arg } => match self.eval(arg, frame)? {
                Value::Scalar(a) => Value::Scalar(value::unary(*op, &a)?),
                v => {
                    let c = v.as_column()?;
                    Value::column(c.iter().map(|a| value::unary(*op, a)).collect::<Result<_, _>>()?)
                }
            },
            Expr::Map2 { op, left, right } => {
                let l = self.eval(left, frame)?;
                let r = self.eval(right, frame)?;
                match (l, r) {
                    (Value::Scalar(a), Value::Scalar(b)) => Value::Scalar(value::binary(*op, &a, &b)?),
                    (Value::Scalar(a), r) => {
                        let r = r.as_column()?;
                        Value::column(r.iter().map(|b| value::binary(*op, &a, b)).collect::<Result<_, _>>()?)
                    }
                    (l, Value::Scalar(b)) => {
                        let l = l.as_column()?;
                        Value::column(l.iter().map(|a| value::binary(*op, a, &b)).collect::<Result<_, _>>()?)
                    }
                    (l, r) => {
                        let (l, r) = (l.as_column()?, r.as_column()?);
                        if l.len() != r.len() {
                            return Err(ExecError::internal(format!("map over misaligned columns ({} vs {})", l.len(), r.len())));
                        }
                        Value::column(l.iter().zip(r.iter()).map(|(a, b)| value::binary(*op, a, b)).collect::<Result<_, _>>()?)
                    }
                }
            }
            Expr::Append(a, b) => {
                let a = self.col(a, frame)?;
                let b = self.col(b, frame)?;
                let mut out = Vec::with_capacity(a.len() + b.len());
                out.extend(a.iter().cloned());
                out.extend(b.iter().cloned());
                Value::column(out)
            }
            Expr::Aggr { f, groups, values, domain } => {
                let g = self.col(groups, frame)?;
                let v = self.col(values, frame)?;
                let d = self.col(domain, frame)?;
                if g.len() != v.len() {
                    return Err(ExecError::internal("aggregate over misaligned columns"));
                }
                let mut buckets: HashMap<AtomKey, Vec<&Atom>> = HashMap::new();
                for (k, x) in g.iter().zip(v.iter()) {
                    buckets.entry(AtomKey::from(k)).or_default().push(x);
                }
                let mut out = Vec::with_capacity(d.len());
                for k in d.iter() {
                    let vals = buckets.get(&AtomKey::from(k)).map(Vec::as_slice).unwrap_or(&[]);
                    out.push(aggregate(*f, vals)?);
                }
                Value::column(out)
            }
            Expr::Intern { container, values } => {
                let v = self.col(values, frame)?;
                Value::column(v.iter().map(|a| self.intern(*container, a)).collect())
            }
            Expr::Values { container, refs } => {
                let r = self.col(refs, frame)?;
                let c = self.container(*container);
                Value::column(r.iter().map(|a| c.get(a)).collect::<Result<_, _>>()?)
            }
            Expr::Deref { items, kinds } => {
                let i = self.col(items, frame)?;
                let k = self.col(kinds, frame)?;
                Value::column(i.iter().zip(k.iter()).map(|(a, k)| self.deref(a, k)).collect::<Result<_, _>>()?)
            }
            Expr::Sort(keys) => {
                let mut cols: Vec<(Column, bool)> = Vec::with_capacity(keys.len());
                for (k, desc) in keys {
                    cols.push((self.col(k, frame)?, *desc));
                }
                let n = cols.first().map_or(0, |(c, _)| c.len());
                if cols.iter().any(|(c, _)| c.len() != n) {
                    return Err(ExecError::internal("sort over misaligned columns"));
                }
                let mut perm: Vec<usize> = (0..n).collect();
                perm.sort_by(|a, b| {
                    for (c, desc) in &cols {
                        let o = sort_order(&c[*a], &c[*b]);
                        let o = if *desc { o.reverse() } else { o };
                        if o != Ordering::Equal {
                            return o;
                        }
                    }
                    Ordering::Equal
                });
                Value::column(perm.into_iter().map(oid).collect())
            }
            Expr::Unique(col) => {
                let c = self.col(col, frame)?;
                let mut v: Vec<Atom> = c.iter().cloned().collect();
                v.sort_by(sort_order);
                v.dedup_by(|a, b| AtomKey::from(&*a) == AtomKey::from(&*b));
                Value::column(v)
            }
            Expr::EquiJoin { left, right } => {
                let l = self.col(left, frame)?;
                let r = self.col(right, frame)?;
                let mut idx: HashMap<AtomKey, Vec<usize>> = HashMap::new();
                for (j, a) in r.iter().enumerate() {
                    if !a.is_nil() {
                        idx.entry(AtomKey::from(a)).or_default().push(j);
                    }
                }
                let (mut lp, mut rp) = (Vec::new(), Vec::new());
                for (i, a) in l.iter().enumerate() {
                    if let Some(js) = idx.get(&AtomKey::from(a)) {
                        for j in js {
                            lp.push(oid(i));
                            rp.push(oid(*j));
                        }
                    }
                }
                Value::Tuple(vec![Rc::new(lp), Rc::new(rp)])
            }
            Expr::ThetaJoin { left_iter, left_vals, right_iter, right_vals, op } => {
                let li = self.col(left_iter, frame)?;
                let lv = self.col(left_vals, frame)?;
                let ri = self.col(right_iter, frame)?;
                let rv = self.col(right_vals, frame)?;
                if li.len() != lv.len() || ri.len() != rv.len() {
                    return Err(ExecError::internal("theta-join over misaligned columns"));
                }
                let mut idx: HashMap<AtomKey, Vec<usize>> = HashMap::new();
                for (j, a) in ri.iter().enumerate() {
                    idx.entry(AtomKey::from(a)).or_default().push(j);
                }
                let (mut lp, mut rp) = (Vec::new(), Vec::new());
                for (i, it) in li.iter().enumerate() {
                    let Some(js) = idx.get(&AtomKey::from(it)) else { continue };
                    for j in js {
                        if lv[i].is_nil() || rv[*j].is_nil() {
                            continue;
                        }
                        if is_true(&value::binary(*op, &lv[i], &rv[*j])?) {
                            lp.push(oid(i));
                            rp.push(oid(*j));
                        }
                    }
                }
                Value::Tuple(vec![Rc::new(lp), Rc::new(rp)])
            }
            Expr::Merge { left, right } => {
                let l = self.col(left, frame)?;
                let r = self.col(right, frame)?;
                let (mut i, mut j) = (0, 0);
                let mut out = Vec::with_capacity(l.len() + r.len());
                while i < l.len() || j < r.len() {
                    let take_left = j >= r.len() || (i < l.len() && sort_order(&l[i], &r[j]) != Ordering::Greater);
                    if take_left {
                        out.push(oid(i));
                        i += 1;
                    } else {
                        out.push(oid(l.len() + j));
                        j += 1;
                    }
                }
                Value::column(out)
            }
            Expr::Nth(t, i) => {
                let v = self.eval(t, frame)?;
                let cols = v.as_tuple()?;
                Value::Column(Rc::clone(
                    cols.get(*i).ok_or_else(|| ExecError::internal(format!("tuple has no component {i}")))?,
                ))
            }
            Expr::Call(ext, args) => {
                let mut cols = Vec::with_capacity(args.len());
                for a in args {
                    cols.push(self.col(a, frame)?);
                }
                self.call_extern(ext, &cols)?
            }
        })
    }

    fn arg<'c>(args: &'c [Column], i: usize, ext: &Extern) -> Result<&'c Column, ExecError> {
        args.get(i).ok_or_else(|| ExecError::internal(format!("{} is missing argument {i}", ext.name())))
    }

    fn call_extern(&mut self, ext: &Extern, args: &[Column]) -> Result<Value, ExecError> {
        let a = |i: usize| Self::arg(args, i, ext);
        match ext {
            Extern::Step { axis, test } => {
                let (iter, item, kind) = (a(0)?, a(1)?, a(2)?);
                let mut pairs: Vec<(NodeRef, Atom)> = Vec::new();
                let mut seen: HashSet<(NodeRef, AtomKey)> = HashSet::new();
                for i in 0..iter.len() {
                    if !Self::kind_of(&kind[i])?.is_node() {
                        return Err(ExecError::dynamic(ErrorCode::XPTY0019, format!("{} step on an atomic value", axis.name())));
                    }
                    let ctx = Self::node_of(&item[i])?;
                    for n in self.store().axis(ctx, *axis, test) {
                        if seen.insert((n, AtomKey::from(&iter[i]))) {
                            pairs.push((n, iter[i].clone()));
                        }
                    }
                }
                let store = self.store();
                pairs.sort_by(|(n1, i1), (n2, i2)| store.document_order(*n1, *n2).then_with(|| sort_order(i1, i2)));
                let (iters, items): (Vec<Atom>, Vec<Atom>) =
                    pairs.into_iter().map(|(n, it)| (it, Atom::Oid(u64::from(n.0)))).unzip();
                Ok(Value::Tuple(vec![Rc::new(iters), Rc::new(items)]))
            }
            Extern::Doc => {
                let (iter, item, kind) = (a(0)?, a(1)?, a(2)?);
                let (mut iters, mut docs) = (Vec::new(), Vec::new());
                for i in 0..iter.len() {
                    let uri = match self.deref(&item[i], &kind[i])? {
                        Atom::Str(s) => s,
                        other => return Err(ExecError::dynamic(ErrorCode::XPTY0004, format!("fn:doc expects a string, got {other:?}"))),
                    };
                    let d = self
                        .store()
                        .document(&uri)
                        .ok_or_else(|| ExecError::dynamic(ErrorCode::FODC0002, format!("document {uri:?} is not available")))?;
                    iters.push(iter[i].clone());
                    docs.push(Atom::Oid(u64::from(d.0)));
                }
                Ok(Value::Tuple(vec![Rc::new(iters), Rc::new(docs)]))
            }
            Extern::ContextRoot => {
                let lp = a(0)?;
                let d = self
                    .store()
                    .context()
                    .ok_or_else(|| ExecError::dynamic(ErrorCode::FODC0002, "no context document"))?;
                Ok(Value::Tuple(vec![Rc::clone(lp), Rc::new(vec![Atom::Oid(u64::from(d.0)); lp.len()])]))
            }
            Extern::ElemConstruct { adopt } => self.construct_elements(args, *adopt),
            Extern::AttrConstruct => {
                let (t_iter, t_item, v_iter, v_val) = (a(0)?, a(1)?, a(2)?, a(3)?);
                let idx = first_index(v_iter);
                let mut items = Vec::with_capacity(t_iter.len());
                for i in 0..t_iter.len() {
                    let name = self.qname(&t_item[i])?;
                    let text = match idx.get(&AtomKey::from(&t_iter[i])).map(|j| &v_val[*j]) {
                        Some(Atom::Str(s)) => s.clone(),
                        Some(other) => match value::to_string(other) {
                            Atom::Str(s) => s,
                            _ => CompactString::default(),
                        },
                        None => CompactString::default(),
                    };
                    let n = self.store_mut().new_attribute(name, &text);
                    self.store_mut().renumber(n);
                    items.push(Atom::Oid(u64::from(n.0)));
                }
                Ok(Value::Tuple(vec![Rc::clone(t_iter), Rc::new(items)]))
            }
            Extern::TextConstruct => {
                let (iter, vals) = (a(0)?, a(1)?);
                let mut items = Vec::with_capacity(iter.len());
                for v in vals.iter() {
                    let text = match value::to_string(v) {
                        Atom::Str(s) => s,
                        _ => CompactString::default(),
                    };
                    let n = self.store_mut().new_text(&text);
                    self.store_mut().renumber(n);
                    items.push(Atom::Oid(u64::from(n.0)));
                }
                Ok(Value::Tuple(vec![Rc::clone(iter), Rc::new(items)]))
            }
            Extern::Atomize => {
                let (item, kind) = (a(0)?, a(1)?);
                let (mut items, mut kinds) = (Vec::with_capacity(item.len()), Vec::with_capacity(item.len()));
                for i in 0..item.len() {
                    if Self::kind_of(&kind[i])?.is_node() {
                        let s = self.store().string_value(Self::node_of(&item[i])?);
                        items.push(self.intern(Container::Str, &Atom::str(&s)));
                        kinds.push(Kind::UntypedAtomic.atom());
                    } else {
                        items.push(item[i].clone());
                        kinds.push(kind[i].clone());
                    }
                }
                Ok(Value::Tuple(vec![Rc::new(items), Rc::new(kinds)]))
            }
            Extern::Stringify => {
                let (item, kind) = (a(0)?, a(1)?);
                let mut out = Vec::with_capacity(item.len());
                for i in 0..item.len() {
                    let text = self.item(&item[i], &kind[i])?.to_text(self.store());
                    out.push(Atom::str(&text));
                }
                Ok(Value::column(out))
            }
            Extern::Ebv => {
                let (lp, iter, item, kind) = (a(0)?, a(1)?, a(2)?, a(3)?);
                let mut bits: HashMap<AtomKey, bool> = HashMap::new();
                for (it, range) in runs(iter) {
                    let first = range.start;
                    let k = Self::kind_of(&kind[first])?;
                    let bit = if k.is_node() {
                        true
                    } else {
                        if range.len() > 1 {
                            return Err(ExecError::dynamic(
                                ErrorCode::FORG0006,
                                "effective boolean value of a sequence of several atomic values",
                            ));
                        }
                        match self.deref(&item[first], &kind[first])? {
                            Atom::Bit(b) => b,
                            Atom::Str(s) => !s.is_empty(),
                            Atom::Int(i) => i != 0,
                            Atom::Dbl(d) => d != 0.0 && !d.is_nan(),
                            _ => {
                                return Err(ExecError::dynamic(ErrorCode::FORG0006, format!("no effective boolean value for {}", k.name())));
                            }
                        }
                    };
                    bits.insert(AtomKey::from(&it), bit);
                }
                Ok(Value::column(lp.iter().map(|it| Atom::Bit(bits.get(&AtomKey::from(it)).copied().unwrap_or(false))).collect()))
            }
            Extern::InstanceOf(ty) => {
                let (lp, iter, item, kind) = (a(0)?, a(1)?, a(2)?, a(3)?);
                let mut groups: HashMap<AtomKey, std::ops::Range<usize>> = HashMap::new();
                for (it, range) in runs(iter) {
                    groups.insert(AtomKey::from(&it), range);
                }
                let mut out = Vec::new();
                for it in lp.iter() {
                    let range = groups.get(&AtomKey::from(it)).cloned().unwrap_or(0..0);
                    let hit = match ty {
                        SeqType::Empty => range.is_empty(),
                        SeqType::Items(t, occ) => {
                            let n = range.len();
                            let count_ok = (n != 0 || occ.allows_empty()) && (n <= 1 || occ.allows_many());
                            let mut ok = count_ok;
                            for i in range {
                                if !ok {
                                    break;
                                }
                                ok = item_type_matches(self, *t, &item[i], Self::kind_of(&kind[i])?)?;
                            }
                            ok
                        }
                    };
                    if hit {
                        out.push(it.clone());
                    }
                }
                Ok(Value::column(out))
            }
            Extern::ItemsToNodes => {
                let (iter, item, kind) = (a(0)?, a(2)?, a(3)?);
                let (mut iters, mut items, mut kinds) = (Vec::new(), Vec::new(), Vec::new());
                for (it, range) in runs(iter) {
                    let mut pending: Vec<String> = Vec::new();
                    for i in range {
                        let k = Self::kind_of(&kind[i])?;
                        if k.is_node() {
                            self.flush_text(&mut pending, &it, &mut iters, &mut items, &mut kinds);
                            iters.push(it.clone());
                            items.push(item[i].clone());
                            kinds.push(kind[i].clone());
                        } else {
                            pending.push(self.item(&item[i], &kind[i])?.to_text(self.store()));
                        }
                    }
                    self.flush_text(&mut pending, &it, &mut iters, &mut items, &mut kinds);
                }
                Ok(Value::Tuple(vec![Rc::new(iters), Rc::new(items), Rc::new(kinds)]))
            }
            Extern::DistinctDocOrder => {
                let (iter, item, kind) = (a(0)?, a(1)?, a(2)?);
                let mut rows: Vec<(Atom, NodeRef, Atom)> = Vec::with_capacity(iter.len());
                for i in 0..iter.len() {
                    if !Self::kind_of(&kind[i])?.is_node() {
                        return Err(ExecError::dynamic(ErrorCode::XPTY0004, "document order over atomic values"));
                    }
                    rows.push((iter[i].clone(), Self::node_of(&item[i])?, kind[i].clone()));
                }
                let store = self.store();
                rows.sort_by(|(i1, n1, _), (i2, n2, _)| sort_order(i1, i2).then_with(|| store.document_order(*n1, *n2)));
                rows.dedup_by(|(i1, n1, _), (i2, n2, _)| n1 == n2 && AtomKey::from(&*i1) == AtomKey::from(&*i2));
                let mut iters = Vec::with_capacity(rows.len());
                let mut items = Vec::with_capacity(rows.len());
                let mut kinds = Vec::with_capacity(rows.len());
                for (it, n, k) in rows {
                    iters.push(it);
                    items.push(Atom::Oid(u64::from(n.0)));
                    kinds.push(k);
                }
                Ok(Value::Tuple(vec![Rc::new(iters), Rc::new(items), Rc::new(kinds)]))
            }
            Extern::PrintResult => {
                let (item, kind) = (a(2)?, a(3)?);
                let mut items: Vec<Item> = Vec::with_capacity(item.len());
                for i in 0..item.len() {
                    items.push(self.item(&item[i], &kind[i])?);
                }
                let text = serialize::serialize(self.store(), &items)?;
                self.write_output(&text);
                Ok(Value::Scalar(Atom::Nil))
            }
        }
    }

    fn flush_text(&mut self, pending: &mut Vec<String>, it: &Atom, iters: &mut Vec<Atom>, items: &mut Vec<Atom>, kinds: &mut Vec<Atom>) {
        if pending.is_empty() {
            return;
        }
        let text = pending.join(" ");
        pending.clear();
        let n = self.store_mut().new_text(&text);
        self.store_mut().renumber(n);
        iters.push(it.clone());
        items.push(Atom::Oid(u64::from(n.0)));
        kinds.push(Kind::Node.atom());
    }

    fn construct_elements(&mut self, args: &[Column], adopt: bool) -> Result<Value, ExecError> {
        let ext = Extern::ElemConstruct { adopt };
        let a = |i: usize| Self::arg(args, i, &ext);
        let (t_iter, t_item, c_iter, c_item, c_kind) = (a(0)?, a(1)?, a(2)?, a(3)?, a(4)?);
        let mut content: HashMap<AtomKey, std::ops::Range<usize>> = HashMap::new();
        for (it, range) in runs(c_iter) {
            content.insert(AtomKey::from(&it), range);
        }
        let mut items = Vec::with_capacity(t_iter.len());
        for i in 0..t_iter.len() {
            let name = self.qname(&t_item[i])?;
            let e = self.store_mut().new_element(name);
            let range = content.get(&AtomKey::from(&t_iter[i])).cloned().unwrap_or(0..0);
            let mut pending: Vec<String> = Vec::new();
            let mut seen_child = false;
            for j in range {
                let k = Self::kind_of(&c_kind[j])?;
                if !k.is_node() {
                    pending.push(self.item(&c_item[j], &c_kind[j])?.to_text(self.store()));
                    continue;
                }
                if !pending.is_empty() {
                    let text = pending.join(" ");
                    pending.clear();
                    self.store_mut().append_text(e, &text);
                    seen_child = true;
                }
                let n = Self::node_of(&c_item[j])?;
                let is_attr = self.store().kind(n) == Some(NodeKind::Attribute);
                if is_attr {
                    if seen_child {
                        return Err(ExecError::dynamic(ErrorCode::XPTY0004, "attribute node follows element content"));
                    }
                    let name = self.store().name(n).cloned();
                    let duplicate = self
                        .store()
                        .attributes(e)
                        .iter()
                        .any(|x| self.store().name(*x).map(|q| (&q.local, &q.ns_uri)) == name.as_ref().map(|q| (&q.local, &q.ns_uri)));
                    if duplicate {
                        let shown = name.map(|q| q.to_string()).unwrap_or_default();
                        return Err(ExecError::dynamic(ErrorCode::XQDY0025, format!("duplicate attribute {shown}")));
                    }
                } else {
                    seen_child = true;
                }
                let movable = adopt && self.store().is_parentless(n) && self.store().kind(n) != Some(NodeKind::Document);
                if movable && self.store().kind(n) != Some(NodeKind::Text) {
                    self.store_mut().adopt(e, n);
                } else {
                    self.store_mut().deep_copy_into(e, n);
                }
            }
            if !pending.is_empty() {
                self.store_mut().append_text(e, &pending.join(" "));
            }
            self.store_mut().renumber(e);
            items.push(Atom::Oid(u64::from(e.0)));
        }
        Ok(Value::Tuple(vec![Rc::clone(t_iter), Rc::new(items)]))
    }
}
