//! The bulk-operation program emitted by the translator.
//!
//! Every variable holds either a scalar [`Atom`], a column (a positionally
//! addressed vector of atoms, i.e. a dense-headed BAT) or a tuple of columns
//! produced by a join. Positions are 0-based [`Atom::Oid`]s; iterations are
//! 1-based oids.
use compact_str::CompactString;

use crate::core::{Axis, NodeTest, SeqType};
use crate::runtime::ErrorCode;

pub mod buffer;
pub mod print;

pub use buffer::MilBuffer;

pub type Name = CompactString;

#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Nil,
    Oid(u64),
    Int(i64),
    Dbl(f64),
    Str(CompactString),
    Bit(bool),
}

impl Atom {
    pub fn is_nil(&self) -> bool {
        matches!(self, Atom::Nil)
    }

    pub fn str(s: &str) -> Atom {
        Atom::Str(CompactString::from(s))
    }
}

/// Dynamic item kind stored in the `kind` column of a generic quadruple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Bool,
    Int,
    Dec,
    Dbl,
    Str,
    UntypedAtomic,
    QName,
    Node,
    Attr,
}

impl Kind {
    pub const ATOMIC: [Kind; 7] =
        [Kind::Bool, Kind::Int, Kind::Dec, Kind::Dbl, Kind::Str, Kind::UntypedAtomic, Kind::QName];

    pub fn code(self) -> i64 {
        match self {
            Kind::Bool => 0,
            Kind::Int => 1,
            Kind::Dec => 2,
            Kind::Dbl => 3,
            Kind::Str => 4,
            Kind::UntypedAtomic => 5,
            Kind::QName => 6,
            Kind::Node => 7,
            Kind::Attr => 8,
        }
    }

    pub fn from_code(code: i64) -> Option<Kind> {
        Some(match code {
            0 => Kind::Bool,
            1 => Kind::Int,
            2 => Kind::Dec,
            3 => Kind::Dbl,
            4 => Kind::Str,
            5 => Kind::UntypedAtomic,
            6 => Kind::QName,
            7 => Kind::Node,
            8 => Kind::Attr,
            _ => return None,
        })
    }

    pub fn atom(self) -> Atom {
        Atom::Int(self.code())
    }

    /// The value container item references of this kind point into.
    pub fn container(self) -> Option<Container> {
        match self {
            Kind::Int => Some(Container::Int),
            Kind::Dec => Some(Container::Dec),
            Kind::Dbl => Some(Container::Dbl),
            Kind::Str | Kind::UntypedAtomic => Some(Container::Str),
            Kind::QName => Some(Container::QName),
            Kind::Bool | Kind::Node | Kind::Attr => None,
        }
    }

    pub fn is_node(self) -> bool {
        matches!(self, Kind::Node | Kind::Attr)
    }

    pub fn from_atomic(a: crate::core::AtomicType) -> Kind {
        use crate::core::AtomicType;
        match a {
            AtomicType::Boolean => Kind::Bool,
            AtomicType::Integer => Kind::Int,
            AtomicType::Decimal => Kind::Dec,
            AtomicType::Double => Kind::Dbl,
            AtomicType::String => Kind::Str,
            AtomicType::UntypedAtomic => Kind::UntypedAtomic,
            AtomicType::QName => Kind::QName,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::Bool => "BOOL",
            Kind::Int => "INT",
            Kind::Dec => "DEC",
            Kind::Dbl => "DBL",
            Kind::Str => "STR",
            Kind::UntypedAtomic => "U_A",
            Kind::QName => "QNAME",
            Kind::Node => "ELEM",
            Kind::Attr => "ATTR",
        }
    }
}

/// Per-domain value containers shared by the whole program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Container {
    Int,
    Dbl,
    Dec,
    Str,
    QName,
}

impl Container {
    pub const ALL: [Container; 5] = [Container::Int, Container::Dbl, Container::Dec, Container::Str, Container::QName];

    pub fn name(self) -> &'static str {
        match self {
            Container::Int => "int_values",
            Container::Dbl => "dbl_values",
            Container::Dec => "dec_values",
            Container::Str => "str_values",
            Container::QName => "qn_values",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Container::Int => 0,
            Container::Dbl => 1,
            Container::Dec => 2,
            Container::Str => 3,
            Container::QName => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Not,
    Neg,
    /// Casts yield nil where the value is not castable.
    ToInt,
    ToDbl,
    ToDec,
    ToStr,
    /// Canonical decimal rendering (never an exponent).
    DecToStr,
    ToBit,
    /// Boolean item reference (oid 0/1) to a bit and back.
    OidToBit,
    BitToOid,
    IsNil,
    StrLen,
}

impl UnOp {
    pub fn name(self) -> &'static str {
        match self {
            UnOp::Not => "not",
            UnOp::Neg => "-",
            UnOp::ToInt => "int",
            UnOp::ToDbl => "dbl",
            UnOp::ToDec => "dec",
            UnOp::ToStr => "str",
            UnOp::DecToStr => "decstr",
            UnOp::ToBit => "bit",
            UnOp::OidToBit => "oid2bit",
            UnOp::BitToOid => "bit2oid",
            UnOp::IsNil => "isnil",
            UnOp::StrLen => "length",
        }
    }

    /// Cast into the value domain of `kind` (identity for nodes).
    pub fn cast_to(kind: Kind) -> Option<UnOp> {
        match kind {
            Kind::Bool => Some(UnOp::ToBit),
            Kind::Int => Some(UnOp::ToInt),
            Kind::Dec => Some(UnOp::ToDec),
            Kind::Dbl => Some(UnOp::ToDbl),
            Kind::Str | Kind::UntypedAtomic => Some(UnOp::ToStr),
            Kind::QName | Kind::Node | Kind::Attr => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// Raises `FOAR0001` on a zero divisor; `Div` follows IEEE rules.
    Div,
    DivChecked,
    IDiv,
    Mod,
    ModChecked,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Concat,
    Contains,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::DivChecked => "/!",
            BinOp::IDiv => "idiv",
            BinOp::Mod => "%",
            BinOp::ModChecked => "%!",
            BinOp::Eq => "=",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Concat => "+str",
            BinOp::Contains => "search",
        }
    }

    pub fn from_comparison(cmp: crate::core::Comparison) -> BinOp {
        use crate::core::Comparison;
        match cmp {
            Comparison::Eq => BinOp::Eq,
            Comparison::Ne => BinOp::Ne,
            Comparison::Lt => BinOp::Lt,
            Comparison::Le => BinOp::Le,
            Comparison::Gt => BinOp::Gt,
            Comparison::Ge => BinOp::Ge,
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(self, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggrFn {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    /// String join with a single space.
    StrJoin,
}

impl AggrFn {
    pub fn name(self) -> &'static str {
        match self {
            AggrFn::Count => "count",
            AggrFn::Sum => "sum",
            AggrFn::Min => "min",
            AggrFn::Max => "max",
            AggrFn::Avg => "avg",
            AggrFn::StrJoin => "strjoin",
        }
    }
}

/// Operations provided by the working set rather than by the column algebra.
#[derive(Debug, Clone, PartialEq)]
pub enum Extern {
    /// `[iter, item, kind]` context nodes to `(iter, item)` result nodes,
    /// sorted by (item, iter).
    Step { axis: Axis, test: NodeTest },
    /// `[iter, item, kind]` URIs to `(iter, item)` document nodes.
    Doc,
    /// `[loop]` to the context document node per iteration.
    ContextRoot,
    /// `[tag_iter, tag_item, c_iter, c_item, c_kind]` to `(iter, item)`.
    /// With `adopt`, parentless content nodes are attached instead of copied.
    ElemConstruct { adopt: bool },
    /// `[tag_iter, tag_item, v_iter, v_value]` to `(iter, item)`.
    AttrConstruct,
    /// `[iter, value]` to `(iter, item)`.
    TextConstruct,
    /// `[item, kind]` to `(item, kind)` with nodes replaced by their
    /// (interned) untyped string values.
    Atomize,
    /// `[item, kind]` to the kind-aware string rendering of each item.
    Stringify,
    /// `[loop, iter, item, kind]` to a bit per loop iteration.
    Ebv,
    /// `[loop, iter, item, kind]` to the iterations whose sequence matches.
    InstanceOf(SeqType),
    /// `[iter, pos, item, kind]` to `(iter, item, kind)` with adjacent
    /// atomic values merged into text nodes.
    ItemsToNodes,
    /// `[iter, item, kind]` to `(iter, item, kind)` sorted per iteration in
    /// document order without duplicates.
    DistinctDocOrder,
    /// `[iter, pos, item, kind]`; appends the serialized items to the output.
    PrintResult,
}

impl Extern {
    pub fn name(&self) -> &'static str {
        match self {
            Extern::Step { .. } => "step",
            Extern::Doc => "doc",
            Extern::ContextRoot => "root",
            Extern::ElemConstruct { adopt: false } => "element",
            Extern::ElemConstruct { adopt: true } => "element_adopt",
            Extern::AttrConstruct => "attribute",
            Extern::TextConstruct => "text",
            Extern::Atomize => "atomize",
            Extern::Stringify => "stringify",
            Extern::Ebv => "ebv",
            Extern::InstanceOf(_) => "instance_of",
            Extern::ItemsToNodes => "item2node",
            Extern::DistinctDocOrder => "distinct_doc_order",
            Extern::PrintResult => "print_result",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Var(Name),
    Const(Atom),
    /// Column literal.
    Column(Vec<Atom>),
    /// `value` repeated once per row of `like`.
    Project { value: Box<Expr>, like: Box<Expr> },
    Count(Box<Expr>),
    /// Oids `start, start+1, ...`, one per row of the argument.
    Mark { col: Box<Expr>, start: u64 },
    /// Ordinal (1-based int) of each row within its run of equal values.
    MarkGrp(Box<Expr>),
    Fetch { col: Box<Expr>, positions: Box<Expr> },
    /// Positions where `col op value`.
    Select { col: Box<Expr>, op: BinOp, value: Box<Expr> },
    /// Positions whose value occurs in `set`.
    SelectIn { col: Box<Expr>, set: Box<Expr> },
    /// Values of `col` not occurring in `set`, order preserved.
    Diff { col: Box<Expr>, set: Box<Expr> },
    /// Position of the first key equal to each value (nil when absent).
    Locate { values: Box<Expr>, keys: Box<Expr> },
    Lookup { probe: Box<Expr>, keys: Box<Expr>, values: Box<Expr>, default: Atom },
    Map1 { op: UnOp, arg: Box<Expr> },
    Map2 { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    Append(Box<Expr>, Box<Expr>),
    /// One aggregate per `domain` value over the `values` whose group matches.
    Aggr { f: AggrFn, groups: Box<Expr>, values: Box<Expr>, domain: Box<Expr> },
    Intern { container: Container, values: Box<Expr> },
    Values { container: Container, refs: Box<Expr> },
    /// Raw values of generic items, dispatching on the kind column.
    Deref { items: Box<Expr>, kinds: Box<Expr> },
    /// Stable sort permutation; `true` marks a descending key.
    Sort(Vec<(Expr, bool)>),
    /// Sorted distinct values.
    Unique(Box<Expr>),
    /// `(lpos, rpos)` of equal values, ordered by left then right position.
    EquiJoin { left: Box<Expr>, right: Box<Expr> },
    /// `(lpos, rpos)` where the iterations match and `lval op rval` holds.
    ThetaJoin { left_iter: Box<Expr>, left_vals: Box<Expr>, right_iter: Box<Expr>, right_vals: Box<Expr>, op: BinOp },
    /// Positions into `append(left, right)` ordering both by key, left first on ties.
    Merge { left: Box<Expr>, right: Box<Expr> },
    /// Component of a tuple value.
    Nth(Box<Expr>, usize),
    Call(Extern, Vec<Expr>),
    CallProc(Name, Vec<Expr>),
}

impl Expr {
    pub fn var(name: impl Into<Name>) -> Expr {
        Expr::Var(name.into())
    }

    pub fn int(v: i64) -> Expr {
        Expr::Const(Atom::Int(v))
    }

    pub fn oid(v: u64) -> Expr {
        Expr::Const(Atom::Oid(v))
    }

    pub fn empty() -> Expr {
        Expr::Column(Vec::new())
    }

    pub fn count(e: Expr) -> Expr {
        Expr::Count(Box::new(e))
    }

    pub fn project(value: Expr, like: Expr) -> Expr {
        Expr::Project { value: Box::new(value), like: Box::new(like) }
    }

    pub fn fetch(col: Expr, positions: Expr) -> Expr {
        Expr::Fetch { col: Box::new(col), positions: Box::new(positions) }
    }

    pub fn select(col: Expr, op: BinOp, value: Expr) -> Expr {
        Expr::Select { col: Box::new(col), op, value: Box::new(value) }
    }

    pub fn select_in(col: Expr, set: Expr) -> Expr {
        Expr::SelectIn { col: Box::new(col), set: Box::new(set) }
    }

    pub fn map1(op: UnOp, arg: Expr) -> Expr {
        Expr::Map1 { op, arg: Box::new(arg) }
    }

    pub fn map2(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr::Map2 { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn append(a: Expr, b: Expr) -> Expr {
        Expr::Append(Box::new(a), Box::new(b))
    }

    pub fn nth(tuple: Expr, i: usize) -> Expr {
        Expr::Nth(Box::new(tuple), i)
    }

    pub fn locate(values: Expr, keys: Expr) -> Expr {
        Expr::Locate { values: Box::new(values), keys: Box::new(keys) }
    }

    pub fn lookup(probe: Expr, keys: Expr, values: Expr, default: Atom) -> Expr {
        Expr::Lookup { probe: Box::new(probe), keys: Box::new(keys), values: Box::new(values), default }
    }

    pub fn mark_grp(col: Expr) -> Expr {
        Expr::MarkGrp(Box::new(col))
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Expr::Const(_))
    }

    /// Variables read by this expression.
    pub fn reads(&self, out: &mut Vec<Name>) {
        match self {
            Expr::Var(n) => out.push(n.clone()),
            Expr::Const(_) | Expr::Column(_) => {}
            Expr::Count(e) | Expr::MarkGrp(e) | Expr::Unique(e) | Expr::Nth(e, _) => e.reads(out),
            Expr::Mark { col, .. } => col.reads(out),
            Expr::Map1 { arg, .. } => arg.reads(out),
            Expr::Intern { values, .. } => values.reads(out),
            Expr::Values { refs, .. } => refs.reads(out),
            Expr::Project { value: a, like: b }
            | Expr::Fetch { col: a, positions: b }
            | Expr::Select { col: a, value: b, .. }
            | Expr::SelectIn { col: a, set: b }
            | Expr::Diff { col: a, set: b }
            | Expr::Locate { values: a, keys: b }
            | Expr::Map2 { left: a, right: b, .. }
            | Expr::Append(a, b)
            | Expr::Deref { items: a, kinds: b }
            | Expr::EquiJoin { left: a, right: b }
            | Expr::Merge { left: a, right: b } => {
                a.reads(out);
                b.reads(out);
            }
            Expr::Lookup { probe, keys, values, .. } => {
                probe.reads(out);
                keys.reads(out);
                values.reads(out);
            }
            Expr::Aggr { groups, values, domain, .. } => {
                groups.reads(out);
                values.reads(out);
                domain.reads(out);
            }
            Expr::Sort(keys) => keys.iter().for_each(|(k, _)| k.reads(out)),
            Expr::ThetaJoin { left_iter, left_vals, right_iter, right_vals, .. } => {
                left_iter.reads(out);
                left_vals.reads(out);
                right_iter.reads(out);
                right_vals.reads(out);
            }
            Expr::Call(_, args) | Expr::CallProc(_, args) => args.iter().for_each(|a| a.reads(out)),
        }
    }

    /// Has an effect beyond producing its value.
    pub fn has_effect(&self) -> bool {
        match self {
            Expr::Intern { .. } | Expr::CallProc(..) => true,
            Expr::Call(ext, _) => matches!(
                ext,
                Extern::ElemConstruct { .. }
                    | Extern::AttrConstruct
                    | Extern::TextConstruct
                    | Extern::ItemsToNodes
                    | Extern::PrintResult
                    | Extern::Atomize
                    | Extern::Ebv
                    | Extern::Step { .. }
                    | Extern::Doc
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Comment(String),
    Declare(Name, Option<Expr>),
    Assign(Name, Expr),
    Free(Name),
    Block(Vec<Stmt>),
    If { cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt> },
    Raise { code: ErrorCode, message: String },
    Exec(Expr),
}

impl Stmt {
    pub fn assign(name: impl Into<Name>, e: Expr) -> Stmt {
        Stmt::Assign(name.into(), e)
    }
}

/// A user-defined function fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct Proc {
    pub name: Name,
    pub params: Vec<Name>,
    pub body: Vec<Stmt>,
    /// Variables forming the returned `(iter, pos, item, kind)` tuple.
    pub result: [Name; 4],
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MilProgram {
    pub prologue: Vec<Stmt>,
    pub procs: Vec<Proc>,
    pub body: Vec<Stmt>,
    pub epilogue: Vec<Stmt>,
    /// Variables holding the final `(iter, pos, item, kind)` quadruple.
    pub result: [Name; 4],
}

impl MilProgram {
    pub fn proc(&self, name: &str) -> Option<&Proc> {
        self.procs.iter().find(|p| p.name == name)
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Number of statements, nested blocks included.
    pub fn statement_count(&self) -> usize {
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
        count(&self.prologue)
            + self.procs.iter().map(|p| count(&p.body)).sum::<usize>()
            + count(&self.body)
            + count(&self.epilogue)
    }
}
