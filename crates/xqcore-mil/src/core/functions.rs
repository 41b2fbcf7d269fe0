//! Function descriptors referenced from `Apply` nodes.
use std::fmt;

use super::types::{AtomicType, ItemType, NodeType, Occurrence, SeqType};
use super::FunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    /// The comparison that holds for `(b, a)` whenever `self` holds for `(a, b)`.
    pub fn flip(self) -> Comparison {
        match self {
            Comparison::Lt => Comparison::Gt,
            Comparison::Le => Comparison::Ge,
            Comparison::Gt => Comparison::Lt,
            Comparison::Ge => Comparison::Le,
            other => other,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparison::Eq => "eq",
            Comparison::Ne => "ne",
            Comparison::Lt => "lt",
            Comparison::Le => "le",
            Comparison::Gt => "gt",
            Comparison::Ge => "ge",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Doc,
    Count,
    Empty,
    Exists,
    Not,
    Boolean,
    Data,
    String,
    Sum,
    Avg,
    Min,
    Max,
    StringLength,
    Concat,
    Contains,
    TypedValue,
    StringValue,
    DistinctDocOrder,
    ItemSeqToNodeSeq,
    ItemSeqToUntyped,
    Plus,
    Minus,
    Times,
    Div,
    IDiv,
    Mod,
    Negate,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

const ALL: &[Builtin] = &[
    Builtin::Doc,
    Builtin::Count,
    Builtin::Empty,
    Builtin::Exists,
    Builtin::Not,
    Builtin::Boolean,
    Builtin::Data,
    Builtin::String,
    Builtin::Sum,
    Builtin::Avg,
    Builtin::Min,
    Builtin::Max,
    Builtin::StringLength,
    Builtin::Concat,
    Builtin::Contains,
    Builtin::TypedValue,
    Builtin::StringValue,
    Builtin::DistinctDocOrder,
    Builtin::ItemSeqToNodeSeq,
    Builtin::ItemSeqToUntyped,
    Builtin::Plus,
    Builtin::Minus,
    Builtin::Times,
    Builtin::Div,
    Builtin::IDiv,
    Builtin::Mod,
    Builtin::Negate,
    Builtin::Eq,
    Builtin::Ne,
    Builtin::Lt,
    Builtin::Le,
    Builtin::Gt,
    Builtin::Ge,
];

impl Builtin {
    /// Prefixed name as it appears in Core dumps (`fn:`, `op:`, `pf:`).
    pub fn qname(self) -> (&'static str, &'static str) {
        use Builtin::*;
        match self {
            Doc => ("fn", "doc"),
            Count => ("fn", "count"),
            Empty => ("fn", "empty"),
            Exists => ("fn", "exists"),
            Not => ("fn", "not"),
            Boolean => ("fn", "boolean"),
            Data => ("fn", "data"),
            String => ("fn", "string"),
            Sum => ("fn", "sum"),
            Avg => ("fn", "avg"),
            Min => ("fn", "min"),
            Max => ("fn", "max"),
            StringLength => ("fn", "string-length"),
            Concat => ("fn", "concat"),
            Contains => ("fn", "contains"),
            TypedValue => ("pf", "typed-value"),
            StringValue => ("pf", "string-value"),
            DistinctDocOrder => ("pf", "distinct-doc-order"),
            ItemSeqToNodeSeq => ("pf", "item-sequence-to-node-sequence"),
            ItemSeqToUntyped => ("pf", "item-sequence-to-untypedAtomic"),
            Plus => ("op", "plus"),
            Minus => ("op", "minus"),
            Times => ("op", "times"),
            Div => ("op", "div"),
            IDiv => ("op", "idiv"),
            Mod => ("op", "mod"),
            Negate => ("op", "negate"),
            Eq => ("op", "eq"),
            Ne => ("op", "ne"),
            Lt => ("op", "lt"),
            Le => ("op", "le"),
            Gt => ("op", "gt"),
            Ge => ("op", "ge"),
        }
    }

    pub fn lookup(prefix: &str, local: &str) -> Option<Builtin> {
        ALL.iter().copied().find(|b| b.qname() == (prefix, local))
    }

    /// `(min, max)` number of arguments; `None` max means variadic.
    pub fn arity(self) -> (usize, Option<usize>) {
        use Builtin::*;
        match self {
            Concat => (2, None),
            Contains | Plus | Minus | Times | Div | IDiv | Mod | Eq | Ne | Lt | Le | Gt | Ge => (2, Some(2)),
            _ => (1, Some(1)),
        }
    }

    pub fn comparison(self) -> Option<Comparison> {
        match self {
            Builtin::Eq => Some(Comparison::Eq),
            Builtin::Ne => Some(Comparison::Ne),
            Builtin::Lt => Some(Comparison::Lt),
            Builtin::Le => Some(Comparison::Le),
            Builtin::Gt => Some(Comparison::Gt),
            Builtin::Ge => Some(Comparison::Ge),
            _ => None,
        }
    }

    pub fn from_comparison(cmp: Comparison) -> Builtin {
        match cmp {
            Comparison::Eq => Builtin::Eq,
            Comparison::Ne => Builtin::Ne,
            Comparison::Lt => Builtin::Lt,
            Comparison::Le => Builtin::Le,
            Comparison::Gt => Builtin::Gt,
            Comparison::Ge => Builtin::Ge,
        }
    }

    pub fn arithmetic(self) -> Option<ArithOp> {
        match self {
            Builtin::Plus => Some(ArithOp::Add),
            Builtin::Minus => Some(ArithOp::Sub),
            Builtin::Times => Some(ArithOp::Mul),
            Builtin::Div => Some(ArithOp::Div),
            Builtin::IDiv => Some(ArithOp::IDiv),
            Builtin::Mod => Some(ArithOp::Mod),
            _ => None,
        }
    }

    /// Result type given the argument types; the minimal typing used by
    /// [`crate::core::CoreBuilder`] and by the simplifier when it rebuilds calls.
    pub fn result_type(self, args: &[SeqType]) -> SeqType {
        use Builtin::*;
        let arg = |i: usize| args.get(i).copied().unwrap_or(SeqType::Empty);
        let both_one = args.iter().all(SeqType::is_exactly_one);
        let one_or_opt = |t: SeqType| {
            if both_one { t } else { t.with_occurrence(Occurrence::Optional) }
        };
        match self {
            Doc => SeqType::opt(ItemType::Node(NodeType::Document)),
            Count | StringLength => SeqType::integer(),
            Empty | Exists | Not | Boolean | Contains => SeqType::boolean(),
            Data | TypedValue => match arg(0) {
                SeqType::Empty => SeqType::Empty,
                SeqType::Items(i, o) => SeqType::Items(i.atomized(), o),
            },
            String | StringValue | Concat => SeqType::string(),
            Sum => match arg(0) {
                SeqType::Empty => SeqType::integer(),
                t => SeqType::atomic(untyped_as_double(t.uniform_atomic().unwrap_or(AtomicType::Double))),
            },
            Avg => {
                let a = match arg(0).uniform_atomic() {
                    Some(AtomicType::Integer) => AtomicType::Decimal,
                    Some(AtomicType::Decimal) => AtomicType::Decimal,
                    _ => AtomicType::Double,
                };
                SeqType::opt(ItemType::Atomic(a))
            }
            Min | Max => match arg(0) {
                SeqType::Empty => SeqType::Empty,
                SeqType::Items(i, _) => match i.atomized() {
                    ItemType::Atomic(a) => SeqType::opt(ItemType::Atomic(untyped_as_double(a))),
                    other => SeqType::opt(other),
                },
            },
            DistinctDocOrder => match arg(0) {
                SeqType::Empty => SeqType::Empty,
                SeqType::Items(i, _) => SeqType::star(i),
            },
            ItemSeqToNodeSeq => match arg(0) {
                SeqType::Empty => SeqType::Empty,
                SeqType::Items(i, o) if i.is_node() => SeqType::Items(i, o),
                SeqType::Items(_, o) => SeqType::Items(ItemType::Node(NodeType::Any), o),
            },
            ItemSeqToUntyped => SeqType::atomic(AtomicType::UntypedAtomic),
            Plus | Minus | Times | Div | IDiv | Mod => {
                if args.iter().any(SeqType::is_empty) {
                    return SeqType::Empty;
                }
                let a = arg(0).uniform_atomic().unwrap_or(AtomicType::Double);
                let b = arg(1).uniform_atomic().unwrap_or(AtomicType::Double);
                let common = a.promote(b).unwrap_or(AtomicType::Double);
                let result = match self {
                    Div if common == AtomicType::Integer => AtomicType::Decimal,
                    IDiv => AtomicType::Integer,
                    _ => common,
                };
                one_or_opt(SeqType::atomic(result))
            }
            Negate => match arg(0) {
                SeqType::Empty => SeqType::Empty,
                t => t,
            },
            Eq | Ne | Lt | Le | Gt | Ge => {
                if args.iter().any(SeqType::is_empty) {
                    return SeqType::Empty;
                }
                one_or_opt(SeqType::boolean())
            }
        }
    }
}

/// Aggregates compare and add untyped values as doubles.
fn untyped_as_double(a: AtomicType) -> AtomicType {
    if a == AtomicType::UntypedAtomic { AtomicType::Double } else { a }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (p, l) = self.qname();
        write!(f, "{p}:{l}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunRef {
    Builtin(Builtin),
    User(FunId),
}
