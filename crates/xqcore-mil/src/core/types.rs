//! Static sequence types attached to every Core node.
//!
//! The lattice is deliberately small: the upstream checker has already
//! validated the query, so the backend only needs enough precision to pick
//! value containers, elide casts and decide typeswitch cases.
//!
//! `xs:integer` is kept disjoint from `xs:decimal` here. The two live in
//! different value containers, so treating one as a subtype of the other
//! would let the simplifier drop a cast that changes the physical layout.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicType {
    Boolean,
    Integer,
    Decimal,
    Double,
    String,
    UntypedAtomic,
    QName,
}

impl AtomicType {
    pub fn is_numeric(self) -> bool {
        matches!(self, AtomicType::Integer | AtomicType::Decimal | AtomicType::Double)
    }

    pub fn name(self) -> &'static str {
        match self {
            AtomicType::Boolean => "xs:boolean",
            AtomicType::Integer => "xs:integer",
            AtomicType::Decimal => "xs:decimal",
            AtomicType::Double => "xs:double",
            AtomicType::String => "xs:string",
            AtomicType::UntypedAtomic => "xs:untypedAtomic",
            AtomicType::QName => "xs:QName",
        }
    }

    /// Static cast matrix (XQuery 1.0 §17.1 restricted to the supported domains).
    pub fn castable_to(self, target: AtomicType) -> bool {
        use AtomicType::*;
        match (self, target) {
            (a, b) if a == b => true,
            (_, String | UntypedAtomic) => true,
            (String | UntypedAtomic, _) => true,
            (QName, _) => false,
            (_, QName) => false,
            (Boolean | Integer | Decimal | Double, Boolean | Integer | Decimal | Double) => true,
        }
    }

    /// Numeric promotion: the common type two numeric operands meet at.
    pub fn promote(self, other: AtomicType) -> Option<AtomicType> {
        use AtomicType::*;
        let norm = |t: AtomicType| if t == UntypedAtomic { Double } else { t };
        match (norm(self), norm(other)) {
            (a, b) if a == b => Some(a),
            (Double, b) | (b, Double) if b.is_numeric() => Some(Double),
            (Decimal, Integer) | (Integer, Decimal) => Some(Decimal),
            _ => None,
        }
    }

    /// Type both operands of a value comparison are cast to.
    pub fn comparison_domain(self, other: AtomicType) -> Option<AtomicType> {
        use AtomicType::*;
        match (self, other) {
            (UntypedAtomic | String, UntypedAtomic | String) => Some(String),
            (UntypedAtomic, t) | (t, UntypedAtomic) if t.is_numeric() => Some(Double),
            (UntypedAtomic, t) | (t, UntypedAtomic) => Some(t),
            (a, b) if a == b => Some(a),
            (a, b) if a.is_numeric() && b.is_numeric() => a.promote(b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Any,
    Document,
    Element,
    Attribute,
    Text,
}

impl NodeType {
    pub fn name(self) -> &'static str {
        match self {
            NodeType::Any => "node()",
            NodeType::Document => "document-node()",
            NodeType::Element => "element()",
            NodeType::Attribute => "attribute()",
            NodeType::Text => "text()",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    Item,
    AnyAtomic,
    Numeric,
    Atomic(AtomicType),
    Node(NodeType),
}

impl ItemType {
    pub fn is_subtype_of(self, other: ItemType) -> bool {
        use ItemType::*;
        match (self, other) {
            (a, b) if a == b => true,
            (_, Item) => true,
            (Numeric | Atomic(_), AnyAtomic) => true,
            (Atomic(a), Numeric) => a.is_numeric(),
            (Node(_), Node(NodeType::Any)) => true,
            _ => false,
        }
    }

    /// The lattice is a tree, so two types share instances only when one
    /// contains the other.
    pub fn is_disjoint_from(self, other: ItemType) -> bool {
        !self.is_subtype_of(other) && !other.is_subtype_of(self)
    }

    pub fn lub(self, other: ItemType) -> ItemType {
        use ItemType::*;
        if self.is_subtype_of(other) {
            return other;
        }
        if other.is_subtype_of(self) {
            return self;
        }
        match (self, other) {
            (a, b) if a.is_subtype_of(Numeric) && b.is_subtype_of(Numeric) => Numeric,
            (a, b) if a.is_atomic() && b.is_atomic() => AnyAtomic,
            (Node(_), Node(_)) => Node(NodeType::Any),
            _ => Item,
        }
    }

    pub fn is_atomic(self) -> bool {
        matches!(self, ItemType::AnyAtomic | ItemType::Numeric | ItemType::Atomic(_))
    }

    pub fn is_node(self) -> bool {
        matches!(self, ItemType::Node(_))
    }

    pub fn atomic(self) -> Option<AtomicType> {
        match self {
            ItemType::Atomic(a) => Some(a),
            _ => None,
        }
    }

    /// Item type after atomization (`fn:data`).
    pub fn atomized(self) -> ItemType {
        match self {
            ItemType::Node(_) => ItemType::Atomic(AtomicType::UntypedAtomic),
            ItemType::Item => ItemType::AnyAtomic,
            other => other,
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemType::Item => f.write_str("item()"),
            ItemType::AnyAtomic => f.write_str("xs:anyAtomicType"),
            ItemType::Numeric => f.write_str("numeric"),
            ItemType::Atomic(a) => f.write_str(a.name()),
            ItemType::Node(n) => f.write_str(n.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Occurrence {
    One,
    Optional,
    Star,
    Plus,
}

impl Occurrence {
    pub fn allows_empty(self) -> bool {
        matches!(self, Occurrence::Optional | Occurrence::Star)
    }

    pub fn allows_many(self) -> bool {
        matches!(self, Occurrence::Star | Occurrence::Plus)
    }

    fn from_flags(empty: bool, many: bool) -> Occurrence {
        match (empty, many) {
            (false, false) => Occurrence::One,
            (true, false) => Occurrence::Optional,
            (true, true) => Occurrence::Star,
            (false, true) => Occurrence::Plus,
        }
    }

    pub fn is_sub_occurrence_of(self, other: Occurrence) -> bool {
        (!self.allows_empty() || other.allows_empty()) && (!self.allows_many() || other.allows_many())
    }

    /// Either of the two (conditional branches).
    pub fn union(self, other: Occurrence) -> Occurrence {
        Self::from_flags(
            self.allows_empty() || other.allows_empty(),
            self.allows_many() || other.allows_many(),
        )
    }

    /// One after the other (sequence concatenation).
    pub fn concat(self, other: Occurrence) -> Occurrence {
        Self::from_flags(self.allows_empty() && other.allows_empty(), true)
    }

    /// `other` repeated once per item of `self` (for-iteration).
    pub fn product(self, other: Occurrence) -> Occurrence {
        Self::from_flags(
            self.allows_empty() || other.allows_empty(),
            self.allows_many() || other.allows_many(),
        )
    }

    pub fn indicator(self) -> &'static str {
        match self {
            Occurrence::One => "",
            Occurrence::Optional => "?",
            Occurrence::Star => "*",
            Occurrence::Plus => "+",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeqType {
    Empty,
    Items(ItemType, Occurrence),
}

impl SeqType {
    pub fn one(item: ItemType) -> Self {
        SeqType::Items(item, Occurrence::One)
    }
    pub fn opt(item: ItemType) -> Self {
        SeqType::Items(item, Occurrence::Optional)
    }
    pub fn star(item: ItemType) -> Self {
        SeqType::Items(item, Occurrence::Star)
    }
    pub fn plus(item: ItemType) -> Self {
        SeqType::Items(item, Occurrence::Plus)
    }
    pub fn atomic(a: AtomicType) -> Self {
        SeqType::one(ItemType::Atomic(a))
    }
    pub fn boolean() -> Self {
        Self::atomic(AtomicType::Boolean)
    }
    pub fn integer() -> Self {
        Self::atomic(AtomicType::Integer)
    }
    pub fn string() -> Self {
        Self::atomic(AtomicType::String)
    }
    pub fn node(n: NodeType) -> Self {
        SeqType::one(ItemType::Node(n))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, SeqType::Empty)
    }

    /// The prime (item) type; `None` for the empty sequence.
    pub fn item(&self) -> Option<ItemType> {
        match self {
            SeqType::Empty => None,
            SeqType::Items(i, _) => Some(*i),
        }
    }

    pub fn occurrence(&self) -> Option<Occurrence> {
        match self {
            SeqType::Empty => None,
            SeqType::Items(_, o) => Some(*o),
        }
    }

    pub fn with_occurrence(&self, occ: Occurrence) -> SeqType {
        match self {
            SeqType::Empty => SeqType::Empty,
            SeqType::Items(i, _) => SeqType::Items(*i, occ),
        }
    }

    pub fn is_exactly_one(&self) -> bool {
        matches!(self, SeqType::Items(_, Occurrence::One))
    }

    /// At most one item.
    pub fn is_singleton_or_empty(&self) -> bool {
        match self {
            SeqType::Empty => true,
            SeqType::Items(_, o) => !o.allows_many(),
        }
    }

    pub fn may_be_empty(&self) -> bool {
        match self {
            SeqType::Empty => true,
            SeqType::Items(_, o) => o.allows_empty(),
        }
    }

    /// Atomic type shared by every item, if statically uniform.
    pub fn uniform_atomic(&self) -> Option<AtomicType> {
        self.item().and_then(ItemType::atomic)
    }

    pub fn is_node_sequence(&self) -> bool {
        match self {
            SeqType::Empty => true,
            SeqType::Items(i, _) => i.is_node(),
        }
    }

    pub fn is_atomic_sequence(&self) -> bool {
        match self {
            SeqType::Empty => true,
            SeqType::Items(i, _) => i.is_atomic(),
        }
    }

    pub fn may_contain_nodes(&self) -> bool {
        match self {
            SeqType::Empty => false,
            SeqType::Items(i, _) => !i.is_atomic(),
        }
    }

    pub fn is_subtype_of(&self, other: &SeqType) -> bool {
        match (self, other) {
            (SeqType::Empty, SeqType::Empty) => true,
            (SeqType::Empty, SeqType::Items(_, o)) => o.allows_empty(),
            (SeqType::Items(..), SeqType::Empty) => false,
            (SeqType::Items(i1, o1), SeqType::Items(i2, o2)) => {
                i1.is_subtype_of(*i2) && o1.is_sub_occurrence_of(*o2)
            }
        }
    }

    /// No value can be an instance of both types.
    pub fn is_disjoint_from(&self, other: &SeqType) -> bool {
        if self.may_be_empty() && other.may_be_empty() {
            return false;
        }
        match (self, other) {
            (SeqType::Empty, _) | (_, SeqType::Empty) => true,
            (SeqType::Items(i1, _), SeqType::Items(i2, _)) => i1.is_disjoint_from(*i2),
        }
    }

    /// Type of `(a, b)`.
    pub fn concat(&self, other: &SeqType) -> SeqType {
        match (self, other) {
            (SeqType::Empty, t) | (t, SeqType::Empty) => *t,
            (SeqType::Items(i1, o1), SeqType::Items(i2, o2)) => SeqType::Items(i1.lub(*i2), o1.concat(*o2)),
        }
    }

    /// Type of `if (..) then a else b`.
    pub fn alternative(&self, other: &SeqType) -> SeqType {
        match (self, other) {
            (SeqType::Empty, SeqType::Empty) => SeqType::Empty,
            (SeqType::Empty, SeqType::Items(i, o)) | (SeqType::Items(i, o), SeqType::Empty) => {
                SeqType::Items(*i, o.union(Occurrence::Optional))
            }
            (SeqType::Items(i1, o1), SeqType::Items(i2, o2)) => SeqType::Items(i1.lub(*i2), o1.union(*o2)),
        }
    }

    /// Type of `for $x in self return body` where `body` has type `body`.
    pub fn iterate(&self, body: &SeqType) -> SeqType {
        match (self, body) {
            (SeqType::Empty, _) | (_, SeqType::Empty) => SeqType::Empty,
            (SeqType::Items(_, o1), SeqType::Items(i, o2)) => SeqType::Items(*i, o1.product(*o2)),
        }
    }
}

impl fmt::Display for SeqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeqType::Empty => f.write_str("empty-sequence()"),
            SeqType::Items(i, o) => write!(f, "{i}{}", o.indicator()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_is_subtype_of_star() {
        let a = SeqType::opt(ItemType::Atomic(AtomicType::Integer));
        let b = SeqType::star(ItemType::Numeric);
        assert!(a.is_subtype_of(&b));
        assert!(!b.is_subtype_of(&a));
        assert!(SeqType::Empty.is_subtype_of(&b));
    }

    #[test]
    fn lub_climbs_the_lattice() {
        let int = ItemType::Atomic(AtomicType::Integer);
        let dbl = ItemType::Atomic(AtomicType::Double);
        let s = ItemType::Atomic(AtomicType::String);
        assert_eq!(int.lub(dbl), ItemType::Numeric);
        assert_eq!(int.lub(s), ItemType::AnyAtomic);
        assert_eq!(int.lub(ItemType::Node(NodeType::Text)), ItemType::Item);
    }

    #[test]
    fn disjointness_respects_empty_sequence() {
        let ints = SeqType::star(ItemType::Atomic(AtomicType::Integer));
        let strs = SeqType::star(ItemType::Atomic(AtomicType::String));
        assert!(!ints.is_disjoint_from(&strs));
        assert!(SeqType::integer().is_disjoint_from(&SeqType::string()));
    }

    #[test]
    fn promotion() {
        use AtomicType::*;
        assert_eq!(Integer.promote(Decimal), Some(Decimal));
        assert_eq!(Integer.promote(UntypedAtomic), Some(Double));
        assert_eq!(String.promote(Integer), None);
        assert_eq!(UntypedAtomic.comparison_domain(UntypedAtomic), Some(String));
        assert_eq!(UntypedAtomic.comparison_domain(Integer), Some(Double));
        assert_eq!(Boolean.comparison_domain(Integer), None);
    }
}
