//! Atom-level semantics of the column algebra: ordering, hashing, casts and
//! scalar arithmetic.
use std::cmp::Ordering;
use std::rc::Rc;

use compact_str::{CompactString, ToCompactString, format_compact};

use super::ExecError;
use crate::mil::{Atom, BinOp, UnOp};
use crate::runtime::ErrorCode;

pub type Column = Rc<Vec<Atom>>;

/// What a MIL variable holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Atom),
    Column(Column),
    Tuple(Vec<Column>),
}

impl Value {
    pub fn column(v: Vec<Atom>) -> Value {
        Value::Column(Rc::new(v))
    }

    pub fn as_column(&self) -> Result<Column, ExecError> {
        match self {
            Value::Column(c) => Ok(Rc::clone(c)),
            Value::Scalar(a) => Ok(Rc::new(vec![a.clone()])),
            Value::Tuple(_) => Err(ExecError::internal("tuple used where a column was expected")),
        }
    }

    pub fn as_scalar(&self) -> Result<Atom, ExecError> {
        match self {
            Value::Scalar(a) => Ok(a.clone()),
            Value::Column(c) if c.len() == 1 => Ok(c[0].clone()),
            _ => Err(ExecError::internal("column used where a scalar was expected")),
        }
    }

    pub fn as_tuple(&self) -> Result<&[Column], ExecError> {
        match self {
            Value::Tuple(t) => Ok(t),
            _ => Err(ExecError::internal("tuple expected")),
        }
    }
}

/// Hashable identity of an atom; integral doubles meet their integer twin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AtomKey {
    Nil,
    Oid(u64),
    Int(i64),
    Dbl(u64),
    Str(CompactString),
    Bit(bool),
}

impl From<&Atom> for AtomKey {
    fn from(a: &Atom) -> Self {
        match a {
            Atom::Nil => AtomKey::Nil,
            Atom::Oid(o) => AtomKey::Oid(*o),
            Atom::Int(i) => AtomKey::Int(*i),
            Atom::Dbl(d) if d.fract() == 0.0 && d.abs() < 9.0e15 => AtomKey::Int(*d as i64),
            Atom::Dbl(d) => AtomKey::Dbl(d.to_bits()),
            Atom::Str(s) => AtomKey::Str(s.clone()),
            Atom::Bit(b) => AtomKey::Bit(*b),
        }
    }
}

fn as_f64(a: &Atom) -> Option<f64> {
    match a {
        Atom::Int(i) => Some(*i as f64),
        Atom::Dbl(d) => Some(*d),
        Atom::Oid(o) => Some(*o as f64),
        _ => None,
    }
}

/// Value comparison; `None` when the two atoms are incomparable (or NaN is involved).
pub fn compare(a: &Atom, b: &Atom) -> Option<Ordering> {
    match (a, b) {
        (Atom::Nil, Atom::Nil) => Some(Ordering::Equal),
        (Atom::Nil, _) => Some(Ordering::Less),
        (_, Atom::Nil) => Some(Ordering::Greater),
        (Atom::Int(x), Atom::Int(y)) => Some(x.cmp(y)),
        (Atom::Oid(x), Atom::Oid(y)) => Some(x.cmp(y)),
        (Atom::Str(x), Atom::Str(y)) => Some(x.cmp(y)),
        (Atom::Bit(x), Atom::Bit(y)) => Some(x.cmp(y)),
        (x, y) => match (as_f64(x), as_f64(y)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

fn type_rank(a: &Atom) -> u8 {
    match a {
        Atom::Nil => 0,
        Atom::Bit(_) => 1,
        Atom::Oid(_) | Atom::Int(_) | Atom::Dbl(_) => 2,
        Atom::Str(_) => 3,
    }
}

/// Total order used by sorting: nil first, NaN before the other numbers,
/// incomparable domains by a fixed rank.
pub fn sort_order(a: &Atom, b: &Atom) -> Ordering {
    if let Some(o) = compare(a, b) {
        return o;
    }
    match (a, b) {
        (Atom::Dbl(x), Atom::Dbl(y)) => x.is_nan().cmp(&y.is_nan()).reverse(),
        (Atom::Dbl(x), _) if x.is_nan() => Ordering::Less,
        (_, Atom::Dbl(y)) if y.is_nan() => Ordering::Greater,
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// `xs:double` canonical form: no exponent in `[1e-6, 1e6)`, integral values without a fraction.
pub fn format_double(d: f64) -> CompactString {
    if d.is_nan() {
        return CompactString::const_new("NaN");
    }
    if d.is_infinite() {
        return CompactString::const_new(if d > 0.0 { "INF" } else { "-INF" });
    }
    if d == 0.0 {
        return CompactString::const_new(if d.is_sign_negative() { "-0" } else { "0" });
    }
    if (1e-6..1e6).contains(&d.abs()) {
        return d.to_compact_string();
    }
    let s = format!("{d:E}");
    match s.split_once('E') {
        Some((m, e)) if !m.contains('.') => format_compact!("{m}.0E{e}"),
        _ => CompactString::from(s),
    }
}

pub fn format_decimal(d: f64) -> CompactString {
    if d == 0.0 { CompactString::const_new("0") } else { d.to_compact_string() }
}

pub fn to_string(a: &Atom) -> Atom {
    match a {
        Atom::Nil => Atom::Nil,
        Atom::Str(s) => Atom::Str(s.clone()),
        Atom::Int(i) => Atom::Str(i.to_compact_string()),
        Atom::Oid(o) => Atom::Str(o.to_compact_string()),
        Atom::Dbl(d) => Atom::Str(format_double(*d)),
        Atom::Bit(b) => Atom::str(if *b { "true" } else { "false" }),
    }
}

fn parse_double(s: &str) -> Option<f64> {
    match s {
        "NaN" => Some(f64::NAN),
        "INF" | "+INF" => Some(f64::INFINITY),
        "-INF" => Some(f64::NEG_INFINITY),
        _ => {
            let lower = s.to_ascii_lowercase();
            if lower.contains("inf") || lower.contains("nan") {
                return None;
            }
            s.parse().ok()
        }
    }
}

/// Apply a cast or scalar function; casts map values outside the target domain to nil.
pub fn unary(op: UnOp, a: &Atom) -> Result<Atom, ExecError> {
    if a.is_nil() {
        return Ok(match op {
            UnOp::IsNil => Atom::Bit(true),
            _ => Atom::Nil,
        });
    }
    Ok(match op {
        UnOp::IsNil => Atom::Bit(false),
        UnOp::Not => match a {
            Atom::Bit(b) => Atom::Bit(!b),
            _ => return Err(ExecError::internal("not() over a non-bit")),
        },
        UnOp::Neg => match a {
            Atom::Int(i) => Atom::Int(i.checked_neg().ok_or_else(overflow)?),
            Atom::Dbl(d) => Atom::Dbl(-d),
            _ => return Err(ExecError::dynamic(ErrorCode::XPTY0004, "negation of a non-numeric value")),
        },
        UnOp::ToInt => match a {
            Atom::Int(_) => a.clone(),
            Atom::Oid(o) => i64::try_from(*o).map_or(Atom::Nil, Atom::Int),
            Atom::Dbl(d) if d.is_finite() && d.abs() < 9.2e18 => Atom::Int(d.trunc() as i64),
            Atom::Dbl(_) => Atom::Nil,
            Atom::Str(s) => s.trim().parse::<i64>().map_or(Atom::Nil, Atom::Int),
            Atom::Bit(b) => Atom::Int(i64::from(*b)),
            Atom::Nil => Atom::Nil,
        },
        UnOp::ToDbl => match a {
            Atom::Dbl(_) => a.clone(),
            Atom::Int(i) => Atom::Dbl(*i as f64),
            Atom::Oid(o) => Atom::Dbl(*o as f64),
            Atom::Str(s) => parse_double(s.trim()).map_or(Atom::Nil, Atom::Dbl),
            Atom::Bit(b) => Atom::Dbl(if *b { 1.0 } else { 0.0 }),
            Atom::Nil => Atom::Nil,
        },
        UnOp::ToDec => match a {
            Atom::Dbl(d) if d.is_finite() => a.clone(),
            Atom::Dbl(_) => Atom::Nil,
            Atom::Int(i) => Atom::Dbl(*i as f64),
            Atom::Oid(o) => Atom::Dbl(*o as f64),
            Atom::Str(s) => {
                let t = s.trim();
                // decimals have neither exponent nor special values
                if t.is_empty() || t.contains(['e', 'E']) || parse_double(t).is_none_or(|d| !d.is_finite()) {
                    Atom::Nil
                } else {
                    parse_double(t).map_or(Atom::Nil, Atom::Dbl)
                }
            }
            Atom::Bit(b) => Atom::Dbl(if *b { 1.0 } else { 0.0 }),
            Atom::Nil => Atom::Nil,
        },
        UnOp::ToStr => to_string(a),
        UnOp::DecToStr => match a {
            Atom::Dbl(d) => Atom::Str(format_decimal(*d)),
            other => to_string(other),
        },
        UnOp::ToBit => match a {
            Atom::Bit(_) => a.clone(),
            Atom::Int(i) => Atom::Bit(*i != 0),
            Atom::Oid(o) => Atom::Bit(*o != 0),
            Atom::Dbl(d) => Atom::Bit(*d != 0.0 && !d.is_nan()),
            Atom::Str(s) => match s.trim() {
                "true" | "1" => Atom::Bit(true),
                "false" | "0" => Atom::Bit(false),
                _ => Atom::Nil,
            },
            Atom::Nil => Atom::Nil,
        },
        UnOp::OidToBit => match a {
            Atom::Oid(o) => Atom::Bit(*o != 0),
            other => other.clone(),
        },
        UnOp::BitToOid => match a {
            Atom::Bit(b) => Atom::Oid(u64::from(*b)),
            other => other.clone(),
        },
        UnOp::StrLen => match a {
            Atom::Str(s) => Atom::Int(s.chars().count() as i64),
            other => match to_string(other) {
                Atom::Str(s) => Atom::Int(s.chars().count() as i64),
                _ => Atom::Nil,
            },
        },
    })
}

fn overflow() -> ExecError {
    ExecError::dynamic(ErrorCode::FOAR0002, "integer overflow")
}

fn div_by_zero() -> ExecError {
    ExecError::dynamic(ErrorCode::FOAR0001, "division by zero")
}

fn is_zero(a: &Atom) -> bool {
    match a {
        Atom::Int(i) => *i == 0,
        Atom::Dbl(d) => *d == 0.0,
        _ => false,
    }
}

fn numeric(a: &Atom, b: &Atom, ints: impl Fn(i64, i64) -> Option<i64>, dbls: impl Fn(f64, f64) -> f64) -> Result<Atom, ExecError> {
    match (a, b) {
        (Atom::Int(x), Atom::Int(y)) => ints(*x, *y).map(Atom::Int).ok_or_else(overflow),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => Ok(Atom::Dbl(dbls(x, y))),
            _ => Err(ExecError::dynamic(ErrorCode::XPTY0004, "arithmetic on a non-numeric value")),
        },
    }
}

pub fn binary(op: BinOp, a: &Atom, b: &Atom) -> Result<Atom, ExecError> {
    if a.is_nil() || b.is_nil() {
        return Ok(Atom::Nil);
    }
    match op {
        BinOp::Add => numeric(a, b, i64::checked_add, |x, y| x + y),
        BinOp::Sub => numeric(a, b, i64::checked_sub, |x, y| x - y),
        BinOp::Mul => numeric(a, b, i64::checked_mul, |x, y| x * y),
        BinOp::Div | BinOp::DivChecked => {
            if op == BinOp::DivChecked && is_zero(b) {
                return Err(div_by_zero());
            }
            match (as_f64(a), as_f64(b)) {
                (Some(x), Some(y)) => Ok(Atom::Dbl(x / y)),
                _ => Err(ExecError::dynamic(ErrorCode::XPTY0004, "division of a non-numeric value")),
            }
        }
        BinOp::IDiv => {
            if is_zero(b) {
                return Err(div_by_zero());
            }
            match (a, b) {
                (Atom::Int(x), Atom::Int(y)) => x.checked_div(*y).map(Atom::Int).ok_or_else(overflow),
                _ => match (as_f64(a), as_f64(b)) {
                    (Some(x), Some(y)) => {
                        let q = (x / y).trunc();
                        if q.is_finite() && q.abs() < 9.2e18 { Ok(Atom::Int(q as i64)) } else { Err(overflow()) }
                    }
                    _ => Err(ExecError::dynamic(ErrorCode::XPTY0004, "idiv of a non-numeric value")),
                },
            }
        }
        BinOp::Mod | BinOp::ModChecked => {
            let int_zero = matches!((a, b), (Atom::Int(_), Atom::Int(0)));
            if int_zero || (op == BinOp::ModChecked && is_zero(b)) {
                return Err(div_by_zero());
            }
            numeric(a, b, i64::checked_rem, |x, y| x % y)
        }
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            if type_rank(a) != type_rank(b) {
                return Err(ExecError::dynamic(ErrorCode::XPTY0004, "comparison of incomparable values"));
            }
            let ord = compare(a, b);
            Ok(Atom::Bit(match op {
                BinOp::Eq => ord == Some(Ordering::Equal),
                BinOp::Ne => ord != Some(Ordering::Equal),
                BinOp::Lt => ord == Some(Ordering::Less),
                BinOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
                BinOp::Gt => ord == Some(Ordering::Greater),
                _ => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
            }))
        }
        BinOp::And | BinOp::Or => match (a, b) {
            (Atom::Bit(x), Atom::Bit(y)) => Ok(Atom::Bit(if op == BinOp::And { *x && *y } else { *x || *y })),
            _ => Err(ExecError::internal("boolean connective over non-bits")),
        },
        BinOp::Concat => match (to_string(a), to_string(b)) {
            (Atom::Str(x), Atom::Str(y)) => Ok(Atom::Str(format_compact!("{x}{y}"))),
            _ => Ok(Atom::Nil),
        },
        BinOp::Contains => match (to_string(a), to_string(b)) {
            (Atom::Str(x), Atom::Str(y)) => Ok(Atom::Bit(x.contains(y.as_str()))),
            _ => Ok(Atom::Nil),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_canonical_form() {
        assert_eq!(format_double(2.0), "2");
        assert_eq!(format_double(0.5), "0.5");
        assert_eq!(format_double(1e6), "1.0E6");
        assert_eq!(format_double(1.5e-7), "1.5E-7");
        assert_eq!(format_double(f64::NEG_INFINITY), "-INF");
    }

    #[test]
    fn casts_yield_nil_outside_the_domain() {
        assert_eq!(unary(UnOp::ToInt, &Atom::str(" 42 ")).ok(), Some(Atom::Int(42)));
        assert_eq!(unary(UnOp::ToInt, &Atom::str("4x")).ok(), Some(Atom::Nil));
        assert_eq!(unary(UnOp::ToDec, &Atom::str("INF")).ok(), Some(Atom::Nil));
        assert_eq!(unary(UnOp::ToDec, &Atom::str("1e3")).ok(), Some(Atom::Nil));
        assert_eq!(unary(UnOp::ToDbl, &Atom::str("1e3")).ok(), Some(Atom::Dbl(1000.0)));
        assert_eq!(unary(UnOp::ToDbl, &Atom::str("infinity")).ok(), Some(Atom::Nil));
        assert_eq!(unary(UnOp::ToBit, &Atom::str("1")).ok(), Some(Atom::Bit(true)));
        assert_eq!(unary(UnOp::ToBit, &Atom::str("yes")).ok(), Some(Atom::Nil));
    }

    #[test]
    fn integer_division_by_zero_is_an_error() {
        let err = binary(BinOp::IDiv, &Atom::Int(1), &Atom::Int(0));
        assert!(matches!(err, Err(ExecError::Dynamic { code: ErrorCode::FOAR0001, .. })));
        let ok = binary(BinOp::Div, &Atom::Dbl(1.0), &Atom::Dbl(0.0));
        assert_eq!(ok.ok(), Some(Atom::Dbl(f64::INFINITY)));
    }

    #[test]
    fn mixed_numeric_comparison() {
        assert_eq!(binary(BinOp::Eq, &Atom::Int(2), &Atom::Dbl(2.0)).ok(), Some(Atom::Bit(true)));
        assert!(binary(BinOp::Lt, &Atom::Int(2), &Atom::str("a")).is_err());
        assert_eq!(AtomKey::from(&Atom::Dbl(3.0)), AtomKey::from(&Atom::Int(3)));
    }
}
