use std::fmt;
use std::sync::Arc;

/// Which side of the compiler a failure belongs to.
///
/// `Internal` errors mean an earlier pass broke one of its invariants; they
/// are never the user's fault and are never degraded into a partial result.
/// `Query` errors describe a query shape this backend cannot or must not
/// compile and carry a W3C error code the user can look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Internal,
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Arithmetic
    FOAR0001, // divide by zero
    FOAR0002, // numeric overflow
    // Casting / values
    FORG0001, // invalid value for cast
    FORG0006, // invalid argument type (effective boolean value)
    FODC0002, // error retrieving resource
    // Type errors
    XPTY0004,
    XPTY0019, // path step applied to a non-node
    // Static errors
    XPST0017, // unknown function
    XPST0080, // typeswitch not decidable at compile time
    XQST0070, // malformed axis / node test combination
    XQST0054, // global variable depends on itself
    // Constructors
    XQDY0025, // duplicate attribute name
    // Backend invariants
    PFIN0001, // scope or variable lookup failure
    PFIN0002, // malformed Core tree
    PFIN0003, // join descriptor violates its precondition
    NYI0000,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FOAR0001 => "FOAR0001",
            ErrorCode::FOAR0002 => "FOAR0002",
            ErrorCode::FORG0001 => "FORG0001",
            ErrorCode::FORG0006 => "FORG0006",
            ErrorCode::FODC0002 => "FODC0002",
            ErrorCode::XPTY0004 => "XPTY0004",
            ErrorCode::XPTY0019 => "XPTY0019",
            ErrorCode::XPST0017 => "XPST0017",
            ErrorCode::XPST0080 => "XPST0080",
            ErrorCode::XQST0070 => "XQST0070",
            ErrorCode::XQST0054 => "XQST0054",
            ErrorCode::XQDY0025 => "XQDY0025",
            ErrorCode::PFIN0001 => "PFIN0001",
            ErrorCode::PFIN0002 => "PFIN0002",
            ErrorCode::PFIN0003 => "PFIN0003",
            ErrorCode::NYI0000 => "NYI0000",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    pub fn from_code(s: &str) -> Self {
        use ErrorCode::*;
        match s.strip_prefix("err:").unwrap_or(s) {
            "FOAR0001" => FOAR0001,
            "FOAR0002" => FOAR0002,
            "FORG0001" => FORG0001,
            "FORG0006" => FORG0006,
            "FODC0002" => FODC0002,
            "XPTY0004" => XPTY0004,
            "XPTY0019" => XPTY0019,
            "XPST0017" => XPST0017,
            "XPST0080" => XPST0080,
            "XQST0070" => XQST0070,
            "XQST0054" => XQST0054,
            "XQDY0025" => XQDY0025,
            "PFIN0001" => PFIN0001,
            "PFIN0002" => PFIN0002,
            "PFIN0003" => PFIN0003,
            "NYI0000" => NYI0000,
            _ => Unknown,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorCode::PFIN0001 | ErrorCode::PFIN0002 | ErrorCode::PFIN0003 => {
                ErrorClass::Internal
            }
            _ => ErrorClass::Query,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "err:{}", self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn from_code(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self { code, message: msg.into(), source: None }
    }

    /// An unrecoverable invariant violation (scope lookup failure, malformed tree).
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::PFIN0001, msg)
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::PFIN0002, msg)
    }

    pub fn not_implemented(feature: &str) -> Self {
        Self::from_code(ErrorCode::NYI0000, format!("not implemented: {feature}"))
    }

    pub fn with_source(
        mut self,
        source: impl Into<Option<Arc<dyn std::error::Error + Send + Sync>>>,
    ) -> Self {
        self.source = source.into();
        self
    }

    pub fn class(&self) -> ErrorClass {
        self.code.class()
    }

    pub fn is_internal(&self) -> bool {
        self.class() == ErrorClass::Internal
    }

    pub fn format_code(&self) -> String {
        self.code.to_string()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class() {
            ErrorClass::Internal => write!(f, "internal error: {} ({})", self.message, self.code),
            ErrorClass::Query => write!(f, "error: {} ({})", self.message, self.code),
        }
    }
}

impl From<std::fmt::Error> for Error {
    fn from(e: std::fmt::Error) -> Self {
        Error::malformed("formatting failed").with_source(Some(Arc::new(e) as Arc<_>))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_codes_are_classified() {
        assert_eq!(ErrorCode::PFIN0001.class(), ErrorClass::Internal);
        assert_eq!(ErrorCode::XQDY0025.class(), ErrorClass::Query);
        assert!(Error::internal("lost scope").is_internal());
    }

    #[test]
    fn code_round_trips_through_text() {
        for code in [ErrorCode::FOAR0001, ErrorCode::XPST0080, ErrorCode::PFIN0003] {
            assert_eq!(ErrorCode::from_code(&code.to_string()), code);
        }
        assert_eq!(ErrorCode::from_code("nope"), ErrorCode::Unknown);
    }
}
