//! Ground terms for the fact arena and the logic engine.

use serde::{Deserialize, Serialize};

/// A ground value appearing as a fact argument.
///
/// Atoms are bare lowercase symbols (`panic`, `survived`); strings carry
/// arbitrary text (names, hashes, payloads); numbers split into integer
/// and float to keep comparisons exact where the schema is integral.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Term {
    Atom(String),
    Str(String),
    Int(i64),
    Float(f64),
}

impl Term {
    pub fn atom(s: impl Into<String>) -> Self {
        Term::Atom(s.into())
    }

    pub fn str(s: impl Into<String>) -> Self {
        Term::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Term::Atom(s) | Term::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Term::Int(n) => Some(*n as f64),
            Term::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Numeric comparison across Int/Float; `None` for non-numbers or
    /// mixed text/number pairs.
    pub fn numeric_cmp(&self, other: &Term) -> Option<std::cmp::Ordering> {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        }
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Term::Atom(a), Term::Atom(b)) => a == b,
            (Term::Str(a), Term::Str(b)) => a == b,
            (Term::Int(a), Term::Int(b)) => a == b,
            (Term::Float(a), Term::Float(b)) => a.to_bits() == b.to_bits(),
            // Ints and floats compare equal when they denote the same number;
            // rules mix them freely (stability is float, counters are int).
            (Term::Int(a), Term::Float(b)) | (Term::Float(b), Term::Int(a)) => {
                (*a as f64).to_bits() == b.to_bits()
            }
            _ => false,
        }
    }
}

impl Eq for Term {}

impl std::hash::Hash for Term {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Term::Atom(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Term::Str(s) => {
                1u8.hash(state);
                s.hash(state);
            }
            Term::Int(n) => {
                2u8.hash(state);
                (*n as f64).to_bits().hash(state);
            }
            Term::Float(f) => {
                2u8.hash(state);
                f.to_bits().hash(state);
            }
        }
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::Atom(s) => write!(f, "{}", s),
            Term::Str(s) => write!(f, "{:?}", s),
            Term::Int(n) => write!(f, "{}", n),
            Term::Float(x) => write!(f, "{}", x),
        }
    }
}

impl From<&str> for Term {
    fn from(s: &str) -> Self {
        Term::Str(s.to_string())
    }
}

impl From<String> for Term {
    fn from(s: String) -> Self {
        Term::Str(s)
    }
}

impl From<i64> for Term {
    fn from(n: i64) -> Self {
        Term::Int(n)
    }
}

impl From<f64> for Term {
    fn from(x: f64) -> Self {
        Term::Float(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_numeric_equality() {
        assert_eq!(Term::Int(3), Term::Float(3.0));
        assert_ne!(Term::Int(3), Term::Float(3.5));
    }

    #[test]
    fn atoms_and_strings_are_distinct() {
        assert_ne!(Term::atom("panic"), Term::str("panic"));
    }

    #[test]
    fn display_quotes_strings_only() {
        assert_eq!(Term::atom("survived").to_string(), "survived");
        assert_eq!(Term::str("abc").to_string(), "\"abc\"");
    }

    #[test]
    fn numeric_cmp_spans_int_and_float() {
        use std::cmp::Ordering;
        assert_eq!(Term::Int(2).numeric_cmp(&Term::Float(2.5)), Some(Ordering::Less));
        assert_eq!(Term::str("x").numeric_cmp(&Term::Int(1)), None);
    }
}
