//! Rule syntax tree for the embedded logic engine.
//!
//! Rules are Horn clauses over the fact schema:
//!
//! ```text
//! halt_reason(S, iterations_exhausted) :-
//!     iteration_count(S, N), max_iterations(M), N >= M.
//! ```
//!
//! Variables are capitalized, atoms lowercase, strings quoted. Bodies
//! may negate literals with `not`, compare bound terms, and bind
//! arithmetic results with `V is A op B`.

use crate::facts::Term;

/// A term as written in a rule: ground values plus variables.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleTerm {
    Var(String),
    /// Anonymous variable `_`; never binds.
    Wildcard,
    Ground(Term),
}

impl RuleTerm {
    pub fn var(name: impl Into<String>) -> Self {
        RuleTerm::Var(name.into())
    }

    pub fn is_ground(&self) -> bool {
        matches!(self, RuleTerm::Ground(_))
    }
}

impl std::fmt::Display for RuleTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleTerm::Var(v) => write!(f, "{}", v),
            RuleTerm::Wildcard => write!(f, "_"),
            RuleTerm::Ground(t) => write!(f, "{}", t),
        }
    }
}

/// `predicate(arg1, ..., argN)`; arity zero is written bare.
#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    pub predicate: String,
    pub args: Vec<RuleTerm>,
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.args.is_empty() {
            return write!(f, "{}", self.predicate);
        }
        write!(f, "{}(", self.predicate)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl std::fmt::Display for CmpOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "=<",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// One conjunct in a rule body.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyItem {
    /// Positive goal: match against the database.
    Pos(Literal),
    /// Negation as failure: succeeds when no fact matches.
    Neg(Literal),
    /// Comparison over bound terms.
    Cmp {
        op: CmpOp,
        lhs: RuleTerm,
        rhs: RuleTerm,
    },
    /// `Var is Lhs op Rhs`: arithmetic binding.
    Is {
        var: String,
        lhs: RuleTerm,
        op: ArithOp,
        rhs: RuleTerm,
    },
}

/// `head :- body.`; a bodiless rule is a stored ground fact.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub head: Literal,
    pub body: Vec<BodyItem>,
}

impl Rule {
    pub fn is_fact(&self) -> bool {
        self.body.is_empty()
    }
}

/// A parsed ruleset, order-preserving.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Predicates that any rule head defines.
    pub fn derived_predicates(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .rules
            .iter()
            .map(|r| r.head.predicate.as_str())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}
