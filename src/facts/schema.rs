//! Typed constructors for the governance fact schema.
//!
//! The Loop Driver only ever asserts facts through these constructors so
//! the predicate names and argument shapes stay fixed; the Governor's
//! ruleset is written against exactly this schema.

use super::term::Term;
use super::Fact;
use crate::utils::time::unix_now;

/// Predicates whose first argument is the loop step. Used to promote the
/// step into its own storage column for indexed per-step hydration.
pub const STEP_SCOPED: &[&str] = &[
    "state",
    "base_stability",
    "proposed",
    "history",
    "iteration",
    "retry_attempt",
    "error_history",
];

impl Fact {
    pub fn new(predicate: impl Into<String>, args: Vec<Term>) -> Self {
        Fact {
            predicate: predicate.into(),
            args,
            timestamp: unix_now(),
        }
    }

    /// `state(step, stability, loc)`
    pub fn state(step: &str, stability: f64, loc: i64) -> Self {
        Fact::new(
            "state",
            vec![Term::atom(step), Term::Float(stability), Term::Int(loc)],
        )
    }

    /// `base_stability(step, value)`
    pub fn base_stability(step: &str, value: f64) -> Self {
        Fact::new("base_stability", vec![Term::atom(step), Term::Float(value)])
    }

    /// `proposed(step)`
    pub fn proposed(step: &str) -> Self {
        Fact::new("proposed", vec![Term::atom(step)])
    }

    /// `history(step, hash)`
    pub fn history(step: &str, hash: &str) -> Self {
        Fact::new("history", vec![Term::atom(step), Term::str(hash)])
    }

    /// `iteration(step, n)`
    pub fn iteration(step: &str, n: i64) -> Self {
        Fact::new("iteration", vec![Term::atom(step), Term::Int(n)])
    }

    /// `retry_attempt(step, n, reason)`
    pub fn retry_attempt(step: &str, n: i64, reason: &str) -> Self {
        Fact::new(
            "retry_attempt",
            vec![Term::atom(step), Term::Int(n), Term::atom(reason)],
        )
    }

    /// `error_event(kind)`
    pub fn error_event(kind: &str) -> Self {
        Fact::new("error_event", vec![Term::atom(kind)])
    }

    /// `error_history(step, kind, unix_ts)`
    pub fn error_history(step: &str, kind: &str) -> Self {
        Fact::new(
            "error_history",
            vec![Term::atom(step), Term::atom(kind), Term::Int(unix_now())],
        )
    }

    /// `lazy_fix(step, tag)`: detected lazy-fix pattern occurrences.
    pub fn lazy_fix(step: &str, tag: &str) -> Self {
        Fact::new("lazy_fix", vec![Term::atom(step), Term::atom(tag)])
    }

    /// `tool_registered(name, ts)`
    pub fn tool_registered(name: &str) -> Self {
        Fact::new(
            "tool_registered",
            vec![Term::str(name), Term::Int(unix_now())],
        )
    }

    /// `tool_hash(name, hex)`
    pub fn tool_hash(name: &str, hash: &str) -> Self {
        Fact::new("tool_hash", vec![Term::str(name), Term::str(hash)])
    }

    /// `tool_version(name, n)`
    pub fn tool_version(name: &str, n: i64) -> Self {
        Fact::new("tool_version", vec![Term::str(name), Term::Int(n)])
    }

    /// `tool_hot_loaded(name, ts)`
    pub fn tool_hot_loaded(name: &str) -> Self {
        Fact::new(
            "tool_hot_loaded",
            vec![Term::str(name), Term::Int(unix_now())],
        )
    }

    /// `has_capability(name)`
    pub fn has_capability(name: &str) -> Self {
        Fact::new("has_capability", vec![Term::str(name)])
    }

    /// `tool_description(name, text)`
    pub fn tool_description(name: &str, text: &str) -> Self {
        Fact::new("tool_description", vec![Term::str(name), Term::str(text)])
    }

    /// `tool_binary_path(name, path)`
    pub fn tool_binary_path(name: &str, path: &str) -> Self {
        Fact::new("tool_binary_path", vec![Term::str(name), Term::str(path)])
    }

    /// `battle_hardened(name, ts)`
    pub fn battle_hardened(name: &str) -> Self {
        Fact::new(
            "battle_hardened",
            vec![Term::str(name), Term::Int(unix_now())],
        )
    }

    /// `panic_maker_verdict(name, verdict, ts)`
    pub fn panic_maker_verdict(name: &str, verdict: &str) -> Self {
        Fact::new(
            "panic_maker_verdict",
            vec![Term::str(name), Term::atom(verdict), Term::Int(unix_now())],
        )
    }

    /// `attack_killed(attack, name, failure, ts)`
    pub fn attack_killed(attack: &str, name: &str, failure: &str) -> Self {
        Fact::new(
            "attack_killed",
            vec![
                Term::str(attack),
                Term::str(name),
                Term::atom(failure),
                Term::Int(unix_now()),
            ],
        )
    }

    /// The step this fact is scoped to, when its predicate is step-scoped.
    pub fn step_scope(&self) -> Option<&str> {
        if STEP_SCOPED.contains(&self.predicate.as_str()) {
            self.args.first().and_then(|t| t.as_str())
        } else {
            None
        }
    }
}
