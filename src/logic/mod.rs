//! Embedded logic engine.
//!
//! A small Horn-clause engine shared by the Policy Auditor (the safety
//! policy) and the Governor (the stability ruleset). Rulesets are
//! compiled once at construction; queries run bottom-up to fixpoint over
//! a caller-supplied fact snapshot under a wall-clock budget.

pub mod ast;
pub mod eval;
pub mod parser;

pub use ast::{Literal, Rule, RuleSet};
pub use eval::Bindings;

use crate::error::EngineResult;
use crate::facts::Fact;
use std::time::Duration;

/// A compiled ruleset ready for querying.
#[derive(Debug, Clone)]
pub struct LogicProgram {
    rules: RuleSet,
}

impl LogicProgram {
    /// Compile a ruleset from its textual form.
    pub fn compile(text: &str) -> EngineResult<Self> {
        let rules = parser::parse_rules(text)?;
        log::debug!(
            "[logic] compiled {} rules defining {:?}",
            rules.rules.len(),
            rules.derived_predicates()
        );
        Ok(Self { rules })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.rules.len()
    }

    /// Answer a goal (textual form) against the supplied facts within
    /// `budget`. Returns one `Bindings` per solution; an empty vec means
    /// the goal is not derivable.
    pub fn query(
        &self,
        goal: &str,
        facts: &[&Fact],
        budget: Duration,
    ) -> EngineResult<Vec<Bindings>> {
        let goal = parser::parse_goal(goal)?;
        eval::Evaluator::new(&self.rules, budget).query(facts, &goal)
    }

    /// True when the goal has at least one solution.
    pub fn holds(&self, goal: &str, facts: &[&Fact], budget: Duration) -> EngineResult<bool> {
        Ok(!self.query(goal, facts, budget)?.is_empty())
    }
}
