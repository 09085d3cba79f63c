//! Stability governor.
//!
//! A logic-engine-backed oracle over the Fact Store. One instance lives
//! per Loop Driver; the driver routes every fact assertion through it
//! and consults it for halting, stagnation, transition validity, and
//! convergence. The fixed ruleset is embedded at build time; queries
//! are time-bounded and a timeout always resolves to the conservative
//! answer (deny the transition, halt the loop).

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::facts::{Fact, FactStore, Term};
use crate::logic::{Bindings, LogicProgram};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// The embedded stability ruleset.
const STABILITY_RULES: &str = include_str!("stability.lg");

/// Lazy-fix pattern tags the governor penalizes when they recur.
pub const LAZY_FIX_TAGS: &[&str] = &[
    "timeout_increase",
    "retry_addition",
    "error_swallow",
    "mutex_wrap",
];

/// Oracle surface the Loop Driver depends on. `Governor` is the
/// production implementation; tests substitute failing or panicking
/// doubles through this trait.
pub trait Governance: Send {
    /// Append one fact to the store. The only mutation path.
    fn assert_fact(&mut self, fact: Fact) -> EngineResult<()>;

    /// Reason to stop the loop before another iteration, if any.
    fn should_halt(&mut self, step: &str) -> EngineResult<Option<String>>;

    /// Record a freshly proposed candidate hash. Returns true when the
    /// hash repeats one already inside the visible history window.
    fn record_candidate(&mut self, step: &str, source_hash: &str) -> EngineResult<bool>;

    /// Assert the differential view for a proposed step (simulation).
    fn propose(&mut self, proposal: Proposal) -> EngineResult<()>;

    /// True when a previously seen candidate hash was proposed again.
    fn stagnation_detected(&mut self) -> EngineResult<bool>;

    /// True when the proposed step keeps the system stable enough.
    fn valid_transition(&mut self, step_next: &str) -> EngineResult<bool>;

    /// True when the lineage has settled; grounds for early exit only.
    fn converged(&mut self, step: &str) -> EngineResult<bool>;

    /// Read access for invariant checks and result reporting.
    fn facts(&self) -> &FactStore;
}

/// Differential view of one proposed step (protocol step 6).
#[derive(Debug, Clone)]
pub struct Proposal {
    /// Base step id (stable per capability name).
    pub step: String,
    /// Proposed step id, unique per iteration.
    pub step_next: String,
    /// Proposed base stability (the need's confidence).
    pub confidence: f64,
    /// Lines of code in the candidate.
    pub loc: i64,
    /// Violations found for this candidate during its audit.
    pub new_violations: usize,
}

#[derive(Debug, Default)]
struct Lineage {
    stabilities: Vec<f64>,
    violation_counts: Vec<usize>,
    /// Hash that tripped stagnation, when a repeat was proposed.
    stagnant_hash: Option<String>,
}

/// Production governor: Fact Store + embedded stability ruleset.
pub struct Governor {
    store: FactStore,
    program: LogicProgram,
    query_budget: Duration,
    max_iterations: i64,
    max_retries: i64,
    lineages: HashMap<String, Lineage>,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("facts", &self.store.len())
            .field("rules", &self.program.rule_count())
            .finish()
    }
}

impl Governor {
    pub fn new(config: &EngineConfig) -> EngineResult<Self> {
        Self::with_store(FactStore::new(), config)
    }

    /// Governor over a SQLite-backed store (stability reasoning survives
    /// restarts).
    pub fn open(db_path: &Path, config: &EngineConfig) -> EngineResult<Self> {
        Self::with_store(FactStore::open_db(db_path)?, config)
    }

    pub fn with_store(store: FactStore, config: &EngineConfig) -> EngineResult<Self> {
        let program = LogicProgram::compile(STABILITY_RULES)?;
        Ok(Self {
            store,
            program,
            query_budget: config.governor_query_timeout(),
            max_iterations: config.max_iterations as i64,
            max_retries: config.retry.max_retries as i64,
            lineages: HashMap::new(),
        })
    }

    /// Strip the `_i<n>` iteration suffix from a proposed step id.
    fn base_step(step: &str) -> &str {
        match step.rfind("_i") {
            Some(idx) if step[idx + 2..].chars().all(|c| c.is_ascii_digit()) => &step[..idx],
            _ => step,
        }
    }

    /// Seed facts the ruleset expects but the store does not hold:
    /// counts, limits, and lineage-derived flags.
    fn seed_facts(&self, step: &str) -> Vec<Fact> {
        let base = Self::base_step(step);
        let mut seeds = Vec::new();

        let count_for = |predicate: &str| -> i64 {
            self.store
                .with_predicate(predicate)
                .iter()
                .filter(|f| f.args.first().and_then(|t| t.as_str()) == Some(base))
                .count() as i64
        };

        seeds.push(Fact::new(
            "iteration_count",
            vec![Term::atom(step), Term::Int(count_for("iteration"))],
        ));
        seeds.push(Fact::new(
            "retry_count",
            vec![Term::atom(step), Term::Int(count_for("retry_attempt"))],
        ));
        seeds.push(Fact::new(
            "error_count",
            vec![Term::atom(step), Term::Int(count_for("error_history"))],
        ));

        // lazy-fix tags only weigh in once they recur (>= 3 occurrences)
        let mut tag_counts: HashMap<&str, usize> = HashMap::new();
        for fact in self.store.with_predicate("lazy_fix") {
            if fact.args.first().and_then(|t| t.as_str()) != Some(base) {
                continue;
            }
            if let Some(tag) = fact.args.get(1).and_then(|t| t.as_str()) {
                *tag_counts.entry(tag).or_default() += 1;
            }
        }
        let repeated = tag_counts.values().filter(|&&n| n >= 3).count() as i64;
        seeds.push(Fact::new(
            "lazy_fix_repeat_count",
            vec![Term::atom(step), Term::Int(repeated)],
        ));

        let lineage = self.lineages.get(base);

        let prior = lineage
            .and_then(|l| l.stabilities.iter().rev().nth(1))
            .copied()
            .unwrap_or(0.0);
        seeds.push(Fact::new(
            "prior_stability",
            vec![Term::atom(step), Term::Float(prior)],
        ));

        if let Some(l) = lineage {
            if l.stabilities.len() >= 2 {
                let n = l.stabilities.len();
                if (l.stabilities[n - 1] - l.stabilities[n - 2]).abs() < f64::EPSILON {
                    seeds.push(Fact::new(
                        "consecutive_stability_equal",
                        vec![Term::atom(step)],
                    ));
                }
            }
            let last_violations = l.violation_counts.last().copied().unwrap_or(0);
            seeds.push(Fact::new(
                "new_violation_count",
                vec![Term::atom(step), Term::Int(last_violations as i64)],
            ));
            if let Some(hash) = &l.stagnant_hash {
                seeds.push(Fact::new(
                    "history_repeat",
                    vec![Term::atom(step), Term::str(hash.clone())],
                ));
            }
        } else {
            seeds.push(Fact::new(
                "new_violation_count",
                vec![Term::atom(step), Term::Int(0)],
            ));
        }

        seeds.push(Fact::new(
            "max_iterations",
            vec![Term::Int(self.max_iterations)],
        ));
        seeds.push(Fact::new("max_retries", vec![Term::Int(self.max_retries)]));

        seeds
    }

    fn query(&self, goal: &str, step: &str) -> EngineResult<Vec<Bindings>> {
        let seeds = self.seed_facts(step);
        let mut refs: Vec<&Fact> = self.store.all().iter().collect();
        refs.extend(seeds.iter());
        self.program
            .query(goal, &refs, self.query_budget)
            .map_err(|e| match e {
                EngineError::Timeout { .. } => EngineError::QueryTimeout {
                    query: goal.to_string(),
                },
                other => other,
            })
    }

    /// True when the step's history already holds this hash.
    fn hash_seen(&self, step: &str, hash: &str) -> bool {
        self.store.with_predicate("history").iter().any(|f| {
            f.args.first().and_then(|t| t.as_str()) == Some(step)
                && f.args.get(1).and_then(|t| t.as_str()) == Some(hash)
        })
    }
}

impl Governance for Governor {
    fn assert_fact(&mut self, fact: Fact) -> EngineResult<()> {
        self.store.append(fact)
    }

    fn should_halt(&mut self, step: &str) -> EngineResult<Option<String>> {
        let goal = format!("halt_reason({}, R)", step);
        match self.query(&goal, step) {
            Ok(bindings) => Ok(bindings.first().and_then(|b| {
                b.get("R").map(|t| match t {
                    Term::Atom(s) | Term::Str(s) => s.clone(),
                    other => other.to_string(),
                })
            })),
            Err(EngineError::QueryTimeout { .. }) => {
                log::warn!("[Governor] should_halt({}) timed out; halting", step);
                Ok(Some("governor_timeout".to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn record_candidate(&mut self, step: &str, source_hash: &str) -> EngineResult<bool> {
        // A candidate hash appears at most once across all attempts; a
        // repeat marks the lineage stagnant instead of duplicating it.
        if self.hash_seen(step, source_hash) {
            log::warn!(
                "[Governor] step '{}' proposed an already-seen candidate hash {}",
                step,
                &source_hash[..12.min(source_hash.len())]
            );
            let lineage = self.lineages.entry(step.to_string()).or_default();
            lineage.stagnant_hash = Some(source_hash.to_string());
            return Ok(true);
        }
        self.store.append(Fact::history(step, source_hash))?;
        Ok(false)
    }

    fn propose(&mut self, proposal: Proposal) -> EngineResult<()> {
        let base = proposal.step.clone();

        self.store.append(Fact::state(&base, 0.0, 0))?;
        self.store.append(Fact::new(
            "state",
            vec![
                Term::atom(&proposal.step_next),
                Term::Float(proposal.confidence),
                Term::Int(proposal.loc),
            ],
        ))?;
        self.store.append(Fact::proposed(&proposal.step_next))?;
        self.store.append(Fact::new(
            "base_stability",
            vec![
                Term::atom(&proposal.step_next),
                Term::Float(proposal.confidence),
            ],
        ))?;

        let lineage = self.lineages.entry(base).or_default();
        lineage.stabilities.push(proposal.confidence);
        lineage.violation_counts.push(proposal.new_violations);
        Ok(())
    }

    fn stagnation_detected(&mut self) -> EngineResult<bool> {
        // Any lineage with a repeated hash seeds history_repeat; the
        // step argument is irrelevant to the goal.
        let stagnant = self
            .lineages
            .iter()
            .find(|(_, l)| l.stagnant_hash.is_some());
        let step = match stagnant {
            Some((base, _)) => base.clone(),
            None => return Ok(false),
        };
        match self.query("stagnation_detected", &step) {
            Ok(bindings) => Ok(!bindings.is_empty()),
            Err(EngineError::QueryTimeout { .. }) => {
                log::warn!("[Governor] stagnation query timed out; treating as clean");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn valid_transition(&mut self, step_next: &str) -> EngineResult<bool> {
        let goal = format!("valid_transition({})", step_next);
        match self.query(&goal, step_next) {
            Ok(bindings) => Ok(!bindings.is_empty()),
            Err(EngineError::QueryTimeout { .. }) => {
                // Timeouts never authorize a transition.
                log::warn!(
                    "[Governor] valid_transition({}) timed out; denying",
                    step_next
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn converged(&mut self, step: &str) -> EngineResult<bool> {
        let goal = format!("converged({})", step);
        match self.query(&goal, step) {
            Ok(bindings) => Ok(!bindings.is_empty()),
            Err(EngineError::QueryTimeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn facts(&self) -> &FactStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> Governor {
        let config = EngineConfig {
            max_iterations: 3,
            ..EngineConfig::default()
        };
        Governor::new(&config).unwrap()
    }

    fn proposal(step: &str, n: u32, confidence: f64) -> Proposal {
        Proposal {
            step: step.to_string(),
            step_next: format!("{}_i{}", step, n),
            confidence,
            loc: 40,
            new_violations: 0,
        }
    }

    fn propose_with_hash(gov: &mut Governor, step: &str, n: u32, confidence: f64, hash: &str) {
        gov.record_candidate(step, hash).unwrap();
        gov.propose(proposal(step, n, confidence)).unwrap();
    }

    #[test]
    fn base_step_strips_iteration_suffix() {
        assert_eq!(Governor::base_step("synth_echo_i3"), "synth_echo");
        assert_eq!(Governor::base_step("synth_echo"), "synth_echo");
        assert_eq!(Governor::base_step("synth_echo_index"), "synth_echo_index");
    }

    #[test]
    fn fresh_step_is_a_valid_transition() {
        let mut gov = governor();
        propose_with_hash(&mut gov, "synth_echo", 1, 0.8, "h1");
        assert!(gov.valid_transition("synth_echo_i1").unwrap());
        assert!(!gov.stagnation_detected().unwrap());
    }

    #[test]
    fn repeated_hash_trips_stagnation() {
        let mut gov = governor();
        assert!(!gov.record_candidate("synth_echo", "same").unwrap());
        gov.propose(proposal("synth_echo", 1, 0.8)).unwrap();
        assert!(!gov.stagnation_detected().unwrap());

        assert!(gov.record_candidate("synth_echo", "same").unwrap());
        gov.propose(proposal("synth_echo", 2, 0.8)).unwrap();
        assert!(gov.stagnation_detected().unwrap());

        // the hash appears exactly once in the history window
        let history = gov.facts().with_predicate("history");
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn error_penalties_deny_low_stability_transitions() {
        let mut gov = governor();
        propose_with_hash(&mut gov, "synth_echo", 1, 0.9, "h1");
        assert!(gov.valid_transition("synth_echo_i1").unwrap());

        // prior stability is now 0.9; pile on errors
        for _ in 0..4 {
            gov.assert_fact(Fact::error_history("synth_echo", "panic"))
                .unwrap();
        }
        propose_with_hash(&mut gov, "synth_echo", 2, 0.9, "h2");
        // effective = 0.9 - 4*0.1 = 0.5 < prior 0.9 - slack 0.2
        assert!(!gov.valid_transition("synth_echo_i2").unwrap());
    }

    #[test]
    fn halts_when_iterations_exhausted() {
        let mut gov = governor();
        assert_eq!(gov.should_halt("synth_echo").unwrap(), None);
        for n in 1..=3 {
            gov.assert_fact(Fact::iteration("synth_echo", n)).unwrap();
        }
        assert_eq!(
            gov.should_halt("synth_echo").unwrap().as_deref(),
            Some("iterations_exhausted")
        );
    }

    #[test]
    fn halts_when_retries_exhausted() {
        let mut gov = governor();
        for n in 1..=3 {
            gov.assert_fact(Fact::retry_attempt("synth_echo", n, "safety_violation"))
                .unwrap();
        }
        assert_eq!(
            gov.should_halt("synth_echo").unwrap().as_deref(),
            Some("retries_exhausted")
        );
    }

    #[test]
    fn convergence_needs_equal_stability_and_no_violations() {
        let mut gov = governor();
        propose_with_hash(&mut gov, "synth_echo", 1, 0.7, "h1");
        assert!(!gov.converged("synth_echo").unwrap());
        propose_with_hash(&mut gov, "synth_echo", 2, 0.7, "h2");
        assert!(gov.converged("synth_echo").unwrap());

        let mut p = proposal("synth_echo", 3, 0.7);
        p.new_violations = 2;
        gov.record_candidate("synth_echo", "h3").unwrap();
        gov.propose(p).unwrap();
        assert!(!gov.converged("synth_echo").unwrap());
    }

    #[test]
    fn lazy_fix_tags_penalize_after_three_occurrences() {
        let mut gov = governor();
        propose_with_hash(&mut gov, "synth_echo", 1, 0.9, "h1");
        assert!(gov.valid_transition("synth_echo_i1").unwrap());

        for _ in 0..3 {
            gov.assert_fact(Fact::lazy_fix("synth_echo", "error_swallow"))
                .unwrap();
        }
        // prior 0.9, effective 0.9 - 0.2 = 0.7 = floor exactly
        propose_with_hash(&mut gov, "synth_echo", 2, 0.9, "h2");
        assert!(gov.valid_transition("synth_echo_i2").unwrap());

        for _ in 0..3 {
            gov.assert_fact(Fact::lazy_fix("synth_echo", "mutex_wrap"))
                .unwrap();
        }
        // two repeated tags: effective 0.9 - 0.4 = 0.5 < 0.9 - 0.2
        propose_with_hash(&mut gov, "synth_echo", 3, 0.9, "h3");
        assert!(!gov.valid_transition("synth_echo_i3").unwrap());
    }
}
