//! Bottom-up fixpoint evaluation.
//!
//! The database is the union of ground facts supplied by the caller and
//! facts derived from the ruleset. Evaluation iterates every rule until
//! no new fact appears, then answers the goal by pattern match. Negation
//! is negation-as-failure against the database built so far; the shipped
//! rulesets are stratified by construction. Every call is bounded by a
//! wall-clock deadline; policy queries must never wedge the loop.

use super::ast::{ArithOp, BodyItem, CmpOp, Literal, Rule, RuleSet, RuleTerm};
use crate::error::{EngineError, EngineResult};
use crate::facts::{Fact, Term};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Variable assignments produced by a query.
pub type Bindings = HashMap<String, Term>;

/// Ground tuples per predicate.
#[derive(Debug, Default)]
struct Database {
    tuples: HashMap<String, Vec<Vec<Term>>>,
    seen: HashMap<String, HashSet<Vec<Term>>>,
}

impl Database {
    fn insert(&mut self, predicate: &str, args: Vec<Term>) -> bool {
        let seen = self.seen.entry(predicate.to_string()).or_default();
        if seen.contains(&args) {
            return false;
        }
        seen.insert(args.clone());
        self.tuples
            .entry(predicate.to_string())
            .or_default()
            .push(args);
        true
    }

    fn rows(&self, predicate: &str) -> &[Vec<Term>] {
        self.tuples
            .get(predicate)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// The evaluator: a parsed ruleset applied to caller-supplied facts.
pub struct Evaluator<'a> {
    rules: &'a RuleSet,
    deadline: Instant,
}

impl<'a> Evaluator<'a> {
    pub fn new(rules: &'a RuleSet, budget: Duration) -> Self {
        Self {
            rules,
            deadline: Instant::now() + budget,
        }
    }

    /// Evaluate to fixpoint over `facts` and answer `goal`.
    pub fn query(&self, facts: &[&Fact], goal: &Literal) -> EngineResult<Vec<Bindings>> {
        let mut db = Database::default();
        for fact in facts {
            db.insert(&fact.predicate, fact.args.clone());
        }
        for rule in &self.rules.rules {
            if rule.is_fact() {
                let args = self.instantiate_head(&rule.head, &Bindings::new())?;
                db.insert(&rule.head.predicate, args);
            }
        }

        self.fixpoint(&mut db)?;

        let mut out = Vec::new();
        let bindings = Bindings::new();
        for row in db.rows(&goal.predicate) {
            if let Some(b) = unify_row(&goal.args, row, &bindings) {
                out.push(b);
            }
        }
        Ok(out)
    }

    fn check_deadline(&self, context: &str) -> EngineResult<()> {
        if Instant::now() >= self.deadline {
            return Err(EngineError::Timeout {
                context: format!("logic evaluation ({})", context),
                elapsed_ms: 0,
            });
        }
        Ok(())
    }

    fn fixpoint(&self, db: &mut Database) -> EngineResult<()> {
        loop {
            self.check_deadline("fixpoint round")?;
            let mut grew = false;
            for rule in &self.rules.rules {
                if rule.is_fact() {
                    continue;
                }
                let matches = self.solve_body(rule, db)?;
                for bindings in matches {
                    let args = self.instantiate_head(&rule.head, &bindings)?;
                    if db.insert(&rule.head.predicate, args) {
                        grew = true;
                    }
                }
            }
            if !grew {
                return Ok(());
            }
        }
    }

    fn solve_body(&self, rule: &Rule, db: &Database) -> EngineResult<Vec<Bindings>> {
        let mut frontier = vec![Bindings::new()];
        for item in &rule.body {
            self.check_deadline(&rule.head.predicate)?;
            let mut next = Vec::new();
            match item {
                BodyItem::Pos(lit) => {
                    for bindings in &frontier {
                        for row in db.rows(&lit.predicate) {
                            if let Some(b) = unify_row(&lit.args, row, bindings) {
                                next.push(b);
                            }
                        }
                    }
                }
                BodyItem::Neg(lit) => {
                    for bindings in frontier {
                        let hit = db
                            .rows(&lit.predicate)
                            .iter()
                            .any(|row| unify_row(&lit.args, row, &bindings).is_some());
                        if !hit {
                            next.push(bindings);
                        }
                    }
                }
                BodyItem::Cmp { op, lhs, rhs } => {
                    for bindings in frontier {
                        let (a, b) = match (resolve(lhs, &bindings), resolve(rhs, &bindings)) {
                            (Some(a), Some(b)) => (a, b),
                            _ => {
                                return Err(EngineError::Generic(format!(
                                    "unbound term in comparison of rule '{}'",
                                    rule.head
                                )))
                            }
                        };
                        if compare(*op, &a, &b) {
                            next.push(bindings);
                        }
                    }
                }
                BodyItem::Is { var, lhs, op, rhs } => {
                    for mut bindings in frontier {
                        let (a, b) = match (resolve(lhs, &bindings), resolve(rhs, &bindings)) {
                            (Some(a), Some(b)) => (a, b),
                            _ => {
                                return Err(EngineError::Generic(format!(
                                    "unbound term in arithmetic of rule '{}'",
                                    rule.head
                                )))
                            }
                        };
                        match arith(*op, &a, &b) {
                            Some(value) => match bindings.get(var) {
                                Some(existing) if *existing != value => {}
                                Some(_) => next.push(bindings),
                                None => {
                                    bindings.insert(var.clone(), value);
                                    next.push(bindings);
                                }
                            },
                            None => {} // non-numeric operand: conjunct fails
                        }
                    }
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }
        Ok(frontier)
    }

    fn instantiate_head(&self, head: &Literal, bindings: &Bindings) -> EngineResult<Vec<Term>> {
        head.args
            .iter()
            .map(|arg| match arg {
                RuleTerm::Ground(t) => Ok(t.clone()),
                RuleTerm::Var(v) => bindings.get(v).cloned().ok_or_else(|| {
                    EngineError::Generic(format!(
                        "unbound variable '{}' in head of '{}'",
                        v, head
                    ))
                }),
                RuleTerm::Wildcard => Err(EngineError::Generic(format!(
                    "wildcard in head of '{}'",
                    head
                ))),
            })
            .collect()
    }
}

/// Unify a literal's argument pattern against one ground row.
fn unify_row(pattern: &[RuleTerm], row: &[Term], bindings: &Bindings) -> Option<Bindings> {
    if pattern.len() != row.len() {
        return None;
    }
    let mut out = bindings.clone();
    for (p, value) in pattern.iter().zip(row.iter()) {
        match p {
            RuleTerm::Wildcard => {}
            RuleTerm::Ground(t) => {
                if t != value {
                    return None;
                }
            }
            RuleTerm::Var(v) => match out.get(v) {
                Some(bound) => {
                    if bound != value {
                        return None;
                    }
                }
                None => {
                    out.insert(v.clone(), value.clone());
                }
            },
        }
    }
    Some(out)
}

fn resolve(term: &RuleTerm, bindings: &Bindings) -> Option<Term> {
    match term {
        RuleTerm::Ground(t) => Some(t.clone()),
        RuleTerm::Var(v) => bindings.get(v).cloned(),
        RuleTerm::Wildcard => None,
    }
}

fn compare(op: CmpOp, a: &Term, b: &Term) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        _ => {
            let ord = match a.numeric_cmp(b) {
                Some(ord) => ord,
                None => return false,
            };
            match op {
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::Le => ord != Ordering::Greater,
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Ge => ord != Ordering::Less,
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            }
        }
    }
}

fn arith(op: ArithOp, a: &Term, b: &Term) -> Option<Term> {
    // Integer arithmetic stays integral; anything touching a float
    // produces a float.
    if let (Term::Int(x), Term::Int(y)) = (a, b) {
        return match op {
            ArithOp::Add => Some(Term::Int(x + y)),
            ArithOp::Sub => Some(Term::Int(x - y)),
            ArithOp::Mul => Some(Term::Int(x * y)),
            ArithOp::Div => {
                if *y == 0 {
                    None
                } else {
                    Some(Term::Int(x / y))
                }
            }
        };
    }
    let (x, y) = (a.as_f64()?, b.as_f64()?);
    let value = match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => {
            if y == 0.0 {
                return None;
            }
            x / y
        }
    };
    Some(Term::Float(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::parser::{parse_goal, parse_rules};

    fn facts(list: &[(&str, Vec<Term>)]) -> Vec<Fact> {
        list.iter()
            .map(|(p, args)| Fact::new(*p, args.clone()))
            .collect()
    }

    fn run(rules: &str, base: &[Fact], goal: &str) -> Vec<Bindings> {
        let rs = parse_rules(rules).unwrap();
        let goal = parse_goal(goal).unwrap();
        let refs: Vec<&Fact> = base.iter().collect();
        Evaluator::new(&rs, Duration::from_secs(3))
            .query(&refs, &goal)
            .unwrap()
    }

    #[test]
    fn joins_and_derivation() {
        let base = facts(&[
            ("parent", vec![Term::atom("a"), Term::atom("b")]),
            ("parent", vec![Term::atom("b"), Term::atom("c")]),
        ]);
        let out = run(
            "grandparent(X, Z) :- parent(X, Y), parent(Y, Z).",
            &base,
            "grandparent(X, Z)",
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["X"], Term::atom("a"));
        assert_eq!(out[0]["Z"], Term::atom("c"));
    }

    #[test]
    fn negation_as_failure() {
        let base = facts(&[
            ("ast_import", vec![Term::str("std::process"), Term::Int(3)]),
            ("ast_import", vec![Term::str("std::fmt"), Term::Int(1)]),
            ("allowed_package", vec![Term::str("std::fmt")]),
        ]);
        let out = run(
            "violation(P) :- ast_import(P, _), not allowed_package(P).",
            &base,
            "violation(P)",
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["P"], Term::str("std::process"));
    }

    #[test]
    fn arithmetic_and_comparison() {
        let base = facts(&[
            ("base_stability", vec![Term::atom("s"), Term::Float(0.8)]),
            ("penalty", vec![Term::atom("s"), Term::Float(0.3)]),
        ]);
        let out = run(
            r#"
            effective(S, E) :- base_stability(S, B), penalty(S, P), E is B - P.
            ok(S) :- effective(S, E), E >= 0.4.
            "#,
            &base,
            "ok(S)",
        );
        assert_eq!(out.len(), 1);

        let out = run(
            r#"
            effective(S, E) :- base_stability(S, B), penalty(S, P), E is B - P.
            ok(S) :- effective(S, E), E >= 0.6.
            "#,
            &base,
            "ok(S)",
        );
        assert!(out.is_empty());
    }

    #[test]
    fn transitive_closure_reaches_fixpoint() {
        let base = facts(&[
            ("edge", vec![Term::atom("a"), Term::atom("b")]),
            ("edge", vec![Term::atom("b"), Term::atom("c")]),
            ("edge", vec![Term::atom("c"), Term::atom("d")]),
        ]);
        let out = run(
            r#"
            path(X, Y) :- edge(X, Y).
            path(X, Z) :- path(X, Y), edge(Y, Z).
            "#,
            &base,
            "path(a, Z)",
        );
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn zero_arity_goal() {
        let base = facts(&[(
            "history_repeat",
            vec![Term::atom("s"), Term::str("h1")],
        )]);
        let out = run(
            "stagnation_detected :- history_repeat(_, _).",
            &base,
            "stagnation_detected",
        );
        assert_eq!(out.len(), 1);
        assert!(out[0].is_empty());

        let out = run(
            "stagnation_detected :- history_repeat(_, _).",
            &[],
            "stagnation_detected",
        );
        assert!(out.is_empty());
    }

    #[test]
    fn deadline_is_enforced() {
        let rs = parse_rules("p(X) :- q(X).").unwrap();
        let goal = parse_goal("p(X)").unwrap();
        let evaluator = Evaluator::new(&rs, Duration::ZERO);
        let err = evaluator.query(&[], &goal).unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }

    #[test]
    fn stored_ground_facts_in_ruleset() {
        let out = run("slack(0.2). wide(S) :- slack(S), S > 0.1.", &[], "wide(S)");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["S"], Term::Float(0.2));
    }
}
