//! Policy Auditor.
//!
//! Two phases: structural fact extraction over the candidate source
//! (`extract`), then evaluation of the embedded declarative safety
//! policy. Every binding of `violation(V)` becomes a [`Violation`] whose
//! kind and severity come from cross-referencing the extracted index.

pub mod extract;

pub use extract::{extract as extract_facts, ExtractedFacts};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::facts::{Fact, Term};
use crate::logic::LogicProgram;
use crate::types::{SafetyReport, Severity, Violation, ViolationKind};
use std::time::Duration;

/// The embedded safety policy.
const SAFETY_POLICY: &str = include_str!("policy.lg");

/// Policy evaluation budget. Candidate files are small; this is a
/// backstop against pathological rule interactions, not a tuning knob.
const POLICY_QUERY_BUDGET: Duration = Duration::from_secs(3);

/// Allowed-package base set: string/byte/io utilities, time, math,
/// sorting, JSON/hex/base64 encoding, regular expressions,
/// synchronization primitives, structured logging, and context types.
const ALLOWED_BASE: &[&str] = &[
    "std::str",
    "std::string",
    "std::fmt",
    "std::io",
    "std::borrow",
    "std::char",
    "std::iter",
    "std::slice",
    "std::vec",
    "std::option",
    "std::result",
    "std::num",
    "std::cmp",
    "std::ops",
    "std::convert",
    "std::default",
    "std::hash",
    "std::marker",
    "std::error",
    "std::time",
    "std::collections",
    "std::sync",
    "std::cell",
    "std::f32",
    "std::f64",
    "std::mem",
    "std::panic",
    "core::str",
    "core::fmt",
    "serde_json",
    "regex",
    "log",
    "base64",
    "hex",
];

/// Call subjects treated as panic paths but survivable (warnings).
const PANIC_PATH_CALLS: &[&str] = &["unwrap", "expect"];

/// Macro names that are explicit panics (always blocking).
const PANIC_MACROS: &[&str] = &["panic", "unreachable", "todo", "unimplemented", "assert", "assert_eq", "assert_ne"];

/// Call subjects that reach raw memory (always blocking).
const TRANSMUTE_CALLS: &[&str] = &["transmute", "mem::transmute", "std::mem::transmute"];

/// Call subjects that reflect over runtime types (always blocking).
const REFLECTION_CALLS: &[&str] = &["downcast", "downcast_ref", "downcast_mut", "type_id"];

/// Call subjects that spawn external processes (blocking unless
/// `allow_external_exec`).
const EXEC_CALLS: &[&str] = &[
    "Command::new",
    "process::Command::new",
    "std::process::Command::new",
    "exec",
    "execvp",
    "system",
];

/// Identifier fragments that smell like embedded credentials.
const CREDENTIAL_FRAGMENTS: &[&str] = &["password", "secret", "token", "api_key", "apikey", "credential"];

/// The static safety auditor.
pub struct PolicyAuditor {
    program: LogicProgram,
    allowed_packages: Vec<String>,
    allow_external_exec: bool,
}

impl std::fmt::Debug for PolicyAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyAuditor")
            .field("allowed_packages", &self.allowed_packages.len())
            .finish()
    }
}

impl PolicyAuditor {
    pub fn new(config: &EngineConfig) -> crate::error::EngineResult<Self> {
        let program = LogicProgram::compile(SAFETY_POLICY)?;

        let mut allowed: Vec<String> = ALLOWED_BASE.iter().map(|s| s.to_string()).collect();
        if config.allow_networking {
            allowed.push("std::net".to_string());
            allowed.push("tokio::net".to_string());
        }
        if config.allow_filesystem {
            allowed.push("std::fs".to_string());
            allowed.push("std::path".to_string());
            allowed.push("std::env".to_string());
        }
        if config.allow_external_exec {
            allowed.push("std::process".to_string());
        }

        Ok(Self {
            program,
            allowed_packages: allowed,
            allow_external_exec: config.allow_external_exec,
        })
    }

    /// Audit candidate source and produce a [`SafetyReport`].
    pub fn check(&self, source: &str) -> SafetyReport {
        let extracted = match extract::extract(source) {
            Ok(facts) => facts,
            Err(e) => {
                let message = match e {
                    EngineError::Parse(msg) => msg,
                    other => other.to_string(),
                };
                return parse_error_report(message);
            }
        };

        let seeds = self.seed_facts(&extracted);
        let mut db: Vec<&Fact> = extracted.facts.iter().collect();
        db.extend(seeds.iter());

        let bindings = match self
            .program
            .query("violation(V)", &db, POLICY_QUERY_BUDGET)
        {
            Ok(bindings) => bindings,
            Err(e) => {
                log::warn!("[PolicyAuditor] policy evaluation failed: {}", e);
                return SafetyReport {
                    safe: false,
                    violations: vec![Violation {
                        kind: ViolationKind::PolicyViolation,
                        location: "policy".to_string(),
                        description: format!("policy evaluation failed: {}", e),
                        severity: Severity::Blocking,
                        code: Some("POLICY000".to_string()),
                        suggestion: None,
                    }],
                    imports_examined: extracted.imports_examined(),
                    calls_examined: extracted.calls_examined(),
                    score: 0.0,
                };
            }
        };

        let mut violations: Vec<Violation> = bindings
            .iter()
            .filter_map(|b| b.get("V"))
            .map(|v| self.classify(v, &extracted))
            .collect();

        violations.sort_by(|a, b| a.location.cmp(&b.location).then(a.description.cmp(&b.description)));
        violations.dedup_by(|a, b| a.kind == b.kind && a.description == b.description);

        let blocking = violations.iter().filter(|v| v.is_blocking()).count();
        let non_blocking = violations.len() - blocking;
        let safe = blocking == 0;
        let score = if !safe {
            0.0
        } else if violations.is_empty() {
            1.0
        } else {
            (1.0 - 0.1 * non_blocking as f64).max(0.1)
        };

        SafetyReport {
            safe,
            violations,
            imports_examined: extracted.imports_examined(),
            calls_examined: extracted.calls_examined(),
            score,
        }
    }

    fn seed_facts(&self, extracted: &ExtractedFacts) -> Vec<Fact> {
        let mut seeds = Vec::new();
        for pkg in &self.allowed_packages {
            seeds.push(Fact::new("allowed_package", vec![Term::str(pkg.clone())]));
        }

        for call in PANIC_PATH_CALLS.iter().chain(TRANSMUTE_CALLS).chain(REFLECTION_CALLS) {
            seeds.push(Fact::new("flagged_call", vec![Term::str(*call)]));
        }
        if !self.allow_external_exec {
            for call in EXEC_CALLS {
                seeds.push(Fact::new("flagged_call", vec![Term::str(*call)]));
            }
        }
        for mac in PANIC_MACROS {
            seeds.push(Fact::new("flagged_macro", vec![Term::str(*mac)]));
        }
        seeds.push(Fact::new("flagged_macro", vec![Term::str("asm")]));

        // credential identifiers are matched lexically, then joined in
        // the policy so the rule stays declarative
        for ident in extracted.assignments.keys() {
            let lower = ident.to_lowercase();
            if CREDENTIAL_FRAGMENTS.iter().any(|frag| lower.contains(frag)) {
                seeds.push(Fact::new("credential_ident", vec![Term::str(ident.clone())]));
            }
        }
        seeds
    }

    /// Assign kind, severity, and location by cross-referencing the
    /// extracted fact index.
    fn classify(&self, subject: &Term, extracted: &ExtractedFacts) -> Violation {
        let name = subject.as_str().unwrap_or_default().to_string();
        let location = |lines: Option<usize>| match lines {
            Some(line) => format!("candidate.rs:{}", line),
            None => "candidate.rs".to_string(),
        };

        if let Some(lines) = extracted.imports.get(&name) {
            return Violation {
                kind: ViolationKind::ForbiddenImport,
                location: location(lines.first().copied()),
                description: format!("import of package '{}' is not allowed", name),
                severity: Severity::Blocking,
                code: Some("IMPORT001".to_string()),
                suggestion: Some("restrict imports to the allowed standard-library set".to_string()),
            };
        }

        if PANIC_MACROS.contains(&name.as_str()) {
            return Violation {
                kind: ViolationKind::Panic,
                location: location(extracted.macros.get(&name).and_then(|l| l.first().copied())),
                description: format!("explicit panic path: {}!", name),
                severity: Severity::Blocking,
                code: Some("PANIC001".to_string()),
                suggestion: Some("return an error value instead of panicking".to_string()),
            };
        }

        if PANIC_PATH_CALLS.contains(&name.as_str()) {
            return Violation {
                kind: ViolationKind::Panic,
                location: location(extracted.calls.get(&name).and_then(|l| l.first().copied())),
                description: format!(".{}() can panic on unexpected input", name),
                severity: Severity::Warning,
                code: Some("PANIC002".to_string()),
                suggestion: Some("propagate the error with match or '?'".to_string()),
            };
        }

        if extracted.spawns.contains_key(&name) {
            return Violation {
                kind: ViolationKind::ConcurrencyLeak,
                location: location(extracted.spawns.get(&name).and_then(|l| l.first().copied())),
                description: format!(
                    "task spawned via '{}' without a cancellation channel in scope",
                    name
                ),
                severity: Severity::Blocking,
                code: Some("SPAWN001".to_string()),
                suggestion: Some(
                    "accept a cancellation token and select against it in the task".to_string(),
                ),
            };
        }

        if name == "unsafe block" {
            return Violation {
                kind: ViolationKind::UnsafePointer,
                location: location(extracted.unsafe_lines.first().copied()),
                description: "unsafe code is not allowed in generated capabilities".to_string(),
                severity: Severity::Blocking,
                code: Some("UNSAFE001".to_string()),
                suggestion: None,
            };
        }

        if name == "extern native" {
            return Violation {
                kind: ViolationKind::ExternalNative,
                location: location(extracted.extern_native_lines.first().copied()),
                description: "external native bindings are not allowed".to_string(),
                severity: Severity::Blocking,
                code: Some("NATIVE001".to_string()),
                suggestion: None,
            };
        }

        if TRANSMUTE_CALLS.contains(&name.as_str()) {
            return Violation {
                kind: ViolationKind::UnsafePointer,
                location: location(extracted.calls.get(&name).and_then(|l| l.first().copied())),
                description: "transmute reinterprets raw memory".to_string(),
                severity: Severity::Blocking,
                code: Some("UNSAFE002".to_string()),
                suggestion: None,
            };
        }

        if EXEC_CALLS.contains(&name.as_str()) {
            return Violation {
                kind: ViolationKind::Exec,
                location: location(extracted.calls.get(&name).and_then(|l| l.first().copied())),
                description: format!("process execution via '{}' is not allowed", name),
                severity: Severity::Blocking,
                code: Some("EXEC001".to_string()),
                suggestion: None,
            };
        }

        if REFLECTION_CALLS.contains(&name.as_str()) {
            return Violation {
                kind: ViolationKind::Reflection,
                location: location(extracted.calls.get(&name).and_then(|l| l.first().copied())),
                description: format!("runtime type reflection via '{}' is not allowed", name),
                severity: Severity::Blocking,
                code: Some("REFLECT001".to_string()),
                suggestion: None,
            };
        }

        if extracted.assignments.contains_key(&name) {
            return Violation {
                kind: ViolationKind::PolicyViolation,
                location: location(extracted.assignments.get(&name).and_then(|l| l.first().copied())),
                description: format!("literal binding '{}' looks like an embedded credential", name),
                severity: Severity::Warning,
                code: Some("CRED001".to_string()),
                suggestion: Some("read secrets from the environment, never the source".to_string()),
            };
        }

        Violation {
            kind: ViolationKind::PolicyViolation,
            location: location(extracted.line_of(&name)),
            description: format!("policy violation: {}", name),
            severity: Severity::Critical,
            code: Some("POLICY001".to_string()),
            suggestion: None,
        }
    }
}

fn parse_error_report(message: String) -> SafetyReport {
    SafetyReport {
        safe: false,
        violations: vec![Violation {
            kind: ViolationKind::ParseError,
            location: "candidate.rs".to_string(),
            description: message,
            severity: Severity::Blocking,
            code: Some("PARSE001".to_string()),
            suggestion: Some("emit a single valid Rust source file".to_string()),
        }],
        imports_examined: 0,
        calls_examined: 0,
        score: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auditor() -> PolicyAuditor {
        PolicyAuditor::new(&EngineConfig::default()).unwrap()
    }

    const CLEAN: &str = r#"
        use std::collections::HashMap;

        pub fn run(input: &str) -> Result<String, String> {
            let mut counts: HashMap<char, usize> = HashMap::new();
            for c in input.chars() {
                *counts.entry(c).or_insert(0) += 1;
            }
            Ok(counts.len().to_string())
        }
    "#;

    #[test]
    fn clean_candidate_is_safe() {
        let report = auditor().check(CLEAN);
        assert!(report.safe, "violations: {:?}", report.violations);
        assert_eq!(report.score, 1.0);
        assert!(report.imports_examined >= 1);
        assert!(report.calls_examined >= 1);
    }

    #[test]
    fn forbidden_import_blocks() {
        let report = auditor().check(
            r#"
            use std::net::TcpStream;
            pub fn run(input: &str) -> Result<String, String> {
                let _ = TcpStream::connect(input);
                Ok(String::new())
            }
            "#,
        );
        assert!(!report.safe);
        assert_eq!(report.score, 0.0);
        assert!(report
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::ForbiddenImport && v.is_blocking()));
    }

    #[test]
    fn networking_flag_enlarges_allowlist() {
        let mut config = EngineConfig::default();
        config.allow_networking = true;
        let auditor = PolicyAuditor::new(&config).unwrap();
        let report = auditor.check(
            r#"
            use std::net::TcpStream;
            pub fn run(input: &str) -> Result<String, String> {
                let _ = TcpStream::connect(input);
                Ok(String::new())
            }
            "#,
        );
        assert!(report.safe, "violations: {:?}", report.violations);
    }

    #[test]
    fn explicit_panic_blocks() {
        let report = auditor().check(
            r#"
            pub fn run(input: &str) -> Result<String, String> {
                if input.is_empty() {
                    panic!("empty");
                }
                Ok(input.to_string())
            }
            "#,
        );
        assert!(!report.safe);
        assert!(report
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::Panic && v.is_blocking()));
    }

    #[test]
    fn unwrap_is_a_warning_not_a_block() {
        let report = auditor().check(
            r#"
            pub fn run(input: &str) -> Result<String, String> {
                let n: i64 = input.trim().parse().unwrap();
                Ok(n.to_string())
            }
            "#,
        );
        assert!(report.safe);
        assert!(report.score < 1.0);
        assert!(report
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::Panic && v.severity == Severity::Warning));
    }

    #[test]
    fn spawn_without_cancellation_blocks() {
        let report = auditor().check(
            r#"
            pub fn run(input: &str) -> Result<String, String> {
                std::thread::spawn(move || loop {});
                Ok(input.to_string())
            }
            "#,
        );
        assert!(!report.safe);
        assert!(report
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::ConcurrencyLeak));
    }

    #[test]
    fn spawn_with_cancellation_token_passes() {
        let report = auditor().check(
            r#"
            pub fn run(token: CancellationToken, input: &str) -> Result<String, String> {
                std::thread::spawn(move || {
                    while !token.is_cancelled() {}
                });
                Ok(input.to_string())
            }
            "#,
        );
        assert!(
            !report
                .violations
                .iter()
                .any(|v| v.kind == ViolationKind::ConcurrencyLeak),
            "violations: {:?}",
            report.violations
        );
    }

    #[test]
    fn unsafe_block_blocks() {
        let report = auditor().check(
            r#"
            pub fn run(input: &str) -> Result<String, String> {
                let p = input.as_ptr();
                let b = unsafe { *p };
                Ok(b.to_string())
            }
            "#,
        );
        assert!(!report.safe);
        assert!(report
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::UnsafePointer));
    }

    #[test]
    fn exec_blocks_by_default_and_passes_when_allowed() {
        let source = r#"
            use std::process::Command;
            pub fn run(input: &str) -> Result<String, String> {
                let out = Command::new(input).output().map_err(|e| e.to_string())?;
                Ok(out.status.to_string())
            }
        "#;
        let report = auditor().check(source);
        assert!(!report.safe);
        assert!(report
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::Exec || v.kind == ViolationKind::ForbiddenImport));

        let mut config = EngineConfig::default();
        config.allow_external_exec = true;
        let report = PolicyAuditor::new(&config).unwrap().check(source);
        assert!(report.safe, "violations: {:?}", report.violations);
    }

    #[test]
    fn unparsable_source_is_one_blocking_parse_error() {
        let report = auditor().check("fn run( {");
        assert!(!report.safe);
        assert_eq!(report.score, 0.0);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::ParseError);
        assert_eq!(report.imports_examined, 0);
    }

    #[test]
    fn credential_literal_is_flagged() {
        let report = auditor().check(
            r#"
            pub fn run(input: &str) -> Result<String, String> {
                let api_key = "sk-1234567890";
                Ok(format!("{}{}", api_key, input))
            }
            "#,
        );
        assert!(report.safe);
        assert!(report
            .violations
            .iter()
            .any(|v| v.code.as_deref() == Some("CRED001")));
    }
}
