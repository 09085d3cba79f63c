//! Core data model for the synthesis engine.
//!
//! These types flow between the Loop Driver and every sub-component:
//! the need that starts a transaction, the candidate under synthesis,
//! audit and arena reports, compile output, and the final loop result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Capability need
// ---------------------------------------------------------------------------

/// A request to create a new capability, produced by an external intent
/// detector. Immutable within one loop invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityNeed {
    /// Short stable name; identifier characters only.
    pub name: String,
    /// Natural-language purpose of the capability.
    pub purpose: String,
    /// Opaque input type descriptor consumed by the code generator.
    pub input_type: String,
    /// Opaque output type descriptor consumed by the code generator.
    pub output_type: String,
    /// Priority in [0.0, 1.0].
    pub priority: f64,
    /// Detector confidence in [0.0, 1.0].
    pub confidence: f64,
    /// Optional reasoning text from the detector.
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl CapabilityNeed {
    pub fn new(name: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            purpose: purpose.into(),
            input_type: "string".to_string(),
            output_type: "string".to_string(),
            priority: 0.5,
            confidence: 0.5,
            reasoning: None,
        }
    }

    /// Stable loop-step id derived from the capability name.
    pub fn step_id(&self) -> String {
        format!("synth_{}", self.name)
    }

    /// True when the name is a valid capability identifier.
    pub fn has_valid_name(&self) -> bool {
        !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

// ---------------------------------------------------------------------------
// Candidate artifact
// ---------------------------------------------------------------------------

/// Input/output shape recorded for invocation of a capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CapabilitySchema {
    pub input: String,
    pub output: String,
}

/// The in-progress program under synthesis. Mutable only by the Loop
/// Driver; promoted to a [`CapabilityRecord`] on commit or discarded on
/// abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateArtifact {
    pub name: String,
    /// Generated source text, bounded by `max_candidate_size`.
    pub source: String,
    /// Optional companion test source.
    #[serde(default)]
    pub test_source: Option<String>,
    pub description: String,
    pub schema: CapabilitySchema,
    /// Where the source will be written at commit.
    pub target_path: PathBuf,
    pub validated: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl CandidateArtifact {
    pub fn from_need(need: &CapabilityNeed, source: String, target_path: PathBuf) -> Self {
        Self {
            name: need.name.clone(),
            source,
            test_source: None,
            description: need.purpose.clone(),
            schema: CapabilitySchema {
                input: need.input_type.clone(),
                output: need.output_type.clone(),
            },
            target_path,
            validated: false,
            errors: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability record
// ---------------------------------------------------------------------------

/// A registered, runnable artifact. Created at commit; the invocation
/// counter is tracked by the Registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityRecord {
    /// Unique key in the registry.
    pub name: String,
    pub description: String,
    /// Compiled artifact on disk.
    pub artifact_path: PathBuf,
    /// SHA-256 of the compiled binary at registration time.
    pub content_hash: String,
    pub schema: CapabilitySchema,
    pub registered_at: DateTime<Utc>,
    /// Snapshot of the invocation counter at read time.
    pub invocation_count: u64,
}

// ---------------------------------------------------------------------------
// Safety report
// ---------------------------------------------------------------------------

/// Classification of an audit violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    ForbiddenImport,
    DangerousCall,
    UnsafePointer,
    Reflection,
    ExternalNative,
    Exec,
    Panic,
    ConcurrencyLeak,
    ParseError,
    PolicyViolation,
    AdversarialKill,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationKind::ForbiddenImport => "forbidden-import",
            ViolationKind::DangerousCall => "dangerous-call",
            ViolationKind::UnsafePointer => "unsafe-pointer",
            ViolationKind::Reflection => "reflection",
            ViolationKind::ExternalNative => "external-native",
            ViolationKind::Exec => "exec",
            ViolationKind::Panic => "panic",
            ViolationKind::ConcurrencyLeak => "concurrency-leak",
            ViolationKind::ParseError => "parse-error",
            ViolationKind::PolicyViolation => "policy-violation",
            ViolationKind::AdversarialKill => "adversarial-kill",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Blocking,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
            Severity::Blocking => "blocking",
        };
        write!(f, "{}", s)
    }
}

/// One finding from the Policy Auditor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Textual location, e.g. `file.rs:42`.
    pub location: String,
    pub description: String,
    pub severity: Severity,
    /// Stable rule code, e.g. `POLICY001`.
    #[serde(default)]
    pub code: Option<String>,
    /// Optional corrective hint rendered into retry feedback.
    #[serde(default)]
    pub suggestion: Option<String>,
}

impl Violation {
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

/// Result of an audit over candidate source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyReport {
    pub safe: bool,
    pub violations: Vec<Violation>,
    /// Imports examined during fact extraction.
    pub imports_examined: usize,
    /// Call sites examined during fact extraction.
    pub calls_examined: usize,
    /// Score in [0.0, 1.0]; any blocking violation forces 0.0.
    pub score: f64,
}

impl SafetyReport {
    pub fn blocking_violations(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.is_blocking())
    }
}

// ---------------------------------------------------------------------------
// Attacks and battles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttackCategory {
    Memory,
    NilDeref,
    Race,
    MalformedInput,
    Boundary,
    ResourceLeak,
    Concurrency,
}

impl std::fmt::Display for AttackCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttackCategory::Memory => "memory",
            AttackCategory::NilDeref => "nil-deref",
            AttackCategory::Race => "race",
            AttackCategory::MalformedInput => "malformed-input",
            AttackCategory::Boundary => "boundary",
            AttackCategory::ResourceLeak => "resource-leak",
            AttackCategory::Concurrency => "concurrency",
        };
        write!(f, "{}", s)
    }
}

/// A named adversarial input used by the arena to probe a candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackVector {
    pub name: String,
    pub category: AttackCategory,
    /// Payload passed on the candidate's input channel.
    pub payload: String,
    #[serde(default)]
    pub hypothesis: Option<String>,
}

/// Failure mode observed for a single attack run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Panic,
    Timeout,
    OutOfMemory,
    Deadlock,
    CompileFailed,
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Panic => "panic",
            FailureKind::Timeout => "timeout",
            FailureKind::OutOfMemory => "out-of-memory",
            FailureKind::Deadlock => "deadlock",
            FailureKind::CompileFailed => "compile-failed",
            FailureKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one attack against the candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackOutcome {
    pub attack: AttackVector,
    pub survived: bool,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    /// Captured stack dump when the harness trapped a panic.
    #[serde(default)]
    pub stack_dump: Option<String>,
    pub elapsed_ms: u64,
}

/// Output of one arena battle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleResult {
    pub candidate: String,
    pub survived: bool,
    pub attacks_run: usize,
    pub failures: usize,
    pub outcomes: Vec<AttackOutcome>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// The attack that ended the battle, when defeated.
    #[serde(default)]
    pub fatal_attack: Option<AttackOutcome>,
}

// ---------------------------------------------------------------------------
// Compile result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileResult {
    pub success: bool,
    /// Path of the produced binary when successful.
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    /// SHA-256 of the binary contents.
    #[serde(default)]
    pub content_hash: Option<String>,
    /// Compiler diagnostics on failure.
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// Loop result
// ---------------------------------------------------------------------------

/// Stage reached by a loop invocation. Terminal stages are `Complete`,
/// `Rejected`, and `Panic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopStage {
    Proposal,
    Audit,
    Arena,
    Simulation,
    Commit,
    Complete,
    Rejected,
    Panic,
}

impl std::fmt::Display for LoopStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopStage::Proposal => "proposal",
            LoopStage::Audit => "audit",
            LoopStage::Arena => "arena",
            LoopStage::Simulation => "simulation",
            LoopStage::Commit => "commit",
            LoopStage::Complete => "complete",
            LoopStage::Rejected => "rejected",
            LoopStage::Panic => "panic",
        };
        write!(f, "{}", s)
    }
}

/// Final result of one transactional synthesis attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopResult {
    pub success: bool,
    pub stage: LoopStage,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub safety_report: Option<SafetyReport>,
    #[serde(default)]
    pub compile_result: Option<CompileResult>,
    #[serde(default)]
    pub battle_result: Option<BattleResult>,
    /// The committed record on success.
    #[serde(default)]
    pub record: Option<CapabilityRecord>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl LoopResult {
    pub fn rejected(stage: LoopStage, error: impl Into<String>) -> Self {
        Self {
            success: false,
            stage,
            error: Some(error.into()),
            safety_report: None,
            compile_result: None,
            battle_result: None,
            record: None,
            duration: Duration::ZERO,
        }
    }
}

/// Snapshot of driver statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoopStats {
    pub runs_total: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub retries: u64,
    pub panics: u64,
    pub battles_fought: u64,
    pub battles_survived: u64,
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

/// Durations serialized as integer milliseconds for wire stability.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
