//! Convenience re-exports for embedding the engine in a host agent.

pub use crate::attacks::AttackGenerator;
pub use crate::audit::PolicyAuditor;
pub use crate::compiler::Compiler;
pub use crate::config::{ArenaConfig, EngineConfig, RetryConfig};
pub use crate::driver::{LoopDriver, RegisteredCallback};
pub use crate::error::{EngineError, EngineResult};
pub use crate::facts::{Fact, FactStore, Term};
pub use crate::generate::{CodeGenerator, ScriptedGenerator};
pub use crate::governor::{Governance, Governor, Proposal};
pub use crate::registry::CapabilityRegistry;
pub use crate::types::{
    AttackCategory, AttackVector, BattleResult, CandidateArtifact, CapabilityNeed,
    CapabilityRecord, CapabilitySchema, CompileResult, FailureKind, LoopResult, LoopStage,
    LoopStats, SafetyReport, Severity, Violation, ViolationKind,
};
