//! Loop Driver.
//!
//! Orchestrates one transactional synthesis attempt: propose, audit
//! (with retry-and-feedback), arena battle (with adversarial retry),
//! simulation against the Governor, then commit and register. Every
//! failure path surfaces in the [`LoopResult`]; panics in any stage are
//! trapped, recorded as governance facts, and returned with
//! `stage = Panic`. The engine, registry, and statistics are owned here
//! and passed to sub-components explicitly.

use crate::arena::SandboxArena;
use crate::attacks::AttackGenerator;
use crate::audit::PolicyAuditor;
use crate::compiler::Compiler;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::facts::{Fact, FactStore};
use crate::generate::CodeGenerator;
use crate::governor::{Governance, Governor, Proposal};
use crate::registry::CapabilityRegistry;
use crate::sanitize;
use crate::types::{
    BattleResult, CandidateArtifact, CapabilityNeed, CapabilityRecord, LoopResult, LoopStage,
    LoopStats, SafetyReport, Severity, Violation, ViolationKind,
};
use crate::utils::fs as enginefs;
use futures::FutureExt;
use itertools::Itertools;
use sha2::{Digest, Sha256};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

/// Invoked after a commit, once registration facts are asserted.
pub type RegisteredCallback = Box<dyn Fn(&CapabilityRecord) + Send + Sync>;

/// Statistics and the callback share one reader/writer lock.
#[derive(Default)]
struct SharedState {
    stats: LoopStats,
    callback: Option<RegisteredCallback>,
}

/// What a finished stage tells the iteration loop to do next.
enum StageFlow {
    Continue,
    Retry,
    Finish(LoopResult),
}

pub struct LoopDriver {
    config: EngineConfig,
    generator: Arc<dyn CodeGenerator>,
    governor: Mutex<Box<dyn Governance>>,
    auditor: PolicyAuditor,
    arena: SandboxArena,
    attack_generator: AttackGenerator,
    compiler: Compiler,
    registry: Arc<CapabilityRegistry>,
    shared: RwLock<SharedState>,
}

impl std::fmt::Debug for LoopDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopDriver")
            .field("config", &self.config.max_iterations)
            .finish()
    }
}

impl LoopDriver {
    pub fn new(config: EngineConfig, generator: Arc<dyn CodeGenerator>) -> EngineResult<Self> {
        config.validate()?;
        let governor: Box<dyn Governance> = Box::new(Governor::new(&config)?);
        Self::with_governor(config, generator, governor)
    }

    /// Dependency-injected constructor; tests substitute the governor.
    pub fn with_governor(
        config: EngineConfig,
        generator: Arc<dyn CodeGenerator>,
        governor: Box<dyn Governance>,
    ) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            auditor: PolicyAuditor::new(&config)?,
            arena: SandboxArena::new(&config),
            attack_generator: AttackGenerator::new(),
            compiler: Compiler::new(&config),
            registry: Arc::new(CapabilityRegistry::new(&config)),
            governor: Mutex::new(governor),
            generator,
            config,
            shared: RwLock::new(SharedState::default()),
        })
    }

    pub fn registry(&self) -> Arc<CapabilityRegistry> {
        Arc::clone(&self.registry)
    }

    /// Restore the registry from the configured on-disk layout.
    pub async fn restore_registry(&self) -> EngineResult<usize> {
        self.registry
            .restore(&self.config.tools_path(), &self.config.compiled_path())
            .await
    }

    pub fn set_registered_callback(&self, callback: RegisteredCallback) {
        if let Ok(mut shared) = self.shared.write() {
            shared.callback = Some(callback);
        }
    }

    pub fn stats(&self) -> LoopStats {
        self.shared
            .read()
            .map(|shared| shared.stats.clone())
            .unwrap_or_default()
    }

    /// Inspect the governance fact store (tests, result reporting).
    pub fn inspect_facts<R>(&self, f: impl FnOnce(&FactStore) -> R) -> R {
        let governor = lock_recovering(&self.governor);
        f(governor.facts())
    }

    /// Run one transactional synthesis attempt for `need`.
    pub async fn run(&self, need: &CapabilityNeed) -> LoopResult {
        let started = Instant::now();
        self.with_stats(|stats| stats.runs_total += 1);
        log::info!(
            "[Loop] synthesis starting for '{}' ({})",
            need.name,
            need.purpose
        );

        let outcome = AssertUnwindSafe(self.run_inner(need)).catch_unwind().await;
        let mut result = match outcome {
            Ok(result) => result,
            Err(payload) => self.record_panic(need, payload),
        };
        result.duration = started.elapsed();

        self.with_stats(|stats| {
            if result.success {
                stats.runs_succeeded += 1;
            } else {
                stats.runs_failed += 1;
            }
        });
        log::info!(
            "[Loop] synthesis for '{}' finished: success={} stage={} ({}ms)",
            need.name,
            result.success,
            result.stage,
            result.duration.as_millis()
        );
        result
    }

    async fn run_inner(&self, need: &CapabilityNeed) -> LoopResult {
        if !need.has_valid_name() {
            return LoopResult::rejected(
                LoopStage::Proposal,
                format!("invalid capability name '{}'", need.name),
            );
        }

        let step = need.step_id();
        let mut iteration: i64 = 0;
        let mut safety_retries: u32 = 0;
        let mut adversarial_retries: u32 = 0;
        let mut feedback_violations: Vec<Violation> = Vec::new();
        let mut prior_source: Option<String> = None;
        let mut last_report: Option<SafetyReport> = None;

        loop {
            // 1. the Governor speaks first
            match self.governor_mut(|g| g.should_halt(&step)) {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    let mut result = LoopResult::rejected(
                        LoopStage::Rejected,
                        format!("halted by governor: {}", reason),
                    );
                    result.safety_report = last_report;
                    return result;
                }
                Err(e) => {
                    return LoopResult::rejected(
                        LoopStage::Rejected,
                        format!("governor halt query failed: {}", e),
                    )
                }
            }

            // 2. this pass is an iteration
            iteration += 1;
            if let Err(e) = self.governor_mut(|g| g.assert_fact(Fact::iteration(&step, iteration)))
            {
                return LoopResult::rejected(LoopStage::Rejected, e.to_string());
            }

            // 3. proposal
            let source = match self
                .propose_candidate(need, &feedback_violations, prior_source.as_deref())
                .await
            {
                Ok(source) => source,
                Err(e) => {
                    return LoopResult::rejected(
                        LoopStage::Proposal,
                        format!("generation failed: {}", e),
                    )
                }
            };

            if let Some(prior) = prior_source.as_deref() {
                self.record_lazy_fixes(&step, prior, &source);
            }

            if let Some(violation) = self.size_violation(&source) {
                match self.handle_unsafe_audit(
                    &step,
                    synthetic_report(violation),
                    &mut safety_retries,
                    &mut feedback_violations,
                    &mut prior_source,
                    source,
                ) {
                    StageFlow::Retry => {
                        tokio::time::sleep(self.config.retry_delay()).await;
                        continue;
                    }
                    StageFlow::Finish(result) => return result,
                    StageFlow::Continue => continue,
                }
            }

            let source_hash = format!("{:x}", Sha256::digest(source.as_bytes()));
            match self.governor_mut(|g| g.record_candidate(&step, &source_hash)) {
                Ok(false) => {}
                Ok(true) => {
                    return LoopResult::rejected(
                        LoopStage::Simulation,
                        "stagnation: candidate repeats a previously proposed source".to_string(),
                    )
                }
                Err(e) => return LoopResult::rejected(LoopStage::Rejected, e.to_string()),
            }

            // 4. audit
            let report = self.auditor.check(&source);
            log::debug!(
                "[Loop] audit of '{}': safe={} score={:.2} violations={}",
                need.name,
                report.safe,
                report.score,
                report.violations.len()
            );
            if !report.safe {
                last_report = Some(report.clone());
                match self.handle_unsafe_audit(
                    &step,
                    report,
                    &mut safety_retries,
                    &mut feedback_violations,
                    &mut prior_source,
                    source,
                ) {
                    StageFlow::Retry => {
                        tokio::time::sleep(self.config.retry_delay()).await;
                        continue;
                    }
                    StageFlow::Finish(result) => return result,
                    StageFlow::Continue => continue,
                }
            }
            let audit_violations = report.violations.len();
            last_report = Some(report);

            // 5. arena
            if self.config.enable_arena {
                match self
                    .arena_stage(
                        need,
                        &step,
                        &source,
                        &mut adversarial_retries,
                        &mut feedback_violations,
                    )
                    .await
                {
                    Ok(StageFlow::Continue) => {}
                    Ok(StageFlow::Retry) => {
                        prior_source = Some(source);
                        continue;
                    }
                    Ok(StageFlow::Finish(mut result)) => {
                        result.safety_report = last_report;
                        return result;
                    }
                    Err(e) => {
                        let mut result =
                            LoopResult::rejected(LoopStage::Arena, format!("arena failed: {}", e));
                        result.safety_report = last_report;
                        return result;
                    }
                }
            }

            // 6. simulation
            let step_next = format!("{}_i{}", step, iteration);
            let proposal = Proposal {
                step: step.clone(),
                step_next: step_next.clone(),
                confidence: need.confidence,
                loc: source.lines().count() as i64,
                new_violations: audit_violations,
            };
            if let StageFlow::Finish(mut result) = self.simulation_stage(&step, &step_next, proposal)
            {
                result.safety_report = last_report;
                return result;
            }

            // 7 + 8. commit and register
            let mut result = self.commit_stage(need, &source).await;
            result.safety_report = last_report;
            return result;
        }
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    async fn propose_candidate(
        &self,
        need: &CapabilityNeed,
        violations: &[Violation],
        prior_source: Option<&str>,
    ) -> anyhow::Result<String> {
        let feedback = if violations.is_empty() {
            None
        } else {
            Some(render_feedback(violations, prior_source))
        };
        let raw = self.generator.generate(need, feedback.as_deref()).await?;
        let normalized = sanitize::normalize_generated(&raw);
        // best-effort; imperative candidates pass through untouched
        Ok(sanitize::sanitize(&normalized))
    }

    fn size_violation(&self, source: &str) -> Option<Violation> {
        if source.trim().is_empty() {
            return Some(Violation {
                kind: ViolationKind::PolicyViolation,
                location: "candidate.rs".to_string(),
                description: "candidate source is empty after sanitization".to_string(),
                severity: Severity::Blocking,
                code: Some("SIZE000".to_string()),
                suggestion: Some("emit the full capability source".to_string()),
            });
        }
        if source.len() > self.config.max_candidate_size {
            return Some(Violation {
                kind: ViolationKind::PolicyViolation,
                location: "candidate.rs".to_string(),
                description: format!(
                    "candidate is {} bytes, over the {}-byte cap",
                    source.len(),
                    self.config.max_candidate_size
                ),
                severity: Severity::Blocking,
                code: Some("SIZE001".to_string()),
                suggestion: Some("generate a smaller, focused implementation".to_string()),
            });
        }
        None
    }

    /// Shared handling for a failed audit (and audit-equivalent
    /// failures such as the size cap): retry with feedback while budget
    /// remains, otherwise reject with the report attached.
    fn handle_unsafe_audit(
        &self,
        step: &str,
        report: SafetyReport,
        safety_retries: &mut u32,
        feedback_violations: &mut Vec<Violation>,
        prior_source: &mut Option<String>,
        source: String,
    ) -> StageFlow {
        if *safety_retries < self.config.retry.max_retries {
            *safety_retries += 1;
            let attempt = *safety_retries as i64;
            if let Err(e) = self.governor_mut(|g| {
                g.assert_fact(Fact::retry_attempt(step, attempt, "safety_violation"))
            }) {
                return StageFlow::Finish(LoopResult::rejected(
                    LoopStage::Rejected,
                    e.to_string(),
                ));
            }
            self.with_stats(|stats| stats.retries += 1);
            log::warn!(
                "[Loop] unsafe candidate for step '{}' (attempt {}); retrying with feedback",
                step,
                attempt
            );
            *feedback_violations = report.violations;
            *prior_source = Some(source);
            StageFlow::Retry
        } else {
            let mut result = LoopResult::rejected(
                LoopStage::Audit,
                format!(
                    "candidate rejected by safety audit after {} attempt(s)",
                    *safety_retries + 1
                ),
            );
            result.safety_report = Some(report);
            StageFlow::Finish(result)
        }
    }

    async fn arena_stage(
        &self,
        need: &CapabilityNeed,
        step: &str,
        source: &str,
        adversarial_retries: &mut u32,
        feedback_violations: &mut Vec<Violation>,
    ) -> EngineResult<StageFlow> {
        if !SandboxArena::toolchain_available() {
            log::warn!("[Loop] no Rust toolchain on host; arena round skipped");
            return Ok(StageFlow::Continue);
        }

        let attacks = self.attack_generator.generate(source);
        let battle = self.arena.battle(&need.name, source, &attacks).await?;
        self.with_stats(|stats| {
            stats.battles_fought += 1;
            if battle.survived {
                stats.battles_survived += 1;
            }
        });

        if battle.survived {
            self.governor_mut(|g| {
                g.assert_fact(Fact::panic_maker_verdict(&need.name, "survived"))?;
                g.assert_fact(Fact::battle_hardened(&need.name))
            })?;
            return Ok(StageFlow::Continue);
        }

        // defeat: record the verdict and the killing attack
        self.governor_mut(|g| g.assert_fact(Fact::panic_maker_verdict(&need.name, "defeated")))?;
        if let Some(fatal) = &battle.fatal_attack {
            let failure = fatal
                .failure
                .map(|f| f.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            self.governor_mut(|g| {
                g.assert_fact(Fact::attack_killed(&fatal.attack.name, &need.name, &failure))
            })?;
        }

        if *adversarial_retries < self.config.max_adversarial_retries {
            *adversarial_retries += 1;
            let attempt = *adversarial_retries as i64;
            self.governor_mut(|g| {
                g.assert_fact(Fact::retry_attempt(step, attempt, "adversarial_kill"))
            })?;
            self.with_stats(|stats| stats.retries += 1);
            log::warn!(
                "[Loop] '{}' defeated in the arena (attempt {}); regenerating",
                need.name,
                attempt
            );
            // hand the kill to the generator as a synthetic violation
            *feedback_violations = vec![battle_violation(&battle)];
            return Ok(StageFlow::Retry);
        }

        let fatal_desc = battle
            .fatal_attack
            .as_ref()
            .map(|f| {
                format!(
                    "fatal attack '{}' ({}): {}",
                    f.attack.name,
                    f.attack.category,
                    f.failure
                        .map(|k| k.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                )
            })
            .unwrap_or_else(|| "defeated".to_string());
        let mut result = LoopResult::rejected(
            LoopStage::Arena,
            format!("candidate defeated in the arena: {}", fatal_desc),
        );
        result.battle_result = Some(battle);
        Ok(StageFlow::Finish(result))
    }

    fn simulation_stage(
        &self,
        step: &str,
        step_next: &str,
        proposal: Proposal,
    ) -> StageFlow {
        if let Err(e) = self.governor_mut(|g| g.propose(proposal)) {
            return StageFlow::Finish(LoopResult::rejected(LoopStage::Rejected, e.to_string()));
        }

        match self.governor_mut(|g| g.stagnation_detected()) {
            Ok(false) => {}
            Ok(true) => {
                return StageFlow::Finish(LoopResult::rejected(
                    LoopStage::Simulation,
                    "stagnation: proposed state repeats prior history".to_string(),
                ))
            }
            Err(e) => {
                return StageFlow::Finish(LoopResult::rejected(
                    LoopStage::Simulation,
                    format!("stagnation query failed: {}", e),
                ))
            }
        }

        match self.governor_mut(|g| g.valid_transition(step_next)) {
            Ok(true) => {}
            Ok(false) => {
                return StageFlow::Finish(LoopResult::rejected(
                    LoopStage::Simulation,
                    format!("unstable: governor rejected transition to {}", step_next),
                ))
            }
            Err(e) => {
                return StageFlow::Finish(LoopResult::rejected(
                    LoopStage::Simulation,
                    format!("transition query failed: {}", e),
                ))
            }
        }

        match self.governor_mut(|g| g.converged(step)) {
            Ok(true) => log::info!("[Loop] step '{}' converged; committing and exiting", step),
            Ok(false) => {}
            Err(e) => log::debug!("[Loop] convergence query failed (ignored): {}", e),
        }
        StageFlow::Continue
    }

    async fn commit_stage(&self, need: &CapabilityNeed, source: &str) -> LoopResult {
        let target_path = self.config.source_path_for(&need.name);
        let mut candidate = CandidateArtifact::from_need(need, source.to_string(), target_path);
        candidate.validated = true;

        if let Some(parent) = candidate.target_path.parent() {
            if let Err(e) = enginefs::ensure_dir(parent) {
                return LoopResult::rejected(LoopStage::Commit, e.to_string());
            }
        }
        if let Err(e) = std::fs::write(&candidate.target_path, source) {
            return LoopResult::rejected(
                LoopStage::Commit,
                format!("writing candidate source: {}", e),
            );
        }

        let compile_result = match self.compiler.compile(&candidate).await {
            Ok(result) => result,
            Err(e) => {
                self.rollback_commit(&candidate, None);
                return LoopResult::rejected(LoopStage::Commit, format!("compile failed: {}", e));
            }
        };
        if !compile_result.success {
            self.rollback_commit(&candidate, None);
            let mut result = LoopResult::rejected(
                LoopStage::Commit,
                format!("compile failed: {}", compile_result.errors.iter().join("; ")),
            );
            result.compile_result = Some(compile_result);
            return result;
        }

        // register: record first, then facts, then the callback
        let record = match self.registry.register(&candidate, &compile_result).await {
            Ok(record) => record,
            Err(e) => {
                self.rollback_commit(&candidate, compile_result.binary_path.as_deref());
                let mut result = LoopResult::rejected(
                    LoopStage::Commit,
                    format!("registration failed: {}", e),
                );
                result.compile_result = Some(compile_result);
                return result;
            }
        };

        // From here on the commit stands: registration facts and the
        // callback are best-effort and never undo the record.
        if let Err(e) = self.assert_registration_facts(&record) {
            log::error!("[Loop] registration facts failed after commit: {}", e);
        }
        self.invoke_registered_callback(&record);

        LoopResult {
            success: true,
            stage: LoopStage::Complete,
            error: None,
            safety_report: None,
            compile_result: Some(compile_result),
            battle_result: None,
            record: Some(record),
            duration: std::time::Duration::ZERO,
        }
    }

    // ------------------------------------------------------------------
    // Commit helpers
    // ------------------------------------------------------------------

    fn assert_registration_facts(&self, record: &CapabilityRecord) -> EngineResult<()> {
        let name = record.name.clone();
        let hash = record.content_hash.clone();
        let description = record.description.clone();
        let path = record.artifact_path.display().to_string();
        let hot_reload = self.config.hot_reload;

        self.governor_mut(move |g| {
            g.assert_fact(Fact::tool_registered(&name))?;
            g.assert_fact(Fact::tool_hash(&name, &hash))?;
            g.assert_fact(Fact::has_capability(&name))?;
            g.assert_fact(Fact::tool_description(&name, &description))?;
            g.assert_fact(Fact::tool_binary_path(&name, &path))?;

            if hot_reload {
                let next_version = g
                    .facts()
                    .with_predicate("tool_version")
                    .iter()
                    .filter(|f| f.args.first().and_then(|t| t.as_str()) == Some(name.as_str()))
                    .filter_map(|f| f.args.get(1).and_then(|t| t.as_int()))
                    .max()
                    .unwrap_or(0)
                    + 1;
                g.assert_fact(Fact::tool_hot_loaded(&name))?;
                g.assert_fact(Fact::tool_version(&name, next_version))?;
            }
            Ok(())
        })
    }

    fn invoke_registered_callback(&self, record: &CapabilityRecord) {
        let shared = match self.shared.read() {
            Ok(shared) => shared,
            Err(_) => return,
        };
        if let Some(callback) = shared.callback.as_ref() {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(record)));
            if outcome.is_err() {
                log::error!(
                    "[Loop] registered-callback panicked for '{}'; commit stands",
                    record.name
                );
            }
        }
    }

    /// Abort after a partial commit: remove the written source and any
    /// artifact so no residue outlives the transaction.
    fn rollback_commit(&self, candidate: &CandidateArtifact, artifact: Option<&std::path::Path>) {
        if let Err(e) = enginefs::remove_if_exists(&candidate.target_path) {
            log::warn!("[Loop] rollback could not remove source: {}", e);
        }
        if let Some(path) = artifact {
            if let Err(e) = enginefs::remove_if_exists(path) {
                log::warn!("[Loop] rollback could not remove artifact: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Panic and lazy-fix bookkeeping
    // ------------------------------------------------------------------

    fn record_panic(
        &self,
        need: &CapabilityNeed,
        payload: Box<dyn std::any::Any + Send>,
    ) -> LoopResult {
        let message = panic_message(payload);
        log::error!("[Loop] panic during synthesis of '{}': {}", need.name, message);

        self.with_stats(|stats| stats.panics += 1);
        let step = need.step_id();
        let record = self.governor_mut(|g| {
            g.assert_fact(Fact::error_event("panic"))?;
            g.assert_fact(Fact::error_history(&step, "panic"))
        });
        if let Err(e) = record {
            log::error!("[Loop] could not record panic facts: {}", e);
        }

        LoopResult::rejected(LoopStage::Panic, format!("panic recovered: {}", message))
    }

    /// Compare a retry candidate against its predecessor for lazy-fix
    /// patterns; the Governor penalizes tags that keep recurring.
    fn record_lazy_fixes(&self, step: &str, prior: &str, current: &str) {
        let tags = detect_lazy_fixes(prior, current);
        for tag in tags {
            if let Err(e) = self.governor_mut(|g| g.assert_fact(Fact::lazy_fix(step, tag))) {
                log::warn!("[Loop] could not record lazy-fix '{}': {}", tag, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared-state plumbing
    // ------------------------------------------------------------------

    fn with_stats(&self, f: impl FnOnce(&mut LoopStats)) {
        if let Ok(mut shared) = self.shared.write() {
            f(&mut shared.stats);
        }
    }

    fn governor_mut<R>(
        &self,
        f: impl FnOnce(&mut (dyn Governance + '_)) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let mut governor = lock_recovering(&self.governor);
        f(governor.as_mut())
    }
}

/// Lock the governor, recovering from poison left by a trapped panic:
/// the store is append-only, so a recovered guard is still consistent.
fn lock_recovering(
    governor: &Mutex<Box<dyn Governance>>,
) -> std::sync::MutexGuard<'_, Box<dyn Governance>> {
    governor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Turn a lost battle into the single synthetic violation handed back
/// to the generator.
fn battle_violation(battle: &BattleResult) -> Violation {
    let (location, description) = match &battle.fatal_attack {
        Some(fatal) => (
            format!("attack '{}'", fatal.attack.name),
            format!(
                "candidate was killed by the '{}' attack ({}): {}{}",
                fatal.attack.name,
                fatal.attack.category,
                fatal
                    .failure
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                fatal
                    .attack
                    .hypothesis
                    .as_deref()
                    .map(|h| format!("; hypothesis: {}", h))
                    .unwrap_or_default()
            ),
        ),
        None => ("arena".to_string(), "candidate lost the battle".to_string()),
    };
    Violation {
        kind: ViolationKind::AdversarialKill,
        location,
        description,
        severity: Severity::Blocking,
        code: Some("ARENA001".to_string()),
        suggestion: Some(
            "validate the input defensively before using it; never index or parse unchecked"
                .to_string(),
        ),
    }
}

/// Corrective guidance per violation kind, rendered into retry
/// feedback.
fn guidance_for(kind: ViolationKind) -> &'static str {
    match kind {
        ViolationKind::ForbiddenImport => {
            "Drop the import and use the allowed standard-library modules instead."
        }
        ViolationKind::Panic => {
            "Replace panicking calls with error returns; parse and index defensively."
        }
        ViolationKind::ConcurrencyLeak => {
            "Avoid spawning tasks, or accept a cancellation token and honor it in the task."
        }
        ViolationKind::UnsafePointer => "Remove all unsafe code; safe Rust only.",
        ViolationKind::ExternalNative => "Remove extern declarations and native bindings.",
        ViolationKind::Exec => "Do not launch external processes.",
        ViolationKind::Reflection => "Avoid runtime type inspection; use concrete types.",
        ViolationKind::ParseError => "Emit exactly one valid Rust source file, nothing else.",
        ViolationKind::AdversarialKill => {
            "Harden the entry function: handle empty, malformed, oversized, and extremal inputs gracefully."
        }
        ViolationKind::DangerousCall | ViolationKind::PolicyViolation => {
            "Follow the safety policy for generated capabilities."
        }
    }
}

/// Render violations as corrective feedback for the generator, with the
/// rejected source as a negative example.
fn render_feedback(violations: &[Violation], prior_source: Option<&str>) -> String {
    let mut out = String::from(
        "The previous candidate was rejected. Fix every issue below and regenerate the full source.\n\n",
    );
    out.push_str("Issues found:\n");
    for (i, violation) in violations.iter().enumerate() {
        out.push_str(&format!(
            "{}. [{}] {} at {} ({})\n",
            i + 1,
            violation.severity,
            violation.kind,
            violation.location,
            violation.description
        ));
        if let Some(suggestion) = &violation.suggestion {
            out.push_str(&format!("   fix: {}\n", suggestion));
        }
        out.push_str(&format!("   guidance: {}\n", guidance_for(violation.kind)));
    }
    if let Some(source) = prior_source {
        out.push_str("\nRejected source (do NOT repeat this):\n");
        out.push_str(source);
        out.push('\n');
    }
    out
}

/// Lexical deltas that look like a lazy fix rather than a real one.
fn detect_lazy_fixes(prior: &str, current: &str) -> Vec<&'static str> {
    let count = |s: &str, needles: &[&str]| -> usize {
        needles.iter().map(|n| s.matches(n).count()).sum()
    };
    let mut tags = Vec::new();
    if count(current, &["from_millis(", "from_secs(", "timeout"])
        > count(prior, &["from_millis(", "from_secs(", "timeout"])
    {
        tags.push("timeout_increase");
    }
    if count(current, &["retry", "attempt"]) > count(prior, &["retry", "attempt"]) {
        tags.push("retry_addition");
    }
    if count(current, &["let _ =", ".ok();", "unwrap_or_default()"])
        > count(prior, &["let _ =", ".ok();", "unwrap_or_default()"])
    {
        tags.push("error_swallow");
    }
    if count(current, &["Mutex::new"]) > count(prior, &["Mutex::new"]) {
        tags.push("mutex_wrap");
    }
    tags
}

fn synthetic_report(violation: Violation) -> SafetyReport {
    SafetyReport {
        safe: false,
        violations: vec![violation],
        imports_examined: 0,
        calls_examined: 0,
        score: 0.0,
    }
}
