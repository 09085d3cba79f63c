//! Sandbox arena.
//!
//! Compiles a harness around the candidate and runs adversarial
//! payloads against it in isolated child processes, classifying each
//! outcome from exit codes and captured stderr. Each battle owns a
//! unique working directory; child processes are bounded by wall clock
//! and a resident-set ceiling.

pub mod entry;
pub mod harness;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    AttackCategory, AttackOutcome, AttackVector, BattleResult, FailureKind,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Grace added to the per-attack timeout before the parent kills the
/// child; the in-harness watchdog should fire first.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Cap on the payload line handed to the harness.
const MAX_HARNESS_INPUT_BYTES: usize = 1 << 20;

pub struct SandboxArena {
    attack_timeout: Duration,
    compile_timeout: Duration,
    max_memory_mb: u64,
    parallel: usize,
}

impl std::fmt::Debug for SandboxArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxArena")
            .field("attack_timeout_ms", &self.attack_timeout.as_millis())
            .field("parallel", &self.parallel)
            .finish()
    }
}

impl SandboxArena {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            attack_timeout: config.arena_timeout(),
            compile_timeout: config.compile_timeout(),
            max_memory_mb: config.arena.max_memory_mb,
            parallel: config.arena.parallel.max(1).min(num_cpus::get()),
        }
    }

    /// Whether a Rust toolchain is present on this host. Battles cannot
    /// run without one; callers decide how to degrade.
    pub fn toolchain_available() -> bool {
        std::process::Command::new("rustc")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the battle: compile the harness, then pipe each attack into a
    /// fresh invocation, stopping at the first non-survived outcome.
    pub async fn battle(
        &self,
        candidate_name: &str,
        candidate_source: &str,
        attacks: &[AttackVector],
    ) -> EngineResult<BattleResult> {
        let started = Instant::now();
        let battle_id = Uuid::new_v4();
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("arena-{}-{}-", candidate_name, battle_id.simple()))
            .tempdir()
            .map_err(|e| EngineError::io("creating arena dir", e))?;

        info!(
            battle = %battle_id,
            candidate = candidate_name,
            attacks = attacks.len(),
            dir = %work_dir.path().display(),
            "arena battle starting"
        );

        let binary = match self.build_harness(candidate_source, work_dir.path()).await {
            Ok(path) => path,
            Err(diagnostics) => {
                // A candidate that cannot be built never survives.
                warn!(candidate = candidate_name, "harness build failed");
                let outcome = AttackOutcome {
                    attack: build_failure_vector(),
                    survived: false,
                    failure: Some(FailureKind::CompileFailed),
                    stack_dump: Some(diagnostics),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                return Ok(BattleResult {
                    candidate: candidate_name.to_string(),
                    survived: false,
                    attacks_run: 0,
                    failures: 1,
                    outcomes: vec![outcome.clone()],
                    duration: started.elapsed(),
                    fatal_attack: Some(outcome),
                });
            }
        };

        let mut outcomes: Vec<AttackOutcome> = Vec::new();
        let mut fatal: Option<AttackOutcome> = None;

        for batch in attacks.chunks(self.parallel) {
            let runs = batch
                .iter()
                .map(|attack| self.run_attack(&binary, attack));
            let batch_outcomes = futures::future::join_all(runs).await;
            for outcome in batch_outcomes {
                let dead = !outcome.survived;
                outcomes.push(outcome.clone());
                if dead && fatal.is_none() {
                    fatal = Some(outcome);
                }
            }
            if fatal.is_some() {
                break;
            }
        }

        let failures = outcomes.iter().filter(|o| !o.survived).count();
        let survived = fatal.is_none();
        debug!(
            candidate = candidate_name,
            survived,
            failures,
            run = outcomes.len(),
            "arena battle finished"
        );

        Ok(BattleResult {
            candidate: candidate_name.to_string(),
            survived,
            attacks_run: outcomes.len(),
            failures,
            outcomes,
            duration: started.elapsed(),
            fatal_attack: fatal,
        })
    }

    /// Compile the harness with optimizations off. Returns the binary
    /// path, or the compiler diagnostics on failure.
    async fn build_harness(
        &self,
        candidate_source: &str,
        work_dir: &Path,
    ) -> Result<PathBuf, String> {
        let entry = match entry::discover_entry(candidate_source) {
            Ok(entry) => entry,
            Err(e) => return Err(format!("entry discovery failed: {}", e)),
        };
        debug!(entry = %entry.name, score = entry.score, "arena entry selected");

        let source = harness::render_harness(
            candidate_source,
            &entry,
            self.attack_timeout.as_millis() as u64,
            self.max_memory_mb,
            MAX_HARNESS_INPUT_BYTES,
        );
        let main_path = work_dir.join("main.rs");
        let binary_path = work_dir.join("arena_bin");
        if let Err(e) = tokio::fs::write(&main_path, &source).await {
            return Err(format!("writing harness: {}", e));
        }

        let mut cmd = Command::new("rustc");
        cmd.arg("--edition")
            .arg("2021")
            .arg("-C")
            .arg("opt-level=0")
            .arg("-C")
            .arg("debuginfo=0")
            .arg("-o")
            .arg(&binary_path)
            .arg(&main_path)
            .env("RUST_BACKTRACE", "1")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Err(format!("spawning rustc: {}", e)),
        };
        let output = match timeout(self.compile_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("rustc wait failed: {}", e)),
            Err(_) => {
                return Err(format!(
                    "harness build timed out after {}ms",
                    self.compile_timeout.as_millis()
                ))
            }
        };

        if output.status.success() {
            Ok(binary_path)
        } else {
            Err(String::from_utf8_lossy(&output.stderr).into_owned())
        }
    }

    /// One attack: fresh invocation, payload on stdin, classified exit.
    async fn run_attack(&self, binary: &Path, attack: &AttackVector) -> AttackOutcome {
        let started = Instant::now();
        let verdict = self.spawn_and_classify(binary, &attack.payload).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (survived, failure, stack_dump) = match verdict {
            Ok(classified) => classified,
            Err(e) => {
                warn!(attack = %attack.name, "attack run failed: {}", e);
                (false, Some(FailureKind::Unknown), Some(e.to_string()))
            }
        };

        AttackOutcome {
            attack: attack.clone(),
            survived,
            failure,
            stack_dump,
            elapsed_ms,
        }
    }

    async fn spawn_and_classify(
        &self,
        binary: &Path,
        payload: &str,
    ) -> EngineResult<(bool, Option<FailureKind>, Option<String>)> {
        let mut cmd = Command::new(binary);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_memory_rlimit(&mut cmd, self.max_memory_mb);

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::io("spawning arena binary", e))?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut line = payload.replace('\n', " ");
            line.push('\n');
            // the harness may exit before draining stdin; that's fine
            let _ = stdin.write_all(line.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let mut stdout_handle = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Generic("arena stdout not captured".to_string()))?;
        let mut stderr_handle = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Generic("arena stderr not captured".to_string()))?;

        let deadline = self.attack_timeout + KILL_GRACE;
        let status = match timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => return Err(EngineError::io("waiting on arena child", e)),
            Err(_) => {
                let _ = child.kill().await;
                None // parent deadline exceeded
            }
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let _ = stdout_handle.read_to_end(&mut stdout).await;
        let _ = stderr_handle.read_to_end(&mut stderr).await;
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        Ok(classify(status.map(|s| s.code()), &stdout, &stderr))
    }
}

/// Map exit signal and captured streams to a battle classification.
/// `status` is `None` when the parent deadline killed the child.
fn classify(
    status: Option<Option<i32>>,
    stdout: &str,
    stderr: &str,
) -> (bool, Option<FailureKind>, Option<String>) {
    if stderr.contains("PANIC:") {
        return (false, Some(FailureKind::Panic), Some(stderr.to_string()));
    }
    if stderr.contains("TIMEOUT:") {
        return (false, Some(FailureKind::Timeout), None);
    }
    if stderr.contains("OOM:") {
        return (false, Some(FailureKind::OutOfMemory), None);
    }
    if stderr.contains("DATA RACE") || stderr.contains("deadlock") {
        return (false, Some(FailureKind::Deadlock), Some(stderr.to_string()));
    }
    match status {
        None => (false, Some(FailureKind::Timeout), None),
        Some(code) => match code {
            Some(0) if stdout.contains("SURVIVED") => (true, None, None),
            Some(0) => (false, Some(FailureKind::Unknown), Some(stdout.to_string())),
            _ => (false, Some(FailureKind::Unknown), Some(stderr.to_string())),
        },
    }
}

/// Synthetic vector attributed to a harness build failure.
fn build_failure_vector() -> AttackVector {
    AttackVector {
        name: "harness-build".to_string(),
        category: AttackCategory::Memory,
        payload: String::new(),
        hypothesis: Some("candidate does not build inside the arena harness".to_string()),
    }
}

/// Belt-and-braces resident-set cap on the child, in addition to the
/// in-harness sampler.
#[cfg(unix)]
fn apply_memory_rlimit(cmd: &mut Command, max_memory_mb: u64) {
    if max_memory_mb == 0 {
        return;
    }
    let limit_bytes = max_memory_mb * 1024 * 1024;
    unsafe {
        cmd.pre_exec(move || {
            let rlimit = libc::rlimit {
                rlim_cur: limit_bytes as libc::rlim_t,
                rlim_max: limit_bytes as libc::rlim_t,
            };
            // post-fork context: no logging here; the in-harness
            // sampler still enforces the ceiling if this cap fails
            let _ = libc::setrlimit(libc::RLIMIT_RSS, &rlimit);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_memory_rlimit(_cmd: &mut Command, _max_memory_mb: u64) {}
