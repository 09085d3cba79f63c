//! End-to-end loop scenarios driven through a scripted generator.
//!
//! These exercise the whole transaction: proposal, audit with retry
//! feedback, the arena round, governance simulation, commit, and
//! registration, asserting both the loop result and the governance
//! facts left behind. Tests that need `rustc` on the host gate on
//! toolchain availability.

use crate::arena::SandboxArena;
use crate::config::EngineConfig;
use crate::driver::LoopDriver;
use crate::error::EngineResult;
use crate::facts::{Fact, FactStore};
use crate::generate::ScriptedGenerator;
use crate::governor::{Governance, Governor, Proposal};
use crate::types::{CapabilityNeed, LoopStage, ViolationKind};
use std::sync::Arc;

const BANNED_IMPORT: &str = r#"
use std::net::TcpStream;

pub fn run(input: &str) -> Result<String, String> {
    let _ = TcpStream::connect(input);
    Ok(String::new())
}
"#;

const CLEAN_ECHO: &str = r#"
pub fn run(input: &str) -> Result<String, String> {
    Ok(input.to_string())
}
"#;

const CLEAN_ECHO_V2: &str = r#"
pub fn run(input: &str) -> Result<String, String> {
    let echoed = input.to_string();
    Ok(echoed)
}
"#;

/// Passes the audit (unwrap is only a warning) but dies in the arena on
/// any non-numeric payload.
const FRAGILE_PARSER: &str = r#"
pub fn run(input: &str) -> Result<String, String> {
    let n: i64 = input.trim().parse().unwrap();
    Ok(n.saturating_mul(2).to_string())
}
"#;

const HARDENED_PARSER: &str = r#"
pub fn run(input: &str) -> Result<String, String> {
    match input.trim().parse::<i64>() {
        Ok(n) => Ok(n.saturating_mul(2).to_string()),
        Err(_) => Err("input is not a number".to_string()),
    }
}
"#;

fn toolchain() -> bool {
    let available = SandboxArena::toolchain_available();
    if !available {
        eprintln!("rustc unavailable; skipping toolchain-bound scenario");
    }
    available
}

fn test_config(dir: &tempfile::TempDir) -> EngineConfig {
    EngineConfig {
        workspace_root: dir.path().to_path_buf(),
        enable_arena: false,
        ..EngineConfig::default()
    }
}

fn driver(config: EngineConfig, responses: &[&str]) -> LoopDriver {
    let generator = Arc::new(ScriptedGenerator::new(responses.iter().copied()));
    LoopDriver::new(config, generator).unwrap()
}

fn need(name: &str) -> CapabilityNeed {
    let mut need = CapabilityNeed::new(name, format!("{} capability", name));
    need.confidence = 0.8;
    need
}

fn count_fact(driver: &LoopDriver, predicate: &str) -> usize {
    driver.inspect_facts(|store| store.count(predicate))
}

#[tokio::test]
async fn forbidden_import_without_retries_rejects_at_audit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.retry.max_retries = 0;
    let driver = driver(config.clone(), &[BANNED_IMPORT]);

    let result = driver.run(&need("echo")).await;

    assert!(!result.success);
    assert_eq!(result.stage, LoopStage::Audit);
    let report = result.safety_report.expect("safety report");
    assert!(report
        .violations
        .iter()
        .any(|v| v.kind == ViolationKind::ForbiddenImport));

    assert_eq!(count_fact(&driver, "tool_registered"), 0);
    assert_eq!(count_fact(&driver, "retry_attempt"), 0);
    assert!(!config.source_path_for("echo").exists());
    assert!(!config.artifact_path_for("echo").exists());
}

#[tokio::test]
async fn safety_retry_converges_to_a_registered_capability() {
    if !toolchain() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let driver = driver(config, &[BANNED_IMPORT, CLEAN_ECHO]);

    let result = driver.run(&need("echo")).await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.stage, LoopStage::Complete);
    assert!(driver.registry().get("echo").await.is_some());

    // exactly one safety retry, and iterations match proposals
    let retries = driver.inspect_facts(|store| {
        store
            .with_predicate("retry_attempt")
            .iter()
            .map(|f| {
                (
                    f.args[1].as_int().unwrap(),
                    f.args[2].as_str().unwrap().to_string(),
                )
            })
            .collect::<Vec<_>>()
    });
    assert_eq!(retries, vec![(1, "safety_violation".to_string())]);
    assert_eq!(count_fact(&driver, "iteration"), 2);

    let stats = driver.stats();
    assert_eq!(stats.runs_succeeded, 1);
    assert_eq!(stats.retries, 1);
}

#[tokio::test]
async fn byte_identical_source_trips_stagnation_on_the_second_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    // the same unsafe source twice: attempt 1 retries, attempt 2 stagnates
    let driver = driver(config, &[BANNED_IMPORT, BANNED_IMPORT]);

    let result = driver.run(&need("echo")).await;

    assert!(!result.success);
    assert!(
        result.error.as_deref().unwrap_or("").contains("stagnation"),
        "error: {:?}",
        result.error
    );

    // each distinct hash appears at most once in the history window
    let hashes = driver.inspect_facts(|store| {
        store
            .with_predicate("history")
            .iter()
            .map(|f| f.args[1].as_str().unwrap().to_string())
            .collect::<Vec<_>>()
    });
    let mut deduped = hashes.clone();
    deduped.dedup();
    assert_eq!(hashes.len(), deduped.len());
    assert_eq!(count_fact(&driver, "iteration"), 2);
}

#[tokio::test]
async fn arena_defeat_then_hardened_regeneration_registers_once() {
    if !toolchain() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.enable_arena = true;
    config.max_adversarial_retries = 1;
    let driver = driver(config, &[FRAGILE_PARSER, HARDENED_PARSER]);

    let result = driver.run(&need("doubler")).await;
    assert!(result.success, "error: {:?}", result.error);

    // verdict order: defeated, then survived, then battle_hardened
    let timeline = driver.inspect_facts(|store| {
        store
            .all()
            .iter()
            .filter(|f| {
                f.predicate == "panic_maker_verdict" || f.predicate == "battle_hardened"
            })
            .map(|f| {
                if f.predicate == "battle_hardened" {
                    "hardened".to_string()
                } else {
                    f.args[1].as_str().unwrap().to_string()
                }
            })
            .collect::<Vec<_>>()
    });
    assert_eq!(timeline, vec!["defeated", "survived", "hardened"]);

    assert_eq!(count_fact(&driver, "attack_killed"), 1);
    assert_eq!(count_fact(&driver, "tool_registered"), 1);
    assert_eq!(driver.registry().list().await.len(), 1);

    let retry_reasons = driver.inspect_facts(|store| {
        store
            .with_predicate("retry_attempt")
            .iter()
            .map(|f| f.args[2].as_str().unwrap().to_string())
            .collect::<Vec<_>>()
    });
    assert_eq!(retry_reasons, vec!["adversarial_kill".to_string()]);
}

/// Delegates to a real governor but panics when the simulation asks for
/// a transition verdict.
struct PanickingGovernor {
    inner: Governor,
}

impl Governance for PanickingGovernor {
    fn assert_fact(&mut self, fact: Fact) -> EngineResult<()> {
        self.inner.assert_fact(fact)
    }
    fn should_halt(&mut self, step: &str) -> EngineResult<Option<String>> {
        self.inner.should_halt(step)
    }
    fn record_candidate(&mut self, step: &str, source_hash: &str) -> EngineResult<bool> {
        self.inner.record_candidate(step, source_hash)
    }
    fn propose(&mut self, proposal: Proposal) -> EngineResult<()> {
        self.inner.propose(proposal)
    }
    fn stagnation_detected(&mut self) -> EngineResult<bool> {
        self.inner.stagnation_detected()
    }
    fn valid_transition(&mut self, _step_next: &str) -> EngineResult<bool> {
        panic!("governor exploded during simulation");
    }
    fn converged(&mut self, step: &str) -> EngineResult<bool> {
        self.inner.converged(step)
    }
    fn facts(&self) -> &FactStore {
        self.inner.facts()
    }
}

#[tokio::test]
async fn governor_panic_in_simulation_is_trapped_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let generator = Arc::new(ScriptedGenerator::new([CLEAN_ECHO]));
    let governor = Box::new(PanickingGovernor {
        inner: Governor::new(&config).unwrap(),
    });
    let driver = LoopDriver::with_governor(config.clone(), generator, governor).unwrap();

    let result = driver.run(&need("echo")).await;

    assert!(!result.success);
    assert_eq!(result.stage, LoopStage::Panic);
    assert!(result
        .error
        .as_deref()
        .unwrap_or("")
        .contains("governor exploded"));

    assert_eq!(driver.stats().panics, 1);
    assert_eq!(count_fact(&driver, "error_event"), 1);
    assert_eq!(count_fact(&driver, "error_history"), 1);
    assert_eq!(count_fact(&driver, "tool_registered"), 0);
    assert!(!config.artifact_path_for("echo").exists());
}

#[tokio::test]
async fn hot_reload_versions_monotonically_across_runs() {
    if !toolchain() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let driver = driver(config, &[CLEAN_ECHO, CLEAN_ECHO_V2]);

    assert!(driver.run(&need("echo")).await.success);
    let versions = |driver: &LoopDriver| {
        driver.inspect_facts(|store| {
            store
                .with_predicate("tool_version")
                .iter()
                .map(|f| f.args[1].as_int().unwrap())
                .collect::<Vec<_>>()
        })
    };
    assert_eq!(versions(&driver), vec![1]);

    assert!(driver.run(&need("echo")).await.success);
    assert_eq!(versions(&driver), vec![1, 2]);

    let hot_loads = driver.inspect_facts(|store| {
        store
            .with_predicate("tool_hot_loaded")
            .iter()
            .map(|f| f.args[1].as_int().unwrap())
            .collect::<Vec<_>>()
    });
    assert_eq!(hot_loads.len(), 2);
    assert!(hot_loads[0] <= hot_loads[1]);
}

#[tokio::test]
async fn committed_run_asserts_facts_in_stage_order_and_fires_callback() {
    if !toolchain() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let driver = driver(config.clone(), &[CLEAN_ECHO]);

    let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    driver.set_registered_callback(Box::new(move |record| {
        if let Ok(mut names) = sink.lock() {
            names.push(record.name.clone());
        }
    }));

    let result = driver.run(&need("echo")).await;
    assert!(result.success, "error: {:?}", result.error);
    let record = result.record.expect("record");
    assert!(record.artifact_path.exists());
    assert!(config.source_path_for("echo").exists());

    // the callback fired once, after registration
    assert_eq!(*seen.lock().unwrap(), vec!["echo".to_string()]);

    // fact sequence is linearizable with the stage order
    let first_index = |predicate: &str| {
        driver.inspect_facts(|store| {
            store
                .all()
                .iter()
                .position(|f| f.predicate == predicate)
                .unwrap_or(usize::MAX)
        })
    };
    let iteration = first_index("iteration");
    let history = first_index("history");
    let proposed = first_index("proposed");
    let registered = first_index("tool_registered");
    let version = first_index("tool_version");
    assert!(iteration < history, "iteration before proposal hash");
    assert!(history < proposed, "proposal hash before simulation");
    assert!(proposed < registered, "simulation before registration");
    assert!(registered < version, "registration before hot-reload version");

    // the recorded hash matches the fact
    let fact_hash = driver.inspect_facts(|store| {
        store.with_predicate("tool_hash")[0].args[1]
            .as_str()
            .unwrap()
            .to_string()
    });
    assert_eq!(fact_hash, record.content_hash);

    // and the capability round-trips over the wire
    let output = driver.registry().invoke("echo", "ping").await.unwrap();
    assert_eq!(output, "ping");
    assert_eq!(
        driver.registry().get("echo").await.unwrap().invocation_count,
        1
    );
}

#[tokio::test]
async fn iteration_budget_halts_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.max_iterations = 3;
    config.retry.max_retries = 10;
    config.retry.retry_delay_ms = 1;
    // distinct unsafe sources so stagnation never preempts the budget
    let sources: Vec<String> = (0..4)
        .map(|i| format!("{}\n// attempt {}\n", BANNED_IMPORT, i))
        .collect();
    let refs: Vec<&str> = sources.iter().map(|s| s.as_str()).collect();
    let driver = driver(config, &refs);

    let result = driver.run(&need("echo")).await;

    assert!(!result.success);
    assert!(
        result
            .error
            .as_deref()
            .unwrap_or("")
            .contains("iterations_exhausted"),
        "error: {:?}",
        result.error
    );
    assert_eq!(count_fact(&driver, "iteration"), 3);
}

#[tokio::test]
async fn generation_failure_is_terminal_at_proposal() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    // empty script: the generator fails on the first call
    let driver = driver(config, &[]);

    let result = driver.run(&need("echo")).await;
    assert!(!result.success);
    assert_eq!(result.stage, LoopStage::Proposal);
    assert!(result.error.unwrap().contains("generation failed"));
}

#[tokio::test]
async fn oversized_candidate_takes_the_retry_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.max_candidate_size = 256;
    config.retry.max_retries = 0;
    let big = format!(
        "pub fn run(input: &str) -> Result<String, String> {{ Ok(input.to_string()) }}\n// {}",
        "x".repeat(512)
    );
    let driver = driver(config, &[big.as_str()]);

    let result = driver.run(&need("echo")).await;
    assert!(!result.success);
    assert_eq!(result.stage, LoopStage::Audit);
    let report = result.safety_report.unwrap();
    assert!(report.violations[0].description.contains("cap"));
}

#[tokio::test]
async fn invalid_capability_name_is_rejected_before_any_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let driver = driver(test_config(&dir), &[CLEAN_ECHO]);

    let result = driver.run(&need("not a name")).await;
    assert!(!result.success);
    assert_eq!(result.stage, LoopStage::Proposal);
    assert_eq!(count_fact(&driver, "iteration"), 0);
}
