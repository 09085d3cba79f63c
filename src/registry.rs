//! Capability registry.
//!
//! In-memory map of capability name to record, restorable from the
//! on-disk artifact layout and able to invoke a registered capability
//! over the JSON wire. Readers list under a shared lock; writers
//! mutate under the exclusive side of the same lock. Invocation
//! counters live in a lock-free map so invoke() never blocks listers.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{CandidateArtifact, CapabilityRecord, CapabilitySchema, CompileResult};
use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub struct CapabilityRegistry {
    records: RwLock<IndexMap<String, CapabilityRecord>>,
    invocations: DashMap<String, u64>,
    execute_timeout: Duration,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("execute_timeout_ms", &self.execute_timeout.as_millis())
            .finish()
    }
}

impl CapabilityRegistry {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            records: RwLock::new(IndexMap::new()),
            invocations: DashMap::new(),
            execute_timeout: config.execute_timeout(),
        }
    }

    /// Insert a record for a compiled candidate, silently replacing any
    /// prior record with the same name. The artifact on disk must hash
    /// to the compile result's content hash.
    pub async fn register(
        &self,
        candidate: &CandidateArtifact,
        compile: &CompileResult,
    ) -> EngineResult<CapabilityRecord> {
        let binary_path = compile
            .binary_path
            .as_ref()
            .ok_or_else(|| EngineError::Generic("compile result has no binary".to_string()))?;
        let content_hash = compile
            .content_hash
            .clone()
            .ok_or_else(|| EngineError::Generic("compile result has no hash".to_string()))?;

        let on_disk = std::fs::read(binary_path)
            .map_err(|e| EngineError::io(format!("reading {}", binary_path.display()), e))?;
        let disk_hash = format!("{:x}", Sha256::digest(&on_disk));
        if disk_hash != content_hash {
            return Err(EngineError::Generic(format!(
                "artifact hash mismatch for '{}': recorded {} on disk {}",
                candidate.name, content_hash, disk_hash
            )));
        }

        let record = CapabilityRecord {
            name: candidate.name.clone(),
            description: candidate.description.clone(),
            artifact_path: binary_path.clone(),
            content_hash,
            schema: candidate.schema.clone(),
            registered_at: Utc::now(),
            invocation_count: 0,
        };

        let mut records = self.records.write().await;
        let replaced = records.insert(candidate.name.clone(), record.clone());
        self.invocations.insert(candidate.name.clone(), 0);
        drop(records);

        if replaced.is_some() {
            info!(name = %candidate.name, "capability record replaced");
        } else {
            info!(name = %candidate.name, "capability registered");
        }
        Ok(record)
    }

    pub async fn get(&self, name: &str) -> Option<CapabilityRecord> {
        let records = self.records.read().await;
        records.get(name).map(|r| self.with_counter(r))
    }

    pub async fn list(&self) -> Vec<CapabilityRecord> {
        let records = self.records.read().await;
        records.values().map(|r| self.with_counter(r)).collect()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.records.read().await.contains_key(name)
    }

    pub async fn deregister(&self, name: &str) -> bool {
        let mut records = self.records.write().await;
        let removed = records.shift_remove(name).is_some();
        if removed {
            self.invocations.remove(name);
            info!(name, "capability deregistered");
        }
        removed
    }

    /// Rebuild records by scanning the artifact directory. A binary
    /// without a matching source file is an orphan and is ignored; a
    /// record whose source disappeared is dropped. Idempotent.
    pub async fn restore(&self, sources_dir: &Path, binaries_dir: &Path) -> EngineResult<usize> {
        let mut restored = 0usize;
        let mut fresh: IndexMap<String, CapabilityRecord> = IndexMap::new();

        let entries = match std::fs::read_dir(binaries_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %binaries_dir.display(), "no compiled dir; nothing to restore");
                return Ok(0);
            }
            Err(e) => {
                return Err(EngineError::io(
                    format!("scanning {}", binaries_dir.display()),
                    e,
                ))
            }
        };

        for dir_entry in entries {
            let dir_entry =
                dir_entry.map_err(|e| EngineError::io("reading compiled dir entry", e))?;
            let path = dir_entry.path();
            if !path.is_file() {
                continue;
            }
            let name = match crate::utils::fs::file_stem(&path) {
                Some(name) => name,
                None => continue,
            };

            let source_path = sources_dir.join(format!("{}.rs", name));
            if !source_path.is_file() {
                warn!(name = %name, "orphan binary (no matching source); skipping");
                continue;
            }

            let bytes = std::fs::read(&path)
                .map_err(|e| EngineError::io(format!("hashing {}", path.display()), e))?;
            let content_hash = format!("{:x}", Sha256::digest(&bytes));

            fresh.insert(
                name.clone(),
                CapabilityRecord {
                    name: name.clone(),
                    description: format!("restored capability '{}'", name),
                    artifact_path: path,
                    content_hash,
                    schema: CapabilitySchema {
                        input: "string".to_string(),
                        output: "string".to_string(),
                    },
                    registered_at: Utc::now(),
                    invocation_count: 0,
                },
            );
            self.invocations.entry(name).or_insert(0);
            restored += 1;
        }

        let mut records = self.records.write().await;
        *records = fresh;
        info!(restored, "registry restored from disk");
        Ok(restored)
    }

    /// Invoke a registered capability over the JSON wire. Returns the
    /// `output` field or surfaces the capability's `error`. Increments
    /// the invocation counter exactly once per call that reaches the
    /// child process.
    pub async fn invoke(&self, name: &str, input: &str) -> EngineResult<String> {
        let record = self
            .get(name)
            .await
            .ok_or_else(|| EngineError::UnknownCapability(name.to_string()))?;

        if !record.artifact_path.is_file() {
            return Err(EngineError::Generic(format!(
                "artifact for '{}' missing on disk at {}",
                name,
                record.artifact_path.display()
            )));
        }

        let frame = serde_json::json!({ "input": input }).to_string();

        let mut child = Command::new(&record.artifact_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::io(format!("spawning capability '{}'", name), e))?;

        *self.invocations.entry(name.to_string()).or_insert(0) += 1;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(frame.as_bytes())
                .await
                .map_err(|e| EngineError::io("writing input frame", e))?;
            stdin
                .write_all(b"\n")
                .await
                .map_err(|e| EngineError::io("writing input frame", e))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| EngineError::io("closing capability stdin", e))?;
        }

        let output = match timeout(self.execute_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(EngineError::io("waiting on capability", e)),
            Err(_) => {
                return Err(EngineError::Timeout {
                    context: format!("invoking capability '{}'", name),
                    elapsed_ms: self.execute_timeout.as_millis() as u64,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let frame: serde_json::Value = serde_json::from_str(stdout.trim()).map_err(|e| {
            EngineError::Generic(format!(
                "capability '{}' produced an invalid output frame: {} ({})",
                name,
                e,
                stdout.trim().chars().take(120).collect::<String>()
            ))
        })?;

        if let Some(error) = frame.get("error").and_then(|v| v.as_str()) {
            if !error.is_empty() {
                return Err(EngineError::Generic(format!(
                    "capability '{}' failed: {}",
                    name, error
                )));
            }
        }
        if !output.status.success() {
            return Err(EngineError::Generic(format!(
                "capability '{}' exited with {}",
                name, output.status
            )));
        }

        Ok(frame
            .get("output")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    fn with_counter(&self, record: &CapabilityRecord) -> CapabilityRecord {
        let mut out = record.clone();
        out.invocation_count = self
            .invocations
            .get(&record.name)
            .map(|entry| *entry.value())
            .unwrap_or(0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::SandboxArena;
    use crate::compiler::Compiler;

    const ECHO: &str = r#"
pub fn run(input: &str) -> Result<String, String> {
    Ok(input.to_string())
}
"#;

    fn test_config() -> (tempfile::TempDir, EngineConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            workspace_root: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        (dir, config)
    }

    fn candidate(config: &EngineConfig, name: &str, source: &str) -> CandidateArtifact {
        CandidateArtifact {
            name: name.to_string(),
            source: source.to_string(),
            test_source: None,
            description: format!("{} capability", name),
            schema: CapabilitySchema {
                input: "string".to_string(),
                output: "string".to_string(),
            },
            target_path: config.source_path_for(name),
            validated: true,
            errors: Vec::new(),
        }
    }

    async fn compile_and_register(
        config: &EngineConfig,
        registry: &CapabilityRegistry,
        name: &str,
    ) -> CapabilityRecord {
        // the registry scan needs the canonical source on disk too
        crate::utils::fs::ensure_dir(&config.tools_path()).unwrap();
        std::fs::write(config.source_path_for(name), ECHO).unwrap();
        let compiled = Compiler::new(config)
            .compile(&candidate(config, name, ECHO))
            .await
            .unwrap();
        assert!(compiled.success, "errors: {:?}", compiled.errors);
        registry
            .register(&candidate(config, name, ECHO), &compiled)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_list_get_deregister() {
        if !SandboxArena::toolchain_available() {
            eprintln!("rustc unavailable; skipping registry test");
            return;
        }
        let (_dir, config) = test_config();
        let registry = CapabilityRegistry::new(&config);
        let record = compile_and_register(&config, &registry, "echo").await;

        assert_eq!(record.name, "echo");
        assert!(record.artifact_path.exists());

        let listed = registry.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content_hash, record.content_hash);

        assert!(registry.get("echo").await.is_some());
        assert!(registry.deregister("echo").await);
        assert!(registry.get("echo").await.is_none());
    }

    #[tokio::test]
    async fn listed_hash_matches_disk_after_registration() {
        if !SandboxArena::toolchain_available() {
            eprintln!("rustc unavailable; skipping registry test");
            return;
        }
        let (_dir, config) = test_config();
        let registry = CapabilityRegistry::new(&config);
        compile_and_register(&config, &registry, "echo").await;

        for record in registry.list().await {
            let bytes = std::fs::read(&record.artifact_path).unwrap();
            assert_eq!(
                record.content_hash,
                format!("{:x}", Sha256::digest(&bytes))
            );
        }
    }

    #[tokio::test]
    async fn invoke_round_trips_and_counts() {
        if !SandboxArena::toolchain_available() {
            eprintln!("rustc unavailable; skipping registry test");
            return;
        }
        let (_dir, config) = test_config();
        let registry = CapabilityRegistry::new(&config);
        compile_and_register(&config, &registry, "echo").await;

        let output = registry.invoke("echo", "hello wire").await.unwrap();
        assert_eq!(output, "hello wire");
        assert_eq!(registry.get("echo").await.unwrap().invocation_count, 1);

        let output = registry.invoke("echo", "again").await.unwrap();
        assert_eq!(output, "again");
        assert_eq!(registry.get("echo").await.unwrap().invocation_count, 2);
    }

    #[tokio::test]
    async fn restore_is_idempotent_and_skips_orphans() {
        if !SandboxArena::toolchain_available() {
            eprintln!("rustc unavailable; skipping registry test");
            return;
        }
        let (_dir, config) = test_config();
        let registry = CapabilityRegistry::new(&config);
        compile_and_register(&config, &registry, "echo").await;

        // an orphan binary with no matching source must be ignored
        std::fs::write(config.compiled_path().join("orphan"), b"not a real binary").unwrap();

        let fresh = CapabilityRegistry::new(&config);
        let restored = fresh
            .restore(&config.tools_path(), &config.compiled_path())
            .await
            .unwrap();
        assert_eq!(restored, 1);

        let first = fresh.list().await;
        let restored_again = fresh
            .restore(&config.tools_path(), &config.compiled_path())
            .await
            .unwrap();
        assert_eq!(restored_again, 1);
        let second = fresh.list().await;

        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].name, second[0].name);
        assert_eq!(first[0].content_hash, second[0].content_hash);

        // restored records still invoke
        let output = fresh.invoke("echo", "after restart").await.unwrap();
        assert_eq!(output, "after restart");
    }

    #[tokio::test]
    async fn invoking_unknown_capability_fails() {
        let (_dir, config) = test_config();
        let registry = CapabilityRegistry::new(&config);
        let err = registry.invoke("ghost", "x").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownCapability(_)));
    }
}
