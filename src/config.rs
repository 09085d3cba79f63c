//! Engine configuration.
//!
//! A closed configuration object: every recognized option is a named
//! field and unknown fields are rejected at construction. Durations are
//! expressed in milliseconds on the wire.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Absolute root for artifact and source paths. Defaults to
    /// `SELFFORGE_WORKSPACE` when set, else the current directory.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Where candidate source is written. Relative to `workspace_root`.
    #[serde(default = "default_tools_dir")]
    pub tools_dir: PathBuf,
    /// Where compiled artifacts are written. Relative to `workspace_root`.
    #[serde(default = "default_compiled_dir")]
    pub compiled_dir: PathBuf,
    /// Size cap on candidate source, in bytes.
    #[serde(default = "default_max_candidate_size")]
    pub max_candidate_size: usize,
    /// Bound on the compile step.
    #[serde(default = "default_compile_timeout_ms")]
    pub compile_timeout_ms: u64,
    /// End-to-end bound on invoking a registered capability.
    #[serde(default = "default_execute_timeout_ms")]
    pub execute_timeout_ms: u64,
    /// Enlarges the allowed-package set with network modules.
    #[serde(default)]
    pub allow_networking: bool,
    /// Enlarges the allowed-package set with filesystem modules.
    #[serde(default)]
    pub allow_filesystem: bool,
    /// Enlarges the allowed-package set with process-spawning modules.
    #[serde(default)]
    pub allow_external_exec: bool,
    /// Cross-build target OS; empty means the host.
    #[serde(default)]
    pub target_os: String,
    /// Cross-build target arch; empty means the host.
    #[serde(default)]
    pub target_arch: String,
    /// Maximum synthesis iterations before the Governor halts the loop.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Regenerate-after-defeat budget for the arena.
    #[serde(default = "default_max_adversarial_retries")]
    pub max_adversarial_retries: u32,
    /// Assert `tool_hot_loaded` and bump `tool_version` on commit.
    #[serde(default = "default_true")]
    pub hot_reload: bool,
    /// Wall-clock budget for a single Governor query.
    #[serde(default = "default_governor_query_timeout_ms")]
    pub governor_query_timeout_ms: u64,
    /// Run the adversarial arena stage.
    #[serde(default = "default_true")]
    pub enable_arena: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub arena: ArenaConfig,
}

/// Safety-retry controls for the audit stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries allowed after an unsafe audit before rejecting.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Sleep between retries.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Sandbox arena controls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ArenaConfig {
    /// Per-attack wall-clock bound.
    #[serde(default = "default_arena_timeout_ms")]
    pub timeout_ms: u64,
    /// Memory ceiling applied to the harness process.
    #[serde(default = "default_arena_max_memory_mb")]
    pub max_memory_mb: u64,
    /// Attack fanout; 1 keeps failure attribution clean.
    #[serde(default = "default_arena_parallel")]
    pub parallel: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_arena_timeout_ms(),
            max_memory_mb: default_arena_max_memory_mb(),
            parallel: default_arena_parallel(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    crate::utils::fs::workspace_root()
}
fn default_tools_dir() -> PathBuf {
    PathBuf::from(".nerd/tools")
}
fn default_compiled_dir() -> PathBuf {
    PathBuf::from(".nerd/tools/.compiled")
}
fn default_max_candidate_size() -> usize {
    100 * 1024
}
fn default_compile_timeout_ms() -> u64 {
    300_000
}
fn default_execute_timeout_ms() -> u64 {
    300_000
}
fn default_max_iterations() -> u32 {
    10
}
fn default_max_adversarial_retries() -> u32 {
    1
}
fn default_governor_query_timeout_ms() -> u64 {
    3_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    100
}
fn default_arena_timeout_ms() -> u64 {
    5_000
}
fn default_arena_max_memory_mb() -> u64 {
    100
}
fn default_arena_parallel() -> usize {
    1
}
fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            tools_dir: default_tools_dir(),
            compiled_dir: default_compiled_dir(),
            max_candidate_size: default_max_candidate_size(),
            compile_timeout_ms: default_compile_timeout_ms(),
            execute_timeout_ms: default_execute_timeout_ms(),
            allow_networking: false,
            allow_filesystem: false,
            allow_external_exec: false,
            target_os: String::new(),
            target_arch: String::new(),
            max_iterations: default_max_iterations(),
            max_adversarial_retries: default_max_adversarial_retries(),
            hot_reload: true,
            governor_query_timeout_ms: default_governor_query_timeout_ms(),
            enable_arena: true,
            retry: RetryConfig::default(),
            arena: ArenaConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse from TOML, rejecting unknown fields.
    pub fn from_toml(text: &str) -> EngineResult<Self> {
        let config: EngineConfig = toml::from_str(text)
            .map_err(|e| EngineError::Config(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::io(format!("reading config {}", path.display()), e))?;
        Self::from_toml(&text)
    }

    /// Reject out-of-range values early, before any loop runs.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_iterations == 0 {
            return Err(EngineError::Config("max_iterations must be >= 1".to_string()));
        }
        if self.max_candidate_size == 0 {
            return Err(EngineError::Config(
                "max_candidate_size must be > 0".to_string(),
            ));
        }
        if self.arena.parallel == 0 {
            return Err(EngineError::Config("arena.parallel must be >= 1".to_string()));
        }
        if self.governor_query_timeout_ms < 1_000 || self.governor_query_timeout_ms > 5_000 {
            return Err(EngineError::Config(
                "governor_query_timeout_ms must be within [1000, 5000]".to_string(),
            ));
        }
        if !self.workspace_root.is_absolute() {
            // current_dir default is absolute; only explicit relative roots reach here
            return Err(EngineError::Config(
                "workspace_root must be an absolute path".to_string(),
            ));
        }
        Ok(())
    }

    /// Absolute directory candidate sources are written into.
    pub fn tools_path(&self) -> PathBuf {
        self.workspace_root.join(&self.tools_dir)
    }

    /// Absolute directory compiled artifacts are written into.
    pub fn compiled_path(&self) -> PathBuf {
        self.workspace_root.join(&self.compiled_dir)
    }

    /// Target path for a capability's canonical source file.
    pub fn source_path_for(&self, name: &str) -> PathBuf {
        self.tools_path().join(format!("{}.rs", name))
    }

    /// Target path for a capability's compiled artifact.
    pub fn artifact_path_for(&self, name: &str) -> PathBuf {
        let file = if self.target_os == "windows" {
            format!("{}.exe", name)
        } else {
            name.to_string()
        };
        self.compiled_path().join(file)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry.retry_delay_ms)
    }

    pub fn governor_query_timeout(&self) -> Duration {
        Duration::from_millis(self.governor_query_timeout_ms)
    }

    pub fn arena_timeout(&self) -> Duration {
        Duration::from_millis(self.arena.timeout_ms)
    }

    /// True when the build targets a platform other than the host.
    pub fn is_cross_target(&self) -> bool {
        (!self.target_os.is_empty() && self.target_os != std::env::consts::OS)
            || (!self.target_arch.is_empty() && self.target_arch != std::env::consts::ARCH)
    }
}
