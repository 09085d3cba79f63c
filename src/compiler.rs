//! Candidate compiler.
//!
//! Builds the committed candidate into a standalone executable: a thin
//! wrapper `main` reads one JSON `{"input": ...}` line from stdin,
//! invokes the discovered entry function, and prints `{"output": ...}`
//! (or `{"output": "", "error": ...}` with a non-zero exit) to stdout.
//! The artifact is content-addressed with SHA-256 and stored under the
//! configured compiled directory. Candidates are audited before they
//! reach this point; the build additionally denies `unsafe_code`.

use crate::arena::entry::{self, InputStyle};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{CandidateArtifact, CompileResult};
use crate::utils::fs as enginefs;
use sha2::{Digest, Sha256};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

pub struct Compiler {
    config: EngineConfig,
}

impl Compiler {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Compile the candidate to its artifact path. Failures return a
    /// `CompileResult` carrying the diagnostics, never an `Err`, so the
    /// driver can surface them in the loop result.
    pub async fn compile(&self, candidate: &CandidateArtifact) -> EngineResult<CompileResult> {
        let started = Instant::now();

        let entry = match entry::discover_entry(&candidate.source) {
            Ok(entry) => entry,
            Err(e) => {
                return Ok(failure(started, vec![format!("entry discovery failed: {}", e)]))
            }
        };

        let build_dir = tempfile::Builder::new()
            .prefix(&format!("build-{}-", candidate.name))
            .tempdir()
            .map_err(|e| EngineError::io("creating build dir", e))?;
        let main_path = build_dir.path().join("main.rs");
        let out_path = build_dir.path().join(&candidate.name);

        let wrapper = render_wrapper(&candidate.source, &entry.name, entry.input_style);
        tokio::fs::write(&main_path, &wrapper)
            .await
            .map_err(|e| EngineError::io("writing wrapper", e))?;

        let mut cmd = Command::new("rustc");
        cmd.arg("--edition")
            .arg("2021")
            .arg("-C")
            .arg("opt-level=2")
            .arg("-D")
            .arg("unsafe_code")
            .arg("-o")
            .arg(&out_path)
            .arg(&main_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(triple) = self.target_triple() {
            cmd.arg("--target").arg(triple);
        }

        debug!(candidate = %candidate.name, "compiling candidate");
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Ok(failure(started, vec![format!("spawning rustc: {}", e)])),
        };
        let output = match timeout(self.config.compile_timeout(), child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Ok(failure(started, vec![format!("rustc wait failed: {}", e)])),
            Err(_) => {
                return Ok(failure(
                    started,
                    vec![format!(
                        "compile timed out after {}ms",
                        self.config.compile_timeout_ms
                    )],
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(failure(started, parse_diagnostics(&stderr)));
        }

        // content-address and store the artifact
        let binary = tokio::fs::read(&out_path)
            .await
            .map_err(|e| EngineError::io("reading built binary", e))?;
        let content_hash = format!("{:x}", Sha256::digest(&binary));

        let artifact_path = self.config.artifact_path_for(&candidate.name);
        if let Some(parent) = artifact_path.parent() {
            enginefs::ensure_dir(parent)?;
        }
        tokio::fs::write(&artifact_path, &binary)
            .await
            .map_err(|e| EngineError::io("storing artifact", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o755);
            std::fs::set_permissions(&artifact_path, perms)
                .map_err(|e| EngineError::io("marking artifact executable", e))?;
        }

        info!(
            candidate = %candidate.name,
            hash = %&content_hash[..12],
            path = %artifact_path.display(),
            "candidate compiled"
        );

        Ok(CompileResult {
            success: true,
            binary_path: Some(artifact_path),
            content_hash: Some(content_hash),
            errors: Vec::new(),
            duration: started.elapsed(),
        })
    }

    /// Cross-target triple when `target_os`/`target_arch` differ from
    /// the host; `None` builds for the host.
    fn target_triple(&self) -> Option<String> {
        if !self.config.is_cross_target() {
            return None;
        }
        let arch = if self.config.target_arch.is_empty() {
            std::env::consts::ARCH
        } else {
            &self.config.target_arch
        };
        let os = if self.config.target_os.is_empty() {
            std::env::consts::OS
        } else {
            &self.config.target_os
        };
        let triple = match os {
            "windows" => format!("{}-pc-windows-gnu", arch),
            "macos" | "darwin" => format!("{}-apple-darwin", arch),
            _ => format!("{}-unknown-{}-gnu", arch, os),
        };
        Some(triple)
    }
}

fn failure(started: Instant, errors: Vec<String>) -> CompileResult {
    CompileResult {
        success: false,
        binary_path: None,
        content_hash: None,
        errors,
        duration: started.elapsed(),
    }
}

/// Pull the `error:` lines out of rustc stderr; fall back to the whole
/// stream when none match.
fn parse_diagnostics(stderr: &str) -> Vec<String> {
    let errors: Vec<String> = stderr
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with("error") && !trimmed.starts_with("error: aborting")
        })
        .map(|line| line.trim().to_string())
        .collect();
    if errors.is_empty() {
        vec![stderr.trim().to_string()]
    } else {
        errors
    }
}

/// Render the wrapper program. The JSON framing is hand-rolled in the
/// generated code because the artifact links against std alone.
fn render_wrapper(candidate_source: &str, entry_name: &str, input_style: InputStyle) -> String {
    let call = match input_style {
        InputStyle::Borrowed => format!("candidate::{}(&input)", entry_name),
        InputStyle::Owned => format!("candidate::{}(input)", entry_name),
    };
    let candidate = crate::arena::harness::normalize_candidate(candidate_source);

    format!(
        r#"// Capability wrapper (generated). Wire: {{"input": s}} -> {{"output": s, "error"?: s}}.
#[allow(dead_code, unused_variables, unused_imports, unused_mut)]
mod candidate {{
{candidate}
}}

use std::io::Read;

fn json_escape(s: &str) -> String {{
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {{
        match c {{
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{{:04x}}", c as u32)),
            c => out.push(c),
        }}
    }}
    out
}}

/// Extract the "input" string from one JSON object line.
fn extract_input(frame: &str) -> Option<String> {{
    let key = "\"input\"";
    let start = frame.find(key)? + key.len();
    let rest = &frame[start..];
    let colon = rest.find(':')?;
    let rest = rest[colon + 1..].trim_start();
    let mut chars = rest.chars();
    if chars.next()? != '"' {{
        return None;
    }}
    let mut out = String::new();
    while let Some(c) = chars.next() {{
        match c {{
            '"' => return Some(out),
            '\\' => match chars.next()? {{
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                't' => out.push('\t'),
                '"' => out.push('"'),
                '\\' => out.push('\\'),
                '/' => out.push('/'),
                'u' => {{
                    let hex: String = chars.by_ref().take(4).collect();
                    let code = u32::from_str_radix(&hex, 16).ok()?;
                    out.push(char::from_u32(code)?);
                }}
                other => out.push(other),
            }},
            other => out.push(other),
        }}
    }}
    None
}}

fn main() {{
    let mut frame = String::new();
    if std::io::stdin().read_to_string(&mut frame).is_err() {{
        println!("{{{{\"output\": \"\", \"error\": \"unreadable input frame\"}}}}");
        std::process::exit(1);
    }}
    let input = match extract_input(frame.trim()) {{
        Some(input) => input,
        None => {{
            println!("{{{{\"output\": \"\", \"error\": \"invalid input frame\"}}}}");
            std::process::exit(1);
        }}
    }};

    match {call} {{
        Ok(output) => {{
            println!("{{{{\"output\": \"{{}}\"}}}}", json_escape(&output));
        }}
        Err(error) => {{
            println!(
                "{{{{\"output\": \"\", \"error\": \"{{}}\"}}}}",
                json_escape(&format!("{{}}", error))
            );
            std::process::exit(1);
        }}
    }}
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::SandboxArena;
    use crate::types::CapabilitySchema;
    use std::path::PathBuf;

    const ECHO: &str = r#"
pub fn run(input: &str) -> Result<String, String> {
    Ok(input.to_string())
}
"#;

    fn candidate(config: &EngineConfig, name: &str, source: &str) -> CandidateArtifact {
        CandidateArtifact {
            name: name.to_string(),
            source: source.to_string(),
            test_source: None,
            description: "test candidate".to_string(),
            schema: CapabilitySchema::default(),
            target_path: config.source_path_for(name),
            validated: true,
            errors: Vec::new(),
        }
    }

    fn test_config() -> (tempfile::TempDir, EngineConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            workspace_root: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        (dir, config)
    }

    #[test]
    fn wrapper_embeds_wire_handling() {
        let wrapper = render_wrapper(ECHO, "run", InputStyle::Borrowed);
        assert!(wrapper.contains("mod candidate"));
        assert!(wrapper.contains("extract_input"));
        assert!(wrapper.contains("candidate::run(&input)"));
        assert!(wrapper.contains("json_escape"));
    }

    #[test]
    fn diagnostics_filter_error_lines() {
        let stderr = "warning: unused variable\nerror[E0425]: cannot find function\n  --> main.rs:3\nerror: aborting due to 1 previous error";
        let errors = parse_diagnostics(stderr);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("E0425"));
    }

    #[test]
    fn cross_triple_only_when_target_differs() {
        let (_dir, mut config) = test_config();
        assert!(Compiler::new(&config).target_triple().is_none());
        config.target_os = "windows".to_string();
        config.target_arch = "x86_64".to_string();
        assert_eq!(
            Compiler::new(&config).target_triple().as_deref(),
            Some("x86_64-pc-windows-gnu")
        );
    }

    #[tokio::test]
    async fn compiles_and_content_addresses_the_artifact() {
        if !SandboxArena::toolchain_available() {
            eprintln!("rustc unavailable; skipping compile test");
            return;
        }
        let (_dir, config) = test_config();
        let compiler = Compiler::new(&config);
        let result = compiler
            .compile(&candidate(&config, "echo", ECHO))
            .await
            .unwrap();
        assert!(result.success, "errors: {:?}", result.errors);

        let path: PathBuf = result.binary_path.unwrap();
        assert!(path.exists());
        let bytes = std::fs::read(&path).unwrap();
        let expected = format!("{:x}", Sha256::digest(&bytes));
        assert_eq!(result.content_hash.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn broken_candidate_surfaces_diagnostics() {
        if !SandboxArena::toolchain_available() {
            eprintln!("rustc unavailable; skipping compile test");
            return;
        }
        let (_dir, config) = test_config();
        let compiler = Compiler::new(&config);
        let broken = "pub fn run(input: &str) -> Result<String, String> { Ok(missing(input)) }";
        let result = compiler
            .compile(&candidate(&config, "broken", broken))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(!result.errors.is_empty());
        assert!(result.binary_path.is_none());
    }
}
