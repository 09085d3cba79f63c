//! Harness source generation.
//!
//! Wraps the candidate in a `candidate` module and emits a `main` that
//! applies the arena's resource discipline: bounded stdin read, a panic
//! trap (`PANIC:` + stack dump, exit 1), a watchdog (`TIMEOUT:`, exit
//! 2), an RSS sampler against the memory ceiling (`OOM:`, exit 3), and
//! `SURVIVED` on normal completion. A graceful `Err` return from the
//! entry is a survival: the candidate handled the input.

use super::entry::{EntryPoint, InputStyle};
use once_cell::sync::Lazy;
use regex::Regex;

/// `fn main` inside the candidate would collide with the harness.
static CANDIDATE_MAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(\s*)(pub\s+)?fn\s+main\s*\(").expect("main regex"));

/// Rename any candidate `main` out of the way; the entry function is
/// what the arena calls.
pub fn normalize_candidate(source: &str) -> String {
    CANDIDATE_MAIN_RE
        .replace_all(source, "${1}${2}fn candidate_main(")
        .into_owned()
}

/// Render the full single-file harness program.
pub fn render_harness(
    candidate_source: &str,
    entry: &EntryPoint,
    timeout_ms: u64,
    max_memory_mb: u64,
    max_input_bytes: usize,
) -> String {
    let call = match entry.input_style {
        InputStyle::Borrowed => format!("candidate::{}(input)", entry.name),
        InputStyle::Owned => format!("candidate::{}(input.to_string())", entry.name),
    };
    let candidate = normalize_candidate(candidate_source);

    format!(
        r#"// Arena harness (generated). Exit codes: 1 panic, 2 timeout, 3 oom.
#[allow(dead_code, unused_variables, unused_imports, unused_mut)]
mod candidate {{
{candidate}
}}

use std::io::Read;

const TIMEOUT_MS: u64 = {timeout_ms};
const MEMORY_LIMIT_MB: u64 = {max_memory_mb};
const MAX_INPUT_BYTES: u64 = {max_input_bytes};

fn rss_mb() -> u64 {{
    if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {{
        if let Some(resident_pages) = statm.split_whitespace().nth(1) {{
            if let Ok(pages) = resident_pages.parse::<u64>() {{
                return pages * 4096 / (1024 * 1024);
            }}
        }}
    }}
    0
}}

fn main() {{
    std::panic::set_hook(Box::new(|info| {{
        eprintln!("PANIC: {{}}", info);
        eprintln!("{{}}", std::backtrace::Backtrace::force_capture());
        std::process::exit(1);
    }}));

    std::thread::spawn(|| {{
        std::thread::sleep(std::time::Duration::from_millis(TIMEOUT_MS));
        eprintln!("TIMEOUT: entry did not return within {{}}ms", TIMEOUT_MS);
        std::process::exit(2);
    }});

    std::thread::spawn(|| loop {{
        if MEMORY_LIMIT_MB > 0 && rss_mb() > MEMORY_LIMIT_MB {{
            eprintln!("OOM: resident set exceeded {{}}MiB", MEMORY_LIMIT_MB);
            std::process::exit(3);
        }}
        std::thread::sleep(std::time::Duration::from_millis(50));
    }});

    let mut payload = String::new();
    if std::io::stdin()
        .take(MAX_INPUT_BYTES)
        .read_to_string(&mut payload)
        .is_err()
    {{
        // binary garbage on stdin is the attack's problem, not ours
        payload.clear();
    }}
    let input = payload.lines().next().unwrap_or("");

    match {call} {{
        Ok(output) => {{
            let _ = output;
            println!("SURVIVED");
        }}
        Err(error) => {{
            let _ = error;
            println!("SURVIVED");
        }}
    }}
    std::process::exit(0);
}}
"#
    )
}
