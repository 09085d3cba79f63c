//! Best-effort candidate sanitizer.
//!
//! Generators wrap code in markdown fences and occasionally append
//! prose; `normalize_generated` strips that. `sanitize` additionally
//! normalizes embedded declarative policy fragments, but only for
//! declarative-looking text: imperative Rust passes through untouched,
//! and any failure degrades to the raw source. Sanitization never
//! blocks the loop.

use once_cell::sync::Lazy;
use regex::Regex;

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:rust|rs)?\s*\n(.*?)```").expect("fence regex"));

/// Strip markdown fences and normalize line endings. Returns the body
/// of the first fenced block when one exists, else the trimmed input.
pub fn normalize_generated(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n");
    if let Some(captures) = FENCE_RE.captures(&unified) {
        if let Some(body) = captures.get(1) {
            return body.as_str().trim().to_string();
        }
    }
    unified.trim().to_string()
}

/// True when the text reads as imperative Rust rather than a
/// declarative fragment.
pub fn looks_imperative(source: &str) -> bool {
    source.contains("fn ") || source.contains("use ") || source.contains("let ")
}

/// Normalize a declarative policy fragment: drop comment lines, collapse
/// blank runs, and ensure each clause ends with a period. Imperative
/// source is returned untouched.
pub fn sanitize(source: &str) -> String {
    if looks_imperative(source) {
        return source.to_string();
    }

    let mut out = Vec::new();
    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('%') {
            continue;
        }
        let mut clause = trimmed.to_string();
        if !clause.ends_with('.') && !clause.ends_with(":-") && !clause.ends_with(',') {
            clause.push('.');
        }
        out.push(clause);
    }
    if out.is_empty() {
        // nothing sanitizable; fall back to the raw source
        return source.to_string();
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_rust_fences() {
        let raw = "Here is the code:\n```rust\npub fn run(input: &str) -> Result<String, String> {\n    Ok(input.to_string())\n}\n```\nHope that helps!";
        let out = normalize_generated(raw);
        assert!(out.starts_with("pub fn run"));
        assert!(!out.contains("```"));
        assert!(!out.contains("Hope"));
    }

    #[test]
    fn passes_plain_source_through() {
        let raw = "pub fn run(input: &str) -> Result<String, String> { Ok(String::new()) }";
        assert_eq!(normalize_generated(raw), raw);
    }

    #[test]
    fn imperative_source_is_untouched() {
        let source = "pub fn run(input: &str) -> Result<String, String> {\n    let x = 1;\n    Ok(x.to_string())\n}";
        assert_eq!(sanitize(source), source);
    }

    #[test]
    fn declarative_fragment_gets_terminators() {
        let fragment = "% comment\nallowed(a)\nallowed(b).";
        assert_eq!(sanitize(fragment), "allowed(a).\nallowed(b).");
    }

    #[test]
    fn windows_line_endings_are_normalized() {
        let raw = "```rust\r\npub fn run(input: &str) -> Result<String, String> {\r\n    Ok(input.to_string())\r\n}\r\n```";
        let out = normalize_generated(raw);
        assert!(!out.contains('\r'));
        assert!(out.starts_with("pub fn run"));
    }
}
