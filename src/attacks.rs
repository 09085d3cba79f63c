//! Adversarial payload generator.
//!
//! Produces a deterministic-by-seed set of attack vectors for a
//! candidate: generic templates for every battle plus source-aware
//! extras derived from the candidate's extracted facts. The seed
//! defaults to the candidate hash so repeated battles over the same
//! source replay the same payloads.

use crate::audit::extract;
use crate::types::{AttackCategory, AttackVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

/// Upper bound on any generated payload. The harness reads one line and
/// the wire contract caps out well above this.
const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

pub struct AttackGenerator {
    seed: Option<u64>,
}

impl Default for AttackGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl AttackGenerator {
    pub fn new() -> Self {
        Self { seed: None }
    }

    /// Fix the seed explicitly (tests; replaying a battle).
    pub fn with_seed(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }

    /// Generate the attack set for a candidate.
    pub fn generate(&self, candidate_source: &str) -> Vec<AttackVector> {
        let seed = self.seed.unwrap_or_else(|| source_seed(candidate_source));
        let mut rng = StdRng::seed_from_u64(seed);
        let mut attacks = Vec::new();

        // --- nil-deref: empty and sentinel inputs -----------------------
        for (name, payload) in [
            ("nil-empty", ""),
            ("nil-whitespace", "   "),
            ("nil-null-token", "null"),
            ("nil-zero", "0"),
        ] {
            attacks.push(AttackVector {
                name: name.to_string(),
                category: AttackCategory::NilDeref,
                payload: payload.to_string(),
                hypothesis: Some("empty or sentinel input reaches an unchecked access".to_string()),
            });
        }

        // --- malformed input -------------------------------------------
        attacks.push(AttackVector {
            name: "malformed-replacement-chars".to_string(),
            category: AttackCategory::MalformedInput,
            payload: "\u{FFFD}\u{FFFD}\u{0}garbage\u{FFFD}".to_string(),
            hypothesis: Some("non-ASCII noise breaks byte-indexed parsing".to_string()),
        });
        attacks.push(AttackVector {
            name: "malformed-injection".to_string(),
            category: AttackCategory::MalformedInput,
            payload: "\"; DROP TABLE tools; --".to_string(),
            hypothesis: Some("quote-terminated input escapes naive quoting".to_string()),
        });
        attacks.push(AttackVector {
            name: "malformed-json-shaped".to_string(),
            category: AttackCategory::MalformedInput,
            payload: "{\"input\": \"}\"}".to_string(),
            hypothesis: Some("brace-unbalanced text confuses ad-hoc JSON handling".to_string()),
        });
        attacks.push(AttackVector {
            name: "malformed-oversized".to_string(),
            category: AttackCategory::MalformedInput,
            payload: random_text(&mut rng, 32 * 1024, 96 * 1024),
            hypothesis: Some("oversized single-line payload overflows fixed buffers".to_string()),
        });

        // --- boundary values -------------------------------------------
        for (name, payload) in [
            ("boundary-i64-max", i64::MAX.to_string()),
            ("boundary-i64-min", i64::MIN.to_string()),
            ("boundary-negative-zero", "-0".to_string()),
            ("boundary-float-overflow", "1e308".to_string()),
            ("boundary-nan", "NaN".to_string()),
            ("boundary-wide-char", "\u{1D54A}".to_string()),
        ] {
            attacks.push(AttackVector {
                name: name.to_string(),
                category: AttackCategory::Boundary,
                payload,
                hypothesis: Some("extremal value overflows arithmetic or slicing".to_string()),
            });
        }

        // --- resource exhaustion ---------------------------------------
        attacks.push(AttackVector {
            name: "resource-deep-nesting".to_string(),
            category: AttackCategory::ResourceLeak,
            payload: "[".repeat(rng.gen_range(2_000..8_000)),
            hypothesis: Some("unbounded recursion on nested structure".to_string()),
        });
        attacks.push(AttackVector {
            name: "resource-repetition".to_string(),
            category: AttackCategory::ResourceLeak,
            payload: format!("{} {}", random_text(&mut rng, 8, 16).repeat(64), u32::MAX),
            hypothesis: Some("input-proportional allocation without a cap".to_string()),
        });

        // --- source-aware extras ---------------------------------------
        if let Ok(facts) = extract::extract(candidate_source) {
            if facts.calls.contains_key("parse") {
                attacks.push(AttackVector {
                    name: "boundary-non-numeric".to_string(),
                    category: AttackCategory::Boundary,
                    payload: "12abc".to_string(),
                    hypothesis: Some("parse() result is consumed without checking".to_string()),
                });
                attacks.push(AttackVector {
                    name: "boundary-unicode-digits".to_string(),
                    category: AttackCategory::Boundary,
                    payload: "\u{0661}\u{0662}\u{0663}".to_string(),
                    hypothesis: Some("non-ASCII digits defeat ASCII-only parsing".to_string()),
                });
            }
            if facts.calls.contains_key("split") || facts.calls.contains_key("split_whitespace") {
                attacks.push(AttackVector {
                    name: "malformed-no-separator".to_string(),
                    category: AttackCategory::MalformedInput,
                    payload: random_text(&mut rng, 64, 128),
                    hypothesis: Some("separator-free input yields a single huge field".to_string()),
                });
            }
            if !facts.spawns.is_empty() {
                attacks.push(AttackVector {
                    name: "concurrency-fanout".to_string(),
                    category: AttackCategory::Concurrency,
                    payload: (0..512)
                        .map(|i| i.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                    hypothesis: Some("many work items race in the spawned path".to_string()),
                });
            }
        }

        for attack in &mut attacks {
            attack.payload.truncate(MAX_PAYLOAD_BYTES);
        }
        attacks
    }
}

/// Seed derived from the candidate source hash.
fn source_seed(source: &str) -> u64 {
    let digest = Sha256::digest(source.as_bytes());
    u64::from_le_bytes(digest[..8].try_into().expect("sha256 is 32 bytes"))
}

fn random_text(rng: &mut StdRng, min: usize, max: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let len = rng.gen_range(min..=max);
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
