//! Code Generator collaborator interface.
//!
//! Generation is external to the loop: an LLM, a template system,
//! anything that turns a capability need (plus corrective feedback on
//! retry) into candidate source. The engine only depends on this trait;
//! `ScriptedGenerator` is the in-process double the scenario tests
//! drive the loop with.

use crate::types::CapabilityNeed;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// External code generation collaborator.
///
/// `feedback`, when present, is a textual rendering of prior violations
/// plus the rejected prior source (see the driver's feedback renderer).
/// Failures cross this boundary as `anyhow::Error`; the driver wraps
/// them into a terminal generation failure.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(
        &self,
        need: &CapabilityNeed,
        feedback: Option<&str>,
    ) -> anyhow::Result<String>;
}

/// Serves a fixed sequence of canned responses, one per generation
/// call. Runs dry with an error, which surfaces as a generation
/// failure in the loop.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedGenerator {
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }

    pub async fn remaining(&self) -> usize {
        self.responses.lock().await.len()
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        need: &CapabilityNeed,
        _feedback: Option<&str>,
    ) -> anyhow::Result<String> {
        let mut responses = self.responses.lock().await;
        responses.pop_front().ok_or_else(|| {
            anyhow::anyhow!(
                "scripted generator has no response left for '{}'",
                need.name
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_responses_in_order_then_fails() {
        let generator = ScriptedGenerator::new(["first", "second"]);
        let need = CapabilityNeed::new("echo", "echo");

        assert_eq!(generator.generate(&need, None).await.unwrap(), "first");
        assert_eq!(generator.remaining().await, 1);
        assert_eq!(generator.generate(&need, Some("fb")).await.unwrap(), "second");
        assert!(generator.generate(&need, None).await.is_err());
    }
}
