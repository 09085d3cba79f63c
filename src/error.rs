//! Engine-wide error type.
//!
//! Every fallible operation in the engine returns [`EngineResult`]. Foreign
//! errors are wrapped into [`EngineError::Generic`] at the boundary where
//! they occur so the message carries the failing operation.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Catch-all for wrapped foreign errors and one-off failures.
    #[error("{0}")]
    Generic(String),

    #[error("io error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Candidate or ruleset text could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// A bounded operation overran its deadline.
    #[error("timeout after {elapsed_ms}ms in {context}")]
    Timeout { context: String, elapsed_ms: u64 },

    /// A governance query overran its budget. Treated as "do not authorize".
    #[error("governor query '{query}' timed out")]
    QueryTimeout { query: String },

    /// The Governor refused a transition or halted the loop.
    #[error("governance denied: {0}")]
    GovernanceDenied(String),

    /// The compile step failed; diagnostics live in the CompileResult.
    #[error("compile failed: {0}")]
    CompileFailed(String),

    /// Named capability is not present in the registry.
    #[error("capability '{0}' is not registered")]
    UnknownCapability(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Wrap an io::Error with the operation that produced it.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Generic(format!("json error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_variant_carries_context() {
        let err = EngineError::io(
            "writing candidate source",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("writing candidate source"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn query_timeout_names_the_query() {
        let err = EngineError::QueryTimeout {
            query: "valid_transition".to_string(),
        };
        assert!(err.to_string().contains("valid_transition"));
    }
}
