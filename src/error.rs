//! Unified error handling for PML.
//!
//! Every fallible library API returns [`PmlError`]. The variants map onto the
//! wire-level error kinds surfaced in JSON-RPC responses; `kind()` yields the
//! stable snake_case tag clients dispatch on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Main error type for the PML core.
#[derive(Error, Debug)]
pub enum PmlError {
    /// Schema violation, malformed reference string, cycle in a workflow DAG,
    /// unknown enum value.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Unknown tool, capability, or provider id.
    #[error("Not found: {what} '{id}'")]
    NotFound { what: &'static str, id: String },

    /// Embedding dimension at runtime does not match the stored dimension.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Per-task, per-workflow, or embedding-call timeout.
    #[error("Timed out after {timeout_ms}ms: {message}")]
    Timeout { message: String, timeout_ms: u64 },

    /// User-initiated cancellation.
    #[error("Cancelled: {message}")]
    Cancelled { message: String },

    /// A downstream provider returned an error; the upstream payload is
    /// preserved verbatim in `payload`.
    #[error("Upstream failure from '{provider}': {message}")]
    UpstreamFailure {
        provider: String,
        message: String,
        payload: Option<Value>,
    },

    /// Backpressure rejection from the gateway or the executor.
    #[error("Overloaded: {message}")]
    Overloaded { message: String },

    /// NaN/Inf encountered in a SHGAT forward pass or training step.
    #[error("Numerical instability: {message}")]
    NumericalInstability { message: String },

    /// Bug or I/O error. Always logged with full context at the edge.
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl PmlError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::Overloaded {
            message: message.into(),
        }
    }

    /// Stable wire tag for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::NotFound { .. } => "not_found",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::UpstreamFailure { .. } => "upstream_failure",
            Self::Overloaded { .. } => "overloaded",
            Self::NumericalInstability { .. } => "numerical_instability",
            Self::Internal { .. } => "internal",
        }
    }

    /// Wire representation: `{kind, message, task_id?, details?}`.
    pub fn to_wire(&self, task_id: Option<&str>) -> WireError {
        let details = match self {
            Self::UpstreamFailure {
                payload: Some(payload),
                ..
            } => Some(payload.clone()),
            _ => None,
        };
        WireError {
            kind: self.kind().to_string(),
            message: redact_home(&self.to_string()),
            task_id: task_id.map(str::to_string),
            details,
        }
    }
}

/// Error payload surfaced in external responses.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct WireError {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<rusqlite::Error> for PmlError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal {
            message: "store I/O error".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<serde_json::Error> for PmlError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: "JSON serialization error".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<std::io::Error> for PmlError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal {
            message: "I/O error".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Collapse paths under the user home to `~` so error messages never leak
/// usernames or absolute layouts.
pub fn redact_home(message: &str) -> String {
    match dirs::home_dir() {
        Some(home) => message.replace(&home.display().to_string(), "~"),
        None => message.to_string(),
    }
}

pub type Result<T, E = PmlError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(PmlError::invalid("x").kind(), "invalid_argument");
        assert_eq!(PmlError::not_found("tool", "fs:read").kind(), "not_found");
        assert_eq!(
            PmlError::DimensionMismatch {
                expected: 1024,
                actual: 384
            }
            .kind(),
            "dimension_mismatch"
        );
    }

    #[test]
    fn upstream_payload_lands_in_details() {
        let err = PmlError::UpstreamFailure {
            provider: "fs".into(),
            message: "boom".into(),
            payload: Some(serde_json::json!({"code": -32000})),
        };
        let wire = err.to_wire(Some("t1"));
        assert_eq!(wire.kind, "upstream_failure");
        assert_eq!(wire.task_id.as_deref(), Some("t1"));
        assert_eq!(wire.details.unwrap()["code"], -32000);
    }
}
