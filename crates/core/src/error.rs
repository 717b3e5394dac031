//! Error taxonomy shared by every capstan crate.

use serde::{Deserialize, Serialize};

/// Classified failure. The variant decides what a caller does with it; the
/// message carries operation context accumulated on the way up.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum CapstanError {
    /// Object absent. Treated as already converged at reconcile boundaries.
    #[error("{0}")]
    NotFound(String),
    /// Create hit an existing object. Idempotent creation treats this as success.
    #[error("{0}")]
    AlreadyExists(String),
    /// Malformed identity or name. Never retried.
    #[error("{0}")]
    Validation(String),
    /// Network/API failure other than the above. Retried with backoff.
    #[error("{0}")]
    Transient(String),
    /// Non-2xx answer from a callback endpoint. Retried as a whole sequence.
    #[error("{0}")]
    Protocol(String),
    /// More than one resource for an identity that must be singular.
    #[error("{0}")]
    Consistency(String),
}

pub type CapstanResult<T> = Result<T, CapstanError>;

impl CapstanError {
    pub fn not_found(msg: impl Into<String>) -> Self { Self::NotFound(msg.into()) }
    pub fn validation(msg: impl Into<String>) -> Self { Self::Validation(msg.into()) }
    pub fn transient(msg: impl Into<String>) -> Self { Self::Transient(msg.into()) }
    pub fn consistency(msg: impl Into<String>) -> Self { Self::Consistency(msg.into()) }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, Self::AlreadyExists(_)) }

    /// Whether the delivery layer should requeue the item that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Protocol(_))
    }

    /// Short lowercase name of the variant, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::Validation(_) => "validation",
            Self::Transient(_) => "transient",
            Self::Protocol(_) => "protocol",
            Self::Consistency(_) => "consistency",
        }
    }

    /// Prefix the message with `ctx`, keeping the variant.
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        let wrap = |m: String| format!("{ctx}: {m}");
        match self {
            Self::NotFound(m) => Self::NotFound(wrap(m)),
            Self::AlreadyExists(m) => Self::AlreadyExists(wrap(m)),
            Self::Validation(m) => Self::Validation(wrap(m)),
            Self::Transient(m) => Self::Transient(wrap(m)),
            Self::Protocol(m) => Self::Protocol(wrap(m)),
            Self::Consistency(m) => Self::Consistency(wrap(m)),
        }
    }
}

/// `Result` adapter for [`CapstanError::context`].
pub trait ResultExt<T> {
    fn context(self, ctx: impl std::fmt::Display) -> CapstanResult<T>;
}

impl<T> ResultExt<T> for CapstanResult<T> {
    fn context(self, ctx: impl std::fmt::Display) -> CapstanResult<T> {
        self.map_err(|e| e.context(ctx))
    }
}

impl From<serde_json::Error> for CapstanError {
    fn from(e: serde_json::Error) -> Self { Self::Validation(format!("json: {e}")) }
}
