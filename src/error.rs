//! Service-wide error type.
//!
//! Every fallible operation in the crate returns [`ServiceError`] (or wraps
//! one in `anyhow` at the binary edge). Each variant corresponds to one
//! user-visible disposition; the HTTP layer maps variants to status codes via
//! [`ServiceError::status_code`] and a machine-readable [`ServiceError::code`].
//!
//! Two variants never escape the query orchestrator: `ToolFailure` is demoted
//! into the `tools_used` log of the response, and `CompleterFailure` triggers
//! the deterministic fallback answer.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Project, FAQ, KB record, attachment, trace, or tool absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing, malformed, unverifiable, or expired credential.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Valid credential, insufficient scope.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Schema violation or invalid parameter.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Upload with a MIME type the extractor does not handle.
    #[error("unsupported mime type: {0}")]
    UnsupportedMime(String),

    /// Upload whose extracted text is empty.
    #[error("document contains no extractable text")]
    EmptyContent,

    /// Reserved; the current data model has no conflicting state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Handler deadline exceeded.
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// Tool execution failed. Demoted to a `tools_used` entry by the
    /// orchestrator, surfaced directly only by `POST /v1/tools/{name}`.
    #[error("tool failure: {0}")]
    ToolFailure(String),

    /// Completer unavailable or timed out. Always demoted to the
    /// deterministic fallback answer.
    #[error("completer failure: {0}")]
    CompleterFailure(String),

    /// Indexer raised during a rebuild. Stored in `BuildState.last_error`
    /// and surfaced via build-status, never by the triggering call.
    #[error("index build failure: {0}")]
    BuildFailure(String),

    /// Unexpected internal error. Surfaced as an opaque 500; full detail
    /// goes into the trace store.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Machine-readable error code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Unauthenticated(_) => "unauthenticated",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::BadRequest(_) => "bad_request",
            ServiceError::UnsupportedMime(_) => "unsupported_mime",
            ServiceError::EmptyContent => "empty_content",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::Timeout(_) => "timeout",
            ServiceError::ToolFailure(_) => "tool_failure",
            ServiceError::CompleterFailure(_) => "completer_failure",
            ServiceError::BuildFailure(_) => "build_failure",
            ServiceError::Internal(_) => "internal",
        }
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::NotFound(_) => 404,
            ServiceError::Unauthenticated(_) => 401,
            ServiceError::Forbidden(_) => 403,
            ServiceError::BadRequest(_)
            | ServiceError::UnsupportedMime(_)
            | ServiceError::EmptyContent => 400,
            ServiceError::Conflict(_) => 409,
            ServiceError::Timeout(_) => 504,
            ServiceError::ToolFailure(_) => 502,
            ServiceError::CompleterFailure(_) => 502,
            ServiceError::BuildFailure(_) => 500,
            ServiceError::Internal(_) => 500,
        }
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(e: sqlx::Error) -> Self {
        ServiceError::Internal(anyhow::Error::new(e))
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(e: std::io::Error) -> Self {
        ServiceError::Internal(anyhow::Error::new(e))
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Internal(anyhow::Error::new(e))
    }
}
