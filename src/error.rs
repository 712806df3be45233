//! Typed error taxonomy for the orchestration engine.
//!
//! Every fallible operation in this crate returns `Result<T, OpdError>`.
//! Provider trait methods are the one exception — they return
//! `Result<T, Box<dyn std::error::Error + Send + Sync>>` so an embedder can
//! plug in any HTTP client's native error type without wrapping it first.
//! Provider failures are folded into `OpdError::Provider` at the call site.

use thiserror::Error;

/// The error taxonomy from the engine's design: validation, not-found,
/// invalid state transitions, preflight failures, provider failures,
/// cancellation, and infrastructure errors.
#[derive(Debug, Error)]
pub enum OpdError {
    /// Bad request shape, unknown stage, invalid filename, invalid
    /// transition target, etc. Maps to HTTP 400.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown story/project/round. Maps to HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// A requested state transition is not reachable from the current
    /// status. Maps to HTTP 409.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// The status the story was in.
        from: String,
        /// The status that was requested.
        to: String,
    },

    /// A stage's required capability is absent or unhealthy. Maps to
    /// HTTP 400 with the accumulated error list attached.
    #[error("preflight failed: {0:?}")]
    Preflight(Vec<String>),

    /// An AI/SCM/CI provider call failed during a background task. Never
    /// surfaces as an HTTP error by itself — it's published as an `error`
    /// SSE event and the story's status is left unchanged.
    #[error("provider error: {0}")]
    Provider(String),

    /// The operation was cancelled via `Executor::stop`.
    #[error("cancelled")]
    Cancellation,

    /// Database/filesystem I/O failure. Maps to HTTP 500.
    #[error("infrastructure error: {0}")]
    Infra(String),
}

impl OpdError {
    /// Construct a `Validation` error from any `Display`-able message.
    pub fn validation(msg: impl Into<String>) -> Self {
        OpdError::Validation(msg.into())
    }

    /// Construct a `NotFound` error naming the missing entity.
    pub fn not_found(what: impl Into<String>) -> Self {
        OpdError::NotFound(what.into())
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for OpdError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        OpdError::Provider(err.to_string())
    }
}

impl From<std::io::Error> for OpdError {
    fn from(err: std::io::Error) -> Self {
        OpdError::Infra(err.to_string())
    }
}

/// Convenience alias used throughout the engine.
pub type OpdResult<T> = Result<T, OpdError>;
