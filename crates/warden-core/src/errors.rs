use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to callers of the interception layer.
///
/// `Server` carries the wrapped server's own failure unchanged; lifecycle
/// misuse (`AlreadyRunning`/`NotRunning`) is reported synchronously and is
/// fatal only to the offending call.
#[derive(Debug, Error)]
pub enum GovernError {
    #[error("governed server is already running")]
    AlreadyRunning,
    #[error("governed server is not running")]
    NotRunning,
    #[error("invalid call descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("call interrupted by shutdown drain")]
    Interrupted,
    #[error(transparent)]
    Server(anyhow::Error),
}

/// Failures of the policy evaluator itself. Never propagated to callers:
/// the proxy resolves every variant to a fail-closed `Deny`.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy source unreachable: {0}")]
    Unavailable(String),
    #[error("policy evaluation timed out after {0:?}")]
    Timeout(Duration),
}

/// Failures to persist an audit record. Non-fatal to the intercepted
/// call; surfaced through the audit-failure counter and a `tracing`
/// warning instead.
#[derive(Debug, Error)]
pub enum AuditWriteError {
    #[error("audit write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("audit write timed out after {0:?}")]
    Timeout(Duration),
}
