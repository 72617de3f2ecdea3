use std::time::Duration;

/// Timeout settings for the interception layer.
#[derive(Debug, Clone)]
pub struct GovernConfig {
    /// Bound on one policy evaluation; on expiry the call is denied
    /// (fail closed).
    pub evaluator_timeout: Duration,
    /// Bound on one audit write; on expiry the call proceeds and the
    /// audit-failure counter is bumped (fail open, never silent).
    pub audit_timeout: Duration,
    /// Drain bound used by the `ToolServer::stop` impl of
    /// [`crate::GovernedServer`]; `stop(drain_timeout)` takes an explicit
    /// value instead.
    pub drain_timeout: Duration,
}

impl Default for GovernConfig {
    fn default() -> Self {
        Self {
            evaluator_timeout: Duration::from_millis(500),
            audit_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
        }
    }
}
