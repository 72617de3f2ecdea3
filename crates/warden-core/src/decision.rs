use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reason codes recorded alongside decisions and outcomes.
pub mod reason_codes {
    // Policy outcomes (P_*)
    pub const P_POLICY_ALLOW: &str = "P_POLICY_ALLOW";
    pub const P_POLICY_DENY: &str = "P_POLICY_DENY";
    pub const P_POLICY_MODIFY: &str = "P_POLICY_MODIFY";
    pub const P_EVALUATOR_UNAVAILABLE: &str = "P_EVALUATOR_UNAVAILABLE";
    pub const P_EVALUATOR_TIMEOUT: &str = "P_EVALUATOR_TIMEOUT";

    // Interrupted execution (T_*)
    pub const T_DRAIN_INTERRUPTED: &str = "T_DRAIN_INTERRUPTED";
    pub const T_CANCELLED: &str = "T_CANCELLED";

    // System-side failures (S_*)
    pub const S_AUDIT_WRITE: &str = "S_AUDIT_WRITE";
    pub const S_SERVER_ERROR: &str = "S_SERVER_ERROR";
}

/// Verdict of the policy evaluator for one call. Produced exactly once
/// per [`crate::CallDescriptor`], never re-evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Forward the call unchanged.
    Allow,
    /// Refuse the call; the wrapped server is never invoked.
    Deny { reason: String },
    /// Forward the call with these arguments substituted for the
    /// descriptor's originals.
    Modify { arguments: Map<String, Value> },
}

impl Decision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Self::Deny { .. })
    }

    /// Reason code for audit records.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Allow => reason_codes::P_POLICY_ALLOW,
            Self::Deny { .. } => reason_codes::P_POLICY_DENY,
            Self::Modify { .. } => reason_codes::P_POLICY_MODIFY,
        }
    }
}
