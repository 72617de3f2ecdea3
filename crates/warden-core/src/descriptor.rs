use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::GovernError;

/// Unique opaque token identifying one intercepted call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn generate() -> Self {
        Self(format!("call_{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One intercepted tool call. Immutable once created: the proxy never
/// mutates a descriptor, and a `Modify` decision carries replacement
/// arguments separately rather than editing the original.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallDescriptor {
    pub call_id: CallId,
    pub agent_id: String,
    pub tool_name: String,
    /// Insertion-ordered (serde_json `preserve_order`).
    pub arguments: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl CallDescriptor {
    /// Build a descriptor with a fresh call id and timestamp.
    ///
    /// `agent_id` and `tool_name` must be non-empty.
    pub fn new(
        agent_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Result<Self, GovernError> {
        let agent_id = agent_id.into();
        let tool_name = tool_name.into();

        if agent_id.trim().is_empty() {
            return Err(GovernError::InvalidDescriptor(
                "agent_id must be non-empty".to_string(),
            ));
        }
        if tool_name.trim().is_empty() {
            return Err(GovernError::InvalidDescriptor(
                "tool_name must be non-empty".to_string(),
            ));
        }

        Ok(Self {
            call_id: CallId::generate(),
            agent_id,
            tool_name,
            arguments,
            timestamp: Utc::now(),
        })
    }
}
