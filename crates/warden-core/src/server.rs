use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Capability interface the wrapped tool server must satisfy.
///
/// Checked structurally: any object implementing the named operations can
/// be governed, no inheritance relationship required. Failures are opaque
/// to this layer and pass through to callers unchanged.
#[async_trait]
pub trait ToolServer: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    /// Invoke one tool operation.
    async fn call_tool(
        &self,
        tool: &str,
        arguments: &Map<String, Value>,
    ) -> anyhow::Result<ToolOutput>;

    /// Stable identifier for logs and audit context.
    fn server_id(&self) -> &str {
        "tool-server"
    }
}

/// Result body of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError")]
    pub is_error: bool,
    #[serde(rename = "structuredContent", skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text { text: String },
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::Text { text: text.into() }],
            is_error: false,
            structured: None,
        }
    }

    /// Synthesized result for a denied call. Carries the evaluator's
    /// reason both as text and as a structured contract.
    pub fn rejection(reason: &str) -> Self {
        let contract = serde_json::json!({
            "status": "deny",
            "reason": reason,
        });
        Self {
            content: vec![
                ContentItem::Text {
                    text: "Call blocked by policy".to_string(),
                },
                ContentItem::Text {
                    text: contract.to_string(),
                },
            ],
            is_error: true,
            structured: Some(contract),
        }
    }
}
