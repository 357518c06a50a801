//! Tool data model — shared between the registry, orchestrator and agent loop.
//!
//! A tool is identified globally by the pair (server id, name); the bare name
//! is only unique when exactly one connected, enabled server exposes it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Separator between a server id and a tool name in a qualified name.
/// Server ids may not contain it; the first occurrence splits.
pub const QUALIFIER: char = ':';

/// JSON Schema for tool input parameters, treated as opaque data.
///
/// Only `required` is interpreted (structural argument validation at call
/// time); `properties` passes through to the language model untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInputSchema {
    #[serde(rename = "type")]
    pub schema_type: String,
    pub properties: Value,
    #[serde(default)]
    pub required: Vec<String>,
}

impl ToolInputSchema {
    /// Schema accepting any object. Used when a server advertises no schema.
    pub fn any_object() -> Self {
        Self {
            schema_type: "object".to_string(),
            properties: serde_json::json!({}),
            required: Vec::new(),
        }
    }
}

/// A tool discovered on a connected server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: ToolInputSchema,
    pub server_id: String,
    pub server_name: String,
}

impl ToolDescriptor {
    /// Globally unique name: `server_id:name`.
    pub fn qualified_name(&self) -> String {
        format!("{}{}{}", self.server_id, QUALIFIER, self.name)
    }
}

/// Split a qualified name into (server id, tool name), if qualified.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    name.split_once(QUALIFIER)
}

/// One requested tool invocation, id-correlated with its [`ToolResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub server_id: String,
    pub arguments: serde_json::Map<String, Value>,
}

impl ToolCall {
    pub fn new(
        server_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            server_id: server_id.into(),
            arguments,
        }
    }
}

/// Result of one tool invocation. Exactly one per [`ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub success: bool,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            success: true,
            content: content.into(),
            error: None,
        }
    }

    pub fn failure(tool_call_id: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            tool_call_id: tool_call_id.into(),
            success: false,
            content: String::new(),
            error: Some(error),
        }
    }
}
