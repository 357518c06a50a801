use serde::{Deserialize, Serialize};
use serde_json::Value;
use skein_core::ToolDescriptor;

// Request payload for POST /llm
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    pub json_mode: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Advisory catalog for function-calling-capable backends. A backend
    /// that ignores it simply answers in one round trip.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDescriptor>,
}

// Response payload for POST /llm
#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    pub result: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<PendingToolCall>,
}

/// A tool invocation the backend wants executed before it can answer.
/// `name` may be qualified (`server:tool`) or bare.
#[derive(Debug, Clone, Deserialize)]
pub struct PendingToolCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, Value>,
}

// Catalog listings
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternsResponse {
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LatestCidResponse {
    #[serde(default)]
    pub conversation_id: Option<String>,
}

// YouTube transcript endpoint
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptRequest {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptResponse {
    pub transcript: String,
}
