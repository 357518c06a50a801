//! Classified error taxonomy for the orchestration core.
//!
//! Every failure path funnels into one of these variants so callers can
//! distinguish a deliberate cancellation from a transport failure, and a
//! per-tool failure from a whole-request failure.

use thiserror::Error;

/// Phase tags attached to transport and cancellation outcomes.
///
/// Kept as constants so log lines and error messages stay uniform across
/// the orchestrator, agent loop and backend client.
pub mod phase {
    pub const CHAT_REQUEST: &str = "chat request";
    pub const TOOL_RESULT_PROCESSING: &str = "tool result processing";
    pub const AGENT_REASONING: &str = "agent reasoning";
    pub const AGENT_LOOP: &str = "agent loop";
    pub const TOOL_EXECUTION: &str = "tool execution";
    pub const MODEL_LISTING: &str = "model listing";
    pub const PATTERN_LISTING: &str = "pattern listing";
    pub const CONVERSATION_LOOKUP: &str = "conversation lookup";
    pub const TRANSCRIPT_FETCH: &str = "transcript fetch";
    pub const RESOURCE_READ: &str = "resource read";
}

#[derive(Debug, Error)]
pub enum Error {
    /// An inline substitution token could not be resolved. Surfaced before
    /// any network call is made.
    #[error("cannot resolve {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    /// A non-retryable HTTP status or exhausted retry budget.
    #[error("{phase} failed ({retries} retries): {message}")]
    Transport {
        phase: &'static str,
        message: String,
        status: Option<u16>,
        retries: u32,
    },

    /// A single tool call failed. Never escalated to a whole-request failure
    /// by the registry; only surfaced directly when a caller asked for
    /// exactly this tool.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// A server connect/reconnect failure, isolated to that server.
    #[error("server '{server_id}': {message}")]
    Registry {
        server_id: String,
        message: String,
    },

    /// The request was deliberately stopped by its owner. Distinguished from
    /// failure so callers can present cancellation, not error.
    #[error("{phase} cancelled")]
    Cancelled { phase: &'static str },
}

impl Error {
    pub fn parse(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn registry(server_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Registry {
            server_id: server_id.into(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
