//! Tool-server connections: spawn, handshake, discovery.
//!
//! The registry never talks to rmcp directly — everything goes through the
//! [`ServerTransport`] trait so connection state can be driven (and tested)
//! independently of the wire protocol.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rmcp::model::{CallToolRequestParams, CallToolResult, RawContent, ReadResourceRequestParams};
use rmcp::service::{Peer, RoleClient, RunningService, ServiceExt};
use rmcp::transport::TokioChildProcess;
use serde::Serialize;
use skein_core::config::ToolServerConfig;
use skein_core::tools::ToolInputSchema;
use tokio::process::Command;

// ============================================================================
// Connection state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Snapshot of one server connection, returned to callers by value.
/// The registry's internal state is never exposed by reference.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConnection {
    pub id: String,
    pub name: String,
    pub status: ConnectionStatus,
    pub last_connected: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub tools: Vec<skein_core::ToolDescriptor>,
}

// ============================================================================
// Transport abstraction
// ============================================================================

/// A tool discovered during the handshake, before it is bound to a server id.
#[derive(Debug, Clone)]
pub struct DiscoveredTool {
    pub name: String,
    pub description: String,
    pub input_schema: ToolInputSchema,
}

/// A resource advertised by a server.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredResource {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
}

/// Raw outcome of one tool invocation on the wire. `is_error` is the
/// server-reported flag; transport-level failures surface as `Err` instead.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub content: String,
    pub is_error: bool,
}

#[async_trait::async_trait]
pub trait ServerTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<DiscoveredTool>>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallOutcome>;

    async fn list_resources(&self) -> Result<Vec<DiscoveredResource>>;

    async fn read_resource(&self, uri: &str) -> Result<String>;

    /// Tear down the connection (kills the child process for the
    /// process-backed transport). Idempotent.
    async fn close(&mut self);
}

/// Creates transports from server configuration. Injected into the registry
/// so tests can connect in-memory servers.
#[async_trait::async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self, config: &ToolServerConfig) -> Result<Box<dyn ServerTransport>>;
}

// ============================================================================
// rmcp child-process transport
// ============================================================================

/// Production launcher: spawns the configured command as a child process and
/// performs the MCP handshake over its stdio.
pub struct ChildProcessLauncher;

#[async_trait::async_trait]
impl ServerLauncher for ChildProcessLauncher {
    async fn launch(&self, config: &ToolServerConfig) -> Result<Box<dyn ServerTransport>> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (k, v) in &config.env {
            cmd.env(k, v);
        }

        let transport = TokioChildProcess::new(cmd)?;
        let service = ().serve(transport).await.map_err(|e| {
            anyhow::anyhow!("MCP handshake failed for '{}': {}", config.name, e)
        })?;
        let peer = service.peer().clone();

        Ok(Box::new(McpTransport {
            peer,
            service: Some(service),
        }))
    }
}

struct McpTransport {
    peer: Peer<RoleClient>,
    service: Option<RunningService<RoleClient, ()>>,
}

#[async_trait::async_trait]
impl ServerTransport for McpTransport {
    async fn list_tools(&self) -> Result<Vec<DiscoveredTool>> {
        let tools = self
            .peer
            .list_all_tools()
            .await
            .map_err(|e| anyhow::anyhow!("list_tools failed: {}", e))?;
        Ok(tools.iter().map(convert_mcp_tool).collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallOutcome> {
        let params = CallToolRequestParams {
            meta: None,
            name: name.to_string().into(),
            arguments,
            task: None,
        };
        let result = self
            .peer
            .call_tool(params)
            .await
            .map_err(|e| anyhow::anyhow!("call_tool '{}' failed: {}", name, e))?;
        Ok(convert_call_result(result))
    }

    async fn list_resources(&self) -> Result<Vec<DiscoveredResource>> {
        let resources = self
            .peer
            .list_all_resources()
            .await
            .map_err(|e| anyhow::anyhow!("list_resources failed: {}", e))?;
        Ok(resources
            .iter()
            .map(|r| DiscoveredResource {
                uri: r.uri.to_string(),
                name: r.name.to_string(),
                description: r.description.as_ref().map(|d| d.to_string()),
            })
            .collect())
    }

    async fn read_resource(&self, uri: &str) -> Result<String> {
        let params = ReadResourceRequestParams {
            meta: None,
            uri: uri.to_string(),
        };
        let result = self
            .peer
            .read_resource(params)
            .await
            .map_err(|e| anyhow::anyhow!("read_resource '{}' failed: {}", uri, e))?;

        // Concatenate all text contents; binary blobs are skipped.
        let text: String = result
            .contents
            .iter()
            .filter_map(|c| match c {
                rmcp::model::ResourceContents::TextResourceContents { text, .. } => {
                    Some(text.as_str())
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(text)
    }

    async fn close(&mut self) {
        if let Some(service) = self.service.take() {
            if let Err(e) = service.cancel().await {
                tracing::warn!("Error cancelling MCP connection: {:?}", e);
            }
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

/// Convert an rmcp tool into the registry's schema-as-data representation.
fn convert_mcp_tool(mcp_tool: &rmcp::model::Tool) -> DiscoveredTool {
    let input_schema = &mcp_tool.input_schema;

    let properties = input_schema
        .get("properties")
        .cloned()
        .unwrap_or(serde_json::json!({}));

    let required = input_schema
        .get("required")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    DiscoveredTool {
        name: mcp_tool.name.to_string(),
        description: mcp_tool
            .description
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default(),
        input_schema: ToolInputSchema {
            schema_type: "object".to_string(),
            properties,
            required,
        },
    }
}

/// Flatten a CallToolResult into text. Non-text content blocks are dropped.
fn convert_call_result(result: CallToolResult) -> CallOutcome {
    let is_error = result.is_error.unwrap_or(false);

    let content: String = result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    let content = if content.is_empty() {
        "[no output]".to_string()
    } else {
        content
    };

    CallOutcome { content, is_error }
}
