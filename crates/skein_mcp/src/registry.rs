//! Tool registry: owns server connections, tool catalogs and name-collision
//! bookkeeping.
//!
//! All mutation (connect, reconnect, enable/disable, cleanup) goes through
//! registry operations; callers only ever see snapshots and cloned
//! descriptors. Per-server state sits behind its own async mutex, so a
//! reconnect in progress for server A never races a tool call dispatched to
//! server A, while servers B and C stay fully available.

use crate::connection::{
    ConnectionStatus, DiscoveredResource, ServerConnection, ServerLauncher, ServerTransport,
};
use chrono::Utc;
use skein_core::config::ToolServerConfig;
use skein_core::error::Error;
use skein_core::tools::{split_qualified, ToolCall, ToolDescriptor, ToolResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Internal state
// ============================================================================

struct ServerEntry {
    config: ToolServerConfig,
    status: ConnectionStatus,
    last_connected: Option<chrono::DateTime<Utc>>,
    error: Option<String>,
    tools: Vec<ToolDescriptor>,
    transport: Option<Box<dyn ServerTransport>>,
}

/// Server id is immutable, so it lives outside the lock for cheap lookup.
struct ServerSlot {
    id: String,
    entry: Arc<Mutex<ServerEntry>>,
}

// ============================================================================
// ToolRegistry
// ============================================================================

pub struct ToolRegistry {
    servers: Vec<ServerSlot>,
    launcher: Box<dyn ServerLauncher>,
    tool_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(
        configs: Vec<ToolServerConfig>,
        launcher: Box<dyn ServerLauncher>,
        tool_timeout: Duration,
    ) -> Self {
        let mut servers: Vec<ServerSlot> = Vec::with_capacity(configs.len());
        for config in configs {
            if config.id.is_empty() {
                tracing::warn!("Skipping tool server with empty id ('{}')", config.name);
                continue;
            }
            if servers.iter().any(|s| s.id == config.id) {
                tracing::warn!("Skipping duplicate tool server id '{}'", config.id);
                continue;
            }
            servers.push(ServerSlot {
                id: config.id.clone(),
                entry: Arc::new(Mutex::new(ServerEntry {
                    config,
                    status: ConnectionStatus::Disconnected,
                    last_connected: None,
                    error: None,
                    tools: Vec::new(),
                    transport: None,
                })),
            });
        }
        Self {
            servers,
            launcher,
            tool_timeout,
        }
    }

    fn find_slot(&self, id: &str) -> Option<&ServerSlot> {
        self.servers.iter().find(|s| s.id == id)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Connect all enabled servers. Discovery proceeds concurrently; a single
    /// server's failure never aborts the others.
    pub async fn initialize(&self) {
        let futures = self.servers.iter().map(|slot| async move {
            let enabled = slot.entry.lock().await.config.enabled;
            if !enabled {
                tracing::info!("Skipping tool server '{}' (disabled)", slot.id);
                return;
            }
            if let Err(e) = self.connect_slot(slot).await {
                tracing::error!("Failed to connect tool server '{}': {}", slot.id, e);
            }
        });
        futures_util::future::join_all(futures).await;
    }

    /// Reconnect one server by id. Transitions through `connecting`,
    /// replaces the tool catalog on success, and preserves `last_connected`
    /// only on success.
    pub async fn reconnect(&self, id: &str) -> Result<(), Error> {
        let slot = self
            .find_slot(id)
            .ok_or_else(|| Error::registry(id, "unknown server"))?;
        self.connect_slot(slot).await
    }

    /// Enable or disable a server. Disabling tears the connection down;
    /// a disabled server never leaves `disconnected` until re-enabled and
    /// explicitly reconnected.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), Error> {
        let slot = self
            .find_slot(id)
            .ok_or_else(|| Error::registry(id, "unknown server"))?;
        let mut entry = slot.entry.lock().await;
        entry.config.enabled = enabled;
        if !enabled {
            if let Some(mut transport) = entry.transport.take() {
                transport.close().await;
            }
            entry.status = ConnectionStatus::Disconnected;
            entry.tools.clear();
            entry.error = None;
            tracing::info!("Tool server '{}' disabled", id);
        }
        Ok(())
    }

    /// Disconnect everything. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        for slot in &self.servers {
            let mut entry = slot.entry.lock().await;
            if let Some(mut transport) = entry.transport.take() {
                transport.close().await;
                tracing::info!("Tool server '{}' disconnected", slot.id);
            }
            entry.status = ConnectionStatus::Disconnected;
            entry.tools.clear();
        }
    }

    async fn connect_slot(&self, slot: &ServerSlot) -> Result<(), Error> {
        let mut entry = slot.entry.lock().await;
        if !entry.config.enabled {
            return Err(Error::registry(&slot.id, "server is disabled"));
        }

        if let Some(mut old) = entry.transport.take() {
            old.close().await;
        }
        entry.status = ConnectionStatus::Connecting;
        entry.tools.clear();
        entry.error = None;

        let transport = match self.launcher.launch(&entry.config).await {
            Ok(t) => t,
            Err(e) => {
                entry.status = ConnectionStatus::Error;
                entry.error = Some(e.to_string());
                return Err(Error::registry(&slot.id, e.to_string()));
            }
        };

        let mut transport = transport;
        let server_id = entry.config.id.clone();
        let server_name = entry.config.name.clone();
        match transport.list_tools().await {
            Ok(discovered) => {
                entry.tools = discovered
                    .into_iter()
                    .map(|t| ToolDescriptor {
                        name: t.name,
                        description: t.description,
                        input_schema: t.input_schema,
                        server_id: server_id.clone(),
                        server_name: server_name.clone(),
                    })
                    .collect();
                entry.transport = Some(transport);
                entry.status = ConnectionStatus::Connected;
                entry.last_connected = Some(Utc::now());
                tracing::info!(
                    "Tool server '{}': {} tool(s) discovered",
                    slot.id,
                    entry.tools.len()
                );
                Ok(())
            }
            Err(e) => {
                transport.close().await;
                entry.status = ConnectionStatus::Error;
                entry.error = Some(e.to_string());
                Err(Error::registry(&slot.id, e.to_string()))
            }
        }
    }

    /// Snapshot of every configured connection, in configuration order.
    pub async fn connections(&self) -> Vec<ServerConnection> {
        let mut out = Vec::with_capacity(self.servers.len());
        for slot in &self.servers {
            let entry = slot.entry.lock().await;
            out.push(ServerConnection {
                id: slot.id.clone(),
                name: entry.config.name.clone(),
                status: entry.status,
                last_connected: entry.last_connected,
                error: entry.error.clone(),
                tools: entry.tools.clone(),
            });
        }
        out
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Resolve a qualified (`server:tool`) or bare tool name.
    ///
    /// A bare name resolves only when exactly one enabled, connected server
    /// exposes it; otherwise `None` — the caller must disambiguate via
    /// [`conflict_resolution`](Self::conflict_resolution).
    pub async fn get_tool(&self, name: &str) -> Option<ToolDescriptor> {
        if let Some((server_id, tool_name)) = split_qualified(name) {
            let slot = self.find_slot(server_id)?;
            let entry = slot.entry.lock().await;
            if entry.config.enabled && entry.status == ConnectionStatus::Connected {
                return entry.tools.iter().find(|t| t.name == tool_name).cloned();
            }
            return None;
        }

        let mut found: Option<ToolDescriptor> = None;
        for slot in &self.servers {
            let entry = slot.entry.lock().await;
            if !entry.config.enabled || entry.status != ConnectionStatus::Connected {
                continue;
            }
            if let Some(tool) = entry.tools.iter().find(|t| t.name == name) {
                if found.is_some() {
                    // Conflicted bare name
                    return None;
                }
                found = Some(tool.clone());
            }
        }
        found
    }

    /// Whether two or more enabled, connected servers expose this bare name.
    pub async fn is_tool_conflicted(&self, bare_name: &str) -> bool {
        self.owners_of(bare_name).await.len() >= 2
    }

    /// The disambiguation set for a conflicted bare name: every qualified
    /// name that would resolve it.
    pub async fn conflict_resolution(&self, bare_name: &str) -> Vec<String> {
        self.owners_of(bare_name)
            .await
            .iter()
            .map(|d| d.qualified_name())
            .collect()
    }

    async fn owners_of(&self, bare_name: &str) -> Vec<ToolDescriptor> {
        let mut owners = Vec::new();
        for slot in &self.servers {
            let entry = slot.entry.lock().await;
            if !entry.config.enabled || entry.status != ConnectionStatus::Connected {
                continue;
            }
            if let Some(tool) = entry.tools.iter().find(|t| t.name == bare_name) {
                owners.push(tool.clone());
            }
        }
        owners
    }

    /// Up to three qualified names most similar to `name`, for typo
    /// suggestions. Scores below 0.3 are never suggested.
    pub async fn similar_tools(&self, name: &str) -> Vec<String> {
        const MAX_RESULTS: usize = 3;
        let query = match split_qualified(name) {
            Some((_, tool)) => tool,
            None => name,
        };

        let mut scored: Vec<(String, f64)> = Vec::new();
        for tool in self.tools_for_llm().await {
            let score = similarity(query, &tool.name);
            if score > 0.3 {
                scored.push((tool.qualified_name(), score));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(MAX_RESULTS);
        scored.into_iter().map(|(name, _)| name).collect()
    }

    /// Flattened catalog for handing to a language model: every tool of every
    /// enabled, connected server, de-duplicated by qualified name, in a
    /// deterministic order.
    pub async fn tools_for_llm(&self) -> Vec<ToolDescriptor> {
        let mut by_qualified: BTreeMap<String, ToolDescriptor> = BTreeMap::new();
        for slot in &self.servers {
            let entry = slot.entry.lock().await;
            if !entry.config.enabled || entry.status != ConnectionStatus::Connected {
                continue;
            }
            for tool in &entry.tools {
                by_qualified
                    .entry(tool.qualified_name())
                    .or_insert_with(|| tool.clone());
            }
        }
        by_qualified.into_values().collect()
    }

    /// Whether any enabled, connected server currently exposes tools.
    pub async fn has_available_tools(&self) -> bool {
        for slot in &self.servers {
            let entry = slot.entry.lock().await;
            if entry.config.enabled
                && entry.status == ConnectionStatus::Connected
                && !entry.tools.is_empty()
            {
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Execute a set of tool calls in input order. Never fails as a whole:
    /// every call yields exactly one id-correlated [`ToolResult`], including
    /// timeouts, unknown servers and calls skipped after cancellation.
    pub async fn execute_tool_calls(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if cancel.is_cancelled() {
                results.push(ToolResult::failure(&call.id, "cancelled before execution"));
                continue;
            }
            let result = self.execute_one(call, cancel).await;
            if !result.success {
                tracing::warn!(
                    "Tool '{}' on '{}' failed: {}",
                    call.tool_name,
                    call.server_id,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            results.push(result);
        }
        results
    }

    async fn execute_one(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        let Some(slot) = self.find_slot(&call.server_id) else {
            return ToolResult::failure(&call.id, format!("unknown server '{}'", call.server_id));
        };

        // One reconnect attempt for servers configured to auto-reconnect.
        let needs_reconnect = {
            let entry = slot.entry.lock().await;
            entry.config.auto_reconnect
                && entry.config.enabled
                && entry.status == ConnectionStatus::Error
        };
        if needs_reconnect {
            tracing::info!("Auto-reconnecting tool server '{}'", slot.id);
            if let Err(e) = self.connect_slot(slot).await {
                tracing::warn!("Auto-reconnect for '{}' failed: {}", slot.id, e);
            }
        }

        let entry = slot.entry.lock().await;
        if !entry.config.enabled {
            return ToolResult::failure(&call.id, format!("server '{}' is disabled", slot.id));
        }
        if entry.status != ConnectionStatus::Connected {
            return ToolResult::failure(
                &call.id,
                format!(
                    "server '{}' is not connected ({})",
                    slot.id,
                    entry.error.as_deref().unwrap_or("no error recorded")
                ),
            );
        }

        // Structural validation only: required fields present. The schema
        // itself is opaque data owned by the server.
        let Some(tool) = entry.tools.iter().find(|t| t.name == call.tool_name) else {
            return ToolResult::failure(
                &call.id,
                format!(
                    "unknown tool '{}' on server '{}'",
                    call.tool_name, slot.id
                ),
            );
        };
        for field in &tool.input_schema.required {
            if !call.arguments.contains_key(field) {
                return ToolResult::failure(
                    &call.id,
                    format!("missing required field '{}'", field),
                );
            }
        }

        let Some(transport) = entry.transport.as_ref() else {
            return ToolResult::failure(&call.id, format!("server '{}' has no transport", slot.id));
        };

        let arguments = if call.arguments.is_empty() {
            None
        } else {
            Some(call.arguments.clone())
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                ToolResult::failure(&call.id, "cancelled during execution")
            }
            outcome = tokio::time::timeout(self.tool_timeout, transport.call_tool(&call.tool_name, arguments)) => {
                match outcome {
                    Err(_) => ToolResult::failure(
                        &call.id,
                        format!("timed out after {}s", self.tool_timeout.as_secs()),
                    ),
                    Ok(Err(e)) => ToolResult::failure(&call.id, e.to_string()),
                    Ok(Ok(out)) if out.is_error => ToolResult::failure(&call.id, out.content),
                    Ok(Ok(out)) => ToolResult::ok(&call.id, out.content),
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------------

    /// Every resource advertised by enabled, connected servers. A server
    /// failing its listing is skipped, not fatal.
    pub async fn available_resources(&self) -> Vec<(String, DiscoveredResource)> {
        let mut out = Vec::new();
        for slot in &self.servers {
            let entry = slot.entry.lock().await;
            if !entry.config.enabled || entry.status != ConnectionStatus::Connected {
                continue;
            }
            let Some(transport) = entry.transport.as_ref() else {
                continue;
            };
            match transport.list_resources().await {
                Ok(resources) => {
                    out.extend(resources.into_iter().map(|r| (slot.id.clone(), r)));
                }
                Err(e) => {
                    tracing::warn!("Listing resources on '{}' failed: {}", slot.id, e);
                }
            }
        }
        out
    }

    /// Read a server-advertised resource by URI, independent of the
    /// tool-call path. The owning server is located by live listing.
    pub async fn read_resource(&self, uri: &str) -> Result<String, Error> {
        for slot in &self.servers {
            let entry = slot.entry.lock().await;
            if !entry.config.enabled || entry.status != ConnectionStatus::Connected {
                continue;
            }
            let Some(transport) = entry.transport.as_ref() else {
                continue;
            };
            let advertises = match transport.list_resources().await {
                Ok(resources) => resources.iter().any(|r| r.uri == uri),
                Err(e) => {
                    tracing::warn!("Listing resources on '{}' failed: {}", slot.id, e);
                    continue;
                }
            };
            if advertises {
                return transport
                    .read_resource(uri)
                    .await
                    .map_err(|e| Error::registry(&slot.id, e.to_string()));
            }
        }
        Err(Error::registry(
            "registry",
            format!("no connected server advertises resource '{}'", uri),
        ))
    }
}

// ============================================================================
// Edit distance
// ============================================================================

/// Levenshtein distance, single-row DP.
fn levenshtein(a: &str, b: &str) -> usize {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    let m = a_bytes.len();
    let n = b_bytes.len();

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a_bytes[i - 1] != b_bytes[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[n]
}

/// Normalized similarity in 0.0–1.0 (1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}
