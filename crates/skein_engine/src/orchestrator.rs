//! Request orchestrator: decides how a request is processed and drives it.
//!
//! Parse → substitute → effective mode → dispatch. CHAT is one backend round
//! trip with an optional single tool round trip; AGENT delegates to the
//! bounded loop, falling back to CHAT (with a warning) when the loop's
//! prerequisites aren't met.

use crate::agent::{AgentEvent, AgentLoop};
use crate::api_types::{LlmRequest, PendingToolCall};
use crate::backend::BackendClient;
use crate::command::{self, ProcessingMode, PromptSources};
use skein_core::config::{AgentSettings, BackendConfig};
use skein_core::error::{phase, Error};
use skein_core::tools::{ToolCall, ToolResult};
use skein_mcp::ToolRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// Request / response
// ============================================================================

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub prompt: String,
    /// Caller-selected default; a leading `/chat` or `/agent` overrides it.
    pub mode: ProcessingMode,
    pub model: Option<String>,
    pub template: Option<String>,
    pub conversation_id: Option<String>,
    pub json_mode: bool,
    pub images: Vec<String>,
}

impl ChatRequest {
    pub fn new(prompt: impl Into<String>, mode: ProcessingMode) -> Self {
        Self {
            prompt: prompt.into(),
            mode,
            model: None,
            template: None,
            conversation_id: None,
            json_mode: false,
            images: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct ChatResponse {
    pub text: String,
    pub conversation_id: Option<String>,
    pub mode_used: ProcessingMode,
    /// Non-fatal conditions the caller should surface (e.g. an agent→chat
    /// fallback).
    pub warnings: Vec<String>,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    backend: Arc<dyn BackendClient>,
    registry: Arc<ToolRegistry>,
    sources: Arc<dyn PromptSources>,
    agent: AgentLoop,
    default_model: String,
    default_template: Option<String>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        registry: Arc<ToolRegistry>,
        sources: Arc<dyn PromptSources>,
        backend_config: &BackendConfig,
        agent_settings: AgentSettings,
    ) -> Self {
        let agent = AgentLoop::new(
            backend.clone(),
            registry.clone(),
            agent_settings,
            backend_config.model.clone(),
        );
        Self {
            backend,
            registry,
            sources,
            agent,
            default_model: backend_config.model.clone(),
            default_template: backend_config.template.clone(),
        }
    }

    /// Process one request. `progress` (if given) receives agent-loop events;
    /// it stays silent for chat-mode requests.
    #[tracing::instrument(skip_all, fields(ui_mode = ?request.mode))]
    pub async fn send(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
        progress: Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<ChatResponse, Error> {
        let parsed = command::parse(&request.prompt);
        let mode = parsed.mode.unwrap_or(request.mode);

        // Substitution failures surface before any network call.
        let prompt =
            command::expand_tokens(&parsed.clean_prompt, self.sources.as_ref(), &self.registry)
                .await?;

        match mode {
            ProcessingMode::Agent => {
                if self.agent.available().await {
                    return self.send_agent(&prompt, cancel, progress).await;
                }
                let warning = "Agent mode unavailable (no connected tool servers); \
                               processing as chat"
                    .to_string();
                tracing::warn!("{}", warning);
                self.send_chat(prompt, &request, vec![warning], cancel).await
            }
            ProcessingMode::Chat => self.send_chat(prompt, &request, Vec::new(), cancel).await,
        }
    }

    // ------------------------------------------------------------------------
    // Chat pipeline
    // ------------------------------------------------------------------------

    async fn send_chat(
        &self,
        prompt: String,
        request: &ChatRequest,
        warnings: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, Error> {
        // The catalog is advisory: a backend without function calling just
        // answers in one round trip.
        let tools = self.registry.tools_for_llm().await;

        let llm_request = LlmRequest {
            prompt: prompt.clone(),
            template: request
                .template
                .clone()
                .or_else(|| self.default_template.clone()),
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            options: None,
            json_mode: request.json_mode,
            images: request.images.clone(),
            conversation_id: request.conversation_id.clone(),
            tools,
        };

        let response = self
            .backend
            .complete(&llm_request, phase::CHAT_REQUEST, cancel)
            .await?;

        if response.tool_calls.is_empty() {
            return Ok(ChatResponse {
                text: response.result,
                conversation_id: response.conversation_id,
                mode_used: ProcessingMode::Chat,
                warnings,
            });
        }

        // Single tool round trip: execute the pending calls, then one — and
        // only one — follow-up carrying the consolidated results.
        tracing::info!(
            "Backend requested {} tool call(s)",
            response.tool_calls.len()
        );
        let results_block = self
            .run_tool_round(&response.tool_calls, cancel)
            .await;

        let follow_up = LlmRequest {
            prompt: format!("{}\n\n{}", prompt, results_block),
            template: llm_request.template.clone(),
            model: llm_request.model.clone(),
            options: None,
            json_mode: request.json_mode,
            images: Vec::new(),
            conversation_id: response
                .conversation_id
                .clone()
                .or_else(|| request.conversation_id.clone()),
            tools: Vec::new(),
        };

        let second = self
            .backend
            .complete(&follow_up, phase::TOOL_RESULT_PROCESSING, cancel)
            .await?;
        if !second.tool_calls.is_empty() {
            tracing::warn!(
                "Backend requested further tool calls after the result round trip; ignoring"
            );
        }

        Ok(ChatResponse {
            text: second.result,
            conversation_id: second.conversation_id.or(response.conversation_id),
            mode_used: ProcessingMode::Chat,
            warnings,
        })
    }

    /// Resolve and execute the backend's pending tool calls, and format the
    /// consolidated results block. Resolution failures (unknown or
    /// conflicted names) become failed results with hints — never a request
    /// failure.
    async fn run_tool_round(
        &self,
        pending: &[PendingToolCall],
        cancel: &CancellationToken,
    ) -> String {
        let mut ordered: Vec<(String, String)> = Vec::with_capacity(pending.len());
        let mut calls: Vec<ToolCall> = Vec::new();
        let mut unresolved: Vec<ToolResult> = Vec::new();

        for p in pending {
            let id = p
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            ordered.push((id.clone(), p.name.clone()));

            match self.registry.get_tool(&p.name).await {
                Some(descriptor) => {
                    calls.push(ToolCall {
                        id,
                        tool_name: descriptor.name,
                        server_id: descriptor.server_id,
                        arguments: p.arguments.clone(),
                    });
                }
                None => {
                    let message = if self.registry.is_tool_conflicted(&p.name).await {
                        let candidates = self.registry.conflict_resolution(&p.name).await;
                        format!(
                            "tool name '{}' is ambiguous; qualify it as one of: {}",
                            p.name,
                            candidates.join(", ")
                        )
                    } else {
                        let similar = self.registry.similar_tools(&p.name).await;
                        if similar.is_empty() {
                            format!("unknown tool '{}'", p.name)
                        } else {
                            format!(
                                "unknown tool '{}'; did you mean: {}?",
                                p.name,
                                similar.join(", ")
                            )
                        }
                    };
                    tracing::warn!("{}", message);
                    unresolved.push(ToolResult::failure(id, message));
                }
            }
        }

        let executed = self.registry.execute_tool_calls(&calls, cancel).await;
        let mut by_id: HashMap<String, ToolResult> = executed
            .into_iter()
            .chain(unresolved)
            .map(|r| (r.tool_call_id.clone(), r))
            .collect();

        let mut block = String::from("Tool results:\n");
        for (index, (id, name)) in ordered.iter().enumerate() {
            match by_id.remove(id) {
                Some(result) if result.success => {
                    block.push_str(&format!("[{}] {} — ok\n{}\n", index + 1, name, result.content));
                }
                Some(result) => {
                    block.push_str(&format!(
                        "[{}] {} — failed: {}\n",
                        index + 1,
                        name,
                        result.error.as_deref().unwrap_or("unknown error")
                    ));
                }
                None => {
                    block.push_str(&format!("[{}] {} — no result recorded\n", index + 1, name));
                }
            }
        }
        block
    }

    // ------------------------------------------------------------------------
    // Agent pipeline
    // ------------------------------------------------------------------------

    async fn send_agent(
        &self,
        goal: &str,
        cancel: &CancellationToken,
        progress: Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<ChatResponse, Error> {
        let outcome = self.agent.run(goal, cancel, progress).await?;
        let warnings = if outcome.completed {
            Vec::new()
        } else {
            vec!["Agent stopped at the step limit before completing the goal".to_string()]
        };
        Ok(ChatResponse {
            text: outcome.answer,
            conversation_id: None,
            mode_used: ProcessingMode::Agent,
            warnings,
        })
    }
}
