//! Step-bounded ReAct loop: reason → act → observe, one tool call per step.
//!
//! The loop always terminates within `max_steps` reasoning iterations even
//! if the backend never says "complete". A failed action is recorded and fed
//! back into the next reasoning call; only a reasoning-call failure itself is
//! loop-fatal.

use crate::api_types::LlmRequest;
use crate::backend::BackendClient;
use crate::prompts;
use serde::Deserialize;
use serde_json::Value;
use skein_core::config::AgentSettings;
use skein_core::error::{phase, Error};
use skein_core::tools::ToolCall;
use skein_mcp::ToolRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Reasoning protocol
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentDecision {
    Continue,
    Complete,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedAction {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
    #[serde(default)]
    pub justification: String,
}

/// One reasoning step as returned by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ReasoningResponse {
    pub decision: AgentDecision,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub goal_status: String,
    #[serde(default)]
    pub action: Option<PlannedAction>,
}

/// One executed (or attempted) action, appended to the loop's history.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActionResult {
    pub step: u32,
    pub server: String,
    pub tool: String,
    pub parameters: serde_json::Map<String, Value>,
    pub result: String,
    pub justification: String,
    pub success: bool,
}

// ============================================================================
// Progress events
// ============================================================================

/// Progress events, delivered through a single-consumer channel per request.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    StepStart {
        step: u32,
    },
    ReasoningComplete {
        step: u32,
        decision: AgentDecision,
        goal_status: String,
    },
    ActionStart {
        step: u32,
        server: String,
        tool: String,
    },
    ActionComplete {
        step: u32,
        success: bool,
    },
}

/// Final outcome of one loop run.
#[derive(Debug)]
pub struct AgentRunResult {
    pub answer: String,
    pub history: Vec<ActionResult>,
    /// `false` when the loop hit the step limit before the backend said
    /// "complete".
    pub completed: bool,
}

// ============================================================================
// AgentLoop
// ============================================================================

pub struct AgentLoop {
    backend: Arc<dyn BackendClient>,
    registry: Arc<ToolRegistry>,
    settings: AgentSettings,
    model: String,
}

impl AgentLoop {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        registry: Arc<ToolRegistry>,
        settings: AgentSettings,
        model: String,
    ) -> Self {
        Self {
            backend,
            registry,
            settings,
            model,
        }
    }

    /// The loop's own availability check: it can only make progress when at
    /// least one enabled, connected server exposes a tool.
    pub async fn available(&self) -> bool {
        self.registry.has_available_tools().await
    }

    /// Run the loop for one goal. Events (if a sender is given) are emitted
    /// for step-start, reasoning-complete, action-start and action-complete;
    /// after cancellation no further events are emitted.
    #[tracing::instrument(skip(self, goal, cancel, events))]
    pub async fn run(
        &self,
        goal: &str,
        cancel: &CancellationToken,
        events: Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<AgentRunResult, Error> {
        let tools = self.registry.tools_for_llm().await;
        let mut history: Vec<ActionResult> = Vec::new();
        let mut last_status = String::new();

        for step in 1..=self.settings.max_steps {
            if cancel.is_cancelled() {
                tracing::info!("Agent loop cancelled at step {}", step);
                return Err(Error::Cancelled {
                    phase: phase::AGENT_LOOP,
                });
            }
            emit(&events, AgentEvent::StepStart { step });

            // Reasoning: failures here are loop-fatal.
            let reasoning = self.reason(goal, &tools, &history, cancel).await?;
            last_status = reasoning.goal_status.clone();
            tracing::debug!(
                "Step {}: decision={:?}, status={}",
                step,
                reasoning.decision,
                reasoning.goal_status
            );
            emit(
                &events,
                AgentEvent::ReasoningComplete {
                    step,
                    decision: reasoning.decision,
                    goal_status: reasoning.goal_status.clone(),
                },
            );

            if reasoning.decision == AgentDecision::Complete {
                return Ok(AgentRunResult {
                    answer: synthesize_answer(&reasoning, &history),
                    history,
                    completed: true,
                });
            }

            let Some(action) = reasoning.action else {
                // Protocol slip: "continue" with no action. Feed it back as a
                // failed observation so the model can recover.
                tracing::warn!("Step {}: decision was 'continue' but no action given", step);
                history.push(ActionResult {
                    step,
                    server: String::new(),
                    tool: String::new(),
                    parameters: serde_json::Map::new(),
                    result: "decision was 'continue' but no action was provided".to_string(),
                    justification: reasoning.reasoning.clone(),
                    success: false,
                });
                continue;
            };

            emit(
                &events,
                AgentEvent::ActionStart {
                    step,
                    server: action.server.clone(),
                    tool: action.tool.clone(),
                },
            );

            // Acting: exactly one tool call per step. Failures are recorded,
            // never fatal.
            let call = ToolCall::new(&action.server, &action.tool, action.parameters.clone());
            let mut results = self
                .registry
                .execute_tool_calls(std::slice::from_ref(&call), cancel)
                .await;
            let result = results.pop().unwrap_or_else(|| {
                skein_core::ToolResult::failure(&call.id, "registry returned no result")
            });

            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    phase: phase::AGENT_LOOP,
                });
            }

            let success = result.success;
            history.push(ActionResult {
                step,
                server: action.server,
                tool: action.tool,
                parameters: action.parameters,
                result: if success {
                    result.content
                } else {
                    result.error.unwrap_or_else(|| "unknown error".to_string())
                },
                justification: action.justification,
                success,
            });
            emit(&events, AgentEvent::ActionComplete { step, success });
        }

        tracing::warn!(
            "Agent loop hit the {}-step limit without completing",
            self.settings.max_steps
        );
        Ok(AgentRunResult {
            answer: synthesize_abort(&last_status, &history, self.settings.max_steps),
            history,
            completed: false,
        })
    }

    async fn reason(
        &self,
        goal: &str,
        tools: &[skein_core::ToolDescriptor],
        history: &[ActionResult],
        cancel: &CancellationToken,
    ) -> Result<ReasoningResponse, Error> {
        let request = LlmRequest {
            prompt: format!(
                "{}\n\n{}",
                prompts::REASONING_SYSTEM_PROMPT,
                prompts::render_reasoning_prompt(goal, tools, history)
            ),
            template: None,
            model: self.model.clone(),
            options: None,
            json_mode: true,
            images: Vec::new(),
            conversation_id: None,
            tools: Vec::new(),
        };

        let response = self
            .backend
            .complete(&request, phase::AGENT_REASONING, cancel)
            .await?;

        parse_reasoning_response(&response.result).ok_or_else(|| Error::Transport {
            phase: phase::AGENT_REASONING,
            message: format!(
                "unparseable reasoning response: {}",
                response.result.chars().take(200).collect::<String>()
            ),
            status: None,
            retries: 0,
        })
    }
}

fn emit(events: &Option<mpsc::Sender<AgentEvent>>, event: AgentEvent) {
    if let Some(tx) = events {
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                tracing::warn!("Agent event channel full, dropping {:?}", ev);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Consumer went away; progress is best-effort.
            }
        }
    }
}

/// Parse the backend's reasoning output, handling common formatting quirks:
/// direct JSON, fenced code blocks, JSON embedded in prose.
pub fn parse_reasoning_response(text: &str) -> Option<ReasoningResponse> {
    let trimmed = text.trim();

    if let Ok(resp) = serde_json::from_str::<ReasoningResponse>(trimmed) {
        return Some(resp);
    }

    // JSON object embedded in a code fence or surrounding prose
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(resp) = serde_json::from_str::<ReasoningResponse>(&trimmed[start..=end]) {
                return Some(resp);
            }
        }
    }

    tracing::debug!("Could not parse reasoning response: {}", trimmed);
    None
}

fn synthesize_answer(reasoning: &ReasoningResponse, history: &[ActionResult]) -> String {
    let mut answer = if reasoning.goal_status.trim().is_empty() {
        reasoning.reasoning.trim().to_string()
    } else {
        reasoning.goal_status.trim().to_string()
    };
    if answer.is_empty() {
        answer = "Goal completed.".to_string();
    }
    if !history.is_empty() {
        answer.push_str(&format!("\n\n{}", summarize_history(history)));
    }
    answer
}

fn synthesize_abort(last_status: &str, history: &[ActionResult], max_steps: u32) -> String {
    let mut answer = format!(
        "Stopped after {} step(s) without completing the goal.",
        max_steps
    );
    if !last_status.trim().is_empty() {
        answer.push_str(&format!(" Last status: {}", last_status.trim()));
    }
    if !history.is_empty() {
        answer.push_str(&format!("\n\n{}", summarize_history(history)));
    }
    answer
}

fn summarize_history(history: &[ActionResult]) -> String {
    let mut out = format!("Actions taken ({}):\n", history.len());
    for action in history {
        out.push_str(&format!(
            "  {}. {}:{} — {}\n",
            action.step,
            action.server,
            action.tool,
            if action.success { "ok" } else { "failed" }
        ));
    }
    out.trim_end().to_string()
}
