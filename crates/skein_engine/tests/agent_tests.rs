//! Integration tests for the bounded ReAct agent loop.

use anyhow::Result;
use async_trait::async_trait;
use skein_core::config::{AgentSettings, ToolServerConfig};
use skein_core::error::Error;
use skein_core::tools::ToolInputSchema;
use skein_engine::agent::{AgentDecision, AgentEvent, AgentLoop};
use skein_engine::api_types::{LlmRequest, LlmResponse};
use skein_engine::backend::BackendClient;
use skein_mcp::connection::{
    CallOutcome, DiscoveredResource, DiscoveredTool, ServerLauncher, ServerTransport,
};
use skein_mcp::ToolRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock backend
// ============================================================================

/// Pops responses from a queue; when exhausted, repeats `fallback`. Records
/// every prompt so tests can inspect what the reasoning step saw.
struct MockBackend {
    responses: Mutex<Vec<LlmResponse>>,
    fallback: LlmResponse,
    prompts: Mutex<Vec<String>>,
    fail_all: bool,
}

impl MockBackend {
    fn queued(responses: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
            fallback: reasoning_response(
                r#"{"decision": "complete", "goal_status": "exhausted queue"}"#,
            ),
            prompts: Mutex::new(Vec::new()),
            fail_all: false,
        })
    }

    fn repeating(fallback: LlmResponse) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(Vec::new()),
            fallback,
            prompts: Mutex::new(Vec::new()),
            fail_all: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(Vec::new()),
            fallback: reasoning_response("{}"),
            prompts: Mutex::new(Vec::new()),
            fail_all: true,
        })
    }

    async fn prompt_count(&self) -> usize {
        self.prompts.lock().await.len()
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn complete(
        &self,
        request: &LlmRequest,
        phase: &'static str,
        _cancel: &CancellationToken,
    ) -> Result<LlmResponse, Error> {
        if self.fail_all {
            return Err(Error::Transport {
                phase,
                message: "backend unreachable".to_string(),
                status: Some(503),
                retries: 3,
            });
        }
        self.prompts.lock().await.push(request.prompt.clone());
        let mut queue = self.responses.lock().await;
        if queue.is_empty() {
            Ok(self.fallback.clone())
        } else {
            Ok(queue.remove(0))
        }
    }

    async fn list_models(&self, _cancel: &CancellationToken) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }

    async fn list_patterns(&self, _cancel: &CancellationToken) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }

    async fn latest_conversation_id(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Option<String>, Error> {
        Ok(None)
    }

    async fn fetch_transcript(
        &self,
        _url: &str,
        _cancel: &CancellationToken,
    ) -> Result<String, Error> {
        Ok(String::new())
    }
}

fn reasoning_response(json: &str) -> LlmResponse {
    LlmResponse {
        result: json.to_string(),
        conversation_id: None,
        tool_calls: Vec::new(),
    }
}

fn continue_with_read() -> LlmResponse {
    reasoning_response(
        r#"{"decision": "continue", "reasoning": "need the file", "goal_status": "reading",
            "action": {"server": "files", "tool": "read_file",
                       "parameters": {"path": "/tmp/x"}, "justification": "inspect it"}}"#,
    )
}

// ============================================================================
// Fake registry plumbing
// ============================================================================

struct FakeTransport {
    fail_calls: bool,
}

#[async_trait]
impl ServerTransport for FakeTransport {
    async fn list_tools(&self) -> Result<Vec<DiscoveredTool>> {
        Ok(vec![DiscoveredTool {
            name: "read_file".to_string(),
            description: "Read a file".to_string(),
            input_schema: ToolInputSchema {
                schema_type: "object".to_string(),
                properties: serde_json::json!({}),
                required: vec!["path".to_string()],
            },
        }])
    }

    async fn call_tool(
        &self,
        name: &str,
        _arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallOutcome> {
        if self.fail_calls {
            anyhow::bail!("disk on fire");
        }
        Ok(CallOutcome {
            content: format!("{} output", name),
            is_error: false,
        })
    }

    async fn list_resources(&self) -> Result<Vec<DiscoveredResource>> {
        Ok(Vec::new())
    }

    async fn read_resource(&self, uri: &str) -> Result<String> {
        anyhow::bail!("no resource '{}'", uri)
    }

    async fn close(&mut self) {}
}

struct FakeLauncher {
    fail_calls: bool,
}

#[async_trait]
impl ServerLauncher for FakeLauncher {
    async fn launch(&self, _config: &ToolServerConfig) -> Result<Box<dyn ServerTransport>> {
        Ok(Box::new(FakeTransport {
            fail_calls: self.fail_calls,
        }))
    }
}

async fn files_registry(fail_calls: bool) -> Arc<ToolRegistry> {
    let registry = ToolRegistry::new(
        vec![ToolServerConfig {
            id: "files".to_string(),
            name: "Files".to_string(),
            command: "mcp-files".to_string(),
            enabled: true,
            ..Default::default()
        }],
        Box::new(FakeLauncher { fail_calls }),
        Duration::from_secs(1),
    );
    registry.initialize().await;
    Arc::new(registry)
}

fn agent_loop(backend: Arc<MockBackend>, registry: Arc<ToolRegistry>, max_steps: u32) -> AgentLoop {
    AgentLoop::new(
        backend,
        registry,
        AgentSettings {
            max_steps,
            tool_timeout_secs: 1,
        },
        "test-model".to_string(),
    )
}

async fn drain(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_completes_on_first_reasoning_without_actions() {
    let backend = MockBackend::queued(vec![reasoning_response(
        r#"{"decision": "complete", "reasoning": "trivial", "goal_status": "the answer is 42"}"#,
    )]);
    let agent = agent_loop(backend.clone(), files_registry(false).await, 20);

    let result = agent
        .run("what is 6*7?", &CancellationToken::new(), None)
        .await
        .unwrap();

    assert!(result.completed);
    assert!(result.answer.contains("the answer is 42"));
    assert!(result.history.is_empty());
    assert_eq!(backend.prompt_count().await, 1);
}

#[tokio::test]
async fn test_never_exceeds_max_steps() {
    // Backend that never says "complete"
    let backend = MockBackend::repeating(continue_with_read());
    let agent = agent_loop(backend.clone(), files_registry(false).await, 3);

    let result = agent
        .run("impossible goal", &CancellationToken::new(), None)
        .await
        .unwrap();

    assert!(!result.completed);
    assert_eq!(result.history.len(), 3);
    assert_eq!(backend.prompt_count().await, 3);
    assert!(result.answer.contains("3 step(s)"));
}

#[tokio::test]
async fn test_action_failure_is_fed_back_not_fatal() {
    let backend = MockBackend::queued(vec![
        continue_with_read(),
        reasoning_response(
            r#"{"decision": "complete", "goal_status": "gave up on the file, answered from memory"}"#,
        ),
    ]);
    let agent = agent_loop(backend.clone(), files_registry(true).await, 20);

    let result = agent
        .run("read /tmp/x", &CancellationToken::new(), None)
        .await
        .unwrap();

    assert!(result.completed);
    assert_eq!(result.history.len(), 1);
    assert!(!result.history[0].success);
    assert!(result.history[0].result.contains("disk on fire"));

    // The second reasoning call saw the failed observation
    let prompts = backend.prompts.lock().await;
    assert!(prompts[1].contains("FAILED"));
    assert!(prompts[1].contains("disk on fire"));
}

#[tokio::test]
async fn test_reasoning_failure_is_loop_fatal() {
    let backend = MockBackend::failing();
    let agent = agent_loop(backend, files_registry(false).await, 20);

    let err = agent
        .run("goal", &CancellationToken::new(), None)
        .await
        .unwrap_err();

    match err {
        Error::Transport { phase, .. } => assert_eq!(phase, "agent reasoning"),
        other => panic!("Expected Transport error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unparseable_reasoning_is_loop_fatal() {
    let backend = MockBackend::queued(vec![reasoning_response("sorry, I ramble in prose")]);
    let agent = agent_loop(backend, files_registry(false).await, 20);

    let err = agent
        .run("goal", &CancellationToken::new(), None)
        .await
        .unwrap_err();

    match err {
        Error::Transport { message, .. } => assert!(message.contains("unparseable")),
        other => panic!("Expected Transport error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pre_cancelled_token_runs_nothing_and_emits_nothing() {
    let backend = MockBackend::repeating(continue_with_read());
    let agent = agent_loop(backend.clone(), files_registry(false).await, 20);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (tx, rx) = mpsc::channel(64);
    let err = agent.run("goal", &cancel, Some(tx)).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(backend.prompt_count().await, 0);
    assert!(drain(rx).await.is_empty());
}

#[tokio::test]
async fn test_event_sequence_for_one_action_then_complete() {
    let backend = MockBackend::queued(vec![
        continue_with_read(),
        reasoning_response(r#"{"decision": "complete", "goal_status": "done"}"#),
    ]);
    let agent = agent_loop(backend, files_registry(false).await, 20);

    let (tx, rx) = mpsc::channel(64);
    let result = agent
        .run("goal", &CancellationToken::new(), Some(tx))
        .await
        .unwrap();
    assert!(result.completed);

    let events = drain(rx).await;
    assert_eq!(events.len(), 6);
    assert!(matches!(events[0], AgentEvent::StepStart { step: 1 }));
    assert!(matches!(
        events[1],
        AgentEvent::ReasoningComplete {
            step: 1,
            decision: AgentDecision::Continue,
            ..
        }
    ));
    match &events[2] {
        AgentEvent::ActionStart { step, server, tool } => {
            assert_eq!(*step, 1);
            assert_eq!(server, "files");
            assert_eq!(tool, "read_file");
        }
        other => panic!("Expected ActionStart, got {:?}", other),
    }
    assert!(matches!(
        events[3],
        AgentEvent::ActionComplete {
            step: 1,
            success: true
        }
    ));
    assert!(matches!(events[4], AgentEvent::StepStart { step: 2 }));
    assert!(matches!(
        events[5],
        AgentEvent::ReasoningComplete {
            step: 2,
            decision: AgentDecision::Complete,
            ..
        }
    ));
}

#[tokio::test]
async fn test_continue_without_action_is_recorded_and_loop_goes_on() {
    let backend = MockBackend::queued(vec![
        reasoning_response(r#"{"decision": "continue", "reasoning": "hmm", "goal_status": "thinking"}"#),
        reasoning_response(r#"{"decision": "complete", "goal_status": "figured it out"}"#),
    ]);
    let agent = agent_loop(backend.clone(), files_registry(false).await, 20);

    let result = agent
        .run("goal", &CancellationToken::new(), None)
        .await
        .unwrap();

    assert!(result.completed);
    assert_eq!(result.history.len(), 1);
    assert!(!result.history[0].success);
    assert_eq!(backend.prompt_count().await, 2);
}

#[tokio::test]
async fn test_availability_tracks_registry_state() {
    let registry = files_registry(false).await;
    let backend = MockBackend::queued(vec![]);
    let agent = agent_loop(backend, registry.clone(), 20);

    assert!(agent.available().await);
    registry.cleanup().await;
    assert!(!agent.available().await);
}
