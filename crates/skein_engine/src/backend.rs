//! Backend HTTP client. Every call goes through the retry/cancel transport
//! and authenticates with the `X-API-Key` header.

use crate::api_types::{
    LatestCidResponse, LlmRequest, LlmResponse, ModelsResponse, PatternsResponse,
    TranscriptRequest, TranscriptResponse,
};
use crate::retry::{call_with_retry, is_retryable_status, AttemptError, RetryOptions};
use anyhow::Result;
use serde::de::DeserializeOwned;
use skein_core::config::{BackendConfig, RetrySettings};
use skein_core::error::{phase, Error};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[async_trait::async_trait]
pub trait BackendClient: Send + Sync {
    /// One `POST /llm` round trip. The phase tag names the caller's intent
    /// ("chat request", "tool result processing", "agent reasoning") so
    /// failures report uniformly.
    async fn complete(
        &self,
        request: &LlmRequest,
        phase: &'static str,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, Error>;

    async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<String>, Error>;

    async fn list_patterns(&self, cancel: &CancellationToken) -> Result<Vec<String>, Error>;

    async fn latest_conversation_id(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, Error>;

    async fn fetch_transcript(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, Error>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryOptions,
}

impl HttpBackend {
    pub fn new(backend: &BackendConfig, retry: &RetrySettings) -> Result<Self> {
        let attempt_timeout = Duration::from_secs(backend.attempt_timeout_secs);
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(attempt_timeout)
                .build()?,
            base_url: backend.base_url.trim_end_matches('/').to_string(),
            api_key: backend.api_key.clone(),
            retry: RetryOptions::from_settings(retry, attempt_timeout),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<B, T>(
        &self,
        path: &str,
        body: &B,
        phase: &'static str,
        cancel: &CancellationToken,
    ) -> Result<T, Error>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let client = &self.client;
        let api_key = &self.api_key;

        let outcome = call_with_retry(&self.retry, phase, cancel, || async {
            let resp = client
                .post(&url)
                .header("X-API-Key", api_key)
                .json(body)
                .send()
                .await
                .map_err(|e| AttemptError::retryable(format!("network error: {}", e), None))?;
            decode_response::<T>(resp).await
        })
        .await?;
        Ok(outcome.value)
    }

    async fn get_json<T>(
        &self,
        path: &str,
        phase: &'static str,
        cancel: &CancellationToken,
    ) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let client = &self.client;
        let api_key = &self.api_key;

        let outcome = call_with_retry(&self.retry, phase, cancel, || async {
            let resp = client
                .get(&url)
                .header("X-API-Key", api_key)
                .send()
                .await
                .map_err(|e| AttemptError::retryable(format!("network error: {}", e), None))?;
            decode_response::<T>(resp).await
        })
        .await?;
        Ok(outcome.value)
    }
}

#[async_trait::async_trait]
impl BackendClient for HttpBackend {
    #[tracing::instrument(skip(self, request, cancel), fields(model = %request.model))]
    async fn complete(
        &self,
        request: &LlmRequest,
        phase: &'static str,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, Error> {
        tracing::debug!(
            "LLM request: {} tool(s) attached, json_mode={}",
            request.tools.len(),
            request.json_mode
        );
        self.post_json("/llm", request, phase, cancel).await
    }

    async fn list_models(&self, cancel: &CancellationToken) -> Result<Vec<String>, Error> {
        let resp: ModelsResponse = self
            .get_json("/models", phase::MODEL_LISTING, cancel)
            .await?;
        Ok(resp.models)
    }

    async fn list_patterns(&self, cancel: &CancellationToken) -> Result<Vec<String>, Error> {
        let resp: PatternsResponse = self
            .get_json("/patterns", phase::PATTERN_LISTING, cancel)
            .await?;
        Ok(resp.patterns)
    }

    async fn latest_conversation_id(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, Error> {
        let resp: LatestCidResponse = self
            .get_json("/latest_cid", phase::CONVERSATION_LOOKUP, cancel)
            .await?;
        Ok(resp.conversation_id)
    }

    async fn fetch_transcript(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        let body = TranscriptRequest {
            url: url.to_string(),
        };
        let resp: TranscriptResponse = self
            .post_json("/yt", &body, phase::TRANSCRIPT_FETCH, cancel)
            .await?;
        Ok(resp.transcript)
    }
}

/// Classify a response: 2xx decodes, retryable statuses re-attempt, anything
/// else fails immediately with the (truncated) body as context.
async fn decode_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, AttemptError> {
    let status = resp.status();
    if status.is_success() {
        return resp.json::<T>().await.map_err(|e| {
            AttemptError::fatal(
                format!("failed to decode response: {}", e),
                Some(status.as_u16()),
            )
        });
    }

    let code = status.as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = format!(
        "HTTP {}: {}",
        code,
        body.chars().take(200).collect::<String>()
    );
    if is_retryable_status(code) {
        Err(AttemptError::retryable(message, Some(code)))
    } else {
        Err(AttemptError::fatal(message, Some(code)))
    }
}
