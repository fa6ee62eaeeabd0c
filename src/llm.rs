//! Completion client abstraction and implementations.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::error::{AgentError, Result};
use crate::message::{ContentBlock, Message};
use crate::tool::ToolDescriptor;

const ANTHROPIC_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One completion turn: ordered content blocks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelCompletion {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
}

impl ModelCompletion {
    pub fn new(content: Vec<ContentBlock>) -> Self {
        Self {
            content,
            stop_reason: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![ContentBlock::text(text)])
    }

    pub fn has_tool_use(&self) -> bool {
        self.content.iter().any(ContentBlock::is_tool_use)
    }
}

/// Minimal abstraction around a chat completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<ModelCompletion>;
}

fn coalesce_error(status: reqwest::StatusCode, body: &str, provider: &str) -> AgentError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return AgentError::CompletionService(format!("{provider} rate limit exceeded: {body}"));
    }
    AgentError::CompletionService(format!("{provider} request failed with {status}: {body}"))
}

/// Client for the Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    model: String,
    max_tokens: u32,
    api_key: String,
    endpoint: String,
}

impl AnthropicClient {
    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let api_key = cfg.api_key.clone().ok_or_else(|| {
            AgentError::Config("missing Anthropic API key; set ANTHROPIC_API_KEY".into())
        })?;
        let endpoint = cfg
            .endpoint
            .clone()
            .unwrap_or_else(|| ANTHROPIC_ENDPOINT.to_string());
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .map_err(|err| AgentError::CompletionService(format!("http client error: {err}")))?,
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            api_key,
            endpoint,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_payload(&self, messages: &[Message], tools: &[ToolDescriptor]) -> Result<Value> {
        let mut payload = Map::new();
        payload.insert("model".into(), json!(self.model));
        payload.insert("max_tokens".into(), json!(self.max_tokens));
        payload.insert("messages".into(), serde_json::to_value(messages)?);
        if !tools.is_empty() {
            payload.insert("tools".into(), serde_json::to_value(tools)?);
        }
        Ok(Value::Object(payload))
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
}

fn parse_response(response: AnthropicResponse) -> ModelCompletion {
    let content = response
        .content
        .into_iter()
        .filter_map(|block| match serde_json::from_value::<ContentBlock>(block.clone()) {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                debug!(block = %block, "skipping unsupported content block");
                None
            }
        })
        .collect();
    ModelCompletion {
        content,
        stop_reason: response.stop_reason,
    }
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescriptor],
    ) -> Result<ModelCompletion> {
        let payload = self.build_payload(messages, tools)?;

        let resp = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|err| AgentError::CompletionService(format!("Anthropic request error: {err}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, "completion request rejected");
            return Err(coalesce_error(status, &body, "anthropic"));
        }

        let parsed: AnthropicResponse = resp.json().await.map_err(|err| {
            AgentError::CompletionService(format!("Anthropic response parse error: {err}"))
        })?;
        let completion = parse_response(parsed);
        debug!(
            blocks = completion.content.len(),
            stop_reason = ?completion.stop_reason,
            "completion received"
        );
        Ok(completion)
    }
}

/// A deterministic model used for tests and demos. Replays scripted turns
/// and records every history it was shown.
pub struct StubModel {
    responses: Mutex<VecDeque<ModelCompletion>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl StubModel {
    pub fn new(responses: Vec<ModelCompletion>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Histories passed to `complete_chat`, oldest first.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn complete_chat(
        &self,
        messages: &[Message],
        _tools: &[ToolDescriptor],
    ) -> Result<ModelCompletion> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(messages.to_vec());
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .ok_or_else(|| {
                AgentError::CompletionService("StubModel ran out of scripted responses".into())
            })
    }
}
