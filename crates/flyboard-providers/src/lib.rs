use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use flyboard_types::{ProviderKind, ToolDescriptor};

mod anthropic;
mod cohere;
mod gemini;
mod openai;
mod sse;

pub use sse::TokenStream;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

/// The single tool exchange appended to history before the follow-up pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRound {
    pub assistant_text: Option<String>,
    pub calls: Vec<ToolCall>,
    pub results: Vec<ToolCallResult>,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDescriptor>,
    pub tool_round: Option<ToolRound>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Text(String),
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCall>,
    },
}

/// One vendor chat API behind a uniform two-call surface.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Non-streaming completion with the tool catalog offered.
    async fn complete_with_tools(&self, request: &ChatRequest) -> anyhow::Result<Completion>;

    /// Streaming completion with no tools offered.
    async fn complete_streaming(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<TokenStream>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub url: Option<String>,
}

pub fn build_provider(
    kind: ProviderKind,
    config: ProviderConfig,
) -> anyhow::Result<Arc<dyn ChatProvider>> {
    build_provider_with_env(kind, config, |name| std::env::var(name).ok())
}

fn build_provider_with_env(
    kind: ProviderKind,
    config: ProviderConfig,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Arc<dyn ChatProvider>> {
    let api_key = config
        .api_key
        .as_deref()
        .filter(|key| !is_placeholder_api_key(key))
        .map(|key| key.trim().to_string())
        .or_else(|| env(kind.api_key_env()).filter(|v| !is_placeholder_api_key(v)));
    let Some(api_key) = api_key else {
        anyhow::bail!(
            "no API key configured for `{}`. Set `{}` or configure the key in Settings.",
            kind,
            kind.api_key_env()
        );
    };
    let model = config
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(kind.default_model())
        .to_string();
    let url = config.url.as_deref().map(str::trim).filter(|u| !u.is_empty());
    let client = Client::new();

    let provider: Arc<dyn ChatProvider> = match kind {
        ProviderKind::OpenAi => Arc::new(openai::OpenAiProvider::new(
            openai::Dialect::OpenAi,
            url.unwrap_or("https://api.openai.com/v1"),
            api_key,
            model,
            client,
        )),
        ProviderKind::Mistral => Arc::new(openai::OpenAiProvider::new(
            openai::Dialect::Mistral,
            url.unwrap_or("https://api.mistral.ai/v1"),
            api_key,
            model,
            client,
        )),
        ProviderKind::Anthropic => Arc::new(anthropic::AnthropicProvider::new(
            url.unwrap_or("https://api.anthropic.com/v1"),
            api_key,
            model,
            client,
        )),
        ProviderKind::Gemini => Arc::new(gemini::GeminiProvider::new(
            url.unwrap_or("https://generativelanguage.googleapis.com/v1beta"),
            api_key,
            model,
            client,
        )),
        ProviderKind::Cohere => Arc::new(cohere::CohereProvider::new(
            url.unwrap_or("https://api.cohere.com/v2"),
            api_key,
            model,
            client,
        )),
    };
    Ok(provider)
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

/// Client-supplied tool messages have no call to attach to; they are replayed
/// as plain user text.
pub(crate) fn flatten_tool_message(message: &ChatMessage) -> ChatMessage {
    match message.role {
        ChatRole::Tool => ChatMessage::user(format!("Tool output:\n{}", message.content)),
        _ => message.clone(),
    }
}

/// Tool results are sent as JSON text; error results are wrapped so the model
/// can tell them apart.
pub(crate) fn tool_result_payload(result: &ToolCallResult) -> String {
    if result.is_error {
        serde_json::json!({ "error": result.content }).to_string()
    } else {
        result.content.clone()
    }
}

pub(crate) fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "tool call arguments are not valid JSON; using empty object");
        Value::Object(Default::default())
    })
}

pub(crate) fn normalize_base(input: &str) -> String {
    input.trim_end_matches('/').to_string()
}

pub(crate) fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

pub(crate) fn extract_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message").or(Some(v)))
        .and_then(|v| v.as_str())
        .or_else(|| value.get("message").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}

pub(crate) async fn send_json(kind: ProviderKind, request: RequestBuilder) -> anyhow::Result<Value> {
    let response = request.send().await?;
    let status = response.status();
    let text = response.text().await?;
    let value = serde_json::from_str::<Value>(&text).unwrap_or(Value::Null);
    if !status.is_success() {
        let detail = extract_error(&value).unwrap_or_else(|| truncate_for_error(&text, 500));
        anyhow::bail!(
            "{} request failed with status {}: {}",
            kind.display_name(),
            status,
            truncate_for_error(&detail, 500)
        );
    }
    if value.is_null() {
        anyhow::bail!(
            "{} returned a non-JSON response: {}",
            kind.display_name(),
            truncate_for_error(&text, 500)
        );
    }
    Ok(value)
}

pub(crate) async fn open_stream(
    kind: ProviderKind,
    request: RequestBuilder,
) -> anyhow::Result<reqwest::Response> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| extract_error(&v))
            .unwrap_or(text);
        anyhow::bail!(
            "{} stream request failed with status {}: {}",
            kind.display_name(),
            status,
            truncate_for_error(&detail, 500)
        );
    }
    Ok(response)
}
