use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use flyboard_types::ProviderKind;

use crate::sse::{text_stream, TokenStream};
use crate::{
    extract_error, flatten_tool_message, normalize_base, open_stream, send_json,
    tool_result_payload, truncate_for_error, ChatProvider, ChatRequest, ChatRole, Completion,
    ToolCall,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub(crate) struct AnthropicProvider {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl AnthropicProvider {
    pub(crate) fn new(base_url: &str, api_key: String, model: String, client: Client) -> Self {
        Self {
            base_url: normalize_base(base_url),
            api_key,
            model,
            client,
        }
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn complete_with_tools(&self, request: &ChatRequest) -> anyhow::Result<Completion> {
        let body = build_body(&self.model, request, false);
        let value = send_json(self.kind(), self.post(&body)).await?;
        parse_completion(&value)
    }

    async fn complete_streaming(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<TokenStream> {
        let body = build_body(&self.model, request, true);
        let response = open_stream(self.kind(), self.post(&body)).await?;
        Ok(text_stream(response, cancel, extract_delta))
    }
}

fn build_body(model: &str, request: &ChatRequest, stream: bool) -> Value {
    // System text travels in its own field; stray system turns are folded into user text.
    let mut messages = request
        .messages
        .iter()
        .map(flatten_tool_message)
        .map(|m| {
            let role = match m.role {
                ChatRole::Assistant => "assistant",
                _ => "user",
            };
            json!({"role": role, "content": m.content})
        })
        .collect::<Vec<_>>();

    if let Some(round) = &request.tool_round {
        let mut content = Vec::new();
        if let Some(text) = round.assistant_text.as_deref().filter(|t| !t.is_empty()) {
            content.push(json!({"type": "text", "text": text}));
        }
        content.extend(round.calls.iter().map(|call| {
            json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call.arguments,
            })
        }));
        messages.push(json!({"role": "assistant", "content": content}));

        let results = round
            .results
            .iter()
            .map(|result| {
                json!({
                    "type": "tool_result",
                    "tool_use_id": result.call_id,
                    "content": tool_result_payload(result),
                    "is_error": result.is_error,
                })
            })
            .collect::<Vec<_>>();
        messages.push(json!({"role": "user", "content": results}));
    }

    let mut body = json!({
        "model": model,
        "system": request.system_prompt,
        "messages": messages,
        "max_tokens": MAX_TOKENS,
        "stream": stream,
    });

    // A history with tool_use blocks must still declare the tools, so the
    // follow-up pass sends them with tool use switched off.
    if !request.tools.is_empty() && (!stream || request.tool_round.is_some()) {
        let tools = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect::<Vec<_>>();
        body["tools"] = Value::Array(tools);
        body["tool_choice"] = if stream {
            json!({"type": "none"})
        } else {
            json!({"type": "auto"})
        };
    }
    body
}

fn parse_completion(value: &Value) -> anyhow::Result<Completion> {
    let Some(blocks) = value.get("content").and_then(|v| v.as_array()) else {
        anyhow::bail!(
            "provider returned no content (response: {})",
            truncate_for_error(&value.to_string(), 500)
        );
    };
    let mut text = String::new();
    let mut calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(fragment) = block.get("text").and_then(|v| v.as_str()) {
                    text.push_str(fragment);
                }
            }
            Some("tool_use") => {
                let Some(name) = block.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                calls.push(ToolCall {
                    id: block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{}", calls.len())),
                    name: name.to_string(),
                    arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                });
            }
            _ => {}
        }
    }
    if calls.is_empty() {
        Ok(Completion::Text(text))
    } else {
        Ok(Completion::ToolCalls {
            text: (!text.is_empty()).then_some(text),
            calls,
        })
    }
}

fn extract_delta(value: &Value) -> anyhow::Result<Option<String>> {
    match value.get("type").and_then(|v| v.as_str()) {
        Some("content_block_delta") => Ok(value
            .pointer("/delta/text")
            .and_then(|v| v.as_str())
            .map(str::to_string)),
        Some("error") => {
            let detail = extract_error(value).unwrap_or_else(|| "stream error".to_string());
            anyhow::bail!(detail)
        }
        _ => Ok(None),
    }
}
