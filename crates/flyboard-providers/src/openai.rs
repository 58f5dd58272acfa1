use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use flyboard_types::ProviderKind;

use crate::sse::{text_stream, TokenStream};
use crate::{
    extract_error, flatten_tool_message, normalize_base, open_stream, parse_arguments, send_json,
    tool_result_payload, truncate_for_error, ChatProvider, ChatRequest, Completion, ToolCall,
};

/// Mistral speaks the OpenAI chat-completions shape with a few differences in
/// how tool results are labelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    OpenAi,
    Mistral,
}

pub(crate) struct OpenAiProvider {
    dialect: Dialect,
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl OpenAiProvider {
    pub(crate) fn new(
        dialect: Dialect,
        base_url: &str,
        api_key: String,
        model: String,
        client: Client,
    ) -> Self {
        Self {
            dialect,
            base_url: normalize_base(base_url),
            api_key,
            model,
            client,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        match self.dialect {
            Dialect::OpenAi => ProviderKind::OpenAi,
            Dialect::Mistral => ProviderKind::Mistral,
        }
    }

    async fn complete_with_tools(&self, request: &ChatRequest) -> anyhow::Result<Completion> {
        let body = build_body(self.dialect, &self.model, request, true, false);
        let req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);
        let value = send_json(self.kind(), req).await?;
        parse_completion(&value)
    }

    async fn complete_streaming(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<TokenStream> {
        let body = build_body(self.dialect, &self.model, request, false, true);
        let req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);
        let response = open_stream(self.kind(), req).await?;
        Ok(text_stream(response, cancel, extract_delta))
    }
}

fn build_body(
    dialect: Dialect,
    model: &str,
    request: &ChatRequest,
    offer_tools: bool,
    stream: bool,
) -> Value {
    let mut messages = vec![json!({"role": "system", "content": request.system_prompt})];
    messages.extend(
        request
            .messages
            .iter()
            .map(flatten_tool_message)
            .map(|m| json!({"role": m.role, "content": m.content})),
    );

    if let Some(round) = &request.tool_round {
        let tool_calls = round
            .calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    }
                })
            })
            .collect::<Vec<_>>();
        messages.push(json!({
            "role": "assistant",
            "content": round.assistant_text.clone().unwrap_or_default(),
            "tool_calls": tool_calls,
        }));
        for result in &round.results {
            let mut message = json!({
                "role": "tool",
                "tool_call_id": result.call_id,
                "content": tool_result_payload(result),
            });
            if dialect == Dialect::Mistral {
                message["name"] = json!(result.name);
            }
            messages.push(message);
        }
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": stream,
    });
    if offer_tools && !request.tools.is_empty() {
        let tools = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect::<Vec<_>>();
        body["tools"] = Value::Array(tools);
        body["tool_choice"] = json!("auto");
    }
    body
}

fn parse_completion(value: &Value) -> anyhow::Result<Completion> {
    let Some(message) = value.pointer("/choices/0/message") else {
        anyhow::bail!(
            "provider returned no choices (response: {})",
            truncate_for_error(&value.to_string(), 500)
        );
    };
    let text = message
        .get("content")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(index, call)| {
                    let function = call.get("function")?;
                    let name = function.get("name").and_then(|v| v.as_str())?;
                    let id = call
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{index}"));
                    let arguments = match function.get("arguments") {
                        Some(Value::String(raw)) => parse_arguments(raw),
                        Some(other @ Value::Object(_)) => other.clone(),
                        _ => json!({}),
                    };
                    Some(ToolCall {
                        id,
                        name: name.to_string(),
                        arguments,
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if calls.is_empty() {
        Ok(Completion::Text(text.unwrap_or_default()))
    } else {
        Ok(Completion::ToolCalls { text, calls })
    }
}

fn extract_delta(value: &Value) -> anyhow::Result<Option<String>> {
    if value.get("error").is_some() {
        if let Some(detail) = extract_error(value) {
            anyhow::bail!(detail);
        }
    }
    Ok(value
        .pointer("/choices/0/delta/content")
        .and_then(|v| v.as_str())
        .map(str::to_string))
}
