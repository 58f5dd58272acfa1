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

pub(crate) struct CohereProvider {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl CohereProvider {
    pub(crate) fn new(base_url: &str, api_key: String, model: String, client: Client) -> Self {
        Self {
            base_url: normalize_base(base_url),
            api_key,
            model,
            client,
        }
    }
}

#[async_trait]
impl ChatProvider for CohereProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cohere
    }

    async fn complete_with_tools(&self, request: &ChatRequest) -> anyhow::Result<Completion> {
        let body = build_body(&self.model, request, true, false);
        let req = self
            .client
            .post(format!("{}/chat", self.base_url))
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
        let body = build_body(&self.model, request, false, true);
        let req = self
            .client
            .post(format!("{}/chat", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body);
        let response = open_stream(self.kind(), req).await?;
        Ok(text_stream(response, cancel, extract_delta))
    }
}

fn build_body(model: &str, request: &ChatRequest, offer_tools: bool, stream: bool) -> Value {
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
                    "function": {"name": call.name, "arguments": call.arguments.to_string()},
                })
            })
            .collect::<Vec<_>>();
        let mut assistant = json!({"role": "assistant", "tool_calls": tool_calls});
        if let Some(plan) = round.assistant_text.as_deref().filter(|t| !t.is_empty()) {
            assistant["tool_plan"] = json!(plan);
        }
        messages.push(assistant);
        for result in &round.results {
            messages.push(json!({
                "role": "tool",
                "tool_call_id": result.call_id,
                "content": [{
                    "type": "document",
                    "document": {"data": tool_result_payload(result)},
                }],
            }));
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
    }
    body
}

fn parse_completion(value: &Value) -> anyhow::Result<Completion> {
    let Some(message) = value.get("message") else {
        anyhow::bail!(
            "provider returned no message (response: {})",
            truncate_for_error(&value.to_string(), 500)
        );
    };
    let text = message
        .get("content")
        .and_then(|v| v.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default();
    let plan = message
        .get("tool_plan")
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
                    Some(ToolCall {
                        id: call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("call_{index}")),
                        name: name.to_string(),
                        arguments: function
                            .get("arguments")
                            .and_then(|v| v.as_str())
                            .map(parse_arguments)
                            .unwrap_or_else(|| json!({})),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if calls.is_empty() {
        Ok(Completion::Text(text))
    } else {
        let text = plan.or((!text.is_empty()).then_some(text));
        Ok(Completion::ToolCalls { text, calls })
    }
}

fn extract_delta(value: &Value) -> anyhow::Result<Option<String>> {
    match value.get("type").and_then(|v| v.as_str()) {
        Some("content-delta") => Ok(value
            .pointer("/delta/message/content/text")
            .and_then(|v| v.as_str())
            .map(str::to_string)),
        _ if value.get("message").is_some() && value.get("type").is_none() => {
            let detail = extract_error(value).unwrap_or_else(|| "stream error".to_string());
            anyhow::bail!(detail)
        }
        _ => Ok(None),
    }
}
