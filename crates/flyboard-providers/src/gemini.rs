use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use flyboard_types::ProviderKind;

use crate::sse::{text_stream, TokenStream};
use crate::{
    extract_error, flatten_tool_message, normalize_base, open_stream, send_json,
    truncate_for_error, ChatProvider, ChatRequest, ChatRole, Completion, ToolCall,
};

pub(crate) struct GeminiProvider {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl GeminiProvider {
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
impl ChatProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn complete_with_tools(&self, request: &ChatRequest) -> anyhow::Result<Completion> {
        let body = build_body(request, true);
        let req = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.base_url, self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&body);
        let value = send_json(self.kind(), req).await?;
        parse_completion(&value)
    }

    async fn complete_streaming(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<TokenStream> {
        let body = build_body(request, false);
        let req = self
            .client
            .post(format!(
                "{}/models/{}:streamGenerateContent",
                self.base_url, self.model
            ))
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", &self.api_key)
            .json(&body);
        let response = open_stream(self.kind(), req).await?;
        Ok(text_stream(response, cancel, extract_delta))
    }
}

fn build_body(request: &ChatRequest, offer_tools: bool) -> Value {
    let mut contents = request
        .messages
        .iter()
        .map(flatten_tool_message)
        .map(|m| {
            let role = match m.role {
                ChatRole::Assistant => "model",
                _ => "user",
            };
            json!({"role": role, "parts": [{"text": m.content}]})
        })
        .collect::<Vec<_>>();

    if let Some(round) = &request.tool_round {
        let mut parts = Vec::new();
        if let Some(text) = round.assistant_text.as_deref().filter(|t| !t.is_empty()) {
            parts.push(json!({"text": text}));
        }
        parts.extend(round.calls.iter().map(|call| {
            json!({"functionCall": {"name": call.name, "args": call.arguments}})
        }));
        contents.push(json!({"role": "model", "parts": parts}));

        let responses = round
            .results
            .iter()
            .map(|result| {
                let payload = serde_json::from_str::<Value>(&result.content)
                    .unwrap_or_else(|_| Value::String(result.content.clone()));
                let response = if result.is_error {
                    json!({"error": payload})
                } else {
                    json!({"result": payload})
                };
                json!({"functionResponse": {"name": result.name, "response": response}})
            })
            .collect::<Vec<_>>();
        contents.push(json!({"role": "user", "parts": responses}));
    }

    let mut body = json!({
        "systemInstruction": {"parts": [{"text": request.system_prompt}]},
        "contents": contents,
    });
    if offer_tools && !request.tools.is_empty() {
        let declarations = request
            .tools
            .iter()
            .map(|tool| {
                let mut declaration = json!({
                    "name": tool.name,
                    "description": tool.description,
                });
                if let Some(parameters) = sanitize_schema(&tool.input_schema) {
                    declaration["parameters"] = parameters;
                }
                declaration
            })
            .collect::<Vec<_>>();
        body["tools"] = json!([{"functionDeclarations": declarations}]);
    }
    body
}

/// Gemini rejects JSON-schema keywords outside its OpenAPI subset and object
/// schemas without properties.
fn sanitize_schema(schema: &Value) -> Option<Value> {
    let cleaned = strip_unsupported(schema);
    let empty = cleaned
        .get("properties")
        .and_then(|v| v.as_object())
        .map(|props| props.is_empty())
        .unwrap_or(true);
    if cleaned.get("type").and_then(|v| v.as_str()) == Some("object") && empty {
        return None;
    }
    Some(cleaned)
}

fn strip_unsupported(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, inner) in map {
                if matches!(key.as_str(), "$schema" | "additionalProperties" | "$id") {
                    continue;
                }
                out.insert(key.clone(), strip_unsupported(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_unsupported).collect()),
        other => other.clone(),
    }
}

fn parse_completion(value: &Value) -> anyhow::Result<Completion> {
    let Some(parts) = value
        .pointer("/candidates/0/content/parts")
        .and_then(|v| v.as_array())
    else {
        if let Some(reason) = value.pointer("/promptFeedback/blockReason").and_then(|v| v.as_str()) {
            anyhow::bail!("prompt was blocked by Gemini: {reason}");
        }
        anyhow::bail!(
            "provider returned no candidates (response: {})",
            truncate_for_error(&value.to_string(), 500)
        );
    };
    let mut text = String::new();
    let mut calls = Vec::new();
    for part in parts {
        if let Some(fragment) = part.get("text").and_then(|v| v.as_str()) {
            text.push_str(fragment);
        }
        if let Some(call) = part.get("functionCall") {
            let Some(name) = call.get("name").and_then(|v| v.as_str()) else {
                continue;
            };
            calls.push(ToolCall {
                id: format!("call_{}", calls.len()),
                name: name.to_string(),
                arguments: call.get("args").cloned().unwrap_or_else(|| json!({})),
            });
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
    if value.get("error").is_some() {
        let detail = extract_error(value).unwrap_or_else(|| "stream error".to_string());
        anyhow::bail!(detail);
    }
    let text = value
        .pointer("/candidates/0/content/parts")
        .and_then(|v| v.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
                .collect::<String>()
        });
    Ok(text)
}
