use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;

use flyboard_core::{clamp_tail, log_stream, LogStreamRequest, ProviderOverrides, SettingsPatch};
use flyboard_observability::{emit_event, redact_text, ObservabilityEvent};
use flyboard_providers::ChatMessage;
use flyboard_runtime::CallOptions;
use flyboard_types::ProviderKind;
use flyboard_wire::{ChatFrame, ToolExecResponse};

use crate::AppState;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(10);

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "flyboard server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/execute", post(execute_tool))
        .route("/api/logs/stream", get(stream_logs))
        .route("/api/chat", post(chat))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/providers", get(list_providers))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    error: String,
    details: String,
}

impl ApiError {
    fn bad_request(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
            details: details.into(),
        }
    }

    fn internal(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: error.into(),
            details: details.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request("Invalid request body", rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request("Invalid query parameters", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.error, "details": self.details })),
        )
            .into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let mcp = state.tools.connection_state();
    Json(json!({
        "ok": true,
        "mcp": mcp,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn list_tools(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let tools = state.tools.list_tools().await.map_err(|err| {
        tracing::error!(error = %err, "listing tools failed");
        ApiError::internal("Failed to list tools", err.to_string())
    })?;
    Ok(Json(json!(tools)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolExecutionInput {
    tool_name: String,
    #[serde(default)]
    args: Option<Value>,
}

async fn execute_tool(
    State(state): State<AppState>,
    input: Result<Json<ToolExecutionInput>, JsonRejection>,
) -> Response {
    let Json(input) = match input {
        Ok(input) => input,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };
    let name = input.tool_name.trim();
    if name.is_empty() {
        return ApiError::bad_request("Missing tool name", "`toolName` is required").into_response();
    }
    let args = input.args.unwrap_or_else(|| json!({}));
    match state.tools.call_tool(name, args, CallOptions::default()).await {
        Ok(output) => Json(ToolExecResponse::success(output.into_value())).into_response(),
        Err(err) => {
            tracing::error!(tool = name, code = err.code(), error = %err, "tool execution failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ToolExecResponse::failure(
                    format!("Failed to execute {name}"),
                    err.to_string(),
                )),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    app: Option<String>,
    region: Option<String>,
    machine: Option<String>,
    lines: Option<usize>,
}

async fn stream_logs(
    State(state): State<AppState>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };
    let Some(app) = query.app.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()) else {
        return ApiError::bad_request("Missing app", "`app` query parameter is required")
            .into_response();
    };
    let request = LogStreamRequest {
        app,
        region: query.region,
        machine: query.machine,
        lines: clamp_tail(query.lines.or(Some(state.default_log_lines))),
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let frames = log_stream(state.tools.clone(), state.log_stream.clone(), request, cancel);
    let events = frames.map(move |frame| {
        let _disconnect = &guard;
        let payload = serde_json::to_string(&frame).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().data(payload))
    });
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatInput {
    #[serde(default)]
    messages: Vec<ChatMessage>,
    provider: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
}

async fn chat(
    State(state): State<AppState>,
    input: Result<Json<ChatInput>, JsonRejection>,
) -> Response {
    let Json(input) = match input {
        Ok(input) => input,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };
    if input.messages.is_empty() {
        return ApiError::bad_request("Missing messages", "`messages` must not be empty")
            .into_response();
    }
    let overrides = ProviderOverrides {
        provider: input.provider,
        api_key: input.api_key,
        model: input.model,
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let resolved = state
        .settings
        .resolve_provider(overrides)
        .await
        .and_then(|(kind, config)| {
            tracing::debug!(
                provider = kind.as_str(),
                api_key = %redact_text(config.api_key.as_deref().unwrap_or_default()),
                "resolved chat provider"
            );
            (state.providers)(kind, config)
        });
    let frames: BoxStream<'static, ChatFrame> = match resolved {
        Ok(provider) => state.chat.run(provider, input.messages, cancel).boxed(),
        Err(err) => {
            let detail = err.to_string();
            emit_event(
                Level::WARN,
                ObservabilityEvent {
                    event: "chat.failed",
                    component: "http.chat",
                    status: Some("provider_setup"),
                    detail: Some(detail.as_str()),
                    ..Default::default()
                },
            );
            stream::once(async move { ChatFrame::Error(detail) }).boxed()
        }
    };
    let events = frames.map(move |frame| {
        let _disconnect = &guard;
        Ok::<_, Infallible>(Event::default().data(frame.to_data()))
    });
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
        .into_response()
}

async fn get_settings(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.settings.view().await))
}

async fn put_settings(
    State(state): State<AppState>,
    patch: Result<Json<SettingsPatch>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(patch) = patch?;
    let view = state
        .settings
        .update(patch)
        .await
        .map_err(|err| ApiError::bad_request("Failed to save settings", err.to_string()))?;
    Ok(Json(json!(view)))
}

async fn list_providers() -> Json<Value> {
    let providers = ProviderKind::ALL
        .iter()
        .map(|kind| kind.info())
        .collect::<Vec<_>>();
    Json(json!(providers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use flyboard_core::{ChatConfig, LogStreamConfig, SettingsStore};
    use flyboard_providers::{ChatProvider, ChatRequest, Completion, ProviderConfig, TokenStream};
    use flyboard_runtime::{McpError, ProgressNotification, ToolInvoker, ToolOutput};
    use flyboard_types::ToolDescriptor;
    use tower::ServiceExt;

    struct FakeTools;

    #[async_trait]
    impl ToolInvoker for FakeTools {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
            Ok(vec![ToolDescriptor::new(
                "fly-status",
                "Show app status",
                json!({
                    "type": "object",
                    "properties": {"app": {"type": "string", "description": "App name"}},
                    "required": ["app"]
                }),
            )])
        }

        async fn call_tool(
            &self,
            name: &str,
            args: Value,
            options: CallOptions,
        ) -> Result<ToolOutput, McpError> {
            match name {
                "fly-status" => Ok(ToolOutput::Structured(json!({
                    "app": args["app"],
                    "status": "deployed",
                }))),
                "fly-logs" => {
                    if let Some(binding) = options.progress {
                        let params = json!({
                            "progressToken": binding.token.as_str(),
                            "message": "\u{1b}[32mtailing\u{1b}[0m web",
                        });
                        let notification =
                            ProgressNotification::from_params(&params).expect("notification");
                        let _ = binding.sink.send(notification);
                    }
                    Ok(ToolOutput::Raw("first line\nsecond line\nthird line".to_string()))
                }
                other => Err(McpError::ToolFailed {
                    tool: other.to_string(),
                    detail: "unknown tool".to_string(),
                }),
            }
        }
    }

    struct EchoProvider;

    #[async_trait]
    impl ChatProvider for EchoProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        async fn complete_with_tools(&self, request: &ChatRequest) -> anyhow::Result<Completion> {
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(Completion::Text(format!("echo {last}")))
        }

        async fn complete_streaming(
            &self,
            _request: &ChatRequest,
            _cancel: CancellationToken,
        ) -> anyhow::Result<TokenStream> {
            Ok(Box::pin(stream::empty()))
        }
    }

    async fn test_state(dir: &std::path::Path) -> AppState {
        let settings = SettingsStore::load(dir).await;
        let chat = ChatConfig {
            word_delay: Duration::ZERO,
            ..ChatConfig::default()
        };
        AppState::new(
            Arc::new(FakeTools),
            settings,
            chat,
            LogStreamConfig::default(),
            2,
        )
        .with_provider_factory(Arc::new(
            |_: ProviderKind, _: ProviderConfig| -> anyhow::Result<Arc<dyn ChatProvider>> {
                Ok(Arc::new(EchoProvider))
            },
        ))
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, String) {
        let resp = app.oneshot(req).await.expect("response");
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        (status, String::from_utf8_lossy(&body).to_string())
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn sse_payloads(body: &str) -> Vec<String> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
            .map(|line| line.to_string())
            .collect()
    }

    #[tokio::test]
    async fn malformed_requests_get_json_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app_router(test_state(dir.path()).await);

        let req = Request::builder()
            .method("POST")
            .uri("/api/tools/execute")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .expect("request");
        let (status, body) = send(app.clone(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let payload: Value = serde_json::from_str(&body).expect("json body");
        assert_eq!(payload["error"], "Invalid request body");
        assert!(payload["details"].as_str().is_some_and(|d| !d.is_empty()));

        let req = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .body(Body::from(r#"{"messages":[]}"#))
            .expect("request");
        let (status, body) = send(app.clone(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let payload: Value = serde_json::from_str(&body).expect("json body");
        assert_eq!(payload["error"], "Invalid request body");

        let req = Request::builder()
            .uri("/api/logs/stream?app=web&lines=abc")
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let payload: Value = serde_json::from_str(&body).expect("json body");
        assert_eq!(payload["error"], "Invalid query parameters");
    }

    #[tokio::test]
    async fn health_reports_connection_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app_router(test_state(dir.path()).await);
        let req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        let payload: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(payload["ok"], json!(true));
        assert_eq!(payload["mcp"], json!("connected"));
    }

    #[tokio::test]
    async fn tools_route_returns_flattened_parameters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app_router(test_state(dir.path()).await);
        let req = Request::builder()
            .uri("/api/tools")
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        let payload: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(payload[0]["name"], json!("fly-status"));
        assert_eq!(payload[0]["parameters"][0]["name"], json!("app"));
        assert_eq!(payload[0]["parameters"][0]["required"], json!(true));
    }

    #[tokio::test]
    async fn execute_route_wraps_success_and_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path()).await;

        let (status, body) = send(
            app_router(state.clone()),
            json_request(
                "POST",
                "/api/tools/execute",
                json!({"toolName": "fly-status", "args": {"app": "web"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let payload: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(payload["success"], json!(true));
        assert_eq!(payload["result"]["status"], json!("deployed"));

        let (status, body) = send(
            app_router(state.clone()),
            json_request("POST", "/api/tools/execute", json!({"toolName": "fly-nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let payload: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(payload["error"], json!("Failed to execute fly-nope"));
        assert!(payload["details"].as_str().expect("details").contains("unknown tool"));

        let (status, _) = send(
            app_router(state),
            json_request("POST", "/api/tools/execute", json!({"toolName": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn log_stream_emits_connected_progress_and_complete_frames() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app_router(test_state(dir.path()).await);
        let req = Request::builder()
            .uri("/api/logs/stream?app=web&region=iad")
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);

        let frames = sse_payloads(&body)
            .iter()
            .map(|payload| serde_json::from_str::<Value>(payload).expect("frame json"))
            .collect::<Vec<_>>();
        let kinds = frames
            .iter()
            .map(|f| f["type"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["connected", "progress", "complete"]);
        assert_eq!(frames[0]["attempt"], json!(1));
        let logs = frames[2]["logs"].as_array().expect("logs");
        assert_eq!(logs.len(), 3);
        assert!(logs[0]["html"]
            .as_str()
            .expect("html")
            .contains(r#"<span style="color:#0dbc79">tailing</span>"#));
        assert_eq!(logs[2]["message"], json!("third line"));
    }

    #[tokio::test]
    async fn log_stream_requires_app() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app_router(test_state(dir.path()).await);
        let req = Request::builder()
            .uri("/api/logs/stream")
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Missing app"));
    }

    #[tokio::test]
    async fn chat_streams_content_then_done() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app_router(test_state(dir.path()).await);
        let (status, body) = send(
            app,
            json_request(
                "POST",
                "/api/chat",
                json!({"messages": [{"role": "user", "content": "hello there"}]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let payloads = sse_payloads(&body);
        assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
        let text = payloads[..payloads.len() - 1]
            .iter()
            .map(|p| {
                serde_json::from_str::<Value>(p).expect("json")["content"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string()
            })
            .collect::<String>();
        assert_eq!(text, "echo hello there");
    }

    #[tokio::test]
    async fn chat_setup_failure_is_a_single_error_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path()).await.with_provider_factory(Arc::new(
            |kind: ProviderKind, _: ProviderConfig| -> anyhow::Result<Arc<dyn ChatProvider>> {
                anyhow::bail!("no API key configured for `{kind}`")
            },
        ));
        let (status, body) = send(
            app_router(state),
            json_request(
                "POST",
                "/api/chat",
                json!({"messages": [{"role": "user", "content": "hi"}], "provider": "cohere"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let payloads = sse_payloads(&body);
        assert_eq!(payloads.len(), 1);
        let frame: Value = serde_json::from_str(&payloads[0]).expect("json");
        assert_eq!(frame["error"], json!("no API key configured for `cohere`"));
    }

    #[tokio::test]
    async fn settings_round_trip_hides_api_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path()).await;
        let (status, body) = send(
            app_router(state.clone()),
            json_request(
                "PUT",
                "/api/settings",
                json!({"provider": "mistral", "apiKey": "secret-key"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.contains("secret-key"));

        let req = Request::builder()
            .uri("/api/settings")
            .body(Body::empty())
            .expect("request");
        let (_, body) = send(app_router(state.clone()), req).await;
        let payload: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(payload["provider"], json!("mistral"));
        assert_eq!(payload["hasApiKey"], json!(true));

        let (status, _) = send(
            app_router(state),
            json_request("PUT", "/api/settings", json!({"provider": "watson"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn providers_route_lists_all_five() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app_router(test_state(dir.path()).await);
        let req = Request::builder()
            .uri("/api/providers")
            .body(Body::empty())
            .expect("request");
        let (_, body) = send(app, req).await;
        let payload: Value = serde_json::from_str(&body).expect("json");
        let ids = payload
            .as_array()
            .expect("array")
            .iter()
            .map(|p| p["id"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["openai", "anthropic", "gemini", "mistral", "cohere"]);
    }
}
