use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use flyboard_observability::{emit_event, ObservabilityEvent};
use flyboard_providers::{
    ChatMessage, ChatProvider, ChatRequest, Completion, ToolCall, ToolCallResult, ToolRound,
};
use flyboard_runtime::{CallOptions, ToolInvoker};
use flyboard_wire::ChatFrame;

pub const DEFAULT_WORD_DELAY: Duration = Duration::from_millis(30);

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the assistant inside flyboard, a dashboard for \
Fly.io. You can inspect and operate the user's apps, machines, volumes and logs through the \
provided tools. Call a tool whenever the answer depends on live account state, and summarize \
tool output concisely. If a tool fails, explain what went wrong and suggest a next step.";

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub system_prompt: String,
    /// Pause between word chunks when replaying a non-streamed answer.
    pub word_delay: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            word_delay: DEFAULT_WORD_DELAY,
        }
    }
}

/// Splits text into word-sized chunks whose concatenation is the input.
pub fn word_chunks(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive(char::is_whitespace)
}

/// Drives one chat turn: a tool-enabled first pass, at most one round of
/// tool execution, and a streamed follow-up.
#[derive(Clone)]
pub struct ChatOrchestrator {
    tools: Arc<dyn ToolInvoker>,
    config: ChatConfig,
}

impl ChatOrchestrator {
    pub fn new(tools: Arc<dyn ToolInvoker>, config: ChatConfig) -> Self {
        Self { tools, config }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn run(
        &self,
        provider: Arc<dyn ChatProvider>,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = ChatFrame> + Send + 'static {
        let tools = self.tools.clone();
        let config = self.config.clone();
        stream! {
            let provider_id = provider.kind().as_str();
            let catalog = match tools.list_tools().await {
                Ok(catalog) => catalog,
                Err(err) => {
                    tracing::warn!(error = %err, "tool catalog unavailable; chatting without tools");
                    Vec::new()
                }
            };
            let mut request = ChatRequest {
                system_prompt: config.system_prompt.clone(),
                messages,
                tools: catalog,
                tool_round: None,
            };

            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = provider.complete_with_tools(&request) => result,
            };
            let completion = match first {
                Ok(completion) => completion,
                Err(err) => {
                    let detail = err.to_string();
                    emit_event(
                        Level::WARN,
                        ObservabilityEvent {
                            event: "chat.failed",
                            component: "chat",
                            provider_id: Some(provider_id),
                            status: Some("first_pass"),
                            detail: Some(detail.as_str()),
                            ..Default::default()
                        },
                    );
                    yield ChatFrame::Error(detail);
                    return;
                }
            };

            match completion {
                Completion::Text(text) => {
                    for chunk in word_chunks(&text) {
                        yield ChatFrame::Content(chunk.to_string());
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(config.word_delay) => {}
                        }
                    }
                }
                Completion::ToolCalls { text, calls } => {
                    let mut results = Vec::with_capacity(calls.len());
                    for call in &calls {
                        if cancel.is_cancelled() {
                            return;
                        }
                        results.push(execute_tool_call(tools.as_ref(), provider_id, call).await);
                    }
                    request.tool_round = Some(ToolRound {
                        assistant_text: text,
                        calls,
                        results,
                    });

                    let opened = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        result = provider.complete_streaming(&request, cancel.clone()) => result,
                    };
                    let mut tokens = match opened {
                        Ok(tokens) => tokens,
                        Err(err) => {
                            let detail = err.to_string();
                            emit_event(
                                Level::WARN,
                                ObservabilityEvent {
                                    event: "chat.failed",
                                    component: "chat",
                                    provider_id: Some(provider_id),
                                    status: Some("follow_up"),
                                    detail: Some(detail.as_str()),
                                    ..Default::default()
                                },
                            );
                            yield ChatFrame::Error(detail);
                            return;
                        }
                    };
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            next = tokens.next() => next,
                        };
                        match next {
                            Some(Ok(token)) => {
                                yield ChatFrame::Content(token);
                            }
                            Some(Err(err)) => {
                                yield ChatFrame::Error(err.to_string());
                                return;
                            }
                            None => break,
                        }
                    }
                }
            }
            yield ChatFrame::Done;
        }
    }
}

/// Runs one model-requested tool call. Failures become error-flagged results
/// for the model instead of aborting the turn.
async fn execute_tool_call(
    tools: &dyn ToolInvoker,
    provider_id: &str,
    call: &ToolCall,
) -> ToolCallResult {
    let outcome = tools
        .call_tool(&call.name, call.arguments.clone(), CallOptions::default())
        .await;
    let (content, is_error, status) = match outcome {
        Ok(output) => (output.into_value().to_string(), false, "ok"),
        Err(err) => (err.to_string(), true, err.code()),
    };
    emit_event(
        if is_error { Level::WARN } else { Level::INFO },
        ObservabilityEvent {
            event: "chat.tool_call",
            component: "chat",
            correlation_id: Some(call.id.as_str()),
            tool: Some(call.name.as_str()),
            provider_id: Some(provider_id),
            status: Some(status),
            ..Default::default()
        },
    );
    ToolCallResult {
        call_id: call.id.clone(),
        name: call.name.clone(),
        content,
        is_error,
    }
}
