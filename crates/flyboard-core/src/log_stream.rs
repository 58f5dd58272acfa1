use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use flyboard_observability::{emit_event, ObservabilityEvent};
use flyboard_runtime::{
    CallOptions, McpError, ProgressNotification, ProgressToken, ToolInvoker, ToolOutput,
};
use flyboard_wire::LogStreamFrame;

use crate::log_entry::{LogBook, DEFAULT_TAIL_LINES};

pub const DEFAULT_LOG_TOOL: &str = "fly-logs";
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_LOG_CALL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct LogStreamConfig {
    pub tool_name: String,
    pub retry_delay: Duration,
    /// Per-attempt timeout, restarted by every progress notification.
    pub call_timeout: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            tool_name: DEFAULT_LOG_TOOL.to_string(),
            retry_delay: DEFAULT_RETRY_DELAY,
            call_timeout: DEFAULT_LOG_CALL_TIMEOUT,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStreamRequest {
    pub app: String,
    pub region: Option<String>,
    pub machine: Option<String>,
    pub lines: usize,
}

impl LogStreamRequest {
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            region: None,
            machine: None,
            lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn tool_args(&self) -> Value {
        let mut args = json!({ "app": self.app });
        if let Some(region) = self.region.as_deref().filter(|r| !r.is_empty()) {
            args["region"] = json!(region);
        }
        if let Some(machine) = self.machine.as_deref().filter(|m| !m.is_empty()) {
            args["machine"] = json!(machine);
        }
        args
    }
}

enum Step {
    Cancelled,
    Progress(ProgressNotification),
    Finished(Result<ToolOutput, McpError>),
}

/// Streams one log retrieval as SSE frames.
///
/// Every attempt opens with `connected`, forwards progress notifications as
/// they arrive and ends with either `complete` (which closes the stream) or
/// `error`, after which the whole request is re-issued with an empty log
/// window once `retry_delay` has passed.
pub fn log_stream(
    tools: Arc<dyn ToolInvoker>,
    config: LogStreamConfig,
    request: LogStreamRequest,
    cancel: CancellationToken,
) -> impl Stream<Item = LogStreamFrame> + Send + 'static {
    stream! {
        let args = request.tool_args();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let token = ProgressToken::new();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut book = LogBook::new();

            emit_event(
                Level::INFO,
                ObservabilityEvent {
                    event: "log_stream.attempt",
                    component: "log_stream",
                    correlation_id: Some(token.as_str()),
                    tool: Some(config.tool_name.as_str()),
                    attempt: Some(attempt),
                    detail: Some(request.app.as_str()),
                    ..Default::default()
                },
            );
            yield LogStreamFrame::Connected { attempt };

            let options = CallOptions::default()
                .with_timeout(config.call_timeout, true)
                .with_progress(token.clone(), tx)
                .raw_text();
            let mut call = tools.call_tool(&config.tool_name, args.clone(), options);

            let failure = loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Cancelled,
                    Some(notification) = rx.recv() => Step::Progress(notification),
                    result = &mut call => Step::Finished(result),
                };
                match step {
                    Step::Cancelled => {
                        tracing::debug!(attempt, app = %request.app, "log stream cancelled");
                        return;
                    }
                    Step::Progress(notification) => {
                        let message = notification.display_message();
                        if message.is_empty() {
                            continue;
                        }
                        book.push_progress(&message);
                        yield LogStreamFrame::Progress {
                            message,
                            params: notification.params,
                        };
                    }
                    Step::Finished(result) => {
                        while let Ok(notification) = rx.try_recv() {
                            let message = notification.display_message();
                            if message.is_empty() {
                                continue;
                            }
                            book.push_progress(&message);
                            yield LogStreamFrame::Progress {
                                message,
                                params: notification.params,
                            };
                        }
                        let output = match result {
                            Ok(output) => output,
                            Err(err) => break err,
                        };
                        book.extend_tail(&output.into_text(), request.lines);
                        let (logs, progress_messages) = book.into_parts();
                        let status = format!("{} entries", logs.len());
                        emit_event(
                            Level::INFO,
                            ObservabilityEvent {
                                event: "log_stream.complete",
                                component: "log_stream",
                                correlation_id: Some(token.as_str()),
                                tool: Some(config.tool_name.as_str()),
                                attempt: Some(attempt),
                                status: Some(status.as_str()),
                                ..Default::default()
                            },
                        );
                        yield LogStreamFrame::Complete {
                            logs,
                            progress_messages,
                        };
                        return;
                    }
                }
            };

            let detail = failure.to_string();
            emit_event(
                Level::WARN,
                ObservabilityEvent {
                    event: "log_stream.error",
                    component: "log_stream",
                    correlation_id: Some(token.as_str()),
                    tool: Some(config.tool_name.as_str()),
                    attempt: Some(attempt),
                    error_code: Some(failure.code()),
                    detail: Some(detail.as_str()),
                    ..Default::default()
                },
            );
            yield LogStreamFrame::Error {
                error: "Failed to fetch logs".to_string(),
                details: detail,
            };

            if config.max_attempts.is_some_and(|max| attempt >= max) {
                tracing::warn!(attempt, app = %request.app, "log stream giving up after max attempts");
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(config.retry_delay) => {}
            }
        }
    }
}
