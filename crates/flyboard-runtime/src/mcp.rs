use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::Instant;

use flyboard_types::ToolDescriptor;

use crate::error::McpError;
use crate::progress::{NotificationRouter, ProgressSink, ProgressToken};

pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";
const MCP_CLIENT_NAME: &str = "flyboard";
const MCP_CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_TOOL_PAGES: usize = 64;
const CANCELLED_METHOD: &str = "notifications/cancelled";
const CANCEL_REASON_TIMEOUT: &str = "timeout";
const CANCEL_REASON_DROPPED: &str = "request dropped";

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl McpCommand {
    pub fn parse(command_line: &str) -> Result<Self, McpError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            return Err(McpError::InvalidCommand("command is empty".to_string()));
        };
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseMode {
    /// Decode the text payload as JSON, falling back to raw text.
    #[default]
    Structured,
    /// Skip JSON decoding; the payload is human-readable text.
    RawText,
}

/// Decoded payload of a `tools/call` result.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Structured(Value),
    Raw(String),
}

impl ToolOutput {
    pub fn decode(text: String) -> Self {
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => ToolOutput::Structured(value),
            Err(_) => ToolOutput::Raw(text),
        }
    }

    /// JSON view of the output; raw text is wrapped as `{"raw_text": ...}`.
    pub fn into_value(self) -> Value {
        match self {
            ToolOutput::Structured(value) => value,
            ToolOutput::Raw(text) => json!({ "raw_text": text }),
        }
    }

    pub fn into_text(self) -> String {
        match self {
            ToolOutput::Structured(Value::String(text)) => text,
            ToolOutput::Structured(value) => value.to_string(),
            ToolOutput::Raw(text) => text,
        }
    }
}

pub fn decode_tool_text(text: &str) -> Value {
    ToolOutput::decode(text.to_string()).into_value()
}

pub struct ProgressBinding {
    pub token: ProgressToken,
    pub sink: ProgressSink,
}

#[derive(Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub reset_timeout_on_progress: bool,
    pub progress: Option<ProgressBinding>,
    pub mode: ResponseMode,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration, reset_on_progress: bool) -> Self {
        self.timeout = Some(timeout);
        self.reset_timeout_on_progress = reset_on_progress;
        self
    }

    pub fn with_progress(mut self, token: ProgressToken, sink: ProgressSink) -> Self {
        self.progress = Some(ProgressBinding { token, sink });
        self
    }

    pub fn raw_text(mut self) -> Self {
        self.mode = ResponseMode::RawText;
        self
    }
}

#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError>;

    async fn call_tool(
        &self,
        name: &str,
        args: Value,
        options: CallOptions,
    ) -> Result<ToolOutput, McpError>;

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }
}

/// One long-lived JSON-RPC session with the external tool server.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    writer: Mutex<BoxedWriter>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
    router: NotificationRouter,
    child: Mutex<Option<Child>>,
}

impl McpClient {
    /// Spawns the server process and completes the MCP handshake.
    pub async fn spawn(command: &McpCommand) -> Result<Self, McpError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|source| McpError::Spawn {
            command: command.display(),
            source,
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::InvalidCommand("missing stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::InvalidCommand("missing stdout pipe".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }
        let pid = child.id();

        let client = Self::from_transport(stdout, stdin);
        *client.inner.child.lock().await = Some(child);
        client.initialize().await?;
        tracing::info!(command = %command.display(), pid, "mcp server spawned");
        Ok(client)
    }

    /// Builds a session over an arbitrary byte transport. The handshake is not
    /// performed; call [`McpClient::initialize`] before issuing requests.
    pub fn from_transport<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(SessionInner {
            writer: Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            state,
            router: NotificationRouter::new(),
            child: Mutex::new(None),
        });
        tokio::spawn(read_loop(BufReader::new(reader), Arc::downgrade(&inner)));
        Self { inner }
    }

    pub async fn initialize(&self) -> Result<Value, McpError> {
        self.inner.state.send_replace(ConnectionState::Connecting);
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": MCP_CLIENT_NAME,
                "version": MCP_CLIENT_VERSION,
            }
        });
        let result = match self
            .request("initialize", params, DEFAULT_REQUEST_TIMEOUT)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                self.inner.state.send_if_modified(|state| {
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Disconnected;
                        return true;
                    }
                    false
                });
                return Err(err);
            }
        };
        self.notify("notifications/initialized", None).await?;
        self.inner.state.send_replace(ConnectionState::Connected);
        tracing::info!(
            server = result
                .get("serverInfo")
                .and_then(|v| v.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown"),
            protocol = result
                .get("protocolVersion")
                .and_then(|v| v.as_str())
                .unwrap_or(MCP_PROTOCOL_VERSION),
            "mcp session initialized"
        );
        Ok(result)
    }

    pub fn router(&self) -> &NotificationRouter {
        &self.inner.router
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub async fn shutdown(&self) {
        if let Some(mut child) = self.inner.child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        self.inner.state.send_replace(ConnectionState::Closed);
        self.inner.pending.lock().await.clear();
    }

    fn ensure_connected(&self, tool: &str) -> Result<(), McpError> {
        if self.state() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(McpError::NotConnected {
                tool: tool.to_string(),
            })
        }
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let (id, rx) = self.send_request(method, params, method).await?;
        let in_flight = InFlight::new(&self.inner, id);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                in_flight.disarm();
                rpc_result(method, response)
            }
            Ok(Err(_)) => {
                in_flight.disarm();
                Err(McpError::Closed {
                    tool: method.to_string(),
                })
            }
            Err(_) => {
                in_flight.cancel(CANCEL_REASON_TIMEOUT).await;
                Err(McpError::Timeout {
                    tool: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        tool: &str,
    ) -> Result<(u64, oneshot::Receiver<Value>), McpError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = write_line(&self.inner.writer, &message).await {
            self.forget(id).await;
            return Err(McpError::Transport {
                tool: tool.to_string(),
                detail: err.to_string(),
            });
        }
        Ok((id, rx))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let message = match params {
            Some(params) => json!({ "jsonrpc": "2.0", "method": method, "params": params }),
            None => json!({ "jsonrpc": "2.0", "method": method }),
        };
        write_line(&self.inner.writer, &message)
            .await
            .map_err(|err| McpError::Transport {
                tool: method.to_string(),
                detail: err.to_string(),
            })
    }

    async fn forget(&self, id: u64) {
        self.inner.pending.lock().await.remove(&id);
    }
}

#[async_trait]
impl ToolInvoker for McpClient {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        self.ensure_connected("tools/list")?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = match cursor.as_deref() {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = self
                .request("tools/list", params, DEFAULT_REQUEST_TIMEOUT)
                .await?;
            if let Some(rows) = result.get("tools").and_then(|v| v.as_array()) {
                tools.extend(rows.iter().filter_map(ToolDescriptor::from_mcp_row));
            }
            let next = result
                .get("nextCursor")
                .and_then(|v| v.as_str())
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            match next {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
        tracing::warn!(pages = MAX_TOOL_PAGES, "tools/list pagination limit reached");
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        args: Value,
        options: CallOptions,
    ) -> Result<ToolOutput, McpError> {
        self.ensure_connected(name)?;
        let timeout = options.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let arguments = if args.is_null() { json!({}) } else { args };
        let mut params = json!({ "name": name, "arguments": arguments });

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let (registration, caller_sink) = match options.progress {
            Some(binding) => {
                params["_meta"] = json!({ "progressToken": binding.token.as_str() });
                let registration = self.inner.router.register(binding.token, progress_tx);
                (Some(registration), Some(binding.sink))
            }
            None => (None, None),
        };

        let (id, mut response_rx) = self.send_request("tools/call", params, name).await?;
        let in_flight = InFlight::new(&self.inner, id);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let response = loop {
            tokio::select! {
                response = &mut response_rx => match response {
                    Ok(response) => break response,
                    Err(_) => {
                        in_flight.disarm();
                        return Err(McpError::Closed { tool: name.to_string() });
                    }
                },
                Some(note) = progress_rx.recv() => {
                    if options.reset_timeout_on_progress {
                        deadline.as_mut().reset(Instant::now() + timeout);
                    }
                    if let Some(sink) = &caller_sink {
                        let _ = sink.send(note);
                    }
                }
                () = &mut deadline => {
                    in_flight.cancel(CANCEL_REASON_TIMEOUT).await;
                    return Err(McpError::Timeout { tool: name.to_string(), after: timeout });
                }
            }
        };
        in_flight.disarm();

        // Notifications read before the response are already queued; keep their order.
        drop(registration);
        while let Ok(note) = progress_rx.try_recv() {
            if let Some(sink) = &caller_sink {
                let _ = sink.send(note);
            }
        }

        let result = rpc_result(name, response)?;
        decode_call_result(name, &result, options.mode)
    }

    fn connection_state(&self) -> ConnectionState {
        self.state()
    }
}

/// Outstanding request id. Dropping it while armed (the caller's future was
/// dropped) forgets the id and sends `notifications/cancelled` from a
/// spawned task.
struct InFlight {
    session: Weak<SessionInner>,
    id: u64,
    armed: bool,
}

impl InFlight {
    fn new(session: &Arc<SessionInner>, id: u64) -> Self {
        Self {
            session: Arc::downgrade(session),
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    async fn cancel(mut self, reason: &str) {
        self.armed = false;
        if let Some(inner) = self.session.upgrade() {
            cancel_request(&inner, self.id, reason).await;
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(inner) = self.session.upgrade() else {
            return;
        };
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                cancel_request(&inner, id, CANCEL_REASON_DROPPED).await;
            });
        }
    }
}

async fn cancel_request(inner: &SessionInner, id: u64, reason: &str) {
    inner.pending.lock().await.remove(&id);
    // the initialize request is never cancelled, and a closed session has no reader
    if *inner.state.borrow() != ConnectionState::Connected {
        return;
    }
    let message = json!({
        "jsonrpc": "2.0",
        "method": CANCELLED_METHOD,
        "params": { "requestId": id, "reason": reason },
    });
    match write_line(&inner.writer, &message).await {
        Ok(()) => tracing::debug!(id, reason, "mcp request cancelled"),
        Err(err) => tracing::debug!(id, error = %err, "failed to send mcp cancellation"),
    }
}

fn rpc_result(tool: &str, response: Value) -> Result<Value, McpError> {
    if let Some(err) = response.get("error") {
        return Err(McpError::Rpc {
            tool: tool.to_string(),
            code: err.get("code").and_then(|v| v.as_i64()).unwrap_or(0),
            message: err
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("request failed")
                .to_string(),
        });
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

fn decode_call_result(
    tool: &str,
    result: &Value,
    mode: ResponseMode,
) -> Result<ToolOutput, McpError> {
    let text = result
        .get("content")
        .map(render_content)
        .or_else(|| result.get("structuredContent").map(|v| v.to_string()))
        .unwrap_or_default();
    if result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        let detail = if text.trim().is_empty() {
            "tool reported an error".to_string()
        } else {
            text
        };
        return Err(McpError::ToolFailed {
            tool: tool.to_string(),
            detail,
        });
    }
    Ok(match mode {
        ResponseMode::Structured => ToolOutput::decode(text),
        ResponseMode::RawText => ToolOutput::Raw(text),
    })
}

fn render_content(value: &Value) -> String {
    let Some(items) = value.as_array() else {
        return value.to_string();
    };
    items
        .iter()
        .map(|item| match item.get("text").and_then(|v| v.as_str()) {
            Some(text) => text.to_string(),
            None => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn write_line(writer: &Mutex<BoxedWriter>, value: &Value) -> std::io::Result<()> {
    let mut line = serde_json::to_string(value).map_err(std::io::Error::other)?;
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn read_loop<R: AsyncRead + Unpin>(reader: BufReader<R>, session: Weak<SessionInner>) {
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(error = %err, "mcp server read failed");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some(inner) = session.upgrade() else {
            return;
        };
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => handle_message(&inner, value).await,
            Err(err) => {
                tracing::debug!(error = %err, line = trimmed, "ignoring non JSON-RPC output");
            }
        }
    }

    if let Some(inner) = session.upgrade() {
        inner.state.send_replace(ConnectionState::Closed);
        let dropped = {
            let mut pending = inner.pending.lock().await;
            let count = pending.len();
            pending.clear();
            count
        };
        tracing::warn!(pending = dropped, "mcp session closed");
    }
}

async fn handle_message(inner: &SessionInner, value: Value) {
    let method = value
        .get("method")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let id = value.get("id").cloned();

    match (method, id) {
        (None, Some(id)) => {
            let Some(id) = id.as_u64() else {
                return;
            };
            match inner.pending.lock().await.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(value);
                }
                None => tracing::debug!(id, "response for unknown or expired request"),
            }
        }
        (Some(method), Some(id)) => {
            let reply = if method == "ping" {
                json!({ "jsonrpc": "2.0", "id": id, "result": {} })
            } else {
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32601,
                        "message": format!("method `{method}` is not supported by this client"),
                    }
                })
            };
            if let Err(err) = write_line(&inner.writer, &reply).await {
                tracing::warn!(error = %err, method = %method, "failed to answer server request");
            }
        }
        (Some(method), None) => {
            inner.router.dispatch(&method, value.get("params"));
        }
        (None, None) => {}
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "flyboard.mcp.stderr", "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, Lines, ReadHalf, WriteHalf};

    struct FakeServer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn recv(&mut self) -> Value {
            let line = self
                .lines
                .next_line()
                .await
                .expect("read")
                .expect("line");
            serde_json::from_str(&line).expect("json")
        }

        async fn send(&mut self, value: Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.writer
                .write_all(line.as_bytes())
                .await
                .expect("write");
        }

        async fn reply(&mut self, request: &Value, result: Value) {
            self.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
                .await;
        }

        async fn progress(&mut self, token: &Value, message: &str) {
            self.send(json!({
                "jsonrpc": "2.0",
                "method": "notifications/progress",
                "params": {"progressToken": token, "progress": 1, "message": message}
            }))
            .await;
        }
    }

    fn text_result(text: &str) -> Value {
        json!({"content": [{"type": "text", "text": text}]})
    }

    async fn connected_pair() -> (McpClient, FakeServer) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let client = McpClient::from_transport(client_read, client_write);
        let mut server = FakeServer {
            lines: BufReader::new(server_read).lines(),
            writer: server_write,
        };

        let init_client = client.clone();
        let init = tokio::spawn(async move { init_client.initialize().await });
        let request = server.recv().await;
        assert_eq!(request["method"], "initialize");
        assert_eq!(request["params"]["clientInfo"]["name"], "flyboard");
        server
            .reply(
                &request,
                json!({"protocolVersion": MCP_PROTOCOL_VERSION, "serverInfo": {"name": "fake"}}),
            )
            .await;
        let initialized = server.recv().await;
        assert_eq!(initialized["method"], "notifications/initialized");
        init.await.expect("join").expect("initialize");
        assert_eq!(client.state(), ConnectionState::Connected);
        (client, server)
    }

    #[tokio::test]
    async fn calls_before_handshake_are_rejected() {
        let (client_io, _server_io) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(client_io);
        let client = McpClient::from_transport(read, write);
        let err = client
            .call_tool("fly-apps-list", json!({}), CallOptions::default())
            .await
            .expect_err("not connected");
        assert!(matches!(err, McpError::NotConnected { ref tool } if tool == "fly-apps-list"));
    }

    #[tokio::test]
    async fn call_tool_decodes_json_and_falls_back_to_raw_text() {
        let (client, mut server) = connected_pair().await;

        let c = client.clone();
        let call = tokio::spawn(async move {
            c.call_tool("fly-apps-list", Value::Null, CallOptions::default())
                .await
        });
        let request = server.recv().await;
        assert_eq!(request["method"], "tools/call");
        assert_eq!(request["params"]["name"], "fly-apps-list");
        assert_eq!(request["params"]["arguments"], json!({}));
        assert!(request["params"].get("_meta").is_none());
        server
            .reply(&request, text_result(r#"[{"name":"web"}]"#))
            .await;
        let output = call.await.expect("join").expect("call");
        assert_eq!(output, ToolOutput::Structured(json!([{"name": "web"}])));

        let c = client.clone();
        let call = tokio::spawn(async move {
            c.call_tool("fly-status", json!({"app": "web"}), CallOptions::default())
                .await
        });
        let request = server.recv().await;
        server
            .reply(&request, text_result("Machines\nID  STATE\n1   started"))
            .await;
        let output = call.await.expect("join").expect("call");
        assert_eq!(
            output.into_value(),
            json!({"raw_text": "Machines\nID  STATE\n1   started"})
        );
    }

    #[tokio::test]
    async fn raw_text_mode_skips_json_decoding() {
        let (client, mut server) = connected_pair().await;
        let c = client.clone();
        let call = tokio::spawn(async move {
            c.call_tool("fly-logs", json!({"app": "web"}), CallOptions::default().raw_text())
                .await
        });
        let request = server.recv().await;
        server.reply(&request, text_result(r#"{"looks":"like json"}"#)).await;
        let output = call.await.expect("join").expect("call");
        assert_eq!(output, ToolOutput::Raw(r#"{"looks":"like json"}"#.to_string()));
    }

    #[tokio::test]
    async fn progress_notifications_reach_only_the_owning_call() {
        let (client, mut server) = connected_pair().await;
        let token = ProgressToken::new();
        let (sink, mut rx) = mpsc::unbounded_channel();

        let c = client.clone();
        let call_token = token.clone();
        let call = tokio::spawn(async move {
            c.call_tool(
                "fly-logs",
                json!({"app": "web"}),
                CallOptions::default()
                    .raw_text()
                    .with_progress(call_token, sink),
            )
            .await
        });
        let request = server.recv().await;
        let wire_token = request["params"]["_meta"]["progressToken"].clone();
        assert_eq!(wire_token, json!(token.as_str()));

        server.progress(&wire_token, "line one").await;
        server.progress(&json!("someone-else"), "not mine").await;
        server.progress(&wire_token, "line two").await;
        server.reply(&request, text_result("done")).await;

        call.await.expect("join").expect("call");
        let received = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|note| note.display_message())
            .collect::<Vec<_>>();
        assert_eq!(received, vec!["line one", "line two"]);
        assert_eq!(client.router().active_tokens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_the_call_timeout() {
        let (client, mut server) = connected_pair().await;
        let (sink, _rx) = mpsc::unbounded_channel();
        let c = client.clone();
        let call = tokio::spawn(async move {
            c.call_tool(
                "fly-logs",
                json!({}),
                CallOptions::default()
                    .with_timeout(Duration::from_secs(1), true)
                    .with_progress(ProgressToken::new(), sink),
            )
            .await
        });
        let request = server.recv().await;
        let token = request["params"]["_meta"]["progressToken"].clone();
        for step in 0..3 {
            tokio::time::sleep(Duration::from_millis(600)).await;
            server.progress(&token, &format!("tick {step}")).await;
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        server.reply(&request, text_result("ok")).await;
        let output = call.await.expect("join").expect("kept alive by progress");
        assert_eq!(output, ToolOutput::Raw("ok".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn calls_time_out_without_reset() {
        let (client, mut server) = connected_pair().await;
        let (sink, _rx) = mpsc::unbounded_channel();
        let c = client.clone();
        let call = tokio::spawn(async move {
            c.call_tool(
                "fly-logs",
                json!({}),
                CallOptions::default()
                    .with_timeout(Duration::from_secs(1), false)
                    .with_progress(ProgressToken::new(), sink),
            )
            .await
        });
        let request = server.recv().await;
        let token = request["params"]["_meta"]["progressToken"].clone();
        tokio::time::sleep(Duration::from_millis(600)).await;
        server.progress(&token, "still here").await;
        let err = call.await.expect("join").expect_err("timeout");
        assert!(matches!(err, McpError::Timeout { ref tool, .. } if tool == "fly-logs"));
        assert!(err.is_retryable());
        assert_eq!(client.router().active_tokens(), 0);

        let cancelled = server.recv().await;
        assert_eq!(cancelled["method"], "notifications/cancelled");
        assert_eq!(cancelled["params"]["requestId"], request["id"]);
        assert_eq!(cancelled["params"]["reason"], "timeout");
        assert!(cancelled.get("id").is_none());
    }

    #[tokio::test]
    async fn dropped_calls_are_cancelled_on_the_server() {
        let (client, mut server) = connected_pair().await;
        let c = client.clone();
        let call = tokio::spawn(async move {
            c.call_tool("fly-logs", json!({"app": "web"}), CallOptions::default())
                .await
        });
        let request = server.recv().await;
        call.abort();
        assert!(call.await.expect_err("aborted").is_cancelled());

        let cancelled = server.recv().await;
        assert_eq!(cancelled["method"], "notifications/cancelled");
        assert_eq!(cancelled["params"]["requestId"], request["id"]);
        assert_eq!(cancelled["params"]["reason"], "request dropped");

        // a late answer for the cancelled id is ignored and the session keeps working
        server.reply(&request, text_result("too late")).await;
        let c = client.clone();
        let next = tokio::spawn(async move {
            c.call_tool("fly-status", json!({}), CallOptions::default()).await
        });
        let request = server.recv().await;
        assert_eq!(request["params"]["name"], "fly-status");
        server.reply(&request, text_result("ok")).await;
        assert_eq!(
            next.await.expect("join").expect("call"),
            ToolOutput::Raw("ok".to_string())
        );
    }

    #[tokio::test]
    async fn tool_errors_and_rpc_errors_name_the_tool() {
        let (client, mut server) = connected_pair().await;

        let c = client.clone();
        let call = tokio::spawn(async move {
            c.call_tool("fly-machine-start", json!({}), CallOptions::default())
                .await
        });
        let request = server.recv().await;
        server
            .reply(
                &request,
                json!({"isError": true, "content": [{"type": "text", "text": "machine not found"}]}),
            )
            .await;
        let err = call.await.expect("join").expect_err("tool failure");
        assert!(!err.is_retryable());
        assert_eq!(err.tool(), Some("fly-machine-start"));
        assert!(err.to_string().contains("machine not found"));

        let c = client.clone();
        let call = tokio::spawn(async move {
            c.call_tool("fly-nope", json!({}), CallOptions::default()).await
        });
        let request = server.recv().await;
        server
            .send(json!({"jsonrpc": "2.0", "id": request["id"], "error": {"code": -32602, "message": "unknown tool"}}))
            .await;
        let err = call.await.expect("join").expect_err("rpc failure");
        assert!(matches!(err, McpError::Rpc { code: -32602, ref tool, .. } if tool == "fly-nope"));
    }

    #[tokio::test]
    async fn list_tools_follows_cursor_until_exhausted() {
        let (client, mut server) = connected_pair().await;
        let c = client.clone();
        let list = tokio::spawn(async move { c.list_tools().await });

        let first = server.recv().await;
        assert_eq!(first["method"], "tools/list");
        assert!(first["params"].get("cursor").is_none());
        server
            .reply(
                &first,
                json!({"tools": [{"name": "fly-apps-list"}], "nextCursor": "page-2"}),
            )
            .await;
        let second = server.recv().await;
        assert_eq!(second["params"]["cursor"], "page-2");
        server
            .reply(&second, json!({"tools": [{"name": "fly-logs"}, {"name": "fly-status"}]}))
            .await;

        let tools = list.await.expect("join").expect("tools");
        let names = tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["fly-apps-list", "fly-logs", "fly-status"]);
    }

    #[tokio::test]
    async fn answers_server_ping() {
        let (_client, mut server) = connected_pair().await;
        server
            .send(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"}))
            .await;
        let reply = server.recv().await;
        assert_eq!(reply["id"], "srv-1");
        assert_eq!(reply["result"], json!({}));
    }

    #[tokio::test]
    async fn closed_transport_fails_pending_calls() {
        let (client, mut server) = connected_pair().await;
        let c = client.clone();
        let call = tokio::spawn(async move {
            c.call_tool("fly-logs", json!({}), CallOptions::default()).await
        });
        let _request = server.recv().await;
        drop(server);
        let err = call.await.expect("join").expect_err("closed");
        assert!(matches!(err, McpError::Closed { ref tool } if tool == "fly-logs"));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn decode_tool_text_never_fails() {
        assert_eq!(decode_tool_text(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(
            decode_tool_text("oops: not json"),
            json!({"raw_text": "oops: not json"})
        );
        assert_eq!(decode_tool_text(""), json!({"raw_text": ""}));
    }

    #[test]
    fn parses_command_lines() {
        let command = McpCommand::parse("flyctl mcp server").expect("command");
        assert_eq!(command.program, "flyctl");
        assert_eq!(command.args, vec!["mcp", "server"]);
        assert_eq!(command.display(), "flyctl mcp server");
        assert!(McpCommand::parse("   ").is_err());
    }
}
