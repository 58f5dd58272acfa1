mod error;
mod mcp;
mod progress;

pub use error::McpError;
pub use mcp::{
    decode_tool_text, CallOptions, ConnectionState, McpClient, McpCommand, ProgressBinding,
    ResponseMode, ToolInvoker, ToolOutput, DEFAULT_REQUEST_TIMEOUT, MCP_PROTOCOL_VERSION,
};
pub use progress::{
    Dispatch, NotificationRouter, ProgressNotification, ProgressRegistration, ProgressSink,
    ProgressToken, PROGRESS_METHOD,
};
