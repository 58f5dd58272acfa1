use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("failed to spawn MCP server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid MCP server command: {0}")]
    InvalidCommand(String),

    #[error("MCP transport failed during `{tool}`: {detail}")]
    Transport { tool: String, detail: String },

    #[error("MCP call `{tool}` timed out after {}s", .after.as_secs())]
    Timeout { tool: String, after: Duration },

    #[error("MCP session closed while waiting on `{tool}`")]
    Closed { tool: String },

    #[error("MCP session is not connected (tool `{tool}`)")]
    NotConnected { tool: String },

    #[error("MCP call `{tool}` failed: {message}")]
    Rpc {
        tool: String,
        code: i64,
        message: String,
    },

    #[error("tool `{tool}` returned an error: {detail}")]
    ToolFailed { tool: String, detail: String },
}

impl McpError {
    /// Transport-level failures a caller may retry; application errors are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            McpError::Transport { .. } | McpError::Timeout { .. } | McpError::Closed { .. }
        )
    }

    pub fn tool(&self) -> Option<&str> {
        match self {
            McpError::Transport { tool, .. }
            | McpError::Timeout { tool, .. }
            | McpError::Closed { tool }
            | McpError::NotConnected { tool }
            | McpError::Rpc { tool, .. }
            | McpError::ToolFailed { tool, .. } => Some(tool),
            McpError::Spawn { .. } | McpError::InvalidCommand(_) => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            McpError::Spawn { .. } => "MCP_SPAWN_FAILED",
            McpError::InvalidCommand(_) => "MCP_INVALID_COMMAND",
            McpError::Transport { .. } => "MCP_TRANSPORT",
            McpError::Timeout { .. } => "MCP_TIMEOUT",
            McpError::Closed { .. } => "MCP_CLOSED",
            McpError::NotConnected { .. } => "MCP_NOT_CONNECTED",
            McpError::Rpc { .. } => "MCP_RPC_ERROR",
            McpError::ToolFailed { .. } => "TOOL_FAILED",
        }
    }
}
