use serde::{Deserialize, Serialize};
use serde_json::Value;

use flyboard_types::LogEntry;

/// Literal payload that terminates a chat SSE stream.
pub const CHAT_DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LogStreamFrame {
    Connected {
        attempt: u32,
    },
    Progress {
        message: String,
        params: Value,
    },
    Complete {
        logs: Vec<LogEntry>,
        #[serde(rename = "progressMessages")]
        progress_messages: Vec<String>,
    },
    Error {
        error: String,
        details: String,
    },
}

impl LogStreamFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            LogStreamFrame::Connected { .. } => "connected",
            LogStreamFrame::Progress { .. } => "progress",
            LogStreamFrame::Complete { .. } => "complete",
            LogStreamFrame::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatFrame {
    Content(String),
    Error(String),
    Done,
}

impl ChatFrame {
    /// SSE `data:` payload for this frame.
    pub fn to_data(&self) -> String {
        match self {
            ChatFrame::Content(content) => {
                serde_json::json!({ "content": content }).to_string()
            }
            ChatFrame::Error(error) => serde_json::json!({ "error": error }).to_string(),
            ChatFrame::Done => CHAT_DONE_SENTINEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolExecResponse {
    Success { success: bool, result: Value },
    Failure { error: String, details: String },
}

impl ToolExecResponse {
    pub fn success(result: Value) -> Self {
        ToolExecResponse::Success {
            success: true,
            result,
        }
    }

    pub fn failure(error: impl Into<String>, details: impl Into<String>) -> Self {
        ToolExecResponse::Failure {
            error: error.into(),
            details: details.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_frames_are_tagged_by_type() {
        let frame = LogStreamFrame::Complete {
            logs: Vec::new(),
            progress_messages: vec!["tailing".to_string()],
        };
        let value = serde_json::to_value(&frame).expect("json");
        assert_eq!(value["type"], "complete");
        assert_eq!(value["progressMessages"], json!(["tailing"]));
        assert_eq!(frame.kind(), "complete");

        let connected = serde_json::to_value(LogStreamFrame::Connected { attempt: 1 }).expect("json");
        assert_eq!(connected, json!({"type": "connected", "attempt": 1}));
    }

    #[test]
    fn chat_frames_render_data_payloads() {
        assert_eq!(ChatFrame::Content("hi".into()).to_data(), r#"{"content":"hi"}"#);
        assert_eq!(ChatFrame::Error("bad".into()).to_data(), r#"{"error":"bad"}"#);
        assert_eq!(ChatFrame::Done.to_data(), "[DONE]");
    }
}
