use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

pub const PROGRESS_METHOD: &str = "notifications/progress";

/// Opaque id correlating out-of-band progress notifications with one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ProgressToken(String);

impl ProgressToken {
    pub fn new() -> Self {
        Self(format!("flyboard-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// MCP allows string or integer tokens; both normalize to the string form.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl Default for ProgressToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProgressToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressNotification {
    pub token: ProgressToken,
    pub progress: Option<f64>,
    pub total: Option<f64>,
    pub message: Option<String>,
    /// Raw notification params as received.
    pub params: Value,
}

impl ProgressNotification {
    pub fn from_params(params: &Value) -> Option<Self> {
        let token = ProgressToken::from_value(params.get("progressToken")?)?;
        Some(Self {
            token,
            progress: params.get("progress").and_then(|v| v.as_f64()),
            total: params.get("total").and_then(|v| v.as_f64()),
            message: params
                .get("message")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            params: params.clone(),
        })
    }

    /// Human readable line for this notification, falling back to the counters.
    pub fn display_message(&self) -> String {
        if let Some(message) = self.message.as_deref() {
            return message.to_string();
        }
        match (self.progress, self.total) {
            (Some(progress), Some(total)) => format!("progress {progress}/{total}"),
            (Some(progress), None) => format!("progress {progress}"),
            _ => String::new(),
        }
    }
}

pub type ProgressSink = mpsc::UnboundedSender<ProgressNotification>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    NoSubscriber,
    Unmatched,
}

/// Routes inbound notifications from the shared session to the call that owns
/// the matching progress token.
#[derive(Clone)]
pub struct NotificationRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    handlers: Mutex<HashMap<ProgressToken, ProgressSink>>,
    all: broadcast::Sender<ProgressNotification>,
    unmatched: broadcast::Sender<Value>,
}

impl RouterInner {
    fn handlers(&self) -> MutexGuard<'_, HashMap<ProgressToken, ProgressSink>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl NotificationRouter {
    pub fn new() -> Self {
        let (all, _) = broadcast::channel(256);
        let (unmatched, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RouterInner {
                handlers: Mutex::new(HashMap::new()),
                all,
                unmatched,
            }),
        }
    }

    /// Installs `sink` for `token`. The handler is removed when the returned
    /// registration is dropped, whatever way the owning call ends.
    pub fn register(&self, token: ProgressToken, sink: ProgressSink) -> ProgressRegistration {
        if self
            .inner
            .handlers()
            .insert(token.clone(), sink)
            .is_some()
        {
            tracing::warn!(token = %token, "progress token registered twice; replacing handler");
        }
        ProgressRegistration {
            token,
            inner: self.inner.clone(),
        }
    }

    /// Receives every progress notification, matched or not.
    pub fn subscribe_all(&self) -> broadcast::Receiver<ProgressNotification> {
        self.inner.all.subscribe()
    }

    /// Receives notifications outside the progress schema.
    pub fn subscribe_unmatched(&self) -> broadcast::Receiver<Value> {
        self.inner.unmatched.subscribe()
    }

    pub fn active_tokens(&self) -> usize {
        self.inner.handlers().len()
    }

    pub fn dispatch(&self, method: &str, params: Option<&Value>) -> Dispatch {
        let parsed = if method == PROGRESS_METHOD {
            params.and_then(ProgressNotification::from_params)
        } else {
            None
        };
        let Some(notification) = parsed else {
            let _ = self.inner.unmatched.send(serde_json::json!({
                "method": method,
                "params": params.cloned().unwrap_or(Value::Null),
            }));
            return Dispatch::Unmatched;
        };

        let _ = self.inner.all.send(notification.clone());
        let sink = self.inner.handlers().get(&notification.token).cloned();
        match sink {
            Some(sink) if sink.send(notification).is_ok() => Dispatch::Delivered,
            _ => Dispatch::NoSubscriber,
        }
    }
}

impl Default for NotificationRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use = "dropping the registration removes the progress handler"]
pub struct ProgressRegistration {
    token: ProgressToken,
    inner: Arc<RouterInner>,
}

impl ProgressRegistration {
    pub fn token(&self) -> &ProgressToken {
        &self.token
    }
}

impl Drop for ProgressRegistration {
    fn drop(&mut self) {
        self.inner.handlers().remove(&self.token);
    }
}
