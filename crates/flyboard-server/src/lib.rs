use std::sync::Arc;

use flyboard_core::{ChatConfig, ChatOrchestrator, LogStreamConfig, SettingsStore};
use flyboard_providers::{build_provider, ChatProvider, ProviderConfig};
use flyboard_runtime::ToolInvoker;
use flyboard_types::ProviderKind;

mod http;

pub use http::{app_router, serve};

pub type ProviderFactory =
    Arc<dyn Fn(ProviderKind, ProviderConfig) -> anyhow::Result<Arc<dyn ChatProvider>> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub tools: Arc<dyn ToolInvoker>,
    pub settings: SettingsStore,
    pub chat: ChatOrchestrator,
    pub log_stream: LogStreamConfig,
    /// Tail size used when a log request does not ask for one.
    pub default_log_lines: usize,
    pub providers: ProviderFactory,
}

impl AppState {
    pub fn new(
        tools: Arc<dyn ToolInvoker>,
        settings: SettingsStore,
        chat: ChatConfig,
        log_stream: LogStreamConfig,
        default_log_lines: usize,
    ) -> Self {
        Self {
            chat: ChatOrchestrator::new(tools.clone(), chat),
            tools,
            settings,
            log_stream,
            default_log_lines,
            providers: Arc::new(build_provider),
        }
    }

    pub fn with_provider_factory(mut self, providers: ProviderFactory) -> Self {
        self.providers = providers;
        self
    }
}
