use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use flyboard_providers::ProviderConfig;
use flyboard_types::ProviderKind;

pub const SETTINGS_FILE: &str = "settings.json";
pub const STATE_DIR_ENV: &str = "FLYBOARD_STATE_DIR";

/// Persisted dashboard settings. The provider is kept as free text so an
/// unknown value in the file never prevents loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Settings as returned to the browser; the key itself never leaves the server.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub has_api_key: bool,
}

/// Partial update. Absent fields are left alone; an empty string clears.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

/// Per-request overrides supplied alongside a chat turn.
#[derive(Debug, Clone, Default)]
pub struct ProviderOverrides {
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

#[derive(Clone)]
pub struct SettingsStore {
    path: PathBuf,
    current: Arc<RwLock<Settings>>,
}

impl SettingsStore {
    pub async fn load(state_dir: &Path) -> Self {
        let path = state_dir.join(SETTINGS_FILE);
        let current = read_settings(&path).await;
        Self {
            path,
            current: Arc::new(RwLock::new(current)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self) -> Settings {
        self.current.read().await.clone()
    }

    pub async fn view(&self) -> SettingsView {
        let settings = self.current.read().await;
        SettingsView {
            provider: settings.provider.clone(),
            model: settings.model.clone(),
            has_api_key: settings
                .api_key
                .as_deref()
                .is_some_and(|key| !key.trim().is_empty()),
        }
    }

    pub async fn update(&self, patch: SettingsPatch) -> anyhow::Result<SettingsView> {
        if let Some(provider) = patch.provider.as_deref().filter(|p| !p.trim().is_empty()) {
            provider.parse::<ProviderKind>().map_err(anyhow::Error::msg)?;
        }
        {
            let mut current = self.current.write().await;
            let mut next = current.clone();
            apply_field(&mut next.provider, patch.provider);
            apply_field(&mut next.api_key, patch.api_key);
            apply_field(&mut next.model, patch.model);
            write_settings(&self.path, &next).await?;
            *current = next;
        }
        tracing::info!(path = %self.path.display(), "settings saved");
        Ok(self.view().await)
    }

    /// Picks the provider and credentials for one chat turn. Request
    /// overrides win over stored settings; a stored key only applies to the
    /// stored provider. Missing keys are left for the env fallback.
    pub async fn resolve_provider(
        &self,
        overrides: ProviderOverrides,
    ) -> anyhow::Result<(ProviderKind, ProviderConfig)> {
        let settings = self.current.read().await.clone();
        let stored_kind = settings
            .provider
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .and_then(|p| p.parse::<ProviderKind>().ok());
        let kind = match overrides.provider.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(raw) => raw.parse::<ProviderKind>().map_err(anyhow::Error::msg)?,
            None => stored_kind.unwrap_or(ProviderKind::OpenAi),
        };
        let same_as_stored = stored_kind == Some(kind);
        let api_key = non_blank(overrides.api_key)
            .or_else(|| same_as_stored.then(|| non_blank(settings.api_key.clone())).flatten());
        let model = non_blank(overrides.model)
            .or_else(|| same_as_stored.then(|| non_blank(settings.model.clone())).flatten());
        Ok((
            kind,
            ProviderConfig {
                api_key,
                model,
                url: None,
            },
        ))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn apply_field(slot: &mut Option<String>, value: Option<String>) {
    if let Some(value) = value {
        *slot = non_blank(Some(value)).map(|v| v.trim().to_string());
    }
}

async fn read_settings(path: &Path) -> Settings {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read settings");
            return Settings::default();
        }
    };
    serde_json::from_str(&raw).unwrap_or_else(|err| {
        tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable settings file");
        Settings::default()
    })
}

async fn write_settings(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(settings)?;
    fs::write(path, raw).await?;
    Ok(())
}

/// State directory: explicit flag, then `FLYBOARD_STATE_DIR`, then the
/// platform data dir, then `~/.flyboard`, then `./.flyboard`.
pub fn resolve_state_dir(explicit: Option<PathBuf>) -> PathBuf {
    resolve_state_dir_with(explicit, std::env::var(STATE_DIR_ENV).ok())
}

fn resolve_state_dir_with(explicit: Option<PathBuf>, env_value: Option<String>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Some(value) = env_value.filter(|v| !v.trim().is_empty()) {
        return PathBuf::from(value.trim());
    }
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("flyboard");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".flyboard");
    }
    PathBuf::from(".flyboard")
}
