use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::keyring::{self, KeyringError};

/// Timing knobs for the sync engine. Every field has a default so a config
/// file only needs the ones it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    pub tick_interval_ms: u64,
    pub sync_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub retention_days: u32,
    pub sweep_interval_ms: u64,
    pub page_size: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            tick_interval_ms: 5_000,
            sync_timeout_ms: 20_000,
            send_timeout_ms: 30_000,
            retention_days: 15,
            sweep_interval_ms: 24 * 60 * 60 * 1000,
            page_size: 50,
        }
    }
}

impl SyncSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn retention_window_ms(&self) -> i64 {
        i64::from(self.retention_days) * 24 * 60 * 60 * 1000
    }
}

/// Runtime config. The token is always a plain String in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub api_url: String,
    pub viewer_id: String,
    pub tenant_id: Option<String>,
    pub token: String,
    pub sync: SyncSettings,
}

/// On-disk representation. The token is either a keyring reference or plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub api_url: String,
    pub viewer_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub token: TokenBackend,
    #[serde(default)]
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend")]
pub enum TokenBackend {
    #[serde(rename = "keyring")]
    Keyring,
    #[serde(rename = "plaintext")]
    Plaintext { value: String },
}

/// What the caller needs to ask for when credentials can't be resolved automatically.
#[derive(Debug, Clone)]
pub enum ConfigNeedsInput {
    /// No config file exists.
    FullSetup,
    /// Config exists but the token is missing from the keyring.
    TokenOnly {
        api_url: String,
        viewer_id: String,
        error: Option<String>,
    },
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("turnover-chat")
        .join("config.json")
}

/// What to tell the user before asking for a token. A token that was
/// simply never stored needs no explanation.
fn prompt_error(e: &KeyringError) -> Option<String> {
    match e {
        KeyringError::NotFound(_) => None,
        KeyringError::Backend(_) => Some(e.to_string()),
    }
}

/// Host part of the API url, used as the keyring scope.
pub fn api_host(api_url: &str) -> String {
    url::Url::parse(api_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| api_url.to_string())
}

impl FileConfig {
    pub fn load() -> Result<Option<Self>, String> {
        let path = config_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path).map_err(|e| format!("read config: {e}"))?;
        let cfg: FileConfig = serde_json::from_str(&data).map_err(|e| format!("parse config: {e}"))?;
        Ok(Some(cfg))
    }

    pub fn save(&self) -> Result<(), String> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("create config dir: {e}"))?;
        }
        let data = serde_json::to_string_pretty(self).map_err(|e| format!("serialize config: {e}"))?;
        fs::write(&path, data).map_err(|e| format!("write config: {e}"))
    }
}

impl Config {
    /// Try env vars. Returns None if any required var is missing.
    pub fn from_env() -> Option<Self> {
        let api_url = std::env::var("TURNOVER_API_URL").ok()?;
        let viewer_id = std::env::var("TURNOVER_VIEWER").ok()?;
        let token = std::env::var("TURNOVER_TOKEN").ok()?;
        let tenant_id = std::env::var("TURNOVER_TENANT")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Some(Config {
            api_url,
            viewer_id,
            tenant_id,
            token,
            sync: SyncSettings::default(),
        })
    }

    /// Build runtime Config from a FileConfig + resolved token string.
    pub fn from_file_config(fc: &FileConfig, token: String) -> Self {
        Config {
            api_url: fc.api_url.clone(),
            viewer_id: fc.viewer_id.clone(),
            tenant_id: fc.tenant_id.clone(),
            token,
            sync: fc.sync.clone(),
        }
    }

    /// Resolution order: env vars → config file + keyring → Err(ConfigNeedsInput).
    pub fn resolve() -> Result<Self, ConfigNeedsInput> {
        // 1. Env vars override everything
        if let Some(config) = Self::from_env() {
            log::info!("Config loaded from environment variables");
            return Ok(config);
        }

        // 2. Config file + keyring
        match FileConfig::load() {
            Ok(Some(fc)) => match &fc.token {
                TokenBackend::Plaintext { value } => {
                    log::info!("Config loaded from file (plaintext token)");
                    Ok(Self::from_file_config(&fc, value.clone()))
                }
                TokenBackend::Keyring => {
                    match keyring::get_token(&fc.viewer_id, &api_host(&fc.api_url)) {
                        Ok(token) => {
                            log::info!("Config loaded from file + keyring");
                            Ok(Self::from_file_config(&fc, token))
                        }
                        Err(e) => {
                            log::warn!("Keyring lookup failed: {}", e);
                            Err(ConfigNeedsInput::TokenOnly {
                                api_url: fc.api_url,
                                viewer_id: fc.viewer_id,
                                error: prompt_error(&e),
                            })
                        }
                    }
                }
            },
            Ok(None) => {
                log::info!("No config file found, need full setup");
                Err(ConfigNeedsInput::FullSetup)
            }
            Err(e) => {
                log::warn!("Config file error: {}", e);
                Err(ConfigNeedsInput::FullSetup)
            }
        }
    }
}
