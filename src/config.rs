//! Configuration management for cody
//!
//! Two independent surfaces live here:
//! - [`ClientSettings`]: what the editor client needs (backend URL, retry and
//!   timeout knobs). Stored in ~/.config/cody/settings.json and reloadable.
//! - [`ServerConfig`]: backend settings, read from an optional `cody.toml`
//!   and overridden by environment variables.

use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";
pub const MIN_RETRIES: u32 = 1;
pub const MAX_RETRIES: u32 = 5;
pub const MIN_TIMEOUT_MS: u64 = 5_000;
pub const MAX_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("OPENAI_API_KEY environment variable is required")]
    MissingApiKey,
    #[error("Invalid backendUrl '{url}': {reason}")]
    InvalidBackendUrl { url: String, reason: String },
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Failed to write settings: {0}")]
    Write(String),
}

// ═══════════════════════════════════════════════════════════════════════════
//  CLIENT SETTINGS
// ═══════════════════════════════════════════════════════════════════════════

/// Settings read by the editor client. Values are clamped on every access
/// path through [`ClientSettings::normalized`], so a hand-edited file cannot
/// push retries or timeouts outside the supported range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    pub backend_url: String,
    pub max_retries: u32,
    /// Milliseconds
    pub request_timeout: u64,
    pub debug_mode: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            max_retries: 3,
            request_timeout: 30_000,
            debug_mode: false,
        }
    }
}

impl ClientSettings {
    /// Strip the trailing slash and clamp numeric ranges.
    pub fn normalized(mut self) -> Self {
        self.backend_url = self.backend_url.trim().trim_end_matches('/').to_string();
        if self.backend_url.is_empty() {
            self.backend_url = DEFAULT_BACKEND_URL.to_string();
        }
        self.max_retries = self.max_retries.clamp(MIN_RETRIES, MAX_RETRIES);
        self.request_timeout = self.request_timeout.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);
        self
    }

    /// Check that the backend URL parses and uses http(s).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let parsed = url::Url::parse(&self.backend_url).map_err(|e| {
            ConfigError::InvalidBackendUrl {
                url: self.backend_url.clone(),
                reason: e.to_string(),
            }
        })?;
        match parsed.scheme() {
            "http" | "https" => Ok(()),
            other => Err(ConfigError::InvalidBackendUrl {
                url: self.backend_url.clone(),
                reason: format!("unsupported scheme '{}'", other),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }

    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("cody"))
    }

    /// Get the settings file path
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings from disk, or return defaults
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        if let Ok(content) = fs::read_to_string(path) {
            match serde_json::from_str::<ClientSettings>(&content) {
                Ok(settings) => return settings.normalized(),
                Err(err) => {
                    preserve_corrupt_file(path, &content);
                    warn!(
                        "Settings file was corrupted ({}). A backup was saved and defaults were loaded.",
                        err
                    );
                }
            }
        }
        Self::default()
    }

    /// Save settings to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::settings_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                ConfigError::Write(format!("Failed to create config directory: {}", e))
            })?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Write(format!("Failed to serialize settings: {}", e)))?;
        write_atomic(path, &content).map_err(ConfigError::Write)
    }

    /// Settings file location for display
    pub fn location() -> String {
        Self::settings_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/cody/settings.json".to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  SERVER CONFIG
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub debug: bool,
    /// Never written to disk; resolved from env or keychain
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub model_generate: String,
    pub model_chat: String,
    pub model_embedding: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub index_path: PathBuf,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            debug: false,
            openai_api_key: None,
            openai_base_url: "https://api.openai.com".to_string(),
            model_generate: "gpt-4o".to_string(),
            model_chat: "gpt-3.5-turbo".to_string(),
            model_embedding: "text-embedding-3-small".to_string(),
            max_tokens: 1000,
            temperature: 0.7,
            index_path: PathBuf::from("./cody_index/index.json"),
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(),
            ],
        }
    }
}

const KEYRING_SERVICE: &str = "cody";
const KEYRING_USERNAME: &str = "openai_api_key";

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn read_keyring_key() -> Result<Option<String>, keyring::Error> {
    let entry = keyring_entry()?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Store the provider key in the system keychain.
pub fn store_api_key(key: &str) -> Result<(), keyring::Error> {
    keyring_entry()?.set_password(key)
}

impl ServerConfig {
    /// Load from an optional TOML file, then apply environment overrides and
    /// resolve the API key.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        let mut config = base.with_env_overrides(|key| std::env::var(key).ok());
        if config.openai_api_key.is_none() {
            config.openai_api_key = keychain_api_key();
        }
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Unparseable numbers keep the
    /// current value.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.port = parse_or_keep("PORT", &port, self.port);
        }
        if let Some(debug) = lookup("DEBUG") {
            self.debug = debug.eq_ignore_ascii_case("true");
        }
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.openai_api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.openai_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = lookup("OPENAI_MODEL_GENERATE") {
            self.model_generate = model;
        }
        if let Some(model) = lookup("OPENAI_MODEL_CHAT") {
            self.model_chat = model;
        }
        if let Some(model) = lookup("OPENAI_MODEL_EMBEDDING") {
            self.model_embedding = model;
        }
        if let Some(tokens) = lookup("OPENAI_MAX_TOKENS") {
            self.max_tokens = parse_or_keep("OPENAI_MAX_TOKENS", &tokens, self.max_tokens);
        }
        if let Some(temp) = lookup("OPENAI_TEMPERATURE") {
            self.temperature = parse_or_keep("OPENAI_TEMPERATURE", &temp, self.temperature);
        }
        if let Some(path) = lookup("CODY_INDEX_PATH") {
            self.index_path = PathBuf::from(path);
        }
        if let Some(origins) = lookup("CORS_ORIGINS") {
            self.cors_origins = origins.split(',').map(str::to_string).collect();
        }
        self
    }

    /// Fail early when the provider key is missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.openai_api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(()),
            _ => Err(ConfigError::MissingApiKey),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn keychain_api_key() -> Option<String> {
    if cfg!(test) {
        return None;
    }
    match read_keyring_key() {
        Ok(key) => key,
        Err(err) => {
            warn!("Failed to read API key from system keychain: {}", err);
            None
        }
    }
}

fn parse_or_keep<T: std::str::FromStr + Copy>(name: &str, raw: &str, current: T) -> T {
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!("Ignoring invalid {} value '{}'", name, raw);
            current
        }
    }
}

fn preserve_corrupt_file(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

/// Write via a temp file and rename so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<(), String> {
    use std::fs::OpenOptions;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| e.to_string())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            warn!("Failed to set temp file permissions: {}", e);
        }
    }

    file.write_all(content.as_bytes())
        .map_err(|e| e.to_string())?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.to_string());
    }
    Ok(())
}
