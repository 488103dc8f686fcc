use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ratatui::style::Color;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::model::User;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:5001";
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4.1-mini";
pub const APP_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub captcha: CaptchaConfig,
    #[serde(default)]
    pub attestation: AttestationConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub theme: ThemeConfig,
}

impl AppConfig {
    /// `STUDYBUDDY_API_URL` wins over the configured URL.
    pub fn api_base_url(&self) -> String {
        std::env::var("STUDYBUDDY_API_URL")
            .ok()
            .or_else(|| self.general.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default)]
    pub offline_mode: bool,
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            offline_mode: false,
            api_url: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct CaptchaConfig {
    /// Public key of the reCAPTCHA widget page.
    #[serde(default)]
    pub site_key: Option<String>,
    /// Server secret, only used by the local backend.
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct AttestationConfig {
    #[serde(default)]
    pub site_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.4,
        }
    }
}

impl LlmConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ThemeConfig {
    pub foreground: Color,
    pub border_active: Color,
    pub border_inactive: Color,
    pub selection_bg: Color,
    pub selection_fg: Color,
    pub header: Color,
    pub hint: Color,
    pub status_ok: Color,
    pub status_error: Color,
    pub busy: Color,
    pub summary: Color,
    pub link: Color,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            foreground: Color::Rgb(248, 248, 242),
            border_active: Color::Rgb(255, 121, 198),
            border_inactive: Color::Rgb(98, 114, 164),
            selection_bg: Color::Rgb(68, 71, 90),
            selection_fg: Color::Rgb(255, 121, 198),
            header: Color::Rgb(189, 147, 249),
            hint: Color::DarkGray,
            status_ok: Color::Rgb(80, 250, 123),
            status_error: Color::Rgb(255, 85, 85),
            busy: Color::Rgb(255, 184, 108),
            summary: Color::Rgb(139, 233, 253),
            link: Color::Rgb(139, 233, 253),
        }
    }
}

pub fn get_config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("STUDYBUDDY_HOME") {
        return PathBuf::from(home);
    }
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".studybuddy");
    path
}

/// Writes `bytes` to `path`, readable by the owner only on unix.
pub fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)
}

pub fn load_config(dir: &Path) -> AppConfig {
    fs::create_dir_all(dir).ok();
    let path = dir.join("config.toml");

    if !path.exists() {
        let default_config = AppConfig::default();
        if let Ok(toml_str) = toml::to_string_pretty(&default_config) {
            if let Err(e) = write_private(&path, toml_str.as_bytes()) {
                tracing::warn!("Failed to write default config: {}", e);
            }
        }
        return default_config;
    }

    match fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config.toml: {}", e);
                let backup_path = path.with_extension("toml.bak");
                match fs::rename(&path, &backup_path) {
                    Ok(()) => tracing::warn!("Corrupted config backed up to {:?}", backup_path),
                    Err(backup_err) => {
                        tracing::error!("Failed to backup corrupted config: {}", backup_err)
                    }
                }
                AppConfig::default()
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file: {}. Using default.", e);
            AppConfig::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct TokenData {
    pub id_token: String,
    pub refresh_token: String,
}

/// ID/refresh token pair persisted as `token.json`.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("token.json"),
        }
    }

    pub fn load(&self) -> TokenData {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    pub fn id_token(&self) -> String {
        self.load().id_token
    }

    pub fn save(&self, id_token: &str, refresh_token: &str) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let data = TokenData {
            id_token: id_token.to_string(),
            refresh_token: refresh_token.to_string(),
        };
        let json = serde_json::to_string(&data)?;
        write_private(&self.path, json.as_bytes())
            .with_context(|| format!("Failed to save {:?}", self.path))?;
        tracing::debug!("Token saved to {:?}", self.path);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            tracing::debug!("Token file deleted");
        }
        Ok(())
    }

    /// The signed-in user, if a decodable ID token is stored.
    pub fn current_user(&self) -> Option<User> {
        let token = self.id_token();
        if token.is_empty() {
            return None;
        }
        user_from_token(&token).ok()
    }
}

/// Reads the identity claims (`sub`, `name`, `email`) of a JWT without
/// verifying it; the backend is the one that checks signatures.
pub fn user_from_token(token: &str) -> Result<User> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(anyhow!("Invalid token format"));
    }

    let decoded = URL_SAFE_NO_PAD.decode(parts[1].trim_end_matches('='))?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded)?;

    let uid = claims["sub"]
        .as_str()
        .or_else(|| claims["user_id"].as_str())
        .ok_or_else(|| anyhow!("No sub in token"))?;
    Ok(User {
        uid: uid.to_string(),
        display_name: claims["name"].as_str().map(str::to_string),
        email: claims["email"].as_str().map(str::to_string),
    })
}
