//! Configuration handling for gp-connect

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const APP_DIR: &str = "gp-connect";
const CONFIG_FILENAME: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub portal: PortalSettings,
    #[serde(default)]
    pub sso: SsoSettings,
    #[serde(default)]
    pub hip: HipSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSettings {
    /// Portal host (scheme optional, https assumed)
    pub host: String,
    /// Username for direct authentication (optional, will prompt if not set)
    #[serde(default)]
    pub username: Option<String>,
    /// Client certificate: PEM file path or PKCS#11 URI
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_client_os")]
    pub client_os: String,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default = "default_client_version")]
    pub client_version: String,
}

impl Default for PortalSettings {
    fn default() -> Self {
        Self {
            host: "vpn.example.com".to_string(),
            username: None,
            certificate: None,
            user_agent: default_user_agent(),
            client_os: default_client_os(),
            os_version: None,
            client_version: default_client_version(),
        }
    }
}

/// How the SSO target is surfaced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SsoMode {
    /// Launch a local browser
    #[default]
    Browser,
    /// Print the URL for the operator to open on another machine
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsoSettings {
    #[serde(default)]
    pub mode: SsoMode,
    /// Callback listener port on 127.0.0.1, 0 picks an ephemeral port
    #[serde(default)]
    pub callback_port: u16,
    #[serde(default = "default_sso_timeout")]
    pub timeout_secs: u64,
    /// Browser command; the platform opener is used when unset
    #[serde(default)]
    pub browser: Option<String>,
}

impl Default for SsoSettings {
    fn default() -> Self {
        Self {
            mode: SsoMode::default(),
            callback_port: 0,
            timeout_secs: default_sso_timeout(),
            browser: None,
        }
    }
}

impl SsoSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HipSettings {
    /// Always submit a HIP report before requesting tunnel configuration
    #[serde(default)]
    pub required: bool,
    /// Posture wrapper script; discovered from well-known locations if unset
    #[serde(default)]
    pub wrapper: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Session store directory (default ~/.gp-connect/sessions)
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts per request on network failure (including the first)
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            base_delay_ms: default_base_delay_ms(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_user_agent() -> String {
    "PAN GlobalProtect".to_string()
}

fn default_client_os() -> String {
    "Linux".to_string()
}

fn default_client_version() -> String {
    "6.0.1-19".to_string()
}

fn default_sso_timeout() -> u64 {
    300
}

fn default_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    30
}

/// `gp-connect` directory under the user's config dir
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME")
        && !xdg.is_empty()
    {
        return Some(PathBuf::from(xdg).join(APP_DIR));
    }

    if let Ok(home) = std::env::var("HOME") {
        return Some(PathBuf::from(home).join(".config").join(APP_DIR));
    }

    dirs::config_dir().map(|dir| dir.join(APP_DIR))
}

pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(CONFIG_FILENAME))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.portal.host, "vpn.example.com");
        assert_eq!(config.portal.user_agent, "PAN GlobalProtect");
        assert_eq!(config.sso.mode, SsoMode::Browser);
        assert_eq!(config.sso.callback_port, 0);
        assert_eq!(config.sso.timeout(), Duration::from_secs(300));
        assert!(!config.hip.required);
        assert_eq!(config.retry.attempts, 3);
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.portal.certificate = Some("pkcs11:token=card;object=auth".to_string());
        config.sso.mode = SsoMode::Remote;
        config.hip.required = true;
        config.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.portal.host, config.portal.host);
        assert_eq!(loaded.portal.certificate, config.portal.certificate);
        assert_eq!(loaded.sso.mode, SsoMode::Remote);
        assert!(loaded.hip.required);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("minimal.toml");
        std::fs::write(&config_path, "[portal]\nhost = \"portal.corp.example\"\n").unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.portal.host, "portal.corp.example");
        assert_eq!(loaded.portal.client_os, "Linux");
        assert_eq!(loaded.sso.timeout_secs, 300);
        assert_eq!(loaded.retry.base_delay_ms, 500);
        assert!(loaded.session.dir.is_none());
    }

    #[test]
    fn test_sso_mode_spelling() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("remote.toml");
        std::fs::write(
            &config_path,
            "[portal]\nhost = \"p\"\n\n[sso]\nmode = \"remote\"\ncallback_port = 29999\n",
        )
        .unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.sso.mode, SsoMode::Remote);
        assert_eq!(loaded.sso.callback_port, 29999);
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid toml {{{{").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
