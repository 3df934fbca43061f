//! CLI configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/teledrive/config.toml`
//! - Windows: `%APPDATA%/teledrive/config.toml`
//!
//! The bot token may also come from the `TELEDRIVE_BOT_TOKEN` environment
//! variable, which takes precedence over the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use teledrive_session::{Credentials, LoginStrategy, SessionConfig};
use teledrive_transfer::TransferConfig;

pub const TOKEN_ENV: &str = "TELEDRIVE_BOT_TOKEN";

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bot API server (the public one unless self-hosted).
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_session")]
    pub session: SessionConfig,

    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_api_url() -> String {
    teledrive_bot_api::client::DEFAULT_BASE_URL.into()
}

fn default_session() -> SessionConfig {
    SessionConfig {
        login_strategy: LoginStrategy::DirectSecret,
        credentials: Credentials::default(),
        destination: None,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            session: default_session(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the default location), creating
    /// a default file if none exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => config_path()?,
        };

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            let config = Config::default();
            config.save(&path)?;
            tracing::info!(path = %path.display(), "created default configuration");
            config
        };

        if let Ok(token) = std::env::var(TOKEN_ENV)
            && !token.is_empty()
        {
            config.session.credentials.bot_token = Some(token);
        }
        config.transfer.validate()?;
        Ok(config)
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // The file holds the bot token.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("teledrive").join("config.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("teledrive")
            .join("config.toml"))
    }
}
