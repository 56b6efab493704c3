//! Configuration management for wfd-encoderd

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::SessionContext;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// How to launch and supervise the encoder
    #[serde(default)]
    pub encoder: EncoderSettings,

    /// Session to drive when running standalone
    #[serde(default)]
    pub session: SessionContext,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderSettings {
    /// Encoder binary, looked up in the default search path when relative
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Extra arguments for the encoder binary
    #[serde(default)]
    pub args: Vec<String>,

    /// Grace period between Stop and SIGKILL (ms)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,

    /// Pass G_MESSAGES_DEBUG=all to the encoder
    #[serde(default = "default_true")]
    pub debug_messages: bool,
}

// Default value functions
fn default_program() -> PathBuf {
    PathBuf::from("gstencoder")
}

fn default_stop_timeout() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            stop_timeout_ms: default_stop_timeout(),
            debug_messages: true,
        }
    }
}

impl EncoderSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let mut config = Config::default();
            config.config_path = Some(config_path);
            config.save()?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = match &self.config_path {
            Some(path) => path.clone(),
            None => Self::default_config_path()?,
        };

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path, if one is known
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("org", "wfd", "encoderd")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}
