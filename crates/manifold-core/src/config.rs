// ABOUTME: Configuration loading and management for manifold
// ABOUTME: Supports TOML config files with sensible defaults

use crate::backend::{ClaudeSdkConfig, CursorCliConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database settings
    pub database: DatabaseConfig,
    /// Claude backend settings
    pub claude: ClaudeConfig,
    /// Cursor backend settings
    pub cursor: CursorConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeConfig {
    /// Path to the claude binary (defaults to "claude")
    pub binary: String,
    /// Extra system prompt appended to the agent's own
    pub system_prompt: Option<String>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Path to the cursor-agent binary (defaults to "cursor-agent")
    pub binary: String,
    /// Model used when a request does not name one
    pub default_model: Option<String>,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            binary: "cursor-agent".to_string(),
            default_model: None,
        }
    }
}

impl Config {
    /// Get the XDG config directory for manifold (~/.config/manifold)
    pub fn config_dir() -> PathBuf {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|p| p.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("manifold")
    }

    /// Get the XDG data directory for manifold (~/.local/share/manifold)
    pub fn data_dir() -> PathBuf {
        std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|p| p.join(".local").join("share"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("manifold")
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load config from XDG config directory
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        Ok(config)
    }

    /// Get the database path, using default if not configured
    pub fn db_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("manifold.db"))
    }

    /// Backend config for the Claude adapter
    pub fn claude_backend(&self) -> ClaudeSdkConfig {
        ClaudeSdkConfig {
            binary: self.claude.binary.clone(),
            system_prompt: self.claude.system_prompt.clone(),
        }
    }

    /// Backend config for the Cursor adapter
    pub fn cursor_backend(&self) -> CursorCliConfig {
        CursorCliConfig {
            binary: self.cursor.binary.clone(),
            default_model: self.cursor.default_model.clone(),
        }
    }

    /// Generate a default config file content
    pub fn default_toml() -> String {
        r#"# manifold configuration
# Location: ~/.config/manifold/config.toml

[database]
# path = "~/.local/share/manifold/manifold.db"  # Default location

[claude]
binary = "claude"
# system_prompt = "You are a coding assistant specialized in building web applications."

[cursor]
binary = "cursor-agent"
# default_model = "gpt-5"
"#
        .to_string()
    }

    /// Initialize config directory and create default config if needed
    pub fn init() -> Result<PathBuf> {
        let config_dir = Self::config_dir();
        let config_path = Self::config_path();
        let data_dir = Self::data_dir();

        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data dir: {}", data_dir.display()))?;

        if !config_path.exists() {
            std::fs::write(&config_path, Self::default_toml())
                .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
        }

        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_name_the_standard_binaries() {
        let config = Config::default();
        assert_eq!(config.claude.binary, "claude");
        assert_eq!(config.cursor.binary, "cursor-agent");
        assert!(config.database.path.is_none());
    }

    #[test]
    fn default_toml_parses_back() {
        let config: Config = toml::from_str(&Config::default_toml()).expect("template must parse");
        assert_eq!(config.claude.binary, "claude");
        assert_eq!(config.cursor.binary, "cursor-agent");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
[cursor]
default_model = "gpt-5"
"#,
        )
        .unwrap();
        assert_eq!(config.cursor.default_model.as_deref(), Some("gpt-5"));
        assert_eq!(config.cursor.binary, "cursor-agent");
        assert_eq!(config.claude.binary, "claude");
    }

    #[test]
    fn load_from_reports_missing_file() {
        let err = Config::load_from("/definitely/not/a/real/path.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn backend_configs_mirror_the_sections() {
        let config: Config = toml::from_str(
            r#"
[claude]
binary = "/opt/bin/claude"
system_prompt = "be terse"
"#,
        )
        .unwrap();
        let claude = config.claude_backend();
        assert_eq!(claude.binary, "/opt/bin/claude");
        assert_eq!(claude.system_prompt.as_deref(), Some("be terse"));
    }
}
