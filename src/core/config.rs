use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::session::{Geometry, DEFAULT_COLS, DEFAULT_ROWS};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub console: ConsoleConfig,
    pub shell: ShellConfig,
    pub directory: DirectoryConfig,
    pub passive: PassiveConfig,
}

/// Where the console lives and how its endpoints are laid out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub base_url: String,
    pub api_prefix: String,
    pub ws_path: String,
    pub token_path: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell variants an operator may request
    pub allowed: Vec<String>,
    pub default_rows: u16,
    pub default_cols: u16,
    /// Output retained per session for re-rendering, oldest bytes dropped first
    pub scrollback_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub poll_interval_secs: u64,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassiveConfig {
    pub dial_timeout_secs: u64,
    pub agents: Vec<PassiveAgentEntry>,
}

/// A passive agent registered from the config file for `passive run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassiveAgentEntry {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub retry_time: i64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            base_url: "http://localhost:8080".into(),
            api_prefix: "/api/plugins/monitor".into(),
            ws_path: "/ws".into(),
            token_path: "/token".into(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            allowed: vec!["bash".into(), "sh".into(), "zsh".into()],
            default_rows: DEFAULT_ROWS,
            default_cols: DEFAULT_COLS,
            scrollback_bytes: 1024 * 1024,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig {
            poll_interval_secs: 5,
            page_size: 20,
        }
    }
}

impl Default for PassiveConfig {
    fn default() -> Self {
        PassiveConfig {
            dial_timeout_secs: 10,
            agents: Vec::new(),
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "fleetshell", "fleetshell")
}

impl Config {
    /// Default location of `config.toml`, if the platform has a config dir
    pub fn path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load the per-user config. On first run the defaults are written out
    /// so there is a file to edit.
    pub fn load() -> Result<Self> {
        match Self::path() {
            Some(path) if path.exists() => Self::load_from(&path),
            Some(path) => {
                let config = Config::default();
                if let Err(e) = config.save_to(&path) {
                    tracing::warn!("Failed to write default config: {}", e);
                } else {
                    tracing::info!("Wrote default config to {}", path.display());
                }
                Ok(config)
            }
            None => Ok(Config::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str::<Config>(&content)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn is_shell_allowed(&self, cmd: &str) -> bool {
        self.shell.allowed.iter().any(|allowed| allowed == cmd)
    }

    pub fn default_geometry(&self) -> Geometry {
        Geometry::new(self.shell.default_rows, self.shell.default_cols)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.console.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.directory.poll_interval_secs.max(1))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.passive.dial_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[console]
base_url = "https://console.example.com"

[shell]
allowed = ["bash", "fish"]

[[passive.agents]]
name = "edge-1"
address = "10.1.0.7:4040"
retry_time = 30
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.console.base_url, "https://console.example.com");
        assert_eq!(config.console.api_prefix, "/api/plugins/monitor");
        assert!(config.is_shell_allowed("fish"));
        assert!(!config.is_shell_allowed("zsh"));
        assert_eq!(config.default_geometry(), Geometry::new(24, 80));
        assert_eq!(config.directory.page_size, 20);
        assert_eq!(config.passive.agents.len(), 1);
        assert_eq!(config.passive.agents[0].retry_time, 30);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.directory.poll_interval_secs = 15;
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }
}
