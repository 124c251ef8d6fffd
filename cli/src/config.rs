// Configuration management for the repcol CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/repcol/config.json
// - Linux: ~/.config/repcol/config.json
// - Windows: %APPDATA%\repcol\config.json

use anyhow::{Context, Result};
use repcol_core::ServerConfig;
use std::path::{Path, PathBuf};

/// Prefix for `config set user.<name> <password>`
const USER_KEY_PREFIX: &str = "user.";

/// Server configuration bound to the file it was loaded from
#[derive(Debug, Clone)]
pub struct Config {
    path: PathBuf,
    pub server: ServerConfig,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("repcol");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the default config file path
    pub fn default_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load from `path` (or the default location), creating a default file
    /// when none exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_file()?,
        };

        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let server: ServerConfig = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(Self { path, server })
        } else {
            let config = Self {
                path,
                server: ServerConfig::default(),
            };
            config.save()?;
            Ok(config)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
        }
        let contents =
            serde_json::to_string_pretty(&self.server).context("Failed to serialize config")?;
        std::fs::write(&self.path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value and save
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let server = &mut self.server;
        match key {
            "tcp_listen" => server.tcp_listen = value.to_string(),
            "http_listen" => server.http_listen = value.to_string(),
            "idle_timeout_secs" => {
                server.idle_timeout_secs = value.parse().context("Invalid number")?;
            }
            "pending_timeout_secs" => {
                server.pending_timeout_secs = value.parse().context("Invalid number")?;
            }
            "sweep_interval_secs" => {
                server.sweep_interval_secs = value.parse().context("Invalid number")?;
            }
            "request_timeout_secs" => {
                server.request_timeout_secs = value.parse().context("Invalid number")?;
            }
            "max_line_bytes" => {
                server.max_line_bytes = value.parse().context("Invalid number")?;
            }
            "http_realm" => server.http_realm = value.to_string(),
            "serial_number" => server.serial_number = optional(value),
            "registration_key" => server.registration_key = optional(value),
            "log_dir" => server.log_dir = optional(value),
            _ => match key.strip_prefix(USER_KEY_PREFIX) {
                Some(user) if !user.is_empty() => {
                    if value.is_empty() {
                        server.http_users.remove(user);
                    } else {
                        server.http_users.insert(user.to_string(), value.to_string());
                    }
                }
                _ => anyhow::bail!("Unknown config key: {}", key),
            },
        }
        self.save()?;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        let server = &self.server;
        match key {
            "tcp_listen" => Some(server.tcp_listen.clone()),
            "http_listen" => Some(server.http_listen.clone()),
            "idle_timeout_secs" => Some(server.idle_timeout_secs.to_string()),
            "pending_timeout_secs" => Some(server.pending_timeout_secs.to_string()),
            "sweep_interval_secs" => Some(server.sweep_interval_secs.to_string()),
            "request_timeout_secs" => Some(server.request_timeout_secs.to_string()),
            "max_line_bytes" => Some(server.max_line_bytes.to_string()),
            "http_realm" => Some(server.http_realm.clone()),
            "serial_number" => server.serial_number.clone(),
            "registration_key" => server.registration_key.clone(),
            "log_dir" => server.log_dir.clone(),
            _ => key
                .strip_prefix(USER_KEY_PREFIX)
                .filter(|user| server.http_users.contains_key(*user))
                .map(|_| "********".to_string()),
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let server = &self.server;
        let unset = || "(unset)".to_string();
        vec![
            ("tcp_listen".to_string(), server.tcp_listen.clone()),
            ("http_listen".to_string(), server.http_listen.clone()),
            ("idle_timeout_secs".to_string(), format!("{}s", server.idle_timeout_secs)),
            ("pending_timeout_secs".to_string(), format!("{}s", server.pending_timeout_secs)),
            ("sweep_interval_secs".to_string(), format!("{}s", server.sweep_interval_secs)),
            ("request_timeout_secs".to_string(), format!("{}s", server.request_timeout_secs)),
            ("max_line_bytes".to_string(), server.max_line_bytes.to_string()),
            ("http_realm".to_string(), server.http_realm.clone()),
            ("http_users".to_string(), server.http_users.keys().cloned().collect::<Vec<_>>().join(", ")),
            ("key_overrides".to_string(), server.key_overrides.len().to_string()),
            ("serial_number".to_string(), server.serial_number.clone().unwrap_or_else(unset)),
            ("registration_key".to_string(), server.registration_key.clone().unwrap_or_else(unset)),
            ("log_dir".to_string(), server.log_dir.clone().unwrap_or_else(unset)),
        ]
    }
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
