//! Server configuration loading and command-line overrides

use anyhow::{Context, Result};
use shared::config::ServerConfig;
use std::path::PathBuf;
use tracing::info;

/// Loads `server.toml`, validates it, and persists command-line overrides
/// back to disk so they survive restarts.
pub struct ConfigManager {
    config_path: PathBuf,
    pub server_config: Option<ServerConfig>,
}

impl ConfigManager {
    /// Accepts either the config file itself or a directory containing
    /// `server.toml`.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_path = if config_path.is_dir() {
            config_path.join("server.toml")
        } else {
            config_path
        };

        let mut manager = Self {
            config_path,
            server_config: None,
        };
        manager.load()?;
        Ok(manager)
    }

    fn load(&mut self) -> Result<()> {
        let content = std::fs::read_to_string(&self.config_path).with_context(|| {
            format!(
                "Failed to read configuration file: {}",
                self.config_path.display()
            )
        })?;

        let config: ServerConfig = toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse configuration file: {}",
                self.config_path.display()
            )
        })?;
        config.validate().context("Invalid server configuration")?;

        self.server_config = Some(config);
        Ok(())
    }

    /// Apply command-line overrides; persists and returns true when
    /// anything actually changed.
    pub fn override_and_persist_config(
        &mut self,
        listen_address: Option<String>,
        api_key: Option<String>,
        data_dir: Option<String>,
        cache_url: Option<String>,
    ) -> Result<bool> {
        let mut config = self
            .server_config
            .clone()
            .context("Server configuration not loaded")?;

        let mut changed = false;
        if let Some(listen_address) = listen_address {
            if config.listen_address != listen_address {
                config.listen_address = listen_address;
                changed = true;
            }
        }
        if let Some(api_key) = api_key {
            if config.api_key != api_key {
                config.api_key = api_key;
                changed = true;
            }
        }
        if let Some(data_dir) = data_dir {
            if config.data_dir != data_dir {
                config.data_dir = data_dir;
                changed = true;
            }
        }
        if let Some(cache_url) = cache_url {
            if config.cache_url != cache_url {
                config.cache_url = cache_url;
                changed = true;
            }
        }

        if !changed {
            return Ok(false);
        }

        config.validate().context("Invalid configuration after overrides")?;

        let serialized =
            toml::to_string_pretty(&config).context("Failed to serialize configuration")?;
        std::fs::write(&self.config_path, serialized).with_context(|| {
            format!(
                "Failed to persist configuration: {}",
                self.config_path.display()
            )
        })?;
        info!(
            config_file = %self.config_path.display(),
            "Persisted configuration overrides"
        );

        self.server_config = Some(config);
        Ok(true)
    }
}
