//! Configuration types and validation for the task orchestrator
//!
//! The control plane is configured from a single `server.toml`; only the
//! listen address and API key are mandatory, everything else carries a
//! default from [`crate::defaults`].

use crate::defaults::*;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Where containers are run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostMode {
    /// The container engine runs on this machine
    Local,
    /// The container engine runs on a named host reached over SSH
    Remote,
}

impl Default for HostMode {
    fn default() -> Self {
        HostMode::Local
    }
}

/// Main server configuration loaded from server.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address and port to bind the API server to
    pub listen_address: String,
    /// Pre-shared secret key for control API authentication
    pub api_key: String,

    // Storage and cache
    /// Directory holding the SQLite store
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Cache backend: "memory" or a redis:// connection string
    #[serde(default = "default_cache_url")]
    pub cache_url: String,

    // Host driver
    /// Whether containers run locally or on a remote host
    #[serde(default)]
    pub host_mode: HostMode,
    /// Remote container host address (required in remote mode)
    #[serde(default)]
    pub remote_host: String,
    /// SSH user on the remote container host
    #[serde(default = "default_remote_user")]
    pub remote_user: String,
    /// Container image used for container-crawl tasks
    #[serde(default = "default_crawler_image")]
    pub crawler_image: String,
    /// Container image used for api-pull tasks
    #[serde(default = "default_api_image")]
    pub api_image: String,
    /// Container image used for db-extract tasks
    #[serde(default = "default_db_extract_image")]
    pub db_extract_image: String,
    /// Fixed port the worker listens on inside the container
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    /// First host port available to executions
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// Last host port available to executions (inclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// Container start attempts before giving up on port collisions
    #[serde(default = "default_port_allocate_attempts")]
    pub port_allocate_attempts: u32,
    /// Pass --rm so the engine removes containers on exit
    #[serde(default = "default_auto_remove_containers")]
    pub auto_remove_containers: bool,
    /// Directory (local and on the host) for staged per-execution configs
    #[serde(default = "default_config_staging_dir")]
    pub config_staging_dir: String,
    /// Host directory mounted into db-extract containers as /app/backups
    #[serde(default = "default_db_backup_dir")]
    pub db_backup_dir: String,
    /// Per-operation timeout for host driver commands in seconds
    #[serde(default = "default_host_op_timeout")]
    pub host_op_timeout_seconds: u64,

    // Liveness and scheduling
    /// Base URL containers use to reach the callback endpoints
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    /// Heartbeat timeout T_hb in seconds (default: 300)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,
    /// Consecutive heartbeat timeouts tolerated before declaring loss (default: 3)
    #[serde(default = "default_heartbeat_timeout_strikes")]
    pub heartbeat_timeout_strikes: u32,
    /// Scheduler tick cadence in seconds (default: 60)
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_seconds: u64,
    /// Reconciler pass cadence in seconds (default: 30)
    #[serde(default = "default_reconciler_interval")]
    pub reconciler_interval_seconds: u64,
    /// Bound on concurrent per-execution checks in one reconciler pass
    #[serde(default = "default_reconciler_concurrency")]
    pub reconciler_concurrency: usize,
    /// Scheduler leader lease TTL in seconds (default: 120)
    #[serde(default = "default_leader_lease_ttl")]
    pub leader_lease_ttl_seconds: u64,
    /// Age in seconds after which a pending execution is re-admitted
    #[serde(default = "default_admission_timeout")]
    pub admission_timeout_seconds: u64,
    /// Bound on due schedules processed per scheduler tick
    #[serde(default = "default_schedule_batch_size")]
    pub schedule_batch_size: u32,
    /// Capacity of the admission channel into the execution engine
    #[serde(default = "default_admission_channel_capacity")]
    pub admission_channel_capacity: usize,
    /// Capacity of the heartbeat store-write queue
    #[serde(default = "default_heartbeat_queue_capacity")]
    pub heartbeat_queue_capacity: usize,

    // Cleanup and maintenance
    /// Days to retain terminal executions before soft-deleting them
    #[serde(default = "default_execution_retention_days")]
    pub execution_retention_days: u32,
    /// Interval in hours between cleanup runs (default: 24)
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u32,
    /// Initial delay before the first cleanup in seconds (default: 3600)
    #[serde(default = "default_initial_cleanup_delay")]
    pub initial_cleanup_delay_seconds: u64,
    /// WAL checkpoint interval in seconds (default: 60)
    #[serde(default = "default_wal_checkpoint_interval")]
    pub wal_checkpoint_interval_seconds: u64,
    /// Graceful shutdown timeout in seconds (default: 30)
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_seconds: u64,
}

impl ServerConfig {
    /// Validate the server configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.listen_address.parse::<SocketAddr>().map_err(|e| {
            crate::OrchestratorError::Validation(format!(
                "Invalid listen address '{}': {}",
                self.listen_address, e
            ))
        })?;

        if self.api_key.is_empty() {
            return Err(
                crate::OrchestratorError::Validation("api_key cannot be empty".to_string()).into(),
            );
        }

        if self.port_range_start > self.port_range_end {
            return Err(crate::OrchestratorError::Validation(format!(
                "Invalid port range: {} > {}",
                self.port_range_start, self.port_range_end
            ))
            .into());
        }

        if self.host_mode == HostMode::Remote && self.remote_host.is_empty() {
            return Err(crate::OrchestratorError::Validation(
                "remote_host is required when host_mode is \"remote\"".to_string(),
            )
            .into());
        }

        if self.heartbeat_timeout_seconds == 0 {
            return Err(crate::OrchestratorError::Validation(
                "heartbeat_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.heartbeat_timeout_strikes == 0 {
            return Err(crate::OrchestratorError::Validation(
                "heartbeat_timeout_strikes must be greater than 0".to_string(),
            )
            .into());
        }

        if self.scheduler_interval_seconds == 0 || self.reconciler_interval_seconds == 0 {
            return Err(crate::OrchestratorError::Validation(
                "scheduler and reconciler intervals must be greater than 0".to_string(),
            )
            .into());
        }

        if self.cache_url != "memory" && !self.cache_url.starts_with("redis://") {
            return Err(crate::OrchestratorError::Validation(format!(
                "Unrecognised cache_url '{}': expected \"memory\" or a redis:// URL",
                self.cache_url
            ))
            .into());
        }

        Ok(())
    }

    /// Address of the machine containers run on, used to build access URLs
    pub fn container_host_address(&self) -> &str {
        match self.host_mode {
            HostMode::Local => "127.0.0.1",
            HostMode::Remote => &self.remote_host,
        }
    }

    /// Container image for a task type
    pub fn image_for(&self, task_type: crate::model::TaskType) -> &str {
        match task_type {
            crate::model::TaskType::ContainerCrawl => &self.crawler_image,
            crate::model::TaskType::ApiPull => &self.api_image,
            crate::model::TaskType::DbExtract => &self.db_extract_image,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
listen_address = "127.0.0.1:8787"
api_key = "test-api-key"
"#
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: ServerConfig = toml::from_str(minimal_toml()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.host_mode, HostMode::Local);
        assert_eq!(config.port_range_start, 50000);
        assert_eq!(config.port_range_end, 50100);
        assert_eq!(config.heartbeat_timeout_seconds, 300);
        assert_eq!(config.heartbeat_timeout_strikes, 3);
        assert_eq!(config.scheduler_interval_seconds, 60);
        assert_eq!(config.reconciler_interval_seconds, 30);
        assert_eq!(config.cache_url, "memory");
        assert!(config.auto_remove_containers);
    }

    #[test]
    fn test_remote_mode_requires_host() {
        let toml_str = r#"
listen_address = "127.0.0.1:8787"
api_key = "k"
host_mode = "remote"
"#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_listen_address_rejected() {
        let toml_str = r#"
listen_address = "not-an-address"
api_key = "k"
"#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let toml_str = r#"
listen_address = "127.0.0.1:8787"
api_key = "k"
port_range_start = 50010
port_range_end = 50000
"#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_cache_url_rejected() {
        let toml_str = r#"
listen_address = "127.0.0.1:8787"
api_key = "k"
cache_url = "memcached://localhost"
"#;
        let config: ServerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_image_per_task_type() {
        let config: ServerConfig = toml::from_str(minimal_toml()).unwrap();
        assert!(config
            .image_for(crate::model::TaskType::ContainerCrawl)
            .contains("crawler"));
        assert!(config
            .image_for(crate::model::TaskType::DbExtract)
            .contains("db-worker"));
    }
}
