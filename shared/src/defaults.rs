//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields.

// Storage and cache defaults

/// Default data directory for the SQLite store
pub fn default_data_dir() -> String {
    "./data".to_string()
}

/// Default cache backend ("memory", or a redis:// connection string)
pub fn default_cache_url() -> String {
    "memory".to_string()
}

// Host driver defaults

/// Default remote user for the container host
pub fn default_remote_user() -> String {
    "root".to_string()
}

/// Default container image for crawl tasks
pub fn default_crawler_image() -> String {
    "data-platform/crawler:latest".to_string()
}

/// Default container image for API pull tasks
pub fn default_api_image() -> String {
    "data-platform/api-worker:latest".to_string()
}

/// Default container image for database extract tasks
pub fn default_db_extract_image() -> String {
    "data-platform/db-worker:latest".to_string()
}

/// Default fixed port inside the worker container
pub fn default_container_port() -> u16 {
    8080
}

/// Default start of the host port range
pub fn default_port_range_start() -> u16 {
    50000
}

/// Default end of the host port range (inclusive)
pub fn default_port_range_end() -> u16 {
    50100
}

/// Default number of container start attempts on port collisions
pub fn default_port_allocate_attempts() -> u32 {
    5
}

/// Default auto-remove flag for finished containers
pub fn default_auto_remove_containers() -> bool {
    true
}

/// Default staging directory for per-execution config files
pub fn default_config_staging_dir() -> String {
    "/tmp/task_configs".to_string()
}

/// Default host directory mounted into db-extract containers as /app/backups
pub fn default_db_backup_dir() -> String {
    "/tmp/db_backups".to_string()
}

/// Default per-operation timeout for host driver commands (30 seconds)
pub fn default_host_op_timeout() -> u64 {
    30
}

// Liveness and scheduling defaults

/// Default callback base URL advertised to containers
pub fn default_callback_base_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

/// Default heartbeat timeout T_hb (300 seconds / 5 minutes)
pub fn default_heartbeat_timeout() -> u64 {
    300
}

/// Default number of tolerated consecutive heartbeat timeouts K_to
pub fn default_heartbeat_timeout_strikes() -> u32 {
    3
}

/// Default scheduler tick cadence (60 seconds, the finest cron granularity)
pub fn default_scheduler_interval() -> u64 {
    60
}

/// Default reconciler pass cadence (30 seconds)
pub fn default_reconciler_interval() -> u64 {
    30
}

/// Default bound on concurrent per-execution checks in one reconciler pass
pub fn default_reconciler_concurrency() -> usize {
    8
}

/// Default leader lease TTL for the scheduler (120 seconds)
pub fn default_leader_lease_ttl() -> u64 {
    120
}

/// Default age after which a pending execution is re-admitted (120 seconds)
pub fn default_admission_timeout() -> u64 {
    120
}

/// Default bound on due schedules processed per tick
pub fn default_schedule_batch_size() -> u32 {
    100
}

/// Default capacity of the admission channel into the execution engine
pub fn default_admission_channel_capacity() -> usize {
    64
}

/// Default capacity of the heartbeat store-write queue
pub fn default_heartbeat_queue_capacity() -> usize {
    256
}

// Cleanup and maintenance defaults

/// Default execution retention (30 days)
pub fn default_execution_retention_days() -> u32 {
    30
}

/// Default interval in hours between cleanup runs (24 hours)
pub fn default_cleanup_interval_hours() -> u32 {
    24
}

/// Default initial delay before the first cleanup (3600 seconds / 1 hour)
pub fn default_initial_cleanup_delay() -> u64 {
    3600
}

/// Default WAL checkpoint interval (60 seconds)
pub fn default_wal_checkpoint_interval() -> u64 {
    60
}

/// Default graceful shutdown timeout (30 seconds)
pub fn default_graceful_shutdown_timeout() -> u64 {
    30
}
