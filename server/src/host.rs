//! Host driver: container and file operations on the execution host
//!
//! The [`HostDriver`] trait abstracts "how to operate containers on a host"
//! behind the operations the engine and reconciler need. [`DockerHost`]
//! drives the docker CLI either locally or over SSH to a named host; the
//! interface is identical in both modes. Every operation runs under a
//! bounded deadline, and a deadline expiry is distinguishable from a
//! negative result so callers can treat it as "unknown" and retry at their
//! own cadence. The driver itself never retries.

use async_trait::async_trait;
use shared::config::{HostMode, ServerConfig};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tracing::{debug, warn};

/// Observed state of a container on the host
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerState {
    pub exists: bool,
    pub running: bool,
    pub status: String,
    pub exit_code: Option<i64>,
}

impl ContainerState {
    pub fn not_found() -> Self {
        Self {
            exists: false,
            running: false,
            status: "not_found".to_string(),
            exit_code: None,
        }
    }
}

/// Outcome of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotFound,
}

/// Everything needed to start one detached worker container
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub image: String,
    pub name: String,
    /// Staged config file on the host, mounted read-only in the container
    pub config_bind: (String, String),
    pub extra_binds: Vec<(String, String)>,
    pub env: Vec<(String, String)>,
    /// (host port, container port)
    pub port_map: (u16, u16),
    pub auto_remove: bool,
}

impl StartSpec {
    /// Docker arguments in the fixed order persisted for audit
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--hostname".to_string(),
            self.name.clone(),
        ];
        if self.auto_remove {
            args.push("--rm".to_string());
        }
        args.push("-v".to_string());
        args.push(format!("{}:{}:ro", self.config_bind.0, self.config_bind.1));
        for (host_path, container_path) in &self.extra_binds {
            args.push("-v".to_string());
            args.push(format!("{}:{}", host_path, container_path));
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("-p".to_string());
        args.push(format!("{}:{}", self.port_map.0, self.port_map.1));
        args.push(self.image.clone());
        args
    }
}

/// Errors from host driver operations
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("host operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("host command failed: {0}")]
    Command(String),
    #[error("container host unreachable: {0}")]
    Unreachable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Timeouts mean "unknown", not "negative"; callers retry on their own
    /// cadence instead of acting on them.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HostError::Timeout(_))
    }
}

/// Abstraction over container-engine and host-file operations
#[async_trait]
pub trait HostDriver: Send + Sync {
    /// Fail fast when the host cannot be reached (remote mode only)
    async fn check_connection(&self) -> Result<(), HostError>;

    /// Stage a local config file into the per-execution directory on the
    /// host; returns the path the container bind-mounts
    async fn stage_config(&self, local_path: &Path, execution_id: &str)
        -> Result<String, HostError>;

    /// Start a detached container; returns the engine-assigned id
    async fn start_container(&self, spec: &StartSpec) -> Result<String, HostError>;

    /// Stop a container by id or name; idempotent
    async fn stop_container(&self, target: &str) -> Result<StopOutcome, HostError>;

    /// Remove a container by id or name; missing containers are fine
    async fn remove_container(&self, target: &str, force: bool) -> Result<(), HostError>;

    /// Observe a container's state
    async fn inspect(&self, container_id: &str) -> Result<ContainerState, HostError>;

    /// Fetch the last `tail` log lines of a container
    async fn logs(&self, container_id: &str, tail: u32) -> Result<String, HostError>;

    /// Is any socket on the host listening on `port`?
    async fn probe_port_listening(&self, port: u16) -> Result<bool, HostError>;

    /// Host ports currently published by containers
    async fn published_ports(&self) -> Result<Vec<u16>, HostError>;

    /// Remove the staged config directory of an execution
    async fn purge_config(&self, execution_id: &str) -> Result<(), HostError>;

    /// Remove staged config directories older than `older_than`
    async fn purge_stale_configs(&self, older_than: Duration) -> Result<(), HostError>;

    /// Prune stopped containers on the host
    async fn prune_stopped_containers(&self) -> Result<(), HostError>;

    /// Render the full host command for a start spec, for audit
    fn command_line(&self, spec: &StartSpec) -> String;
}

/// Docker CLI driver, local or over SSH
pub struct DockerHost {
    mode: HostMode,
    remote_host: String,
    remote_user: String,
    staging_dir: PathBuf,
    op_timeout: Duration,
}

impl DockerHost {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            mode: config.host_mode,
            remote_host: config.remote_host.clone(),
            remote_user: config.remote_user.clone(),
            staging_dir: PathBuf::from(&config.config_staging_dir),
            op_timeout: Duration::from_secs(config.host_op_timeout_seconds),
        }
    }

    fn ssh_target(&self) -> String {
        format!("{}@{}", self.remote_user, self.remote_host)
    }

    fn is_remote(&self) -> bool {
        self.mode == HostMode::Remote
    }

    /// SSH argv prefix for remote commands
    fn ssh_prefix(&self) -> Vec<String> {
        vec![
            "ssh".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            self.ssh_target(),
        ]
    }

    /// Wrap a host command for the configured mode
    fn host_argv(&self, argv: Vec<String>) -> Vec<String> {
        if self.is_remote() {
            let mut full = self.ssh_prefix();
            full.extend(argv);
            full
        } else {
            argv
        }
    }

    fn docker_argv(&self, args: Vec<String>) -> Vec<String> {
        let mut argv = vec!["docker".to_string()];
        argv.extend(args);
        self.host_argv(argv)
    }

    /// Run an argv under the per-operation deadline
    async fn exec(&self, argv: Vec<String>) -> Result<Output, HostError> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| HostError::Command("empty command".to_string()))?;
        debug!(command = %argv.join(" "), "Running host command");
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(rest);
        let output = tokio::time::timeout(self.op_timeout, cmd.output())
            .await
            .map_err(|_| HostError::Timeout(self.op_timeout))??;
        Ok(output)
    }

    /// Run and require a zero exit status
    async fn exec_checked(&self, argv: Vec<String>) -> Result<Output, HostError> {
        let output = self.exec(argv).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(HostError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    fn execution_config_dir(&self, execution_id: &str) -> PathBuf {
        self.staging_dir.join(execution_id)
    }
}

#[async_trait]
impl HostDriver for DockerHost {
    async fn check_connection(&self) -> Result<(), HostError> {
        if !self.is_remote() {
            return Ok(());
        }

        let mut argv = self.ssh_prefix();
        argv.push("echo".to_string());
        argv.push("connection_test".to_string());
        let output = self.exec(argv).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() && stdout.contains("connection_test") {
            Ok(())
        } else {
            Err(HostError::Unreachable(format!(
                "passwordless SSH to {} is not configured; \
                 generate a key with `ssh-keygen -t rsa` and install it with \
                 `ssh-copy-id {}`",
                self.ssh_target(),
                self.ssh_target()
            )))
        }
    }

    async fn stage_config(
        &self,
        local_path: &Path,
        execution_id: &str,
    ) -> Result<String, HostError> {
        if !self.is_remote() {
            // The engine already wrote the file under the staging directory.
            return Ok(local_path.display().to_string());
        }

        self.check_connection().await?;

        let remote_dir = self.execution_config_dir(execution_id);
        let remote_dir = remote_dir.display().to_string();
        let remote_file = format!("{}/config.json", remote_dir);

        let mut mkdir = self.ssh_prefix();
        mkdir.extend(["mkdir".to_string(), "-p".to_string(), remote_dir]);
        self.exec_checked(mkdir).await?;

        let scp = vec![
            "scp".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            local_path.display().to_string(),
            format!("{}:{}", self.ssh_target(), remote_file),
        ];
        self.exec_checked(scp).await?;
        debug!(execution_id, remote_file = %remote_file, "Staged config on remote host");

        Ok(remote_file)
    }

    async fn start_container(&self, spec: &StartSpec) -> Result<String, HostError> {
        let output = self.exec(self.docker_argv(spec.command_args())).await?;
        if !output.status.success() {
            return Err(HostError::Command(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(HostError::Command(
                "docker run returned no container id".to_string(),
            ));
        }
        Ok(container_id)
    }

    async fn stop_container(&self, target: &str) -> Result<StopOutcome, HostError> {
        let argv = self.docker_argv(vec!["stop".to_string(), target.to_string()]);
        let output = self.exec(argv).await?;
        if output.status.success() {
            return Ok(StopOutcome::Stopped);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            Ok(StopOutcome::NotFound)
        } else {
            Err(HostError::Command(stderr.trim().to_string()))
        }
    }

    async fn remove_container(&self, target: &str, force: bool) -> Result<(), HostError> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(target.to_string());
        let output = self.exec(self.docker_argv(args)).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            Ok(())
        } else {
            Err(HostError::Command(stderr.trim().to_string()))
        }
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerState, HostError> {
        let argv = self.docker_argv(vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}|{{.State.ExitCode}}|{{.State.Running}}".to_string(),
            container_id.to_string(),
        ]);
        let output = self.exec(argv).await?;
        if !output.status.success() {
            return Ok(ContainerState::not_found());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parts: Vec<&str> = stdout.trim().split('|').collect();
        let status = parts.first().unwrap_or(&"unknown").to_string();
        let exit_code = parts.get(1).and_then(|c| c.parse::<i64>().ok());
        let running = parts.get(2).map(|r| *r == "true").unwrap_or(false);
        Ok(ContainerState {
            exists: true,
            running,
            status,
            exit_code,
        })
    }

    async fn logs(&self, container_id: &str, tail: u32) -> Result<String, HostError> {
        let argv = self.docker_argv(vec![
            "logs".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            container_id.to_string(),
        ]);
        let output = self.exec_checked(argv).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn probe_port_listening(&self, port: u16) -> Result<bool, HostError> {
        if !self.is_remote() {
            // A successful bind proves nothing is listening.
            return match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
                Ok(_) => Ok(false),
                Err(_) => Ok(true),
            };
        }

        // Not every host ships the same tooling; try ss, then netstat, then
        // lsof. If none of them can answer, report the port as occupied and
        // let the allocator move on.
        let scripts = [
            format!("ss -ltn | awk '{{print $4}}' | grep -E ':{}$' | wc -l", port),
            format!(
                "netstat -ltn 2>/dev/null | awk '{{print $4}}' | grep -E ':{}$' | wc -l",
                port
            ),
            format!("lsof -iTCP:{} -sTCP:LISTEN | wc -l", port),
        ];
        for script in scripts {
            let mut argv = self.ssh_prefix();
            argv.extend(["bash".to_string(), "-lc".to_string(), script]);
            let output = match self.exec(argv).await {
                Ok(output) => output,
                Err(_) => continue,
            };
            if !output.status.success() {
                continue;
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            if let Ok(count) = stdout.trim().parse::<u32>() {
                return Ok(count > 0);
            }
        }
        warn!(port, "Could not determine remote port state; treating it as occupied");
        Ok(true)
    }

    async fn published_ports(&self) -> Result<Vec<u16>, HostError> {
        let argv = self.docker_argv(vec![
            "ps".to_string(),
            "--format".to_string(),
            "{{.Ports}}".to_string(),
        ]);
        let output = self.exec_checked(argv).await?;
        Ok(parse_published_ports(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    async fn purge_config(&self, execution_id: &str) -> Result<(), HostError> {
        let dir = self.execution_config_dir(execution_id);
        if !self.is_remote() {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            let mut argv = self.ssh_prefix();
            argv.extend([
                "rm".to_string(),
                "-rf".to_string(),
                dir.display().to_string(),
            ]);
            self.exec_checked(argv).await?;
            Ok(())
        }
    }

    async fn purge_stale_configs(&self, older_than: Duration) -> Result<(), HostError> {
        if !self.is_remote() {
            let mut read_dir = match tokio::fs::read_dir(&self.staging_dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = read_dir.next_entry().await? {
                let metadata = match entry.metadata().await {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let age = metadata
                    .modified()
                    .ok()
                    .and_then(|m| m.elapsed().ok())
                    .unwrap_or_default();
                if metadata.is_dir() && age > older_than {
                    if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                        warn!(path = %entry.path().display(), error = %e, "Failed to purge stale config dir");
                    }
                }
            }
            Ok(())
        } else {
            let minutes = (older_than.as_secs() / 60).max(1);
            let mut argv = self.ssh_prefix();
            argv.extend([
                "find".to_string(),
                self.staging_dir.display().to_string(),
                "-mindepth".to_string(),
                "1".to_string(),
                "-maxdepth".to_string(),
                "1".to_string(),
                "-type".to_string(),
                "d".to_string(),
                "-mmin".to_string(),
                format!("+{}", minutes),
                "-exec".to_string(),
                "rm".to_string(),
                "-rf".to_string(),
                "{}".to_string(),
                "+".to_string(),
            ]);
            self.exec_checked(argv).await?;
            Ok(())
        }
    }

    async fn prune_stopped_containers(&self) -> Result<(), HostError> {
        let argv = self.docker_argv(vec![
            "container".to_string(),
            "prune".to_string(),
            "-f".to_string(),
        ]);
        self.exec_checked(argv).await?;
        Ok(())
    }

    fn command_line(&self, spec: &StartSpec) -> String {
        self.docker_argv(spec.command_args()).join(" ")
    }
}

/// Extract host ports from `docker ps --format {{.Ports}}` output
///
/// Lines look like `0.0.0.0:50001->8080/tcp, :::50001->8080/tcp`.
fn parse_published_ports(output: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for line in output.lines() {
        for token in line.split(',') {
            let token = token.trim();
            let Some(host_part) = token.split("->").next() else {
                continue;
            };
            if host_part == token {
                // No "->" in this token, so nothing is published here.
                continue;
            }
            if let Some(port_str) = host_part.rsplit(':').next() {
                if let Ok(port) = port_str.parse::<u16>() {
                    if !ports.contains(&port) {
                        ports.push(port);
                    }
                }
            }
        }
    }
    ports
}

#[cfg(test)]
pub mod fake {
    //! Scriptable in-memory host driver for tests

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeState {
        containers: HashMap<String, ContainerState>,
        names: HashMap<String, String>,
        listening: HashSet<u16>,
        extra_published: Vec<u16>,
        staged: HashSet<String>,
        purged: Vec<String>,
        stopped: Vec<String>,
        started: Vec<StartSpec>,
        next_id: u32,
        start_failures: Vec<String>,
    }

    /// Test double recording every interaction with the host
    #[derive(Default)]
    pub struct FakeHost {
        state: Mutex<FakeState>,
    }

    impl FakeHost {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue error messages for upcoming start attempts
        pub fn fail_next_starts(&self, message: &str, times: u32) {
            let mut state = self.state.lock().unwrap();
            for _ in 0..times {
                state.start_failures.push(message.to_string());
            }
        }

        pub fn mark_listening(&self, port: u16) {
            self.state.lock().unwrap().listening.insert(port);
        }

        pub fn add_published_port(&self, port: u16) {
            self.state.lock().unwrap().extra_published.push(port);
        }

        /// Override the observed state of a container
        pub fn set_container_state(&self, container_id: &str, container: ContainerState) {
            self.state
                .lock()
                .unwrap()
                .containers
                .insert(container_id.to_string(), container);
        }

        pub fn remove_container_record(&self, container_id: &str) {
            self.state.lock().unwrap().containers.remove(container_id);
        }

        pub fn started_specs(&self) -> Vec<StartSpec> {
            self.state.lock().unwrap().started.clone()
        }

        pub fn stopped_targets(&self) -> Vec<String> {
            self.state.lock().unwrap().stopped.clone()
        }

        pub fn purged_configs(&self) -> Vec<String> {
            self.state.lock().unwrap().purged.clone()
        }
    }

    #[async_trait]
    impl HostDriver for FakeHost {
        async fn check_connection(&self) -> Result<(), HostError> {
            Ok(())
        }

        async fn stage_config(
            &self,
            _local_path: &Path,
            execution_id: &str,
        ) -> Result<String, HostError> {
            let mut state = self.state.lock().unwrap();
            state.staged.insert(execution_id.to_string());
            Ok(format!("/fake/task_configs/{}/config.json", execution_id))
        }

        async fn start_container(&self, spec: &StartSpec) -> Result<String, HostError> {
            let mut state = self.state.lock().unwrap();
            if let Some(message) = state.start_failures.pop() {
                return Err(HostError::Command(message));
            }
            state.next_id += 1;
            let container_id = format!("cid-{}", state.next_id);
            state.containers.insert(
                container_id.clone(),
                ContainerState {
                    exists: true,
                    running: true,
                    status: "running".to_string(),
                    exit_code: None,
                },
            );
            state.names.insert(spec.name.clone(), container_id.clone());
            state.extra_published.push(spec.port_map.0);
            state.started.push(spec.clone());
            Ok(container_id)
        }

        async fn stop_container(&self, target: &str) -> Result<StopOutcome, HostError> {
            let mut state = self.state.lock().unwrap();
            state.stopped.push(target.to_string());
            let container_id = state
                .names
                .get(target)
                .cloned()
                .unwrap_or_else(|| target.to_string());
            match state.containers.get_mut(&container_id) {
                Some(container) => {
                    container.running = false;
                    container.status = "exited".to_string();
                    container.exit_code.get_or_insert(137);
                    Ok(StopOutcome::Stopped)
                }
                None => Ok(StopOutcome::NotFound),
            }
        }

        async fn remove_container(&self, target: &str, _force: bool) -> Result<(), HostError> {
            let mut state = self.state.lock().unwrap();
            let container_id = state
                .names
                .remove(target)
                .unwrap_or_else(|| target.to_string());
            state.containers.remove(&container_id);
            Ok(())
        }

        async fn inspect(&self, container_id: &str) -> Result<ContainerState, HostError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .containers
                .get(container_id)
                .cloned()
                .unwrap_or_else(ContainerState::not_found))
        }

        async fn logs(&self, _container_id: &str, _tail: u32) -> Result<String, HostError> {
            Ok(String::new())
        }

        async fn probe_port_listening(&self, port: u16) -> Result<bool, HostError> {
            let state = self.state.lock().unwrap();
            Ok(state.listening.contains(&port))
        }

        async fn published_ports(&self) -> Result<Vec<u16>, HostError> {
            let state = self.state.lock().unwrap();
            Ok(state.extra_published.clone())
        }

        async fn purge_config(&self, execution_id: &str) -> Result<(), HostError> {
            let mut state = self.state.lock().unwrap();
            state.staged.remove(execution_id);
            state.purged.push(execution_id.to_string());
            Ok(())
        }

        async fn purge_stale_configs(&self, _older_than: Duration) -> Result<(), HostError> {
            Ok(())
        }

        async fn prune_stopped_containers(&self) -> Result<(), HostError> {
            Ok(())
        }

        fn command_line(&self, spec: &StartSpec) -> String {
            let mut parts = vec!["docker".to_string()];
            parts.extend(spec.command_args());
            parts.join(" ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> StartSpec {
        StartSpec {
            image: "data-platform/crawler:latest".to_string(),
            name: "task-e1".to_string(),
            config_bind: (
                "/tmp/task_configs/e1/config.json".to_string(),
                "/app/config.json".to_string(),
            ),
            extra_binds: vec![],
            env: vec![
                ("TASK_EXECUTION_ID".to_string(), "e1".to_string()),
                ("CONFIG_PATH".to_string(), "/app/config.json".to_string()),
                (
                    "API_BASE_URL".to_string(),
                    "http://127.0.0.1:8787".to_string(),
                ),
            ],
            port_map: (50001, 8080),
            auto_remove: true,
        }
    }

    #[test]
    fn test_start_spec_command_ordering() {
        let args = sample_spec().command_args();
        let rendered = args.join(" ");
        assert_eq!(
            rendered,
            "run -d --name task-e1 --hostname task-e1 --rm \
             -v /tmp/task_configs/e1/config.json:/app/config.json:ro \
             -e TASK_EXECUTION_ID=e1 -e CONFIG_PATH=/app/config.json \
             -e API_BASE_URL=http://127.0.0.1:8787 \
             -p 50001:8080 data-platform/crawler:latest"
        );
    }

    #[test]
    fn test_start_spec_without_auto_remove_or_with_extras() {
        let mut spec = sample_spec();
        spec.auto_remove = false;
        spec.extra_binds = vec![("/tmp/db_backups".to_string(), "/app/backups".to_string())];
        let rendered = spec.command_args().join(" ");
        assert!(!rendered.contains("--rm"));
        assert!(rendered.contains("-v /tmp/db_backups:/app/backups"));
    }

    #[test]
    fn test_parse_published_ports() {
        let output = "0.0.0.0:50001->8080/tcp, :::50001->8080/tcp\n\
                      0.0.0.0:50002->8080/tcp\n\
                      \n\
                      9090/tcp\n";
        assert_eq!(parse_published_ports(output), vec![50001, 50002]);
    }

    #[test]
    fn test_parse_published_ports_ignores_unpublished() {
        assert!(parse_published_ports("8080/tcp\n").is_empty());
        assert!(parse_published_ports("").is_empty());
    }
}
