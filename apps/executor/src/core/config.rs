use std::path::{Path, PathBuf};
use std::time::Duration;

/// In-guest PID-1 supervisor injected into the kernel boot arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSystem {
    None,
    Tini,
    DumbInit,
}

impl InitSystem {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "tini" => InitSystem::Tini,
            "dumb-init" | "dumbinit" => InitSystem::DumbInit,
            "" | "none" => InitSystem::None,
            other => {
                tracing::warn!(init = %other, "unknown init supervisor, running without one");
                InitSystem::None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub bind: String,
    pub state_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub log_dir: PathBuf,
    pub bridge: String,
    pub subnet: String,
    pub gateway: String,
    pub kernel_path: String,
    pub initrd_path: Option<String>,
    /// Explicit VMM binary; when unset the executor searches PATH.
    pub firecracker_bin: Option<PathBuf>,
    pub init_system: InitSystem,
    pub socket_ready_timeout: Duration,
    pub api_call_timeout: Duration,
    pub stop_timeout: Duration,
    pub cache_retention_days: i64,
    /// Skips host-namespace side effects (bridge/TAP creation) so the engine
    /// can run on development machines without privileges.
    pub test_mode: bool,
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let root = std::env::var("EXECUTOR_ROOT").unwrap_or_else(|_| "/srv/executor".into());
        let sub = |name: &str, leaf: &str| {
            std::env::var(name)
                .map(PathBuf::from)
                .unwrap_or_else(|_| Path::new(&root).join(leaf))
        };

        ExecutorConfig {
            bind: std::env::var("EXECUTOR_BIND").unwrap_or_else(|_| "127.0.0.1:9190".into()),
            state_dir: sub("EXECUTOR_STATE_DIR", "state"),
            cache_dir: sub("EXECUTOR_CACHE_DIR", "images"),
            socket_dir: sub("EXECUTOR_SOCKET_DIR", "sockets"),
            log_dir: sub("EXECUTOR_LOG_DIR", "logs"),
            bridge: std::env::var("EXECUTOR_BRIDGE").unwrap_or_else(|_| "fcbr0".into()),
            subnet: std::env::var("EXECUTOR_SUBNET")
                .unwrap_or_else(|_| "192.168.127.0/24".into()),
            gateway: std::env::var("EXECUTOR_GATEWAY")
                .unwrap_or_else(|_| "192.168.127.1".into()),
            kernel_path: std::env::var("EXECUTOR_KERNEL")
                .unwrap_or_else(|_| format!("{root}/vmlinux.bin")),
            initrd_path: std::env::var("EXECUTOR_INITRD").ok(),
            firecracker_bin: std::env::var("EXECUTOR_FIRECRACKER_BIN")
                .ok()
                .map(PathBuf::from),
            init_system: InitSystem::parse(
                &std::env::var("EXECUTOR_INIT").unwrap_or_default(),
            ),
            socket_ready_timeout: secs_env("EXECUTOR_SOCKET_READY_TIMEOUT_SECS", 10),
            api_call_timeout: secs_env("EXECUTOR_API_TIMEOUT_SECS", 5),
            stop_timeout: secs_env("EXECUTOR_STOP_TIMEOUT_SECS", 30),
            cache_retention_days: std::env::var("EXECUTOR_CACHE_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(14),
            test_mode: matches_truthy(
                std::env::var("EXECUTOR_TEST_MODE").unwrap_or_default().trim(),
            ),
        }
    }

    pub fn socket_path(&self, task_id: &str) -> PathBuf {
        self.socket_dir.join(format!("{task_id}.sock"))
    }

    pub fn log_path(&self, task_id: &str) -> PathBuf {
        self.log_dir.join(format!("{task_id}.log"))
    }
}

fn secs_env(name: &str, default: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

fn matches_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Find an executable by name on PATH.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
