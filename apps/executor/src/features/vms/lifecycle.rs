use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cinder_types::{Task, VmRecord, VmStatus};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

use super::state::StateStore;
use super::translate::{BootSource, DriveConfig, MachineConfig, VmmConfig};
use crate::core::config::{find_in_path, ExecutorConfig};
use crate::core::error::{ExecutorError, Result};
use crate::core::fc::{LiveMachineConfig, VmmClient};

const VMM_BINARY: &str = "firecracker";
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ESCALATION_POLL_INTERVAL: Duration = Duration::from_millis(200);
const TERM_WAIT: Duration = Duration::from_secs(10);
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

/// In-memory record of one VMM child. Exclusively owned by the lifecycle
/// manager; the state store holds its durable projection.
struct VmInstance {
    pid: i32,
    socket_path: PathBuf,
    state: InstanceState,
    created_at: DateTime<Utc>,
    config: VmmConfig,
}

/// Non-blocking probe result for a task's VMM child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Running,
    Complete,
    Orphaned,
}

/// Point-in-time description of a managed instance.
pub struct InstanceDescription {
    pub state: InstanceState,
    pub pid: i32,
    pub uptime_secs: u64,
    pub vcpus: u32,
    pub memory_mib: u32,
    pub live: Option<LiveMachineConfig>,
    pub api_reachable: bool,
}

type InstanceTable = Arc<RwLock<HashMap<String, VmInstance>>>;

/// Runs one VMM child process per task, drives its control API over the
/// per-VM Unix socket and tracks it across the task lifecycle.
pub struct VmmLifecycle {
    config: Arc<ExecutorConfig>,
    store: Arc<StateStore>,
    instances: InstanceTable,
}

impl VmmLifecycle {
    pub fn new(config: Arc<ExecutorConfig>, store: Arc<StateStore>) -> Self {
        VmmLifecycle {
            config,
            store,
            instances: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawn and boot a VMM for the task. Idempotent: a second call for a
    /// task whose VMM is already up returns without side effects. Every exit
    /// path before the final commit kills the child, unlinks the socket and
    /// drops the reservation, including cancellation at any await point.
    pub async fn start(
        &self,
        task: &Task,
        vmm_config: VmmConfig,
        ip_addresses: Vec<String>,
    ) -> Result<()> {
        let socket_path = self.config.socket_path(&task.id);

        {
            let mut instances = self.instances.write().await;
            if let Some(instance) = instances.get(&task.id) {
                match instance.state {
                    InstanceState::Starting | InstanceState::Running => {
                        tracing::info!(task_id = %task.id, "vmm already started");
                        return Ok(());
                    }
                    _ => {}
                }
            }
            instances.insert(
                task.id.clone(),
                VmInstance {
                    pid: 0,
                    socket_path: socket_path.clone(),
                    state: InstanceState::Starting,
                    created_at: Utc::now(),
                    config: vmm_config.clone(),
                },
            );
        }
        let mut guard = StartGuard {
            task_id: task.id.clone(),
            pid: 0,
            socket_path: socket_path.clone(),
            instances: Arc::clone(&self.instances),
            store: Arc::clone(&self.store),
            committed: false,
        };

        let binary = self.resolve_binary()?;

        if socket_path.exists() {
            tracing::warn!(task_id = %task.id, socket = %socket_path.display(), "removing stale control socket");
            let _ = tokio::fs::remove_file(&socket_path).await;
        }
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecutorError::VmmSpawn(format!("create socket dir: {e}")))?;
        }

        let log_path = self.config.log_path(&task.id);
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ExecutorError::VmmSpawn(format!("create log dir: {e}")))?;
        }
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| ExecutorError::VmmSpawn(format!("open {}: {e}", log_path.display())))?;
        let log_file_err = log_file
            .try_clone()
            .map_err(|e| ExecutorError::VmmSpawn(format!("clone log handle: {e}")))?;

        let child = Command::new(&binary)
            .arg("--api-sock")
            .arg(&socket_path)
            .arg("--id")
            .arg(&task.id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .spawn()
            .map_err(|e| {
                ExecutorError::VmmSpawn(format!("spawn {}: {e}", binary.display()))
            })?;

        let pid_raw = child.id();
        tokio::spawn(reap(
            child,
            task.id.clone(),
            Arc::clone(&self.instances),
            Arc::clone(&self.store),
        ));
        let pid = pid_raw
            .map(|p| p as i32)
            .ok_or_else(|| ExecutorError::VmmSpawn("vmm exited before it was tracked".into()))?;
        guard.pid = pid;
        tracing::info!(task_id = %task.id, pid, socket = %socket_path.display(), "vmm child spawned");

        let client = VmmClient::new(&socket_path, self.config.api_call_timeout);
        wait_for_socket(&client, &socket_path, self.config.socket_ready_timeout).await?;

        client
            .put_machine_config(vmm_config.machine.vcpu_count, vmm_config.machine.mem_size_mib)
            .await?;
        client
            .put_boot_source(
                &vmm_config.boot.kernel_image_path,
                &vmm_config.boot.boot_args,
                vmm_config.boot.initrd_path.as_deref(),
            )
            .await?;
        for drive in &vmm_config.drives {
            client
                .put_drive(
                    &drive.drive_id,
                    &drive.path_on_host,
                    drive.is_root_device,
                    drive.is_read_only,
                )
                .await?;
        }
        for nic in &vmm_config.nics {
            client
                .put_network_interface(&nic.iface_id, &nic.host_dev_name, nic.guest_mac.as_deref())
                .await?;
        }
        client.start_instance().await?;

        let record = VmRecord {
            id: task.id.clone(),
            image: task
                .runtime
                .as_ref()
                .map(|r| r.image.clone())
                .unwrap_or_default(),
            command: task
                .runtime
                .as_ref()
                .map(|r| r.command.clone())
                .unwrap_or_default(),
            status: VmStatus::Running,
            pid,
            start_time: Utc::now(),
            vcpus: vmm_config.machine.vcpu_count,
            memory_mib: vmm_config.machine.mem_size_mib,
            kernel_path: vmm_config.boot.kernel_image_path.clone(),
            rootfs_path: vmm_config
                .drives
                .first()
                .map(|d| d.path_on_host.clone())
                .unwrap_or_default(),
            socket_path: socket_path.to_string_lossy().into_owned(),
            log_path: log_path.to_string_lossy().into_owned(),
            network_id: task.networks.first().map(|n| n.network_id.clone()),
            ip_addresses,
            last_error: None,
            error_time: None,
        };
        self.store.add(record).await?;

        {
            let mut instances = self.instances.write().await;
            if let Some(instance) = instances.get_mut(&task.id) {
                instance.pid = pid;
                instance.state = InstanceState::Running;
            }
        }
        guard.commit();

        metrics::counter!("executor_vm_starts", 1);
        tracing::info!(task_id = %task.id, pid, "vmm instance running");
        Ok(())
    }

    /// Graceful shutdown with bounded escalation: SendCtrlAltDel, then wait
    /// for socket removal or process death up to the stop timeout, then
    /// SIGTERM, then SIGKILL.
    pub async fn stop(&self, task_id: &str, timeout: Option<Duration>) -> Result<()> {
        let (pid, socket_path) = {
            let instances = self.instances.read().await;
            match instances.get(task_id) {
                Some(instance) => (instance.pid, instance.socket_path.clone()),
                None => return Err(ExecutorError::VmNotFound(task_id.to_string())),
            }
        };
        {
            let mut instances = self.instances.write().await;
            if let Some(instance) = instances.get_mut(task_id) {
                instance.state = InstanceState::Stopping;
            }
        }

        let stop_timeout = timeout.unwrap_or(self.config.stop_timeout);
        let client = VmmClient::new(&socket_path, self.config.api_call_timeout);
        match client.send_ctrl_alt_del().await {
            Ok(()) => {
                tracing::info!(task_id, "sent graceful shutdown action");
                let deadline = tokio::time::Instant::now() + stop_timeout;
                while tokio::time::Instant::now() < deadline {
                    if !socket_path.exists() || !pid_alive(pid) {
                        break;
                    }
                    tokio::time::sleep(ESCALATION_POLL_INTERVAL).await;
                }
            }
            Err(err) => {
                tracing::warn!(task_id, error = %err, "graceful shutdown failed, escalating to signals");
            }
        }

        if pid_alive(pid) {
            tracing::warn!(task_id, pid, "vmm still alive, sending SIGTERM");
            send_signal(pid, libc::SIGTERM);
            wait_for_death(pid, TERM_WAIT).await;
        }
        if pid_alive(pid) {
            tracing::warn!(task_id, pid, "vmm ignored SIGTERM, sending SIGKILL");
            send_signal(pid, libc::SIGKILL);
            wait_for_death(pid, KILL_WAIT).await;
            metrics::counter!("executor_vm_force_kills", 1);
        }

        {
            let mut instances = self.instances.write().await;
            if let Some(instance) = instances.get_mut(task_id) {
                instance.state = InstanceState::Stopped;
            }
        }
        if let Err(err) = self.store.update_status(task_id, VmStatus::Stopped).await {
            tracing::warn!(task_id, error = %err, "failed to persist stopped status");
        }
        metrics::counter!("executor_vm_stops", 1);
        tracing::info!(task_id, "vmm instance stopped");
        Ok(())
    }

    /// Snapshot probe. Never blocks; safe to call repeatedly.
    pub async fn wait(&self, task_id: &str) -> WaitStatus {
        let instances = self.instances.read().await;
        match instances.get(task_id) {
            None => WaitStatus::Orphaned,
            Some(instance) if instance.pid <= 0 => WaitStatus::Running,
            Some(instance) if pid_alive(instance.pid) => WaitStatus::Running,
            Some(_) => WaitStatus::Complete,
        }
    }

    /// Best-effort description including the live machine config when the
    /// control socket still answers. Never fails; an unreachable API is
    /// reported in the result.
    pub async fn describe(&self, task_id: &str) -> Option<InstanceDescription> {
        let (pid, socket_path, state, created_at, vcpus, memory_mib) = {
            let instances = self.instances.read().await;
            let instance = instances.get(task_id)?;
            (
                instance.pid,
                instance.socket_path.clone(),
                instance.state,
                instance.created_at,
                instance.config.machine.vcpu_count,
                instance.config.machine.mem_size_mib,
            )
        };

        let live = if socket_path.exists() {
            let client = VmmClient::new(&socket_path, self.config.api_call_timeout);
            client.get_machine_config().await.ok()
        } else {
            None
        };

        Some(InstanceDescription {
            state,
            pid,
            uptime_secs: (Utc::now() - created_at).num_seconds().max(0) as u64,
            vcpus,
            memory_mib,
            api_reachable: live.is_some(),
            live,
        })
    }

    /// Drop every trace of the task's VMM: force-kill a survivor, unlink the
    /// control socket, forget the instance and delete the state row. Best
    /// effort; always succeeds.
    pub async fn remove(&self, task_id: &str) {
        let instance = self.instances.write().await.remove(task_id);
        if let Some(instance) = instance {
            if pid_alive(instance.pid) {
                tracing::warn!(task_id, pid = instance.pid, "force killing vmm on remove");
                send_signal(instance.pid, libc::SIGKILL);
            }
        }
        let socket_path = self.config.socket_path(task_id);
        let _ = tokio::fs::remove_file(&socket_path).await;
        match self.store.remove(task_id).await {
            Ok(true) => tracing::info!(task_id, "vm state row deleted"),
            Ok(false) => {}
            Err(err) => tracing::warn!(task_id, error = %err, "failed to delete vm state row"),
        }
    }

    /// Reconcile durable records with reality after a daemon restart: a VMM
    /// process that survived is adopted back into the instance table, a
    /// record whose process is gone is marked failed and its stale socket
    /// removed.
    pub async fn recover(&self) {
        for record in self.store.list().await {
            if !matches!(record.status, VmStatus::Running | VmStatus::Starting) {
                continue;
            }
            if pid_alive(record.pid) {
                tracing::info!(task_id = %record.id, pid = record.pid, "adopting vmm that survived restart");
                let config = VmmConfig {
                    machine: MachineConfig {
                        vcpu_count: record.vcpus,
                        mem_size_mib: record.memory_mib,
                        smt: false,
                    },
                    boot: BootSource {
                        kernel_image_path: record.kernel_path.clone(),
                        boot_args: String::new(),
                        initrd_path: None,
                    },
                    drives: vec![DriveConfig {
                        drive_id: "rootfs".to_string(),
                        is_root_device: true,
                        path_on_host: record.rootfs_path.clone(),
                        is_read_only: false,
                    }],
                    nics: vec![],
                };
                self.instances.write().await.insert(
                    record.id.clone(),
                    VmInstance {
                        pid: record.pid,
                        socket_path: PathBuf::from(&record.socket_path),
                        state: InstanceState::Running,
                        created_at: record.start_time,
                        config,
                    },
                );
            } else {
                tracing::warn!(task_id = %record.id, pid = record.pid, "vmm did not survive restart");
                let _ = tokio::fs::remove_file(&record.socket_path).await;
                if let Err(err) = self
                    .store
                    .update_error(&record.id, "vmm not running after executor restart")
                    .await
                {
                    tracing::warn!(task_id = %record.id, error = %err, "failed to persist restart failure");
                }
            }
        }
    }

    fn resolve_binary(&self) -> Result<PathBuf> {
        if let Some(configured) = &self.config.firecracker_bin {
            if configured.is_file() {
                return Ok(configured.clone());
            }
            return Err(ExecutorError::VmmBinaryNotFound(format!(
                "configured path {} does not exist",
                configured.display()
            )));
        }
        find_in_path(VMM_BINARY).ok_or_else(|| {
            ExecutorError::VmmBinaryNotFound(format!("{VMM_BINARY} not found in PATH"))
        })
    }
}

/// Compensation for an uncommitted start: kills the child, unlinks the
/// socket and clears the reservation and any state row. Runs on every path
/// that leaves `start` without committing, including a dropped future.
struct StartGuard {
    task_id: String,
    pid: i32,
    socket_path: PathBuf,
    instances: InstanceTable,
    store: Arc<StateStore>,
    committed: bool,
}

impl StartGuard {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if pid_alive(self.pid) {
            send_signal(self.pid, libc::SIGKILL);
        }
        let _ = std::fs::remove_file(&self.socket_path);
        let task_id = std::mem::take(&mut self.task_id);
        let instances = Arc::clone(&self.instances);
        let store = Arc::clone(&self.store);
        tracing::warn!(task_id = %task_id, "start did not commit, rolling back vmm child and socket");
        tokio::spawn(async move {
            instances.write().await.remove(&task_id);
            if let Err(err) = store.remove(&task_id).await {
                tracing::warn!(task_id = %task_id, error = %err, "rollback failed to delete state row");
            }
        });
    }
}

/// Reaps the child when it exits so liveness probes see the death, and
/// records a crash that happened outside an orderly stop.
async fn reap(mut child: Child, task_id: String, instances: InstanceTable, store: Arc<StateStore>) {
    let exit = child.wait().await;
    match &exit {
        Ok(status) => tracing::info!(task_id = %task_id, %status, "vmm child exited"),
        Err(err) => tracing::warn!(task_id = %task_id, error = %err, "failed to reap vmm child"),
    }

    let was_running = {
        let mut map = instances.write().await;
        match map.get_mut(&task_id) {
            Some(instance) if instance.state == InstanceState::Running => {
                instance.state = InstanceState::Crashed;
                true
            }
            _ => false,
        }
    };
    if was_running {
        metrics::counter!("executor_vm_crashes", 1);
        let message = match exit {
            Ok(status) => format!("vmm exited unexpectedly: {status}"),
            Err(err) => format!("vmm exited unexpectedly: {err}"),
        };
        if let Err(err) = store.update_error(&task_id, &message).await {
            tracing::warn!(task_id = %task_id, error = %err, "failed to persist crash status");
        }
    }
}

async fn wait_for_socket(
    client: &VmmClient,
    socket_path: &std::path::Path,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if socket_path.exists() && client.ping().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ExecutorError::Timeout(format!(
                "control socket {} not ready within {timeout:?}",
                socket_path.display()
            )));
        }
        tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
    }
}

async fn wait_for_death(pid: i32, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return;
        }
        tokio::time::sleep(ESCALATION_POLL_INTERVAL).await;
    }
}

pub fn pid_alive(pid: i32) -> bool {
    pid > 0 && unsafe { libc::kill(pid, 0) == 0 }
}

fn send_signal(pid: i32, signal: libc::c_int) {
    if pid <= 0 {
        return;
    }
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        tracing::debug!(pid, signal, "kill returned an error, process likely gone");
    }
}
