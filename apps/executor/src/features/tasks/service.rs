use std::collections::HashMap;
use std::time::Duration;

use cinder_types::{Task, TaskState, TaskStatus, VmStatus};

use crate::core::error::{ExecutorError, Result};
use crate::features::vms::lifecycle::{InstanceState, WaitStatus};
use crate::features::vms::translate;
use crate::AppState;

/// Reject tasks the engine cannot possibly run. Anything else is attempted
/// and fails with a more specific kind downstream.
pub fn validate(task: &Task) -> Result<()> {
    if task.id.trim().is_empty() {
        return Err(ExecutorError::InvalidTask("task id is empty".into()));
    }
    let runtime = task.runtime.as_ref().ok_or_else(|| {
        ExecutorError::InvalidTask(format!("task {} has no container runtime", task.id))
    })?;
    if runtime.image.trim().is_empty() {
        return Err(ExecutorError::InvalidTask(format!(
            "task {} has an empty image reference",
            task.id
        )));
    }
    Ok(())
}

/// Prepare the task: resolve or build the root image and create the TAP
/// devices. On success `annotations["rootfs"]` points at the block image.
pub async fn prepare(st: &AppState, task: &mut Task) -> Result<TaskStatus> {
    validate(task)?;
    if task.annotations.is_none() {
        task.annotations = Some(HashMap::new());
    }

    st.images.prepare(task).await?;
    st.network.prepare(task).await?;

    metrics::counter!("executor_task_prepares", 1);
    tracing::info!(task_id = %task.id, rootfs = ?task.rootfs(), "task prepared");
    Ok(TaskStatus::with_message(
        TaskState::Preparing,
        "rootfs and network attachments ready",
    ))
}

/// Boot the prepared task. Idempotent: a task whose VMM is already up
/// reports running without side effects. A failure (or a caller that went
/// away mid-flight) tears down everything attributable to the task.
pub async fn start(st: &AppState, task: &Task) -> Result<TaskStatus> {
    validate(task)?;

    if let Some(desc) = st.lifecycle.describe(&task.id).await {
        if matches!(desc.state, InstanceState::Starting | InstanceState::Running) {
            tracing::info!(task_id = %task.id, "start is a no-op, vmm already up");
            return Ok(describe(st, &task.id).await);
        }
    }

    let vmm_config = translate::translate(task, &st.config)?;

    let mut rollback = StartRollback {
        state: st.clone(),
        task_id: task.id.clone(),
        armed: true,
    };
    let ip_addresses = st.network.addresses_for(&task.id).await;
    match st.lifecycle.start(task, vmm_config, ip_addresses).await {
        Ok(()) => {
            rollback.armed = false;
            Ok(describe(st, &task.id).await)
        }
        Err(err) => {
            rollback.armed = false;
            tracing::error!(task_id = %task.id, error = %err, "start failed, compensating");
            compensate(st, &task.id).await;
            Err(err)
        }
    }
}

/// Non-blocking exit probe; a snapshot, not a blocking join.
pub async fn wait(st: &AppState, task_id: &str) -> TaskStatus {
    match st.lifecycle.wait(task_id).await {
        WaitStatus::Running => TaskStatus::new(TaskState::Running),
        WaitStatus::Complete => TaskStatus::new(TaskState::Complete),
        WaitStatus::Orphaned => TaskStatus::with_message(
            TaskState::Orphaned,
            "vm not tracked on this node",
        ),
    }
}

pub async fn stop(st: &AppState, task_id: &str, timeout: Option<Duration>) -> Result<TaskStatus> {
    st.lifecycle.stop(task_id, timeout).await?;
    Ok(TaskStatus::with_message(TaskState::Complete, "vmm stopped"))
}

/// Tear down everything the task left on the node. Best effort: sub-steps
/// log failures and the operation still reports success once the state row
/// is gone.
pub async fn remove(st: &AppState, task_id: &str) -> TaskStatus {
    st.lifecycle.remove(task_id).await;
    st.network.cleanup(task_id).await;
    metrics::counter!("executor_task_removes", 1);
    TaskStatus::with_message(TaskState::Remove, "task removed from node")
}

/// Status snapshot merging the live instance view with the durable record.
/// Never fails; an unreachable control API is reported in the body.
pub async fn describe(st: &AppState, task_id: &str) -> TaskStatus {
    if let Some(desc) = st.lifecycle.describe(task_id).await {
        let state = match desc.state {
            InstanceState::Starting => TaskState::Starting,
            InstanceState::Running | InstanceState::Stopping => TaskState::Running,
            InstanceState::Stopped => TaskState::Complete,
            InstanceState::Crashed => TaskState::Failed,
        };
        let mut status = TaskStatus::new(state);
        status.vm_id = Some(task_id.to_string());
        status.pid = (desc.pid > 0).then_some(desc.pid);
        status.uptime_secs = Some(desc.uptime_secs);
        match desc.live {
            Some(live) => {
                status.live_vcpus = Some(live.vcpu_count);
                status.live_mem_mib = Some(live.mem_size_mib);
            }
            None => {
                status.live_vcpus = Some(desc.vcpus);
                status.live_mem_mib = Some(desc.memory_mib);
                if desc.state == InstanceState::Running && !desc.api_reachable {
                    status.message = Some("control api unreachable".into());
                }
            }
        }
        return status;
    }

    match st.store.get(task_id).await {
        Some(record) => {
            let mut status = match record.status {
                VmStatus::Starting => TaskStatus::new(TaskState::Starting),
                VmStatus::Running => TaskStatus::with_message(
                    TaskState::Orphaned,
                    "recorded running but not tracked on this node",
                ),
                VmStatus::Stopped => TaskStatus::new(TaskState::Complete),
                VmStatus::Error => TaskStatus::new(TaskState::Failed),
            };
            status.vm_id = Some(record.id);
            status.last_error = record.last_error;
            status
        }
        None => TaskStatus::with_message(TaskState::Orphaned, "unknown task"),
    }
}

/// Tail of the VMM stdio capture for the task.
pub async fn logs(st: &AppState, task_id: &str, tail: usize) -> Result<String> {
    let log_path = match st.store.get(task_id).await {
        Some(record) => std::path::PathBuf::from(record.log_path),
        None => st.store.log_dir().join(format!("{task_id}.log")),
    };
    let bytes = tokio::fs::read(&log_path)
        .await
        .map_err(|_| ExecutorError::VmNotFound(format!("no log capture for task {task_id}")))?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(tail);
    Ok(lines[start..].join("\n"))
}

async fn compensate(st: &AppState, task_id: &str) {
    st.lifecycle.remove(task_id).await;
    st.network.cleanup(task_id).await;
}

/// Rolls back a start whose caller disappeared mid-flight: when the future
/// driving `start` is dropped between suspension points, the drop spawns the
/// same compensation an explicit failure runs inline.
struct StartRollback {
    state: AppState,
    task_id: String,
    armed: bool,
}

impl Drop for StartRollback {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let state = self.state.clone();
        let task_id = std::mem::take(&mut self.task_id);
        tracing::warn!(task_id = %task_id, "start interrupted, compensating in background");
        tokio::spawn(async move {
            compensate(&state, &task_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_types::ContainerSpec;

    fn container_task(id: &str, image: &str) -> Task {
        Task {
            id: id.to_string(),
            service_id: "svc".into(),
            node_id: "node".into(),
            runtime: Some(ContainerSpec {
                image: image.to_string(),
                command: vec![],
                args: vec![],
                env: vec![],
                mounts: vec![],
            }),
            resources: Default::default(),
            networks: vec![],
            annotations: None,
        }
    }

    #[test]
    fn rejects_tasks_without_a_runtime() {
        let mut task = container_task("t1", "alpine");
        task.runtime = None;
        assert!(matches!(
            validate(&task),
            Err(ExecutorError::InvalidTask(_))
        ));
    }

    #[test]
    fn rejects_empty_image_and_id() {
        assert!(matches!(
            validate(&container_task("t1", "")),
            Err(ExecutorError::InvalidTask(_))
        ));
        assert!(matches!(
            validate(&container_task("  ", "alpine")),
            Err(ExecutorError::InvalidTask(_))
        ));
    }

    #[test]
    fn accepts_a_minimal_container_task() {
        assert!(validate(&container_task("t1", "alpine:latest")).is_ok());
    }

    use crate::core::config::ExecutorConfig;
    use crate::features::images::ImagePreparer;
    use crate::features::network::NetworkManager;
    use crate::features::vms::lifecycle::VmmLifecycle;
    use crate::features::vms::state::StateStore;
    use cinder_types::NetworkAttachment;
    use std::path::PathBuf;
    use std::sync::Arc;

    /// A full engine wired against temp directories, test-mode networking
    /// and a VMM binary path that cannot resolve.
    async fn node(tmp: &std::path::Path) -> AppState {
        std::env::set_var("EXECUTOR_TEST_MODE", "1");
        let mut config = ExecutorConfig::from_env();
        config.state_dir = tmp.join("state");
        config.cache_dir = tmp.join("images");
        config.socket_dir = tmp.join("sockets");
        config.log_dir = tmp.join("logs");
        config.firecracker_bin = Some(PathBuf::from("/nonexistent/firecracker"));
        for dir in [
            &config.state_dir,
            &config.cache_dir,
            &config.socket_dir,
            &config.log_dir,
        ] {
            tokio::fs::create_dir_all(dir).await.unwrap();
        }
        let config = Arc::new(config);
        let store = Arc::new(StateStore::open(&config.state_dir, &config.log_dir).await);
        AppState {
            images: Arc::new(ImagePreparer::new(Arc::clone(&config))),
            network: Arc::new(NetworkManager::new(Arc::clone(&config)).unwrap()),
            lifecycle: Arc::new(VmmLifecycle::new(Arc::clone(&config), Arc::clone(&store))),
            store,
            config,
        }
    }

    fn networked_task(id: &str) -> Task {
        let mut task = container_task(id, "alpine:latest");
        task.networks = vec![NetworkAttachment {
            network_id: "net-0".into(),
            bridge: None,
        }];
        task
    }

    #[tokio::test]
    async fn prepare_resolves_rootfs_and_networks() {
        let tmp = tempfile::tempdir().unwrap();
        let st = node(tmp.path()).await;
        let cached = st.config.cache_dir.join("alpine-latest.ext4");
        tokio::fs::write(&cached, b"ext4").await.unwrap();

        let mut task = networked_task("t1");
        let status = prepare(&st, &mut task).await.unwrap();
        assert_eq!(status.state, TaskState::Preparing);
        assert_eq!(task.rootfs(), cached.to_str());
        assert_eq!(st.network.addresses_for("t1").await.len(), 1);

        // Preparing twice keeps the same attachments.
        prepare(&st, &mut task).await.unwrap();
        assert_eq!(st.network.addresses_for("t1").await.len(), 1);
    }

    #[tokio::test]
    async fn failed_start_leaves_no_trace() {
        let tmp = tempfile::tempdir().unwrap();
        let st = node(tmp.path()).await;
        tokio::fs::write(st.config.cache_dir.join("alpine-latest.ext4"), b"ext4")
            .await
            .unwrap();

        let mut task = networked_task("t1");
        prepare(&st, &mut task).await.unwrap();
        let err = start(&st, &task).await.unwrap_err();
        assert!(matches!(err, ExecutorError::VmmBinaryNotFound(_)));

        assert!(st.store.get("t1").await.is_none());
        assert!(st.network.addresses_for("t1").await.is_empty());
        assert!(!st.config.socket_path("t1").exists());
    }

    #[tokio::test]
    async fn unknown_tasks_report_orphaned_and_remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let st = node(tmp.path()).await;

        assert_eq!(wait(&st, "ghost").await.state, TaskState::Orphaned);
        assert_eq!(describe(&st, "ghost").await.state, TaskState::Orphaned);
        assert_eq!(remove(&st, "ghost").await.state, TaskState::Remove);
        assert_eq!(remove(&st, "ghost").await.state, TaskState::Remove);
    }

    #[tokio::test]
    async fn describe_falls_back_to_the_durable_record() {
        let tmp = tempfile::tempdir().unwrap();
        let st = node(tmp.path()).await;
        st.store
            .add(cinder_types::VmRecord {
                id: "t1".into(),
                image: "alpine:latest".into(),
                command: vec![],
                status: VmStatus::Stopped,
                pid: 1234,
                start_time: chrono::Utc::now(),
                vcpus: 1,
                memory_mib: 512,
                kernel_path: "/k".into(),
                rootfs_path: "/r".into(),
                socket_path: "/s".into(),
                log_path: "/l".into(),
                network_id: None,
                ip_addresses: vec![],
                last_error: None,
                error_time: None,
            })
            .await
            .unwrap();

        let status = describe(&st, "t1").await;
        assert_eq!(status.state, TaskState::Complete);
        assert_eq!(status.vm_id.as_deref(), Some("t1"));
    }
}
