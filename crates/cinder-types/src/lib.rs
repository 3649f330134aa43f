use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Annotation key the image preparer fills with the absolute path of the
/// prepared root block image. Reserved; orchestrators must not set it.
pub const ROOTFS_ANNOTATION: &str = "rootfs";

/// A container-shaped task description handed to a node by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub service_id: String,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<ContainerSpec>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    /// Dynamic key/value hand-offs between components. A missing map is
    /// allocated by the executor before the first component touches it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Task {
    /// Path of the prepared rootfs image, once the preparer has run.
    pub fn rootfs(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(ROOTFS_ANNOTATION))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// OCI image reference: `name[:tag][@digest]`, optionally prefixed with
    /// `registry[:port]/`. Tag defaults to `latest`.
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Resources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservations: Option<Resources>,
}

/// Resource quantities in orchestrator units: 1 vCPU = 1e9 nano CPUs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub nano_cpus: i64,
    #[serde(default)]
    pub memory_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub network_id: String,
    /// Host bridge to attach the TAP to; the node default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
}

/// Task lifecycle states reported back to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    New,
    Pending,
    Assigned,
    Accepted,
    Preparing,
    Starting,
    Running,
    Complete,
    Failed,
    Rejected,
    Remove,
    Orphaned,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::Accepted => "accepted",
            TaskState::Preparing => "preparing",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Complete => "complete",
            TaskState::Failed => "failed",
            TaskState::Rejected => "rejected",
            TaskState::Remove => "remove",
            TaskState::Orphaned => "orphaned",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status snapshot for one task, as observed on the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_vcpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_mem_mib: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TaskStatus {
    pub fn new(state: TaskState) -> Self {
        TaskStatus {
            state,
            pid: None,
            uptime_secs: None,
            vm_id: None,
            live_vcpus: None,
            live_mem_mib: None,
            message: None,
            last_error: None,
        }
    }

    pub fn with_message(state: TaskState, message: impl Into<String>) -> Self {
        let mut status = Self::new(state);
        status.message = Some(message.into());
        status
    }
}

/// Durable status of a microVM as persisted by the node state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmStatus::Starting => "starting",
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Persisted record of one microVM, the durable projection of the in-memory
/// instance owned by the lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    pub status: VmStatus,
    pub pid: i32,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub vcpus: u32,
    pub memory_mib: u32,
    pub kernel_path: String,
    pub rootfs_path: String,
    pub socket_path: String,
    pub log_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_time: Option<chrono::DateTime<chrono::Utc>>,
}
