use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use cinder_types::Task;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::core::config::ExecutorConfig;
use crate::core::error::{ExecutorError, NetworkStage, Result};
use crate::core::ipalloc::IpAllocator;
use crate::core::net;

/// Host-side TAP device backing one network attachment of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TapDevice {
    pub name: String,
    pub bridge: String,
    pub ip: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
}

/// Creates and tears down the per-task TAP devices and their addresses.
/// Bridge creation happens once per process on first demand; a bridge that
/// ops tooling already provisioned is used as-is and never destroyed.
pub struct NetworkManager {
    config: Arc<ExecutorConfig>,
    allocator: IpAllocator,
    taps: RwLock<HashMap<String, Vec<TapDevice>>>,
    bridges_seen: RwLock<HashSet<String>>,
}

impl NetworkManager {
    pub fn new(config: Arc<ExecutorConfig>) -> Result<Self> {
        let allocator = IpAllocator::new(&config.subnet, &config.gateway)
            .map_err(|e| ExecutorError::network_prepare(NetworkStage::Allocator, e))?;
        Ok(NetworkManager {
            config,
            allocator,
            taps: RwLock::new(HashMap::new()),
            bridges_seen: RwLock::new(HashSet::new()),
        })
    }

    /// Create one TAP per attachment, attach it to the bridge and allocate a
    /// deterministic address. A failure rolls back the devices and addresses
    /// already created for this task.
    pub async fn prepare(&self, task: &Task) -> Result<Vec<TapDevice>> {
        if let Some(existing) = self.taps.read().await.get(&task.id) {
            tracing::info!(task_id = %task.id, "network attachments already prepared");
            return Ok(existing.clone());
        }

        let mut created: Vec<TapDevice> = Vec::new();

        for (index, attachment) in task.networks.iter().enumerate() {
            let bridge = attachment
                .bridge
                .clone()
                .unwrap_or_else(|| self.config.bridge.clone());
            if bridge.is_empty() {
                self.rollback(&task.id, &created).await;
                return Err(ExecutorError::NetworkPrepare {
                    stage: NetworkStage::Bridge,
                    message: format!(
                        "no bridge configured for attachment {} of task {}",
                        attachment.network_id, task.id
                    ),
                });
            }

            if let Err(err) = self.ensure_bridge_once(&bridge).await {
                self.rollback(&task.id, &created).await;
                return Err(err);
            }

            let name = net::tap_name(&task.id, index);
            if let Err(err) = net::create_tap(&name, &bridge, self.config.test_mode).await {
                self.rollback(&task.id, &created).await;
                return Err(ExecutorError::network_prepare(NetworkStage::Tap, err));
            }

            let ip = match self.allocator.allocate(&format!("{}-eth{index}", task.id)).await {
                Ok(ip) => ip,
                Err(err) => {
                    let _ = net::delete_tap(&name, self.config.test_mode).await;
                    self.rollback(&task.id, &created).await;
                    return Err(ExecutorError::network_prepare(NetworkStage::Allocator, err));
                }
            };

            tracing::info!(
                task_id = %task.id,
                tap = %name,
                bridge = %bridge,
                ip = %ip,
                "tap device ready"
            );
            created.push(TapDevice {
                name,
                bridge,
                ip: Some(ip),
                netmask: Some(self.allocator.netmask()),
            });
        }

        self.taps
            .write()
            .await
            .insert(task.id.clone(), created.clone());
        Ok(created)
    }

    /// Remove every TAP recorded for the task and release its addresses.
    /// Errors are logged and skipped; other tasks are untouched.
    pub async fn cleanup(&self, task_id: &str) {
        let Some(devices) = self.taps.write().await.remove(task_id) else {
            return;
        };
        for device in devices {
            if let Err(err) = net::delete_tap(&device.name, self.config.test_mode).await {
                tracing::warn!(task_id, tap = %device.name, error = %err, "failed to delete tap");
            }
            if let Some(ip) = device.ip {
                self.allocator.release(ip).await;
            }
        }
        tracing::info!(task_id, "network attachments torn down");
    }

    /// Addresses currently held by the task, for the state record.
    pub async fn addresses_for(&self, task_id: &str) -> Vec<String> {
        self.taps
            .read()
            .await
            .get(task_id)
            .map(|devices| {
                devices
                    .iter()
                    .filter_map(|d| d.ip.map(|ip| ip.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of all TAPs across tasks, for observability.
    pub async fn list_taps(&self) -> Vec<TapDevice> {
        let taps = self.taps.read().await;
        let mut all: Vec<TapDevice> = taps.values().flatten().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Double-checked bridge setup: the in-memory set short-circuits repeat
    /// calls; the host namespace is the authority on first demand.
    async fn ensure_bridge_once(&self, bridge: &str) -> Result<()> {
        if self.bridges_seen.read().await.contains(bridge) {
            return Ok(());
        }
        let mut seen = self.bridges_seen.write().await;
        if seen.contains(bridge) {
            return Ok(());
        }
        net::ensure_bridge(bridge, self.config.test_mode)
            .await
            .map_err(|e| ExecutorError::network_prepare(NetworkStage::Bridge, e))?;
        seen.insert(bridge.to_string());
        Ok(())
    }

    async fn rollback(&self, task_id: &str, created: &[TapDevice]) {
        for device in created {
            if let Err(err) = net::delete_tap(&device.name, self.config.test_mode).await {
                tracing::warn!(task_id, tap = %device.name, error = %err, "rollback failed to delete tap");
            }
            if let Some(ip) = device.ip {
                self.allocator.release(ip).await;
            }
        }
    }
}
