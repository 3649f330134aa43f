use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cinder_types::{VmRecord, VmStatus};
use tokio::sync::RwLock;

use crate::core::error::{ExecutorError, Result};

/// Durable per-node map of VM records. All mutations happen under the write
/// lock and are flushed to `<state_dir>/vms.json` before the lock is
/// released, so there is exactly one writer at a time and readers always see
/// a state that has hit the disk.
pub struct StateStore {
    path: PathBuf,
    log_dir: PathBuf,
    records: RwLock<HashMap<String, VmRecord>>,
}

impl StateStore {
    pub async fn open(state_dir: &Path, log_dir: &Path) -> Self {
        let path = state_dir.join("vms.json");
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, VmRecord>>(&bytes) {
                Ok(map) => map,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "state file corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        tracing::info!(path = %path.display(), vms = records.len(), "state store loaded");
        StateStore {
            path,
            log_dir: log_dir.to_path_buf(),
            records: RwLock::new(records),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub async fn add(&self, record: VmRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(record.id.clone(), record);
        self.persist(&records).await
    }

    pub async fn get(&self, id: &str) -> Option<VmRecord> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<VmRecord> {
        let mut all: Vec<VmRecord> = self.records.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Change only the status of a record; every other field is preserved.
    pub async fn update_status(&self, id: &str, status: VmStatus) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(id) {
            record.status = status;
            self.persist(&records).await?;
        }
        Ok(())
    }

    /// Mark a record failed, stamping the error message and time.
    pub async fn update_error(&self, id: &str, message: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(id) {
            record.status = VmStatus::Error;
            record.last_error = Some(message.to_string());
            record.error_time = Some(chrono::Utc::now());
            self.persist(&records).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        let removed = records.remove(id).is_some();
        if removed {
            self.persist(&records).await?;
        }
        Ok(removed)
    }

    async fn persist(&self, records: &HashMap<String, VmRecord>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(records)
            .map_err(|e| ExecutorError::StatePersist(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ExecutorError::StatePersist(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ExecutorError::StatePersist(format!("rename {}: {e}", self.path.display())))
    }
}
