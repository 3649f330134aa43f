use std::path::Path;

use axum::{response::IntoResponse, routing::get, Extension, Json, Router};
use serde::Serialize;

use crate::features::network::TapDevice;
use crate::AppState;

pub fn router() -> Router {
    Router::new().route("/inventory", get(inventory))
}

/// Live node artifacts for orchestrator reconciliation: control sockets and
/// log captures on disk plus the TAP table, so a reconciler can diff desired
/// state against what actually exists on the host.
async fn inventory(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let taps = state.network.list_taps().await;
    let sockets = collect_files(&state.config.socket_dir, "sock").await;
    let logs = collect_files(&state.config.log_dir, "log").await;
    Json(InventoryResponse {
        taps,
        sockets,
        logs,
    })
}

#[derive(Debug, Serialize)]
struct InventoryResponse {
    taps: Vec<TapDevice>,
    sockets: Vec<String>,
    logs: Vec<String>,
}

async fn collect_files(dir: &Path, extension: &str) -> Vec<String> {
    let mut files = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            if let Some(path_str) = path.to_str() {
                files.push(path_str.to_string());
            }
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_only_matching_files() {
        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("vm-1.sock");
        tokio::fs::write(&sock, b"").await.unwrap();
        tokio::fs::write(tmp.path().join("vm-1.log"), b"").await.unwrap();

        let files = collect_files(tmp.path(), "sock").await;
        assert_eq!(files, vec![sock.to_string_lossy().into_owned()]);
    }

    #[tokio::test]
    async fn missing_directory_yields_empty_inventory() {
        let files = collect_files(Path::new("/nonexistent/sockets"), "sock").await;
        assert!(files.is_empty());
    }
}
