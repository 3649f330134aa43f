use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use hyperlocal::UnixConnector;
use serde::Deserialize;

use crate::core::error::{ExecutorError, Result};

/// HTTP client for one VMM control socket. Every call is bounded by the
/// per-call timeout; transport failures and timeouts are distinguished from
/// rejections so callers can route them differently.
#[derive(Clone)]
pub struct VmmClient {
    socket_path: PathBuf,
    timeout: Duration,
}

/// Live machine configuration as reported by `GET /machine-config`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LiveMachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

impl VmmClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        VmmClient {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(StatusCode, Bytes)> {
        let client: Client<UnixConnector, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build(UnixConnector);
        let uri = hyperlocal::Uri::new(&self.socket_path, path);

        let payload = match body {
            Some(value) => Bytes::from(value.to_string()),
            None => Bytes::new(),
        };
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Full::new(payload))
            .map_err(|e| ExecutorError::VmmApiUnreachable(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, client.request(req))
            .await
            .map_err(|_| {
                ExecutorError::Timeout(format!(
                    "vmm api call {path} on {}",
                    self.socket_path.display()
                ))
            })?
            .map_err(|e| ExecutorError::VmmApiUnreachable(e.to_string()))?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ExecutorError::VmmApiUnreachable(e.to_string()))?
            .to_bytes();
        Ok((status, bytes))
    }

    /// Readiness probe: the socket answers a plain GET on the root path.
    pub async fn ping(&self) -> bool {
        matches!(
            self.request(Method::GET, "/", None).await,
            Ok((status, _)) if status.is_success()
        )
    }

    async fn put(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let (status, bytes) = self.request(Method::PUT, path, Some(body)).await?;
        if status.is_success() {
            return Ok(());
        }
        Err(ExecutorError::VmmApiRejected {
            endpoint: path.to_string(),
            message: format!("{status}: {}", String::from_utf8_lossy(&bytes)),
        })
    }

    pub async fn put_machine_config(&self, vcpu_count: u32, mem_size_mib: u32) -> Result<()> {
        // Current VMM versions require `smt`; `ht_enabled` is the obsolete name.
        self.put(
            "/machine-config",
            serde_json::json!({
                "vcpu_count": vcpu_count,
                "mem_size_mib": mem_size_mib,
                "smt": false,
            }),
        )
        .await
    }

    pub async fn put_boot_source(
        &self,
        kernel_image_path: &str,
        boot_args: &str,
        initrd_path: Option<&str>,
    ) -> Result<()> {
        let mut body = serde_json::json!({
            "kernel_image_path": kernel_image_path,
            "boot_args": boot_args,
        });
        if let Some(initrd) = initrd_path {
            body["initrd_path"] = serde_json::json!(initrd);
        }
        self.put("/boot-source", body).await
    }

    pub async fn put_drive(
        &self,
        drive_id: &str,
        path_on_host: &str,
        is_root_device: bool,
        is_read_only: bool,
    ) -> Result<()> {
        self.put(
            &format!("/drives/{drive_id}"),
            serde_json::json!({
                "drive_id": drive_id,
                "path_on_host": path_on_host,
                "is_root_device": is_root_device,
                "is_read_only": is_read_only,
            }),
        )
        .await
    }

    pub async fn put_network_interface(
        &self,
        iface_id: &str,
        host_dev_name: &str,
        guest_mac: Option<&str>,
    ) -> Result<()> {
        let mut body = serde_json::json!({
            "iface_id": iface_id,
            "host_dev_name": host_dev_name,
        });
        if let Some(mac) = guest_mac {
            body["guest_mac"] = serde_json::json!(mac);
        }
        self.put(&format!("/network-interfaces/{iface_id}"), body)
            .await
    }

    pub async fn start_instance(&self) -> Result<()> {
        self.put("/actions", serde_json::json!({"action_type": "InstanceStart"}))
            .await
    }

    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.put(
            "/actions",
            serde_json::json!({"action_type": "SendCtrlAltDel"}),
        )
        .await
    }

    pub async fn get_machine_config(&self) -> Result<LiveMachineConfig> {
        let (status, bytes) = self.request(Method::GET, "/machine-config", None).await?;
        if !status.is_success() {
            return Err(ExecutorError::VmmApiRejected {
                endpoint: "/machine-config".to_string(),
                message: format!("{status}: {}", String::from_utf8_lossy(&bytes)),
            });
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| ExecutorError::VmmApiUnreachable(format!("bad machine-config body: {e}")))
    }
}
