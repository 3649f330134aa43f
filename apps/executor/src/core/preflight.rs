use std::path::Path;

use crate::core::config::{find_in_path, ExecutorConfig};

/// Host capability survey taken at startup. Nothing here is fatal: a node
/// can come up degraded (e.g. to serve status queries) while the operator
/// fixes the host, so missing pieces are logged, not enforced.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PreflightReport {
    pub kvm: bool,
    pub kernel_image: bool,
    pub vmm_binary: bool,
    pub container_runtime: bool,
    pub ip_tool: bool,
    pub mkfs_ext4: bool,
}

pub fn check(config: &ExecutorConfig) -> PreflightReport {
    let vmm_binary = match &config.firecracker_bin {
        Some(path) => path.is_file(),
        None => find_in_path("firecracker").is_some(),
    };
    PreflightReport {
        kvm: Path::new("/dev/kvm").exists(),
        kernel_image: Path::new(&config.kernel_path).is_file(),
        vmm_binary,
        container_runtime: find_in_path("docker").is_some() || find_in_path("podman").is_some(),
        ip_tool: find_in_path("ip").is_some(),
        mkfs_ext4: find_in_path("mkfs.ext4").is_some() || Path::new("/sbin/mkfs.ext4").exists(),
    }
}

impl PreflightReport {
    pub fn log(&self) {
        let checks = [
            (self.kvm, "/dev/kvm is missing, vms cannot boot"),
            (self.kernel_image, "kernel image not found, set EXECUTOR_KERNEL"),
            (self.vmm_binary, "firecracker binary not found"),
            (
                self.container_runtime,
                "neither docker nor podman found, image prepare will fail",
            ),
            (self.ip_tool, "ip tool not found, tap setup will fail"),
            (self.mkfs_ext4, "mkfs.ext4 not found, image builds will fail"),
        ];
        for (ok, message) in checks {
            if !ok {
                tracing::warn!("preflight: {message}");
            }
        }
        if checks.iter().all(|(ok, _)| *ok) {
            tracing::info!("preflight: all host checks passed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_kernel_is_reported() {
        let mut config = ExecutorConfig::from_env();
        config.kernel_path = "/nonexistent/vmlinux.bin".into();
        let report = check(&config);
        assert!(!report.kernel_image);
    }

    #[test]
    fn configured_vmm_path_must_exist() {
        let mut config = ExecutorConfig::from_env();
        config.firecracker_bin = Some("/nonexistent/firecracker".into());
        assert!(!check(&config).vmm_binary);

        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("firecracker");
        std::fs::write(&bin, b"#!/bin/sh").unwrap();
        config.firecracker_bin = Some(bin);
        assert!(check(&config).vmm_binary);
    }
}
