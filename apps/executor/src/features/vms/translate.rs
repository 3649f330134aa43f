use cinder_types::Task;
use serde::Serialize;

use crate::core::config::{ExecutorConfig, InitSystem};
use crate::core::error::{ExecutorError, Result};
use crate::core::net;

const DEFAULT_VCPUS: u32 = 1;
const DEFAULT_MEM_MIB: u32 = 512;
const MIN_MEM_MIB: u32 = 128;
const NANO_CPUS_PER_VCPU: i64 = 1_000_000_000;
const BASE_BOOT_ARGS: &str =
    "console=ttyS0 reboot=k panic=1 pci=off random.trust_cpu=on ip=dhcp";

/// Complete boot configuration for one microVM, assembled from a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmmConfig {
    pub machine: MachineConfig,
    pub boot: BootSource,
    pub drives: Vec<DriveConfig>,
    pub nics: Vec<NicConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub smt: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveConfig {
    pub drive_id: String,
    pub is_root_device: bool,
    pub path_on_host: String,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NicConfig {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
    pub rx_queue_size: u32,
    pub tx_queue_size: u32,
}

/// Map a task to a VMM boot configuration. Pure given the task and the node
/// configuration; the same inputs always produce the same output.
pub fn translate(task: &Task, config: &ExecutorConfig) -> Result<VmmConfig> {
    let runtime = task
        .runtime
        .as_ref()
        .ok_or_else(|| ExecutorError::TranslateFailed("task has no container runtime".into()))?;
    let rootfs = task.rootfs().ok_or_else(|| {
        ExecutorError::TranslateFailed(format!(
            "rootfs annotation missing for task {}, prepare must run first",
            task.id
        ))
    })?;

    let machine = machine_config(task);
    if machine.vcpu_count as usize > num_cpus::get() {
        tracing::warn!(
            task_id = %task.id,
            vcpus = machine.vcpu_count,
            host_cpus = num_cpus::get(),
            "task requests more vcpus than the host has"
        );
    }

    let mut drives = vec![DriveConfig {
        drive_id: "rootfs".to_string(),
        is_root_device: true,
        path_on_host: rootfs.to_string(),
        is_read_only: false,
    }];
    for mount in &runtime.mounts {
        drives.push(DriveConfig {
            drive_id: drive_id_for(&mount.target),
            is_root_device: false,
            path_on_host: mount.source.clone(),
            is_read_only: mount.read_only,
        });
    }

    let nics = task
        .networks
        .iter()
        .enumerate()
        .map(|(i, _)| NicConfig {
            iface_id: format!("eth{i}"),
            host_dev_name: net::tap_name(&task.id, i),
            guest_mac: Some(net::guest_mac(&task.id, i)),
            rx_queue_size: 256,
            tx_queue_size: 256,
        })
        .collect();

    let boot = BootSource {
        kernel_image_path: config.kernel_path.clone(),
        boot_args: format!(
            "{BASE_BOOT_ARGS} -- {}",
            init_chain(config.init_system, &runtime.command, &runtime.args)
        ),
        initrd_path: config.initrd_path.clone(),
    };

    Ok(VmmConfig {
        machine,
        boot,
        drives,
        nics,
    })
}

fn machine_config(task: &Task) -> MachineConfig {
    match task.resources.limits {
        Some(limits) => MachineConfig {
            vcpu_count: ((limits.nano_cpus / NANO_CPUS_PER_VCPU).max(1)) as u32,
            mem_size_mib: ((limits.memory_bytes / (1024 * 1024)) as u32).max(MIN_MEM_MIB),
            smt: false,
        },
        None => MachineConfig {
            vcpu_count: DEFAULT_VCPUS,
            mem_size_mib: DEFAULT_MEM_MIB,
            smt: false,
        },
    }
}

/// Drive id derived from the mount target: leading slash dropped, remaining
/// slashes collapsed to dashes.
fn drive_id_for(target: &str) -> String {
    target.trim_start_matches('/').replace('/', "-")
}

fn init_chain(init: InitSystem, command: &[String], args: &[String]) -> String {
    let mut cmd: Vec<&str> = command.iter().map(String::as_str).collect();
    cmd.extend(args.iter().map(String::as_str));
    if cmd.is_empty() {
        cmd.push("/bin/sh");
    }
    let cmd = cmd.join(" ");

    match init {
        InitSystem::Tini => format!("/sbin/tini -- {cmd}"),
        InitSystem::DumbInit => format!("/sbin/dumb-init {cmd}"),
        InitSystem::None => cmd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_types::{
        ContainerSpec, Mount, NetworkAttachment, ResourceRequirements, Resources,
        ROOTFS_ANNOTATION,
    };
    use std::collections::HashMap;

    fn config() -> ExecutorConfig {
        let mut config = ExecutorConfig::from_env();
        config.kernel_path = "/srv/executor/vmlinux.bin".into();
        config.initrd_path = None;
        config.init_system = InitSystem::None;
        config
    }

    fn task(id: &str) -> Task {
        let mut annotations = HashMap::new();
        annotations.insert(
            ROOTFS_ANNOTATION.to_string(),
            "/srv/executor/images/alpine-latest.ext4".to_string(),
        );
        Task {
            id: id.to_string(),
            service_id: "svc-1".into(),
            node_id: "node-1".into(),
            runtime: Some(ContainerSpec {
                image: "alpine:latest".into(),
                command: vec![],
                args: vec![],
                env: vec![],
                mounts: vec![],
            }),
            resources: ResourceRequirements::default(),
            networks: vec![],
            annotations: Some(annotations),
        }
    }

    #[test]
    fn defaults_apply_without_limits() {
        let out = translate(&task("t1"), &config()).unwrap();
        assert_eq!(
            out.machine,
            MachineConfig {
                vcpu_count: 1,
                mem_size_mib: 512,
                smt: false
            }
        );
    }

    #[test]
    fn limits_convert_with_minimums() {
        let mut t = task("t1");
        t.resources.limits = Some(Resources {
            nano_cpus: 2_500_000_000,
            memory_bytes: 1024 * 1024 * 1024,
        });
        let out = translate(&t, &config()).unwrap();
        assert_eq!(out.machine.vcpu_count, 2);
        assert_eq!(out.machine.mem_size_mib, 1024);

        t.resources.limits = Some(Resources {
            nano_cpus: 100,
            memory_bytes: 1,
        });
        let out = translate(&t, &config()).unwrap();
        assert_eq!(out.machine.vcpu_count, 1);
        assert_eq!(out.machine.mem_size_mib, 128);
    }

    #[test]
    fn boot_args_carry_prefix_and_shell_fallback() {
        let out = translate(&task("t1"), &config()).unwrap();
        assert_eq!(
            out.boot.boot_args,
            "console=ttyS0 reboot=k panic=1 pci=off random.trust_cpu=on ip=dhcp -- /bin/sh"
        );
        assert_eq!(out.boot.kernel_image_path, "/srv/executor/vmlinux.bin");
        assert!(out.boot.initrd_path.is_none());
    }

    #[test]
    fn init_supervisors_wrap_the_command() {
        let cmd = vec!["/usr/bin/app".to_string()];
        let args = vec!["--port".to_string(), "80".to_string()];
        assert_eq!(
            init_chain(InitSystem::Tini, &cmd, &args),
            "/sbin/tini -- /usr/bin/app --port 80"
        );
        assert_eq!(
            init_chain(InitSystem::DumbInit, &cmd, &args),
            "/sbin/dumb-init /usr/bin/app --port 80"
        );
        assert_eq!(
            init_chain(InitSystem::None, &cmd, &args),
            "/usr/bin/app --port 80"
        );
        assert_eq!(init_chain(InitSystem::Tini, &[], &[]), "/sbin/tini -- /bin/sh");
    }

    #[test]
    fn root_drive_comes_first_and_mounts_follow() {
        let mut t = task("t1");
        t.runtime.as_mut().unwrap().mounts = vec![Mount {
            source: "/srv/data/vol1.ext4".into(),
            target: "/var/lib/data".into(),
            read_only: true,
        }];
        let out = translate(&t, &config()).unwrap();
        assert_eq!(out.drives.len(), 2);
        assert_eq!(out.drives[0].drive_id, "rootfs");
        assert!(out.drives[0].is_root_device);
        assert!(!out.drives[0].is_read_only);
        assert_eq!(out.drives[1].drive_id, "var-lib-data");
        assert!(!out.drives[1].is_root_device);
        assert!(out.drives[1].is_read_only);
        assert_eq!(out.drives[1].path_on_host, "/srv/data/vol1.ext4");
    }

    #[test]
    fn one_nic_per_attachment_with_indexed_names() {
        let mut t = task("t1");
        t.networks = vec![
            NetworkAttachment {
                network_id: "net-a".into(),
                bridge: None,
            },
            NetworkAttachment {
                network_id: "net-b".into(),
                bridge: None,
            },
        ];
        let out = translate(&t, &config()).unwrap();
        assert_eq!(out.nics.len(), 2);
        assert_eq!(out.nics[0].iface_id, "eth0");
        assert_eq!(out.nics[1].iface_id, "eth1");
        assert_eq!(out.nics[0].host_dev_name, net::tap_name("t1", 0));
        assert_eq!(out.nics[0].guest_mac.as_deref(), Some(net::guest_mac("t1", 0).as_str()));
        assert_eq!(out.nics[0].rx_queue_size, 256);
        assert_eq!(out.nics[0].tx_queue_size, 256);
    }

    #[test]
    fn translation_is_deterministic() {
        let t = task("t1");
        let c = config();
        assert_eq!(translate(&t, &c).unwrap(), translate(&t, &c).unwrap());
    }

    #[test]
    fn missing_rootfs_annotation_is_an_error() {
        let mut t = task("t1");
        t.annotations = None;
        let err = translate(&t, &config()).unwrap_err();
        assert!(matches!(err, ExecutorError::TranslateFailed(_)));
    }
}
