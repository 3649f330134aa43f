use anyhow::{anyhow, bail, Result};
use sha2::{Digest, Sha256};
use tokio::process::Command;

/// Linux interface names are capped at 15 bytes.
const IFNAME_MAX: usize = 15;

/// Deterministic TAP name for one attachment of a task: `tap-<id>-<i>`,
/// within the kernel limit. The same (task, index) pair always maps to the
/// same device name, so the translator and the network manager agree without
/// passing state between them. The id portion (up to 8 chars) shrinks to
/// make room for wider indices, so distinct indices of one task never
/// collapse onto the same 15-byte name.
pub fn tap_name(task_id: &str, index: usize) -> String {
    let suffix = index.to_string();
    let id_budget = (IFNAME_MAX - 5).saturating_sub(suffix.len()).min(8);
    let short: String = task_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(id_budget)
        .collect();
    format!("tap-{short}-{suffix}")
}

/// Deterministic locally-administered unicast MAC for one attachment,
/// derived from the same (task, index) pair as the TAP name. Rebooting the
/// same task keeps the guest's MAC, which keeps its DHCP lease stable.
pub fn guest_mac(task_id: &str, index: usize) -> String {
    let digest = Sha256::digest(format!("{task_id}-eth{index}").as_bytes());
    format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        digest[0], digest[1], digest[2], digest[3], digest[4]
    )
}

pub async fn link_exists(name: &str) -> Result<bool> {
    let output = Command::new("ip").args(["link", "show", name]).output().await?;
    Ok(output.status.success())
}

/// Create the bridge if the host namespace does not have it and bring it up.
/// A bridge provisioned by ops tooling is left exactly as found.
pub async fn ensure_bridge(bridge: &str, test_mode: bool) -> Result<()> {
    if test_mode {
        tracing::info!(%bridge, "test mode, skipping bridge setup");
        return Ok(());
    }
    if !link_exists(bridge).await? {
        run("ip", &["link", "add", bridge, "type", "bridge"]).await?;
        tracing::info!(%bridge, "created bridge");
    }
    run("ip", &["link", "set", bridge, "up"]).await?;
    Ok(())
}

pub async fn create_tap(name: &str, bridge: &str, test_mode: bool) -> Result<()> {
    if test_mode {
        tracing::info!(tap = %name, "test mode, skipping tap creation");
        return Ok(());
    }
    if link_exists(name).await? {
        tracing::info!(tap = %name, "tap already exists, recreating");
        let _ = run("ip", &["link", "del", name]).await;
    }
    run("ip", &["tuntap", "add", "dev", name, "mode", "tap"]).await?;
    run("ip", &["link", "set", name, "master", bridge]).await?;
    run("ip", &["link", "set", name, "up"]).await?;
    Ok(())
}

pub async fn delete_tap(name: &str, test_mode: bool) -> Result<()> {
    if test_mode {
        return Ok(());
    }
    let output = Command::new("ip").args(["link", "del", name]).output().await?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.contains("Cannot find device") || stderr.contains("does not exist") || stderr.is_empty()
    {
        return Ok(());
    }
    Err(anyhow!("failed to delete tap {name}: {stderr}"))
}

async fn run(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{program} {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_names_fit_the_interface_limit() {
        let name = tap_name("0123456789abcdef0123456789abcdef", 0);
        assert_eq!(name, "tap-01234567-0");
        assert!(name.len() <= IFNAME_MAX);

        let long_index = tap_name("0123456789abcdef", 12);
        assert!(long_index.len() <= IFNAME_MAX);
    }

    #[test]
    fn tap_names_are_deterministic_and_indexed() {
        assert_eq!(tap_name("task-1", 0), tap_name("task-1", 0));
        assert_ne!(tap_name("task-1", 0), tap_name("task-1", 1));
    }

    #[test]
    fn wide_indices_shrink_the_id_instead_of_colliding() {
        assert_eq!(tap_name("0123456789abcdef", 10), "tap-01234567-10");
        assert_eq!(tap_name("0123456789abcdef", 100), "tap-0123456-100");

        let names: Vec<String> = (0..120)
            .map(|i| tap_name("0123456789abcdef", i))
            .collect();
        let unique: std::collections::HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
        assert!(names.iter().all(|n| n.len() <= IFNAME_MAX));
    }

    #[test]
    fn tap_names_skip_non_alphanumerics() {
        assert_eq!(tap_name("a.b/c:d-e_f", 1), "tap-abcdef-1");
    }

    #[test]
    fn guest_macs_are_stable_local_unicast() {
        let mac = guest_mac("task-1", 0);
        assert_eq!(mac.len(), 17);
        assert!(mac.starts_with("02:"));
        assert_eq!(mac, guest_mac("task-1", 0));
        assert_ne!(mac, guest_mac("task-1", 1));
        assert_ne!(mac, guest_mac("task-2", 0));
    }
}
