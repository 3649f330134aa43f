use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use cinder_types::{Task, ROOTFS_ANNOTATION};
use futures::FutureExt;
use tokio::process::Command;
use tokio::time::{interval, MissedTickBehavior};

use crate::core::config::{find_in_path, ExecutorConfig};
use crate::core::error::{ExecutorError, PrepareStage, Result};
use crate::core::singleflight;
use crate::AppState;

const MIN_IMAGE_BYTES: u64 = 100 * 1024 * 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Turns OCI image references into bootable ext4 root images, cached by
/// image id. Builds are deduplicated per id: concurrent prepares for the
/// same image coalesce onto one build and share its outcome.
pub struct ImagePreparer {
    config: Arc<ExecutorConfig>,
    flights: singleflight::Group<std::result::Result<PathBuf, ExecutorError>>,
}

impl ImagePreparer {
    pub fn new(config: Arc<ExecutorConfig>) -> Self {
        ImagePreparer {
            config,
            flights: singleflight::Group::new(),
        }
    }

    /// Resolve (or build) the root image for the task and record its path in
    /// the task annotations under the reserved key.
    pub async fn prepare(&self, task: &mut Task) -> Result<()> {
        let image = task
            .runtime
            .as_ref()
            .map(|r| r.image.clone())
            .ok_or_else(|| ExecutorError::InvalidTask("task has no container runtime".into()))?;
        let id = image_id(&image);
        let final_path = self.config.cache_dir.join(format!("{id}.ext4"));

        let path = if cache_valid(&final_path) {
            metrics::counter!("executor_image_cache_hits", 1);
            tracing::info!(task_id = %task.id, image = %image, path = %final_path.display(), "rootfs cache hit");
            final_path
        } else {
            metrics::counter!("executor_image_cache_misses", 1);
            let config = Arc::clone(&self.config);
            let build_image = image.clone();
            let build_id = id.clone();
            self.flights
                .run(&id, move || {
                    async move {
                        match build_rootfs(&config, &build_image, &build_id).await {
                            Ok(path) => Ok(path),
                            Err(err) => {
                                tracing::error!(image = %build_image, error = %err, "rootfs build failed");
                                Err(err)
                            }
                        }
                    }
                    .boxed()
                })
                .await?
        };

        task.annotations
            .get_or_insert_with(Default::default)
            .insert(
                ROOTFS_ANNOTATION.to_string(),
                path.to_string_lossy().into_owned(),
            );
        Ok(())
    }

    /// Remove cached images whose mtime is older than the retention window.
    /// Non-positive retention and a missing cache directory are no-ops.
    pub async fn cleanup(&self, retention_days: i64) -> Result<()> {
        if retention_days <= 0 {
            return Ok(());
        }
        let mut entries = match tokio::fs::read_dir(&self.config.cache_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        let cutoff = std::time::SystemTime::now()
            - Duration::from_secs(retention_days as u64 * 24 * 3600);

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ext4") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let Ok(mtime) = meta.modified() else { continue };
            if mtime < cutoff {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        metrics::counter!("executor_image_cache_evictions", 1);
                        tracing::info!(path = %path.display(), "evicted cached rootfs");
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "failed to evict cached rootfs");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Periodic cache sweep with the configured retention.
pub fn spawn_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = state
                .images
                .cleanup(state.config.cache_retention_days)
                .await
            {
                tracing::error!(error = %err, "image cache sweep failed");
            }
        }
    })
}

/// Deterministic, filesystem-safe cache key for an image reference: default
/// the tag to `latest`, then collapse every `/` and `:` to `-`. Ports in
/// registry hosts collapse the same way; the full reference is preserved up
/// to delimiter substitution, so the mapping stays injective enough for a
/// single node. This is a cache key, not a content digest.
pub fn image_id(image: &str) -> String {
    let tail = image.rsplit('/').next().unwrap_or(image);
    let mut reference = image.to_string();
    if !tail.contains(':') {
        reference.push_str(":latest");
    }
    reference.replace(['/', ':'], "-")
}

/// A cached rootfs is trusted when it exists and is non-empty.
fn cache_valid(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn container_runtime() -> Result<PathBuf> {
    for name in ["docker", "podman"] {
        if let Some(path) = find_in_path(name) {
            return Ok(path);
        }
    }
    Err(ExecutorError::ImagePrepare {
        stage: PrepareStage::NoRuntime,
        message: "neither docker nor podman found in PATH".into(),
    })
}

/// Build pipeline for a cache miss: pull, export the flattened filesystem,
/// size and format a sparse ext4 file, copy the tree in, then atomically
/// rename into the cache. A failure leaves nothing at the final path.
async fn build_rootfs(
    config: &ExecutorConfig,
    image: &str,
    id: &str,
) -> std::result::Result<PathBuf, ExecutorError> {
    let runtime = container_runtime()?;
    let final_path = config.cache_dir.join(format!("{id}.ext4"));

    tokio::fs::create_dir_all(&config.cache_dir)
        .await
        .map_err(|e| ExecutorError::image_prepare(PrepareStage::Format, e))?;

    let build_id = uuid::Uuid::new_v4();
    let work_dir = config.cache_dir.join(format!(".build-{build_id}"));
    let tmp_image = config.cache_dir.join(format!(".{id}.{build_id}.tmp"));

    let result = build_rootfs_inner(&runtime, image, &work_dir, &tmp_image, &final_path).await;

    let _ = Command::new("umount").arg(work_dir.join("mnt")).output().await;
    let _ = tokio::fs::remove_dir_all(&work_dir).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_image).await;
    }
    result
}

async fn build_rootfs_inner(
    runtime: &Path,
    image: &str,
    work_dir: &Path,
    tmp_image: &Path,
    final_path: &Path,
) -> std::result::Result<PathBuf, ExecutorError> {
    let export_dir = work_dir.join("rootfs");
    let mount_dir = work_dir.join("mnt");
    tokio::fs::create_dir_all(&export_dir)
        .await
        .map_err(|e| ExecutorError::image_prepare(PrepareStage::Export, e))?;
    tokio::fs::create_dir_all(&mount_dir)
        .await
        .map_err(|e| ExecutorError::image_prepare(PrepareStage::Copy, e))?;

    let runtime = runtime.display().to_string();
    tracing::info!(image = %image, runtime = %runtime, "pulling image");
    run(&runtime, &["pull", image])
        .await
        .map_err(|e| ExecutorError::image_prepare(PrepareStage::Pull, e))?;
    metrics::counter!("executor_image_pulls", 1);

    let container_id = run(&runtime, &["create", image])
        .await
        .map_err(|e| ExecutorError::image_prepare(PrepareStage::Export, e))?;
    let container_id = container_id.trim().to_string();
    if container_id.is_empty() {
        return Err(ExecutorError::ImagePrepare {
            stage: PrepareStage::Export,
            message: format!("{runtime} create returned no container id"),
        });
    }

    tracing::info!(image = %image, container_id = %container_id, "exporting root filesystem");
    let export = run_shell(&format!(
        "{runtime} export {container_id} | tar -x -C {}",
        export_dir.display()
    ))
    .await;
    let _ = run(&runtime, &["rm", &container_id]).await;
    export.map_err(|e| ExecutorError::image_prepare(PrepareStage::Export, e))?;

    let used_bytes = measure_used_bytes(&export_dir)
        .await
        .map_err(|e| ExecutorError::image_prepare(PrepareStage::Export, e))?;
    let image_bytes = image_size_bytes(used_bytes);
    tracing::info!(image = %image, used_bytes, image_bytes, "sizing rootfs image");

    let tmp = tmp_image.display().to_string();
    let mnt = mount_dir.display().to_string();
    run("truncate", &["-s", &image_bytes.to_string(), &tmp])
        .await
        .map_err(|e| ExecutorError::image_prepare(PrepareStage::Format, e))?;
    run("mkfs.ext4", &["-F", "-q", &tmp])
        .await
        .map_err(|e| ExecutorError::image_prepare(PrepareStage::Format, e))?;

    run("mount", &["-o", "loop", &tmp, &mnt])
        .await
        .map_err(|e| ExecutorError::image_prepare(PrepareStage::Copy, e))?;

    let copy = async {
        run_shell(&format!("cp -a {}/. {mnt}/", export_dir.display())).await?;
        run_shell("sync").await
    }
    .await;
    let unmount = run("umount", &[&mnt]).await;
    copy.map_err(|e| ExecutorError::image_prepare(PrepareStage::Copy, e))?;
    unmount.map_err(|e| ExecutorError::image_prepare(PrepareStage::Copy, e))?;

    tokio::fs::rename(tmp_image, final_path)
        .await
        .map_err(|e| ExecutorError::image_prepare(PrepareStage::Rename, e))?;
    metrics::counter!("executor_image_builds", 1);
    tracing::info!(image = %image, path = %final_path.display(), "rootfs image built");
    Ok(final_path.to_path_buf())
}

/// Output size: 20% headroom over the measured tree, floored at 100 MiB.
fn image_size_bytes(used_bytes: u64) -> u64 {
    (used_bytes + used_bytes / 5).max(MIN_IMAGE_BYTES)
}

async fn measure_used_bytes(dir: &Path) -> anyhow::Result<u64> {
    let out = run_shell(&format!("du -sb {}", dir.display())).await?;
    out.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| anyhow!("unparseable du output: {out}"))
}

async fn run(program: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to execute {program}"))?;
    if !output.status.success() {
        bail!(
            "{program} {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn run_shell(script: &str) -> anyhow::Result<String> {
    let output = Command::new("bash")
        .arg("-lc")
        .arg(script)
        .output()
        .await
        .with_context(|| format!("failed to execute: {script}"))?;
    if !output.status.success() {
        bail!(
            "`{script}` exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_id_defaults_the_tag() {
        assert_eq!(image_id("nginx"), "nginx-latest");
        assert_eq!(image_id("nginx:alpine"), "nginx-alpine");
    }

    #[test]
    fn image_id_collapses_path_and_port_delimiters() {
        assert_eq!(
            image_id("registry.example.com/org/repo/image:tag"),
            "registry.example.com-org-repo-image-tag"
        );
        assert_eq!(
            image_id("localhost:5000/myimage:latest"),
            "localhost-5000-myimage-latest"
        );
        // No tag after the last slash: the port colon must not suppress the
        // default tag.
        assert_eq!(image_id("localhost:5000/myimage"), "localhost-5000-myimage-latest");
    }

    #[test]
    fn image_sizing_has_headroom_and_a_floor() {
        assert_eq!(image_size_bytes(0), MIN_IMAGE_BYTES);
        assert_eq!(image_size_bytes(50 * 1024 * 1024), MIN_IMAGE_BYTES);
        let one_gib = 1024u64 * 1024 * 1024;
        assert_eq!(image_size_bytes(one_gib), one_gib + one_gib / 5);
    }

    #[test]
    fn cache_requires_a_non_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("img.ext4");
        assert!(!cache_valid(&path));
        std::fs::write(&path, b"").unwrap();
        assert!(!cache_valid(&path));
        std::fs::write(&path, b"ext4").unwrap();
        assert!(cache_valid(&path));
    }

    #[tokio::test]
    async fn prepare_hits_the_cache_without_a_runtime() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = ExecutorConfig::from_env();
        config.cache_dir = tmp.path().to_path_buf();
        let cached = tmp.path().join("alpine-latest.ext4");
        tokio::fs::write(&cached, b"ext4 image").await.unwrap();

        let preparer = ImagePreparer::new(Arc::new(config));
        let mut task = Task {
            id: "t1".into(),
            service_id: "svc".into(),
            node_id: "node".into(),
            runtime: Some(cinder_types::ContainerSpec {
                image: "alpine:latest".into(),
                command: vec![],
                args: vec![],
                env: vec![],
                mounts: vec![],
            }),
            resources: Default::default(),
            networks: vec![],
            annotations: None,
        };
        preparer.prepare(&mut task).await.unwrap();
        assert_eq!(task.rootfs(), Some(cached.to_str().unwrap()));
    }

    #[tokio::test]
    async fn cleanup_evicts_only_old_images() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = ExecutorConfig::from_env();
        config.cache_dir = tmp.path().to_path_buf();

        let old = tmp.path().join("old-latest.ext4");
        let fresh = tmp.path().join("fresh-latest.ext4");
        tokio::fs::write(&old, b"x").await.unwrap();
        tokio::fs::write(&fresh, b"x").await.unwrap();
        let stale = std::time::SystemTime::now() - Duration::from_secs(10 * 24 * 3600);
        std::fs::File::options()
            .write(true)
            .open(&old)
            .and_then(|f| f.set_modified(stale))
            .unwrap();

        let preparer = ImagePreparer::new(Arc::new(config));
        preparer.cleanup(7).await.unwrap();
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn cleanup_ignores_missing_dir_and_zero_retention() {
        let mut config = ExecutorConfig::from_env();
        config.cache_dir = PathBuf::from("/nonexistent/cache/dir");
        let preparer = ImagePreparer::new(Arc::new(config));
        preparer.cleanup(7).await.unwrap();
        preparer.cleanup(0).await.unwrap();
        preparer.cleanup(-3).await.unwrap();
    }
}
