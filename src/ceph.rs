// Ceph module - CLI-backed implementations of the cluster capabilities
//
// Talks to the cluster through the stock command-line tools:
// - `ceph config get` for the set of pools enabled for usage collection
// - `rbd ls` / `rbd info` for image enumeration
// - `rados get` for object-map reads
// - `rbd du` for the slow fallback usage query (bounded by a timeout)
//
// Everything here implements the traits from the usage module, so the rest
// of the exporter never depends on these tools directly.

use async_trait::async_trait;
use serde::Deserialize;
use std::error::Error;
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ExporterConfig;
use crate::usage::{
    BitmapReader, FallbackQuerier, FallbackReport, ImageHandle, ImageLister, PoolLister,
    PoolUsageEntry,
};

/// Timeout for one fallback `rbd du` invocation.
/// The query walks every object of every image in the pool and can run for
/// minutes; past this bound the pool's unresolved images are skipped.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors that can occur while invoking the cluster CLIs
#[derive(Error, Debug)]
pub enum CephError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("`{command}` produced invalid UTF-8 output")]
    InvalidUtf8 { command: String },

    #[error("`{command}` produced invalid JSON: {source}")]
    InvalidJson {
        command: String,
        source: serde_json::Error,
    },

    #[error("object '{object}' in pool '{pool}' is {got} bytes, wanted {len} at offset {offset}")]
    ShortObject {
        pool: String,
        object: String,
        got: usize,
        offset: u64,
        len: usize,
    },
}

/// Per-image metadata as printed by `rbd info --format json`
#[derive(Debug, Deserialize)]
struct RbdInfo {
    id: String,
    size: u64,
    objects: u64,
    object_size: u64,
    #[serde(default)]
    features: Vec<String>,
}

/// Cluster access via the ceph/rbd/rados command-line tools
///
/// Cheap to construct; holds only the connection parameters every
/// invocation needs.
pub struct CephCluster {
    cluster: String,
    conf: String,
    keyring: String,
}

impl CephCluster {
    /// Creates a cluster handle from the exporter configuration.
    pub fn new(config: &ExporterConfig) -> Self {
        CephCluster {
            cluster: config.cluster.clone(),
            conf: config.conf.clone(),
            keyring: config.keyring.clone(),
        }
    }

    /// Runs a command to completion and returns its raw stdout.
    ///
    /// A non-zero exit status is an error carrying the captured stderr.
    async fn run(&self, mut command: Command) -> Result<Vec<u8>, CephError> {
        let label = command_label(&command);
        debug!("running `{}`", label);

        let output = command.output().await.map_err(|source| CephError::Spawn {
            command: label.clone(),
            source,
        })?;

        check_status(label, output)
    }

    /// Runs a command to completion under a timeout.
    async fn run_with_timeout(
        &self,
        mut command: Command,
        timeout: Duration,
    ) -> Result<Vec<u8>, CephError> {
        let label = command_label(&command);
        debug!("running `{}` (timeout {}s)", label, timeout.as_secs());

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| CephError::Timeout {
                command: label.clone(),
                timeout_secs: timeout.as_secs(),
            })?
            .map_err(|source| CephError::Spawn {
                command: label.clone(),
                source,
            })?;

        check_status(label, output)
    }

    /// Runs a command and returns its stdout as a UTF-8 string.
    async fn run_text(&self, command: Command) -> Result<String, CephError> {
        let label = command_label(&command);
        let stdout = self.run(command).await?;
        String::from_utf8(stdout).map_err(|_| CephError::InvalidUtf8 { command: label })
    }

    /// Base `rbd` invocation carrying config and keyring.
    fn rbd_command(&self) -> Command {
        let mut command = Command::new("rbd");
        command.arg("-c").arg(&self.conf).arg("-k").arg(&self.keyring);
        command
    }

    /// Fetches one image's metadata via `rbd info`.
    async fn image_info(&self, pool: &str, name: &str) -> Result<ImageHandle, CephError> {
        let mut command = self.rbd_command();
        command
            .arg("info")
            .arg("-p")
            .arg(pool)
            .arg(name)
            .arg("--format")
            .arg("json");
        let label = command_label(&command);

        let stdout = self.run_text(command).await?;
        let info: RbdInfo = serde_json::from_str(&stdout)
            .map_err(|source| CephError::InvalidJson { command: label, source })?;

        Ok(ImageHandle {
            name: name.to_string(),
            id: info.id,
            size: info.size,
            object_size: info.object_size,
            num_objs: info.objects,
            features: feature_mask(&info.features),
        })
    }
}

/// Folds `rbd info`'s feature names back into the numeric feature bitmask.
fn feature_mask(names: &[String]) -> u64 {
    names.iter().fold(0, |mask, name| mask | feature_bit(name))
}

fn feature_bit(name: &str) -> u64 {
    match name {
        "layering" => 1,
        "striping" => 2,
        "exclusive-lock" => 4,
        "object-map" => 8,
        "fast-diff" => 16,
        "deep-flatten" => 32,
        "journaling" => 64,
        "data-pool" => 128,
        _ => 0,
    }
}

/// Renders a command with its arguments for error messages and logs.
fn command_label(command: &Command) -> String {
    let std_command = command.as_std();
    let mut label = std_command.get_program().to_string_lossy().into_owned();
    for arg in std_command.get_args() {
        label.push(' ');
        label.push_str(&arg.to_string_lossy());
    }
    label
}

fn check_status(label: String, output: Output) -> Result<Vec<u8>, CephError> {
    if !output.status.success() {
        return Err(CephError::CommandFailed {
            command: label,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

#[async_trait]
impl PoolLister for CephCluster {
    /// Lists the pools enabled for RBD usage collection.
    ///
    /// Pools must be opted in on the cluster side:
    /// `ceph config set mgr mgr/prometheus/rbd_stats_pools <pool>[,<pool>...]`
    /// An empty value means zero pools, which is valid.
    async fn list_stats_pools(&self) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
        let mut command = Command::new("ceph");
        command
            .arg("-c")
            .arg(&self.conf)
            .arg("--cluster")
            .arg(&self.cluster)
            .arg("config")
            .arg("get")
            .arg("mgr")
            .arg("mgr/prometheus/rbd_stats_pools");

        let output = self.run_text(command).await?;
        Ok(split_pool_list(&output))
    }
}

/// Splits the comma-separated pool list, treating an empty value as zero
/// pools.
fn split_pool_list(output: &str) -> Vec<String> {
    output
        .trim()
        .split(',')
        .map(str::trim)
        .filter(|pool| !pool.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ImageLister for CephCluster {
    /// Enumerates the images of one pool with the metadata the resolver
    /// needs.
    ///
    /// `rbd ls` yields the names; each image's id, sizes and features come
    /// from a per-image `rbd info`. An image whose info query fails is
    /// skipped with a warning rather than failing the whole pool — it may
    /// have been deleted between the two calls.
    async fn list_images(
        &self,
        pool: &str,
    ) -> Result<Vec<ImageHandle>, Box<dyn Error + Send + Sync>> {
        let mut command = self.rbd_command();
        command.arg("ls").arg("-p").arg(pool).arg("--format").arg("json");
        let label = command_label(&command);

        let stdout = self.run_text(command).await?;
        let names: Vec<String> = serde_json::from_str(&stdout)
            .map_err(|source| CephError::InvalidJson { command: label, source })?;

        let mut images = Vec::with_capacity(names.len());
        for name in names {
            match self.image_info(pool, &name).await {
                Ok(image) => images.push(image),
                Err(e) => {
                    warn!("failed to stat image {}/{}, skipping: {}", pool, name, e);
                }
            }
        }

        Ok(images)
    }
}

#[async_trait]
impl BitmapReader for CephCluster {
    /// Reads a byte range of a RADOS object.
    ///
    /// `rados get` has no ranged read, so the whole object is fetched and
    /// sliced; object maps are tiny (two bits per backing object) so this
    /// costs nothing compared to the fallback query it replaces.
    async fn read(
        &self,
        pool: &str,
        object: &str,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        let mut command = Command::new("rados");
        command
            .arg("-c")
            .arg(&self.conf)
            .arg("--cluster")
            .arg(&self.cluster)
            .arg("-p")
            .arg(pool)
            .arg("get")
            .arg(object)
            .arg("-");

        let bytes = self.run(command).await?;

        let start = offset as usize;
        let end = start.checked_add(len).filter(|end| *end <= bytes.len());
        match end {
            Some(end) => Ok(bytes[start..end].to_vec()),
            None => Err(CephError::ShortObject {
                pool: pool.to_string(),
                object: object.to_string(),
                got: bytes.len(),
                offset,
                len,
            }
            .into()),
        }
    }
}

#[async_trait]
impl FallbackQuerier for CephCluster {
    /// Runs the pool-scoped `rbd du` usage query under the five-minute
    /// timeout.
    async fn query_pool_usage(
        &self,
        pool: &str,
    ) -> Result<Vec<PoolUsageEntry>, Box<dyn Error + Send + Sync>> {
        let mut command = self.rbd_command();
        command.arg("du").arg("-p").arg(pool).arg("--format").arg("json");
        let label = command_label(&command);

        let stdout = self.run_with_timeout(command, FALLBACK_TIMEOUT).await?;
        let stdout = String::from_utf8(stdout)
            .map_err(|_| CephError::InvalidUtf8 { command: label.clone() })?;

        let report: FallbackReport = serde_json::from_str(&stdout)
            .map_err(|source| CephError::InvalidJson { command: label, source })?;

        Ok(report.images)
    }
}
