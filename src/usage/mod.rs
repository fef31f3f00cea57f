// Usage module - data model and cluster capability traits
//
// This module defines:
// 1. The image/usage data model shared by the whole exporter
// 2. The capability traits through which the collector talks to the cluster
//    (pool listing, image enumeration, object-map reads, fallback queries)
//
// The traits are consumed through generics so that the collection cycle and
// the per-image resolver can be driven by in-memory stubs in tests instead
// of a live Ceph cluster.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;

// Re-export the usage computation implementations
pub mod object_map;
pub mod resolver;

/// RBD feature bit indicating the image maintains an object map.
///
/// Feature bitmask values (from the RBD on-disk format):
///
/// | mask | feature        |
/// | ---- | -------------- |
/// | 1    | layering       |
/// | 2    | striping       |
/// | 4    | exclusive-lock |
/// | 8    | object-map     |
/// | 16   | fast-diff      |
/// | 32   | deep-flatten   |
/// | 64   | journaling     |
/// | 128  | data-pool      |
pub const FEATURE_OBJECT_MAP: u64 = 8;

/// Metadata for one RBD image as reported by the cluster.
///
/// Produced by [`ImageLister::list_images`]. The `(size, object_size,
/// num_objs)` triple parameterizes the object-map scan; `features` decides
/// whether that scan is applicable at all.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    /// Image name, unique within its pool
    pub name: String,

    /// Internal image id; the object map lives in `rbd_object_map.<id>`
    pub id: String,

    /// Provisioned size in bytes
    pub size: u64,

    /// Size of one allocation unit (RADOS object) in bytes
    pub object_size: u64,

    /// Number of allocation units backing the image
    pub num_objs: u64,

    /// RBD feature bitmask
    pub features: u64,
}

impl ImageHandle {
    /// Returns true if the image maintains an object map, i.e. the fast
    /// bitmap scan path is usable for it.
    pub fn has_object_map(&self) -> bool {
        self.features & FEATURE_OBJECT_MAP == FEATURE_OBJECT_MAP
    }
}

/// One row of the fallback `rbd du` report for a pool.
///
/// Deserialized from the external tool's JSON output, shape:
/// `{"images": [{"name": ..., "id": ..., "provisioned_size": ..., "used_size": ...}]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolUsageEntry {
    /// Image name
    pub name: String,

    /// Internal image id; older tool versions omit it
    #[serde(default)]
    pub id: String,

    /// Provisioned size in bytes
    pub provisioned_size: u64,

    /// Used size in bytes
    pub used_size: u64,
}

/// Top-level shape of the fallback query's JSON output.
#[derive(Debug, Deserialize)]
pub struct FallbackReport {
    pub images: Vec<PoolUsageEntry>,
}

/// Normalized usage measurement for one image.
///
/// This is the unit of data in a metric snapshot, identical regardless of
/// whether the object-map scan or the fallback query produced it.
/// `used_size > provisioned_size` is not expected but passes through
/// unmodified: upstream inconsistencies are reported, not clamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUsage {
    /// Pool the image belongs to
    pub pool: String,

    /// Image name
    pub image: String,

    /// Internal image id
    pub id: String,

    /// Provisioned size in bytes
    pub provisioned_size: u64,

    /// Actually-used size in bytes
    pub used_size: u64,
}

/// Lists the pools configured for usage collection.
///
/// An empty list is a valid result (no pools configured). A failure of the
/// listing itself is fatal: without the pool set nothing can be collected,
/// so the error propagates out of the collection loop instead of being
/// swallowed like per-pool and per-image errors.
#[async_trait]
pub trait PoolLister: Send + Sync {
    async fn list_stats_pools(&self) -> Result<Vec<String>, Box<dyn Error + Send + Sync>>;
}

/// Enumerates the RBD images of one pool.
#[async_trait]
pub trait ImageLister: Send + Sync {
    async fn list_images(
        &self,
        pool: &str,
    ) -> Result<Vec<ImageHandle>, Box<dyn Error + Send + Sync>>;
}

/// Reads a byte range from a named RADOS object.
///
/// The scanner uses this to fetch an image's object map. Implementations may
/// serve the range from a whole-object read; only the returned slice matters.
#[async_trait]
pub trait BitmapReader: Send + Sync {
    async fn read(
        &self,
        pool: &str,
        object: &str,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>>;
}

/// Runs the slow, pool-scoped external usage query (`rbd du`).
///
/// Used when an image has no object map or its scan failed. Implementations
/// must bound the invocation with a timeout; a timeout or malformed output
/// surfaces as an error and the affected images are simply omitted from the
/// current cycle.
#[async_trait]
pub trait FallbackQuerier: Send + Sync {
    async fn query_pool_usage(
        &self,
        pool: &str,
    ) -> Result<Vec<PoolUsageEntry>, Box<dyn Error + Send + Sync>>;
}
