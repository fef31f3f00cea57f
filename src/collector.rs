// Collector module - the continuous collection cycle
//
// One pass walks the whole cluster: enumerate pools, enumerate each pool's
// images, resolve every image's usage, then publish the result as one
// immutable snapshot stamped with the pass's wall-clock duration. Passes
// run back-to-back on a single task and never overlap; only publication is
// shared with the serving side.
//
// # Error Handling
// - Pool-list failure is fatal and propagates out of the loop: without the
//   pool set there is nothing to collect.
// - Per-pool and per-image failures are logged and skipped; the pass always
//   completes and always publishes, even an empty snapshot.
// - There is no retry with backoff: the next pass is the retry.

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::snapshot::{MetricSnapshot, SnapshotPublisher};
use crate::usage::{resolver, BitmapReader, FallbackQuerier, ImageLister, PoolLister};

/// Drives collection passes against an injected cluster implementation and
/// publishes each pass's snapshot.
pub struct UsageCollector<C> {
    cluster: C,
    publisher: Arc<SnapshotPublisher>,
}

impl<C> UsageCollector<C>
where
    C: PoolLister + ImageLister + BitmapReader + FallbackQuerier,
{
    /// Creates a collector publishing through the given publisher.
    pub fn new(cluster: C, publisher: Arc<SnapshotPublisher>) -> Self {
        UsageCollector { cluster, publisher }
    }

    /// Runs collection passes forever, back-to-back.
    ///
    /// Returns only on a fatal error (the pool-list query failing), which
    /// the caller should treat as reason to abort the process.
    pub async fn run(self) -> Result<(), Box<dyn Error + Send + Sync>> {
        info!("starting collection loop");
        loop {
            let snapshot = self.collect_pass().await?;
            self.publisher.publish(Arc::new(snapshot));
        }
    }

    /// Performs one full collection pass and returns its snapshot.
    ///
    /// Only the pool-list error escapes; everything below that granularity
    /// reduces to "this pool/image contributes nothing this cycle".
    pub async fn collect_pass(&self) -> Result<MetricSnapshot, Box<dyn Error + Send + Sync>> {
        let start = Instant::now();

        let pools = self.cluster.list_stats_pools().await?;
        if pools.is_empty() {
            info!("no pools configured for usage collection");
        }

        let mut images = Vec::new();
        for pool in &pools {
            info!("collecting pool {}", pool);

            let handles = match self.cluster.list_images(pool).await {
                Ok(handles) => handles,
                Err(e) => {
                    error!("failed to list images in pool '{}', skipping: {}", pool, e);
                    continue;
                }
            };

            for handle in &handles {
                if let Some(usage) = resolver::resolve_image(&self.cluster, pool, handle).await {
                    images.push(usage);
                }
            }
        }

        let duration = start.elapsed().as_secs_f64();
        info!(
            "collection pass finished: {} image(s) across {} pool(s) in {:.3}s",
            images.len(),
            pools.len(),
            duration
        );

        Ok(MetricSnapshot::new(images, duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::{ImageHandle, PoolUsageEntry, FEATURE_OBJECT_MAP};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Stub cluster: one configurable pool/image topology, in-memory object
    /// maps, canned fallback answers.
    struct StubCluster {
        pools: Result<Vec<String>, String>,
        images: HashMap<String, Vec<ImageHandle>>,
        object_maps: HashMap<String, Vec<u8>>,
        fallback: HashMap<String, Vec<PoolUsageEntry>>,
        fallback_fails: bool,
    }

    impl StubCluster {
        fn new() -> Self {
            StubCluster {
                pools: Ok(Vec::new()),
                images: HashMap::new(),
                object_maps: HashMap::new(),
                fallback: HashMap::new(),
                fallback_fails: false,
            }
        }
    }

    #[async_trait]
    impl PoolLister for StubCluster {
        async fn list_stats_pools(&self) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
            self.pools.clone().map_err(|e| e.into())
        }
    }

    #[async_trait]
    impl ImageLister for StubCluster {
        async fn list_images(
            &self,
            pool: &str,
        ) -> Result<Vec<ImageHandle>, Box<dyn Error + Send + Sync>> {
            Ok(self.images.get(pool).cloned().unwrap_or_default())
        }
    }

    #[async_trait]
    impl BitmapReader for StubCluster {
        async fn read(
            &self,
            _pool: &str,
            object: &str,
            offset: u64,
            len: usize,
        ) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
            let bytes = self
                .object_maps
                .get(object)
                .ok_or_else(|| format!("no such object: {}", object))?;
            let start = (offset as usize).min(bytes.len());
            let end = (start + len).min(bytes.len());
            Ok(bytes[start..end].to_vec())
        }
    }

    #[async_trait]
    impl FallbackQuerier for StubCluster {
        async fn query_pool_usage(
            &self,
            pool: &str,
        ) -> Result<Vec<PoolUsageEntry>, Box<dyn Error + Send + Sync>> {
            if self.fallback_fails {
                return Err("rbd du timed out".into());
            }
            Ok(self.fallback.get(pool).cloned().unwrap_or_default())
        }
    }

    fn collector(stub: StubCluster) -> (UsageCollector<StubCluster>, Arc<SnapshotPublisher>) {
        let publisher = Arc::new(SnapshotPublisher::new());
        (
            UsageCollector::new(stub, Arc::clone(&publisher)),
            publisher,
        )
    }

    #[tokio::test]
    async fn test_end_to_end_pass_with_both_paths() {
        let mut stub = StubCluster::new();
        stub.pools = Ok(vec!["rbd".to_string()]);
        stub.images.insert(
            "rbd".to_string(),
            vec![
                // Fast path: object map present, 10 units, all unallocated
                ImageHandle {
                    name: "mapped".to_string(),
                    id: "a1".to_string(),
                    size: 10 * 4096,
                    object_size: 4096,
                    num_objs: 10,
                    features: FEATURE_OBJECT_MAP,
                },
                // Fallback path: no object-map feature
                ImageHandle {
                    name: "plain".to_string(),
                    id: "b2".to_string(),
                    size: 1 << 30,
                    object_size: 1 << 22,
                    num_objs: 256,
                    features: 1,
                },
            ],
        );
        stub.object_maps
            .insert("rbd_object_map.a1".to_string(), vec![0u8; 3]);
        stub.fallback.insert(
            "rbd".to_string(),
            vec![PoolUsageEntry {
                name: "plain".to_string(),
                id: "b2".to_string(),
                provisioned_size: 1 << 30,
                used_size: 12345,
            }],
        );

        let (collector, _publisher) = collector(stub);
        let snapshot = collector.collect_pass().await.unwrap();

        assert_eq!(snapshot.images.len(), 2);
        let mapped = snapshot.images.iter().find(|u| u.image == "mapped").unwrap();
        let plain = snapshot.images.iter().find(|u| u.image == "plain").unwrap();
        assert_eq!(mapped.used_size, 0);
        assert_eq!(plain.used_size, 12345);
        assert!(snapshot.scrape_duration_seconds >= 0.0);
    }

    #[tokio::test]
    async fn test_fallback_timeout_omits_pool_but_pass_completes() {
        let mut stub = StubCluster::new();
        stub.pools = Ok(vec!["rbd".to_string()]);
        stub.images.insert(
            "rbd".to_string(),
            vec![ImageHandle {
                name: "plain".to_string(),
                id: "b2".to_string(),
                size: 1 << 30,
                object_size: 1 << 22,
                num_objs: 256,
                features: 0,
            }],
        );
        stub.fallback_fails = true;

        let (collector, _publisher) = collector(stub);
        let snapshot = collector.collect_pass().await.unwrap();

        assert!(snapshot.images.is_empty());
        assert!(snapshot.scrape_duration_seconds >= 0.0);
    }

    #[tokio::test]
    async fn test_zero_pools_publishes_empty_snapshot() {
        let (collector, _publisher) = collector(StubCluster::new());
        let snapshot = collector.collect_pass().await.unwrap();
        assert!(snapshot.images.is_empty());
    }

    #[tokio::test]
    async fn test_pool_list_failure_is_fatal() {
        let mut stub = StubCluster::new();
        stub.pools = Err("mon unreachable".to_string());

        let (collector, _publisher) = collector(stub);
        assert!(collector.collect_pass().await.is_err());
    }

    #[tokio::test]
    async fn test_pool_with_no_images_does_not_block_others() {
        let mut stub = StubCluster::new();
        stub.pools = Ok(vec!["empty".to_string(), "rbd".to_string()]);
        stub.images.insert(
            "rbd".to_string(),
            vec![ImageHandle {
                name: "plain".to_string(),
                id: "c3".to_string(),
                size: 100,
                object_size: 10,
                num_objs: 10,
                features: 0,
            }],
        );
        stub.fallback.insert(
            "rbd".to_string(),
            vec![PoolUsageEntry {
                name: "plain".to_string(),
                id: "c3".to_string(),
                provisioned_size: 100,
                used_size: 50,
            }],
        );

        let (collector, _publisher) = collector(stub);
        let snapshot = collector.collect_pass().await.unwrap();
        assert_eq!(snapshot.images.len(), 1);
        assert_eq!(snapshot.images[0].pool, "rbd");
    }
}
