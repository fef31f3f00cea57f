// Usage resolver - decides how each image's usage is measured
//
// Per image the resolver picks one of two paths:
// 1. Fast path: decode the image's object map (requires the object-map
//    feature bit)
// 2. Fallback: run the pool-scoped external usage query and pick this
//    image's row out of the report
//
// Every failure here is per-image recoverable: the image is omitted from
// the current cycle and the next cycle tries again.

use tracing::{debug, info, warn};

use super::{object_map, BitmapReader, FallbackQuerier, ImageHandle, ImageUsage};

/// Resolves the usage of one image, or nothing if it cannot be measured
/// this cycle.
///
/// If the image carries the object-map feature the bitmap scan is attempted
/// first; any scan error demotes the image to the fallback query. An image
/// missing from the fallback report contributes no measurement at all — a
/// missing image is different from a confirmed-zero-usage image, so it is
/// never zero-filled.
///
/// # Arguments
/// * `cluster` - Cluster capabilities (object-map reads and fallback query)
/// * `pool` - Pool the image belongs to
/// * `image` - Image metadata from enumeration
///
/// # Returns
/// * `Some(ImageUsage)` - Usage measured by either path
/// * `None` - Image could not be measured this cycle (already logged)
pub async fn resolve_image<C>(cluster: &C, pool: &str, image: &ImageHandle) -> Option<ImageUsage>
where
    C: BitmapReader + FallbackQuerier,
{
    if image.has_object_map() {
        match object_map::scan(cluster, pool, &image.id, image.num_objs, image.object_size).await {
            Ok(used_size) => {
                info!(
                    "{}/{} usage calculated from object map: {} bytes",
                    pool, image.name, used_size
                );
                return Some(ImageUsage {
                    pool: pool.to_string(),
                    image: image.name.clone(),
                    id: image.id.clone(),
                    provisioned_size: image.size,
                    used_size,
                });
            }
            Err(e) => {
                warn!(
                    "{}/{} object map scan failed, falling back to usage query: {}",
                    pool, image.name, e
                );
            }
        }
    } else {
        debug!("{}/{} has no object-map feature", pool, image.name);
    }

    resolve_via_fallback(cluster, pool, image).await
}

/// Resolves an image through the pool-scoped fallback query.
///
/// The query reports the whole pool; only the row matching this image's
/// name is used. Query errors (including timeout) and a missing row both
/// end in omission.
async fn resolve_via_fallback<C>(cluster: &C, pool: &str, image: &ImageHandle) -> Option<ImageUsage>
where
    C: FallbackQuerier,
{
    let entries = match cluster.query_pool_usage(pool).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                "usage query for pool '{}' failed, omitting {}/{} this cycle: {}",
                pool, pool, image.name, e
            );
            return None;
        }
    };

    match entries.into_iter().find(|entry| entry.name == image.name) {
        Some(entry) => {
            info!(
                "{}/{} usage taken from fallback query: {} bytes",
                pool, image.name, entry.used_size
            );
            Some(ImageUsage {
                pool: pool.to_string(),
                image: entry.name,
                id: entry.id,
                provisioned_size: entry.provisioned_size,
                used_size: entry.used_size,
            })
        }
        None => {
            warn!(
                "usage query for pool '{}' returned no entry for image '{}', omitting",
                pool, image.name
            );
            None
        }
    }
}
