// Snapshot module - snapshot data, atomic publication and text exposition
//
// This module is responsible for:
// 1. The immutable per-cycle snapshot of all image usage measurements
// 2. Publishing snapshots so that scrapes never observe a half-built one
// 3. Rendering the current snapshot into Prometheus exposition text
//
// The collector and the HTTP server share exactly one thing: the publisher.
// The writer never mutates a snapshot after publishing it, so the single
// pointer swap inside `publish` is the only step that needs atomicity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::usage::ImageUsage;

/// One complete collection pass: every image measured this cycle plus the
/// pass's own wall-clock duration.
///
/// Snapshots are immutable after publication and are replaced wholesale by
/// the next cycle's output, never merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    /// When the pass finished
    pub collected_at: DateTime<Utc>,

    /// Wall-clock duration of the whole pass in seconds
    pub scrape_duration_seconds: f64,

    /// Usage for every image that could be measured this cycle
    pub images: Vec<ImageUsage>,
}

impl MetricSnapshot {
    /// Creates a snapshot stamped with the current time.
    pub fn new(images: Vec<ImageUsage>, scrape_duration_seconds: f64) -> Self {
        MetricSnapshot {
            collected_at: Utc::now(),
            scrape_duration_seconds,
            images,
        }
    }
}

/// Holds the most recently completed snapshot.
///
/// `publish` replaces the previous snapshot in a single step; `current`
/// hands out a reference-counted clone without ever blocking on collection.
/// Before the first cycle completes there is no snapshot and scrapes see an
/// empty body.
pub struct SnapshotPublisher {
    current: RwLock<Option<Arc<MetricSnapshot>>>,
}

impl SnapshotPublisher {
    /// Creates a publisher with no snapshot yet.
    pub fn new() -> Self {
        SnapshotPublisher {
            current: RwLock::new(None),
        }
    }

    /// Publishes a snapshot, atomically replacing the previous one.
    ///
    /// Publishing the same snapshot again is a no-op from the reader's
    /// point of view.
    pub fn publish(&self, snapshot: Arc<MetricSnapshot>) {
        debug!(
            "publishing snapshot with {} image(s), collected in {:.3}s",
            snapshot.images.len(),
            snapshot.scrape_duration_seconds
        );
        *self.current.write().unwrap() = Some(snapshot);
    }

    /// Returns the currently published snapshot, if any.
    pub fn current(&self) -> Option<Arc<MetricSnapshot>> {
        self.current.read().unwrap().clone()
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders a snapshot as Prometheus exposition text.
///
/// Emits two gauge series per image, labeled by image, pool and id, plus
/// the unlabeled scrape-duration gauge:
///
/// ```text
/// rbd_usage_bytes{image="img1",pool="rbd",id="1"} 536870912
/// rbd_total_provision_bytes{image="img1",pool="rbd",id="1"} 1073741824
/// rbd_usage_scrape_duration_seconds 1.5
/// ```
///
/// `None` (no snapshot published yet) renders as an empty body, which is
/// the serving-side contract for "nothing collected yet" — not an error.
pub fn render(snapshot: Option<&MetricSnapshot>) -> String {
    let snapshot = match snapshot {
        Some(snapshot) => snapshot,
        None => return String::new(),
    };

    let mut out = String::new();
    out.push_str("# HELP rbd_usage_bytes RBD used space in bytes\n");
    out.push_str("# TYPE rbd_usage_bytes gauge\n");
    out.push_str("# HELP rbd_total_provision_bytes RBD total size bytes provisioned\n");
    out.push_str("# TYPE rbd_total_provision_bytes gauge\n");
    out.push_str("# HELP rbd_usage_scrape_duration_seconds Amount of time each scrape takes\n");
    out.push_str("# TYPE rbd_usage_scrape_duration_seconds gauge\n");

    for usage in &snapshot.images {
        // writing to a String cannot fail
        let _ = writeln!(
            out,
            "rbd_usage_bytes{{image=\"{}\",pool=\"{}\",id=\"{}\"}} {}",
            usage.image, usage.pool, usage.id, usage.used_size
        );
        let _ = writeln!(
            out,
            "rbd_total_provision_bytes{{image=\"{}\",pool=\"{}\",id=\"{}\"}} {}",
            usage.image, usage.pool, usage.id, usage.provisioned_size
        );
    }

    let _ = writeln!(
        out,
        "rbd_usage_scrape_duration_seconds {}",
        snapshot.scrape_duration_seconds
    );

    out
}
