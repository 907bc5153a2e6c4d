//! Deduplicating aggregator: folds joined flow/purge-stat pairs into
//! hourly per-device, per-application usage buckets, exactly once per
//! digest.
//!
//! Runs on a fixed interval. The join window is deliberately narrow: a
//! flow whose purge stat arrives later than one window is never
//! aggregated. That lossy tradeoff is inherited behavior; the window is
//! configurable but its semantics are not to be "fixed" here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::export::HealthMetrics;
use crate::store::{ApplicationUsageBucket, FlowStore, JoinedFlowRow, UsageStore};

const MS_PER_HOUR: i64 = 3_600_000;

/// Per-cycle observability counters, reset each cycle. Not part of the
/// correctness contract.
#[derive(Default)]
pub struct CycleStats {
    processed: AtomicU64,
    inserted: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time read of one cycle's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSnapshot {
    pub processed: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl CycleStats {
    fn snapshot_reset(&self) -> CycleSnapshot {
        CycleSnapshot {
            processed: self.processed.swap(0, Ordering::Relaxed),
            inserted: self.inserted.swap(0, Ordering::Relaxed),
            skipped: self.skipped.swap(0, Ordering::Relaxed),
            errors: self.errors.swap(0, Ordering::Relaxed),
        }
    }
}

/// Interval-driven flow usage aggregation over a [`FlowStore`] and
/// [`UsageStore`].
pub struct Aggregator<F: FlowStore, U: UsageStore> {
    flows: Arc<F>,
    usage: Arc<U>,
    interval: Duration,
    window: Duration,
    stats: Arc<CycleStats>,
    health: Option<Arc<HealthMetrics>>,
}

impl<F: FlowStore, U: UsageStore> Clone for Aggregator<F, U> {
    fn clone(&self) -> Self {
        Self {
            flows: Arc::clone(&self.flows),
            usage: Arc::clone(&self.usage),
            interval: self.interval,
            window: self.window,
            stats: Arc::clone(&self.stats),
            health: self.health.as_ref().map(Arc::clone),
        }
    }
}

impl<F: FlowStore, U: UsageStore> Aggregator<F, U> {
    pub fn new(flows: Arc<F>, usage: Arc<U>, interval: Duration, window: Duration) -> Self {
        Self {
            flows,
            usage,
            interval,
            window,
            stats: Arc::new(CycleStats::default()),
            health: None,
        }
    }

    /// Attaches Prometheus metrics to cycle outcomes.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Runs one aggregation cycle and returns its counters.
    ///
    /// Per joined row: skip when a bucket with its digest already exists,
    /// insert otherwise. A store-level unique violation is reported as
    /// success by the [`UsageStore`] contract, so a concurrent cycle
    /// inserting the same digest is indistinguishable from a skip.
    /// Row-level errors are counted and logged, never fatal to the cycle.
    pub async fn run_cycle(&self) -> CycleSnapshot {
        let rows = match self.flows.query_recent_joined(self.window).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "joined flow query failed");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return self.stats.snapshot_reset();
            }
        };

        for row in rows {
            self.stats.processed.fetch_add(1, Ordering::Relaxed);

            match self.usage.exists_by_digest(&row.digest).await {
                Ok(true) => {
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(digest = %row.digest, error = %e, "usage existence check failed");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            let bucket = bucket_from_row(&row);
            match self.usage.insert(&bucket).await {
                Ok(()) => {
                    self.stats.inserted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(digest = %row.digest, error = %e, "usage bucket insert failed");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let snap = self.stats.snapshot_reset();

        if let Some(health) = &self.health {
            for (outcome, count) in [
                ("processed", snap.processed),
                ("inserted", snap.inserted),
                ("skipped", snap.skipped),
                ("errors", snap.errors),
            ] {
                if count > 0 {
                    health
                        .aggregate_rows
                        .with_label_values(&[outcome])
                        .inc_by(count as f64);
                }
            }
        }

        if snap.processed > 0 || snap.errors > 0 {
            debug!(
                processed = snap.processed,
                inserted = snap.inserted,
                skipped = snap.skipped,
                errors = snap.errors,
                "aggregation cycle",
            );
        }
        snap
    }

    /// Spawns the fixed-interval aggregation task.
    pub fn start(&self, cancel: CancellationToken) {
        let agg = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(agg.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick has nothing to join yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        agg.run_cycle().await;
                    }
                }
            }
        });
    }
}

/// Projects a joined row into its hourly usage bucket: hour-floored time
/// bucket, upload = local bytes, download = other bytes, flow count 1.
fn bucket_from_row(row: &JoinedFlowRow) -> ApplicationUsageBucket {
    ApplicationUsageBucket {
        mac: row.mac.clone(),
        hostname: row.hostname.clone(),
        app_name: row.app_name.clone(),
        bucket_start: hour_floor_ms(row.timeinsert),
        digest: row.digest.clone(),
        total_bytes: row.local_bytes + row.other_bytes,
        upload_bytes: row.local_bytes,
        download_bytes: row.other_bytes,
        packets: row.local_packets + row.other_packets,
        flow_count: 1,
    }
}

/// Floors an epoch-millisecond timestamp to the start of its hour.
pub fn hour_floor_ms(ms: i64) -> i64 {
    ms - ms.rem_euclid(MS_PER_HOUR)
}
