//! Retention purge scheduler.
//!
//! Runs once at startup and then once after each local midnight,
//! re-computing the next fire time after every run so clock and DST
//! changes are absorbed instead of drifting a fixed-period interval.
//! Each run fires independent deletes against every time-series store;
//! one store's failure never blocks another's. Each store compares
//! against the horizon in its own native time encoding: the flow store
//! takes a relative day horizon evaluated by its own clock, notification
//! and ping-stats stores take epoch-millisecond cutoffs, the
//! traffic-statistics store takes an epoch-second cutoff.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, Local, TimeZone};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::HealthMetrics;
use crate::store::{epoch_ms_now, FlowStore, NotificationStore, PingStatStore, TrafficStatStore};

const MS_PER_DAY: i64 = 86_400_000;

/// Daily retention purge across all time-series stores.
pub struct PurgeScheduler<F, N, P, T>
where
    F: FlowStore,
    N: NotificationStore,
    P: PingStatStore,
    T: TrafficStatStore,
{
    flows: Arc<F>,
    notifications: Arc<N>,
    ping_stats: Arc<P>,
    traffic_stats: Arc<T>,
    retention_days: Arc<AtomicU32>,
    health: Option<Arc<HealthMetrics>>,
}

impl<F, N, P, T> Clone for PurgeScheduler<F, N, P, T>
where
    F: FlowStore,
    N: NotificationStore,
    P: PingStatStore,
    T: TrafficStatStore,
{
    fn clone(&self) -> Self {
        Self {
            flows: Arc::clone(&self.flows),
            notifications: Arc::clone(&self.notifications),
            ping_stats: Arc::clone(&self.ping_stats),
            traffic_stats: Arc::clone(&self.traffic_stats),
            retention_days: Arc::clone(&self.retention_days),
            health: self.health.as_ref().map(Arc::clone),
        }
    }
}

impl<F, N, P, T> PurgeScheduler<F, N, P, T>
where
    F: FlowStore,
    N: NotificationStore,
    P: PingStatStore,
    T: TrafficStatStore,
{
    pub fn new(
        flows: Arc<F>,
        notifications: Arc<N>,
        ping_stats: Arc<P>,
        traffic_stats: Arc<T>,
        retention_days: u32,
    ) -> Self {
        Self {
            flows,
            notifications,
            ping_stats,
            traffic_stats,
            retention_days: Arc::new(AtomicU32::new(retention_days)),
            health: None,
        }
    }

    /// Attaches Prometheus metrics to purge runs.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Changes the retention horizon live; takes effect on the next run.
    pub fn set_retention_days(&self, days: u32) {
        let old = self.retention_days.swap(days, Ordering::SeqCst);
        if old != days {
            info!(from = old, to = days, "retention horizon updated");
        }
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days.load(Ordering::SeqCst)
    }

    /// Executes one purge run: independent, concurrent deletes against
    /// every store, each failure logged on its own.
    pub async fn run_once(&self) {
        let days = self.retention_days();
        let cutoff_ms = epoch_ms_now() - i64::from(days) * MS_PER_DAY;
        let cutoff_secs = cutoff_ms / 1_000;

        debug!(days, "purge run starting");

        let (flows, notifications, pings, traffic) = tokio::join!(
            self.flows.delete_older_than_days(days),
            self.notifications.delete_older_than_ms(cutoff_ms),
            self.ping_stats.delete_older_than_ms(cutoff_ms),
            self.traffic_stats.delete_older_than_secs(cutoff_secs),
        );

        let mut total = 0u64;
        for (store, result) in [
            ("flows", flows),
            ("notifications", notifications),
            ("ping_stats", pings),
            ("traffic_stats", traffic),
        ] {
            match result {
                Ok(deleted) => {
                    total += deleted;
                    if deleted > 0 {
                        debug!(store, deleted, "purged rows");
                    }
                }
                Err(e) => warn!(store, error = %e, "purge failed"),
            }
        }

        if let Some(health) = &self.health {
            health.purge_runs.inc();
        }

        info!(days, deleted = total, "purge run complete");
    }

    /// Spawns the scheduler: one run immediately, then a self-re-arming
    /// sleep until each next local midnight.
    pub fn start(&self, cancel: CancellationToken) {
        let scheduler = self.clone();

        tokio::spawn(async move {
            scheduler.run_once().await;

            loop {
                let wait = duration_until_next_midnight(Local::now());
                debug!(next_run_in = ?wait, "purge scheduled");

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {
                        scheduler.run_once().await;
                    }
                }
            }
        });
    }
}

/// Time until the next midnight in `now`'s timezone.
///
/// Falls back to 24 hours when the next midnight does not resolve to a
/// unique local instant (DST gap); the subsequent re-arm self-corrects.
pub fn duration_until_next_midnight<Tz: TimeZone>(now: DateTime<Tz>) -> Duration {
    let next_day = match now.date_naive().checked_add_days(Days::new(1)) {
        Some(d) => d,
        None => return Duration::from_secs(86_400),
    };
    let midnight = match next_day.and_hms_opt(0, 0, 0) {
        Some(m) => m,
        None => return Duration::from_secs(86_400),
    };

    match now.timezone().from_local_datetime(&midnight).earliest() {
        Some(next) => (next - now)
            .to_std()
            .unwrap_or(Duration::from_secs(86_400))
            .max(Duration::from_secs(1)),
        None => Duration::from_secs(86_400),
    }
}

#[cfg(test)]
mod tests {
    use chrono::FixedOffset;

    use super::*;
    use crate::store::memory::{
        MemoryFlowStore, MemoryNotificationStore, MemoryPingStatStore, MemoryTrafficStatStore,
    };
    use crate::store::{NotificationEvent, NotificationStore as _, Severity};

    fn utc_like() -> FixedOffset {
        FixedOffset::east_opt(0).expect("valid offset")
    }

    #[test]
    fn test_duration_until_next_midnight_mid_day() {
        let now = utc_like()
            .with_ymd_and_hms(2024, 3, 10, 15, 30, 0)
            .single()
            .expect("valid time");
        let wait = duration_until_next_midnight(now);
        assert_eq!(wait, Duration::from_secs(8 * 3600 + 30 * 60));
    }

    #[test]
    fn test_duration_until_next_midnight_just_after_midnight() {
        let now = utc_like()
            .with_ymd_and_hms(2024, 3, 10, 0, 0, 1)
            .single()
            .expect("valid time");
        let wait = duration_until_next_midnight(now);
        assert_eq!(wait, Duration::from_secs(86_400 - 1));
    }

    #[test]
    fn test_duration_until_next_midnight_at_midnight() {
        let now = utc_like()
            .with_ymd_and_hms(2024, 3, 10, 0, 0, 0)
            .single()
            .expect("valid time");
        // Schedules the *next* midnight, a full day out.
        assert_eq!(duration_until_next_midnight(now), Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn test_run_once_purges_each_store_in_its_encoding() {
        let flows = Arc::new(MemoryFlowStore::new());
        let notifications = Arc::new(MemoryNotificationStore::new());
        let pings = Arc::new(MemoryPingStatStore::new());
        let traffic = Arc::new(MemoryTrafficStatStore::new());

        let now_ms = epoch_ms_now();
        let old_ms = now_ms - 8 * MS_PER_DAY;

        notifications
            .insert(&NotificationEvent {
                id: "old".to_string(),
                severity: Severity::Info,
                kind: "test".to_string(),
                message: String::new(),
                detected_at: old_ms,
                archived: false,
            })
            .await
            .expect("insert");
        pings.record(old_ms);
        pings.record(now_ms);
        traffic.record(old_ms / 1_000);
        traffic.record(now_ms / 1_000);

        let scheduler = PurgeScheduler::new(
            flows,
            Arc::clone(&notifications),
            Arc::clone(&pings),
            Arc::clone(&traffic),
            7,
        );
        scheduler.run_once().await;

        assert!(notifications.all().is_empty());
        assert_eq!(pings.len(), 1);
        assert_eq!(traffic.len(), 1);
    }

    #[tokio::test]
    async fn test_set_retention_days_applies_to_next_run() {
        let flows = Arc::new(MemoryFlowStore::new());
        let notifications = Arc::new(MemoryNotificationStore::new());
        let pings = Arc::new(MemoryPingStatStore::new());
        let traffic = Arc::new(MemoryTrafficStatStore::new());

        // Two days old: survives a 7-day horizon, not a 1-day one.
        pings.record(epoch_ms_now() - 2 * MS_PER_DAY);

        let scheduler =
            PurgeScheduler::new(flows, notifications, Arc::clone(&pings), traffic, 7);

        scheduler.run_once().await;
        assert_eq!(pings.len(), 1);

        scheduler.set_retention_days(1);
        assert_eq!(scheduler.retention_days(), 1);

        scheduler.run_once().await;
        assert_eq!(pings.len(), 0);
    }
}
