//! In-memory store implementations.
//!
//! Back the default single-process assembly and the test suite. Each store
//! honors the same contracts a relational backend would: the usage store's
//! digest key is a unique constraint whose violation reports success, and
//! each retention delete uses that store's native time encoding.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;

use crate::ingest::record::{FlowRecord, PurgeStatRecord};

use super::{
    epoch_ms_now, ApplicationUsageBucket, DeviceRow, DeviceStore, FlowStore, JoinedFlowRow,
    NotificationEvent, NotificationStore, PingStatStore, TrafficStatStore, UsageStore,
};

const MS_PER_DAY: i64 = 86_400_000;

/// Device inventory over a MAC-keyed map.
#[derive(Default)]
pub struct MemoryDeviceStore {
    rows: RwLock<HashMap<String, DeviceRow>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, row: DeviceRow) {
        self.rows.write().insert(row.mac.to_ascii_lowercase(), row);
    }

    pub fn remove(&self, mac: &str) {
        self.rows.write().remove(&mac.to_ascii_lowercase());
    }
}

impl DeviceStore for MemoryDeviceStore {
    async fn list_all(&self) -> Result<Vec<DeviceRow>> {
        Ok(self.rows.read().values().cloned().collect())
    }

    async fn get_by_mac(&self, mac: &str) -> Result<Option<DeviceRow>> {
        Ok(self.rows.read().get(&mac.to_ascii_lowercase()).cloned())
    }
}

/// Flow and purge-stat tables.
#[derive(Default)]
pub struct MemoryFlowStore {
    flows: RwLock<Vec<FlowRecord>>,
    purge_stats: RwLock<Vec<PurgeStatRecord>>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.read().len()
    }

    pub fn purge_stat_count(&self) -> usize {
        self.purge_stats.read().len()
    }
}

impl FlowStore for MemoryFlowStore {
    async fn insert_flow(&self, rec: &FlowRecord) -> Result<()> {
        self.flows.write().push(rec.clone());
        Ok(())
    }

    async fn insert_purge_stat(&self, rec: &PurgeStatRecord) -> Result<()> {
        self.purge_stats.write().push(rec.clone());
        Ok(())
    }

    async fn query_recent_joined(&self, window: Duration) -> Result<Vec<JoinedFlowRow>> {
        let cutoff = epoch_ms_now() - window.as_millis() as i64;

        let purge_stats = self.purge_stats.read();
        let flows = self.flows.read();

        let mut joined = Vec::new();
        for flow in flows.iter().filter(|f| f.timeinsert >= cutoff) {
            let Some(stat) = purge_stats
                .iter()
                .find(|p| p.digest == flow.digest && p.timeinsert >= cutoff)
            else {
                continue;
            };

            joined.push(JoinedFlowRow {
                digest: flow.digest.clone(),
                mac: flow.mac.clone(),
                hostname: flow.hostname.clone(),
                app_name: flow.detected_app_name.clone(),
                timeinsert: flow.timeinsert,
                local_bytes: stat.local_bytes,
                other_bytes: stat.other_bytes,
                local_packets: stat.local_packets,
                other_packets: stat.other_packets,
            });
        }

        Ok(joined)
    }

    async fn delete_older_than_days(&self, days: u32) -> Result<u64> {
        let cutoff = epoch_ms_now() - i64::from(days) * MS_PER_DAY;

        let mut deleted = 0u64;
        {
            let mut flows = self.flows.write();
            let before = flows.len();
            flows.retain(|f| f.timeinsert >= cutoff);
            deleted += (before - flows.len()) as u64;
        }
        {
            let mut purge_stats = self.purge_stats.write();
            let before = purge_stats.len();
            purge_stats.retain(|p| p.timeinsert >= cutoff);
            deleted += (before - purge_stats.len()) as u64;
        }

        Ok(deleted)
    }
}

/// Usage buckets keyed by digest; duplicate inserts succeed as no-ops.
#[derive(Default)]
pub struct MemoryUsageStore {
    rows: RwLock<HashMap<String, ApplicationUsageBucket>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn get(&self, digest: &str) -> Option<ApplicationUsageBucket> {
        self.rows.read().get(digest).cloned()
    }
}

impl UsageStore for MemoryUsageStore {
    async fn exists_by_digest(&self, digest: &str) -> Result<bool> {
        Ok(self.rows.read().contains_key(digest))
    }

    async fn insert(&self, bucket: &ApplicationUsageBucket) -> Result<()> {
        // Unique-constraint violation is success: keep the first row.
        self.rows
            .write()
            .entry(bucket.digest.clone())
            .or_insert_with(|| bucket.clone());
        Ok(())
    }
}

/// Notification rows; retention cutoff in epoch milliseconds.
#[derive(Default)]
pub struct MemoryNotificationStore {
    rows: RwLock<Vec<NotificationEvent>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<NotificationEvent> {
        self.rows.read().clone()
    }
}

impl NotificationStore for MemoryNotificationStore {
    async fn insert(&self, event: &NotificationEvent) -> Result<()> {
        self.rows.write().push(event.clone());
        Ok(())
    }

    async fn delete_older_than_ms(&self, cutoff_ms: i64) -> Result<u64> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|n| n.detected_at >= cutoff_ms);
        Ok((before - rows.len()) as u64)
    }
}

/// Ping-statistics timestamps; retention cutoff in epoch milliseconds.
#[derive(Default)]
pub struct MemoryPingStatStore {
    timestamps_ms: RwLock<Vec<i64>>,
}

impl MemoryPingStatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, timestamp_ms: i64) {
        self.timestamps_ms.write().push(timestamp_ms);
    }

    pub fn len(&self) -> usize {
        self.timestamps_ms.read().len()
    }
}

impl PingStatStore for MemoryPingStatStore {
    async fn delete_older_than_ms(&self, cutoff_ms: i64) -> Result<u64> {
        let mut rows = self.timestamps_ms.write();
        let before = rows.len();
        rows.retain(|&t| t >= cutoff_ms);
        Ok((before - rows.len()) as u64)
    }
}

/// Traffic-statistics (vnstat-hourly) timestamps; retention cutoff in
/// epoch seconds.
#[derive(Default)]
pub struct MemoryTrafficStatStore {
    timestamps_secs: RwLock<Vec<i64>>,
}

impl MemoryTrafficStatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, timestamp_secs: i64) {
        self.timestamps_secs.write().push(timestamp_secs);
    }

    pub fn len(&self) -> usize {
        self.timestamps_secs.read().len()
    }
}

impl TrafficStatStore for MemoryTrafficStatStore {
    async fn delete_older_than_secs(&self, cutoff_secs: i64) -> Result<u64> {
        let mut rows = self.timestamps_secs.write();
        let before = rows.len();
        rows.retain(|&t| t >= cutoff_secs);
        Ok((before - rows.len()) as u64)
    }
}
