//! Store traits for the collector's external persistence collaborators.
//!
//! The daemon never talks to a storage engine directly; every durable
//! read/write goes through one of these traits. Each time-series store
//! exposes its retention delete in its own native time encoding, which is
//! part of the external interface and must not be unified.

pub mod memory;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;

use crate::ingest::record::{FlowRecord, PurgeStatRecord};

/// A device row as stored in the device inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRow {
    pub mac: String,
    pub hostname: String,
    pub ip: String,
}

/// One flow joined with its purge-stat counters on the shared digest,
/// as returned by [`FlowStore::query_recent_joined`].
#[derive(Debug, Clone)]
pub struct JoinedFlowRow {
    pub digest: String,
    pub mac: String,
    pub hostname: String,
    pub app_name: String,
    /// Flow insertion time, epoch milliseconds.
    pub timeinsert: i64,
    pub local_bytes: u64,
    pub other_bytes: u64,
    pub local_packets: u64,
    pub other_packets: u64,
}

/// Hourly per-device, per-application usage fact.
///
/// Keyed by (mac, app_name, bucket_start, digest). The digest component
/// makes this a fact table of events: a bucket for a given digest is
/// written at most once, no matter how many aggregation cycles observe it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationUsageBucket {
    pub mac: String,
    pub hostname: String,
    pub app_name: String,
    /// Hour-aligned bucket start, epoch milliseconds.
    pub bucket_start: i64,
    pub digest: String,
    pub total_bytes: u64,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub packets: u64,
    pub flow_count: u32,
}

/// Operator-facing notification severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// An operator-relevant event (connection failure, new device, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub id: String,
    pub severity: Severity,
    pub kind: String,
    pub message: String,
    /// Detection time, epoch milliseconds.
    pub detected_at: i64,
    pub archived: bool,
}

/// Device inventory read interface.
pub trait DeviceStore: Send + Sync + 'static {
    /// Returns every known device.
    fn list_all(&self) -> impl std::future::Future<Output = Result<Vec<DeviceRow>>> + Send;

    /// Looks up a single device by (lowercase) MAC address.
    fn get_by_mac(
        &self,
        mac: &str,
    ) -> impl std::future::Future<Output = Result<Option<DeviceRow>>> + Send;
}

/// Flow and purge-stat persistence.
pub trait FlowStore: Send + Sync + 'static {
    fn insert_flow(&self, rec: &FlowRecord) -> impl std::future::Future<Output = Result<()>> + Send;

    fn insert_purge_stat(
        &self,
        rec: &PurgeStatRecord,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Joins flow and purge-stat rows on digest, restricted to rows whose
    /// insertion time falls within the trailing `window`.
    fn query_recent_joined(
        &self,
        window: Duration,
    ) -> impl std::future::Future<Output = Result<Vec<JoinedFlowRow>>> + Send;

    /// Deletes rows older than `days`; the store evaluates the relative
    /// cutoff with its own clock. Returns the number of rows deleted.
    fn delete_older_than_days(
        &self,
        days: u32,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;
}

/// Usage-bucket persistence with an idempotent-insert contract.
pub trait UsageStore: Send + Sync + 'static {
    fn exists_by_digest(
        &self,
        digest: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Inserts a bucket. A unique-constraint violation on the digest key
    /// must be reported as success, not an error.
    fn insert(
        &self,
        bucket: &ApplicationUsageBucket,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Notification persistence. Retention cutoff is epoch milliseconds.
pub trait NotificationStore: Send + Sync + 'static {
    fn insert(
        &self,
        event: &NotificationEvent,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn delete_older_than_ms(
        &self,
        cutoff_ms: i64,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;
}

/// Ping-statistics retention. Cutoff is epoch milliseconds.
pub trait PingStatStore: Send + Sync + 'static {
    fn delete_older_than_ms(
        &self,
        cutoff_ms: i64,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;
}

/// Traffic-statistics (vnstat-hourly) retention. Cutoff is epoch seconds.
pub trait TrafficStatStore: Send + Sync + 'static {
    fn delete_older_than_secs(
        &self,
        cutoff_secs: i64,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;
}

/// Epoch milliseconds for a `SystemTime`.
pub fn epoch_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current wall clock as epoch milliseconds.
pub fn epoch_ms_now() -> i64 {
    epoch_ms(SystemTime::now())
}
