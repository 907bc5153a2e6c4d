//! Persistence dispatcher: the only component that writes canonical
//! records to durable stores.
//!
//! Flow and purge-stat insert failures are logged and surfaced to the
//! caller, never retried. Notification writes are infallible at this
//! boundary: they are issued from error handlers, so a failure here is
//! logged and swallowed.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;
use uuid::Uuid;

use crate::ingest::record::{FlowRecord, PurgeStatRecord};
use crate::store::{epoch_ms_now, FlowStore, NotificationEvent, NotificationStore, Severity};

pub struct Dispatcher<F: FlowStore, N: NotificationStore> {
    flows: Arc<F>,
    notifications: Arc<N>,
}

impl<F: FlowStore, N: NotificationStore> Clone for Dispatcher<F, N> {
    fn clone(&self) -> Self {
        Self {
            flows: Arc::clone(&self.flows),
            notifications: Arc::clone(&self.notifications),
        }
    }
}

impl<F: FlowStore, N: NotificationStore> Dispatcher<F, N> {
    pub fn new(flows: Arc<F>, notifications: Arc<N>) -> Self {
        Self {
            flows,
            notifications,
        }
    }

    /// Single-row flow insert. Failure is logged and returned to the
    /// caller; never retried.
    pub async fn save_flow(&self, rec: &FlowRecord) -> Result<()> {
        self.flows.insert_flow(rec).await.map_err(|e| {
            warn!(digest = %rec.digest, error = %e, "flow insert failed");
            e
        })
    }

    /// Single-row purge-stat insert, same failure policy as `save_flow`.
    pub async fn save_purge_stat(&self, rec: &PurgeStatRecord) -> Result<()> {
        self.flows.insert_purge_stat(rec).await.map_err(|e| {
            warn!(digest = %rec.digest, error = %e, "purge-stat insert failed");
            e
        })
    }

    /// Writes an operator notification with a fresh id and the current
    /// time. Never fails past this boundary.
    pub async fn save_notification(&self, message: &str, severity: Severity, kind: &str) {
        let event = NotificationEvent {
            id: Uuid::new_v4().to_string(),
            severity,
            kind: kind.to_string(),
            message: message.to_string(),
            detected_at: epoch_ms_now(),
            archived: false,
        };

        if let Err(e) = self.notifications.insert(&event).await {
            warn!(kind, error = %e, "notification insert failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;
    use crate::store::memory::{MemoryFlowStore, MemoryNotificationStore};

    fn flow_record(digest: &str) -> FlowRecord {
        FlowRecord {
            timeinsert: epoch_ms_now(),
            hostname: "laptop".to_string(),
            ip: "192.168.1.10".to_string(),
            mac: "aa:bb:cc:00:11:22".to_string(),
            fqdn: "example.com".to_string(),
            dest_ip: "93.184.216.34".to_string(),
            dest_port: 443,
            detected_protocol_name: "HTTPS".to_string(),
            detected_app_name: "TLS.Example".to_string(),
            interface: "br-lan".to_string(),
            internal: true,
            risk_score: 0,
            risk_score_client: 0,
            risk_score_server: 0,
            first_seen_at: 0,
            digest: digest.to_string(),
        }
    }

    #[tokio::test]
    async fn test_save_flow_and_purge_stat() {
        let flows = Arc::new(MemoryFlowStore::new());
        let notifications = Arc::new(MemoryNotificationStore::new());
        let dispatcher = Dispatcher::new(Arc::clone(&flows), notifications);

        dispatcher
            .save_flow(&flow_record("d-1"))
            .await
            .expect("insert ok");

        dispatcher
            .save_purge_stat(&PurgeStatRecord {
                digest: "d-1".to_string(),
                timeinsert: epoch_ms_now(),
                local_bytes: 10,
                other_bytes: 20,
                local_packets: 1,
                other_packets: 2,
                reason: "idle".to_string(),
            })
            .await
            .expect("insert ok");

        assert_eq!(flows.flow_count(), 1);
        assert_eq!(flows.purge_stat_count(), 1);
    }

    #[tokio::test]
    async fn test_save_notification_sets_id_and_time() {
        let flows = Arc::new(MemoryFlowStore::new());
        let notifications = Arc::new(MemoryNotificationStore::new());
        let dispatcher = Dispatcher::new(flows, Arc::clone(&notifications));

        dispatcher
            .save_notification("agent unreachable", Severity::Critical, "connection")
            .await;

        let rows = notifications.all();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].id.is_empty());
        assert!(rows[0].detected_at > 0);
        assert!(!rows[0].archived);
        assert_eq!(rows[0].severity, Severity::Critical);
    }

    /// NotificationStore that always fails.
    struct FailingNotificationStore;

    impl NotificationStore for FailingNotificationStore {
        async fn insert(&self, _event: &NotificationEvent) -> Result<()> {
            bail!("store unavailable")
        }

        async fn delete_older_than_ms(&self, _cutoff_ms: i64) -> Result<u64> {
            bail!("store unavailable")
        }
    }

    #[tokio::test]
    async fn test_save_notification_swallows_store_failure() {
        let flows = Arc::new(MemoryFlowStore::new());
        let dispatcher = Dispatcher::new(flows, Arc::new(FailingNotificationStore));

        // Must not panic or propagate; this is invoked from error paths.
        dispatcher
            .save_notification("agent unreachable", Severity::Warning, "connection")
            .await;
    }
}
