//! Wire-format structs for agent-emitted JSON records and the canonical
//! records the decoder produces from them.

use serde::Deserialize;

/// One newline-delimited JSON object as emitted by the traffic-inspection
/// agent. Only `flow` and `flow_purge` records are processed; anything else
/// is ignored. Never persisted as-is.
#[derive(Debug, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub interface: String,

    #[serde(default)]
    pub internal: bool,

    /// Termination reason, present on `flow_purge` records.
    #[serde(default)]
    pub reason: Option<String>,

    pub flow: Option<FlowPayload>,
}

/// The nested `flow` object carried by both `flow` and `flow_purge` records.
#[derive(Debug, Deserialize)]
pub struct FlowPayload {
    #[serde(default)]
    pub digest: String,

    #[serde(default)]
    pub local_mac: String,

    #[serde(default)]
    pub local_ip: String,

    #[serde(default)]
    pub other_ip: String,

    #[serde(default)]
    pub other_port: u16,

    #[serde(default)]
    pub detected_protocol_name: String,

    pub detected_application_name: Option<String>,

    pub host_server_name: Option<String>,

    pub ssl: Option<SslPayload>,

    pub risks: Option<RisksPayload>,

    /// Epoch milliseconds, agent clock.
    #[serde(default)]
    pub first_seen_at: i64,

    // Final counters, present on flow_purge records.
    #[serde(default)]
    pub local_bytes: u64,

    #[serde(default)]
    pub other_bytes: u64,

    #[serde(default)]
    pub local_packets: u64,

    #[serde(default)]
    pub other_packets: u64,
}

#[derive(Debug, Deserialize)]
pub struct SslPayload {
    pub client_sni: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RisksPayload {
    #[serde(default)]
    pub ndpi_risk_score: u32,

    #[serde(default)]
    pub ndpi_risk_score_client: u32,

    #[serde(default)]
    pub ndpi_risk_score_server: u32,
}

/// Canonical representation of an observed network flow.
///
/// Created by the decoder, enriched with device identity, persisted once,
/// immutable thereafter. Deleted only by the retention purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRecord {
    /// Local arrival time, epoch milliseconds.
    pub timeinsert: i64,
    pub hostname: String,
    pub ip: String,
    /// Lowercase MAC of the local device.
    pub mac: String,
    /// Destination FQDN; TLS client-hello SNI preferred over the
    /// application-layer host header, empty when both are absent.
    pub fqdn: String,
    pub dest_ip: String,
    pub dest_port: u16,
    pub detected_protocol_name: String,
    pub detected_app_name: String,
    pub interface: String,
    pub internal: bool,
    pub risk_score: u32,
    pub risk_score_client: u32,
    pub risk_score_server: u32,
    /// Agent-reported first-seen time, epoch milliseconds.
    pub first_seen_at: i64,
    /// Correlation key shared with the flow's eventual purge-stat record.
    pub digest: String,
}

/// Final byte/packet counters reported when the agent purges a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeStatRecord {
    pub digest: String,
    /// Local arrival time, epoch milliseconds.
    pub timeinsert: i64,
    pub local_bytes: u64,
    pub other_bytes: u64,
    pub local_packets: u64,
    pub other_packets: u64,
    pub reason: String,
}

/// Classification of one decoded line, used for ingest counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Flow = 0,
    PurgeStat = 1,
    Ignored = 2,
    Invalid = 3,
}

/// Number of [`RecordKind`] variants.
pub const RECORD_KIND_COUNT: usize = 4;

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Flow => "flow",
            RecordKind::PurgeStat => "purge_stat",
            RecordKind::Ignored => "ignored",
            RecordKind::Invalid => "invalid",
        }
    }

    pub fn from_index(i: usize) -> Option<Self> {
        match i {
            0 => Some(RecordKind::Flow),
            1 => Some(RecordKind::PurgeStat),
            2 => Some(RecordKind::Ignored),
            3 => Some(RecordKind::Invalid),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_event_minimal() {
        let event: RawEvent = serde_json::from_str(r#"{"type":"noop"}"#).expect("valid JSON");
        assert_eq!(event.kind, "noop");
        assert!(event.flow.is_none());
        assert!(!event.internal);
    }

    #[test]
    fn test_flow_payload_defaults() {
        let event: RawEvent =
            serde_json::from_str(r#"{"type":"flow","flow":{"local_mac":"AA:BB:CC:DD:EE:FF"}}"#)
                .expect("valid JSON");
        let flow = event.flow.expect("flow payload");
        assert_eq!(flow.local_mac, "AA:BB:CC:DD:EE:FF");
        assert_eq!(flow.other_port, 0);
        assert!(flow.ssl.is_none());
        assert!(flow.risks.is_none());
    }

    #[test]
    fn test_record_kind_round_trip() {
        for i in 0..RECORD_KIND_COUNT {
            let kind = RecordKind::from_index(i).expect("valid index");
            assert_eq!(kind as usize, i);
        }
        assert!(RecordKind::from_index(RECORD_KIND_COUNT).is_none());
    }
}
