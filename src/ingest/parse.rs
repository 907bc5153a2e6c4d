//! Line reassembly and record classification for the agent's JSON stream.
//!
//! The socket delivers arbitrary-sized byte chunks; [`LineAssembler`]
//! buffers the undelimited tail so [`classify_line`] only ever sees
//! complete lines. Classification is a four-outcome decision: a line that
//! fails to parse as JSON is [`Outcome::Invalid`] (malformed input worth a
//! debug log), distinct from the partial-line case, which never reaches
//! the classifier at all.

use thiserror::Error;
use tracing::trace;

use crate::store::epoch_ms_now;

use super::record::{FlowRecord, PurgeStatRecord, RawEvent, RecordKind};

/// Decode errors carried by [`Outcome::Invalid`].
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classification result for one complete line.
#[derive(Debug)]
pub enum Outcome {
    Flow(FlowRecord),
    PurgeStat(PurgeStatRecord),
    /// Well-formed JSON of a type or protocol this collector does not track.
    Ignored,
    /// A complete line that is not valid JSON.
    Invalid(DecodeError),
}

impl Outcome {
    pub fn kind(&self) -> RecordKind {
        match self {
            Outcome::Flow(_) => RecordKind::Flow,
            Outcome::PurgeStat(_) => RecordKind::PurgeStat,
            Outcome::Ignored => RecordKind::Ignored,
            Outcome::Invalid(_) => RecordKind::Invalid,
        }
    }
}

/// Reassembles newline-delimited records from arbitrary byte chunks.
///
/// A record split across two chunks stays buffered until its terminating
/// `\n` arrives; `push` returns only complete, non-empty trimmed lines.
#[derive(Debug, Default)]
pub struct LineAssembler {
    tail: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and drains every complete line it closes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.tail.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.tail.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.tail.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..pos]);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Bytes currently buffered waiting for a terminating newline.
    pub fn pending(&self) -> usize {
        self.tail.len()
    }
}

/// Classifies one complete line into a canonical record.
///
/// `now_ms` becomes the record's `timeinsert`; flow records come back with
/// an empty hostname, filled in later from the device cache.
pub fn classify_line(line: &str, now_ms: i64) -> Outcome {
    let event: RawEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => return Outcome::Invalid(e.into()),
    };

    match event.kind.as_str() {
        "flow" => classify_flow(event, now_ms),
        "flow_purge" => classify_purge(event, now_ms),
        other => {
            trace!(kind = other, "ignoring record type");
            Outcome::Ignored
        }
    }
}

fn classify_flow(event: RawEvent, now_ms: i64) -> Outcome {
    let Some(flow) = event.flow else {
        return Outcome::Ignored;
    };

    let protocol = match normalize_protocol(&flow.detected_protocol_name) {
        Some(p) => p,
        None => return Outcome::Ignored,
    };

    let sni = flow
        .ssl
        .as_ref()
        .and_then(|ssl| ssl.client_sni.as_deref())
        .filter(|s| !s.is_empty());

    let fqdn = sni
        .or(flow.host_server_name.as_deref())
        .unwrap_or_default()
        .to_string();

    let app_name = resolve_app_name(flow.detected_application_name.as_deref(), sni);

    let risks = flow.risks.unwrap_or_default();

    Outcome::Flow(FlowRecord {
        timeinsert: now_ms,
        hostname: String::new(),
        ip: flow.local_ip,
        mac: flow.local_mac.to_ascii_lowercase(),
        fqdn,
        dest_ip: flow.other_ip,
        dest_port: flow.other_port,
        detected_protocol_name: protocol,
        detected_app_name: app_name,
        interface: event.interface,
        internal: event.internal,
        risk_score: risks.ndpi_risk_score,
        risk_score_client: risks.ndpi_risk_score_client,
        risk_score_server: risks.ndpi_risk_score_server,
        first_seen_at: flow.first_seen_at,
        digest: flow.digest,
    })
}

fn classify_purge(event: RawEvent, now_ms: i64) -> Outcome {
    let Some(flow) = event.flow else {
        return Outcome::Ignored;
    };

    // Deliberate narrowing of "every flow_purge yields a stat": a purge
    // stat without a digest can never join its flow, so it is classified
    // Ignored instead of persisted.
    if flow.digest.is_empty() {
        return Outcome::Ignored;
    }

    Outcome::PurgeStat(PurgeStatRecord {
        digest: flow.digest,
        timeinsert: now_ms,
        local_bytes: flow.local_bytes,
        other_bytes: flow.other_bytes,
        local_packets: flow.local_packets,
        other_packets: flow.other_packets,
        reason: event.reason.unwrap_or_default(),
    })
}

/// Convenience wrapper using the current wall clock for `timeinsert`.
pub fn classify_line_now(line: &str) -> Outcome {
    classify_line(line, epoch_ms_now())
}

/// Returns the canonical protocol name for tracked protocols, `None` for
/// everything else. The agent reports combined HTTP-over-TLS detection as
/// `HTTP/S`, standardized here to `HTTPS`.
pub fn normalize_protocol(detected: &str) -> Option<String> {
    match detected {
        "HTTP" => Some("HTTP".to_string()),
        "HTTPS" | "HTTP/S" => Some("HTTPS".to_string()),
        _ => None,
    }
}

/// Resolves the application name, synthesizing `netify.<apex>` from the SNI
/// when the agent reports no (or an Unknown) application.
fn resolve_app_name(detected: Option<&str>, sni: Option<&str>) -> String {
    let detected = detected.unwrap_or_default();

    if !detected.is_empty() && detected != "Unknown" {
        return detected.to_string();
    }

    match sni.and_then(synthetic_app_name) {
        Some(name) => name,
        // Parse failure or no SNI: leave the name as reported.
        None => detected.to_string(),
    }
}

/// Derives `netify.<last two labels>` from an SNI hostname, e.g.
/// `alb.reddit.com` -> `netify.reddit.com`. Returns `None` when the SNI is
/// not a plausible multi-label hostname.
fn synthetic_app_name(sni: &str) -> Option<String> {
    let host = sni.trim().trim_end_matches('.');
    if host.is_empty() || host.contains(|c: char| c.is_whitespace() || c == '/') {
        return None;
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return None;
    }

    let apex = &labels[labels.len() - 2..];
    Some(format!("netify.{}", apex.join(".")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow_line(protocol: &str, sni: Option<&str>, app: Option<&str>) -> String {
        let mut flow = serde_json::json!({
            "digest": "d-1",
            "local_mac": "AA:BB:CC:00:11:22",
            "local_ip": "192.168.1.10",
            "other_ip": "151.101.1.140",
            "other_port": 443,
            "detected_protocol_name": protocol,
            "first_seen_at": 1_700_000_000_000_i64,
            "risks": {
                "ndpi_risk_score": 50,
                "ndpi_risk_score_client": 10,
                "ndpi_risk_score_server": 40,
            },
        });
        if let Some(s) = sni {
            flow["ssl"] = serde_json::json!({ "client_sni": s });
        }
        if let Some(a) = app {
            flow["detected_application_name"] = serde_json::json!(a);
        }

        serde_json::json!({
            "type": "flow",
            "interface": "br-lan",
            "internal": true,
            "flow": flow,
        })
        .to_string()
    }

    #[test]
    fn test_http_s_normalized_to_https() {
        let line = flow_line("HTTP/S", Some("www.example.com"), Some("TLS.Example"));
        let Outcome::Flow(rec) = classify_line(&line, 1) else {
            panic!("expected flow outcome");
        };
        assert_eq!(rec.detected_protocol_name, "HTTPS");
    }

    #[test]
    fn test_unsupported_protocol_dropped() {
        let line = flow_line("FTP", None, None);
        assert!(matches!(classify_line(&line, 1), Outcome::Ignored));
    }

    #[test]
    fn test_sni_derived_app_name() {
        let line = flow_line("HTTPS", Some("alb.reddit.com"), Some(""));
        let Outcome::Flow(rec) = classify_line(&line, 1) else {
            panic!("expected flow outcome");
        };
        assert_eq!(rec.detected_app_name, "netify.reddit.com");
    }

    #[test]
    fn test_unknown_app_name_uses_sni() {
        let line = flow_line("HTTPS", Some("cdn.shop.example.co.uk"), Some("Unknown"));
        let Outcome::Flow(rec) = classify_line(&line, 1) else {
            panic!("expected flow outcome");
        };
        assert_eq!(rec.detected_app_name, "netify.co.uk");
    }

    #[test]
    fn test_detected_app_name_kept_when_present() {
        let line = flow_line("HTTPS", Some("alb.reddit.com"), Some("TLS.Reddit"));
        let Outcome::Flow(rec) = classify_line(&line, 1) else {
            panic!("expected flow outcome");
        };
        assert_eq!(rec.detected_app_name, "TLS.Reddit");
    }

    #[test]
    fn test_single_label_sni_leaves_app_name_as_is() {
        let line = flow_line("HTTPS", Some("localhost"), Some(""));
        let Outcome::Flow(rec) = classify_line(&line, 1) else {
            panic!("expected flow outcome");
        };
        assert_eq!(rec.detected_app_name, "");
    }

    #[test]
    fn test_fqdn_prefers_sni_over_host_header() {
        let line = concat!(
            r#"{"type":"flow","flow":{"digest":"d-2","local_mac":"aa:bb:cc:00:11:22","#,
            r#""detected_protocol_name":"HTTPS","host_server_name":"header.example.com","#,
            r#""ssl":{"client_sni":"sni.example.com"}}}"#,
        );
        let Outcome::Flow(rec) = classify_line(line, 1) else {
            panic!("expected flow outcome");
        };
        assert_eq!(rec.fqdn, "sni.example.com");
    }

    #[test]
    fn test_fqdn_falls_back_to_host_header_then_empty() {
        let line = concat!(
            r#"{"type":"flow","flow":{"digest":"d-3","local_mac":"aa:bb:cc:00:11:22","#,
            r#""detected_protocol_name":"HTTP","host_server_name":"header.example.com"}}"#,
        );
        let Outcome::Flow(rec) = classify_line(line, 1) else {
            panic!("expected flow outcome");
        };
        assert_eq!(rec.fqdn, "header.example.com");

        let bare = concat!(
            r#"{"type":"flow","flow":{"digest":"d-4","local_mac":"aa:bb:cc:00:11:22","#,
            r#""detected_protocol_name":"HTTP"}}"#,
        );
        let Outcome::Flow(rec) = classify_line(bare, 1) else {
            panic!("expected flow outcome");
        };
        assert_eq!(rec.fqdn, "");
    }

    #[test]
    fn test_mac_lowercased() {
        let line = flow_line("HTTPS", None, Some("TLS.Example"));
        let Outcome::Flow(rec) = classify_line(&line, 1) else {
            panic!("expected flow outcome");
        };
        assert_eq!(rec.mac, "aa:bb:cc:00:11:22");
    }

    #[test]
    fn test_purge_stat_classified() {
        let line = concat!(
            r#"{"type":"flow_purge","reason":"idle","flow":{"digest":"d-9","#,
            r#""local_bytes":1000,"other_bytes":9000,"local_packets":10,"other_packets":12}}"#,
        );
        let Outcome::PurgeStat(rec) = classify_line(line, 42) else {
            panic!("expected purge-stat outcome");
        };
        assert_eq!(rec.digest, "d-9");
        assert_eq!(rec.timeinsert, 42);
        assert_eq!(rec.local_bytes, 1000);
        assert_eq!(rec.other_bytes, 9000);
        assert_eq!(rec.reason, "idle");
    }

    #[test]
    fn test_purge_stat_without_digest_ignored() {
        let line = r#"{"type":"flow_purge","flow":{"local_bytes":1}}"#;
        assert!(matches!(classify_line(line, 1), Outcome::Ignored));
    }

    #[test]
    fn test_unknown_type_ignored() {
        let line = r#"{"type":"agent_status","uptime":123}"#;
        assert!(matches!(classify_line(line, 1), Outcome::Ignored));
    }

    #[test]
    fn test_malformed_line_is_invalid_not_panic() {
        assert!(matches!(
            classify_line("{\"type\":\"flow\",", 1),
            Outcome::Invalid(_)
        ));
    }

    #[test]
    fn test_assembler_partial_line_across_chunks() {
        let line = flow_line("HTTPS", Some("alb.reddit.com"), Some(""));
        let (first, second) = line.split_at(line.len() / 2);

        let mut assembler = LineAssembler::new();
        assert!(assembler.push(first.as_bytes()).is_empty());
        assert!(assembler.pending() > 0);

        let mut rest = second.as_bytes().to_vec();
        rest.push(b'\n');
        let lines = assembler.push(&rest);
        assert_eq!(lines.len(), 1);
        assert!(matches!(classify_line(&lines[0], 1), Outcome::Flow(_)));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_assembler_multiple_lines_one_chunk() {
        let mut assembler = LineAssembler::new();
        let lines = assembler.push(b"{\"a\":1}\n\n{\"b\":2}\npartial");
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
        assert_eq!(assembler.pending(), "partial".len());
    }

    #[test]
    fn test_normalize_protocol() {
        assert_eq!(normalize_protocol("HTTP").as_deref(), Some("HTTP"));
        assert_eq!(normalize_protocol("HTTPS").as_deref(), Some("HTTPS"));
        assert_eq!(normalize_protocol("HTTP/S").as_deref(), Some("HTTPS"));
        assert_eq!(normalize_protocol("FTP"), None);
        assert_eq!(normalize_protocol(""), None);
    }

    #[test]
    fn test_synthetic_app_name_edge_cases() {
        assert_eq!(
            synthetic_app_name("alb.reddit.com").as_deref(),
            Some("netify.reddit.com"),
        );
        assert_eq!(
            synthetic_app_name("reddit.com.").as_deref(),
            Some("netify.reddit.com"),
        );
        assert_eq!(synthetic_app_name("localhost"), None);
        assert_eq!(synthetic_app_name(""), None);
        assert_eq!(synthetic_app_name("bad..host"), None);
        assert_eq!(synthetic_app_name("has space.com"), None);
    }
}
