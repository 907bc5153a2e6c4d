//! Network-flow telemetry collector.
//!
//! Ingests newline-delimited JSON flow events from a traffic-inspection
//! agent over TCP, enriches them with device identity, persists them, and
//! maintains hourly per-application usage aggregates under a rolling
//! retention horizon.

pub mod aggregate;
pub mod collector;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod export;
pub mod ingest;
pub mod purge;
pub mod store;
