//! Agent-facing ingestion: socket connection management, line reassembly,
//! and record classification.

pub mod conn;
pub mod parse;
pub mod record;
pub mod stats;
