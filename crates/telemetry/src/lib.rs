//! Telemetry sinks for contextloom decision records.
//!
//! The engine hands every cycle's [`DecisionRecord`]s to an optional
//! [`TelemetrySink`]. The sinks here never block the caller: a full
//! channel drops records and counts them, a full buffer prunes its oldest
//! entries.
//!
//! [`DecisionRecord`]: contextloom_core::decision::DecisionRecord
//! [`TelemetrySink`]: contextloom_core::decision::TelemetrySink

pub mod sink;
pub mod summary;

pub use sink::{ChannelSink, FanoutSink, MemorySink, TracingSink};
pub use summary::CycleSummary;

use std::sync::Arc;

use contextloom_config::TelemetryConfig;

/// The in-memory collector described by `config`, or `None` when
/// telemetry is disabled.
pub fn memory_sink_from_config(config: &TelemetryConfig) -> Option<Arc<MemorySink>> {
    config
        .enabled
        .then(|| Arc::new(MemorySink::new(config.memory_capacity)))
}
