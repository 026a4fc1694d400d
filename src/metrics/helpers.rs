//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use crate::connection_manager::ConnectionState;

use super::{
    CLOCK_OFFSET_MS, CLOCK_SAMPLES_TOTAL, COMMANDS_FAILED_TOTAL, COMMANDS_SENT_TOTAL,
    COMMAND_LATENCY, CONNECTION_ATTEMPTS_TOTAL, CONNECTION_STATE, EVENTS_DROPPED_TOTAL,
    EVENTS_RECEIVED_TOTAL, HANDLER_PANICS_TOTAL, HANDSHAKE_FAILURES_TOTAL, INTEREST_ITEMS,
    RECONNECTIONS_TOTAL, RECONNECT_ATTEMPTS_TOTAL, RESYNC_FAILURES_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording connection lifecycle metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn set_state(state: ConnectionState) {
        CONNECTION_STATE.set(state.as_code());
    }

    pub fn record_connect_attempt() {
        CONNECTION_ATTEMPTS_TOTAL.inc();
    }

    pub fn record_handshake_failure() {
        HANDSHAKE_FAILURES_TOTAL.inc();
    }

    pub fn record_reconnect_attempt() {
        RECONNECT_ATTEMPTS_TOTAL.inc();
    }

    pub fn record_reconnected() {
        RECONNECTIONS_TOTAL.inc();
    }

    pub fn record_resync_failure() {
        RESYNC_FAILURES_TOTAL.inc();
    }

    pub fn set_interest_items(count: usize) {
        INTEREST_ITEMS.set(count as i64);
    }
}

/// Helper struct for recording hub command metrics
pub struct CommandMetrics;

impl CommandMetrics {
    pub fn record_sent(command: &str, latency: Duration) {
        COMMANDS_SENT_TOTAL.with_label_values(&[command]).inc();
        COMMAND_LATENCY.observe(latency.as_secs_f64());
    }

    pub fn record_failed(command: &str) {
        COMMANDS_FAILED_TOTAL.with_label_values(&[command]).inc();
    }
}

/// Helper struct for recording inbound event metrics
pub struct EventMetrics;

impl EventMetrics {
    pub fn record_received(event: &str) {
        EVENTS_RECEIVED_TOTAL.with_label_values(&[event]).inc();
    }

    pub fn record_undecodable() {
        EVENTS_DROPPED_TOTAL.with_label_values(&["undecodable"]).inc();
    }

    pub fn record_unknown_target() {
        EVENTS_DROPPED_TOTAL.with_label_values(&["unknown_target"]).inc();
    }

    pub fn record_handler_panic(registry: &str) {
        HANDLER_PANICS_TOTAL.with_label_values(&[registry]).inc();
    }
}

/// Helper struct for recording clock metrics
pub struct ClockMetrics;

impl ClockMetrics {
    pub fn record_accepted(offset_ms: f64) {
        CLOCK_SAMPLES_TOTAL.with_label_values(&["accepted"]).inc();
        CLOCK_OFFSET_MS.set(offset_ms);
    }

    pub fn record_rejected() {
        CLOCK_SAMPLES_TOTAL.with_label_values(&["rejected"]).inc();
    }

    pub fn set_offset(offset_ms: f64) {
        CLOCK_OFFSET_MS.set(offset_ms);
    }
}
