//! Prometheus metrics for the realtime client.
//!
//! - Connection metrics (state, attempts, reconnections, resync failures)
//! - Hub command metrics (sent, failed, latency)
//! - Inbound event metrics (received, dropped, handler panics)
//! - Clock metrics (current offset, accepted and rejected samples)

mod helpers;

pub use helpers::{encode_metrics, ClockMetrics, CommandMetrics, ConnectionMetrics, EventMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "auction";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Current connection state (0=disconnected, 1=connecting, 2=connected, 3=reconnecting)
    pub static ref CONNECTION_STATE: IntGauge = register_int_gauge!(
        format!("{}_connection_state", METRIC_PREFIX),
        "Hub connection state (0=disconnected, 1=connecting, 2=connected, 3=reconnecting)"
    ).unwrap();

    /// Fresh connection attempts made by ensure_connected
    pub static ref CONNECTION_ATTEMPTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connection_attempts_total", METRIC_PREFIX),
        "Total initial hub connection attempts"
    ).unwrap();

    /// Failed initial handshakes
    pub static ref HANDSHAKE_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_handshake_failures_total", METRIC_PREFIX),
        "Total failed hub handshakes"
    ).unwrap();

    /// Reconnect attempts made by the transport after a drop
    pub static ref RECONNECT_ATTEMPTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_reconnect_attempts_total", METRIC_PREFIX),
        "Total transport reconnect attempts"
    ).unwrap();

    /// Successful reconnections
    pub static ref RECONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_reconnections_total", METRIC_PREFIX),
        "Total successful reconnections"
    ).unwrap();

    /// Interest resyncs that failed after a reconnection
    pub static ref RESYNC_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_resync_failures_total", METRIC_PREFIX),
        "Total failed interest resyncs after reconnection"
    ).unwrap();

    /// Items currently in the interest set
    pub static ref INTEREST_ITEMS: IntGauge = register_int_gauge!(
        format!("{}_interest_items", METRIC_PREFIX),
        "Number of auction items in the interest set"
    ).unwrap();

    // ============================================================================
    // Command Metrics
    // ============================================================================

    /// Hub commands acknowledged by the server
    pub static ref COMMANDS_SENT_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_commands_sent_total", METRIC_PREFIX),
        "Total hub commands acknowledged",
        &["command"]
    ).unwrap();

    /// Hub commands that failed
    pub static ref COMMANDS_FAILED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_commands_failed_total", METRIC_PREFIX),
        "Total hub commands that failed",
        &["command"]
    ).unwrap();

    /// Time from invocation to completion
    pub static ref COMMAND_LATENCY: Histogram = register_histogram!(
        format!("{}_command_latency_seconds", METRIC_PREFIX),
        "Hub command round-trip latency in seconds",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    ).unwrap();

    // ============================================================================
    // Event Metrics
    // ============================================================================

    /// Inbound events dispatched by kind
    pub static ref EVENTS_RECEIVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_received_total", METRIC_PREFIX),
        "Total inbound hub events dispatched",
        &["event"]
    ).unwrap();

    /// Inbound events that could not be decoded or had no known target
    pub static ref EVENTS_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_dropped_total", METRIC_PREFIX),
        "Total inbound hub events dropped",
        &["reason"]
    ).unwrap();

    /// Handlers that panicked during dispatch
    pub static ref HANDLER_PANICS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_handler_panics_total", METRIC_PREFIX),
        "Total event handler panics",
        &["registry"]
    ).unwrap();

    // ============================================================================
    // Clock Metrics
    // ============================================================================

    /// Current estimate of server time minus local time
    pub static ref CLOCK_OFFSET_MS: Gauge = register_gauge!(
        format!("{}_clock_offset_ms", METRIC_PREFIX),
        "Estimated server clock offset in milliseconds"
    ).unwrap();

    /// Clock samples by outcome
    pub static ref CLOCK_SAMPLES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_clock_samples_total", METRIC_PREFIX),
        "Total clock samples observed",
        &["outcome"]
    ).unwrap();
}
