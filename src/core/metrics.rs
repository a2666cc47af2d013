// src/core/metrics.rs

//! Defines and registers Prometheus metrics for client-side monitoring.
//!
//! This module uses `lazy_static` so metrics are registered exactly once for the
//! lifetime of the process, however many connections are opened.

use lazy_static::lazy_static;
use prometheus::{
    Counter, Gauge, Histogram, TextEncoder, register_counter, register_gauge, register_histogram,
};

lazy_static! {
    // --- Gauges ---
    /// Sessions that have been created and not yet closed.
    pub static ref ACTIVE_SESSIONS: Gauge =
        register_gauge!("mqsession_active_sessions", "Number of open sessions.").unwrap();
    /// Consumers registered with a session and not yet disposed.
    pub static ref ACTIVE_CONSUMERS: Gauge =
        register_gauge!("mqsession_active_consumers", "Number of open consumers.").unwrap();


    // --- Counters ---
    pub static ref ONEWAY_COMMANDS_TOTAL: Counter =
        register_counter!("mqsession_oneway_commands_total", "Total number of commands sent without waiting for a reply.").unwrap();
    pub static ref SYNC_REQUESTS_TOTAL: Counter =
        register_counter!("mqsession_sync_requests_total", "Total number of correlated requests sent.").unwrap();
    pub static ref REQUEST_TIMEOUTS_TOTAL: Counter =
        register_counter!("mqsession_request_timeouts_total", "Total number of correlated requests that timed out.").unwrap();
    pub static ref BROKER_ERRORS_TOTAL: Counter =
        register_counter!("mqsession_broker_errors_total", "Total number of exception responses received.").unwrap();
    pub static ref MESSAGES_DISPATCHED_TOTAL: Counter =
        register_counter!("mqsession_messages_dispatched_total", "Total number of messages handed to consumers.").unwrap();
    pub static ref MESSAGES_REDELIVERED_TOTAL: Counter =
        register_counter!("mqsession_messages_redelivered_total", "Total number of messages queued for redelivery.").unwrap();
    pub static ref MESSAGES_SENT_TOTAL: Counter =
        register_counter!("mqsession_messages_sent_total", "Total number of messages sent by producers.").unwrap();


    // --- Histograms ---
    /// Round-trip time of correlated requests that received a reply.
    pub static ref REQUEST_LATENCY_SECONDS: Histogram =
        register_histogram!("mqsession_request_latency_seconds", "Latency of correlated requests in seconds.").unwrap();
}

/// Renders every registered metric in the Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# failed to encode metrics: {e}"))
}
