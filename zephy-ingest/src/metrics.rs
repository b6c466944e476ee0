// Zephy Ingest - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for the ingestion service.
//!
//! The pipeline keeps its own atomic counters; this module mirrors a
//! [`MetricsSnapshot`] into the Prometheus registry on every scrape.

use lazy_static::lazy_static;
use prometheus::{
    register_int_gauge, register_int_gauge_vec, Encoder, IntGauge, IntGaugeVec, TextEncoder,
};
use zephy::MetricsSnapshot;

lazy_static! {
    // ============================================================
    // Message flow
    // ============================================================

    /// Messages received from the broker.
    pub static ref MESSAGES_RECEIVED: IntGauge = register_int_gauge!(
        "zephy_messages_received_total",
        "MQTT messages received"
    ).unwrap();

    /// Samples that entered a device buffer.
    pub static ref SAMPLES_ACCEPTED: IntGauge = register_int_gauge!(
        "zephy_samples_accepted_total",
        "Samples accepted into device buffers"
    ).unwrap();

    /// Dropped messages and readings (labeled by reason).
    pub static ref DROPPED: IntGaugeVec = register_int_gauge_vec!(
        "zephy_dropped_total",
        "Messages or readings dropped, by reason",
        &["reason"]
    ).unwrap();

    // ============================================================
    // Readings
    // ============================================================

    /// Flushed readings (labeled complete/partial).
    pub static ref READINGS_FLUSHED: IntGaugeVec = register_int_gauge_vec!(
        "zephy_readings_flushed_total",
        "Readings handed to persistence",
        &["kind"]
    ).unwrap();

    /// Pre-assembled readings queued through the HTTP API.
    pub static ref READINGS_SUBMITTED: IntGauge = register_int_gauge!(
        "zephy_readings_submitted_total",
        "Readings submitted directly over HTTP"
    ).unwrap();

    pub static ref READINGS_PERSISTED: IntGauge = register_int_gauge!(
        "zephy_readings_persisted_total",
        "Readings stored successfully"
    ).unwrap();

    /// Partial buffers discarded at shutdown.
    pub static ref TIMERS_CANCELLED: IntGauge = register_int_gauge!(
        "zephy_timers_cancelled_total",
        "Pending flush deadlines discarded on shutdown"
    ).unwrap();

    // ============================================================
    // Subscriptions
    // ============================================================

    pub static ref SUBSCRIBED_TOPICS: IntGauge = register_int_gauge!(
        "zephy_subscribed_topics",
        "Topics currently subscribed"
    ).unwrap();

    pub static ref DIRECTORY_DEVICES: IntGauge = register_int_gauge!(
        "zephy_directory_devices",
        "Devices reachable through the topic directory"
    ).unwrap();

    pub static ref SUBSCRIBE_FAILURES: IntGauge = register_int_gauge!(
        "zephy_subscribe_failures_total",
        "Subscribe calls rejected by the transport or broker"
    ).unwrap();

    /// Reloads (labeled ok/failed).
    pub static ref RELOADS: IntGaugeVec = register_int_gauge_vec!(
        "zephy_reloads_total",
        "Topic reloads",
        &["result"]
    ).unwrap();

    /// Broker session state (1 = connected).
    pub static ref CONNECTED: IntGauge = register_int_gauge!(
        "zephy_broker_connected",
        "Broker session state (1=connected, 0=disconnected)"
    ).unwrap();
}

/// Mirror pipeline counters into the Prometheus registry.
pub fn update_from_snapshot(s: &MetricsSnapshot) {
    MESSAGES_RECEIVED.set(s.messages_received as i64);
    SAMPLES_ACCEPTED.set(s.samples_accepted as i64);
    for drop in &s.dropped {
        DROPPED.with_label_values(&[drop.reason]).set(drop.count as i64);
    }
    READINGS_FLUSHED
        .with_label_values(&["complete"])
        .set(s.readings_complete as i64);
    READINGS_FLUSHED
        .with_label_values(&["partial"])
        .set(s.readings_partial as i64);
    READINGS_SUBMITTED.set(s.readings_submitted as i64);
    READINGS_PERSISTED.set(s.readings_persisted as i64);
    TIMERS_CANCELLED.set(s.timers_cancelled as i64);
    SUBSCRIBED_TOPICS.set(s.subscribed_topics as i64);
    SUBSCRIBE_FAILURES.set(s.subscribe_failures as i64);
    RELOADS.with_label_values(&["ok"]).set(s.reloads as i64);
    RELOADS
        .with_label_values(&["failed"])
        .set(s.reload_failures as i64);
}

/// Update connection and directory gauges.
pub fn update_session(connected: bool, devices: usize) {
    CONNECTED.set(i64::from(connected));
    DIRECTORY_DEVICES.set(devices as i64);
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
