//! Prometheus metrics for mqgate
//!
//! Exposes connection lifecycle metrics at the /metrics endpoint.

use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::protocol::{PacketType, ReturnCode};

mod server;


pub use server::MetricsServer;

/// All mqgate metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Transport metrics
    pub connections_accepted_total: IntCounter,
    pub connections_current: IntGauge,

    // Session metrics
    pub sessions_current: IntGauge,
    pub sessions_maximum: IntGauge,
    pub takeovers_total: IntCounter,
    pub teardowns_total: IntCounterVec,

    // Handshake metrics
    pub connacks_total: IntCounterVec,
    pub connect_duration: Histogram,

    // Traffic metrics
    pub packets_received_total: IntCounterVec,
    pub bytes_received_total: IntCounter,
    pub bytes_sent_total: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let connections_accepted_total = IntCounter::with_opts(Opts::new(
            "mqgate_connections_accepted_total",
            "Total number of accepted transport connections since startup",
        ))?;

        let connections_current = IntGauge::with_opts(Opts::new(
            "mqgate_connections_current",
            "Current number of open transport connections",
        ))?;

        let sessions_current = IntGauge::with_opts(Opts::new(
            "mqgate_sessions_current",
            "Current number of established sessions",
        ))?;

        let sessions_maximum = IntGauge::with_opts(Opts::new(
            "mqgate_sessions_maximum",
            "Maximum concurrent sessions since startup",
        ))?;

        let takeovers_total = IntCounter::with_opts(Opts::new(
            "mqgate_session_takeovers_total",
            "Sessions evicted by a newer connection with the same client id",
        ))?;

        let teardowns_total = IntCounterVec::new(
            Opts::new(
                "mqgate_session_teardowns_total",
                "Established sessions torn down, by reason",
            ),
            &["reason"],
        )?;

        let connacks_total = IntCounterVec::new(
            Opts::new("mqgate_connacks_total", "CONNACK packets sent, by return code"),
            &["code"],
        )?;

        let connect_duration = Histogram::with_opts(
            HistogramOpts::new(
                "mqgate_connect_duration_seconds",
                "Time from accept to CONNACK",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        let packets_received_total = IntCounterVec::new(
            Opts::new("mqgate_packets_received_total", "Packets received, by type"),
            &["type"],
        )?;

        let bytes_received_total = IntCounter::with_opts(Opts::new(
            "mqgate_bytes_received_total",
            "Bytes read from client transports",
        ))?;

        let bytes_sent_total = IntCounter::with_opts(Opts::new(
            "mqgate_bytes_sent_total",
            "Bytes written to client transports",
        ))?;

        registry.register(Box::new(connections_accepted_total.clone()))?;
        registry.register(Box::new(connections_current.clone()))?;
        registry.register(Box::new(sessions_current.clone()))?;
        registry.register(Box::new(sessions_maximum.clone()))?;
        registry.register(Box::new(takeovers_total.clone()))?;
        registry.register(Box::new(teardowns_total.clone()))?;
        registry.register(Box::new(connacks_total.clone()))?;
        registry.register(Box::new(connect_duration.clone()))?;
        registry.register(Box::new(packets_received_total.clone()))?;
        registry.register(Box::new(bytes_received_total.clone()))?;
        registry.register(Box::new(bytes_sent_total.clone()))?;

        Ok(Metrics {
            registry,
            connections_accepted_total,
            connections_current,
            sessions_current,
            sessions_maximum,
            takeovers_total,
            teardowns_total,
            connacks_total,
            connect_duration,
            packets_received_total,
            bytes_received_total,
            bytes_sent_total,
        })
    }

    // Helper methods for common operations

    pub fn connection_opened(&self) {
        self.connections_accepted_total.inc();
        self.connections_current.inc();
    }

    pub fn connection_closed(&self) {
        self.connections_current.dec();
    }

    pub fn connack_sent(&self, code: ReturnCode, elapsed: Duration) {
        self.connacks_total.with_label_values(&[code.as_str()]).inc();
        self.connect_duration.observe(elapsed.as_secs_f64());
        self.bytes_sent_total.inc_by(4);
    }

    pub fn session_opened(&self) {
        self.sessions_current.inc();
        let current = self.sessions_current.get();
        if current > self.sessions_maximum.get() {
            self.sessions_maximum.set(current);
        }
    }

    pub fn session_closed(&self, reason: &str) {
        self.sessions_current.dec();
        self.teardowns_total.with_label_values(&[reason]).inc();
    }

    pub fn session_taken_over(&self) {
        self.takeovers_total.inc();
    }

    pub fn packet_received(&self, packet_type: PacketType, bytes: usize) {
        self.packets_received_total
            .with_label_values(&[packet_type.as_str()])
            .inc();
        self.bytes_received_total.inc_by(bytes as u64);
    }

    pub fn bytes_sent(&self, bytes: usize) {
        self.bytes_sent_total.inc_by(bytes as u64);
    }
}
