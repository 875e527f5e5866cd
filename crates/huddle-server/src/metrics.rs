//! Metrics collection and export for Huddle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::Result;
use async_trait::async_trait;
use huddle_protocol::Message;
use huddle_transport::{Connection, ConnectionId, ConnectionReader, ConnectionWriter, TransportError};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const MESSAGES_TOTAL: &str = "huddle_messages_total";
    pub const MESSAGES_BYTES: &str = "huddle_messages_bytes";
    pub const ROOMS_ACTIVE: &str = "huddle_rooms_active";
    pub const REPLAY_SECONDS: &str = "huddle_history_replay_seconds";
    pub const ERRORS_TOTAL: &str = "huddle_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total payload bytes processed");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of rooms");
    metrics::describe_histogram!(
        names::REPLAY_SECONDS,
        "Time spent replaying history to a joining user"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record how long a history replay took.
pub fn record_replay(seconds: f64) {
    histogram!(names::REPLAY_SECONDS).record(seconds);
}

/// Update active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// A connection that counts the messages passing through it.
pub struct MeteredConnection<C> {
    inner: C,
}

impl<C: Connection + 'static> MeteredConnection<C> {
    /// Wrap a connection.
    #[must_use]
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C: Connection + 'static> Connection for MeteredConnection<C> {
    fn id(&self) -> &ConnectionId {
        self.inner.id()
    }

    fn remote_addr(&self) -> Option<String> {
        self.inner.remote_addr()
    }

    fn split(self: Box<Self>) -> (Box<dyn ConnectionReader>, Box<dyn ConnectionWriter>) {
        let this = *self;
        let (reader, writer) = Box::new(this.inner).split();
        (
            Box::new(MeteredReader { inner: reader }),
            Box::new(MeteredWriter { inner: writer }),
        )
    }
}

struct MeteredReader {
    inner: Box<dyn ConnectionReader>,
}

#[async_trait]
impl ConnectionReader for MeteredReader {
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        let result = self.inner.recv().await;
        match &result {
            Ok(Some(message)) => record_message(message.payload_size(), "inbound"),
            Ok(None) => {}
            Err(TransportError::MessageTooLarge { .. }) => record_error("message_too_large"),
            Err(TransportError::Protocol(_)) => record_error("protocol"),
            Err(_) => record_error("receive"),
        }
        result
    }
}

struct MeteredWriter {
    inner: Box<dyn ConnectionWriter>,
}

#[async_trait]
impl ConnectionWriter for MeteredWriter {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let result = self.inner.send(message).await;
        match &result {
            Ok(()) => record_message(message.payload_size(), "outbound"),
            Err(_) => record_error("send"),
        }
        result
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}
