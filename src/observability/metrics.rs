//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define runtime metrics (calls, latency, connections, state)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `rpc_calls_total` (counter): calls by method, origin, status code
//! - `rpc_call_duration_seconds` (histogram): latency by method, origin
//! - `rpc_connections_total` (counter): accepted connections by server
//! - `rpc_runtime_state` (gauge): 0=created, 1=running, 2=stopping, 3=closed
//! - `rpc_registration_attempts_total` (counter): announce attempts by outcome
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - Labels are static strings or method paths; no per-peer labels

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::lifecycle::RuntimeState;
use crate::rpc::{CallOrigin, Code};

/// Install the Prometheus recorder and its scrape listener on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Record a finished call.
pub fn record_call(method: &str, origin: CallOrigin, code: Code, start: Instant) {
    let origin = origin.as_str();
    metrics::counter!(
        "rpc_calls_total",
        "method" => method.to_owned(),
        "origin" => origin,
        "code" => code.as_str(),
    )
    .increment(1);
    metrics::histogram!(
        "rpc_call_duration_seconds",
        "method" => method.to_owned(),
        "origin" => origin,
    )
    .record(start.elapsed().as_secs_f64());
}

/// Record an accepted connection routed to `server` ("rpc", "http", "combined").
pub fn record_connection(server: &'static str) {
    metrics::counter!("rpc_connections_total", "server" => server).increment(1);
}

pub fn set_state(state: RuntimeState) {
    metrics::gauge!("rpc_runtime_state").set(state.as_gauge());
}

/// Record a registry announce attempt.
pub fn record_registration(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!("rpc_registration_attempts_total", "outcome" => outcome).increment(1);
}
