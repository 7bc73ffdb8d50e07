//! Prometheus metrics endpoint.
//!
//! Exposes the shared record (packet and drop counters, current drop
//! probability) in Prometheus exposition format via a lightweight HTTP
//! server. Read-only: the controller stays the only writer.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{MetricsConfig, HEALTH_PATH};
use crate::state::{StateMaps, StateSnapshot, StateStore};

// ---------------------------------------------------------------------------
// Metrics State
// ---------------------------------------------------------------------------

/// Shared state for the metrics endpoint.
#[derive(Clone)]
pub struct MetricsState {
    /// The eBPF state maps, shared with the mode controller.
    pub maps: Arc<Mutex<StateMaps>>,
    /// Interface label.
    pub interface: Arc<str>,
    /// Mode label ("fixed" or "dynamic").
    pub mode: &'static str,
}

// ---------------------------------------------------------------------------
// HTTP Server
// ---------------------------------------------------------------------------

/// Start the Prometheus metrics HTTP server.
pub async fn serve_metrics(config: &MetricsConfig, state: MetricsState) -> Result<()> {
    let app = Router::new()
        .route(&config.path, get(metrics_handler))
        .route(HEALTH_PATH, get(|| async { "ok" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding metrics server to {}", config.bind))?;

    info!(bind = %config.bind, path = %config.path, "metrics server started");

    axum::serve(listener, app)
        .await
        .context("metrics server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Metrics Handler
// ---------------------------------------------------------------------------

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    let snapshot = state.maps.lock().await.read();

    let output = match snapshot {
        Ok(snapshot) => render(&snapshot, &state.interface, state.mode),
        Err(e) => format!("# ERROR reading shared state: {}\n", e),
    };

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    )
}

fn render(snapshot: &StateSnapshot, interface: &str, mode: &str) -> String {
    let mut output = String::with_capacity(1024);

    write_metric(
        &mut output,
        "tc_dropper_packets_total",
        "counter",
        "Packets seen by the classifier at ingress and egress",
        interface,
        mode,
        snapshot.packet_count,
    );
    write_metric(
        &mut output,
        "tc_dropper_dropped_total",
        "counter",
        "Packets dropped by the classifier",
        interface,
        mode,
        snapshot.dropped_count,
    );
    write_metric(
        &mut output,
        "tc_dropper_drop_probability",
        "gauge",
        "Current drop probability in percent",
        interface,
        mode,
        snapshot.drop_probability as u64,
    );

    output
}

fn write_metric(
    output: &mut String,
    metric: &str,
    kind: &str,
    help: &str,
    interface: &str,
    mode: &str,
    value: u64,
) {
    let _ = writeln!(output, "# HELP {} {}", metric, help);
    let _ = writeln!(output, "# TYPE {} {}", metric, kind);
    let _ = writeln!(
        output,
        "{}{{interface=\"{}\",mode=\"{}\"}} {}",
        metric, interface, mode, value
    );
}
