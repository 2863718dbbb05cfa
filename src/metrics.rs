//! Prometheus metrics for the reconciliation loop
//!
//! All metrics live under the `wpa` namespace, split into `controller`,
//! `queue` and `worker` subsystems, and are served in text exposition
//! format from `/metrics`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::{info, warn};

use crate::error::{OperatorError, Result};

const NAMESPACE: &str = "wpa";

const QUEUE_LABELS: &[&str] = &["workerautoscaler", "namespace", "queue_name"];
const LOOP_LABELS: &[&str] = &["workerautoscaler", "namespace"];

/// Gauges and counters written once per reconciliation.
pub struct ControllerMetrics {
    registry: Registry,
    loop_duration_seconds: GaugeVec,
    loop_count_success: IntCounterVec,
    queue_messages: IntGaugeVec,
    queue_messages_sent_per_minute: GaugeVec,
    workers_idle: IntGaugeVec,
    workers_current: IntGaugeVec,
    workers_desired: IntGaugeVec,
    workers_available: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let loop_duration_seconds = GaugeVec::new(
            Opts::new(
                "loop_duration_seconds",
                "Seconds to complete the control loop successfully",
            )
            .namespace(NAMESPACE)
            .subsystem("controller"),
            LOOP_LABELS,
        )
        .map_err(metrics_error)?;
        let loop_count_success = IntCounterVec::new(
            Opts::new(
                "loop_count_success",
                "How many times the control loop executed successfully",
            )
            .namespace(NAMESPACE)
            .subsystem("controller"),
            LOOP_LABELS,
        )
        .map_err(metrics_error)?;
        let queue_messages = IntGaugeVec::new(
            Opts::new("messages", "Number of unprocessed messages in the queue")
                .namespace(NAMESPACE)
                .subsystem("queue"),
            QUEUE_LABELS,
        )
        .map_err(metrics_error)?;
        let queue_messages_sent_per_minute = GaugeVec::new(
            Opts::new(
                "messages_sent_per_minute",
                "Number of messages sent to the queue per minute",
            )
            .namespace(NAMESPACE)
            .subsystem("queue"),
            QUEUE_LABELS,
        )
        .map_err(metrics_error)?;
        let workers_idle = IntGaugeVec::new(
            Opts::new("idle", "Number of idle workers")
                .namespace(NAMESPACE)
                .subsystem("worker"),
            QUEUE_LABELS,
        )
        .map_err(metrics_error)?;
        let workers_current = IntGaugeVec::new(
            Opts::new("current", "Number of current workers")
                .namespace(NAMESPACE)
                .subsystem("worker"),
            QUEUE_LABELS,
        )
        .map_err(metrics_error)?;
        let workers_desired = IntGaugeVec::new(
            Opts::new("desired", "Number of desired workers")
                .namespace(NAMESPACE)
                .subsystem("worker"),
            QUEUE_LABELS,
        )
        .map_err(metrics_error)?;
        let workers_available = IntGaugeVec::new(
            Opts::new("available", "Number of available workers")
                .namespace(NAMESPACE)
                .subsystem("worker"),
            QUEUE_LABELS,
        )
        .map_err(metrics_error)?;

        for collector in [
            Box::new(loop_duration_seconds.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(loop_count_success.clone()),
            Box::new(queue_messages.clone()),
            Box::new(queue_messages_sent_per_minute.clone()),
            Box::new(workers_idle.clone()),
            Box::new(workers_current.clone()),
            Box::new(workers_desired.clone()),
            Box::new(workers_available.clone()),
        ] {
            registry.register(collector).map_err(metrics_error)?;
        }

        Ok(Self {
            registry,
            loop_duration_seconds,
            loop_count_success,
            queue_messages,
            queue_messages_sent_per_minute,
            workers_idle,
            workers_current,
            workers_desired,
            workers_available,
        })
    }

    /// Publish the per-queue gauges for one reconciliation.
    #[allow(clippy::too_many_arguments)]
    pub fn record_queue_state(
        &self,
        name: &str,
        namespace: &str,
        queue_name: &str,
        messages: i32,
        messages_sent_per_minute: f64,
        idle: i32,
        current: i32,
        desired: i32,
        available: i32,
    ) {
        let labels = &[name, namespace, queue_name];
        self.queue_messages
            .with_label_values(labels)
            .set(messages as i64);
        self.queue_messages_sent_per_minute
            .with_label_values(labels)
            .set(messages_sent_per_minute);
        self.workers_idle.with_label_values(labels).set(idle as i64);
        self.workers_current
            .with_label_values(labels)
            .set(current as i64);
        self.workers_desired
            .with_label_values(labels)
            .set(desired as i64);
        self.workers_available
            .with_label_values(labels)
            .set(available as i64);
    }

    /// Record a successfully completed loop.
    pub fn record_loop(&self, name: &str, namespace: &str, elapsed: Duration) {
        let labels = &[name, namespace];
        self.loop_duration_seconds
            .with_label_values(labels)
            .set(elapsed.as_secs_f64());
        self.loop_count_success.with_label_values(labels).inc();
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %err, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

fn metrics_error(err: prometheus::Error) -> OperatorError {
    OperatorError::Bootstrap(format!("metrics registration failed: {}", err))
}

async fn metrics_handler(State(metrics): State<Arc<ControllerMetrics>>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        metrics.render(),
    )
        .into_response()
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// Router exposing `/metrics` and `/healthz`.
pub fn router(metrics: Arc<ControllerMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(metrics)
}

/// Serve the metrics endpoint until the process exits.
pub async fn serve(bind_address: String, metrics: Arc<ControllerMetrics>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .map_err(|e| OperatorError::Bootstrap(format!("cannot bind {}: {}", bind_address, e)))?;
    info!(address = %bind_address, "serving metrics");
    axum::serve(listener, router(metrics))
        .await
        .map_err(|e| OperatorError::Bootstrap(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_render_under_wpa_namespace() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.record_queue_state("otpsms", "default", "otpsms", 250, 12.5, 0, 10, 12, 9);
        metrics.record_loop("otpsms", "default", Duration::from_millis(30));

        let rendered = metrics.render();
        for name in [
            "wpa_controller_loop_duration_seconds",
            "wpa_controller_loop_count_success",
            "wpa_queue_messages",
            "wpa_queue_messages_sent_per_minute",
            "wpa_worker_idle",
            "wpa_worker_current",
            "wpa_worker_desired",
            "wpa_worker_available",
        ] {
            assert!(rendered.contains(name), "missing metric {}", name);
        }
        assert!(rendered.contains("queue_name=\"otpsms\""));
    }

    #[test]
    fn test_gauge_values_track_latest_observation() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.record_queue_state("q", "ns", "q", 100, 1.0, 0, 5, 6, 5);
        metrics.record_queue_state("q", "ns", "q", 40, 1.0, 0, 6, 6, 6);

        let rendered = metrics.render();
        assert!(rendered.contains("wpa_queue_messages{"));
        assert!(rendered.contains("} 40"));
    }
}
