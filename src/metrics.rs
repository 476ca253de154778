use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// One-time metric descriptions (so series show up on /metrics with help text).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("feed_polls_total", "Source polls started, by source.");
        describe_counter!("feed_poll_errors_total", "Source polls that returned an error.");
        describe_counter!("feed_items_posted_total", "Items delivered to the notifier.");
        describe_counter!("dedup_entries_purged_total", "Seen-store entries removed by TTL purge.");
        describe_counter!("telemetry_messages_total", "Raw telemetry messages enqueued by listeners.");
        describe_counter!(
            "telemetry_queue_dropped_total",
            "Telemetry messages discarded because the queue was full."
        );
        describe_gauge!("scheduler_last_cycle_ts", "Unix ts of the last scheduler cycle.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Router exposing `/metrics` in the Prometheus exposition format.
    pub fn router(&self) -> Router {
        router_for(self.handle.clone())
    }

    /// Serve `/metrics` on `addr` in the background.
    pub fn serve(&self, addr: String) -> JoinHandle<()> {
        let app = self.router();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(%addr, error = %e, "metrics endpoint bind failed");
                    return;
                }
            };
            info!(%addr, "metrics endpoint listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "metrics endpoint stopped");
            }
        })
    }
}

pub fn router_for(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move { h.render() }
        }),
    )
}
