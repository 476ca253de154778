// tests/metrics_recorder.rs
// Installs the process-wide recorder, so it lives in its own test binary.
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use chrono::{DateTime, TimeZone, Utc};
use tower::ServiceExt;

use newsfeeds::metrics::Metrics;
use newsfeeds::sources::Source;
use newsfeeds::{ScheduledSource, Scheduler, SeenStore};

struct Steady;

#[async_trait]
impl Source for Steady {
    fn name(&self) -> &str {
        "steady"
    }

    fn bucket(&self) -> &'static str {
        "steady"
    }

    async fn poll(&mut self, _now: DateTime<Utc>, _seen: &mut SeenStore) -> Result<usize> {
        Ok(2)
    }
}

#[tokio::test]
async fn crate_counters_reach_the_installed_exporter() {
    let metrics = Metrics::init().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut sched = Scheduler::new(
        vec![ScheduledSource::new(Box::new(Steady), Duration::from_secs(60))],
        SeenStore::open(dir.path().join("seen.json"), 7),
        Duration::from_secs(1),
        Duration::from_secs(5),
    );
    let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    sched.run_cycle(now).await;
    sched.run_cycle(now + chrono::Duration::seconds(60)).await;

    let rendered = metrics.handle.render();
    assert!(rendered.contains(r#"feed_polls_total{source="steady"} 2"#), "{rendered}");
    assert!(rendered.contains("scheduler_last_cycle_ts"), "{rendered}");
    assert!(rendered.contains("# HELP feed_polls_total"), "{rendered}");

    let resp = metrics
        .router()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains(r#"feed_polls_total{source="steady"} 2"#), "{text}");
}
