// tests/metrics_endpoint.rs
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use metrics_exporter_prometheus::PrometheusBuilder;
use tower::ServiceExt;

use newsfeeds::metrics::{ensure_metrics_described, router_for};

#[tokio::test]
async fn metrics_route_renders_recorded_series() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        ensure_metrics_described();
        metrics::counter!("feed_polls_total", "source" => "Quakes").increment(3);
        metrics::gauge!("scheduler_last_cycle_ts").set(1_700_000_000.0);
    });

    let resp = router_for(handle)
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains(r#"feed_polls_total{source="Quakes"} 3"#), "{text}");
    assert!(text.contains("scheduler_last_cycle_ts 17"), "{text}");
}

#[tokio::test]
async fn other_paths_are_not_found() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let resp = router_for(recorder.handle())
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
