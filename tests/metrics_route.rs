// tests/metrics_route.rs
mod common;

use axum::body::{self, Body};
use http::{Request, StatusCode};
use common::*;
use feedgate::ingest::providers::feed::FeedProvider;
use feedgate::ingest::types::FeedSource;
use feedgate::metrics::Metrics;
use tower::ServiceExt;

const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns:yt="http://www.youtube.com/xml/schemas/2015" xmlns="http://www.w3.org/2005/Atom">
 <entry>
  <yt:videoId>m1</yt:videoId>
  <title>Claude Code on Kubernetes</title>
  <published>PUBLISHED</published>
 </entry>
</feed>"#;

#[tokio::test]
async fn metrics_endpoint_exposes_cycle_series() {
    // installs the global recorder; keep this the only test in the binary
    let metrics = Metrics::init().unwrap();

    let app = app_config(10.0, 0.5);
    let meta = FakeMetadata::default().with("m1", long_video(&["claude code", "kubernetes"]));
    let h = Harness::new(&app, meta, FakeRunner::default());
    let xml = FEED.replace("PUBLISHED", &chrono::Utc::now().to_rfc3339());
    let sources: Vec<Box<dyn FeedSource>> =
        vec![Box::new(FeedProvider::from_fixture_str("Fixture", "primary", &xml))];

    let report = h.scheduler(app, sources).run_cycle(false, &no_shutdown()).await.unwrap();
    assert_eq!(report.completed, 1);

    let resp = metrics
        .router()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    for needle in [
        "cycle_runs_total",
        "feed_entries_total",
        "feed_parse_ms",
        "stage1_pass_total",
        "stage2_pass_total",
        "dispatch_total{status=\"completed\"}",
        "budget_spent_usd",
        "cycle_last_run_ts",
    ] {
        assert!(text.contains(needle), "missing `{needle}` in:\n{text}");
    }
}
