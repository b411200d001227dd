use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use hissrv_collector::MemorySource;
use hissrv_config::{AppConfig, PatternGroupConfig};
use hissrv_server::{create_router, AppState};
use hissrv_timeseries::{MemoryStore, StoreError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct TestApp {
    source: Arc<MemorySource>,
    store: Arc<MemoryStore>,
    router: Router,
}

fn app() -> TestApp {
    let mut config = AppConfig::default();
    config.collection.groups = vec![
        PatternGroupConfig::new("telemetry", "comsrv:*:T"),
        PatternGroupConfig::new("signal", "comsrv:*:S"),
    ];
    let source = Arc::new(MemorySource::new());
    let store = Arc::new(MemoryStore::new());
    let state = AppState::with_components(&config, source.clone(), store.clone()).unwrap();
    TestApp {
        source,
        store,
        router: create_router(state, &config.server.api_prefix),
    }
}

async fn send(router: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .uri(uri)
        .method(method)
        .body(Body::empty())
        .expect("request");
    let resp = router.clone().oneshot(req).await.expect("response");
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn collect_then_query() {
    let app = app();
    app.source
        .insert_hash(
            "comsrv:1001:T",
            [("1", "25.5"), ("2", "380.2"), ("_timestamp", "1704067200")],
        )
        .await;

    let (status, body) = send(&app.router, "POST", "/hisApi/collector/groups/telemetry/collect").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["points_written"], 2);
    assert_eq!(body["outcome"]["status"], "succeeded");

    let (status, body) = send(
        &app.router,
        "GET",
        "/hisApi/data/query?start_time=2024-01-01T00:00:00Z&end_time=2024-01-01T01:00:00Z&channel_ids=1001&data_types=T",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_count"], 2);
    assert_eq!(body["points"][0]["fields"]["value"], 25.5);

    let (status, body) = send(
        &app.router,
        "GET",
        "/hisApi/data/latest?channel_id=1001&point_id=2&data_type=T",
    )
    .await;
    // 样例时间戳早于默认保留期
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, body) = send(&app.router, "GET", "/hisApi/collector/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["telemetry"]["records_scanned"], 1);
}

#[tokio::test]
async fn statistics_endpoint() {
    let app = app();
    app.source
        .insert_hash("comsrv:7:T", [("1", "10.0"), ("_timestamp", "1704068100")])
        .await;
    send(&app.router, "POST", "/hisApi/collector/groups/telemetry/collect").await;
    app.source
        .insert_hash("comsrv:7:T", [("1", "20.0"), ("_timestamp", "1704069900")])
        .await;
    send(&app.router, "POST", "/hisApi/collector/groups/telemetry/collect").await;
    assert_eq!(app.store.len().await, 2);

    let (status, body) = send(
        &app.router,
        "GET",
        "/hisApi/data/statistics?channel_id=7&point_id=1&data_type=T&start_time=1704067200&end_time=1704070800&aggregation=avg&interval=1h",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["buckets"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["buckets"][0]["value"], 15.0);
    assert_eq!(body["buckets"][0]["count"], 2);
}

#[tokio::test]
async fn validation_errors_are_distinguished() {
    let app = app();

    let (status, body) = send(
        &app.router,
        "GET",
        "/hisApi/data/query?start_time=2024-01-02T00:00:00Z&end_time=2024-01-01T00:00:00Z",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
    assert_eq!(body["status"], 400);

    let (status, body) = send(&app.router, "GET", "/hisApi/data/query?end_time=1704067200").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some_and(|e| e.contains("start_time")));

    let (status, _) = send(
        &app.router,
        "GET",
        "/hisApi/data/statistics?channel_id=1&point_id=1&data_type=T&start_time=0&end_time=60&interval=1w",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.store.read_calls(), 0);

    app.store
        .set_unreachable(Some(StoreError::Unavailable("refused".into())))
        .await;
    let (status, body) = send(
        &app.router,
        "GET",
        "/hisApi/data/query?start_time=1704067200&end_time=1704070800",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["kind"], "backend");
}

#[tokio::test]
async fn scheduler_and_health_endpoints() {
    let app = app();

    let (status, body) = send(&app.router, "GET", "/hisApi/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(&app.router, "POST", "/hisApi/scheduler/jobs/statistics/trigger").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["trigger"], "manual");

    let (status, _) = send(&app.router, "POST", "/hisApi/scheduler/jobs/vacuum/trigger").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app.router, "POST", "/hisApi/collector/groups/nope/collect").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app.router, "GET", "/hisApi/scheduler/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"].as_array().map(Vec::len), Some(4));
    assert!(body["storage"]["generated_at"].is_string());

    app.store
        .set_unreachable(Some(StoreError::Unavailable("refused".into())))
        .await;
    let (status, body) = send(&app.router, "GET", "/hisApi/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["components"]["influxdb"]["healthy"], false);
}

#[tokio::test]
async fn channels_and_metrics_endpoints() {
    let app = app();
    let now = chrono::Utc::now().timestamp().to_string();
    app.source
        .insert_hash("comsrv:1002:T", [("1", "1.0"), ("_timestamp", now.as_str())])
        .await;
    app.source
        .insert_hash("comsrv:1001:T", [("1", "2.0"), ("_timestamp", now.as_str())])
        .await;
    app.source
        .insert_hash("comsrv:1001:S", [("1", "1"), ("_timestamp", now.as_str())])
        .await;

    let (status, body) = send(&app.router, "GET", "/hisApi/channels").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["channels"], serde_json::json!(["1001", "1002"]));

    send(&app.router, "POST", "/hisApi/collector/groups/telemetry/collect").await;
    send(&app.router, "POST", "/hisApi/collector/groups/signal/collect").await;
    send(&app.router, "POST", "/hisApi/scheduler/jobs/statistics/trigger").await;

    let (status, body) = send(&app.router, "GET", "/hisApi/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_points"], 3);
    assert_eq!(body["channels_count"], 2);
    // telemetry 两个通道 + signal 一个通道
    assert_eq!(body["active_channels"], 3);
    assert!(body["latest_timestamp"].is_string());
    assert!(body["statistics_generated_at"].is_string());

    app.source.set_unavailable(true);
    let (status, body) = send(&app.router, "GET", "/hisApi/channels").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["kind"], "backend");
}

#[tokio::test]
async fn slow_backend_query_times_out() {
    let app = app();
    app.store.set_read_delay(Some(Duration::from_secs(5))).await;

    let (status, body) = send(
        &app.router,
        "GET",
        "/hisApi/data/query?start_time=1704067200&end_time=1704070800&timeout_ms=50",
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["kind"], "timeout");
    assert_eq!(body["status"], 504);
}
