use crate::error::{ApiError, Result};
use crate::scheduler::{JobRun, SchedulerStatus};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use hissrv_timeseries::{
    Aggregation, LatestRequest, QueryError, QueryRequest, QueryResult, RangeInfo,
    StatisticsRequest, StatisticsResult, ValidationError,
};
use hissrv_types::{CollectionCycleResult, DataPoint, HealthState, HealthStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

/// 历史数据查询参数；列表参数以逗号分隔
#[derive(Debug, Default, Deserialize)]
pub struct DataQueryParams {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub channel_ids: Option<String>,
    pub point_ids: Option<String>,
    pub data_types: Option<String>,
    pub sources: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub timeout_ms: Option<u64>,
}

/// 统计查询参数
#[derive(Debug, Default, Deserialize)]
pub struct StatisticsParams {
    pub channel_id: Option<String>,
    pub point_id: Option<String>,
    pub data_type: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// mean（默认）、sum、min、max、count
    pub aggregation: Option<String>,
    /// 例如 `3600`、`15m`、`1h`、`1d`
    pub interval: Option<String>,
    pub include_empty: Option<bool>,
    pub timeout_ms: Option<u64>,
}

/// 最新值查询参数
#[derive(Debug, Default, Deserialize)]
pub struct LatestParams {
    pub channel_id: Option<String>,
    pub point_id: Option<String>,
    pub data_type: Option<String>,
}

/// 数据源中的通道列表
#[derive(Debug, Serialize)]
pub struct ChannelList {
    pub channels: Vec<String>,
    pub count: usize,
}

/// 数据指标
#[derive(Debug, Serialize)]
pub struct DataMetrics {
    /// 时序库中实际存储的点数
    pub total_points: u64,
    pub earliest_timestamp: Option<DateTime<Utc>>,
    pub latest_timestamp: Option<DateTime<Utc>>,
    /// 数据源中的通道数
    pub channels_count: usize,
    /// 最新数据在最近一小时内的 measurement 中，不同通道数之和
    pub active_channels: u64,
    /// 最近一次统计任务的时间，尚未运行时为空
    pub statistics_generated_at: Option<DateTime<Utc>>,
    pub rollup_points: u64,
}

/// 创建 API 路由，所有路由挂在 `prefix` 之下
pub fn create_router(state: AppState, prefix: &str) -> Router {
    let api = Router::new()
        .route("/health", get(health_check))
        .route("/data/query", get(query_data))
        .route("/data/statistics", get(query_statistics))
        .route("/data/latest", get(query_latest))
        .route("/data/range", get(query_range_info))
        .route("/channels", get(list_channels))
        .route("/metrics", get(data_metrics))
        .route("/scheduler/status", get(scheduler_status))
        .route("/scheduler/jobs/:job/trigger", post(trigger_job))
        .route("/collector/status", get(collector_status))
        .route("/collector/groups/:group/collect", post(collect_group));

    let prefix = prefix.trim_end_matches('/');
    let router = if prefix.is_empty() {
        api
    } else {
        Router::new().nest(prefix, api)
    };

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 健康检查；时序库不可用时返回 503
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let health = state.health.check().await;
    let code = match health.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
    };
    (code, Json(health))
}

/// 历史数据分页查询
async fn query_data(
    State(state): State<AppState>,
    Query(params): Query<DataQueryParams>,
) -> Result<Json<QueryResult>> {
    debug!(?params, "History query");

    let start = required_time("start_time", params.start_time.as_deref())?;
    let end = required_time("end_time", params.end_time.as_deref())?;
    let mut request = QueryRequest::new(start, end);
    request.channel_ids = params.channel_ids.as_deref().map(split_list);
    request.point_ids = params.point_ids.as_deref().map(split_list);
    request.data_types = params.data_types.as_deref().map(split_list);
    request.sources = params.sources.as_deref().map(split_list);
    request.page = params.page.unwrap_or(1);
    request.page_size = params.page_size;
    request.timeout_ms = params.timeout_ms;

    Ok(Json(state.query_engine.query(&request).await?))
}

/// 单点分桶统计
async fn query_statistics(
    State(state): State<AppState>,
    Query(params): Query<StatisticsParams>,
) -> Result<Json<StatisticsResult>> {
    debug!(?params, "Statistics query");

    let aggregation = match params.aggregation.as_deref() {
        Some(raw) => raw.parse::<Aggregation>().map_err(ApiError::BadRequest)?,
        None => Aggregation::Mean,
    };
    let interval = params
        .interval
        .as_deref()
        .ok_or(ValidationError::MissingParameter("interval"))
        .map_err(QueryError::from)?;
    let interval_secs = parse_interval(interval)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid interval: {}", interval)))?;

    let request = StatisticsRequest {
        channel_id: params.channel_id.unwrap_or_default(),
        point_id: params.point_id.unwrap_or_default(),
        data_type: params.data_type.unwrap_or_default(),
        start_time: required_time("start_time", params.start_time.as_deref())?,
        end_time: required_time("end_time", params.end_time.as_deref())?,
        aggregation,
        interval_secs,
        include_empty: params.include_empty,
        timeout_ms: params.timeout_ms,
    };

    Ok(Json(state.query_engine.statistics(&request).await?))
}

/// 单点最新值
async fn query_latest(
    State(state): State<AppState>,
    Query(params): Query<LatestParams>,
) -> Result<Json<DataPoint>> {
    let request = LatestRequest {
        channel_id: params.channel_id.unwrap_or_default(),
        point_id: params.point_id.unwrap_or_default(),
        data_type: params.data_type.unwrap_or_default(),
    };
    Ok(Json(state.query_engine.latest(&request).await?))
}

/// 已存储数据的时间范围
async fn query_range_info(State(state): State<AppState>) -> Result<Json<RangeInfo>> {
    Ok(Json(state.query_engine.range_info().await?))
}

/// 通道列表
async fn list_channels(State(state): State<AppState>) -> Result<Json<ChannelList>> {
    let channels = state.collector.channel_list().await?;
    Ok(Json(ChannelList {
        count: channels.len(),
        channels,
    }))
}

/// 数据指标：存储范围、通道数和最近一次统计任务的概况
async fn data_metrics(State(state): State<AppState>) -> Result<Json<DataMetrics>> {
    let range = state.query_engine.range_info().await?;
    let channels = state.collector.channel_list().await?;
    let report = state.scheduler.storage_report().await;

    let active_since = Utc::now() - Duration::hours(1);
    let active_channels = range
        .measurements
        .iter()
        .filter(|m| m.latest.is_some_and(|ts| ts >= active_since))
        .map(|m| m.channels)
        .sum::<u64>();

    Ok(Json(DataMetrics {
        total_points: range.total_points,
        earliest_timestamp: range.earliest,
        latest_timestamp: range.latest,
        channels_count: channels.len(),
        active_channels,
        statistics_generated_at: report.as_ref().and_then(|r| r.generated_at),
        rollup_points: report.map_or(0, |r| r.rollup_points),
    }))
}

async fn scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status().await)
}

/// 手动触发任务
async fn trigger_job(State(state): State<AppState>, Path(job): Path<String>) -> Result<Json<JobRun>> {
    info!(job = %job, "Manual job trigger requested");
    Ok(Json(state.scheduler.trigger(&job).await?))
}

/// 各采集组最近一次周期结果
async fn collector_status(
    State(state): State<AppState>,
) -> Json<BTreeMap<String, CollectionCycleResult>> {
    Json(state.collector.last_results())
}

/// 手动执行一个采集组的周期
async fn collect_group(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Result<Json<CollectionCycleResult>> {
    info!(group = %group, "Manual collection requested");
    Ok(Json(state.collector.collect_cycle(&group).await?))
}

fn required_time(name: &'static str, raw: Option<&str>) -> Result<DateTime<Utc>> {
    let raw = raw
        .filter(|s| !s.trim().is_empty())
        .ok_or(ValidationError::MissingParameter(name))
        .map_err(QueryError::from)?;
    parse_time(raw).ok_or_else(|| ApiError::BadRequest(format!("invalid {}: {}", name, raw)))
}

/// RFC 3339 或 Unix 秒
pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// 解析时间间隔为秒数：纯数字按秒，支持 s/m/h/d 后缀
pub fn parse_interval(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (digits, unit) = match raw.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: i64 = digits.parse().ok()?;
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return None,
    };
    value.checked_mul(multiplier).filter(|secs| *secs > 0)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("3600"), Some(3600));
        assert_eq!(parse_interval("15m"), Some(900));
        assert_eq!(parse_interval("1h"), Some(3600));
        assert_eq!(parse_interval("2d"), Some(172_800));
        assert_eq!(parse_interval("0"), None);
        assert_eq!(parse_interval("1w"), None);
        assert_eq!(parse_interval("h"), None);
    }

    #[test]
    fn test_parse_time() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_time("2024-01-01T00:00:00Z"), Some(expected));
        assert_eq!(parse_time("2024-01-01T08:00:00+08:00"), Some(expected));
        assert_eq!(parse_time("1704067200"), Some(expected));
        assert_eq!(parse_time("yesterday"), None);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("1001, 1002,,"), vec!["1001", "1002"]);
        assert!(split_list("").is_empty());
    }
}
