use crate::error::StoreError;
use crate::store::{
    bucket_start, AggregateQuery, BucketStats, MeasurementSummary, RangeQuery, SeriesFilter,
    TimeRange, TimeSeriesStore,
};
use chrono::{DateTime, Duration, Utc};
use futures::future::try_join_all;
use hissrv_config::QueryConfig;
use hissrv_types::{fields, tags, DataPoint, DataType, Source};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// 单次统计查询允许的最大桶数
pub const MAX_BUCKETS: i64 = 10_000;

/// 请求参数校验错误（不会触发任何后端调用）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("end_time ({end}) must be after start_time ({start})")]
    InvalidTimeRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("time range exceeds the maximum span of {max_days} days")]
    SpanTooLarge { max_days: u32 },

    #[error("page_size {requested} exceeds the maximum of {max}")]
    PageSizeTooLarge { requested: usize, max: usize },

    #[error("page and page_size must be at least 1")]
    InvalidPage,

    #[error("unknown data_type: {0}")]
    UnknownDataType(String),

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("filter on {0} matches no series")]
    EmptyFilter(&'static str),

    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("interval must be a positive number of seconds")]
    InvalidInterval,

    #[error("interval of {requested}s exceeds the maximum span of {max_days} days")]
    IntervalTooLarge { requested: i64, max_days: u32 },

    #[error("request would produce {buckets} buckets, maximum is {max}")]
    TooManyBuckets { buckets: i64, max: i64 },
}

/// 查询错误
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    Validation(#[from] ValidationError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("query timed out after {0} ms")]
    Timeout(u64),

    #[error("backend error: {0}")]
    Backend(#[from] StoreError),
}

/// 聚合函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[serde(alias = "avg")]
    Mean,
    Sum,
    Min,
    Max,
    Count,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Mean => "mean",
            Aggregation::Sum => "sum",
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Count => "count",
        }
    }

    /// 从桶统计中取出对应的值
    pub fn apply(&self, stats: &BucketStats) -> Option<f64> {
        if stats.count == 0 {
            return match self {
                Aggregation::Count => Some(0.0),
                _ => None,
            };
        }
        match self {
            Aggregation::Mean => stats.mean(),
            Aggregation::Sum => Some(stats.sum),
            Aggregation::Min => Some(stats.min),
            Aggregation::Max => Some(stats.max),
            Aggregation::Count => Some(stats.count as f64),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mean" | "avg" => Ok(Aggregation::Mean),
            "sum" => Ok(Aggregation::Sum),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            "count" => Ok(Aggregation::Count),
            other => Err(format!("unknown aggregation: {}", other)),
        }
    }
}

/// 历史数据分页查询
///
/// 过滤集合为 `None` 表示不限制；`Some(vec![])` 表示空集合，会被判定为无候选序列。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub channel_ids: Option<Vec<String>>,
    #[serde(default)]
    pub point_ids: Option<Vec<String>>,
    #[serde(default)]
    pub data_types: Option<Vec<String>>,
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    /// 页码，从 1 开始
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default)]
    pub page_size: Option<usize>,
    /// 调用方的截止时间
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_page() -> usize {
    1
}

impl QueryRequest {
    pub fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time,
            channel_ids: None,
            point_ids: None,
            data_types: None,
            sources: None,
            page: 1,
            page_size: None,
            timeout_ms: None,
        }
    }

    pub fn with_channels<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.channel_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_points<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.point_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_data_types<I: IntoIterator<Item = S>, S: Into<String>>(mut self, types: I) -> Self {
        self.data_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_sources<I: IntoIterator<Item = S>, S: Into<String>>(mut self, sources: I) -> Self {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = Some(page_size);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// 分页查询结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub points: Vec<DataPoint>,
    pub total_count: u64,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: u64,
    pub has_more: bool,
}

/// 单点统计查询
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsRequest {
    pub channel_id: String,
    pub point_id: String,
    pub data_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub aggregation: Aggregation,
    pub interval_secs: i64,
    /// 覆盖配置中的 include_empty_buckets
    #[serde(default)]
    pub include_empty: Option<bool>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsBucket {
    pub timestamp: DateTime<Utc>,
    /// 空桶为 `None`
    pub value: Option<f64>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsResult {
    pub channel_id: String,
    pub point_id: String,
    pub data_type: DataType,
    pub aggregation: Aggregation,
    pub interval_secs: i64,
    pub buckets: Vec<StatisticsBucket>,
}

/// 最新值查询
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestRequest {
    pub channel_id: String,
    pub point_id: String,
    pub data_type: String,
}

/// 已存储数据的整体范围
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangeInfo {
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub total_points: u64,
    pub measurements: Vec<MeasurementSummary>,
}

/// 历史数据查询引擎
///
/// 无状态，只读，可并发调用。
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn TimeSeriesStore>,
    config: QueryConfig,
    retention: Duration,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn TimeSeriesStore>, config: QueryConfig, retention: Duration) -> Self {
        Self {
            store,
            config,
            retention,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// 分页范围查询
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResult, QueryError> {
        let range = self.validate_range(request.start_time, request.end_time)?;
        let page_size = request.page_size.unwrap_or(self.config.default_page_size);
        if request.page == 0 || page_size == 0 {
            return Err(ValidationError::InvalidPage.into());
        }
        if page_size > self.config.max_page_size {
            return Err(ValidationError::PageSizeTooLarge {
                requested: page_size,
                max: self.config.max_page_size,
            }
            .into());
        }

        let data_types = resolve_data_types(request.data_types.as_deref(), request.sources.as_deref())?;
        let mut filter = SeriesFilter::new();
        if let Some(channels) = &request.channel_ids {
            if channels.is_empty() {
                return Err(ValidationError::EmptyFilter("channel_ids").into());
            }
            filter = filter.with_any(tags::CHANNEL_ID, channels.iter().cloned());
        }
        if let Some(points) = &request.point_ids {
            if points.is_empty() {
                return Err(ValidationError::EmptyFilter("point_ids").into());
            }
            filter = filter.with_any(tags::POINT_ID, points.iter().cloned());
        }

        let offset = (request.page - 1).saturating_mul(page_size);
        let limit = offset.saturating_add(page_size);
        let per_measurement: Vec<(RangeQuery, SeriesFilter)> = data_types
            .iter()
            .map(|dt| {
                let filter = filter.clone().with_eq(tags::DATA_TYPE, dt.as_str());
                (
                    RangeQuery {
                        measurement: dt.measurement().to_string(),
                        filter: filter.clone(),
                        range,
                        limit: Some(limit),
                    },
                    filter,
                )
            })
            .collect();

        debug!(
            measurements = per_measurement.len(),
            offset = offset,
            limit = limit,
            "Executing range query"
        );

        let store = &self.store;
        let work = async {
            let ranges = try_join_all(per_measurement.iter().map(|(q, _)| store.query_range(q)));
            let counts = try_join_all(
                per_measurement
                    .iter()
                    .map(|(q, f)| store.count(&q.measurement, f, &range)),
            );
            futures::try_join!(ranges, counts)
        };
        let (batches, counts) = self.with_deadline(request.timeout_ms, work).await?;

        let mut points: Vec<DataPoint> = batches.into_iter().flatten().collect();
        points.sort_by_cached_key(|p| (p.timestamp, p.series_key()));
        let points: Vec<DataPoint> = points.into_iter().skip(offset).take(page_size).collect();

        let total_count: u64 = counts.into_iter().sum();
        let total_pages = total_count.div_ceil(page_size as u64);
        Ok(QueryResult {
            has_more: (request.page as u64) < total_pages,
            points,
            total_count,
            page: request.page,
            page_size,
            total_pages,
        })
    }

    /// 按时间桶聚合单个测点
    pub async fn statistics(&self, request: &StatisticsRequest) -> Result<StatisticsResult, QueryError> {
        let range = self.validate_range(request.start_time, request.end_time)?;
        require("channel_id", &request.channel_id)?;
        require("point_id", &request.point_id)?;
        require("data_type", &request.data_type)?;
        let data_type = parse_data_type(&request.data_type)?;
        if request.interval_secs <= 0 {
            return Err(ValidationError::InvalidInterval.into());
        }
        if request.interval_secs > Duration::days(i64::from(self.config.max_span_days)).num_seconds() {
            return Err(ValidationError::IntervalTooLarge {
                requested: request.interval_secs,
                max_days: self.config.max_span_days,
            }
            .into());
        }
        // 跨度和间隔都已受最大跨度约束，不会溢出
        let span = range.span().num_seconds();
        let buckets = span / request.interval_secs + i64::from(span % request.interval_secs != 0);
        if buckets > MAX_BUCKETS {
            return Err(ValidationError::TooManyBuckets {
                buckets,
                max: MAX_BUCKETS,
            }
            .into());
        }

        let query = AggregateQuery {
            measurement: data_type.measurement().to_string(),
            filter: SeriesFilter::new()
                .with_eq(tags::CHANNEL_ID, request.channel_id.as_str())
                .with_eq(tags::POINT_ID, request.point_id.as_str())
                .with_eq(tags::DATA_TYPE, data_type.as_str()),
            range,
            interval_secs: request.interval_secs,
            field: fields::VALUE.to_string(),
        };
        let rows = self
            .with_deadline(request.timeout_ms, self.store.aggregate(&query))
            .await?;

        let mut merged: BTreeMap<DateTime<Utc>, BucketStats> = BTreeMap::new();
        for row in rows {
            match merged.get_mut(&row.bucket) {
                Some(existing) => existing.merge(&row),
                None => {
                    merged.insert(row.bucket, row);
                }
            }
        }

        let mut buckets: Vec<StatisticsBucket> = merged
            .values()
            .map(|stats| StatisticsBucket {
                timestamp: stats.bucket,
                value: request.aggregation.apply(stats),
                count: stats.count,
            })
            .collect();

        if request.include_empty.unwrap_or(self.config.include_empty_buckets) {
            buckets = fill_empty_buckets(buckets, &range, request.interval_secs, request.aggregation);
        }

        Ok(StatisticsResult {
            channel_id: request.channel_id.clone(),
            point_id: request.point_id.clone(),
            data_type,
            aggregation: request.aggregation,
            interval_secs: request.interval_secs,
            buckets,
        })
    }

    /// 保留期内最新的一个点
    pub async fn latest(&self, request: &LatestRequest) -> Result<DataPoint, QueryError> {
        require("channel_id", &request.channel_id)?;
        require("point_id", &request.point_id)?;
        let data_type = parse_data_type(&request.data_type)?;

        let filter = SeriesFilter::new()
            .with_eq(tags::CHANNEL_ID, request.channel_id.as_str())
            .with_eq(tags::POINT_ID, request.point_id.as_str())
            .with_eq(tags::DATA_TYPE, data_type.as_str());
        let since = Utc::now() - self.retention;

        self.with_deadline(None, self.store.latest(data_type.measurement(), &filter, since))
            .await?
            .ok_or_else(|| {
                QueryError::NotFound(format!(
                    "no data for channel {} point {} ({})",
                    request.channel_id, request.point_id, data_type
                ))
            })
    }

    /// 各 measurement 的数据范围汇总
    pub async fn range_info(&self) -> Result<RangeInfo, QueryError> {
        let store = &self.store;
        let summaries = self
            .with_deadline(
                None,
                try_join_all(DataType::ALL.iter().map(|dt| store.summarize(dt.measurement()))),
            )
            .await?;

        let mut info = RangeInfo::default();
        for summary in summaries {
            info.total_points += summary.total_points;
            info.earliest = min_opt(info.earliest, summary.earliest);
            info.latest = max_opt(info.latest, summary.latest);
            info.measurements.push(summary);
        }
        Ok(info)
    }

    fn validate_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<TimeRange, ValidationError> {
        if end <= start {
            return Err(ValidationError::InvalidTimeRange { start, end });
        }
        if end - start > Duration::days(i64::from(self.config.max_span_days)) {
            return Err(ValidationError::SpanTooLarge {
                max_days: self.config.max_span_days,
            });
        }
        Ok(TimeRange::new(start, end))
    }

    /// 在截止时间内完成后端调用，超时即丢弃所有未完成的子查询
    async fn with_deadline<T, F>(&self, timeout_ms: Option<u64>, fut: F) -> Result<T, QueryError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let timeout_ms = timeout_ms.unwrap_or(self.config.timeout_ms);
        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), fut).await {
            Ok(result) => result.map_err(QueryError::from),
            Err(_) => Err(QueryError::Timeout(timeout_ms)),
        }
    }
}

fn require(name: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::MissingParameter(name))
    } else {
        Ok(())
    }
}

fn parse_data_type(value: &str) -> Result<DataType, ValidationError> {
    value
        .parse()
        .map_err(|_| ValidationError::UnknownDataType(value.to_string()))
}

/// 候选数据类型 = 请求的数据类型 ∩ 请求来源可产生的数据类型
fn resolve_data_types(
    data_types: Option<&[String]>,
    sources: Option<&[String]>,
) -> Result<Vec<DataType>, ValidationError> {
    let mut candidates: BTreeSet<DataType> = match data_types {
        Some([]) => return Err(ValidationError::EmptyFilter("data_types")),
        Some(values) => values
            .iter()
            .map(|v| parse_data_type(v))
            .collect::<Result<_, _>>()?,
        None => DataType::ALL.into_iter().collect(),
    };

    if let Some(sources) = sources {
        if sources.is_empty() {
            return Err(ValidationError::EmptyFilter("sources"));
        }
        let allowed: BTreeSet<DataType> = sources
            .iter()
            .map(|s| {
                s.parse::<Source>()
                    .map_err(|_| ValidationError::UnknownSource(s.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flat_map(|source| source.data_types().iter().copied())
            .collect();
        candidates.retain(|dt| allowed.contains(dt));
    }

    if candidates.is_empty() {
        return Err(ValidationError::EmptyFilter("data_types/sources"));
    }
    Ok(candidates.into_iter().collect())
}

fn fill_empty_buckets(
    buckets: Vec<StatisticsBucket>,
    range: &TimeRange,
    interval_secs: i64,
    aggregation: Aggregation,
) -> Vec<StatisticsBucket> {
    let mut existing: BTreeMap<DateTime<Utc>, StatisticsBucket> =
        buckets.into_iter().map(|b| (b.timestamp, b)).collect();
    let step = Duration::seconds(interval_secs);
    let empty_value = match aggregation {
        Aggregation::Count => Some(0.0),
        _ => None,
    };

    let mut filled = Vec::new();
    let mut cursor = bucket_start(range.start, interval_secs);
    while cursor < range.end {
        filled.push(existing.remove(&cursor).unwrap_or(StatisticsBucket {
            timestamp: cursor,
            value: empty_value,
            count: 0,
        }));
        cursor += step;
    }
    filled
}

fn min_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn telemetry(point_id: &str, ts: DateTime<Utc>, value: f64) -> DataPoint {
        DataPoint::new("telemetry", ts)
            .with_tag(tags::CHANNEL_ID, "1001")
            .with_tag(tags::POINT_ID, point_id)
            .with_tag(tags::DATA_TYPE, "T")
            .with_tag(tags::SOURCE, "comsrv")
            .with_tag(tags::QUALITY, "GOOD")
            .with_field(fields::VALUE, value)
    }

    fn engine(store: Arc<MemoryStore>) -> QueryEngine {
        QueryEngine::new(store, QueryConfig::default(), Duration::days(36_500))
    }

    #[test]
    fn test_resolve_data_types() {
        let strings = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
        let (t, modsrv, x, opcua) = (
            strings(&["T"]),
            strings(&["modsrv"]),
            strings(&["X"]),
            strings(&["opcua"]),
        );
        let empty: Vec<String> = Vec::new();

        let all = resolve_data_types(None, None).unwrap();
        assert_eq!(all.len(), 5);

        let models = resolve_data_types(None, Some(modsrv.as_slice())).unwrap();
        assert_eq!(models, vec![DataType::Model]);

        assert_eq!(
            resolve_data_types(Some(t.as_slice()), Some(modsrv.as_slice())),
            Err(ValidationError::EmptyFilter("data_types/sources"))
        );
        assert_eq!(
            resolve_data_types(Some(x.as_slice()), None),
            Err(ValidationError::UnknownDataType("X".to_string()))
        );
        assert_eq!(
            resolve_data_types(None, Some(opcua.as_slice())),
            Err(ValidationError::UnknownSource("opcua".to_string()))
        );
        assert_eq!(
            resolve_data_types(Some(empty.as_slice()), None),
            Err(ValidationError::EmptyFilter("data_types"))
        );
    }

    #[test]
    fn test_aggregation_parse_and_apply() {
        assert_eq!("avg".parse::<Aggregation>().unwrap(), Aggregation::Mean);
        assert!("median".parse::<Aggregation>().is_err());

        let stats = BucketStats {
            bucket: base(),
            series: Default::default(),
            count: 2,
            sum: 30.0,
            min: 10.0,
            max: 20.0,
        };
        assert_eq!(Aggregation::Mean.apply(&stats), Some(15.0));
        assert_eq!(Aggregation::Count.apply(&stats), Some(2.0));
        assert_eq!(Aggregation::Max.apply(&stats), Some(20.0));
    }

    #[tokio::test]
    async fn test_validation_never_reaches_backend() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());

        let reversed = QueryRequest::new(base(), base());
        assert!(matches!(
            engine.query(&reversed).await,
            Err(QueryError::Validation(ValidationError::InvalidTimeRange { .. }))
        ));

        let oversized = QueryRequest::new(base(), base() + Duration::hours(1)).with_page(1, 1001);
        assert!(matches!(
            engine.query(&oversized).await,
            Err(QueryError::Validation(ValidationError::PageSizeTooLarge { requested: 1001, max: 1000 }))
        ));

        let too_long = QueryRequest::new(base(), base() + Duration::days(400));
        assert!(matches!(
            engine.query(&too_long).await,
            Err(QueryError::Validation(ValidationError::SpanTooLarge { .. }))
        ));

        let no_channels =
            QueryRequest::new(base(), base() + Duration::hours(1)).with_channels(Vec::<String>::new());
        assert!(matches!(
            engine.query(&no_channels).await,
            Err(QueryError::Validation(ValidationError::EmptyFilter("channel_ids")))
        ));

        assert_eq!(store.read_calls(), 0);
    }

    #[tokio::test]
    async fn test_pagination_merges_measurements() {
        let store = Arc::new(MemoryStore::new());
        let mut points: Vec<DataPoint> = (0..20)
            .map(|i| telemetry("1", base() + Duration::minutes(i * 2), i as f64))
            .collect();
        // 另一个 measurement 中交错的点
        points.extend((0..5).map(|i| {
            DataPoint::new("signal", base() + Duration::minutes(i * 2 + 1))
                .with_tag(tags::CHANNEL_ID, "1001")
                .with_tag(tags::POINT_ID, "9")
                .with_tag(tags::DATA_TYPE, "S")
                .with_tag(tags::SOURCE, "comsrv")
                .with_field(fields::VALUE, 1.0)
        }));
        store.write_points(&points).await.unwrap();

        let request = QueryRequest::new(base(), base() + Duration::hours(2)).with_page(1, 10);
        let result = engine(store).query(&request).await.unwrap();

        assert_eq!(result.total_count, 25);
        assert_eq!(result.total_pages, 3);
        assert!(result.has_more);
        let measurements: Vec<&str> = result.points.iter().map(|p| p.measurement.as_str()).collect();
        assert_eq!(&measurements[..4], &["telemetry", "signal", "telemetry", "signal"]);
        assert!(result.points.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_statistics_fills_empty_buckets_on_request() {
        let store = Arc::new(MemoryStore::new());
        store
            .write_points(&[
                telemetry("1", base() + Duration::minutes(15), 10.0),
                telemetry("1", base() + Duration::minutes(45), 20.0),
                telemetry("1", base() + Duration::minutes(150), 40.0),
            ])
            .await
            .unwrap();

        let mut request = StatisticsRequest {
            channel_id: "1001".into(),
            point_id: "1".into(),
            data_type: "T".into(),
            start_time: base(),
            end_time: base() + Duration::hours(3),
            aggregation: Aggregation::Max,
            interval_secs: 3600,
            include_empty: None,
            timeout_ms: None,
        };
        let engine = engine(store);

        let sparse = engine.statistics(&request).await.unwrap();
        assert_eq!(
            sparse.buckets.iter().map(|b| b.value).collect::<Vec<_>>(),
            vec![Some(20.0), Some(40.0)]
        );

        request.include_empty = Some(true);
        let dense = engine.statistics(&request).await.unwrap();
        assert_eq!(dense.buckets.len(), 3);
        assert_eq!(dense.buckets[1].value, None);
        assert_eq!(dense.buckets[1].count, 0);
    }

    #[tokio::test]
    async fn test_statistics_rejects_too_many_buckets() {
        let engine = engine(Arc::new(MemoryStore::new()));
        let request = StatisticsRequest {
            channel_id: "1001".into(),
            point_id: "1".into(),
            data_type: "T".into(),
            start_time: base(),
            end_time: base() + Duration::days(30),
            aggregation: Aggregation::Mean,
            interval_secs: 60,
            include_empty: None,
            timeout_ms: None,
        };
        assert!(matches!(
            engine.statistics(&request).await,
            Err(QueryError::Validation(ValidationError::TooManyBuckets { .. }))
        ));
    }

    #[tokio::test]
    async fn test_statistics_rejects_oversized_interval() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());
        let mut request = StatisticsRequest {
            channel_id: "1001".into(),
            point_id: "1".into(),
            data_type: "T".into(),
            start_time: base(),
            end_time: base() + Duration::hours(3),
            aggregation: Aggregation::Mean,
            interval_secs: i64::MAX,
            include_empty: None,
            timeout_ms: None,
        };
        assert!(matches!(
            engine.statistics(&request).await,
            Err(QueryError::Validation(ValidationError::IntervalTooLarge { .. }))
        ));
        assert_eq!(store.read_calls(), 0);

        // 大于查询跨度但不超过最大跨度的间隔得到单个桶
        request.interval_secs = Duration::days(1).num_seconds();
        assert!(engine.statistics(&request).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_aborts_slow_subqueries() {
        let store = Arc::new(MemoryStore::new());
        store.write_points(&[telemetry("1", base(), 1.0)]).await.unwrap();
        store.set_read_delay(Some(std::time::Duration::from_secs(5))).await;

        let request = QueryRequest::new(base(), base() + Duration::hours(1)).with_timeout_ms(50);
        let started = tokio::time::Instant::now();
        assert!(matches!(
            engine(store).query(&request).await,
            Err(QueryError::Timeout(50))
        ));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_latest_and_not_found() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .write_points(&[
                telemetry("1", now - Duration::minutes(2), 1.0),
                telemetry("1", now - Duration::minutes(1), 2.0),
            ])
            .await
            .unwrap();
        let engine = QueryEngine::new(store, QueryConfig::default(), Duration::days(30));

        let latest = engine
            .latest(&LatestRequest {
                channel_id: "1001".into(),
                point_id: "1".into(),
                data_type: "T".into(),
            })
            .await
            .unwrap();
        assert_eq!(latest.value(), Some(2.0));

        let missing = engine
            .latest(&LatestRequest {
                channel_id: "1001".into(),
                point_id: "2".into(),
                data_type: "T".into(),
            })
            .await;
        assert!(matches!(missing, Err(QueryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_backend_errors_are_distinct() {
        let store = Arc::new(MemoryStore::new());
        store
            .set_unreachable(Some(StoreError::Unavailable("connection refused".into())))
            .await;

        let request = QueryRequest::new(base(), base() + Duration::hours(1));
        assert!(matches!(
            engine(store).query(&request).await,
            Err(QueryError::Backend(StoreError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_range_info() {
        let store = Arc::new(MemoryStore::new());
        store
            .write_points(&[
                telemetry("1", base(), 1.0),
                telemetry("1", base() + Duration::hours(5), 2.0),
            ])
            .await
            .unwrap();

        let info = engine(store).range_info().await.unwrap();
        assert_eq!(info.total_points, 2);
        assert_eq!(info.earliest, Some(base()));
        assert_eq!(info.latest, Some(base() + Duration::hours(5)));
        assert_eq!(info.measurements.len(), 5);
    }
}
