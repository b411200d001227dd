use crate::error::StoreError;
use crate::store::{
    AggregateQuery, BucketStats, MeasurementSummary, RangeQuery, SeriesFilter, TimeRange,
    TimeSeriesStore,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use hissrv_config::InfluxDbConfig;
use hissrv_types::{tags, DataPoint, Tags};
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use std::fmt::Write as _;
use tracing::{debug, info, warn};

type Row = Map<String, Value>;

/// InfluxDB 3 HTTP 存储实现
///
/// 写入走 `/api/v3/write_lp`（行协议，纳秒精度），查询走 `/api/v3/query_sql`（JSON 行），
/// 按时间删除使用 v2 兼容的 `/api/v2/delete`。
pub struct InfluxStore {
    client: Client,
    base_url: String,
    database: String,
    token: String,
}

impl InfluxStore {
    /// 创建新的 InfluxDB 存储
    pub fn new(config: &InfluxDbConfig) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(config.timeout()).build()?;

        info!(
            url = %config.url,
            database = %config.database,
            "InfluxDB store configured"
        );

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            token: config.token.clone(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.token)
        }
    }

    /// 执行 SQL，返回 JSON 行；表不存在视为空结果
    async fn sql(&self, sql: &str) -> Result<Vec<Row>, StoreError> {
        debug!(sql = %sql, "Executing InfluxDB query");

        let response = self
            .authorized(self.client.post(format!("{}/api/v3/query_sql", self.base_url)))
            .json(&json!({ "db": self.database, "q": sql, "format": "json" }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            if is_missing_table(&body) {
                return Ok(Vec::new());
            }
            return Err(classify_status(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<Value> = serde_json::from_str(&body)?;
        rows.into_iter()
            .map(|row| match row {
                Value::Object(map) => Ok(map),
                other => Err(StoreError::Decode(format!("expected JSON object row, got {}", other))),
            })
            .collect()
    }
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn write_points(&self, points: &[DataPoint]) -> Result<(), StoreError> {
        let body = to_line_protocol(points);
        if body.is_empty() {
            return Ok(());
        }

        let response = self
            .authorized(self.client.post(format!("{}/api/v3/write_lp", self.base_url)))
            .query(&[("db", self.database.as_str()), ("precision", "nanosecond")])
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        debug!(points = points.len(), "Points written to InfluxDB");
        Ok(())
    }

    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<DataPoint>, StoreError> {
        let mut sql = format!(
            "SELECT * FROM {} WHERE {} ORDER BY time ASC, {}, {}",
            quote_ident(&query.measurement),
            where_clause(&query.filter, Some(&query.range)),
            quote_ident(tags::CHANNEL_ID),
            quote_ident(tags::POINT_ID),
        );
        if let Some(limit) = query.limit {
            let _ = write!(sql, " LIMIT {}", limit);
        }

        self.sql(&sql)
            .await?
            .into_iter()
            .map(|row| decode_point(&query.measurement, row))
            .collect()
    }

    async fn count(
        &self,
        measurement: &str,
        filter: &SeriesFilter,
        range: &TimeRange,
    ) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS count FROM {} WHERE {}",
            quote_ident(measurement),
            where_clause(filter, Some(range)),
        );
        let rows = self.sql(&sql).await?;
        Ok(rows.first().and_then(|row| row.get("count")).and_then(Value::as_u64).unwrap_or(0))
    }

    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<BucketStats>, StoreError> {
        let identity = tags::IDENTITY
            .iter()
            .map(|t| quote_ident(t))
            .collect::<Vec<_>>()
            .join(", ");
        let field = quote_ident(&query.field);
        let sql = format!(
            "SELECT date_bin(INTERVAL '{secs} seconds', time, TIMESTAMP '1970-01-01T00:00:00Z') AS bucket, \
             {identity}, COUNT({field}) AS count, SUM({field}) AS sum, MIN({field}) AS min, MAX({field}) AS max \
             FROM {table} WHERE {cond} AND {field} IS NOT NULL \
             GROUP BY bucket, {identity} ORDER BY bucket ASC",
            secs = query.interval_secs,
            identity = identity,
            field = field,
            table = quote_ident(&query.measurement),
            cond = where_clause(&query.filter, Some(&query.range)),
        );

        self.sql(&sql).await?.into_iter().map(decode_bucket).collect()
    }

    async fn latest(
        &self,
        measurement: &str,
        filter: &SeriesFilter,
        since: DateTime<Utc>,
    ) -> Result<Option<DataPoint>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} AND time >= {} ORDER BY time DESC LIMIT 1",
            quote_ident(measurement),
            where_clause(filter, None),
            time_literal(since),
        );
        self.sql(&sql)
            .await?
            .into_iter()
            .next()
            .map(|row| decode_point(measurement, row))
            .transpose()
    }

    async fn delete_before(
        &self,
        measurement: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let range = TimeRange::new(DateTime::<Utc>::UNIX_EPOCH, cutoff);
        let doomed = self.count(measurement, &SeriesFilter::new(), &range).await?;
        if doomed == 0 {
            return Ok(0);
        }

        let response = self
            .authorized(self.client.post(format!("{}/api/v2/delete", self.base_url)))
            .query(&[("bucket", self.database.as_str())])
            .json(&json!({
                "start": rfc3339(range.start),
                "stop": rfc3339(cutoff),
                "predicate": format!("_measurement=\"{}\"", measurement.replace('"', "\\\"")),
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        info!(measurement = %measurement, deleted = doomed, "Old points deleted");
        Ok(doomed)
    }

    async fn summarize(&self, measurement: &str) -> Result<MeasurementSummary, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS total, MIN(time) AS earliest, MAX(time) AS latest, \
             COUNT(DISTINCT {}) AS channels FROM {}",
            quote_ident(tags::CHANNEL_ID),
            quote_ident(measurement),
        );
        let rows = self.sql(&sql).await?;
        let mut summary = MeasurementSummary {
            measurement: measurement.to_string(),
            ..Default::default()
        };
        if let Some(row) = rows.first() {
            summary.total_points = row.get("total").and_then(Value::as_u64).unwrap_or(0);
            summary.channels = row.get("channels").and_then(Value::as_u64).unwrap_or(0);
            summary.earliest = row.get("earliest").and_then(parse_time);
            summary.latest = row.get("latest").and_then(parse_time);
        }
        Ok(summary)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.sql("SELECT 1").await.map(|_| ())
    }
}

/// 将 HTTP 状态码映射为存储错误
pub(crate) fn classify_status(status: StatusCode, body: &str) -> StoreError {
    let message = format!("{}: {}", status, body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized(message),
        StatusCode::NOT_FOUND => StoreError::DatabaseNotFound(message),
        StatusCode::TOO_MANY_REQUESTS => StoreError::Unavailable(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => StoreError::Timeout(message),
        s if s.is_server_error() => StoreError::Unavailable(message),
        s if s.is_client_error() => StoreError::Rejected(message),
        _ => {
            warn!(status = %status, "Unexpected InfluxDB response status");
            StoreError::Decode(message)
        }
    }
}

fn is_missing_table(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("table") && lower.contains("not found")
}

/// 编码为行协议；非有限值字段被跳过，无字段的点整体跳过
pub(crate) fn to_line_protocol(points: &[DataPoint]) -> String {
    let mut out = String::new();
    for point in points {
        let fields: Vec<String> = point
            .fields
            .iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| format!("{}={}", escape_key(k), v))
            .collect();
        if fields.is_empty() {
            continue;
        }

        out.push_str(&escape_measurement(&point.measurement));
        for (k, v) in &point.tags {
            if v.is_empty() {
                continue;
            }
            let _ = write!(out, ",{}={}", escape_key(k), escape_key(v));
        }
        out.push(' ');
        out.push_str(&fields.join(","));
        let nanos = point
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| point.timestamp.timestamp_millis().saturating_mul(1_000_000));
        let _ = writeln!(out, " {}", nanos);
    }
    out
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

pub(crate) fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn time_literal(ts: DateTime<Utc>) -> String {
    format!("'{}'", rfc3339(ts))
}

/// 组合 WHERE 条件：时间区间 AND 各标签的 IN 集合
pub(crate) fn where_clause(filter: &SeriesFilter, range: Option<&TimeRange>) -> String {
    let mut clauses = Vec::new();
    if let Some(range) = range {
        clauses.push(format!(
            "time >= {} AND time < {}",
            time_literal(range.start),
            time_literal(range.end)
        ));
    }
    for (key, values) in &filter.tags {
        if values.is_empty() {
            clauses.push("FALSE".to_string());
            continue;
        }
        let list = values.iter().map(|v| quote_literal(v)).collect::<Vec<_>>().join(", ");
        clauses.push(format!("{} IN ({})", quote_ident(key), list));
    }
    if clauses.is_empty() {
        "TRUE".to_string()
    } else {
        clauses.join(" AND ")
    }
}

/// 解析查询结果中的时间列（RFC3339、无时区 ISO 或纳秒整数）
pub(crate) fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => n.as_i64().map(DateTime::from_timestamp_nanos),
        _ => None,
    }
}

/// 字符串列作为标签，数值列作为字段
pub(crate) fn decode_point(measurement: &str, row: Row) -> Result<DataPoint, StoreError> {
    let timestamp = row
        .get("time")
        .and_then(parse_time)
        .ok_or_else(|| StoreError::Decode(format!("row without valid time column: {:?}", row)))?;

    let mut point = DataPoint::new(measurement, timestamp);
    for (column, value) in row {
        if column == "time" {
            continue;
        }
        match value {
            Value::String(s) => {
                point.tags.insert(column, s);
            }
            Value::Number(n) => {
                if let Some(v) = n.as_f64() {
                    point.fields.insert(column, v);
                }
            }
            _ => {}
        }
    }
    Ok(point)
}

fn decode_bucket(row: Row) -> Result<BucketStats, StoreError> {
    let bucket = row
        .get("bucket")
        .and_then(parse_time)
        .ok_or_else(|| StoreError::Decode(format!("aggregate row without bucket: {:?}", row)))?;
    let series: Tags = tags::IDENTITY
        .iter()
        .filter_map(|key| {
            row.get(*key)
                .and_then(Value::as_str)
                .map(|v| (key.to_string(), v.to_string()))
        })
        .collect();
    let number = |key: &str| row.get(key).and_then(Value::as_f64);

    Ok(BucketStats {
        bucket,
        series,
        count: row.get("count").and_then(Value::as_u64).unwrap_or(0),
        sum: number("sum").unwrap_or(0.0),
        min: number("min").unwrap_or(f64::NAN),
        max: number("max").unwrap_or(f64::NAN),
    })
}
