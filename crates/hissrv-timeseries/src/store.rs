use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hissrv_types::{tags, DataPoint, Tags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 半开时间区间 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }
}

/// 标签过滤：同一标签内的取值为 OR，不同标签之间为 AND
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesFilter {
    pub tags: BTreeMap<String, Vec<String>>,
}

impl SeriesFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_any<I, S>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .insert(key.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_eq(self, key: &str, value: impl Into<String>) -> Self {
        self.with_any(key, [value.into()])
    }

    pub fn matches(&self, point_tags: &Tags) -> bool {
        self.tags.iter().all(|(key, allowed)| {
            point_tags
                .get(key)
                .map(|v| allowed.iter().any(|a| a == v))
                .unwrap_or(false)
        })
    }
}

/// 原始数据范围查询
#[derive(Debug, Clone)]
pub struct RangeQuery {
    pub measurement: String,
    pub filter: SeriesFilter,
    pub range: TimeRange,
    /// 按时间升序返回的最大条数
    pub limit: Option<usize>,
}

/// 窗口聚合查询
#[derive(Debug, Clone)]
pub struct AggregateQuery {
    pub measurement: String,
    pub filter: SeriesFilter,
    pub range: TimeRange,
    /// 桶宽（秒），桶按 Unix 纪元对齐
    pub interval_secs: i64,
    pub field: String,
}

/// 单个序列在一个时间桶内的聚合结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub bucket: DateTime<Utc>,
    /// 序列标识标签（channel_id / point_id / data_type / source）
    pub series: Tags,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl BucketStats {
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }

    /// 合并同一时间桶内另一组统计
    pub fn merge(&mut self, other: &BucketStats) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }
}

/// 单个 measurement 的存储概况
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSummary {
    pub measurement: String,
    pub total_points: u64,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub channels: u64,
}

/// 桶起点：按纪元对齐向下取整
pub fn bucket_start(ts: DateTime<Utc>, interval_secs: i64) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let aligned = secs - secs.rem_euclid(interval_secs.max(1));
    DateTime::from_timestamp(aligned, 0).unwrap_or(ts)
}

/// 提取序列标识标签
pub fn identity_tags(point_tags: &Tags) -> Tags {
    tags::IDENTITY
        .iter()
        .filter_map(|key| point_tags.get(*key).map(|v| (key.to_string(), v.clone())))
        .collect()
}

/// 时序数据存储 trait
///
/// 写入以 (measurement, 标签集合, 时间戳) 为键做 upsert，重复写入同一批数据不会产生重复点。
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// 批量写入数据点
    async fn write_points(&self, points: &[DataPoint]) -> Result<(), StoreError>;

    /// 查询时间范围内的原始数据点（时间升序）
    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<DataPoint>, StoreError>;

    /// 统计时间范围内匹配的数据点数
    async fn count(
        &self,
        measurement: &str,
        filter: &SeriesFilter,
        range: &TimeRange,
    ) -> Result<u64, StoreError>;

    /// 按时间桶和序列分组聚合
    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<BucketStats>, StoreError>;

    /// 查询 `since` 之后最新的一个数据点
    async fn latest(
        &self,
        measurement: &str,
        filter: &SeriesFilter,
        since: DateTime<Utc>,
    ) -> Result<Option<DataPoint>, StoreError>;

    /// 删除早于 `cutoff` 的数据，返回删除的点数
    async fn delete_before(
        &self,
        measurement: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// 获取 measurement 的存储概况
    async fn summarize(&self, measurement: &str) -> Result<MeasurementSummary, StoreError>;

    /// 连通性探测
    async fn ping(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_series_filter_and_of_ors() {
        let filter = SeriesFilter::new()
            .with_any("channel_id", ["1001", "1002"])
            .with_eq("data_type", "T");

        let mut point_tags = Tags::new();
        point_tags.insert("channel_id".into(), "1002".into());
        point_tags.insert("data_type".into(), "T".into());
        assert!(filter.matches(&point_tags));

        point_tags.insert("data_type".into(), "S".into());
        assert!(!filter.matches(&point_tags));

        point_tags.remove("data_type");
        assert!(!filter.matches(&point_tags));
        assert!(SeriesFilter::new().matches(&point_tags));
    }

    #[test]
    fn test_bucket_alignment() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 45, 10).unwrap();
        assert_eq!(
            bucket_start(ts, 3600),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            bucket_start(ts, 300),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 45, 0).unwrap()
        );
    }
}
