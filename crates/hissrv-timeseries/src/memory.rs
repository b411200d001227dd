use crate::error::StoreError;
use crate::store::{
    bucket_start, identity_tags, AggregateQuery, BucketStats, MeasurementSummary, RangeQuery,
    SeriesFilter, TimeRange, TimeSeriesStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hissrv_types::{tags, DataPoint, Tags};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

type SeriesIndex = BTreeMap<(DateTime<Utc>, String), DataPoint>;

/// 内存时序存储
///
/// 语义与 InfluxDB 一致：同一序列键 + 时间戳的点后写覆盖。用于测试和无外部依赖的本地运行。
#[derive(Default)]
pub struct MemoryStore {
    measurements: RwLock<HashMap<String, SeriesIndex>>,
    /// 预置的写入结果，按顺序消费；`None` 表示该次写入正常执行
    write_failures: Mutex<VecDeque<Option<StoreError>>>,
    write_calls: AtomicU64,
    read_calls: AtomicU64,
    unreachable: RwLock<Option<StoreError>>,
    read_delay: RwLock<Option<std::time::Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的若干次写入依次返回给定错误
    pub async fn fail_next_writes<I>(&self, errors: I)
    where
        I: IntoIterator<Item = StoreError>,
    {
        self.write_failures.lock().await.extend(errors.into_iter().map(Some));
    }

    /// 先放行 `successes` 次写入，再依次返回给定错误
    pub async fn fail_writes_after<I>(&self, successes: usize, errors: I)
    where
        I: IntoIterator<Item = StoreError>,
    {
        let mut queue = self.write_failures.lock().await;
        queue.extend(std::iter::repeat_with(|| None).take(successes));
        queue.extend(errors.into_iter().map(Some));
    }

    /// 设置后所有读写和探测都返回该错误，传 `None` 恢复
    pub async fn set_unreachable(&self, error: Option<StoreError>) {
        *self.unreachable.write().await = error;
    }

    /// 每次读类操作前先等待给定时长，用于模拟慢查询
    pub async fn set_read_delay(&self, delay: Option<std::time::Duration>) {
        *self.read_delay.write().await = delay;
    }

    /// write_points 的调用次数（包括失败的调用）
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::Relaxed)
    }

    /// 读类操作（查询、计数、聚合、最新值）的调用次数
    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::Relaxed)
    }

    /// 所有 measurement 中存储的点总数
    pub async fn len(&self) -> usize {
        self.measurements.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 某个 measurement 下的全部点（时间升序）
    pub async fn points(&self, measurement: &str) -> Vec<DataPoint> {
        self.measurements
            .read()
            .await
            .get(measurement)
            .map(|index| index.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn check_reachable(&self) -> Result<(), StoreError> {
        match self.unreachable.read().await.as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn begin_read(&self) -> Result<(), StoreError> {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        let delay = *self.read_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable().await
    }

    fn matching<'a>(
        index: &'a SeriesIndex,
        filter: &'a SeriesFilter,
        range: &'a TimeRange,
    ) -> impl Iterator<Item = &'a DataPoint> + 'a {
        index
            .range((range.start, String::new())..)
            .take_while(move |((ts, _), _)| *ts < range.end)
            .map(|(_, point)| point)
            .filter(move |point| filter.matches(&point.tags))
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn write_points(&self, points: &[DataPoint]) -> Result<(), StoreError> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        self.check_reachable().await?;
        if let Some(Some(err)) = self.write_failures.lock().await.pop_front() {
            return Err(err);
        }

        let mut measurements = self.measurements.write().await;
        for point in points {
            measurements
                .entry(point.measurement.clone())
                .or_default()
                .insert((point.timestamp, point.series_key()), point.clone());
        }
        Ok(())
    }

    async fn query_range(&self, query: &RangeQuery) -> Result<Vec<DataPoint>, StoreError> {
        self.begin_read().await?;
        let measurements = self.measurements.read().await;
        let Some(index) = measurements.get(&query.measurement) else {
            return Ok(Vec::new());
        };

        let iter = Self::matching(index, &query.filter, &query.range).cloned();
        Ok(match query.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    async fn count(
        &self,
        measurement: &str,
        filter: &SeriesFilter,
        range: &TimeRange,
    ) -> Result<u64, StoreError> {
        self.begin_read().await?;
        let measurements = self.measurements.read().await;
        Ok(measurements
            .get(measurement)
            .map(|index| Self::matching(index, filter, range).count() as u64)
            .unwrap_or(0))
    }

    async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<BucketStats>, StoreError> {
        self.begin_read().await?;
        let measurements = self.measurements.read().await;
        let Some(index) = measurements.get(&query.measurement) else {
            return Ok(Vec::new());
        };

        let mut buckets: BTreeMap<(DateTime<Utc>, Tags), BucketStats> = BTreeMap::new();
        for point in Self::matching(index, &query.filter, &query.range) {
            let Some(value) = point.fields.get(&query.field).copied() else {
                continue;
            };
            let bucket = bucket_start(point.timestamp, query.interval_secs);
            let series = identity_tags(&point.tags);
            buckets
                .entry((bucket, series.clone()))
                .and_modify(|stats| {
                    stats.count += 1;
                    stats.sum += value;
                    stats.min = stats.min.min(value);
                    stats.max = stats.max.max(value);
                })
                .or_insert(BucketStats {
                    bucket,
                    series,
                    count: 1,
                    sum: value,
                    min: value,
                    max: value,
                });
        }
        Ok(buckets.into_values().collect())
    }

    async fn latest(
        &self,
        measurement: &str,
        filter: &SeriesFilter,
        since: DateTime<Utc>,
    ) -> Result<Option<DataPoint>, StoreError> {
        self.begin_read().await?;
        let measurements = self.measurements.read().await;
        Ok(measurements.get(measurement).and_then(|index| {
            index
                .range((since, String::new())..)
                .rev()
                .map(|(_, point)| point)
                .find(|point| filter.matches(&point.tags))
                .cloned()
        }))
    }

    async fn delete_before(
        &self,
        measurement: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.check_reachable().await?;
        let mut measurements = self.measurements.write().await;
        let Some(index) = measurements.get_mut(measurement) else {
            return Ok(0);
        };

        let kept = index.split_off(&(cutoff, String::new()));
        let deleted = index.len() as u64;
        *index = kept;
        Ok(deleted)
    }

    async fn summarize(&self, measurement: &str) -> Result<MeasurementSummary, StoreError> {
        self.begin_read().await?;
        let measurements = self.measurements.read().await;
        let mut summary = MeasurementSummary {
            measurement: measurement.to_string(),
            ..Default::default()
        };
        if let Some(index) = measurements.get(measurement) {
            summary.total_points = index.len() as u64;
            summary.earliest = index.keys().next().map(|(ts, _)| *ts);
            summary.latest = index.keys().next_back().map(|(ts, _)| *ts);
            summary.channels = index
                .values()
                .filter_map(|p| p.tag(tags::CHANNEL_ID))
                .collect::<HashSet<_>>()
                .len() as u64;
        }
        Ok(summary)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_reachable().await
    }
}
