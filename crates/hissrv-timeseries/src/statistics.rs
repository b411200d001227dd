use crate::error::StoreError;
use crate::store::{
    bucket_start, AggregateQuery, BucketStats, MeasurementSummary, SeriesFilter, TimeRange,
    TimeSeriesStore,
};
use chrono::{DateTime, Duration, Utc};
use futures::future::try_join_all;
use hissrv_config::RollupConfig;
use hissrv_types::{fields, DataPoint, DataType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// 预聚合数据所在的 measurement
pub fn rollup_measurement(measurement: &str) -> String {
    format!("{}_rollup", measurement)
}

/// 预聚合策略
#[derive(Debug, Clone)]
pub struct RollupPolicy {
    /// 时间桶大小（秒）
    pub bucket_secs: i64,

    /// 回溯窗口
    pub lookback: Duration,
}

impl RollupPolicy {
    pub fn hourly() -> Self {
        Self {
            bucket_secs: 3600,
            lookback: Duration::hours(24),
        }
    }
}

impl From<&RollupConfig> for RollupPolicy {
    fn from(config: &RollupConfig) -> Self {
        Self {
            bucket_secs: config.bucket_secs as i64,
            lookback: Duration::hours(config.lookback_hours as i64),
        }
    }
}

/// 统计任务结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticsReport {
    pub generated_at: Option<DateTime<Utc>>,
    pub total_points: u64,
    pub measurements: Vec<MeasurementSummary>,
    /// 本次写入的预聚合点数
    pub rollup_points: u64,
}

/// 统计管理器：存储概况与可选的预聚合
pub struct StatisticsManager {
    store: Arc<dyn TimeSeriesStore>,
}

impl StatisticsManager {
    pub fn new(store: Arc<dyn TimeSeriesStore>) -> Self {
        Self { store }
    }

    /// 执行统计任务
    pub async fn run(
        &self,
        rollup: Option<&RollupPolicy>,
        now: DateTime<Utc>,
    ) -> Result<StatisticsReport, StoreError> {
        let mut report = self.storage_report(now).await?;
        if let Some(policy) = rollup {
            report.rollup_points = self.rollup(policy, now).await?;
        }

        info!(
            total_points = report.total_points,
            rollup_points = report.rollup_points,
            "Statistics job completed"
        );
        Ok(report)
    }

    /// 汇总各数据类型 measurement 的存储概况
    pub async fn storage_report(&self, now: DateTime<Utc>) -> Result<StatisticsReport, StoreError> {
        let store = &self.store;
        let measurements =
            try_join_all(DataType::ALL.iter().map(|dt| store.summarize(dt.measurement()))).await?;

        Ok(StatisticsReport {
            generated_at: Some(now),
            total_points: measurements.iter().map(|m| m.total_points).sum(),
            measurements,
            rollup_points: 0,
        })
    }

    /// 对回溯窗口内已完整结束的时间桶做预聚合
    ///
    /// 结果以 upsert 方式写入 `<measurement>_rollup`，重复执行覆盖同一批点。
    pub async fn rollup(&self, policy: &RollupPolicy, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let end = bucket_start(now, policy.bucket_secs);
        let start = bucket_start(now - policy.lookback, policy.bucket_secs);
        if start >= end {
            return Ok(0);
        }
        let range = TimeRange::new(start, end);

        let mut written = 0u64;
        for data_type in DataType::ALL {
            let measurement = data_type.measurement();
            let rows = self
                .store
                .aggregate(&AggregateQuery {
                    measurement: measurement.to_string(),
                    filter: SeriesFilter::new(),
                    range,
                    interval_secs: policy.bucket_secs,
                    field: fields::VALUE.to_string(),
                })
                .await?;
            if rows.is_empty() {
                continue;
            }

            let target = rollup_measurement(measurement);
            let points: Vec<DataPoint> = rows
                .iter()
                .map(|stats| rollup_point(&target, policy.bucket_secs, stats))
                .collect();
            self.store.write_points(&points).await?;

            debug!(measurement = %target, points = points.len(), "Rollup written");
            written += points.len() as u64;
        }
        Ok(written)
    }
}

fn rollup_point(measurement: &str, bucket_secs: i64, stats: &BucketStats) -> DataPoint {
    let mut point = DataPoint::new(measurement, stats.bucket)
        .with_tag("interval", format!("{}s", bucket_secs))
        .with_field("count", stats.count as f64)
        .with_field("sum", stats.sum)
        .with_field("min", stats.min)
        .with_field("max", stats.max);
    if let Some(mean) = stats.mean() {
        point = point.with_field("mean", mean);
    }
    point.tags.extend(stats.series.clone());
    point
}
