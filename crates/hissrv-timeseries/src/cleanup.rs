use crate::error::StoreError;
use crate::statistics::rollup_measurement;
use crate::store::TimeSeriesStore;
use chrono::{DateTime, Duration, Utc};
use hissrv_types::DataType;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// 清理策略
#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    /// measurement 名称
    pub measurement: String,

    /// 数据保留时间
    pub retention: Duration,

    /// 是否启用
    pub enabled: bool,
}

impl CleanupPolicy {
    pub fn new(measurement: impl Into<String>, retention: Duration) -> Self {
        Self {
            measurement: measurement.into(),
            retention,
            enabled: true,
        }
    }

    /// 所有数据类型及其预聚合表使用同一保留期
    pub fn for_all(retention_days: u32) -> Vec<Self> {
        let retention = Duration::days(i64::from(retention_days));
        DataType::ALL
            .iter()
            .flat_map(|dt| {
                [
                    Self::new(dt.measurement(), retention),
                    Self::new(rollup_measurement(dt.measurement()), retention),
                ]
            })
            .collect()
    }
}

/// 清理统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupStats {
    pub measurement: String,
    pub deleted_points: u64,
    pub cutoff: DateTime<Utc>,
    pub execution_time_ms: u64,
    pub executed_at: DateTime<Utc>,
}

/// 清理管理器
///
/// 删除早于保留期的数据。重复执行是安全的：第二次运行删除 0 个点。
pub struct CleanupManager {
    store: Arc<dyn TimeSeriesStore>,
}

impl CleanupManager {
    pub fn new(store: Arc<dyn TimeSeriesStore>) -> Self {
        Self { store }
    }

    /// 执行单个清理策略
    pub async fn cleanup(&self, policy: &CleanupPolicy) -> Result<CleanupStats, StoreError> {
        self.cleanup_at(policy, Utc::now()).await
    }

    /// 以给定时刻为基准执行清理
    pub async fn cleanup_at(
        &self,
        policy: &CleanupPolicy,
        now: DateTime<Utc>,
    ) -> Result<CleanupStats, StoreError> {
        let cutoff = now - policy.retention;
        if !policy.enabled {
            warn!(measurement = %policy.measurement, "Cleanup policy is disabled");
            return Ok(CleanupStats {
                measurement: policy.measurement.clone(),
                deleted_points: 0,
                cutoff,
                execution_time_ms: 0,
                executed_at: Utc::now(),
            });
        }

        let start_time = std::time::Instant::now();
        let deleted_points = self.store.delete_before(&policy.measurement, cutoff).await?;

        let stats = CleanupStats {
            measurement: policy.measurement.clone(),
            deleted_points,
            cutoff,
            execution_time_ms: start_time.elapsed().as_millis() as u64,
            executed_at: Utc::now(),
        };

        info!(
            measurement = %policy.measurement,
            deleted_points = deleted_points,
            cutoff = %cutoff,
            "Cleanup completed"
        );

        Ok(stats)
    }

    /// 依次执行全部策略；某个 measurement 失败不影响其余的，最终返回第一个错误
    pub async fn cleanup_all(
        &self,
        policies: &[CleanupPolicy],
    ) -> Result<Vec<CleanupStats>, StoreError> {
        let mut results = Vec::with_capacity(policies.len());
        let mut first_error = None;

        for policy in policies {
            match self.cleanup(policy).await {
                Ok(stats) => results.push(stats),
                Err(err) => {
                    warn!(measurement = %policy.measurement, error = %err, "Cleanup failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }
}
