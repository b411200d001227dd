use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 丢弃原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// 字段值无法解析为有限数值
    UnparseableValue,
    /// 键不符合任何已知的键形态
    UnknownKeyShape,
    /// SCAN 返回的键在读取时已不存在
    RecordMissing,
    /// 键不是 Hash 类型
    WrongType,
    /// 键的回复无法解码
    Undecodable,
    /// 缺少时间戳且策略为丢弃
    MissingTimestamp,
    /// 写入端不可用时缓冲区超限被淘汰
    BufferEvicted,
}

/// 采集周期结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    Succeeded,
    Failed { reason: String },
    TimedOut,
}

/// 一次采集周期的统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionCycleResult {
    pub group: String,
    pub started_at: DateTime<Utc>,
    pub records_scanned: u64,
    pub records_transformed: u64,
    pub keys_excluded: u64,
    pub points_written: u64,
    /// 周期结束时仍留在缓冲区中的点数
    pub points_buffered: u64,
    pub dropped: BTreeMap<DropReason, u64>,
    pub duration_ms: u64,
    pub outcome: CycleOutcome,
}

impl CollectionCycleResult {
    pub fn new(group: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            group: group.into(),
            started_at,
            records_scanned: 0,
            records_transformed: 0,
            keys_excluded: 0,
            points_written: 0,
            points_buffered: 0,
            dropped: BTreeMap::new(),
            duration_ms: 0,
            outcome: CycleOutcome::Succeeded,
        }
    }

    pub fn record_drop(&mut self, reason: DropReason, count: u64) {
        if count > 0 {
            *self.dropped.entry(reason).or_insert(0) += count;
        }
    }

    pub fn dropped_count(&self, reason: DropReason) -> u64 {
        self.dropped.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.values().sum()
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CycleOutcome::Succeeded
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.outcome = CycleOutcome::Failed {
            reason: reason.into(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_tally() {
        let mut result = CollectionCycleResult::new("telemetry", Utc::now());
        result.record_drop(DropReason::UnparseableValue, 2);
        result.record_drop(DropReason::UnparseableValue, 1);
        result.record_drop(DropReason::RecordMissing, 0);

        assert_eq!(result.dropped_count(DropReason::UnparseableValue), 3);
        assert!(!result.dropped.contains_key(&DropReason::RecordMissing));
        assert_eq!(result.total_dropped(), 3);
        assert!(result.is_success());

        result.fail("redis down");
        assert!(!result.is_success());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(CycleOutcome::Failed {
            reason: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["reason"], "boom");
    }
}
