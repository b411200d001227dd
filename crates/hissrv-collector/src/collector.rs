use crate::batcher::Batcher;
use crate::source::{KeyScan, SourceError, SourceReader};
use crate::transform::{KeyShape, PointTransformer};
use chrono::Utc;
use hissrv_config::{CollectionConfig, PatternGroupConfig};
use hissrv_logging::{LogSampler, SamplingStrategy};
use hissrv_timeseries::{WriteError, Writer};
use hissrv_types::{CollectionCycleResult, CycleOutcome, DropReason, KeyPattern, PatternError, RawRecord};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 每秒最多输出的丢弃告警条数
const DROP_WARNINGS_PER_SEC: u32 = 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    #[error("unknown collection group: {0}")]
    UnknownGroup(String),

    #[error("collection cycle already in progress for group {0}")]
    CycleInProgress(String),

    #[error("invalid pattern for group {group}: {source}")]
    InvalidPattern {
        group: String,
        source: PatternError,
    },

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// 周期内中止的原因
#[derive(Debug)]
enum CycleAbort {
    Source(SourceError),
    Write(WriteError),
}

/// 单个采集组：模式和私有的批处理缓冲区
struct Group {
    name: String,
    pattern: KeyPattern,
    /// 同一组的周期互斥；锁被占用即表示周期进行中
    batcher: Mutex<Batcher>,
}

/// 采集器
///
/// 每个周期：扫描 → 读取 → 转换 → 批量写入。不同组之间互不阻塞，
/// 同一组的周期串行执行，正在执行时再次触发会直接返回 `CycleInProgress`。
pub struct Collector {
    source: Arc<dyn SourceReader>,
    writer: Writer,
    transformer: PointTransformer,
    groups: Vec<Group>,
    excludes: Vec<KeyPattern>,
    scan_count: usize,
    cycle_budget: Duration,
    flush_retries: u32,
    drop_sampler: LogSampler,
    last_results: RwLock<BTreeMap<String, CollectionCycleResult>>,
}

impl Collector {
    pub fn new(
        config: &CollectionConfig,
        scan_count: usize,
        source: Arc<dyn SourceReader>,
        writer: Writer,
    ) -> Result<Self, CollectorError> {
        let groups = config
            .groups
            .iter()
            .map(|group| Self::build_group(group, config))
            .collect::<Result<Vec<_>, _>>()?;
        let excludes = config
            .exclude_patterns
            .iter()
            .map(|p| {
                KeyPattern::parse(p).map_err(|source| CollectorError::InvalidPattern {
                    group: "exclude_patterns".to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            groups = groups.len(),
            excludes = excludes.len(),
            batch_size = config.batch_size,
            "Collector initialized"
        );

        Ok(Self {
            source,
            writer,
            transformer: PointTransformer::new(config),
            groups,
            excludes,
            scan_count: scan_count.max(1),
            cycle_budget: config.cycle_budget(),
            flush_retries: config.flush_retries,
            drop_sampler: LogSampler::new(SamplingStrategy::RateLimit(DROP_WARNINGS_PER_SEC)),
            last_results: RwLock::new(BTreeMap::new()),
        })
    }

    fn build_group(group: &PatternGroupConfig, config: &CollectionConfig) -> Result<Group, CollectorError> {
        let pattern = KeyPattern::parse(&group.pattern).map_err(|source| CollectorError::InvalidPattern {
            group: group.name.clone(),
            source,
        })?;
        Ok(Group {
            name: group.name.clone(),
            pattern,
            batcher: Mutex::new(Batcher::from_config(config)),
        })
    }

    /// 已配置的组名（按配置顺序）
    pub fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }

    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    /// 各组最近一次周期的结果
    pub fn last_results(&self) -> BTreeMap<String, CollectionCycleResult> {
        self.last_results
            .read()
            .map(|results| results.clone())
            .unwrap_or_default()
    }

    /// 数据源中当前可采集的通道（comsrv 通道号与 modsrv 模型名），排序去重
    ///
    /// 扫描全部已配置的组，跳过排除的键和无法识别的键形态。
    pub async fn channel_list(&self) -> Result<Vec<String>, CollectorError> {
        let mut channels = BTreeSet::new();
        for group in &self.groups {
            let keys = KeyScan::new(self.source.as_ref(), group.pattern.as_str(), self.scan_count)
                .collect_keys()
                .await?;
            for key in keys {
                if self.excludes.iter().any(|p| p.matches(&key)) {
                    continue;
                }
                match KeyShape::parse(&key) {
                    Some(KeyShape::Channel { channel_id, .. }) => channels.insert(channel_id),
                    Some(KeyShape::Model { name, .. }) => channels.insert(name),
                    None => false,
                };
            }
        }
        debug!(channels = channels.len(), "Channel list scanned");
        Ok(channels.into_iter().collect())
    }

    /// 执行一个组的采集周期
    pub async fn collect_cycle(&self, group_name: &str) -> Result<CollectionCycleResult, CollectorError> {
        let group = self
            .groups
            .iter()
            .find(|g| g.name == group_name)
            .ok_or_else(|| CollectorError::UnknownGroup(group_name.to_string()))?;
        let mut batcher = group
            .batcher
            .try_lock()
            .map_err(|_| CollectorError::CycleInProgress(group_name.to_string()))?;

        let started = Instant::now();
        let mut result = CollectionCycleResult::new(group_name, Utc::now());

        let run = self.run_cycle(group, &mut batcher, &mut result);
        match tokio::time::timeout(self.cycle_budget, run).await {
            Ok(Ok(())) => {}
            Ok(Err(CycleAbort::Source(err))) => {
                warn!(group = %group_name, error = %err, "Source unavailable, cycle failed");
                result.fail(err.to_string());
            }
            Ok(Err(CycleAbort::Write(err))) => {
                error!(group = %group_name, error = %err, "Write failed, cycle aborted");
                result.fail(err.to_string());
            }
            Err(_) => {
                warn!(
                    group = %group_name,
                    budget_secs = self.cycle_budget.as_secs(),
                    "Collection cycle exceeded its budget"
                );
                result.outcome = CycleOutcome::TimedOut;
            }
        }

        result.record_drop(DropReason::BufferEvicted, batcher.take_evicted());
        result.points_buffered = batcher.len() as u64;
        result.duration_ms = started.elapsed().as_millis() as u64;
        drop(batcher);

        info!(
            group = %group_name,
            scanned = result.records_scanned,
            transformed = result.records_transformed,
            written = result.points_written,
            buffered = result.points_buffered,
            dropped = result.total_dropped(),
            duration_ms = result.duration_ms,
            outcome = ?result.outcome,
            "Collection cycle finished"
        );

        if let Ok(mut results) = self.last_results.write() {
            results.insert(group_name.to_string(), result.clone());
        }
        Ok(result)
    }

    /// 依次执行所有组；某个组失败不影响其它组
    pub async fn collect_all(&self) -> Vec<CollectionCycleResult> {
        let mut results = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            match self.collect_cycle(&group.name).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    debug!(group = %group.name, error = %err, "Skipping group");
                    let mut skipped = CollectionCycleResult::new(group.name.as_str(), Utc::now());
                    skipped.fail(err.to_string());
                    results.push(skipped);
                }
            }
        }
        results
    }

    /// 刷新所有组的缓冲区（停机前调用），返回写入的点数
    pub async fn flush_all(&self) -> usize {
        let mut total = 0;
        for group in &self.groups {
            let mut batcher = group.batcher.lock().await;
            match batcher.flush(&self.writer).await {
                Ok(written) => total += written,
                Err(err) => {
                    error!(
                        group = %group.name,
                        error = %err,
                        lost = batcher.len(),
                        "Final flush failed"
                    );
                }
            }
        }
        total
    }

    async fn run_cycle(
        &self,
        group: &Group,
        batcher: &mut Batcher,
        result: &mut CollectionCycleResult,
    ) -> Result<(), CycleAbort> {
        let cycle_start = result.started_at;
        let mut scan = KeyScan::new(self.source.as_ref(), group.pattern.as_str(), self.scan_count);

        while let Some(keys) = scan.next_page().await.map_err(CycleAbort::Source)? {
            for key in keys {
                if self.excludes.iter().any(|p| p.matches(&key)) {
                    result.keys_excluded += 1;
                    continue;
                }
                result.records_scanned += 1;

                let fields = match self.source.read_hash(&key).await {
                    Ok(Some(fields)) => fields,
                    Ok(None) => {
                        debug!(key = %key, "Key vanished between scan and read");
                        result.record_drop(DropReason::RecordMissing, 1);
                        continue;
                    }
                    Err(SourceError::WrongType(_)) => {
                        result.record_drop(DropReason::WrongType, 1);
                        self.warn_drop(&key, "key is not a hash");
                        continue;
                    }
                    Err(SourceError::Undecodable(_, reason)) => {
                        result.record_drop(DropReason::Undecodable, 1);
                        self.warn_drop(&key, &reason);
                        continue;
                    }
                    Err(err) => return Err(CycleAbort::Source(err)),
                };

                let transformed = self.transformer.transform(&RawRecord::new(key.as_str(), fields), cycle_start);
                for (reason, count) in &transformed.dropped {
                    result.record_drop(*reason, *count);
                    self.warn_drop(&key, &format!("{:?} x{}", reason, count));
                }
                if transformed.used_collection_time {
                    debug!(key = %key, "Record stamped with collection time");
                }
                if transformed.points.is_empty() {
                    continue;
                }
                result.records_transformed += 1;

                for point in transformed.points {
                    batcher.add(point);
                    if batcher.should_flush() {
                        self.flush_in_cycle(group, batcher, result).await?;
                    }
                }
            }
        }

        self.flush_end_of_cycle(group, batcher, result).await
    }

    /// 周期中途的刷新：瞬时失败保留缓冲继续采集，致命错误中止周期
    async fn flush_in_cycle(
        &self,
        group: &Group,
        batcher: &mut Batcher,
        result: &mut CollectionCycleResult,
    ) -> Result<(), CycleAbort> {
        match batcher.flush(&self.writer).await {
            Ok(written) => {
                result.points_written += written as u64;
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(CycleAbort::Write(err)),
            Err(err) => {
                debug!(group = %group.name, error = %err, "Mid-cycle flush deferred");
                Ok(())
            }
        }
    }

    /// 周期末的刷新，失败后立即重试 `flush_retries` 次；仍失败时点留在缓冲区等待下个周期
    async fn flush_end_of_cycle(
        &self,
        group: &Group,
        batcher: &mut Batcher,
        result: &mut CollectionCycleResult,
    ) -> Result<(), CycleAbort> {
        let mut attempt = 0;
        loop {
            match batcher.flush(&self.writer).await {
                Ok(written) => {
                    result.points_written += written as u64;
                    return Ok(());
                }
                Err(err) if err.is_fatal() || attempt >= self.flush_retries => {
                    warn!(
                        group = %group.name,
                        buffered = batcher.len(),
                        "End-of-cycle flush failed, points kept for next cycle"
                    );
                    return Err(CycleAbort::Write(err));
                }
                Err(_) => attempt += 1,
            }
        }
    }

    fn warn_drop(&self, key: &str, reason: &str) {
        if self.drop_sampler.should_sample() {
            let suppressed = self.drop_sampler.take_suppressed();
            warn!(key = %key, reason = %reason, suppressed = suppressed, "Record data dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use hissrv_timeseries::{MemoryStore, StoreError, StoreHealth};

    fn config() -> CollectionConfig {
        CollectionConfig {
            batch_size: 2,
            groups: vec![
                PatternGroupConfig::new("telemetry", "comsrv:*:T"),
                PatternGroupConfig::new("signal", "comsrv:*:S"),
            ],
            exclude_patterns: vec!["comsrv:99*".to_string()],
            ..CollectionConfig::default()
        }
    }

    fn collector(source: Arc<MemorySource>, store: Arc<MemoryStore>) -> Collector {
        let writer = Writer::new(store, Arc::new(StoreHealth::new()), 0, Duration::from_millis(1));
        Collector::new(&config(), 2, source, writer).unwrap()
    }

    #[tokio::test]
    async fn test_cycle_counts() {
        let source = Arc::new(MemorySource::new());
        source
            .insert_hash("comsrv:1001:T", [("1", "25.5"), ("2", "380.2"), ("3", "x")])
            .await;
        source.insert_hash("comsrv:1002:T", [("1", "1.0")]).await;
        source.insert_hash("comsrv:9901:T", [("1", "1.0")]).await;
        source.insert_other("comsrv:1003:T").await;
        source.add_phantom("comsrv:1004:T").await;
        source.set_duplicate_scans(true);
        let store = Arc::new(MemoryStore::new());

        let result = collector(source, store.clone())
            .collect_cycle("telemetry")
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.keys_excluded, 1);
        assert_eq!(result.records_scanned, 4);
        assert_eq!(result.records_transformed, 2);
        assert_eq!(result.points_written, 3);
        assert_eq!(result.points_buffered, 0);
        assert_eq!(result.dropped_count(DropReason::UnparseableValue), 1);
        assert_eq!(result.dropped_count(DropReason::WrongType), 1);
        assert_eq!(result.dropped_count(DropReason::RecordMissing), 1);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_channel_list() {
        let source = Arc::new(MemorySource::new());
        source.insert_hash("comsrv:1002:T", [("1", "1.0")]).await;
        source.insert_hash("comsrv:1001:T", [("1", "1.0")]).await;
        source.insert_hash("comsrv:1001:S", [("1", "0")]).await;
        source.insert_hash("comsrv:9901:T", [("1", "1.0")]).await;
        source.insert_hash("comsrv:1005:C", [("1", "1")]).await;
        let collector = collector(source.clone(), Arc::new(MemoryStore::new()));

        let channels = collector.channel_list().await.unwrap();
        assert_eq!(channels, vec!["1001".to_string(), "1002".to_string()]);

        source.set_unavailable(true);
        assert!(matches!(
            collector.channel_list().await,
            Err(CollectorError::Source(SourceError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_undecodable_record_does_not_fail_group() {
        let source = Arc::new(MemorySource::new());
        source.insert_hash("comsrv:1001:T", [("1", "25.5")]).await;
        source.insert_undecodable("comsrv:1002:T").await;
        source.insert_hash("comsrv:1003:T", [("1", "7.0")]).await;
        let store = Arc::new(MemoryStore::new());

        let result = collector(source, store.clone())
            .collect_cycle("telemetry")
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.records_scanned, 3);
        assert_eq!(result.dropped_count(DropReason::Undecodable), 1);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_source_unavailable_fails_group_only() {
        let source = Arc::new(MemorySource::new());
        source.set_unavailable(true);
        let collector = collector(source.clone(), Arc::new(MemoryStore::new()));

        let results = collector.collect_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| matches!(r.outcome, CycleOutcome::Failed { .. })));

        source.set_unavailable(false);
        let result = collector.collect_cycle("signal").await.unwrap();
        assert!(result.is_success());
        assert_eq!(collector.last_results().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_group() {
        let collector = collector(Arc::new(MemorySource::new()), Arc::new(MemoryStore::new()));
        assert_eq!(
            collector.collect_cycle("nope").await.unwrap_err(),
            CollectorError::UnknownGroup("nope".into())
        );
    }

    #[tokio::test]
    async fn test_transient_write_failure_keeps_points_for_next_cycle() {
        let source = Arc::new(MemorySource::new());
        source.insert_hash("comsrv:1:S", [("1", "1")]).await;
        let store = Arc::new(MemoryStore::new());
        // 周期末刷新一次 + 重试一次
        store
            .fail_next_writes([
                StoreError::Unavailable("down".into()),
                StoreError::Unavailable("down".into()),
            ])
            .await;
        let collector = collector(source.clone(), store.clone());

        let first = collector.collect_cycle("signal").await.unwrap();
        assert!(matches!(first.outcome, CycleOutcome::Failed { .. }));
        assert_eq!(first.points_buffered, 1);
        assert_eq!(store.len().await, 0);

        source.remove("comsrv:1:S").await;
        let second = collector.collect_cycle("signal").await.unwrap();
        assert!(second.is_success());
        assert_eq!(second.points_written, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_fatal_write_aborts_cycle() {
        let source = Arc::new(MemorySource::new());
        for i in 0..4 {
            source.insert_hash(&format!("comsrv:{}:T", i), [("1", "1")]).await;
        }
        let store = Arc::new(MemoryStore::new());
        store
            .fail_next_writes([StoreError::Unauthorized("bad token".into())])
            .await;
        let collector = collector(source, store.clone());

        let result = collector.collect_cycle("telemetry").await.unwrap();
        assert!(matches!(result.outcome, CycleOutcome::Failed { .. }));
        assert!(collector.writer().health().is_fatal());
        assert_eq!(store.write_calls(), 1);
        assert_eq!(result.records_scanned, 2);
    }
}
