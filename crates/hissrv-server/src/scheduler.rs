use crate::health::HealthMonitor;
use chrono::{DateTime, Utc};
use hissrv_collector::Collector;
use hissrv_config::{next_cron_tick, normalize_cron, SchedulerConfig};
use hissrv_timeseries::{CleanupManager, CleanupPolicy, RollupPolicy, StatisticsManager, StatisticsReport};
use hissrv_types::{CycleOutcome, HealthState};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

/// 保留的最近失败记录条数
pub const MAX_RECENT_ERRORS: usize = 10;

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    DataCollection,
    DataCleanup,
    Statistics,
    HealthCheck,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::DataCollection,
        JobKind::DataCleanup,
        JobKind::Statistics,
        JobKind::HealthCheck,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::DataCollection => "data_collection",
            JobKind::DataCleanup => "data_cleanup",
            JobKind::Statistics => "statistics",
            JobKind::HealthCheck => "health_check",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| SchedulerError::UnknownJob(s.to_string()))
    }
}

/// 调度方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSchedule {
    /// 固定间隔
    Interval(Duration),
    /// Cron 表达式（五段或六段）
    Cron(String),
}

impl JobSchedule {
    /// 下一次计划运行时间；间隔任务以调度器启动时刻为基准
    fn next_run(&self, started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobSchedule::Cron(expr) => next_cron_tick(expr, now),
            JobSchedule::Interval(every) => {
                let anchor = started_at?;
                let every = chrono::Duration::from_std(*every).ok()?;
                let every_ms = every.num_milliseconds().max(1);
                let elapsed_ms = (now - anchor).num_milliseconds().max(0);
                let ticks = elapsed_ms / every_ms + 1;
                Some(anchor + chrono::Duration::milliseconds(ticks * every_ms))
            }
        }
    }
}

impl fmt::Display for JobSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobSchedule::Interval(every) => write!(f, "every {}s", every.as_secs()),
            JobSchedule::Cron(expr) => write!(f, "cron {}", expr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// 单次运行的结果
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub job: JobKind,
    pub trigger: JobTrigger,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: JobRunStatus,
    pub message: String,
}

/// 任务状态
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub enabled: bool,
    pub schedule: String,
    pub running: bool,
    pub run_count: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<JobRun>,
    pub next_run: Option<DateTime<Utc>>,
}

/// 失败记录
#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
    pub at: DateTime<Utc>,
    pub job: JobKind,
    pub message: String,
}

/// 调度器整体状态
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub started: bool,
    pub jobs: Vec<JobStatus>,
    pub recent_errors: Vec<JobFailure>,
    /// 最近一次统计任务产出的存储概况
    pub storage: Option<StatisticsReport>,
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job {0} is already running")]
    AlreadyRunning(String),

    #[error("job {0} was interrupted: {1}")]
    Interrupted(String, String),
}

/// 任务执行所需的组件
pub struct JobContext {
    pub collector: Arc<Collector>,
    pub cleanup: CleanupManager,
    pub cleanup_policies: Vec<CleanupPolicy>,
    pub statistics: StatisticsManager,
    pub rollup: Option<RollupPolicy>,
    pub health: Arc<HealthMonitor>,
}

enum Completion {
    Done(String),
    Skipped(String),
}

struct JobEntry {
    enabled: bool,
    schedule: JobSchedule,
    running: bool,
    run_count: u64,
    last_run: Option<DateTime<Utc>>,
    last_result: Option<JobRun>,
}

struct Registry {
    context: JobContext,
    jobs: RwLock<BTreeMap<JobKind, JobEntry>>,
    errors: RwLock<VecDeque<JobFailure>>,
    storage: RwLock<Option<StatisticsReport>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

/// 任务调度器
///
/// 进程内唯一的任务注册表：记录每个任务的运行状态、最近结果和最近失败，
/// 定时触发和手动触发走同一条执行路径。同一任务不会重叠运行，
/// 上一次尚未结束时新的触发直接跳过。
pub struct Scheduler {
    registry: Arc<Registry>,
    cron: Mutex<Option<JobScheduler>>,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig, context: JobContext) -> Self {
        let mut jobs = BTreeMap::new();
        let entry = |enabled, schedule| JobEntry {
            enabled,
            schedule,
            running: false,
            run_count: 0,
            last_run: None,
            last_result: None,
        };
        jobs.insert(
            JobKind::DataCollection,
            entry(
                config.data_collection.enabled,
                JobSchedule::Interval(Duration::from_secs(config.data_collection.interval_secs)),
            ),
        );
        jobs.insert(
            JobKind::DataCleanup,
            entry(
                config.data_cleanup.enabled,
                JobSchedule::Cron(config.data_cleanup.cron.clone()),
            ),
        );
        jobs.insert(
            JobKind::Statistics,
            entry(
                config.statistics.enabled,
                JobSchedule::Cron(config.statistics.cron.clone()),
            ),
        );
        jobs.insert(
            JobKind::HealthCheck,
            entry(
                config.health_check.enabled,
                JobSchedule::Interval(Duration::from_secs(config.health_check.interval_secs)),
            ),
        );

        Self {
            registry: Arc::new(Registry {
                context,
                jobs: RwLock::new(jobs),
                errors: RwLock::new(VecDeque::with_capacity(MAX_RECENT_ERRORS)),
                storage: RwLock::new(None),
                started_at: RwLock::new(None),
            }),
            cron: Mutex::new(None),
        }
    }

    /// 启动调度器，注册所有启用的任务
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut guard = self.cron.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let scheduler = JobScheduler::new().await?;
        let schedules: Vec<(JobKind, bool, JobSchedule)> = self
            .registry
            .jobs
            .read()
            .await
            .iter()
            .map(|(kind, entry)| (*kind, entry.enabled, entry.schedule.clone()))
            .collect();

        for (kind, enabled, schedule) in schedules {
            if !enabled {
                info!(job = %kind, "Job is disabled, skipping");
                continue;
            }

            let registry = self.registry.clone();
            let job = match &schedule {
                JobSchedule::Interval(every) => Job::new_repeated_async(*every, move |_uuid, _l| {
                    let registry = registry.clone();
                    Box::pin(async move {
                        registry.run_scheduled(kind).await;
                    })
                })?,
                JobSchedule::Cron(expr) => {
                    Job::new_async(normalize_cron(expr).as_str(), move |_uuid, _l| {
                        let registry = registry.clone();
                        Box::pin(async move {
                            registry.run_scheduled(kind).await;
                        })
                    })?
                }
            };

            let job_id = scheduler.add(job).await?;
            info!(job = %kind, schedule = %schedule, job_id = %job_id, "Job scheduled");
        }

        scheduler.start().await?;
        *self.registry.started_at.write().await = Some(Utc::now());
        *guard = Some(scheduler);
        info!("Scheduler started");
        Ok(())
    }

    /// 停止调度器；正在执行的任务不会被中断
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(mut scheduler) = self.cron.lock().await.take() {
            scheduler.shutdown().await?;
            *self.registry.started_at.write().await = None;
            info!("Scheduler stopped");
        }
        Ok(())
    }

    /// 手动触发任务，不影响其定时计划
    pub async fn trigger(&self, job: &str) -> Result<JobRun, SchedulerError> {
        let kind: JobKind = job.parse()?;
        info!(job = %kind, "Job triggered manually");
        self.registry.clone().run(kind, JobTrigger::Manual).await
    }

    /// 最近一次统计任务产出的存储概况
    pub async fn storage_report(&self) -> Option<StatisticsReport> {
        self.registry.storage.read().await.clone()
    }

    /// 所有任务的状态
    pub async fn status(&self) -> SchedulerStatus {
        let now = Utc::now();
        let started_at = *self.registry.started_at.read().await;
        let jobs = self
            .registry
            .jobs
            .read()
            .await
            .iter()
            .map(|(kind, entry)| JobStatus {
                name: kind.name().to_string(),
                enabled: entry.enabled,
                schedule: entry.schedule.to_string(),
                running: entry.running,
                run_count: entry.run_count,
                last_run: entry.last_run,
                last_result: entry.last_result.clone(),
                next_run: if entry.enabled && started_at.is_some() {
                    entry.schedule.next_run(started_at, now)
                } else {
                    None
                },
            })
            .collect();

        SchedulerStatus {
            started: started_at.is_some(),
            jobs,
            recent_errors: self.registry.errors.read().await.iter().cloned().collect(),
            storage: self.registry.storage.read().await.clone(),
        }
    }
}

impl Registry {
    async fn run_scheduled(self: Arc<Self>, kind: JobKind) {
        match self.run(kind, JobTrigger::Scheduled).await {
            Ok(_) => {}
            Err(SchedulerError::AlreadyRunning(_)) => {
                debug!(job = %kind, "Previous run still in progress, skipping tick");
            }
            Err(err) => warn!(job = %kind, error = %err, "Scheduled run rejected"),
        }
    }

    /// 占用任务并在独立的 tokio 任务中执行
    ///
    /// 调用方被取消（例如 HTTP 客户端断开）时执行照常完成，`running` 标记照常释放。
    async fn run(self: Arc<Self>, kind: JobKind, trigger: JobTrigger) -> Result<JobRun, SchedulerError> {
        {
            let mut jobs = self.jobs.write().await;
            let entry = jobs
                .get_mut(&kind)
                .ok_or_else(|| SchedulerError::UnknownJob(kind.name().to_string()))?;
            if entry.running {
                return Err(SchedulerError::AlreadyRunning(kind.name().to_string()));
            }
            entry.running = true;
        }

        let registry = self.clone();
        match tokio::spawn(registry.execute_and_record(kind, trigger)).await {
            Ok(run) => Ok(run),
            Err(err) => {
                // 只在运行时关闭时出现
                if let Some(entry) = self.jobs.write().await.get_mut(&kind) {
                    entry.running = false;
                }
                Err(SchedulerError::Interrupted(kind.name().to_string(), err.to_string()))
            }
        }
    }

    async fn execute_and_record(self: Arc<Self>, kind: JobKind, trigger: JobTrigger) -> JobRun {
        let started_at = Utc::now();
        let timer = Instant::now();
        let registry = self.clone();
        let (status, message) = match tokio::spawn(async move { registry.execute(kind).await }).await {
            Ok(Ok(Completion::Done(message))) => (JobRunStatus::Succeeded, message),
            Ok(Ok(Completion::Skipped(message))) => (JobRunStatus::Skipped, message),
            Ok(Err(err)) => (JobRunStatus::Failed, format!("{:#}", err)),
            Err(err) => (JobRunStatus::Failed, format!("job task aborted: {}", err)),
        };
        let run = JobRun {
            job: kind,
            trigger,
            started_at,
            duration_ms: timer.elapsed().as_millis() as u64,
            status,
            message,
        };

        match run.status {
            JobRunStatus::Succeeded => {
                info!(job = %kind, duration_ms = run.duration_ms, result = %run.message, "Job completed")
            }
            JobRunStatus::Skipped => info!(job = %kind, reason = %run.message, "Job skipped"),
            JobRunStatus::Failed => {
                error!(job = %kind, error = %run.message, "Job failed");
                let mut errors = self.errors.write().await;
                if errors.len() >= MAX_RECENT_ERRORS {
                    errors.pop_front();
                }
                errors.push_back(JobFailure {
                    at: started_at,
                    job: kind,
                    message: run.message.clone(),
                });
            }
        }

        let mut jobs = self.jobs.write().await;
        if let Some(entry) = jobs.get_mut(&kind) {
            entry.running = false;
            entry.run_count += 1;
            entry.last_run = Some(started_at);
            entry.last_result = Some(run.clone());
        }
        run
    }

    async fn execute(&self, kind: JobKind) -> anyhow::Result<Completion> {
        let context = &self.context;
        match kind {
            JobKind::DataCollection => {
                let store_health = context.collector.writer().health();
                if let Some(reason) = store_health.fatal_error() {
                    return Ok(Completion::Skipped(format!(
                        "time-series store has a fatal write error: {}",
                        reason
                    )));
                }

                let results = context.collector.collect_all().await;
                let written: u64 = results.iter().map(|r| r.points_written).sum();
                let dropped: u64 = results.iter().map(|r| r.total_dropped()).sum();
                let failures: Vec<String> = results
                    .iter()
                    .filter_map(|r| match &r.outcome {
                        CycleOutcome::Succeeded => None,
                        CycleOutcome::Failed { reason } => Some(format!("{}: {}", r.group, reason)),
                        CycleOutcome::TimedOut => Some(format!("{}: cycle timed out", r.group)),
                    })
                    .collect();

                if failures.is_empty() {
                    Ok(Completion::Done(format!(
                        "{} groups collected, {} points written, {} dropped",
                        results.len(),
                        written,
                        dropped
                    )))
                } else {
                    anyhow::bail!(
                        "{} of {} groups failed: {}",
                        failures.len(),
                        results.len(),
                        failures.join("; ")
                    )
                }
            }
            JobKind::DataCleanup => {
                let stats = context.cleanup.cleanup_all(&context.cleanup_policies).await?;
                let deleted: u64 = stats.iter().map(|s| s.deleted_points).sum();
                Ok(Completion::Done(format!(
                    "{} measurements cleaned, {} points deleted",
                    stats.len(),
                    deleted
                )))
            }
            JobKind::Statistics => {
                let report = context.statistics.run(context.rollup.as_ref(), Utc::now()).await?;
                let message = format!(
                    "{} points across {} measurements, {} rollup points written",
                    report.total_points,
                    report.measurements.len(),
                    report.rollup_points
                );
                *self.storage.write().await = Some(report);
                Ok(Completion::Done(message))
            }
            JobKind::HealthCheck => {
                let health = context.health.check().await;
                let problems: Vec<String> = health
                    .components
                    .iter()
                    .filter(|(_, c)| !c.healthy)
                    .map(|(name, c)| format!("{}: {}", name, c.message.as_deref().unwrap_or("down")))
                    .collect();
                match health.status {
                    HealthState::Healthy => Ok(Completion::Done("healthy".to_string())),
                    HealthState::Degraded => {
                        Ok(Completion::Done(format!("degraded ({})", problems.join("; "))))
                    }
                    HealthState::Unhealthy => anyhow::bail!("unhealthy ({})", problems.join("; ")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hissrv_collector::MemorySource;
    use hissrv_config::{CleanupJobConfig, CollectionConfig, PatternGroupConfig};
    use hissrv_timeseries::{MemoryStore, StoreError, StoreHealth, Writer};

    struct Fixture {
        source: Arc<MemorySource>,
        store: Arc<MemoryStore>,
        health: Arc<StoreHealth>,
        scheduler: Arc<Scheduler>,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(MemorySource::new());
        let store = Arc::new(MemoryStore::new());
        let health = Arc::new(StoreHealth::new());
        let writer = Writer::new(store.clone(), health.clone(), 0, Duration::from_millis(1));
        let config = CollectionConfig {
            groups: vec![PatternGroupConfig::new("telemetry", "comsrv:*:T")],
            ..CollectionConfig::default()
        };
        let collector = Arc::new(Collector::new(&config, 100, source.clone(), writer).unwrap());
        let monitor = Arc::new(HealthMonitor::new(
            source.clone(),
            store.clone(),
            health.clone(),
            Duration::from_secs(1),
        ));
        let context = JobContext {
            collector,
            cleanup: CleanupManager::new(store.clone()),
            cleanup_policies: CleanupPolicy::for_all(30),
            statistics: StatisticsManager::new(store.clone()),
            rollup: None,
            health: monitor,
        };
        let scheduler_config = SchedulerConfig {
            data_cleanup: CleanupJobConfig {
                enabled: false,
                ..CleanupJobConfig::default()
            },
            ..SchedulerConfig::default()
        };
        Fixture {
            source,
            store,
            health,
            scheduler: Arc::new(Scheduler::new(&scheduler_config, context)),
        }
    }

    #[test]
    fn test_job_names() {
        for kind in JobKind::ALL {
            assert_eq!(kind.name().parse::<JobKind>().unwrap(), kind);
        }
        assert!(matches!(
            "vacuum".parse::<JobKind>(),
            Err(SchedulerError::UnknownJob(_))
        ));
    }

    #[test]
    fn test_interval_next_run() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let schedule = JobSchedule::Interval(Duration::from_secs(5));
        assert_eq!(schedule.next_run(None, start), None);
        assert_eq!(
            schedule.next_run(Some(start), start + chrono::Duration::seconds(12)),
            Some(start + chrono::Duration::seconds(15))
        );
        assert_eq!(
            JobSchedule::Cron("0 2 * * *".into()).next_run(None, start),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_manual_trigger_updates_status() {
        let fx = fixture();
        fx.source.insert_hash("comsrv:1:T", [("1", "1.5")]).await;

        let run = fx.scheduler.trigger("data_collection").await.unwrap();
        assert_eq!(run.status, JobRunStatus::Succeeded);
        assert_eq!(run.trigger, JobTrigger::Manual);
        assert_eq!(fx.store.len().await, 1);

        let run = fx.scheduler.trigger("statistics").await.unwrap();
        assert_eq!(run.status, JobRunStatus::Succeeded);

        let status = fx.scheduler.status().await;
        assert!(!status.started);
        let collection = status
            .jobs
            .iter()
            .find(|j| j.name == "data_collection")
            .unwrap();
        assert_eq!(collection.run_count, 1);
        assert!(collection.last_run.is_some());
        assert!(collection.next_run.is_none());
        assert_eq!(status.storage.map(|s| s.total_points), Some(1));
    }

    #[tokio::test]
    async fn test_collection_skipped_while_store_fatal() {
        let fx = fixture();
        fx.health.mark_fatal("unauthorized");

        let run = fx.scheduler.trigger("data_collection").await.unwrap();
        assert_eq!(run.status, JobRunStatus::Skipped);
        assert_eq!(fx.store.write_calls(), 0);

        // 健康检查解除标记后恢复采集
        fx.scheduler.trigger("health_check").await.unwrap();
        let run = fx.scheduler.trigger("data_collection").await.unwrap();
        assert_eq!(run.status, JobRunStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_run_rejected() {
        let fx = fixture();
        fx.source.insert_hash("comsrv:1:T", [("1", "1.5")]).await;
        fx.source.set_read_delay(Some(Duration::from_secs(3))).await;

        let scheduler = fx.scheduler.clone();
        let first = tokio::spawn(async move { scheduler.trigger("data_collection").await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            fx.scheduler.trigger("data_collection").await,
            Err(SchedulerError::AlreadyRunning(_))
        ));
        let status = fx.scheduler.status().await;
        assert!(status.jobs.iter().any(|j| j.name == "data_collection" && j.running));

        assert_eq!(first.await.unwrap().unwrap().status, JobRunStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trigger_releases_job() {
        let fx = fixture();
        fx.source.insert_hash("comsrv:1:T", [("1", "1.5")]).await;
        fx.source.set_read_delay(Some(Duration::from_secs(3))).await;

        let scheduler = fx.scheduler.clone();
        let caller = tokio::spawn(async move { scheduler.trigger("data_collection").await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        // 被放弃的触发仍在后台跑完
        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = fx.scheduler.status().await;
        let collection = status
            .jobs
            .iter()
            .find(|j| j.name == "data_collection")
            .unwrap();
        assert!(!collection.running);
        assert_eq!(collection.run_count, 1);
        assert_eq!(fx.store.len().await, 1);

        fx.source.set_read_delay(None).await;
        let run = fx.scheduler.trigger("data_collection").await.unwrap();
        assert_eq!(run.status, JobRunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_error_ring_keeps_latest_failures() {
        let fx = fixture();
        fx.store
            .set_unreachable(Some(StoreError::Unavailable("refused".into())))
            .await;

        for _ in 0..(MAX_RECENT_ERRORS + 2) {
            let run = fx.scheduler.trigger("health_check").await.unwrap();
            assert_eq!(run.status, JobRunStatus::Failed);
        }

        let status = fx.scheduler.status().await;
        assert_eq!(status.recent_errors.len(), MAX_RECENT_ERRORS);
        assert!(status.recent_errors.iter().all(|e| e.job == JobKind::HealthCheck));
        assert!(status.recent_errors[0].message.contains("refused"));
    }
}
