use crate::health::HealthMonitor;
use crate::scheduler::{JobContext, Scheduler};
use anyhow::Context;
use hissrv_collector::{Collector, RedisSource, SourceReader};
use hissrv_config::AppConfig;
use hissrv_timeseries::{
    CleanupManager, CleanupPolicy, InfluxStore, QueryEngine, RollupPolicy, StatisticsManager,
    StoreHealth, TimeSeriesStore, Writer,
};
use std::sync::Arc;

/// API 应用状态
#[derive(Clone)]
pub struct AppState {
    pub query_engine: Arc<QueryEngine>,
    pub collector: Arc<Collector>,
    pub scheduler: Arc<Scheduler>,
    pub health: Arc<HealthMonitor>,
}

impl AppState {
    /// 按配置连接 Redis 和 InfluxDB 并组装全部组件
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let source: Arc<dyn SourceReader> =
            Arc::new(RedisSource::new(&config.redis).context("failed to configure redis source")?);
        let store: Arc<dyn TimeSeriesStore> = Arc::new(
            InfluxStore::new(&config.influxdb).context("failed to configure influxdb store")?,
        );
        Self::with_components(config, source, store)
    }

    /// 用给定的数据源和时序库组装组件
    pub fn with_components(
        config: &AppConfig,
        source: Arc<dyn SourceReader>,
        store: Arc<dyn TimeSeriesStore>,
    ) -> anyhow::Result<Self> {
        let store_health = Arc::new(StoreHealth::new());
        let writer = Writer::from_config(store.clone(), store_health.clone(), &config.influxdb);
        let collector = Arc::new(
            Collector::new(
                &config.collection,
                config.redis.scan_count,
                source.clone(),
                writer,
            )
            .context("failed to build collector")?,
        );

        let retention_days = config.scheduler.data_cleanup.retention_days;
        let query_engine = Arc::new(QueryEngine::new(
            store.clone(),
            config.query.clone(),
            chrono::Duration::days(retention_days as i64),
        ));

        let health = Arc::new(HealthMonitor::new(
            source,
            store.clone(),
            store_health,
            config.redis.timeout().max(config.influxdb.timeout()),
        ));

        let rollup = &config.scheduler.statistics.rollup;
        let context = JobContext {
            collector: collector.clone(),
            cleanup: CleanupManager::new(store.clone()),
            cleanup_policies: CleanupPolicy::for_all(retention_days),
            statistics: StatisticsManager::new(store),
            rollup: rollup.enabled.then(|| RollupPolicy::from(rollup)),
            health: health.clone(),
        };
        let scheduler = Arc::new(Scheduler::new(&config.scheduler, context));

        Ok(Self {
            query_engine,
            collector,
            scheduler,
            health,
        })
    }
}
