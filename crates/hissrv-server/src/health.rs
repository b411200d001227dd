use chrono::Utc;
use hissrv_collector::SourceReader;
use hissrv_timeseries::{StoreHealth, TimeSeriesStore};
use hissrv_types::{ComponentHealth, HealthState, HealthStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const REDIS_COMPONENT: &str = "redis";
pub const INFLUXDB_COMPONENT: &str = "influxdb";

/// 健康监控
///
/// 探测数据源和时序库，并结合写入端的致命错误标记得出总体状态：
/// 数据源不可用为 degraded，时序库不可用或存在致命写入错误为 unhealthy。
pub struct HealthMonitor {
    source: Arc<dyn SourceReader>,
    store: Arc<dyn TimeSeriesStore>,
    store_health: Arc<StoreHealth>,
    probe_timeout: Duration,
    last: RwLock<Option<HealthStatus>>,
}

impl HealthMonitor {
    pub fn new(
        source: Arc<dyn SourceReader>,
        store: Arc<dyn TimeSeriesStore>,
        store_health: Arc<StoreHealth>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            source,
            store,
            store_health,
            probe_timeout,
            last: RwLock::new(None),
        }
    }

    /// 执行一次健康检查
    ///
    /// 时序库可达时解除写入端的致命标记，让下一个采集周期重新尝试写入；
    /// 若问题仍在（例如令牌失效），写入会再次标记。本次结果仍报告该错误。
    pub async fn check(&self) -> HealthStatus {
        let (redis, mut influxdb) = tokio::join!(self.probe_source(), self.probe_store());

        if influxdb.healthy {
            if let Some(reason) = self.store_health.fatal_error() {
                info!(reason = %reason, "Time-series store reachable, clearing fatal write mark");
                self.store_health.clear();
                influxdb = ComponentHealth::down(format!("fatal write error: {}", reason));
            }
        }

        let status = if !influxdb.healthy {
            HealthState::Unhealthy
        } else if !redis.healthy {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        let mut components = BTreeMap::new();
        components.insert(REDIS_COMPONENT.to_string(), redis);
        components.insert(INFLUXDB_COMPONENT.to_string(), influxdb);

        let health = HealthStatus {
            status,
            checked_at: Utc::now(),
            components,
        };

        if !status.is_healthy() {
            warn!(status = ?status, "Health check reported problems");
        }
        *self.last.write().await = Some(health.clone());
        health
    }

    /// 最近一次检查结果
    pub async fn last(&self) -> Option<HealthStatus> {
        self.last.read().await.clone()
    }

    async fn probe_source(&self) -> ComponentHealth {
        let started = Instant::now();
        match tokio::time::timeout(self.probe_timeout, self.source.ping()).await {
            Ok(Ok(())) => ComponentHealth::up(started.elapsed().as_millis() as u64),
            Ok(Err(err)) => ComponentHealth::down(err.to_string()),
            Err(_) => ComponentHealth::down("ping timed out"),
        }
    }

    async fn probe_store(&self) -> ComponentHealth {
        let started = Instant::now();
        match tokio::time::timeout(self.probe_timeout, self.store.ping()).await {
            Ok(Ok(())) => ComponentHealth::up(started.elapsed().as_millis() as u64),
            Ok(Err(err)) => ComponentHealth::down(err.to_string()),
            Err(_) => ComponentHealth::down("ping timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hissrv_collector::MemorySource;
    use hissrv_timeseries::{MemoryStore, StoreError};

    fn monitor(
        source: Arc<MemorySource>,
        store: Arc<MemoryStore>,
        health: Arc<StoreHealth>,
    ) -> HealthMonitor {
        HealthMonitor::new(source, store, health, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_states() {
        let source = Arc::new(MemorySource::new());
        let store = Arc::new(MemoryStore::new());
        let monitor = monitor(source.clone(), store.clone(), Arc::new(StoreHealth::new()));

        assert!(monitor.last().await.is_none());
        assert_eq!(monitor.check().await.status, HealthState::Healthy);

        source.set_unavailable(true);
        let status = monitor.check().await;
        assert_eq!(status.status, HealthState::Degraded);
        assert!(!status.components[REDIS_COMPONENT].healthy);

        store
            .set_unreachable(Some(StoreError::Unavailable("refused".into())))
            .await;
        assert_eq!(monitor.check().await.status, HealthState::Unhealthy);
        assert_eq!(monitor.last().await.map(|h| h.status), Some(HealthState::Unhealthy));
    }

    #[tokio::test]
    async fn test_fatal_mark_reported_then_cleared() {
        let health = Arc::new(StoreHealth::new());
        health.mark_fatal("unauthorized");
        let monitor = monitor(
            Arc::new(MemorySource::new()),
            Arc::new(MemoryStore::new()),
            health.clone(),
        );

        let status = monitor.check().await;
        assert_eq!(status.status, HealthState::Unhealthy);
        assert!(status.components[INFLUXDB_COMPONENT]
            .message
            .as_deref()
            .is_some_and(|m| m.contains("unauthorized")));
        assert!(!health.is_fatal());

        assert_eq!(monitor.check().await.status, HealthState::Healthy);
    }
}
