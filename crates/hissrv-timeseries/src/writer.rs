use crate::error::StoreError;
use crate::store::TimeSeriesStore;
use hissrv_config::InfluxDbConfig;
use hissrv_types::DataPoint;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// 退避上限
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// 批量写入错误
#[derive(Error, Debug, Clone)]
pub enum WriteError {
    /// 瞬时错误，重试耗尽后仍失败
    #[error("transient write failure after {attempts} attempts: {source}")]
    Transient { attempts: u32, source: StoreError },

    /// 认证、库不存在等配置类错误，不重试
    #[error("fatal write failure: {0}")]
    Fatal(StoreError),
}

impl WriteError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, WriteError::Fatal(_))
    }
}

/// 存储写入健康标记
///
/// 出现不可重试的写入错误时置位，下一次成功写入后清除。
#[derive(Debug, Default)]
pub struct StoreHealth {
    fatal: RwLock<Option<String>>,
}

impl StoreHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_fatal(&self, reason: impl Into<String>) {
        if let Ok(mut guard) = self.fatal.write() {
            *guard = Some(reason.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.fatal.write() {
            *guard = None;
        }
    }

    /// 最近一次致命写入错误（未恢复时）
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.read().ok().and_then(|guard| guard.clone())
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal_error().is_some()
    }
}

/// 带重试的批量写入器
///
/// 可被多个采集组并发使用；底层连接由存储实现自行复用。
#[derive(Clone)]
pub struct Writer {
    store: Arc<dyn TimeSeriesStore>,
    health: Arc<StoreHealth>,
    max_retries: u32,
    initial_backoff: Duration,
}

impl Writer {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        health: Arc<StoreHealth>,
        max_retries: u32,
        initial_backoff: Duration,
    ) -> Self {
        Self {
            store,
            health,
            max_retries,
            initial_backoff,
        }
    }

    pub fn from_config(
        store: Arc<dyn TimeSeriesStore>,
        health: Arc<StoreHealth>,
        config: &InfluxDbConfig,
    ) -> Self {
        Self::new(store, health, config.write_retries, config.retry_backoff())
    }

    pub fn store(&self) -> &Arc<dyn TimeSeriesStore> {
        &self.store
    }

    pub fn health(&self) -> &Arc<StoreHealth> {
        &self.health
    }

    /// 写入一批数据点
    ///
    /// 瞬时错误按指数退避重试（上限 5 秒），非瞬时错误立即返回并标记存储不健康。
    pub async fn write_batch(&self, points: &[DataPoint]) -> Result<(), WriteError> {
        if points.is_empty() {
            return Ok(());
        }

        let mut backoff = self.initial_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.write_points(points).await {
                Ok(()) => {
                    if self.health.is_fatal() {
                        debug!("Store write recovered, clearing fatal mark");
                        self.health.clear();
                    }
                    return Ok(());
                }
                Err(err) if !err.is_transient() => {
                    error!(error = %err, points = points.len(), "Fatal store write error");
                    self.health.mark_fatal(err.to_string());
                    return Err(WriteError::Fatal(err));
                }
                Err(err) if attempt > self.max_retries => {
                    warn!(
                        error = %err,
                        attempts = attempt,
                        points = points.len(),
                        "Store write retries exhausted"
                    );
                    return Err(WriteError::Transient {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Transient store write error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}
