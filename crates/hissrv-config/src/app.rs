use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 全局配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub influxdb: InfluxDbConfig,
    pub collection: CollectionConfig,
    pub scheduler: SchedulerConfig,
    pub query: QueryConfig,
    pub logging: LoggingConfig,
}

/// HTTP 服务配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6004,
            api_prefix: "/hisApi".to_string(),
        }
    }
}

/// Redis 数据源配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// SCAN COUNT 提示值
    pub scan_count: usize,
    pub timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            scan_count: 500,
            timeout_secs: 5,
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// InfluxDB 配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InfluxDbConfig {
    pub url: String,
    pub token: String,
    pub database: String,
    pub timeout_secs: u64,
    /// 瞬时错误的最大重试次数（不含首次）
    pub write_retries: u32,
    /// 首次重试前的等待时间，之后每次翻倍
    pub retry_backoff_ms: u64,
}

impl Default for InfluxDbConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8181".to_string(),
            token: String::new(),
            database: "hissrv".to_string(),
            timeout_secs: 30,
            write_retries: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl InfluxDbConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// 缺少时间戳字段时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingTimestampPolicy {
    /// 使用采集周期开始时间，并打上 `ts_source=collector` 标签
    #[default]
    CollectionTime,
    /// 丢弃整条记录并计数
    Drop,
}

/// 订阅的键模式分组
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PatternGroupConfig {
    pub name: String,
    pub pattern: String,
}

impl PatternGroupConfig {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
        }
    }
}

/// 数据采集配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    /// 缓冲区硬上限 = batch_size * max_buffer_factor
    pub max_buffer_factor: usize,
    /// 单个周期的软超时
    pub cycle_budget_secs: u64,
    /// 周期末刷新失败后的立即重试次数
    pub flush_retries: u32,
    /// 源时间戳早于周期开始多少秒即记 `stale` 字段为 1
    pub stale_after_secs: u64,
    pub timestamp_fields: Vec<String>,
    pub missing_timestamp: MissingTimestampPolicy,
    pub groups: Vec<PatternGroupConfig>,
    pub exclude_patterns: Vec<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval_secs: 10,
            max_buffer_factor: 10,
            cycle_budget_secs: 30,
            flush_retries: 1,
            stale_after_secs: 300,
            timestamp_fields: vec!["_timestamp".to_string(), "__updated".to_string()],
            missing_timestamp: MissingTimestampPolicy::default(),
            groups: default_groups(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl CollectionConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn cycle_budget(&self) -> Duration {
        Duration::from_secs(self.cycle_budget_secs)
    }

    pub fn max_buffered(&self) -> usize {
        self.batch_size.saturating_mul(self.max_buffer_factor)
    }
}

fn default_groups() -> Vec<PatternGroupConfig> {
    vec![
        PatternGroupConfig::new("comsrv_telemetry", "comsrv:*:T"),
        PatternGroupConfig::new("comsrv_signal", "comsrv:*:S"),
        PatternGroupConfig::new("comsrv_control", "comsrv:*:C"),
        PatternGroupConfig::new("comsrv_adjustment", "comsrv:*:A"),
        PatternGroupConfig::new("modsrv_measurement", "modsrv:model:*:measurement"),
        PatternGroupConfig::new("modsrv_action", "modsrv:model:*:action"),
    ]
}

/// 定时任务配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub data_collection: CollectionJobConfig,
    pub data_cleanup: CleanupJobConfig,
    pub statistics: StatisticsJobConfig,
    pub health_check: HealthJobConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CollectionJobConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for CollectionJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CleanupJobConfig {
    pub enabled: bool,
    pub cron: String,
    pub retention_days: u32,
}

impl Default for CleanupJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: "0 2 * * *".to_string(),
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatisticsJobConfig {
    pub enabled: bool,
    pub cron: String,
    pub rollup: RollupConfig,
}

impl Default for StatisticsJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: "0 1 * * *".to_string(),
            rollup: RollupConfig::default(),
        }
    }
}

/// 统计任务的预聚合配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RollupConfig {
    pub enabled: bool,
    pub bucket_secs: u64,
    pub lookback_hours: u64,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bucket_secs: 3600,
            lookback_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthJobConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for HealthJobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

/// 查询接口配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub max_span_days: u32,
    pub timeout_ms: u64,
    pub include_empty_buckets: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            max_page_size: 1000,
            max_span_days: 365,
            timeout_ms: 10_000,
            include_empty_buckets: false,
        }
    }
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
