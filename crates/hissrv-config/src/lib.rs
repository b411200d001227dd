pub mod app;
pub mod loader;
pub mod schedule;

pub use app::{
    AppConfig, CleanupJobConfig, CollectionConfig, CollectionJobConfig, HealthJobConfig,
    InfluxDbConfig, LogFormat, LoggingConfig, MissingTimestampPolicy, PatternGroupConfig,
    QueryConfig, RedisConfig, RollupConfig, SchedulerConfig, ServerConfig, StatisticsJobConfig,
};
pub use loader::{ConfigError, ConfigLoader};
pub use schedule::{next_cron_tick, normalize_cron, parse_cron};
