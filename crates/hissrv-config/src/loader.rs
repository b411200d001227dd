use config::{Config, Environment, File, FileFormat};
use hissrv_types::KeyPattern;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::schedule::parse_cron;
use crate::AppConfig;

/// 环境变量前缀，例如 `HISSRV__INFLUXDB__TOKEN`
const ENV_PREFIX: &str = "HISSRV";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// 配置加载器
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// 加载配置：文件（可缺省）叠加环境变量，随后校验
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let path = self
            .path
            .to_str()
            .ok_or_else(|| ConfigError::Invalid(format!("invalid config path: {:?}", self.path)))?;

        let config = Config::builder()
            .add_source(File::new(path, FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app: AppConfig = config.try_deserialize()?;
        Self::validate(&app)?;
        Ok(app)
    }

    /// 校验配置的取值约束
    pub fn validate(config: &AppConfig) -> Result<(), ConfigError> {
        let collection = &config.collection;

        if collection.batch_size == 0 {
            return Err(invalid("collection.batch_size must be greater than 0"));
        }
        if collection.max_buffer_factor == 0 {
            return Err(invalid("collection.max_buffer_factor must be at least 1"));
        }
        if collection.flush_interval_secs == 0 || collection.cycle_budget_secs == 0 {
            return Err(invalid(
                "collection.flush_interval_secs and cycle_budget_secs must be greater than 0",
            ));
        }
        if collection.groups.is_empty() {
            return Err(invalid("collection.groups must not be empty"));
        }

        let mut names = HashSet::new();
        for group in &collection.groups {
            if !names.insert(group.name.as_str()) {
                return Err(invalid(format!("duplicate collection group: {}", group.name)));
            }
            KeyPattern::parse(&group.pattern)
                .map_err(|e| invalid(format!("group {}: {}", group.name, e)))?;
        }
        for pattern in &collection.exclude_patterns {
            KeyPattern::parse(pattern).map_err(|e| invalid(e.to_string()))?;
        }

        let scheduler = &config.scheduler;
        if scheduler.data_collection.interval_secs == 0 || scheduler.health_check.interval_secs == 0 {
            return Err(invalid("scheduler intervals must be greater than 0"));
        }
        for (job, expr) in [
            ("data_cleanup", &scheduler.data_cleanup.cron),
            ("statistics", &scheduler.statistics.cron),
        ] {
            parse_cron(expr)
                .map_err(|e| invalid(format!("scheduler.{}.cron {:?}: {}", job, expr, e)))?;
        }
        if scheduler.statistics.rollup.bucket_secs == 0 {
            return Err(invalid("scheduler.statistics.rollup.bucket_secs must be greater than 0"));
        }

        let query = &config.query;
        if query.max_page_size == 0 || query.default_page_size > query.max_page_size {
            return Err(invalid(format!(
                "query.default_page_size ({}) must not exceed max_page_size ({})",
                query.default_page_size, query.max_page_size
            )));
        }
        if query.max_span_days == 0 {
            return Err(invalid("query.max_span_days must be greater than 0"));
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PatternGroupConfig;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = tempdir().unwrap();
        let loader = ConfigLoader::new(temp_dir.path().join("hissrv.toml"));

        let config = loader.load().unwrap();
        assert_eq!(config.server.port, 6004);
        assert_eq!(config.scheduler.data_collection.interval_secs, 5);
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("hissrv.toml");
        fs::write(
            &path,
            r#"
[influxdb]
url = "http://influx:8181"
database = "history"

[collection]
batch_size = 200
exclude_patterns = ["*:debug:*"]

[[collection.groups]]
name = "telemetry"
pattern = "comsrv:*:T"

[scheduler.data_cleanup]
cron = "0 0 3 * * *"
retention_days = 7
"#,
        )
        .unwrap();

        let config = ConfigLoader::new(&path).load().unwrap();
        assert_eq!(config.influxdb.database, "history");
        assert_eq!(config.collection.batch_size, 200);
        assert_eq!(
            config.collection.groups,
            vec![PatternGroupConfig::new("telemetry", "comsrv:*:T")]
        );
        assert_eq!(config.scheduler.data_cleanup.retention_days, 7);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.collection.batch_size = 0;
        assert!(ConfigLoader::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.collection.groups.push(PatternGroupConfig::new("comsrv_telemetry", "x:*"));
        assert!(ConfigLoader::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.scheduler.statistics.cron = "every day".to_string();
        assert!(ConfigLoader::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.query.default_page_size = 5000;
        assert!(ConfigLoader::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.collection.exclude_patterns.push("comsrv:[T".to_string());
        assert!(ConfigLoader::validate(&config).is_err());

        assert!(ConfigLoader::validate(&AppConfig::default()).is_ok());
    }
}
