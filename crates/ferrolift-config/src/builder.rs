//! Configuration builder for layered configuration loading

use crate::{Config, ConfigError, ConfigResult};
use config::{ConfigBuilder as ConfigBuilderInner, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration builder: defaults, then files, then environment variables
#[derive(Debug)]
pub struct ConfigBuilder {
    inner: ConfigBuilderInner<config::builder::DefaultState>,
    sources: Vec<ConfigSource>,
    env_separator: String,
}

#[derive(Debug, Clone)]
enum ConfigSource {
    File { path: PathBuf, format: FileFormat },
    Defaults,
    Environment { prefix: String },
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            inner: config::Config::builder(),
            sources: Vec::new(),
            env_separator: "__".to_string(),
        }
    }

    /// Add default configuration values
    pub fn add_defaults(mut self) -> Self {
        self.sources.push(ConfigSource::Defaults);
        self
    }

    /// Add a configuration file source; missing files are skipped
    pub fn add_source_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let format = Self::detect_format(&path);
        self.sources.push(ConfigSource::File { path, format });
        self
    }

    /// Add environment variable source with prefix
    pub fn add_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.sources.push(ConfigSource::Environment {
            prefix: prefix.into(),
        });
        self
    }

    /// Set environment variable separator (default: "__")
    pub fn env_separator<S: Into<String>>(mut self, separator: S) -> Self {
        self.env_separator = separator.into();
        self
    }

    /// Build and validate the configuration
    pub fn build(mut self) -> ConfigResult<Config> {
        // Defaults are always the base layer
        let defaults_value = serde_yaml::to_value(Config::default())
            .map_err(|e| ConfigError::other(format!("Failed to serialize defaults: {}", e)))?;
        self.inner = self
            .inner
            .add_source(config::Config::try_from(&defaults_value)?);

        for source in &self.sources {
            match source {
                ConfigSource::File { path, format } => {
                    if path.exists() {
                        self.inner = self
                            .inner
                            .add_source(File::from(path.clone()).format(*format));
                    }
                }
                ConfigSource::Environment { prefix } => {
                    self.inner = self.inner.add_source(
                        Environment::with_prefix(prefix)
                            .separator(&self.env_separator)
                            .try_parsing(true),
                    );
                }
                ConfigSource::Defaults => {}
            }
        }

        let config = self.inner.build()?;
        let result: Config = config.try_deserialize()?;

        Self::validate(&result)?;

        Ok(result)
    }

    /// Try to build the configuration, returning defaults on error
    pub fn build_or_default(self) -> Config {
        self.build().unwrap_or_default()
    }

    fn detect_format(path: &Path) -> FileFormat {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("json") => FileFormat::Json,
            _ => FileFormat::Yaml,
        }
    }

    /// Validate the configuration
    pub fn validate(config: &Config) -> ConfigResult<()> {
        let dispatch = &config.dispatch;
        if dispatch.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::validation(
                "Heartbeat timeout must be greater than 0",
            ));
        }
        if dispatch.backlog_threshold == 0 {
            return Err(ConfigError::validation(
                "Backlog threshold must be greater than 0",
            ));
        }
        if dispatch.max_batch_size == 0 || dispatch.max_ready_rows == 0 {
            return Err(ConfigError::validation(
                "Batch size and ready row cutoff must be greater than 0",
            ));
        }
        if dispatch.idle_backoff_base_ms == 0
            || dispatch.idle_backoff_base_ms > dispatch.idle_backoff_max_ms
        {
            return Err(ConfigError::validation(
                "Idle backoff base must be positive and not exceed the idle backoff cap",
            ));
        }

        if config.worker.max_concurrent_tasks == 0 {
            return Err(ConfigError::validation(
                "Worker concurrency must be greater than 0",
            ));
        }
        if config.worker.heartbeat_interval_ms >= dispatch.heartbeat_timeout_ms {
            return Err(ConfigError::validation(
                "Heartbeat interval must be shorter than the heartbeat timeout",
            ));
        }

        config.retry.to_retry_config()?;

        if config.progress.window_ms == 0 {
            return Err(ConfigError::validation(
                "Progress window must be greater than 0",
            ));
        }

        if config.staging.max_children_per_parent == 0 {
            return Err(ConfigError::validation(
                "Maximum children per parent must be greater than 0",
            ));
        }

        if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::validation(
                "Log level must be one of: trace, debug, info, warn, error",
            ));
        }

        Ok(())
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builder_defaults() {
        let config = ConfigBuilder::new().add_defaults().build().unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_builder_yaml_file() {
        let mut temp_file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            temp_file,
            r#"
dispatch:
  backlog_threshold: 8
  heartbeat_timeout_ms: 60000
worker:
  max_concurrent_tasks: 3
logging:
  level: debug
"#
        )
        .unwrap();

        let config = ConfigBuilder::new()
            .add_defaults()
            .add_source_file(temp_file.path())
            .build()
            .unwrap();

        assert_eq!(config.dispatch.backlog_threshold, 8);
        assert_eq!(config.dispatch.heartbeat_timeout_ms, 60_000);
        assert_eq!(config.worker.max_concurrent_tasks, 3);
        assert_eq!(config.logging.level, "debug");
        // Untouched keys keep their defaults
        assert_eq!(config.dispatch.max_batch_size, 100);
    }

    #[test]
    fn test_builder_toml_file() {
        let mut temp_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            temp_file,
            r#"
[retry]
max_retries = 3
initial_delay_ms = 50
"#
        )
        .unwrap();

        let config = ConfigBuilder::new()
            .add_defaults()
            .add_source_file(temp_file.path())
            .build()
            .unwrap();

        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 50);
    }

    #[test]
    fn test_builder_env_override() {
        std::env::set_var("FERROLIFT_BUILDER_TEST__DISPATCH__MAX_BATCH_SIZE", "7");
        let config = ConfigBuilder::new()
            .add_defaults()
            .add_env_prefix("FERROLIFT_BUILDER_TEST")
            .build()
            .unwrap();
        std::env::remove_var("FERROLIFT_BUILDER_TEST__DISPATCH__MAX_BATCH_SIZE");

        assert_eq!(config.dispatch.max_batch_size, 7);
    }

    #[test]
    fn test_builder_validation() {
        let mut temp_file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            temp_file,
            r#"
dispatch:
  backlog_threshold: 0
"#
        )
        .unwrap();

        let result = ConfigBuilder::new()
            .add_defaults()
            .add_source_file(temp_file.path())
            .build();

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Backlog threshold must be greater than 0"));
    }

    #[test]
    fn test_validation_rejects_bad_retry_policy() {
        let mut config = Config::default();
        config.retry.initial_delay_ms = config.retry.max_delay_ms + 1;
        assert!(ConfigBuilder::validate(&config).is_err());
    }
}
