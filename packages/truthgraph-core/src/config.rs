//! Runtime settings
//!
//! Settings are loaded from a versioned YAML file (`version: 1`), then
//! overridden by `TRUTHGRAPH_*` environment variables, then validated.
//!
//! ```yaml
//! version: 1
//! main:
//!   default_branch: main
//! database:
//!   backend: sqlite
//!   path: /var/lib/truthgraph/graph.db
//!   imposed_query_limit: 1000
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    /// Missing version field in YAML
    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    /// Unsupported version
    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    /// Environment variable holds an unparseable value
    #[error("Invalid value '{value}' for environment variable {var}")]
    InvalidEnv { var: String, value: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Custom error
    #[error("{0}")]
    Custom(String),
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

const SUPPORTED_VERSIONS: &[u32] = &[1];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MainSettings {
    pub default_branch: String,
}

impl Default for MainSettings {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
        }
    }
}

/// Which graph store adapter backs the context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Sqlite,
    Postgres,
}

impl DatabaseBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseBackend::Sqlite => "sqlite",
            DatabaseBackend::Postgres => "postgres",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "sqlite" => Some(DatabaseBackend::Sqlite),
            "postgres" | "postgresql" => Some(DatabaseBackend::Postgres),
            _ => None,
        }
    }
}

/// Exponential backoff applied to transient store errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_backoff_ms`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSettings {
    pub backend: DatabaseBackend,
    /// SQLite file; `None` keeps the graph in memory
    pub path: Option<String>,
    /// PostgreSQL connection URL
    pub url: Option<String>,
    /// Page size used when fetching query results
    pub imposed_query_limit: usize,
    pub retry: RetryPolicy,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Sqlite,
            path: None,
            url: None,
            imposed_query_limit: 1_000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    /// Default `EnvFilter` directive; `RUST_LOG` wins when set
    pub level: String,
    pub ansi: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockSettings {
    pub acquire_timeout_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: 30,
        }
    }
}

impl LockSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Complete runtime settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub main: MainSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
    pub lock: LockSettings,
}

/// YAML schema v1
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFileV1 {
    version: Option<u32>,
    #[serde(default)]
    main: MainSettings,
    #[serde(default)]
    database: DatabaseSettings,
    #[serde(default)]
    logging: LoggingSettings,
    #[serde(default)]
    lock: LockSettings,
}

impl Settings {
    /// Load from a YAML file, apply environment overrides and validate
    pub fn from_yaml(path: &str) -> ConfigResult<Settings> {
        let content = std::fs::read_to_string(path)?;
        let mut settings = Self::from_yaml_str(&content)?;
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse YAML text without consulting the environment
    pub fn from_yaml_str(content: &str) -> ConfigResult<Settings> {
        let file: SettingsFileV1 = serde_yaml::from_str(content)?;

        let version = file.version.ok_or(ConfigError::MissingVersion)?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        Ok(Settings {
            main: file.main,
            database: file.database,
            logging: file.logging,
            lock: file.lock,
        })
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> ConfigResult<Settings> {
        let mut settings = Settings::default();
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(branch) = lookup("TRUTHGRAPH_DEFAULT_BRANCH") {
            self.main.default_branch = branch;
        }
        if let Some(raw) = lookup("TRUTHGRAPH_DB_BACKEND") {
            self.database.backend =
                DatabaseBackend::parse(&raw).ok_or_else(|| ConfigError::InvalidEnv {
                    var: "TRUTHGRAPH_DB_BACKEND".to_string(),
                    value: raw.clone(),
                })?;
        }
        if let Some(path) = lookup("TRUTHGRAPH_DB_PATH") {
            self.database.path = Some(path);
        }
        if let Some(url) = lookup("TRUTHGRAPH_DB_URL") {
            self.database.url = Some(url);
        }
        if let Some(raw) = lookup("TRUTHGRAPH_IMPOSED_QUERY_LIMIT") {
            self.database.imposed_query_limit =
                raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    var: "TRUTHGRAPH_IMPOSED_QUERY_LIMIT".to_string(),
                    value: raw.clone(),
                })?;
        }
        if let Some(level) = lookup("TRUTHGRAPH_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.main.default_branch.trim().is_empty() {
            return Err(ConfigError::Custom(
                "main.default_branch must not be empty".to_string(),
            ));
        }

        let limit = self.database.imposed_query_limit;
        if !(1..=1_000_000).contains(&limit) {
            return Err(ConfigError::Range {
                field: "database.imposed_query_limit".to_string(),
                value: limit.to_string(),
                min: "1".to_string(),
                max: "1000000".to_string(),
                hint: "Use a page size the store can return in one round trip".to_string(),
            });
        }

        let retry = &self.database.retry;
        if retry.max_retries > 10 {
            return Err(ConfigError::Range {
                field: "database.retry.max_retries".to_string(),
                value: retry.max_retries.to_string(),
                min: "0".to_string(),
                max: "10".to_string(),
                hint: "Long retry chains hide a dead store".to_string(),
            });
        }
        if !(1.0..=10.0).contains(&retry.multiplier) {
            return Err(ConfigError::Range {
                field: "database.retry.multiplier".to_string(),
                value: retry.multiplier.to_string(),
                min: "1.0".to_string(),
                max: "10.0".to_string(),
                hint: "Backoff must not shrink between attempts".to_string(),
            });
        }
        if retry.max_backoff_ms < retry.initial_backoff_ms {
            return Err(ConfigError::Custom(format!(
                "database.retry.max_backoff_ms ({}) is below initial_backoff_ms ({})",
                retry.max_backoff_ms, retry.initial_backoff_ms
            )));
        }

        if self.database.backend == DatabaseBackend::Postgres && self.database.url.is_none() {
            return Err(ConfigError::Custom(
                "database.url is required for the postgres backend".to_string(),
            ));
        }

        if self.lock.acquire_timeout_secs == 0 {
            return Err(ConfigError::Range {
                field: "lock.acquire_timeout_secs".to_string(),
                value: "0".to_string(),
                min: "1".to_string(),
                max: "u64::MAX".to_string(),
                hint: "A zero timeout makes every contended lock fail".to_string(),
            });
        }

        Ok(())
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        #[derive(Serialize)]
        struct Export<'a> {
            version: u32,
            #[serde(flatten)]
            settings: &'a Settings,
        }
        Ok(serde_yaml::to_string(&Export {
            version: 1,
            settings: self,
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.main.default_branch, "main");
        assert_eq!(settings.database.backend, DatabaseBackend::Sqlite);
        assert!(settings.database.path.is_none());
        assert_eq!(settings.database.imposed_query_limit, 1000);
        assert_eq!(settings.database.retry.max_retries, 3);
        assert_eq!(settings.lock.acquire_timeout(), Duration::from_secs(30));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_yaml_loading() {
        let yaml_content = r#"
version: 1
main:
  default_branch: trunk
database:
  imposed_query_limit: 250
  retry:
    max_retries: 5
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();
        let path = temp_file.path().to_str().unwrap();

        let settings = Settings::from_yaml(path).unwrap();
        assert_eq!(settings.database.imposed_query_limit, 250);
        assert_eq!(settings.database.retry.max_retries, 5);
        assert_eq!(settings.database.retry.initial_backoff_ms, 50);
    }

    #[test]
    fn test_yaml_missing_version() {
        let result = Settings::from_yaml_str("main:\n  default_branch: main\n");
        assert!(matches!(result, Err(ConfigError::MissingVersion)));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let err = Settings::from_yaml_str("version: 2\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("version 2"));
        assert!(msg.contains("Supported versions: 1"));
    }

    #[test]
    fn test_yaml_unknown_field() {
        let result = Settings::from_yaml_str("version: 1\nbroker:\n  enable: true\n");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TRUTHGRAPH_DEFAULT_BRANCH", "develop"),
            ("TRUTHGRAPH_DB_BACKEND", "postgres"),
            ("TRUTHGRAPH_DB_URL", "postgres://localhost/graph"),
            ("TRUTHGRAPH_IMPOSED_QUERY_LIMIT", "64"),
            ("TRUTHGRAPH_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.main.default_branch, "develop");
        assert_eq!(settings.database.backend, DatabaseBackend::Postgres);
        assert_eq!(settings.database.imposed_query_limit, 64);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_env_override_rejects_bad_number() {
        let mut settings = Settings::default();
        let err = settings
            .apply_overrides(|key| {
                (key == "TRUTHGRAPH_IMPOSED_QUERY_LIMIT").then(|| "lots".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_range_validation() {
        let mut settings = Settings::default();
        settings.database.imposed_query_limit = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("database.imposed_query_limit"));
    }

    #[test]
    fn test_postgres_requires_url() {
        let mut settings = Settings::default();
        settings.database.backend = DatabaseBackend::Postgres;
        assert!(matches!(settings.validate(), Err(ConfigError::Custom(_))));
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(0), Duration::from_millis(50));
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(10), Duration::from_millis(2_000));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut settings = Settings::default();
        settings.main.default_branch = "trunk".to_string();
        let yaml = settings.to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));
        let back = Settings::from_yaml_str(&yaml).unwrap();
        assert_eq!(back, settings);
    }
}
