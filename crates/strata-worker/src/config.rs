//! Worker configuration.
//!
//! Loaded from `STRATA_*` environment variables. Values that are empty after
//! trimming count as unset; anything else must parse or loading fails.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use strata_core::LogFormat;
use strata_ingest::{DEFAULT_BATCH_SIZE, MaintenanceConfig, PipelineConfig, WorkerPoolConfig};
use strata_store::PartitionWindow;

/// Default HTTP port for health and metrics.
pub const DEFAULT_HTTP_PORT: u16 = 8090;

/// Default connection pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default queue of storage event notifications.
pub const DEFAULT_NOTIFICATION_QUEUE: &str = "notifications";

/// Default time between bucket scans.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Largest accepted maintenance horizon, in days.
pub const MAX_HORIZON_DAYS: u32 = 3660;

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but does not parse.
    #[error("{name} {message}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// What was expected.
        message: String,
    },

    /// A required variable is unset.
    #[error("missing {name} ({purpose})")]
    Missing {
        /// Variable name.
        name: &'static str,
        /// What needs it.
        purpose: &'static str,
    },
}

/// Result type for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// MySQL URL.
    pub database_url: Option<String>,
    /// Connection pool size.
    pub database_max_connections: u32,
    /// Start of the initial partition window for new tables.
    pub partition_start: Option<DateTime<Utc>>,
    /// End of the initial partition window for new tables.
    pub partition_end: Option<DateTime<Utc>>,
    /// Time between maintenance ticks.
    pub maintenance_interval: Duration,
    /// Delay before the first maintenance tick.
    pub maintenance_start_delay: Duration,
    /// Days ahead of now that partitions must exist.
    pub maintenance_horizon_days: u32,
    /// Lease duration on semaphore slots.
    pub lock_timeout: Duration,
    /// HTTP port for health and metrics.
    pub http_port: u16,
    /// Log output format.
    pub log_format: LogFormat,
    /// Directory holding one subdirectory per bucket.
    pub storage_root: Option<PathBuf>,
    /// Buckets enumerated by the periodic scan; no scan when empty.
    pub scan_buckets: Vec<String>,
    /// Time between bucket scans.
    pub scan_interval: Duration,
    /// Queue of storage event notifications.
    pub notification_queue: String,
    /// Queue polling settings shared by ingestion and notification workers.
    pub worker_pool: WorkerPoolConfig,
    /// Rows per insert batch.
    pub batch_size: usize,
    /// Directory for temporary artifact files.
    pub temp_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let maintenance = MaintenanceConfig::default();
        Self {
            database_url: None,
            database_max_connections: DEFAULT_MAX_CONNECTIONS,
            partition_start: None,
            partition_end: None,
            maintenance_interval: maintenance.interval,
            maintenance_start_delay: maintenance.start_delay,
            maintenance_horizon_days: 7,
            lock_timeout: maintenance.lock_timeout,
            http_port: DEFAULT_HTTP_PORT,
            log_format: LogFormat::Json,
            storage_root: None,
            scan_buckets: Vec::new(),
            scan_interval: DEFAULT_SCAN_INTERVAL,
            notification_queue: DEFAULT_NOTIFICATION_QUEUE.to_string(),
            worker_pool: WorkerPoolConfig::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            temp_dir: None,
        }
    }
}

impl WorkerConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for values that do not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, which maps a variable name to its
    /// raw value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for values that do not parse or an
    /// initial window whose start is after its end.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        config.database_url = env.string("STRATA_DATABASE_URL");
        if let Some(n) = env.parse::<u32>("STRATA_DATABASE_MAX_CONNECTIONS", "a u32")? {
            if n == 0 {
                return Err(invalid("STRATA_DATABASE_MAX_CONNECTIONS", "must be greater than 0"));
            }
            config.database_max_connections = n;
        }
        config.partition_start = env.datetime("STRATA_PARTITION_START")?;
        config.partition_end = env.datetime("STRATA_PARTITION_END")?;
        if let (Some(start), Some(end)) = (config.partition_start, config.partition_end) {
            if start > end {
                return Err(invalid(
                    "STRATA_PARTITION_START",
                    "must not be after STRATA_PARTITION_END",
                ));
            }
        }
        if let Some(secs) = env.parse::<u64>("STRATA_MAINTENANCE_INTERVAL_SECS", "a u64")? {
            if secs == 0 {
                return Err(invalid("STRATA_MAINTENANCE_INTERVAL_SECS", "must be greater than 0"));
            }
            config.maintenance_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = env.parse::<u64>("STRATA_MAINTENANCE_START_DELAY_MS", "a u64")? {
            config.maintenance_start_delay = Duration::from_millis(ms);
        }
        if let Some(days) = env.parse::<u32>("STRATA_MAINTENANCE_HORIZON_DAYS", "a u32")? {
            if days == 0 || days > MAX_HORIZON_DAYS {
                return Err(invalid(
                    "STRATA_MAINTENANCE_HORIZON_DAYS",
                    &format!("must be between 1 and {MAX_HORIZON_DAYS}"),
                ));
            }
            config.maintenance_horizon_days = days;
        }
        if let Some(secs) = env.parse::<u64>("STRATA_LOCK_TIMEOUT_SECS", "a u64")? {
            if secs == 0 {
                return Err(invalid("STRATA_LOCK_TIMEOUT_SECS", "must be greater than 0"));
            }
            config.lock_timeout = Duration::from_secs(secs);
        }
        if let Some(port) = env.parse::<u16>("STRATA_HTTP_PORT", "a u16")? {
            config.http_port = port;
        }
        if let Some(raw) = env.string("STRATA_LOG_FORMAT") {
            config.log_format = raw
                .parse()
                .map_err(|_| invalid("STRATA_LOG_FORMAT", "must be json or pretty"))?;
        }

        config.storage_root = env.string("STRATA_STORAGE_ROOT").map(PathBuf::from);
        if let Some(raw) = env.string("STRATA_SCAN_BUCKETS") {
            config.scan_buckets = raw
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(secs) = env.positive_secs("STRATA_SCAN_INTERVAL_SECS")? {
            config.scan_interval = secs;
        }
        if let Some(name) = env.string("STRATA_NOTIFICATION_QUEUE") {
            config.notification_queue = name;
        }
        if let Some(n) = env.parse::<usize>("STRATA_WORKER_MAX_MESSAGES", "a usize")? {
            if n == 0 {
                return Err(invalid("STRATA_WORKER_MAX_MESSAGES", "must be greater than 0"));
            }
            config.worker_pool.max_messages = n;
        }
        if let Some(secs) = env.positive_secs("STRATA_VISIBILITY_TIMEOUT_SECS")? {
            config.worker_pool.visibility_timeout = secs;
        }
        if let Some(secs) = env.parse::<u64>("STRATA_RETRY_DELAY_SECS", "a u64")? {
            config.worker_pool.retry_delay = Duration::from_secs(secs);
        }
        if let Some(n) = env.parse::<usize>("STRATA_BATCH_SIZE", "a usize")? {
            if n == 0 {
                return Err(invalid("STRATA_BATCH_SIZE", "must be greater than 0"));
            }
            config.batch_size = n;
        }
        config.temp_dir = env.string("STRATA_TEMP_DIR").map(PathBuf::from);

        Ok(config)
    }

    /// The database URL, required by every database-backed command.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if unset.
    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url.as_deref().ok_or(ConfigError::Missing {
            name: "STRATA_DATABASE_URL",
            purpose: "required to reach the warehouse",
        })
    }

    /// The storage root, required by the ingestion service.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if unset.
    pub fn require_storage_root(&self) -> Result<&Path> {
        self.storage_root.as_deref().ok_or(ConfigError::Missing {
            name: "STRATA_STORAGE_ROOT",
            purpose: "required to read snapshot artifacts",
        })
    }

    /// Pipeline settings.
    #[must_use]
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.batch_size,
            temp_dir: self.temp_dir.clone(),
        }
    }

    /// Initial partition window at `now`: configured bounds where set,
    /// otherwise the start of the current month through the horizon.
    #[must_use]
    pub fn partition_window(&self, now: DateTime<Utc>) -> PartitionWindow {
        let default = PartitionWindow::around(now, self.horizon_std());
        PartitionWindow {
            start: self.partition_start.unwrap_or(default.start),
            end: self.partition_end.unwrap_or(default.end),
        }
    }

    /// Maintenance settings derived from this configuration.
    #[must_use]
    pub fn maintenance(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            interval: self.maintenance_interval,
            start_delay: self.maintenance_start_delay,
            horizon: chrono::Duration::days(i64::from(self.maintenance_horizon_days)),
            lock_timeout: self.lock_timeout,
            ..MaintenanceConfig::default()
        }
    }

    fn horizon_std(&self) -> Duration {
        Duration::from_secs(u64::from(self.maintenance_horizon_days) * 24 * 60 * 60)
    }
}

fn invalid(name: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        message: message.to_string(),
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn parse<T>(&self, name: &'static str, expected: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<T>()
            .map(Some)
            .map_err(|e| invalid(name, &format!("must be {expected}: {e}")))
    }

    fn positive_secs(&self, name: &'static str) -> Result<Option<Duration>> {
        match self.parse::<u64>(name, "a u64")? {
            Some(0) => Err(invalid(name, "must be greater than 0")),
            secs => Ok(secs.map(Duration::from_secs)),
        }
    }

    fn datetime(&self, name: &'static str) -> Result<Option<DateTime<Utc>>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        let parsed = DateTime::parse_from_rfc3339(&v).map_err(|e| {
            invalid(
                name,
                &format!("must be RFC3339 (e.g. 2024-01-01T00:00:00Z): {e}"),
            )
        })?;
        Ok(Some(parsed.with_timezone(&Utc)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::TimeZone;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.http_port, 8090);
        assert_eq!(config.database_max_connections, 10);
        assert_eq!(config.maintenance_interval, Duration::from_secs(14_400));
        assert_eq!(config.maintenance_start_delay, Duration::from_millis(1013));
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = load(&[("STRATA_HTTP_PORT", "  "), ("STRATA_DATABASE_URL", "")]).unwrap();
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert!(config.database_url.is_none());
        assert!(config.require_database_url().is_err());
    }

    #[test]
    fn parses_every_variable() {
        let config = load(&[
            ("STRATA_DATABASE_URL", " mysql://u:p@db/warehouse "),
            ("STRATA_DATABASE_MAX_CONNECTIONS", "4"),
            ("STRATA_PARTITION_START", "2024-01-01T00:00:00Z"),
            ("STRATA_PARTITION_END", "2024-01-04T00:00:00Z"),
            ("STRATA_MAINTENANCE_INTERVAL_SECS", "600"),
            ("STRATA_MAINTENANCE_START_DELAY_MS", "0"),
            ("STRATA_MAINTENANCE_HORIZON_DAYS", "14"),
            ("STRATA_LOCK_TIMEOUT_SECS", "45"),
            ("STRATA_HTTP_PORT", "9000"),
            ("STRATA_LOG_FORMAT", "pretty"),
        ])
        .unwrap();

        assert_eq!(
            config.require_database_url().unwrap(),
            "mysql://u:p@db/warehouse"
        );
        assert_eq!(config.database_max_connections, 4);
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.log_format, LogFormat::Pretty);

        let maintenance = config.maintenance();
        assert_eq!(maintenance.interval, Duration::from_secs(600));
        assert_eq!(maintenance.start_delay, Duration::ZERO);
        assert_eq!(maintenance.horizon, chrono::Duration::days(14));
        assert_eq!(maintenance.lock_timeout, Duration::from_secs(45));
        assert_eq!(maintenance.semaphore_key, "TABLE_PARTITION_WORKER");

        let window = config.partition_window(Utc::now());
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap());
    }

    #[test]
    fn typed_parse_errors_name_the_variable() {
        let err = load(&[("STRATA_HTTP_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().starts_with("STRATA_HTTP_PORT must be a u16"));

        let err = load(&[("STRATA_PARTITION_START", "yesterday")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "STRATA_PARTITION_START",
                ..
            }
        ));

        let err = load(&[("STRATA_LOG_FORMAT", "xml")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "STRATA_LOG_FORMAT",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_and_inverted_values() {
        assert!(load(&[("STRATA_MAINTENANCE_INTERVAL_SECS", "0")]).is_err());
        assert!(load(&[("STRATA_LOCK_TIMEOUT_SECS", "0")]).is_err());
        assert!(load(&[("STRATA_DATABASE_MAX_CONNECTIONS", "0")]).is_err());
        assert!(load(&[("STRATA_MAINTENANCE_HORIZON_DAYS", "0")]).is_err());
        let err = load(&[("STRATA_MAINTENANCE_HORIZON_DAYS", "4294967295")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "STRATA_MAINTENANCE_HORIZON_DAYS",
                ..
            }
        ));
        assert!(load(&[("STRATA_MAINTENANCE_HORIZON_DAYS", "3660")]).is_ok());
        assert!(
            load(&[
                ("STRATA_PARTITION_START", "2024-02-01T00:00:00Z"),
                ("STRATA_PARTITION_END", "2024-01-01T00:00:00Z"),
            ])
            .is_err()
        );
    }

    #[test]
    fn ingestion_settings() {
        let config = load(&[]).unwrap();
        assert!(config.require_storage_root().is_err());
        assert!(config.scan_buckets.is_empty());
        assert_eq!(config.scan_interval, Duration::from_secs(3600));
        assert_eq!(config.notification_queue, "notifications");
        assert_eq!(config.worker_pool.max_messages, 10);
        assert_eq!(config.pipeline().batch_size, 25_000);

        let config = load(&[
            ("STRATA_STORAGE_ROOT", "/srv/snapshots"),
            ("STRATA_SCAN_BUCKETS", " prod.snapshot.record , ,dev.access.record"),
            ("STRATA_SCAN_INTERVAL_SECS", "900"),
            ("STRATA_NOTIFICATION_QUEUE", "events"),
            ("STRATA_WORKER_MAX_MESSAGES", "4"),
            ("STRATA_VISIBILITY_TIMEOUT_SECS", "120"),
            ("STRATA_RETRY_DELAY_SECS", "0"),
            ("STRATA_BATCH_SIZE", "500"),
            ("STRATA_TEMP_DIR", "/tmp/strata"),
        ])
        .unwrap();
        assert_eq!(
            config.require_storage_root().unwrap(),
            Path::new("/srv/snapshots")
        );
        assert_eq!(config.scan_buckets, vec!["prod.snapshot.record", "dev.access.record"]);
        assert_eq!(config.scan_interval, Duration::from_secs(900));
        assert_eq!(config.notification_queue, "events");
        assert_eq!(config.worker_pool.max_messages, 4);
        assert_eq!(config.worker_pool.visibility_timeout, Duration::from_secs(120));
        assert_eq!(config.worker_pool.retry_delay, Duration::ZERO);
        let pipeline = config.pipeline();
        assert_eq!(pipeline.batch_size, 500);
        assert_eq!(pipeline.temp_dir, Some(PathBuf::from("/tmp/strata")));

        assert!(load(&[("STRATA_BATCH_SIZE", "0")]).is_err());
        assert!(load(&[("STRATA_WORKER_MAX_MESSAGES", "0")]).is_err());
        assert!(load(&[("STRATA_VISIBILITY_TIMEOUT_SECS", "0")]).is_err());
    }

    #[test]
    fn default_window_starts_at_current_month() {
        let config = WorkerConfig::default();
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let window = config.partition_window(now);
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 3, 22, 12, 0, 0).unwrap());
    }
}
