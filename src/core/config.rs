use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache_dir: PathBuf,                  // Concordance files + 00CONCS.map per corpus
    pub archive_db_path: PathBuf,            // SQLite cold store
    pub kvs_journal_dir: Option<PathBuf>,    // None keeps the KVS in memory only

    // Query chain lifecycle
    pub hot_ttl_days: u32,
    pub cold_ttl_days: u32,
    pub registered_ttl_days: u32,
    pub anonymous_ttl_days: u32,

    // Single-flight
    pub pidfile_stale_seconds: u64,
    pub reader_backoff_min_ms: u64,
    pub reader_backoff_max_ms: u64,
    pub read_wait_timeout_ms: u64,

    // Task limits (seconds)
    pub task_soft_time_limit: Option<u64>,
    pub task_hard_time_limit: Option<u64>,
    pub task_record_ttl_secs: u64,
    pub workers: usize,

    pub csm_lock_timeout_ms: u64,
    pub progress_interval_ms: u64,

    // Archival worker
    pub archive_batch_size: usize,
    pub archive_interval_secs: u64,          // 0 disables the background thread

    // Cache cleanup
    pub cache_max_age_secs: u64,
    pub cache_max_bytes: u64,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: PathBuf::from("./data/cache"),
            archive_db_path: PathBuf::from("./data/conc_archive.db"),
            kvs_journal_dir: None,

            hot_ttl_days: 10,
            cold_ttl_days: 3650,
            registered_ttl_days: 100,
            anonymous_ttl_days: 7,

            pidfile_stale_seconds: 3600,
            reader_backoff_min_ms: 20,
            reader_backoff_max_ms: 1500,
            read_wait_timeout_ms: 60_000,

            task_soft_time_limit: Some(1200),
            task_hard_time_limit: Some(1800),
            task_record_ttl_secs: 3600,
            workers: num_cpus::get(),

            csm_lock_timeout_ms: 10_000,
            progress_interval_ms: 300,

            archive_batch_size: 500,
            archive_interval_secs: 0,

            cache_max_age_secs: 7 * 24 * 3600,
            cache_max_bytes: 2 * 1024 * 1024 * 1024, // 2GB per corpus

            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load a JSON config file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Config rooted in a single directory, used by tests and demos
    pub fn with_root(root: &Path) -> Self {
        Config {
            cache_dir: root.join("cache"),
            archive_db_path: root.join("conc_archive.db"),
            ..Config::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.anonymous_ttl_days > self.registered_ttl_days {
            return Err(Error::new(
                ErrorKind::BadInput,
                "anonymous_ttl_days must not exceed registered_ttl_days".to_string(),
            ));
        }
        if self.hot_ttl_days >= self.cold_ttl_days {
            return Err(Error::new(
                ErrorKind::BadInput,
                "hot_ttl_days must be shorter than cold_ttl_days".to_string(),
            ));
        }
        if self.reader_backoff_min_ms == 0 || self.reader_backoff_min_ms > self.reader_backoff_max_ms {
            return Err(Error::new(
                ErrorKind::BadInput,
                "reader backoff must satisfy 0 < min <= max".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(Error::new(ErrorKind::BadInput, "workers must be positive".to_string()));
        }
        if let (Some(soft), Some(hard)) = (self.task_soft_time_limit, self.task_hard_time_limit) {
            if soft > hard {
                return Err(Error::new(
                    ErrorKind::BadInput,
                    "task_soft_time_limit must not exceed task_hard_time_limit".to_string(),
                ));
            }
        }
        if self.archive_batch_size == 0 {
            return Err(Error::new(ErrorKind::BadInput, "archive_batch_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn pidfile_grace(&self) -> Duration {
        Duration::from_secs(self.pidfile_stale_seconds)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.csm_lock_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn read_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.read_wait_timeout_ms)
    }

    pub fn backoff_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.reader_backoff_min_ms),
            Duration::from_millis(self.reader_backoff_max_ms),
        )
    }

    pub fn soft_time_limit(&self) -> Option<Duration> {
        self.task_soft_time_limit.map(Duration::from_secs)
    }

    pub fn hard_time_limit(&self) -> Option<Duration> {
        self.task_hard_time_limit.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: Config = serde_json::from_str(r#"{"hot_ttl_days": 3, "workers": 2}"#).unwrap();
        assert_eq!(config.hot_ttl_days, 3);
        assert_eq!(config.workers, 2);
        assert_eq!(config.anonymous_ttl_days, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_ttls_rejected() {
        let config = Config {
            anonymous_ttl_days: 200,
            ..Config::default()
        };
        assert_eq!(config.validate().unwrap_err().kind, ErrorKind::BadInput);
    }
}
