//! Scheduler configuration, loaded from TOML.
//!
//! ```toml
//! prefer_archive_on_tie = true
//! max_total_retries = 3
//! poll_interval_ms = 1000
//! log_format = "json"
//! ```
//!
//! Every key is optional. Unknown tables are ignored so the same file can
//! carry sections meant for other components.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::TieBreakPolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// At equal priority, mount archive queues before retrieve queues.
    pub prefer_archive_on_tie: bool,
    /// Failures after which a job is parked in the failed queue.
    pub max_total_retries: u32,
    /// Back-off of a drive session between two empty scheduling passes.
    pub poll_interval_ms: u64,
    pub log_format: LogFormat,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            prefer_archive_on_tie: true,
            max_total_retries: 3,
            poll_interval_ms: 1000,
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl SchedulerConfig {
    /// Defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn tie_break(&self) -> TieBreakPolicy {
        TieBreakPolicy {
            prefer_archive: self.prefer_archive_on_tie,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_keys_take_defaults() {
        let cfg: SchedulerConfig = toml::from_str("max_total_retries = 5").unwrap();
        assert_eq!(cfg.max_total_retries, 5);
        assert!(cfg.prefer_archive_on_tie);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.log_format, LogFormat::Text);
    }

    #[test]
    fn archive_bias_can_be_turned_off() {
        let cfg: SchedulerConfig =
            toml::from_str("prefer_archive_on_tie = false\nlog_format = \"json\"").unwrap();
        assert!(!cfg.tie_break().prefer_archive);
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn load_reads_the_file_or_falls_back() {
        assert_eq!(SchedulerConfig::load(None).unwrap(), SchedulerConfig::default());

        let path = std::env::temp_dir().join(format!("tapesched-config-{}.toml", std::process::id()));
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "poll_interval_ms = 250\n[[drives]]\nname = \"D1\"").unwrap();
        let cfg = SchedulerConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.poll_interval(), Duration::from_millis(250));
        fs::remove_file(&path).unwrap();

        let err = SchedulerConfig::load(Some(Path::new("/nonexistent/tapesched.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
