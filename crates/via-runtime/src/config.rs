//! Environment configuration.
//!
//! Every recognized key has a default suitable for a single-node demo; the
//! daemon loads a `.env` file before calling [`Config::from_env`], so both
//! files and real environment variables work.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::StartupError;

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Tier-1 sliding-window length in seconds (`T1_WINDOW_SEC`).
    pub t1_window_sec: i64,
    /// Tier-1 hard point cap (`T1_MAX_POINTS`).
    pub t1_max_points: u64,
    /// Days a forensic partition survives (`T2_RETENTION_DAYS`).
    pub t2_retention_days: i64,
    /// Default anomaly reporting threshold (`ANOMALY_THRESHOLD`).
    pub anomaly_threshold: f64,
    /// Novelty/frequency blend (`ANOMALY_ALPHA`).
    pub anomaly_alpha: f64,
    /// Federated query deadline (`QUERY_TIMEOUT_MS`).
    pub query_timeout: Duration,
    /// Embedder selector (`EMBEDDER_BACKEND`), e.g. `hash:`.
    pub embedder_backend: String,
    /// Vector engine selector (`VECTOR_BACKEND_URL`), e.g. `memory:`.
    pub vector_backend_url: String,
    /// SQLite file holding control and prevalence tables
    /// (`CONTROL_STORE_PATH`).
    pub control_store_path: PathBuf,
    /// Append-only regression log (`REGRESSION_LOG_PATH`).
    pub regression_log_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            t1_window_sec: 1800,
            t1_max_points: 200_000,
            t2_retention_days: 30,
            anomaly_threshold: 0.5,
            anomaly_alpha: 0.6,
            query_timeout: Duration::from_millis(3000),
            embedder_backend: "hash:".into(),
            vector_backend_url: "memory:".into(),
            control_store_path: PathBuf::from("data/control.db"),
            regression_log_path: PathBuf::from("data/regressions.jsonl"),
        }
    }
}

impl Config {
    /// Read the recognized environment keys over the defaults.
    pub fn from_env() -> Result<Self, StartupError> {
        let defaults = Self::default();
        let config = Self {
            t1_window_sec: parse_var("T1_WINDOW_SEC", defaults.t1_window_sec)?,
            t1_max_points: parse_var("T1_MAX_POINTS", defaults.t1_max_points)?,
            t2_retention_days: parse_var("T2_RETENTION_DAYS", defaults.t2_retention_days)?,
            anomaly_threshold: parse_var("ANOMALY_THRESHOLD", defaults.anomaly_threshold)?,
            anomaly_alpha: parse_var("ANOMALY_ALPHA", defaults.anomaly_alpha)?,
            query_timeout: Duration::from_millis(parse_var("QUERY_TIMEOUT_MS", 3000u64)?),
            embedder_backend: string_var("EMBEDDER_BACKEND", &defaults.embedder_backend),
            vector_backend_url: string_var("VECTOR_BACKEND_URL", &defaults.vector_backend_url),
            control_store_path: PathBuf::from(string_var(
                "CONTROL_STORE_PATH",
                "data/control.db",
            )),
            regression_log_path: PathBuf::from(string_var(
                "REGRESSION_LOG_PATH",
                "data/regressions.jsonl",
            )),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.t1_window_sec <= 0 {
            return Err(StartupError::Config("T1_WINDOW_SEC must be positive".into()));
        }
        if self.t1_max_points == 0 {
            return Err(StartupError::Config("T1_MAX_POINTS must be positive".into()));
        }
        if self.t2_retention_days <= 0 {
            return Err(StartupError::Config(
                "T2_RETENTION_DAYS must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.anomaly_threshold) {
            return Err(StartupError::Config(
                "ANOMALY_THRESHOLD must lie in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.anomaly_alpha) {
            return Err(StartupError::Config(
                "ANOMALY_ALPHA must lie in [0, 1]".into(),
            ));
        }
        if self.query_timeout.is_zero() {
            return Err(StartupError::Config(
                "QUERY_TIMEOUT_MS must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn string_var(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T, StartupError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| StartupError::Config(format!("invalid {key}=`{raw}`: {e}"))),
        Err(_) => Ok(default),
    }
}
