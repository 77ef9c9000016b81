//! Configuration for stores and daemons.
//!
//! Every struct has documented defaults (`Default`) and `with_*` builders.
//! `from_env()` readers take `JOBFORGE_*` variables; durations are given in
//! milliseconds.

use std::time::Duration;

use jobforge_core::DEFAULT_CHANNEL;

const DEFAULT_SCHEMA: &str = "_jobforge";
const DEFAULT_NAME: &str = "anon";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("invalid schema name: {0}")]
    InvalidSchema(String),
}

/// Where the relational layout lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Schema (namespace) holding the three job tables
    pub schema: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// The schema name is interpolated into SQL, so only plain identifiers are accepted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut chars = self.schema.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid_start && valid_rest && self.schema.len() <= 63 {
            Ok(())
        } else {
            Err(ConfigError::InvalidSchema(self.schema.clone()))
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self {
            schema: lookup("JOBFORGE_SCHEMA").unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Name for logging and events (suffixed with `-worker`)
    pub name: String,
    /// Channel to claim jobs from
    pub channel: String,
    /// Maximum concurrently executing jobs
    pub concurrency: usize,
    /// How often to poll for new jobs
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            concurrency: 1,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Values below 1 are raised to 1.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            name: lookup("JOBFORGE_WORKER_NAME").unwrap_or(defaults.name),
            channel: lookup("JOBFORGE_WORKER_CHANNEL").unwrap_or(defaults.channel),
            concurrency: parse_or(&lookup, "JOBFORGE_WORKER_CONCURRENCY", defaults.concurrency)?
                .max(1),
            poll_interval: millis_or(&lookup, "JOBFORGE_WORKER_POLL_INTERVAL_MS", defaults.poll_interval)?,
        })
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Name for logging and events (suffixed with `-orchestrator`)
    pub name: String,
    /// How often registered definitions are heartbeated
    pub heartbeat_interval: Duration,
    /// How often repeating definitions are checked
    pub repeat_interval: Duration,
    /// How often finalize and sweep passes run
    pub clean_interval: Duration,
    /// Age after finalization at which a job may be deleted
    pub finalized_job_sweep_threshold: Duration,
    /// Heartbeat age at which an unreferenced definition may be deleted
    pub stale_definition_sweep_threshold: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            heartbeat_interval: Duration::from_secs(60),
            repeat_interval: Duration::from_secs(30),
            clean_interval: Duration::from_secs(5 * 60),
            finalized_job_sweep_threshold: Duration::from_secs(12 * 60 * 60),
            stale_definition_sweep_threshold: Duration::from_secs(60 * 60),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_repeat_interval(mut self, interval: Duration) -> Self {
        self.repeat_interval = interval;
        self
    }

    pub fn with_clean_interval(mut self, interval: Duration) -> Self {
        self.clean_interval = interval;
        self
    }

    pub fn with_finalized_job_sweep_threshold(mut self, threshold: Duration) -> Self {
        self.finalized_job_sweep_threshold = threshold;
        self
    }

    pub fn with_stale_definition_sweep_threshold(mut self, threshold: Duration) -> Self {
        self.stale_definition_sweep_threshold = threshold;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            name: lookup("JOBFORGE_ORCHESTRATOR_NAME").unwrap_or(d.name),
            heartbeat_interval: millis_or(&lookup, "JOBFORGE_HEARTBEAT_INTERVAL_MS", d.heartbeat_interval)?,
            repeat_interval: millis_or(&lookup, "JOBFORGE_REPEAT_INTERVAL_MS", d.repeat_interval)?,
            clean_interval: millis_or(&lookup, "JOBFORGE_CLEAN_INTERVAL_MS", d.clean_interval)?,
            finalized_job_sweep_threshold: millis_or(
                &lookup,
                "JOBFORGE_FINALIZED_JOB_SWEEP_THRESHOLD_MS",
                d.finalized_job_sweep_threshold,
            )?,
            stale_definition_sweep_threshold: millis_or(
                &lookup,
                "JOBFORGE_STALE_DEFINITION_SWEEP_THRESHOLD_MS",
                d.stale_definition_sweep_threshold,
            )?,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let worker = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(worker, WorkerConfig::default());
        assert_eq!(worker.channel, "_default");
        assert_eq!(worker.poll_interval, Duration::from_secs(1));

        let orchestrator = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(orchestrator.clean_interval, Duration::from_secs(300));
        assert_eq!(orchestrator.stale_definition_sweep_threshold, Duration::from_secs(3600));

        let store = StoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(store.schema, "_jobforge");
    }

    #[test]
    fn reads_overrides() {
        let worker = WorkerConfig::from_lookup(lookup(&[
            ("JOBFORGE_WORKER_CHANNEL", "media"),
            ("JOBFORGE_WORKER_CONCURRENCY", "0"),
            ("JOBFORGE_WORKER_POLL_INTERVAL_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(worker.channel, "media");
        assert_eq!(worker.concurrency, 1);
        assert_eq!(worker.poll_interval, Duration::from_millis(250));

        let orchestrator = OrchestratorConfig::from_lookup(lookup(&[(
            "JOBFORGE_FINALIZED_JOB_SWEEP_THRESHOLD_MS",
            "1000",
        )]))
        .unwrap();
        assert_eq!(orchestrator.finalized_job_sweep_threshold, Duration::from_secs(1));
    }

    #[test]
    fn rejects_malformed_numbers() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("JOBFORGE_CLEAN_INTERVAL_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "JOBFORGE_CLEAN_INTERVAL_MS"));
    }

    #[test]
    fn schema_must_be_plain_identifier() {
        assert!(StoreConfig::default().with_schema("jobs_v2").validate().is_ok());
        assert!(StoreConfig::default().with_schema("2jobs").validate().is_err());
        assert!(StoreConfig::default().with_schema("a\"; DROP").validate().is_err());
        assert!(StoreConfig::default().with_schema("").validate().is_err());
    }

    #[test]
    fn concurrency_builder_clamps() {
        assert_eq!(WorkerConfig::default().with_concurrency(0).concurrency, 1);
        assert_eq!(WorkerConfig::default().with_concurrency(8).concurrency, 8);
    }
}
