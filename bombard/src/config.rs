use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, report::ReportSettings};

/// Parameters of one bombardment run.
///
/// Scripts see this structure as `args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunArgs {
    /// Number of concurrent workers.
    pub workers: usize,
    /// How many times `reload` enqueues each request when no repeat is given.
    pub repeat: usize,
    /// Per-request timeout, in seconds when serialized.
    #[serde(with = "seconds")]
    pub timeout: Duration,
    /// Skip the network and answer every request with its `dry` payload.
    pub dry: bool,
    /// Only log progress milestones and problems.
    pub quiet: bool,
    pub verbose: bool,
    /// Report durations in milliseconds.
    pub ms: bool,
    /// Latency threshold for the report, in milliseconds.
    pub threshold: u64,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            workers: 10,
            repeat: 1,
            timeout: Duration::from_secs(10),
            dry: false,
            quiet: false,
            verbose: false,
            ms: false,
            threshold: 1000,
        }
    }
}

impl RunArgs {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.repeat == 0 {
            return Err(ConfigError::NoRepeat);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn report_settings(&self) -> ReportSettings {
        ReportSettings {
            threshold: Duration::from_millis(self.threshold),
            fixed_ms: self.ms,
        }
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
