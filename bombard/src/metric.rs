use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A `Metric` is a single observation produced by one request attempt.
///
/// Metrics are collected by an [`crate::Aggregate`] and turned into a
/// [`crate::Summary`] once the run is over. They must be cheap to clone and
/// safe to hand between worker tasks.
pub trait Metric
where
    Self: PartialOrd + PartialEq + Send + Sync + Clone,
{
}

/// Outcome of one request attempt.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Outcome {
    /// Whether the status was in the ok set.
    pub success: bool,
    /// Time spent in the transport.
    pub elapsed: Duration,
    /// Template name, if it has one.
    pub label: Option<String>,
    /// Response size in bytes.
    pub size: usize,
    /// When the outcome was recorded, relative to the start of the run.
    pub finished: Duration,
}

impl Metric for Outcome {}

impl Outcome {
    /// When the attempt started, relative to the start of the run.
    pub fn started(&self) -> Duration {
        self.finished.saturating_sub(self.elapsed)
    }
}
