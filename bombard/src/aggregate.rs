use crate::Metric;
use crate::metric::Outcome;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

/// The `Aggregate` trait defines how [`Metric`] values are collected into an
/// intermediate representation that a [`crate::Summary`] is later built from.
///
/// Aggregates store data; they do not compute averages or percentiles.
/// `consume` is called from the hot path of every worker and should stay cheap.
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialEq + Send + Sync + Debug + Clone,
{
    /// The metric type this aggregate collects.
    type Metric: Metric;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Incorporate a single metric.
    fn consume(&mut self, metric: &Self::Metric);
}

/// Every [`Outcome`] of a run, in the order the outcomes were recorded.
///
/// The log is append-only. Reports derive everything from this sequence, so
/// two equal logs always produce the same summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, serde::Deserialize)]
pub struct OutcomeLog {
    outcomes: Vec<Outcome>,
}

impl OutcomeLog {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter()
    }

    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }
}

impl Aggregate for OutcomeLog {
    type Metric = Outcome;

    fn new() -> Self {
        OutcomeLog::default()
    }

    fn consume(&mut self, metric: &Self::Metric) {
        self.outcomes.push(metric.clone());
    }
}

impl FromIterator<Outcome> for OutcomeLog {
    fn from_iter<I: IntoIterator<Item = Outcome>>(iter: I) -> Self {
        Self {
            outcomes: iter.into_iter().collect(),
        }
    }
}
