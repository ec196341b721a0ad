use thiserror::Error;

/// Failures that can happen while a single ammo is being processed.
///
/// None of these ever escape a worker: the engine logs them at the point of use
/// and, where the failure happens before a response was classified, records a
/// failed outcome for the attempt.
#[derive(Debug, Error)]
pub enum AmmoError {
    /// A `{placeholder}` references a name that is not in the effective supply.
    #[error("cannot substitute `{placeholder}` in {field}: {reason}")]
    Substitution {
        field: String,
        placeholder: String,
        reason: String,
    },

    /// The transport answered with the sentinel status.
    #[error("transport failure: {0}")]
    Transport(String),

    /// An `extract` path is missing from the response or the response is not JSON.
    #[error("cannot extract `{name}` using `{path}`: {reason}")]
    Extraction {
        name: String,
        path: String,
        reason: String,
    },

    /// A response script threw or could not be evaluated.
    #[error("script failed: {0}")]
    Script(String),

    /// A reload references an ammo name missing from the campaign.
    #[error("unknown reload target `{0}`")]
    ReloadTargetUnknown(String),
}

/// Syntax or lookup errors for dotted/bracketed value paths.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("malformed path `{path}` at byte {at}")]
    Syntax { path: String, at: usize },
    #[error("`{segment}` not found")]
    Missing { segment: String },
}

/// Errors raised while loading a campaign book.
#[derive(Debug, Error)]
pub enum CampaignError {
    #[error("cannot read campaign {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed campaign: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("section `{0}` must be a mapping")]
    Section(String),
    #[error("ammo `{name}`: {reason}")]
    Template { name: String, reason: String },
}

/// Run parameters that cannot start an engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("repeat must be at least 1")]
    NoRepeat,
    #[error("timeout must be positive")]
    ZeroTimeout,
}
