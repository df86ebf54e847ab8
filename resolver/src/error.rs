use crate::model::FileId;
use crate::tier::Tier;
use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Storage listing failed: {0}")]
    Listing(String),

    #[error("Failed to open {file}: {reason}")]
    Document { file: FileId, reason: String },

    #[error("Failed to parse {file} for {date}: {reason}")]
    ParseFailure {
        file: FileId,
        date: NaiveDate,
        reason: String,
    },

    #[error("Entity index is not ready")]
    IndexNotReady,

    #[error("Entity index is behind the current file listing")]
    IndexStale,

    #[error("Entity index cannot answer for `{entity}`")]
    IndexMiss { entity: String },

    #[error("Tier {tier} exceeded its budget of {budget:?}")]
    TierTimeout { tier: Tier, budget: Duration },

    #[error("Timed out after {0:?} waiting for an in-flight resolution")]
    CoordinatorJoinTimeout(Duration),

    #[error("Invalid date range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("Every resolution tier failed; last error: {0}")]
    Exhausted(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl From<tokio::task::JoinError> for ResolverError {
    fn from(err: tokio::task::JoinError) -> Self {
        ResolverError::TaskFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ResolverError>;
