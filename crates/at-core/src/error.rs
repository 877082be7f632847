//! Error types for AutoTransform core
//!
//! One enum per concern. Per-record failures (schema, execution, logic) are
//! data on an [`Attempt`](crate::types::Attempt), not errors; only the
//! conditions below ever travel through `Result`.

use crate::types::{ConfigId, JobId, JobStatus};
use at_model::ModelError;
use std::path::PathBuf;
use std::time::Duration;

/// Schema canonicalization and compilation errors
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Caller supplied neither a usable description nor examples
    #[error("invalid schema request: {0}")]
    InvalidInput(String),

    /// Model output was not a usable JSON Schema
    #[error("schema parse error: {0}")]
    Parse(String),

    /// Value does not compile as a JSON Schema
    #[error("invalid JSON Schema: {0}")]
    Invalid(String),

    /// Model call failed after transport retries
    #[error("model call failed: {0}")]
    Model(#[from] ModelError),
}

/// Candidate program generation errors
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    /// Reply carried no program; consumes an attempt
    #[error("synthesis failure: {0}")]
    NoProgram(String),

    /// Model call failed after transport retries
    #[error("model call failed: {0}")]
    Model(#[from] ModelError),
}

impl SynthesisError {
    /// Failures that say nothing about the candidate, only the infrastructure
    #[inline]
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::NoProgram(_) => false,
            Self::Model(e) => !e.is_unparseable(),
        }
    }
}

/// Execution capability errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to start interpreter: {0}")]
    Spawn(String),

    #[error("sandbox io error: {0}")]
    Io(String),

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// Interpreter output did not follow the wire protocol
    #[error("sandbox protocol error: {0}")]
    Protocol(String),
}

/// Version-control capability errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum VcsError {
    #[error("version-control transport error: {0}")]
    Transport(String),

    #[error("version-control host returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("version-control configuration error: {0}")]
    Config(String),
}

impl VcsError {
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::NotFound(_) | Self::Config(_) => false,
        }
    }
}

/// Run store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("config not found: {0}")]
    ConfigNotFound(ConfigId),

    #[error("config already exists: {0}")]
    ConfigExists(ConfigId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("job already exists: {0}")]
    JobExists(JobId),

    /// Status change not allowed by the job state machine
    #[error("invalid job transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Attempts must be appended with consecutive indices
    #[error("attempt {got} out of order for job {job_id}, expected {expected}")]
    AttemptOrder {
        job_id: JobId,
        expected: u32,
        got: u32,
    },

    /// Another job already holds the config
    #[error("config {config_id} already has running job {running}")]
    Conflict { config_id: ConfigId, running: JobId },
}

impl StoreError {
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ConfigNotFound(_) | Self::JobNotFound(_))
    }
}

/// Record persistence and export errors
#[derive(Debug, thiserror::Error)]
pub enum RecordStoreError {
    #[error("record io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no stored records at {0}")]
    NotFound(PathBuf),
}

/// Review gate errors
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job {0} is not awaiting review")]
    NotAwaitingReview(JobId),

    #[error("job {0} has no pending candidate")]
    NoPending(JobId),

    #[error("config {0} has no review settings")]
    NotConfigured(ConfigId),

    #[error("asset encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors that abort a running job outside the attempt outcomes
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Review(#[from] ReviewError),
}

/// Errors surfaced synchronously when submitting a batch
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Submission itself is unusable
    #[error("malformed submission: {0}")]
    Malformed(String),

    #[error("unknown config: {0}")]
    UnknownConfig(ConfigId),

    /// Latest job still waits on an external decision
    #[error("config {config_id} has job {job_id} awaiting review")]
    AwaitingReview { config_id: ConfigId, job_id: JobId },

    /// A job is already running for this config
    #[error("config {config_id} already has running job {running}")]
    Conflict { config_id: ConfigId, running: JobId },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Records(#[from] RecordStoreError),

    #[error(transparent)]
    Review(#[from] ReviewError),
}

impl SubmitError {
    /// Capacity conflicts are never retried
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::AwaitingReview { .. })
    }
}

impl From<StoreError> for SubmitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { config_id, running } => Self::Conflict { config_id, running },
            StoreError::ConfigNotFound(id) => Self::UnknownConfig(id),
            other => Self::Store(other),
        }
    }
}

/// Config service errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A user example's output does not satisfy the schema
    #[error("example {index} does not match the output schema: {message}")]
    InvalidExample { index: usize, message: String },

    #[error("config name must not be empty")]
    EmptyName,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Review(#[from] ReviewError),
}

/// Settings loading errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_conflict_maps_to_submit_conflict() {
        let err: SubmitError = StoreError::Conflict {
            config_id: ConfigId::new(),
            running: JobId::new(),
        }
        .into();
        assert!(err.is_conflict());
    }

    #[test]
    fn unknown_config_maps_through() {
        let id = ConfigId::new();
        let err: SubmitError = StoreError::ConfigNotFound(id).into();
        assert!(matches!(err, SubmitError::UnknownConfig(got) if got == id));
    }

    #[test]
    fn unparseable_reply_is_not_infrastructure() {
        assert!(!SynthesisError::Model(ModelError::Unparseable("x".into())).is_infrastructure());
        assert!(SynthesisError::Model(ModelError::Transport("x".into())).is_infrastructure());
        assert!(!SynthesisError::NoProgram("empty".into()).is_infrastructure());
    }

    #[test]
    fn vcs_retry_classification() {
        assert!(VcsError::Status { status: 502, message: String::new() }.is_retryable());
        assert!(!VcsError::NotFound("x".into()).is_retryable());
    }
}
