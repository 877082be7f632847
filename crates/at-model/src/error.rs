//! Model capability errors

/// Failure of a single model call
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    /// Network-level failure (connect, timeout, reset)
    #[error("model transport error: {0}")]
    Transport(String),

    /// Endpoint answered with a non-success status
    #[error("model endpoint returned {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Reply arrived but its content could not be used
    #[error("unparseable model output: {0}")]
    Unparseable(String),

    /// Client could not be constructed
    #[error("model client configuration error: {0}")]
    Config(String),
}

impl ModelError {
    /// Transient failures that a transport retry may fix
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Unparseable(_) | Self::Config(_) => false,
        }
    }

    /// True when the call reached the model but its reply was unusable
    #[inline]
    #[must_use]
    pub fn is_unparseable(&self) -> bool {
        matches!(self, Self::Unparseable(_))
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Status {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None if err.is_decode() => Self::Unparseable(err.to_string()),
            None => Self::Transport(err.to_string()),
        }
    }
}
