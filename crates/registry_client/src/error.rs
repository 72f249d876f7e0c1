use thiserror::Error;

/// Registry client errors.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("http error: {status} - {message}")]
    Http { status: u16, message: String },

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unknown workload type '{0}'")]
    UnknownWorkloadType(String),

    #[error("invalid workload: {0}")]
    InvalidWorkload(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RegistryError {
    /// True for errors the next poll or janitor cycle will naturally retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Network(_) | RegistryError::Timeout(_) => true,
            RegistryError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            RegistryError::Timeout(error.to_string())
        } else if error.is_connect() {
            RegistryError::Network("connection failed".to_string())
        } else {
            RegistryError::Network(error.to_string())
        }
    }
}

/// Result type alias for registry client operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
