use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("provider rejected the crawl (status={status}): {}", message.as_deref().unwrap_or("no message"))]
    FatalProvider {
        status: String,
        message: Option<String>,
    },
}

impl AppError {
    /// Errors that must stop the whole multi-region run rather than one region.
    pub fn is_process_fatal(&self) -> bool {
        matches!(self, AppError::FatalProvider { .. })
    }

    pub fn fatal_provider(status: impl Into<String>, message: Option<String>) -> Self {
        AppError::FatalProvider {
            status: status.into(),
            message,
        }
    }
}

/// Failure of a single HTTP round-trip to the provider.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("provider answered HTTP {status}")]
    Status { status: u16 },
    #[error("malformed provider response: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::Connect(_) => true,
            TransportError::Status { status } => *status >= 500 || *status == 429,
            TransportError::Decode(_) => false,
        }
    }

    /// HTTP 401 or 403: the provider refuses the key itself.
    pub fn is_credential_rejection(&self) -> bool {
        matches!(self, TransportError::Status { status: 401 | 403 })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Status {
                status: status.as_u16(),
            }
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Connect(err.to_string())
        }
    }
}
