// src/utils/error.rs
use thiserror::Error;

// Define specific error types for different parts of the application
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error), // Timeouts, connection resets, body read failures

    #[error("Server error: {0}")]
    Server(reqwest::StatusCode), // 5xx and 429, worth another attempt

    #[error("Request rejected: {0}")]
    Client(reqwest::StatusCode), // Remaining 4xx, never retried

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request cancelled before it was sent")]
    Cancelled,
}

impl FetchError {
    /// Timeouts, connection failures and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            FetchError::Server(_) => true,
            FetchError::Client(_) | FetchError::InvalidUrl(_) | FetchError::Cancelled => false,
        }
    }

    /// Status code of an HTTP-level failure, if there was a response.
    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            FetchError::Server(s) | FetchError::Client(s) => Some(*s),
            FetchError::Network(e) => e.status(),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("No company found for '{0}'")]
    NotFound(String),

    #[error("Transient failure while resolving: {0}")]
    Transient(FetchError),

    #[error("Resolution request failed: {0}")]
    Request(FetchError),

    #[error("Failed to parse search response: {0}")]
    Parse(String),
}

impl From<FetchError> for ResolveError {
    fn from(e: FetchError) -> Self {
        if e.is_transient() {
            ResolveError::Transient(e)
        } else {
            ResolveError::Request(e)
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid artifact name: {0}")]
    InvalidName(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error), // Automatically convert IO errors

    #[error("Company resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Request failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Unknown job: {0}")]
    JobNotFound(String),

    #[error("Invalid job state change: {0}")]
    InvalidState(String),

    #[error("Job {0} failed")]
    JobFailed(String),

    #[error("Another job is already writing to {0}")]
    DirectoryBusy(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
