use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::ParseError;

/// Error context information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    /// URL associated with the error
    pub url: Option<String>,

    /// Request ID (if available)
    pub request_id: Option<String>,

    /// Name of the queue involved
    pub queue_name: Option<String>,

    /// Time when the error occurred
    #[serde(skip)]
    pub timestamp: Option<std::time::SystemTime>,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new() -> Self {
        Self {
            timestamp: Some(std::time::SystemTime::now()),
            ..Self::default()
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref url) = self.url {
            parts.push(format!("url={}", url));
        }

        if let Some(ref request_id) = self.request_id {
            parts.push(format!("request_id={}", request_id));
        }

        if let Some(ref queue_name) = self.queue_name {
            parts.push(format!("queue={}", queue_name));
        }

        write!(f, "{}", parts.join(", "))
    }
}

/// Storage adapter error types
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageError {
    /// The record does not exist
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A record with the same key already exists
    #[error("Record already exists: {0}")]
    Conflict(String),

    /// Transient I/O or connection failure
    #[error("Storage I/O error: {0}")]
    Io(String),

    /// Stored data could not be read back
    #[error("Corrupted record {id}: {message}")]
    Corrupted {
        /// Key of the broken record
        id: String,
        /// What went wrong
        message: String,
    },

    /// Serialization failure
    #[error("Storage serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(error: std::io::Error) -> Self {
        StorageError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        StorageError::Serialization(error.to_string())
    }
}

/// Invalid configuration value
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Invalid value for `{field}`: {message}")]
pub struct ConfigError {
    /// The offending option
    pub field: String,
    /// The violated constraint
    pub message: String,
}

impl ConfigError {
    /// Create a new config error
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error types for the autocrawl runtime
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Error when parsing a URL
    #[error("URL parse error: {0}")]
    UrlParseError(#[from] ParseError),

    /// Storage adapter error
    #[error("Storage error: {error} {context}")]
    Storage {
        /// The storage error
        error: StorageError,
        /// Error context
        context: ErrorContext,
    },

    /// Internal error of the autoscaled pool
    #[error("Pool error: {message} {context}")]
    Pool {
        /// Error message
        message: String,
        /// Error context
        context: ErrorContext,
    },

    /// Error raised by a task or request handler
    #[error("Task error: {message} {context}")]
    Task {
        /// Error message
        message: String,
        /// Error context
        context: ErrorContext,
    },

    /// Operation timed out
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serde error
    #[error("Serialization error: {0}")]
    SerdeError(String),

    /// Generic error
    #[error("{message} {context}")]
    Other {
        /// Error message
        message: String,
        /// Error context
        context: ErrorContext,
    },
}

impl Error {
    /// Create a new storage error
    pub fn storage(error: StorageError) -> Self {
        Self::Storage {
            error,
            context: ErrorContext::new(),
        }
    }

    /// Create a new pool error
    pub fn pool(message: impl Into<String>) -> Self {
        Self::Pool {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a new task error
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a new config error
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config(ConfigError::new(field, message))
    }

    /// Create a new generic error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Get the error context
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Storage { context, .. } => Some(context),
            Self::Pool { context, .. } => Some(context),
            Self::Task { context, .. } => Some(context),
            Self::Other { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Get a mutable reference to the error context
    pub fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            Self::Storage { context, .. } => Some(context),
            Self::Pool { context, .. } => Some(context),
            Self::Task { context, .. } => Some(context),
            Self::Other { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Set the URL in the error context
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.url = Some(url.into());
        }
        self
    }

    /// Set the request ID in the error context
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.request_id = Some(request_id.into());
        }
        self
    }

    /// Set the queue name in the error context
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.queue_name = Some(queue_name.into());
        }
        self
    }

    /// The storage error behind this error, if any
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            Self::Storage { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { error, .. } => error.is_transient(),
            Self::Task { .. } => true,
            Self::Timeout(_) => true,
            Self::IoError(_) => true,
            Self::Other { .. } => true,
            Self::UrlParseError(_)
            | Self::Config(_)
            | Self::SerdeError(_)
            | Self::Pool { .. } => false,
        }
    }
}

/// Result type for autocrawl operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<StorageError> for Error {
    fn from(error: StorageError) -> Self {
        Error::storage(error)
    }
}

// Implement From for std::io::Error
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IoError(error.to_string())
    }
}

// Implement From for serde_json::Error
impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::SerdeError(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_display() {
        let error = Error::task("boom")
            .with_url("https://example.com/")
            .with_request_id("abc")
            .with_queue_name("crawl");

        assert_eq!(
            error.context().unwrap().to_string(),
            "url=https://example.com/, request_id=abc, queue=crawl"
        );
        assert_eq!(
            error.to_string(),
            "Task error: boom url=https://example.com/, request_id=abc, queue=crawl"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::task("boom").is_retryable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::storage(StorageError::Io("disk".into())).is_retryable());
        assert!(!Error::storage(StorageError::NotFound("x".into())).is_retryable());
        assert!(!Error::config("max_concurrency", "must be positive").is_retryable());
    }

    #[test]
    fn test_with_request_id_sets_context() {
        let error = Error::pool("lease lost").with_request_id("r1");
        assert_eq!(error.context().unwrap().request_id.as_deref(), Some("r1"));
        assert!(Error::Timeout(Duration::from_secs(1))
            .with_request_id("r1")
            .context()
            .is_none());
    }

    #[test]
    fn test_storage_error_conversion() {
        let error: Error = StorageError::Conflict("id".into()).into();
        assert_eq!(
            error.storage_error(),
            Some(&StorageError::Conflict("id".into()))
        );
    }
}
