use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::request::Request;

/// Decides what happens to a request whose processing failed
#[async_trait]
pub trait ErrorHandler: Send + Sync + 'static {
    /// Handle an error raised while processing `request`
    async fn handle_error(&self, error: &Error, request: &Request) -> Result<ErrorAction>;
}

/// Action to take after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorAction {
    /// Give the request back to the queue for another attempt
    Retry {
        /// Put the request at the head of the queue
        forefront: bool,

        /// Reason for retrying
        reason: String,
    },

    /// Stop retrying and mark the request handled
    GiveUp {
        /// Reason for giving up
        reason: String,
    },

    /// Abort the whole crawl
    Abort {
        /// Reason for aborting
        reason: String,
    },
}

impl fmt::Display for ErrorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry { forefront, reason } => {
                write!(f, "Retry (forefront={}): {}", forefront, reason)
            }
            Self::GiveUp { reason } => write!(f, "Give up: {}", reason),
            Self::Abort { reason } => write!(f, "Abort: {}", reason),
        }
    }
}

/// Retries retryable errors until the request runs out of attempts
pub struct DefaultErrorHandler {
    /// Maximum number of retries per request
    max_retries: u32,

    /// Whether retried requests jump the queue
    retry_forefront: bool,

    /// Custom error handlers keyed by error kind
    custom_handlers: HashMap<String, Box<dyn ErrorHandler>>,
}

impl DefaultErrorHandler {
    /// Create a new default error handler
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            retry_forefront: false,
            custom_handlers: HashMap::new(),
        }
    }

    /// Set the maximum number of retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Put retried requests at the head of the queue
    pub fn with_retry_forefront(mut self, forefront: bool) -> Self {
        self.retry_forefront = forefront;
        self
    }

    /// Add a custom error handler for a specific error kind
    pub fn with_custom_handler<H: ErrorHandler>(mut self, error_kind: &str, handler: H) -> Self {
        self.custom_handlers
            .insert(error_kind.to_string(), Box::new(handler));
        self
    }

    /// Maximum number of retries
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Short name of an error variant
pub fn error_kind(error: &Error) -> &'static str {
    match error {
        Error::UrlParseError(_) => "url_parse",
        Error::Storage { .. } => "storage",
        Error::Pool { .. } => "pool",
        Error::Task { .. } => "task",
        Error::Timeout(_) => "timeout",
        Error::Config(_) => "config",
        Error::IoError(_) => "io",
        Error::SerdeError(_) => "serde",
        Error::Other { .. } => "other",
    }
}

#[async_trait]
impl ErrorHandler for DefaultErrorHandler {
    async fn handle_error(&self, error: &Error, request: &Request) -> Result<ErrorAction> {
        if let Some(handler) = self.custom_handlers.get(error_kind(error)) {
            return handler.handle_error(error, request).await;
        }

        if request.no_retry {
            return Ok(ErrorAction::GiveUp {
                reason: "Retries disabled for request".to_string(),
            });
        }

        if request.retry_count >= self.max_retries {
            return Ok(ErrorAction::GiveUp {
                reason: format!("Maximum retries ({}) reached", self.max_retries),
            });
        }

        if error.is_retryable() {
            Ok(ErrorAction::Retry {
                forefront: self.retry_forefront,
                reason: format!("Retrying after error: {}", error),
            })
        } else {
            Ok(ErrorAction::GiveUp {
                reason: format!("Non-retryable error: {}", error),
            })
        }
    }
}

impl Default for DefaultErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Error statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    /// Total number of errors
    pub total_errors: usize,

    /// Errors by kind
    pub errors_by_kind: HashMap<String, usize>,

    /// Number of retries
    pub retries: usize,

    /// Number of requests given up on
    pub give_ups: usize,

    /// Number of aborts
    pub aborts: usize,

    /// Errors by domain
    pub errors_by_domain: HashMap<String, usize>,
}

impl ErrorStats {
    /// Create a new error stats instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error raised for `request`
    pub fn record_error(&mut self, error: &Error, request: &Request) {
        self.total_errors += 1;
        *self
            .errors_by_kind
            .entry(error_kind(error).to_string())
            .or_insert(0) += 1;

        if let Some(domain) = request.url.host_str() {
            *self.errors_by_domain.entry(domain.to_string()).or_insert(0) += 1;
        }
    }

    /// Record an error action
    pub fn record_action(&mut self, action: &ErrorAction) {
        match action {
            ErrorAction::Retry { .. } => self.retries += 1,
            ErrorAction::GiveUp { .. } => self.give_ups += 1,
            ErrorAction::Abort { .. } => self.aborts += 1,
        }
    }

    /// Merge another error stats instance into this one
    pub fn merge(&mut self, other: &ErrorStats) {
        self.total_errors += other.total_errors;
        self.retries += other.retries;
        self.give_ups += other.give_ups;
        self.aborts += other.aborts;

        for (kind, count) in &other.errors_by_kind {
            *self.errors_by_kind.entry(kind.clone()).or_insert(0) += count;
        }

        for (domain, count) in &other.errors_by_domain {
            *self.errors_by_domain.entry(domain.clone()).or_insert(0) += count;
        }
    }
}

/// Runs the error handler and keeps statistics
pub struct ErrorManager {
    /// The error handler
    handler: Box<dyn ErrorHandler>,

    /// Error statistics
    stats: Arc<RwLock<ErrorStats>>,
}

impl ErrorManager {
    /// Create a new error manager with the given handler
    pub fn new<H: ErrorHandler + 'static>(handler: H) -> Self {
        Self {
            handler: Box::new(handler),
            stats: Arc::new(RwLock::new(ErrorStats::new())),
        }
    }

    /// Create a new error manager with the default handler
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self::new(DefaultErrorHandler::new().with_max_retries(max_retries))
    }

    /// Handle an error raised while processing `request`
    pub async fn handle_error(&self, error: &Error, request: &Request) -> Result<ErrorAction> {
        {
            let mut stats = self.stats.write().await;
            stats.record_error(error, request);
        }

        error!("Request {} failed: {}", request.url, error);

        let action = self.handler.handle_error(error, request).await?;

        {
            let mut stats = self.stats.write().await;
            stats.record_action(&action);
        }

        match &action {
            ErrorAction::Retry { reason, .. } => {
                warn!(
                    "Retrying request {} (attempt {}): {}",
                    request.url,
                    request.retry_count + 1,
                    reason
                );
            }
            ErrorAction::GiveUp { reason } => {
                warn!("Giving up on request {}: {}", request.url, reason);
            }
            ErrorAction::Abort { reason } => {
                error!("Aborting crawl: {}", reason);
            }
        }

        Ok(action)
    }

    /// Get the error statistics
    pub async fn stats(&self) -> ErrorStats {
        self.stats.read().await.clone()
    }

    /// Get a reference to the error statistics
    pub fn stats_ref(&self) -> Arc<RwLock<ErrorStats>> {
        self.stats.clone()
    }
}

impl Default for ErrorManager {
    fn default() -> Self {
        Self::new(DefaultErrorHandler::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AbortEverything;

    #[async_trait]
    impl ErrorHandler for AbortEverything {
        async fn handle_error(&self, error: &Error, _request: &Request) -> Result<ErrorAction> {
            Ok(ErrorAction::Abort {
                reason: error.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_retry_until_exhausted() {
        let handler = DefaultErrorHandler::new().with_max_retries(2);
        let mut request = Request::get("https://example.com/").unwrap();
        let error = Error::task("boom");

        let action = handler.handle_error(&error, &request).await.unwrap();
        assert!(matches!(action, ErrorAction::Retry { forefront: false, .. }));

        request.retry_count = 2;
        let action = handler.handle_error(&error, &request).await.unwrap();
        assert!(matches!(action, ErrorAction::GiveUp { .. }));
    }

    #[tokio::test]
    async fn test_no_retry_and_non_retryable() {
        let handler = DefaultErrorHandler::new();
        let request = Request::get("https://example.com/")
            .unwrap()
            .with_no_retry(true);
        let action = handler
            .handle_error(&Error::task("boom"), &request)
            .await
            .unwrap();
        assert!(matches!(action, ErrorAction::GiveUp { .. }));

        let request = Request::get("https://example.com/").unwrap();
        let action = handler
            .handle_error(&Error::config("x", "bad"), &request)
            .await
            .unwrap();
        assert!(matches!(action, ErrorAction::GiveUp { .. }));
    }

    #[tokio::test]
    async fn test_custom_handler_by_kind() {
        let handler = DefaultErrorHandler::new().with_custom_handler("timeout", AbortEverything);
        let request = Request::get("https://example.com/").unwrap();
        let action = handler
            .handle_error(&Error::Timeout(std::time::Duration::from_secs(1)), &request)
            .await
            .unwrap();
        assert!(matches!(action, ErrorAction::Abort { .. }));
    }

    #[tokio::test]
    async fn test_manager_records_stats() {
        let manager = ErrorManager::with_max_retries(1);
        let mut request = Request::get("https://example.com/").unwrap();

        manager
            .handle_error(&Error::task("first"), &request)
            .await
            .unwrap();
        request.retry_count = 1;
        manager
            .handle_error(&Error::task("second"), &request)
            .await
            .unwrap();

        let stats = manager.stats().await;
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.give_ups, 1);
        assert_eq!(stats.errors_by_kind.get("task"), Some(&2));
        assert_eq!(stats.errors_by_domain.get("example.com"), Some(&2));
    }
}
