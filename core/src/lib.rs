pub mod client_load;
pub mod error;
pub mod error_handler;
pub mod request;

pub use client_load::{ClientLoad, ClientLoadCounters};
pub use error::{ConfigError, Error, ErrorContext, Result, StorageError};
pub use error_handler::{
    error_kind, DefaultErrorHandler, ErrorAction, ErrorHandler, ErrorManager, ErrorStats,
};
pub use request::{normalize_url, unique_key_to_request_id, Method, Request, REQUEST_ID_LENGTH};

/// Re-export commonly used crates
pub use async_trait::async_trait;
pub use chrono;
pub use serde;
pub use serde_json;
pub use url;
