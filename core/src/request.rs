use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use url::Url;

use crate::error::{Error, Result};

/// Length of request ids derived from unique keys
pub const REQUEST_ID_LENGTH: usize = 15;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Method {
    #[default]
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        };
        f.write_str(name)
    }
}

/// A unit of work stored in a request queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Id of the stored request, filled in by the queue. Informational only:
    /// the queue always keys requests by [`Request::request_id`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Deduplication key
    pub unique_key: String,

    /// The URL to request
    pub url: Url,

    /// The HTTP method to use
    #[serde(default)]
    pub method: Method,

    /// HTTP headers to include
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body (for POST, PUT, etc.)
    #[serde(default)]
    pub payload: Option<Vec<u8>>,

    /// Opaque data the caller round-trips through the queue
    #[serde(default)]
    pub user_data: serde_json::Map<String, serde_json::Value>,

    /// Number of failed processing attempts so far
    #[serde(default)]
    pub retry_count: u32,

    /// If set, failures are never retried
    #[serde(default)]
    pub no_retry: bool,

    /// Error messages collected from failed attempts
    #[serde(default)]
    pub error_messages: Vec<String>,

    /// When the request was marked handled; `None` while pending
    #[serde(default)]
    pub handled_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Create a new GET request
    pub fn get<U: AsRef<str>>(url: U) -> Result<Self> {
        Self::new(url, Method::GET)
    }

    /// Create a new POST request
    pub fn post<U: AsRef<str>, B: Into<Vec<u8>>>(url: U, body: B) -> Result<Self> {
        let mut request = Self::new(url, Method::POST)?;
        request.payload = Some(body.into());
        Ok(request)
    }

    /// Create a request whose unique key is the normalized URL
    pub fn new<U: AsRef<str>>(url: U, method: Method) -> Result<Self> {
        let url = Url::parse(url.as_ref().trim()).map_err(Error::UrlParseError)?;
        let unique_key = normalize_url(&url, false);
        Ok(Self {
            id: None,
            unique_key,
            url,
            method,
            headers: HashMap::new(),
            payload: None,
            user_data: serde_json::Map::new(),
            retry_count: 0,
            no_retry: false,
            error_messages: Vec::new(),
            handled_at: None,
        })
    }

    /// Override the unique key
    pub fn with_unique_key<K: Into<String>>(mut self, unique_key: K) -> Self {
        self.unique_key = unique_key.into();
        self.id = None;
        self
    }

    /// Keep the URL fragment as part of the unique key
    pub fn with_keep_url_fragment(mut self) -> Self {
        self.unique_key = normalize_url(&self.url, true);
        self.id = None;
        self
    }

    /// Make the unique key depend on method and payload as well as the URL
    pub fn with_extended_unique_key(mut self) -> Self {
        let payload_hash = self
            .payload
            .as_deref()
            .map(|payload| hash_payload(payload))
            .unwrap_or_default();
        self.unique_key = format!(
            "{}({}):{}",
            self.method,
            payload_hash,
            normalize_url(&self.url, false)
        );
        self.id = None;
        self
    }

    /// Set the request body
    pub fn with_payload<B: Into<Vec<u8>>>(mut self, payload: B) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Add a header to the request
    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Add user data to the request
    pub fn with_user_data<K: Into<String>, V: Into<serde_json::Value>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.user_data.insert(key.into(), value.into());
        self
    }

    /// Disable retries for this request
    pub fn with_no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }

    /// Mark the request as already handled (for importing finished work)
    pub fn with_handled_at(mut self, handled_at: DateTime<Utc>) -> Self {
        self.handled_at = Some(handled_at);
        self
    }

    /// The id of this request, always derived from the current unique key
    pub fn request_id(&self) -> String {
        unique_key_to_request_id(&self.unique_key)
    }

    /// Whether the request has been handled
    pub fn is_handled(&self) -> bool {
        self.handled_at.is_some()
    }

    /// Record the message of a failed attempt
    pub fn push_error_message<M: Into<String>>(&mut self, message: M) {
        self.error_messages.push(message.into());
    }
}

/// Derive the stable request id for a unique key.
///
/// The id is the base64 encoded SHA-256 digest with `+`, `/` and `=` removed,
/// truncated to [`REQUEST_ID_LENGTH`] characters. Independent processes always
/// compute the same id for the same key.
pub fn unique_key_to_request_id(unique_key: &str) -> String {
    let digest = Sha256::digest(unique_key.as_bytes());
    STANDARD
        .encode(digest)
        .chars()
        .filter(|c| !matches!(c, '+' | '/' | '='))
        .take(REQUEST_ID_LENGTH)
        .collect()
}

/// Short hash of a request payload used in extended unique keys
pub fn hash_payload(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    STANDARD
        .encode(digest)
        .chars()
        .filter(|c| !matches!(c, '+' | '/' | '='))
        .take(8)
        .collect()
}

/// Normalize a URL for use as a unique key.
///
/// Scheme and host are lower-cased by the parser, `utm_*` tracking parameters
/// are dropped, the remaining query parameters are sorted, the trailing slash
/// of the path is removed and the fragment is dropped unless `keep_fragment`.
pub fn normalize_url(url: &Url, keep_fragment: bool) -> String {
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !key.starts_with("utm_"))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    params.sort();

    let mut normalized = format!("{}://", url.scheme());
    if let Some(host) = url.host_str() {
        normalized.push_str(&host.to_lowercase());
    }
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(url.path().trim_end_matches('/'));

    if !params.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .finish();
        normalized.push('?');
        normalized.push_str(&query);
    }

    if keep_fragment {
        if let Some(fragment) = url.fragment() {
            normalized.push('#');
            normalized.push_str(fragment);
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_get() {
        let req = Request::get("https://example.com").unwrap();
        assert_eq!(req.url.as_str(), "https://example.com/");
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.unique_key, "https://example.com");
        assert!(req.payload.is_none());
        assert!(!req.is_handled());
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let error = tokio_test::assert_err!(Request::get("not a url"));
        assert!(matches!(error, crate::error::Error::UrlParseError(_)));
        tokio_test::assert_ok!(Request::get("http://localhost:8080/path"));
    }

    #[test]
    fn test_request_post() {
        let body = "test body";
        let req = Request::post("https://example.com", body).unwrap();
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.payload.unwrap(), body.as_bytes());
    }

    #[test]
    fn test_normalize_url() {
        let url = Url::parse(
            "HTTPS://Example.COM/Path/?b=2&utm_source=x&a=1#section",
        )
        .unwrap();
        assert_eq!(normalize_url(&url, false), "https://example.com/Path?a=1&b=2");
        assert_eq!(
            normalize_url(&url, true),
            "https://example.com/Path?a=1&b=2#section"
        );
    }

    #[test]
    fn test_equivalent_urls_share_unique_key() {
        let a = Request::get("https://example.com/page?x=1&y=2").unwrap();
        let b = Request::get("https://EXAMPLE.com/page/?y=2&x=1#top").unwrap();
        assert_eq!(a.unique_key, b.unique_key);
        assert_eq!(a.request_id(), b.request_id());
    }

    #[test]
    fn test_request_id_is_stable_and_truncated() {
        let id = unique_key_to_request_id("https://example.com");
        assert_eq!(id.len(), REQUEST_ID_LENGTH);
        assert_eq!(id, unique_key_to_request_id("https://example.com"));
        assert_ne!(id, unique_key_to_request_id("https://example.org"));
        assert!(id.chars().all(|c| c != '+' && c != '/' && c != '='));
    }

    #[test]
    fn test_extended_unique_key() {
        let get = Request::get("https://example.com/api")
            .unwrap()
            .with_extended_unique_key();
        assert_eq!(get.unique_key, "GET():https://example.com/api");

        let post = Request::post("https://example.com/api", "{\"q\":1}")
            .unwrap()
            .with_extended_unique_key();
        assert!(post.unique_key.starts_with("POST("));
        assert_ne!(post.request_id(), get.request_id());
    }

    #[test]
    fn test_request_with_user_data() {
        let req = Request::get("https://example.com")
            .unwrap()
            .with_user_data("depth", 2);

        assert_eq!(req.user_data.get("depth").unwrap(), &serde_json::json!(2));
    }

    #[test]
    fn test_custom_unique_key_resets_id() {
        let mut req = Request::get("https://example.com").unwrap();
        req.id = Some("stale".to_string());
        let req = req.with_unique_key("custom");
        assert_eq!(req.request_id(), unique_key_to_request_id("custom"));
    }

    #[test]
    fn test_carried_id_does_not_override_unique_key() {
        let mut req = Request::get("https://example.com/a").unwrap();
        req.id = Some("somethingelse00".to_string());
        assert_eq!(req.request_id(), unique_key_to_request_id(&req.unique_key));

        req.unique_key = "https://example.com/b".to_string();
        assert_eq!(req.request_id(), unique_key_to_request_id("https://example.com/b"));
    }

    #[test]
    fn test_serde_uses_camel_case() {
        let req = Request::get("https://example.com").unwrap();
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("uniqueKey").is_some());
        assert!(value.get("retryCount").is_some());
        let back: Request = serde_json::from_value(value).unwrap();
        assert_eq!(back, req);
    }
}
