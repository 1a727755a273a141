//! HTTP adapter over `reqwest`.
//!
//! Any received response settles the call. 2xx responses are successes;
//! other statuses become `HttpFailure::Status` failures carrying the status
//! and body, returned as failure results unless the policy throws.

use std::collections::BTreeMap;
use std::fmt::Display;

use bytes::Bytes;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::ToolkitConfig;
use crate::error::{Classify, Error, ErrorKind};
use crate::expect::{contains_subset, find_mismatch, Expectation, Inspect};
use crate::policy::{settle, CallOptions, ClientDefaults, Resolved};
use crate::result::{OpResult, ResultKind, StringMap};

/// HTTP returns non-2xx responses as failure results by default.
pub const THROWS_BY_DEFAULT: bool = false;

/// Classify an HTTP status code.
pub fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        400 | 422 => ErrorKind::QuerySyntax,
        401 => ErrorKind::Unauthenticated,
        403 => ErrorKind::PermissionDenied,
        404 | 410 => ErrorKind::NotFound,
        408 | 504 => ErrorKind::Timeout,
        409 => ErrorKind::ConstraintViolation,
        412 => ErrorKind::SerializationConflict,
        413 | 429 => ErrorKind::ResourceExhausted,
        499 => ErrorKind::Cancelled,
        502 | 503 => ErrorKind::Unavailable,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Unknown,
    }
}

impl Classify for reqwest::Error {
    fn classify(self) -> Error {
        let kind = if self.is_timeout() {
            ErrorKind::Timeout
        } else if self.is_connect() || self.is_request() {
            ErrorKind::Connection
        } else if let Some(status) = self.status() {
            classify_http_status(status.as_u16())
        } else if self.is_decode() || self.is_body() {
            ErrorKind::Internal
        } else {
            ErrorKind::Unknown
        };

        let mut error = Error::new(kind, self.to_string());
        if let Some(status) = self.status() {
            error = error.with_status(status.as_u16());
        }
        error.with_cause(self)
    }
}

/// Native failure of one HTTP exchange.
#[derive(Debug, thiserror::Error)]
pub enum HttpFailure {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl Classify for HttpFailure {
    fn classify(self) -> Error {
        match self {
            HttpFailure::Transport(err) => err.classify(),
            HttpFailure::Status { status, ref body } => {
                let mut error = Error::new(classify_http_status(status), format!("HTTP {}", status))
                    .with_status(status);
                if !body.is_empty() {
                    let detail = serde_json::from_str(body)
                        .unwrap_or_else(|_| Value::String(body.clone()));
                    error = error.with_detail(detail);
                }
                error.with_cause(self)
            }
        }
    }
}

/// Successful HTTP response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpPayload {
    pub status: u16,
    /// Response headers, names lowercased.
    pub headers: StringMap,
    #[serde(skip)]
    pub body: Bytes,
    /// Body parsed as JSON, when it is JSON.
    pub data: Option<Value>,
}

impl HttpPayload {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// HTTP client bound to an optional base URL.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: Option<String>,
    headers: BTreeMap<String, String>,
    defaults: ClientDefaults,
}

impl HttpClient {
    pub fn new(base_url: Option<&str>, defaults: ClientDefaults) -> Result<Self, Error> {
        let client = Client::builder().build().map_err(Classify::classify)?;
        Ok(Self {
            client,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
            headers: BTreeMap::new(),
            defaults,
        })
    }

    /// Build from the `http` configuration section.
    pub fn from_config(config: &ToolkitConfig) -> Result<Self, Error> {
        let mut client = Self::new(config.http.base_url.as_deref(), config.http_defaults())?;
        client.headers = config.http.headers.clone();
        Ok(client)
    }

    /// Add a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn defaults(&self) -> &ClientDefaults {
        &self.defaults
    }

    /// Resolve `path` against the base URL; absolute URLs pass through.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        match &self.base_url {
            Some(base) => format!("{}/{}", base, path.trim_start_matches('/')),
            None => path.to_string(),
        }
    }

    pub fn request(&self, method: Method, path: &str) -> HttpRequest<'_> {
        HttpRequest {
            client: self,
            method,
            url: self.url(path),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            call: CallOptions::default(),
        }
    }

    pub fn get(&self, path: &str) -> HttpRequest<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> HttpRequest<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> HttpRequest<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: &str) -> HttpRequest<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: &str) -> HttpRequest<'_> {
        self.request(Method::DELETE, path)
    }
}

#[derive(Debug, Clone)]
enum Body {
    Json(Value),
    Text(String),
}

/// One pending request.
#[derive(Debug)]
pub struct HttpRequest<'c> {
    client: &'c HttpClient,
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Option<Body>,
    call: CallOptions,
}

impl HttpRequest<'_> {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = Some(Body::Text(body.into()));
        self
    }

    /// Per-call timeout, signal and throw policy.
    pub fn options(mut self, call: CallOptions) -> Self {
        self.call = call;
        self
    }

    pub async fn send(self) -> Result<OpResult<HttpPayload>, Error> {
        let opts = Resolved::new(&self.call, &self.client.defaults, THROWS_BY_DEFAULT);

        let mut request = self
            .client
            .client
            .request(self.method.clone(), &self.url)
            .query(&self.query);
        for (name, value) in self.client.headers.iter() {
            request = request.header(name.as_str(), value.as_str());
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = match self.body {
            Some(Body::Json(body)) => request.json(&body),
            Some(Body::Text(body)) => request.body(body),
            None => request,
        };

        debug!(method = %self.method, url = %self.url, "sending HTTP request");
        settle(ResultKind::Request, &opts, async move {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect();
            let body = response.bytes().await?;

            if !(200..300).contains(&status) {
                return Err(HttpFailure::Status {
                    status,
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }

            let data = if body.is_empty() {
                None
            } else {
                serde_json::from_slice(&body).ok()
            };
            Ok::<_, HttpFailure>(HttpPayload {
                status,
                headers,
                body,
                data,
            })
        })
        .await
    }
}

// ============================================================================
// Assertions
// ============================================================================

impl Inspect for HttpPayload {
    const NOUN: &'static str = "items";

    fn item_count(&self) -> usize {
        match &self.data {
            Some(Value::Array(items)) => items.len(),
            Some(_) => 1,
            None => usize::from(!self.body.is_empty()),
        }
    }

    fn items(&self) -> Vec<Value> {
        match &self.data {
            Some(Value::Array(items)) => items.clone(),
            Some(data) => vec![data.clone()],
            None if self.body.is_empty() => Vec::new(),
            None => vec![Value::String(self.text())],
        }
    }
}

impl Expectation<'_, HttpPayload> {
    /// Checks the response status; non-2xx failures are matched by the
    /// status recorded on the error.
    #[track_caller]
    pub fn status(self, expected: u16) -> Self {
        let result = self.result();
        let actual = match (result.payload(), result.error()) {
            (Some(payload), _) => Some(payload.status),
            (None, Some(error)) => error.details().status,
            (None, None) => None,
        };
        match actual {
            Some(actual) if actual == expected => self,
            Some(actual) => panic!("Expected status {}, got {}", expected, actual),
            None => panic!("Expected status {}, got no response", expected),
        }
    }

    #[track_caller]
    pub fn header(self, name: &str, expected: &str) -> Self {
        match self.payload().header(name) {
            Some(actual) if actual == expected => self,
            Some(actual) => panic!(
                "Expected header {} to be {:?}, got {:?}",
                name, expected, actual
            ),
            None => panic!("Expected header {}, got none", name),
        }
    }

    /// Deep-subset check of the JSON body.
    #[track_caller]
    pub fn data_contains(self, expected: Value) -> Self {
        match &self.payload().data {
            Some(data) if contains_subset(data, &expected) => self,
            Some(data) => {
                let mismatch = find_mismatch(data, &expected)
                    .map(|m| m.to_string())
                    .unwrap_or_default();
                panic!("Expected data containing {}, {}", expected, mismatch)
            }
            None => panic!("Expected data containing {}, got no JSON body", expected),
        }
    }

    #[track_caller]
    pub fn text_contains(self, needle: &str) -> Self {
        let text = self.payload().text();
        if !text.contains(needle) {
            panic!("Expected body to contain {:?}, got {:?}", needle, text);
        }
        self
    }

    #[track_caller]
    pub fn data_match<F, E>(self, matcher: F) -> Self
    where
        F: FnOnce(&Value) -> Result<(), E>,
        E: Display,
    {
        let data = self.payload().data.as_ref().unwrap_or(&Value::Null);
        if let Err(err) = matcher(data) {
            panic!("{}", err);
        }
        self
    }
}
