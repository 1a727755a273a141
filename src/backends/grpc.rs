//! gRPC and Connect-protocol adapters.
//!
//! [`GrpcCaller`] wraps any tonic unary call; [`ConnectClient`] speaks the
//! Connect unary JSON protocol over reqwest. Both share one code table.

use std::collections::BTreeMap;
use std::future::Future;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tonic::{Code, Status};
use tracing::debug;

use crate::config::ToolkitConfig;
use crate::error::{Classify, Error, ErrorKind};
use crate::expect::{contains_subset, find_mismatch, Expectation};
use crate::policy::{settle, CallOptions, ClientDefaults, Resolved};
use crate::result::{OpResult, ResultKind, StringMap};

/// RPC failures are returned as failure results by default.
pub const THROWS_BY_DEFAULT: bool = false;

/// Header carrying the Connect protocol version.
pub const CONNECT_PROTOCOL_VERSION: &str = "connect-protocol-version";

/// Header carrying the caller's deadline in milliseconds.
pub const CONNECT_TIMEOUT_MS: &str = "connect-timeout-ms";

/// Classify a gRPC status code.
pub fn classify_grpc_code(code: Code) -> ErrorKind {
    match code {
        Code::Cancelled => ErrorKind::Cancelled,
        Code::InvalidArgument | Code::OutOfRange => ErrorKind::QuerySyntax,
        Code::DeadlineExceeded => ErrorKind::Timeout,
        Code::NotFound => ErrorKind::NotFound,
        Code::AlreadyExists | Code::FailedPrecondition => ErrorKind::ConstraintViolation,
        Code::Aborted => ErrorKind::SerializationConflict,
        Code::PermissionDenied => ErrorKind::PermissionDenied,
        Code::ResourceExhausted => ErrorKind::ResourceExhausted,
        Code::Unauthenticated => ErrorKind::Unauthenticated,
        Code::Unavailable => ErrorKind::Unavailable,
        Code::Internal | Code::DataLoss | Code::Unimplemented => ErrorKind::Internal,
        Code::Ok | Code::Unknown => ErrorKind::Unknown,
    }
}

/// Connect wire name of a gRPC code (`not_found`, `deadline_exceeded`, ...).
pub fn grpc_code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "ok",
        Code::Cancelled => "canceled",
        Code::Unknown => "unknown",
        Code::InvalidArgument => "invalid_argument",
        Code::DeadlineExceeded => "deadline_exceeded",
        Code::NotFound => "not_found",
        Code::AlreadyExists => "already_exists",
        Code::PermissionDenied => "permission_denied",
        Code::ResourceExhausted => "resource_exhausted",
        Code::FailedPrecondition => "failed_precondition",
        Code::Aborted => "aborted",
        Code::OutOfRange => "out_of_range",
        Code::Unimplemented => "unimplemented",
        Code::Internal => "internal",
        Code::Unavailable => "unavailable",
        Code::DataLoss => "data_loss",
        Code::Unauthenticated => "unauthenticated",
    }
}

fn parse_connect_code(code: &str) -> Option<Code> {
    let code = match code {
        "canceled" | "cancelled" => Code::Cancelled,
        "unknown" => Code::Unknown,
        "invalid_argument" => Code::InvalidArgument,
        "deadline_exceeded" => Code::DeadlineExceeded,
        "not_found" => Code::NotFound,
        "already_exists" => Code::AlreadyExists,
        "permission_denied" => Code::PermissionDenied,
        "resource_exhausted" => Code::ResourceExhausted,
        "failed_precondition" => Code::FailedPrecondition,
        "aborted" => Code::Aborted,
        "out_of_range" => Code::OutOfRange,
        "unimplemented" => Code::Unimplemented,
        "internal" => Code::Internal,
        "unavailable" => Code::Unavailable,
        "data_loss" => Code::DataLoss,
        "unauthenticated" => Code::Unauthenticated,
        _ => return None,
    };
    Some(code)
}

/// Classify a Connect error code string.
pub fn classify_connect_code(code: &str) -> ErrorKind {
    parse_connect_code(code)
        .map(classify_grpc_code)
        .unwrap_or(ErrorKind::Unknown)
}

/// Connect code implied by an HTTP status when the body carries none.
fn connect_code_for_status(status: u16) -> &'static str {
    match status {
        400 => "internal",
        401 => "unauthenticated",
        403 => "permission_denied",
        404 => "unimplemented",
        429 | 502 | 503 | 504 => "unavailable",
        _ => "unknown",
    }
}

impl Classify for Status {
    fn classify(self) -> Error {
        let code = self.code();
        Error::new(classify_grpc_code(code), self.message().to_string())
            .with_code(grpc_code_name(code))
            .with_cause(self)
    }
}

/// Unary RPC response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrpcPayload<T> {
    pub message: T,
    /// Response metadata (headers), names lowercased.
    pub metadata: StringMap,
}

// ============================================================================
// tonic
// ============================================================================

/// Runs tonic unary calls through the shared pipeline.
///
/// ```rust,ignore
/// let caller = GrpcCaller::new(ClientDefaults::default());
/// let mut client = GreeterClient::connect("http://localhost:50051").await?;
/// let result = caller
///     .unary(client.say_hello(HelloRequest { name: "x".into() }), &CallOptions::new())
///     .await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct GrpcCaller {
    defaults: ClientDefaults,
}

impl GrpcCaller {
    pub fn new(defaults: ClientDefaults) -> Self {
        Self { defaults }
    }

    pub fn from_config(config: &ToolkitConfig) -> Self {
        Self::new(config.connect_defaults())
    }

    pub async fn unary<T, F>(
        &self,
        call_future: F,
        call: &CallOptions,
    ) -> Result<OpResult<GrpcPayload<T>>, Error>
    where
        F: Future<Output = Result<tonic::Response<T>, Status>>,
    {
        let opts = Resolved::new(call, &self.defaults, THROWS_BY_DEFAULT);
        settle(ResultKind::Call, &opts, async move {
            let response = call_future.await?;
            let metadata = response
                .metadata()
                .clone()
                .into_headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect();
            Ok::<_, Status>(GrpcPayload {
                message: response.into_inner(),
                metadata,
            })
        })
        .await
    }
}

// ============================================================================
// Connect
// ============================================================================

/// Connect JSON error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ConnectError {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<Value>,
}

impl Classify for ConnectError {
    fn classify(self) -> Error {
        let mut error =
            Error::new(classify_connect_code(&self.code), self.message.clone()).with_code(&self.code);
        for detail in &self.details {
            error = error.with_detail(detail.clone());
        }
        error.with_cause(self)
    }
}

/// Native failure of one Connect call.
#[derive(Debug, thiserror::Error)]
pub enum ConnectFailure {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {error}")]
    Rpc { status: u16, error: ConnectError },
}

impl Classify for ConnectFailure {
    fn classify(self) -> Error {
        match self {
            ConnectFailure::Transport(err) => err.classify(),
            ConnectFailure::Rpc { status, error } => error.classify().with_status(status),
        }
    }
}

/// Connect-protocol unary client speaking JSON.
#[derive(Debug, Clone)]
pub struct ConnectClient {
    client: Client,
    base_url: String,
    headers: BTreeMap<String, String>,
    defaults: ClientDefaults,
}

impl ConnectClient {
    pub fn new(base_url: &str, defaults: ClientDefaults) -> Result<Self, Error> {
        let client = Client::builder().build().map_err(Classify::classify)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers: BTreeMap::new(),
            defaults,
        })
    }

    /// Build from the `connect` configuration section.
    pub fn from_config(config: &ToolkitConfig) -> Result<Self, Error> {
        let base_url = config
            .connect
            .base_url
            .as_deref()
            .ok_or_else(|| Error::new(ErrorKind::Connection, "connect.base_url is not configured"))?;
        let mut client = Self::new(base_url, config.connect_defaults())?;
        client.headers = config.connect.headers.clone();
        Ok(client)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Procedure URL: `{base}/{package.Service}/{Method}`.
    pub fn procedure_url(&self, service: &str, method: &str) -> String {
        format!("{}/{}/{}", self.base_url, service, method)
    }

    /// Unary call with a JSON request message.
    pub async fn call<Req: Serialize>(
        &self,
        service: &str,
        method: &str,
        request: &Req,
        call: &CallOptions,
    ) -> Result<OpResult<GrpcPayload<Value>>, Error> {
        let opts = Resolved::new(call, &self.defaults, THROWS_BY_DEFAULT);
        let url = self.procedure_url(service, method);

        let mut builder = self
            .client
            .post(&url)
            .header(CONNECT_PROTOCOL_VERSION, "1")
            .json(request);
        if let Some(timeout) = opts.timeout {
            builder = builder.header(CONNECT_TIMEOUT_MS, timeout.as_millis().to_string());
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        debug!(url = %url, "sending Connect request");
        settle(ResultKind::Call, &opts, async move {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let metadata: StringMap = response
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

            if status != 200 {
                let error = serde_json::from_slice::<ConnectError>(&body).unwrap_or_else(|_| {
                    ConnectError {
                        code: connect_code_for_status(status).to_string(),
                        message: String::from_utf8_lossy(&body).into_owned(),
                        details: Vec::new(),
                    }
                });
                return Err(ConnectFailure::Rpc { status, error });
            }

            let message = if body.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_slice(&body).map_err(|err| ConnectFailure::Rpc {
                    status,
                    error: ConnectError {
                        code: "internal".to_string(),
                        message: format!("invalid JSON response: {}", err),
                        details: Vec::new(),
                    },
                })?
            };
            Ok::<_, ConnectFailure>(GrpcPayload { message, metadata })
        })
        .await
    }
}

impl<T: Serialize> Expectation<'_, GrpcPayload<T>> {
    /// Deep-subset check of the response message's JSON form.
    #[track_caller]
    pub fn data_contains(self, expected: Value) -> Self {
        let actual = serde_json::to_value(&self.payload().message).unwrap_or(Value::Null);
        if !contains_subset(&actual, &expected) {
            let mismatch = find_mismatch(&actual, &expected)
                .map(|m| m.to_string())
                .unwrap_or_default();
            panic!("Expected data containing {}, {}", expected, mismatch);
        }
        self
    }

    #[track_caller]
    pub fn metadata(self, name: &str, expected: &str) -> Self {
        match self.payload().metadata.get(&name.to_ascii_lowercase()) {
            Some(actual) if actual == expected => self,
            Some(actual) => panic!(
                "Expected metadata {} to be {:?}, got {:?}",
                name, expected, actual
            ),
            None => panic!("Expected metadata {}, got none", name),
        }
    }
}
