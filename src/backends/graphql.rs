//! GraphQL adapter over `reqwest`.
//!
//! Operations are POSTed as `{query, variables, operationName}` JSON. A
//! response whose `errors` array is non-empty is a failure even when partial
//! `data` came back; the first error's `extensions.code` decides the kind.
//! Without an `errors` array, non-2xx statuses classify like plain HTTP.

use std::collections::BTreeMap;
use std::fmt::Display;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::backends::http::classify_http_status;
use crate::config::ToolkitConfig;
use crate::error::{Classify, Error, ErrorKind};
use crate::expect::{contains_subset, find_mismatch, Expectation, Inspect};
use crate::policy::{settle, CallOptions, ClientDefaults, Resolved};
use crate::result::{OpResult, ResultKind};

/// GraphQL errors are returned as failure results by default.
pub const THROWS_BY_DEFAULT: bool = false;

/// Classify a GraphQL `extensions.code` value.
///
/// Covers the codes used by Apollo, Hasura and async-graphql servers.
pub fn classify_graphql_code(code: &str) -> ErrorKind {
    match code.to_ascii_uppercase().as_str() {
        "GRAPHQL_PARSE_FAILED" | "GRAPHQL_VALIDATION_FAILED" | "BAD_USER_INPUT"
        | "BAD_REQUEST" | "VALIDATION-FAILED" | "PARSE-FAILED" => ErrorKind::QuerySyntax,
        "UNAUTHENTICATED" | "INVALID-JWT" => ErrorKind::Unauthenticated,
        "FORBIDDEN" | "ACCESS-DENIED" | "PERMISSION-ERROR" => ErrorKind::PermissionDenied,
        "NOT_FOUND" | "PERSISTED_QUERY_NOT_FOUND" | "NOT-FOUND" => ErrorKind::NotFound,
        "CONSTRAINT-VIOLATION" | "CONFLICT" => ErrorKind::ConstraintViolation,
        "TIMEOUT" => ErrorKind::Timeout,
        "RATE_LIMITED" | "TOO_MANY_REQUESTS" => ErrorKind::ResourceExhausted,
        "SERVICE_UNAVAILABLE" => ErrorKind::Unavailable,
        "INTERNAL_SERVER_ERROR" | "UNEXPECTED" => ErrorKind::Internal,
        _ => ErrorKind::Unknown,
    }
}

/// One entry of a response's `errors` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct GraphqlError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphqlError {
    /// `extensions.code`, when the server set one.
    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
    #[serde(default)]
    extensions: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphqlRequest<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    variables: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation_name: Option<&'a str>,
}

fn join_messages(errors: &[GraphqlError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Native failure of one GraphQL exchange.
#[derive(Debug, thiserror::Error)]
pub enum GraphqlFailure {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{}", join_messages(.errors))]
    Errors {
        status: u16,
        errors: Vec<GraphqlError>,
        data: Option<Value>,
    },
}

impl Classify for GraphqlFailure {
    fn classify(self) -> Error {
        match self {
            GraphqlFailure::Transport(err) => err.classify(),
            GraphqlFailure::Status { status, ref body } => {
                let mut error =
                    Error::new(classify_http_status(status), format!("HTTP {}", status))
                        .with_status(status);
                if !body.is_empty() {
                    let detail = serde_json::from_str(body)
                        .unwrap_or_else(|_| Value::String(body.clone()));
                    error = error.with_detail(detail);
                }
                error.with_cause(self)
            }
            GraphqlFailure::Errors {
                status,
                ref errors,
                ..
            } => {
                let code = errors.iter().find_map(GraphqlError::code);
                let kind = match code {
                    Some(code) => classify_graphql_code(code),
                    None if !(200..300).contains(&status) => classify_http_status(status),
                    None => ErrorKind::Unknown,
                };
                let mut error = Error::new(kind, self.to_string()).with_status(status);
                if let Some(code) = code {
                    error = error.with_code(code);
                }
                for entry in errors {
                    let detail = serde_json::to_value(entry).unwrap_or(Value::Null);
                    error = error.with_detail(detail);
                }
                error.with_cause(self)
            }
        }
    }
}

/// Successful GraphQL response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphqlPayload {
    pub status: u16,
    pub data: Value,
    pub extensions: Option<Value>,
}

/// GraphQL client bound to one endpoint.
#[derive(Debug, Clone)]
pub struct GraphqlClient {
    client: Client,
    endpoint: String,
    headers: BTreeMap<String, String>,
    defaults: ClientDefaults,
}

impl GraphqlClient {
    pub fn new(endpoint: &str, defaults: ClientDefaults) -> Result<Self, Error> {
        let client = Client::builder().build().map_err(Classify::classify)?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            headers: BTreeMap::new(),
            defaults,
        })
    }

    /// Build from the `graphql` configuration section.
    pub fn from_config(config: &ToolkitConfig) -> Result<Self, Error> {
        let endpoint = config
            .graphql
            .endpoint
            .as_deref()
            .ok_or_else(|| Error::new(ErrorKind::Connection, "graphql.endpoint is not configured"))?;
        let mut client = Self::new(endpoint, config.graphql_defaults())?;
        client.headers = config.graphql.headers.clone();
        Ok(client)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Run a query or mutation. Pass `Value::Null` for no variables.
    pub async fn query(
        &self,
        document: &str,
        variables: Value,
        call: &CallOptions,
    ) -> Result<OpResult<GraphqlPayload>, Error> {
        self.send(document, None, variables, call).await
    }

    /// Run one named operation from a document holding several.
    pub async fn operation(
        &self,
        document: &str,
        operation_name: &str,
        variables: Value,
        call: &CallOptions,
    ) -> Result<OpResult<GraphqlPayload>, Error> {
        self.send(document, Some(operation_name), variables, call)
            .await
    }

    async fn send(
        &self,
        document: &str,
        operation_name: Option<&str>,
        variables: Value,
        call: &CallOptions,
    ) -> Result<OpResult<GraphqlPayload>, Error> {
        let opts = Resolved::new(call, &self.defaults, THROWS_BY_DEFAULT);

        let mut builder = self.client.post(&self.endpoint).json(&GraphqlRequest {
            query: document,
            variables,
            operation_name,
        });
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        debug!(endpoint = %self.endpoint, operation = ?operation_name, "sending GraphQL request");
        settle(ResultKind::Query, &opts, async move {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.bytes().await?;

            let parsed = serde_json::from_slice::<GraphqlResponse>(&body);
            match parsed {
                Ok(parsed) if !parsed.errors.is_empty() => Err(GraphqlFailure::Errors {
                    status,
                    errors: parsed.errors,
                    data: parsed.data,
                }),
                Ok(parsed) if (200..300).contains(&status) => Ok(GraphqlPayload {
                    status,
                    data: parsed.data.unwrap_or(Value::Null),
                    extensions: parsed.extensions,
                }),
                _ if (200..300).contains(&status) => Err(GraphqlFailure::Errors {
                    status,
                    errors: vec![GraphqlError {
                        message: "response is not a GraphQL result".to_string(),
                        path: Vec::new(),
                        extensions: Some(serde_json::json!({"code": "INTERNAL_SERVER_ERROR"})),
                    }],
                    data: None,
                }),
                _ => Err(GraphqlFailure::Status {
                    status,
                    body: String::from_utf8_lossy(&body).into_owned(),
                }),
            }
        })
        .await
    }
}

// ============================================================================
// Assertions
// ============================================================================

impl Inspect for GraphqlPayload {
    const NOUN: &'static str = "fields";

    fn item_count(&self) -> usize {
        match &self.data {
            Value::Object(fields) => fields.values().filter(|v| !v.is_null()).count(),
            Value::Null => 0,
            _ => 1,
        }
    }

    fn items(&self) -> Vec<Value> {
        match &self.data {
            Value::Object(fields) => fields.values().filter(|v| !v.is_null()).cloned().collect(),
            Value::Null => Vec::new(),
            data => vec![data.clone()],
        }
    }
}

impl Expectation<'_, GraphqlPayload> {
    /// Deep-subset check of `data`.
    #[track_caller]
    pub fn data_contains(self, expected: Value) -> Self {
        let data = &self.payload().data;
        if !contains_subset(data, &expected) {
            let mismatch = find_mismatch(data, &expected)
                .map(|m| m.to_string())
                .unwrap_or_default();
            panic!("Expected data containing {}, {}", expected, mismatch);
        }
        self
    }

    #[track_caller]
    pub fn data_match<F, E>(self, matcher: F) -> Self
    where
        F: FnOnce(&Value) -> Result<(), E>,
        E: Display,
    {
        if let Err(err) = matcher(&self.payload().data) {
            panic!("{}", err);
        }
        self
    }
}
