//! Wire transport for the GraphQL query API.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};

use crate::error::QueryError;

/// Executes one query document and returns its `data` payload.
///
/// Implementations map GraphQL `errors[]` to [`QueryError::Api`].
#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn execute(&self, document: &str, variables: Value) -> Result<Value, QueryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpFailureKind {
    Timeout,
    RateLimited,
    Hard,
}

fn classify_status(code: u16) -> HttpFailureKind {
    match code {
        429 => HttpFailureKind::RateLimited,
        408 | 504 => HttpFailureKind::Timeout,
        _ => HttpFailureKind::Hard,
    }
}

fn classify_ureq_failure(error: &ureq::Error) -> HttpFailureKind {
    match error {
        ureq::Error::Status(code, _) => classify_status(*code),
        ureq::Error::Transport(transport) => {
            let lowered = transport.to_string().to_ascii_lowercase();
            if lowered.contains("timed out") || lowered.contains("timeout") {
                HttpFailureKind::Timeout
            } else {
                HttpFailureKind::Hard
            }
        }
    }
}

/// Splits a GraphQL response into its data or its error messages.
pub(crate) fn decode_graphql_payload(payload: Value) -> Result<Value, QueryError> {
    if let Some(errors) = payload.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let messages = errors
                .iter()
                .map(|error| {
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string())
                })
                .collect();
            return Err(QueryError::Api(messages));
        }
    }
    match payload.get("data") {
        Some(data) if !data.is_null() => Ok(data.clone()),
        _ => Err(QueryError::Decode("response carries no data".to_string())),
    }
}

/// Blocking `ureq` transport, run on tokio's blocking pool.
#[derive(Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
    endpoint: String,
    api_key: Option<String>,
    timeout_ms: u64,
}

impl HttpTransport {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms.max(1));
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5).min(timeout))
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();
        Self {
            agent,
            endpoint: endpoint.trim().to_string(),
            api_key,
            timeout_ms,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn post_blocking(&self, body: Value) -> Result<Value, QueryError> {
        let mut request = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .set("Accept", "application/json");
        if let Some(api_key) = self.api_key.as_deref() {
            request = request.set("ApiKey", api_key);
        }
        match request.send_json(body) {
            Ok(response) => {
                let payload: Value = response
                    .into_json()
                    .map_err(|err| QueryError::Decode(err.to_string()))?;
                decode_graphql_payload(payload)
            }
            Err(ureq::Error::Status(code, response)) => {
                // GraphQL servers report validation failures with a 4xx body.
                if let Ok(payload) = response.into_json::<Value>() {
                    if let Err(api_error @ QueryError::Api(_)) = decode_graphql_payload(payload) {
                        return Err(api_error);
                    }
                }
                Err(self.failure(classify_status(code), format!("HTTP status {code}")))
            }
            Err(error) => Err(self.failure(classify_ureq_failure(&error), error.to_string())),
        }
    }

    fn failure(&self, kind: HttpFailureKind, message: String) -> QueryError {
        match kind {
            HttpFailureKind::Timeout => QueryError::Timeout {
                timeout_ms: self.timeout_ms,
            },
            HttpFailureKind::RateLimited => {
                QueryError::Network(format!("rate limited by query API: {message}"))
            }
            HttpFailureKind::Hard => QueryError::Network(message),
        }
    }
}

#[async_trait]
impl QueryTransport for HttpTransport {
    async fn execute(&self, document: &str, variables: Value) -> Result<Value, QueryError> {
        let body = json!({ "query": document, "variables": variables });
        let transport = self.clone();
        debug!("Query API: POST {}", self.endpoint);
        tokio::task::spawn_blocking(move || transport.post_blocking(body))
            .await
            .map_err(|err| QueryError::Network(format!("query worker failed: {err}")))?
    }
}
