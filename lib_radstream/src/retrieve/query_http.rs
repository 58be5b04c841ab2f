//! # One-Shot Query Client
//!
//! A thin `POST {query, variables}` client for request/response lookups that
//! do not need a live subscription (sensor snapshots, simulation metadata).
//! Transient failures are retried with exponential backoff by
//! `reqwest-retry`; every other failure is a [`StreamError::Request`].

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::StreamError;

/// Retries applied to transient failures.
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Serialize)]
struct QueryBody<'a> {
    query: &'a str,
    variables: &'a Map<String, Value>,
}

/// Client for one query endpoint.
#[derive(Debug, Clone)]
pub struct QueryClient {
    inner: ClientWithMiddleware,
    endpoint: Url,
    auth_token: Option<String>,
}

impl QueryClient {
    /// Builds a client for an absolute `http(s)` endpoint.
    pub fn new(endpoint: &str, auth_token: Option<String>) -> Result<Self, StreamError> {
        Self::with_timeout(endpoint, auth_token, Duration::from_secs(30))
    }

    pub fn with_timeout(endpoint: &str, auth_token: Option<String>, timeout: Duration) -> Result<Self, StreamError> {
        let url = Url::parse(endpoint).map_err(|e| StreamError::Request(format!("Invalid endpoint '{}': {}", endpoint, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(StreamError::Request(format!("Unsupported scheme '{}' in {}", url.scheme(), endpoint)));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StreamError::Request(e.to_string()))?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
        let inner = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner,
            endpoint: url,
            auth_token,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Executes `query` and decodes its `data` member into `T`.
    ///
    /// A non-2xx status, a non-empty `errors` array or a missing `data`
    /// member all fail with [`StreamError::Request`].
    pub async fn execute<T: DeserializeOwned>(&self, query: &str, variables: &Map<String, Value>) -> Result<T, StreamError> {
        let body = serde_json::to_string(&QueryBody { query, variables })?;

        let mut req = self
            .inner
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = req.send().await.map_err(|e| StreamError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StreamError::Request(format!("HTTP {}: {}", status.as_u16(), text.trim())));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| StreamError::Request(format!("Response is not JSON: {}", e)))?;
        decode_envelope(envelope)
    }
}

/// Splits a `{data?, errors?}` response into the typed data or an error.
pub fn decode_envelope<T: DeserializeOwned>(mut envelope: Value) -> Result<T, StreamError> {
    if let Some(errors) = envelope.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let messages: Vec<String> = errors
                .iter()
                .map(|e| {
                    e.get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| e.to_string())
                })
                .collect();
            return Err(StreamError::Request(messages.join("; ")));
        }
    }

    match envelope.get_mut("data").map(Value::take) {
        Some(Value::Null) | None => Err(StreamError::Request("Response carried no data".to_string())),
        Some(data) => serde_json::from_value(data)
            .map_err(|e| StreamError::Request(format!("Unexpected data shape: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sensors {
        sensors: Vec<Value>,
    }

    #[test]
    fn decodes_data() {
        let out: Sensors = decode_envelope(json!({"data": {"sensors": [1, 2]}})).unwrap();
        assert_eq!(out.sensors.len(), 2);
    }

    #[test]
    fn errors_win_over_data() {
        let err = decode_envelope::<Sensors>(json!({
            "data": {"sensors": []},
            "errors": [{"message": "forbidden"}, {"code": 7}]
        }))
        .unwrap_err();
        assert_eq!(err, StreamError::Request(r#"forbidden; {"code":7}"#.to_string()));
    }

    #[test]
    fn missing_or_null_data_is_an_error() {
        assert!(decode_envelope::<Sensors>(json!({})).is_err());
        assert!(decode_envelope::<Sensors>(json!({"data": null, "errors": []})).is_err());
        assert!(decode_envelope::<Sensors>(json!({"data": {"other": 1}})).is_err());
    }

    #[test]
    fn rejects_bad_endpoints() {
        assert!(QueryClient::new("not a url", None).is_err());
        assert!(QueryClient::new("ws://example.org/graphql", None).is_err());
        assert!(QueryClient::new("https://example.org/graphql", Some("t".into())).is_ok());
    }
}
