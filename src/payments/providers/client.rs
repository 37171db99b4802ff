//! Authenticated HTTP client shared by the provider adapters
//!
//! Wraps `reqwest` with bearer authentication, a request timeout and bounded
//! retries with exponential backoff on transport errors, 429 and 5xx.

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::{PaymentError, PaymentResult};

/// Upper bound on the per-provider retry count accepted from configuration
pub const MAX_PROVIDER_RETRIES: u32 = 5;

const MAX_BACKOFF_SECS: u64 = 30;

/// `2^attempt` seconds, capped at [`MAX_BACKOFF_SECS`]
fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2_u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS))
}

/// Request body variants used by the providers
#[derive(Debug, Clone, Copy)]
pub enum RequestBody<'a> {
    Empty,
    Json(&'a Value),
    /// Pre-encoded `application/x-www-form-urlencoded` body
    Form(&'a str),
}

pub struct ProviderClient {
    provider: &'static str,
    client: Client,
    base_url: String,
    secret_key: String,
    max_retries: u32,
}

impl ProviderClient {
    pub fn new(
        provider: &'static str,
        base_url: &str,
        secret_key: &str,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            provider,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
            max_retries,
        })
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// Send a request and return the decoded JSON body of a 2xx response
    pub async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: RequestBody<'_>,
        headers: &[(&str, String)],
    ) -> PaymentResult<Value> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut request = self
            .client
            .request(method, &url)
            .header("Authorization", format!("Bearer {}", self.secret_key));

        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        request = match body {
            RequestBody::Empty => request,
            RequestBody::Json(value) => request.json(value),
            RequestBody::Form(encoded) => request
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(encoded.to_string()),
        };

        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let Some(req) = request.try_clone() else {
                return Err(PaymentError::upstream(
                    self.provider,
                    "Failed to clone request",
                ));
            };

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    let response_text = response.text().await.unwrap_or_default();

                    if status.is_success() {
                        return serde_json::from_str::<Value>(&response_text).map_err(|e| {
                            error!(provider = self.provider, "Failed to parse response: {}", e);
                            PaymentError::upstream(
                                self.provider,
                                format!("Invalid response format: {}", e),
                            )
                        });
                    }

                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if retryable && attempt < self.max_retries {
                        let backoff = retry_backoff(attempt);
                        warn!(
                            provider = self.provider,
                            "HTTP {}, retrying after {:?} (attempt {})",
                            status,
                            backoff,
                            attempt + 1
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    error!(
                        provider = self.provider,
                        "API error: HTTP {}: {}", status, response_text
                    );
                    return Err(PaymentError::UpstreamUnavailable {
                        provider: self.provider.to_string(),
                        message: format!("HTTP {}", status),
                        details: Some(diagnostic_payload(&response_text)),
                    });
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        let backoff = retry_backoff(attempt);
                        warn!(
                            provider = self.provider,
                            "Request error, retrying after {:?} (attempt {}): {}",
                            backoff,
                            attempt + 1,
                            e
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let message = format!(
            "Request failed after {} retries: {}",
            self.max_retries,
            last_error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string())
        );
        error!(provider = self.provider, "{}", message);
        Err(PaymentError::upstream(self.provider, message))
    }
}

/// Provider error bodies are usually JSON; fall back to the raw text
fn diagnostic_payload(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_retry_backoff_is_capped() {
        assert_eq!(retry_backoff(0), Duration::from_secs(1));
        assert_eq!(retry_backoff(3), Duration::from_secs(8));
        assert_eq!(retry_backoff(5), Duration::from_secs(MAX_BACKOFF_SECS));
        assert_eq!(retry_backoff(200), Duration::from_secs(MAX_BACKOFF_SECS));
    }

    #[tokio::test]
    async fn test_sends_bearer_auth_and_decodes_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .and(header("Authorization", "Bearer sk_test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = ProviderClient::new("Test", &server.uri(), "sk_test", 5, 0).unwrap();
        let body = client
            .send(Method::GET, "/ping", RequestBody::Empty, &[])
            .await
            .unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_client_error_surfaces_provider_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"message": "Invalid amount"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = ProviderClient::new("Test", &server.uri(), "sk", 5, 2).unwrap();
        let payload = json!({});
        let err = client
            .send(Method::POST, "/charge", RequestBody::Json(&payload), &[])
            .await
            .unwrap_err();

        match err {
            PaymentError::UpstreamUnavailable { details, .. } => {
                assert_eq!(details.unwrap()["message"], "Invalid amount");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let client = ProviderClient::new("Test", &server.uri(), "sk", 5, 1).unwrap();
        let body = client
            .send(Method::GET, "/status", RequestBody::Empty, &[])
            .await
            .unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_upstream_unavailable() {
        // Port 9 (discard) is not expected to accept HTTP connections
        let client = ProviderClient::new("Test", "http://127.0.0.1:9", "sk", 1, 0).unwrap();
        let err = client
            .send(Method::GET, "/status", RequestBody::Empty, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::UpstreamUnavailable { .. }));
        assert!(err.is_retryable());
    }
}
