//! Remote ingestion API client.
//!
//! Payloads go to `POST {base_url}/payloads` as JSON with an
//! `Idempotency-Key` header, so the server can collapse retried deliveries of
//! the same time slot even if local reservation state is lost. The request
//! timeout from `[api] timeout_secs` bounds how long one row can hold up its
//! batch.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::ApiConfig;
use crate::error::SendError;
use crate::models::Payload;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[async_trait]
pub trait IngestApi: Send + Sync {
    /// Deliver one payload. `Ok(())` only for a 2xx response.
    async fn send(&self, payload: &Payload, idempotency_key: &str) -> Result<(), SendError>;
}

pub struct HttpIngestApi {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpIngestApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let token = match &config.token_env {
            Some(var) => match std::env::var(var) {
                Ok(token) if !token.is_empty() => Some(token),
                _ => bail!("{} environment variable not set", var),
            },
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/payloads", config.base_url.trim_end_matches('/')),
            token,
        })
    }
}

/// Error body shapes the API is known to return.
#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

fn describe_rejection(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => {
            let text = parsed.error.or(parsed.message);
            match (parsed.code, text) {
                (Some(code), Some(text)) => format!("{}: {}", code, text),
                (Some(code), None) => code,
                (None, Some(text)) => text,
                (None, None) => truncate(body),
            }
        }
        Err(_) => truncate(body),
    }
}

fn truncate(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no response body".to_string()
    } else {
        trimmed.chars().take(500).collect()
    }
}

#[async_trait]
impl IngestApi for HttpIngestApi {
    async fn send(&self, payload: &Payload, idempotency_key: &str) -> Result<(), SendError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(payload);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(SendError::Rejected {
            status: status.as_u16(),
            message: describe_rejection(&body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> Payload {
        Payload {
            device_id: "dev1".to_string(),
            mission_id: "mission-7".to_string(),
            ts: "2024-01-01T00:00:00.000Z".to_string(),
            metrics: BTreeMap::from([("pm25".to_string(), 12.3)]),
        }
    }

    fn api_for(server: &MockServer) -> HttpIngestApi {
        HttpIngestApi::new(&ApiConfig {
            base_url: format!("{}/", server.uri()),
            token_env: None,
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn posts_payload_with_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payloads"))
            .and(header(IDEMPOTENCY_HEADER, "dev1|mission-7|2024-01-01T00:00:00.000Z"))
            .and(body_json(serde_json::json!({
                "device_id": "dev1",
                "mission_id": "mission-7",
                "ts": "2024-01-01T00:00:00.000Z",
                "metrics": {"pm25": 12.3}
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        api_for(&server)
            .send(&payload(), "dev1|mission-7|2024-01-01T00:00:00.000Z")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_2xx_carries_machine_readable_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payloads"))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_json(serde_json::json!({"code": "invalid_metric", "error": "pm25 out of range"})),
            )
            .mount(&server)
            .await;

        match api_for(&server).send(&payload(), "k").await {
            Err(SendError::Rejected { status, message }) => {
                assert_eq!(status, 422);
                assert_eq!(message, "invalid_metric: pm25 out of range");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let api = HttpIngestApi::new(&ApiConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            token_env: None,
            timeout_secs: 2,
        })
        .unwrap();
        assert!(matches!(
            api.send(&payload(), "k").await,
            Err(SendError::Transport(_))
        ));
    }

    #[test]
    fn describes_plain_text_rejections() {
        assert_eq!(describe_rejection("upstream down\n"), "upstream down");
        assert_eq!(describe_rejection(""), "no response body");
        assert_eq!(describe_rejection(r#"{"message":"slow down"}"#), "slow down");
    }

    #[test]
    fn missing_token_env_is_an_error() {
        let result = HttpIngestApi::new(&ApiConfig {
            base_url: "http://localhost".to_string(),
            token_env: Some("AIRQ_TEST_TOKEN_THAT_IS_NOT_SET".to_string()),
            timeout_secs: 1,
        });
        assert!(result.is_err());
    }
}
