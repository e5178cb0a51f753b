//! Terminal webhook delivery.
//!
//! The control plane produces a well-formed terminal payload and hands it to
//! a [`WebhookSender`]. The default sender POSTs JSON with a 10-second
//! client timeout and treats any 2xx as success; failures surface to the
//! caller and are not retried.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::Status;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Payload POSTed to the project webhook when an orchestration terminates.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub orchestration_id: String,
    pub results: Vec<Value>,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook client could not be built: {0}")]
    Client(String),
    #[error("webhook request failed: {0}")]
    Transport(String),
    #[error("webhook returned unexpected status code: {0}")]
    UnexpectedStatus(u16),
}

#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<(), WebhookError>;
}

/// HTTP webhook delivery over reqwest.
pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl HttpWebhookSender {
    pub fn new() -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| WebhookError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| WebhookError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WebhookError::UnexpectedStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_wire_shape() {
        let payload = WebhookPayload {
            orchestration_id: "o1".into(),
            results: vec![json!({"z": "42-a-b"})],
            status: Status::Completed,
            error: None,
        };
        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            encoded,
            json!({
                "orchestrationId": "o1",
                "results": [{"z": "42-a-b"}],
                "status": "completed"
            })
        );
    }

    #[test]
    fn failed_payload_carries_error() {
        let payload = WebhookPayload {
            orchestration_id: "o1".into(),
            results: vec![],
            status: Status::Failed,
            error: Some(json!({"id": "task1", "error": "boom"})),
        };
        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(encoded["status"], "failed");
        assert_eq!(encoded["error"]["id"], "task1");
    }
}
