//! Message transports.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidRecipient(_) => Error::Validation(err.to_string()),
            other => Error::Transport(other.to_string()),
        }
    }
}

#[async_trait]
pub trait NotificationTransport: Send + Sync {
    fn transport_type(&self) -> &'static str;

    async fn send(&self, recipient: &str, subject_line: &str, body: &str)
    -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    Bearer { token: String },
    Header { name: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub auth: Option<WebhookAuth>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

/// Posts each message as JSON to a configured URL.
pub struct WebhookTransport {
    config: WebhookConfig,
    client: Client,
}

impl WebhookTransport {
    pub fn new(config: WebhookConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        match &self.config.auth {
            Some(WebhookAuth::Bearer { token }) => {
                if let Ok(value) = format!("Bearer {token}").parse() {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
            Some(WebhookAuth::Header { name, value }) => {
                if let (Ok(name), Ok(value)) = (
                    name.parse::<reqwest::header::HeaderName>(),
                    value.parse::<reqwest::header::HeaderValue>(),
                ) {
                    headers.insert(name, value);
                }
            }
            None => {}
        }

        headers
    }

    fn build_payload(recipient: &str, subject_line: &str, body: &str) -> serde_json::Value {
        json!({
            "to": recipient,
            "subject": subject_line,
            "body": body,
        })
    }
}

#[async_trait]
impl NotificationTransport for WebhookTransport {
    fn transport_type(&self) -> &'static str {
        "webhook"
    }

    async fn send(
        &self,
        recipient: &str,
        subject_line: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        if recipient.trim().is_empty() {
            return Err(TransportError::InvalidRecipient(recipient.to_string()));
        }

        let response = self
            .client
            .post(&self.config.url)
            .headers(self.build_headers())
            .json(&Self::build_payload(recipient, subject_line, body))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Webhook failed: {} - {}", status, body);
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(recipient, "Webhook notification sent");
        Ok(())
    }
}

/// Writes messages to the log instead of sending them.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    fn transport_type(&self) -> &'static str {
        "log"
    }

    async fn send(
        &self,
        recipient: &str,
        subject_line: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        if recipient.trim().is_empty() {
            return Err(TransportError::InvalidRecipient(recipient.to_string()));
        }
        info!(
            recipient,
            subject_line,
            body_len = body.len(),
            "Notification (log transport)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_headers_with_bearer() {
        let transport = WebhookTransport::new(WebhookConfig {
            url: "https://example.com/hook".to_string(),
            auth: Some(WebhookAuth::Bearer {
                token: "secret".to_string(),
            }),
            timeout_secs: 5,
        });

        let headers = transport.build_headers();
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer secret"
        );
    }

    #[test]
    fn test_build_headers_with_custom_header() {
        let transport = WebhookTransport::new(WebhookConfig {
            url: "https://example.com/hook".to_string(),
            auth: Some(WebhookAuth::Header {
                name: "X-Api-Key".to_string(),
                value: "k".to_string(),
            }),
            timeout_secs: 5,
        });

        assert_eq!(transport.build_headers().get("x-api-key").unwrap(), "k");
    }

    #[test]
    fn test_build_payload() {
        let payload = WebhookTransport::build_payload("a@b.c", "Hello", "text");
        assert_eq!(payload["to"], "a@b.c");
        assert_eq!(payload["subject"], "Hello");
        assert_eq!(payload["body"], "text");
    }

    #[test]
    fn test_error_mapping() {
        let err: Error = TransportError::Request("timeout".into()).into();
        assert!(err.is_transient());

        let err: Error = TransportError::InvalidRecipient(String::new()).into();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_log_transport_rejects_blank_recipient() {
        let transport = LogTransport;
        assert!(transport.send("reader@example.com", "s", "b").await.is_ok());
        assert!(matches!(
            transport.send("  ", "s", "b").await,
            Err(TransportError::InvalidRecipient(_))
        ));
    }
}
