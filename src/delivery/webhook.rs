//! Webhook delivery - POST result payloads as JSON

use super::{DeliveryError, DeliveryOutcome, DeliveryPayload, ResultDelivery};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

/// Delivers results to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl WebhookDelivery {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            timeout,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Map a response status onto a delivery outcome
fn classify(status: StatusCode, body: &str) -> DeliveryOutcome {
    match status.as_u16() {
        200..=299 => DeliveryOutcome::Delivered,
        408 | 429 => DeliveryOutcome::Retry(format!("HTTP {}", status)),
        400..=499 => DeliveryOutcome::Rejected(format!("HTTP {}: {}", status, body)),
        _ => DeliveryOutcome::Retry(format!("HTTP {}: {}", status, body)),
    }
}

#[async_trait]
impl ResultDelivery for WebhookDelivery {
    fn name(&self) -> &str {
        &self.url
    }

    async fn deliver(&self, payload: &DeliveryPayload) -> Result<DeliveryOutcome, DeliveryError> {
        let request = self.client.post(&self.url).json(payload).send();

        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => {
                let status = response.status();
                let body = if status.is_success() {
                    String::new()
                } else {
                    response.text().await.unwrap_or_default()
                };
                Ok(classify(status, body.trim()))
            }
            Ok(Err(e)) if e.is_timeout() || e.is_connect() => {
                Ok(DeliveryOutcome::Retry(format!("request failed: {}", e)))
            }
            Ok(Err(e)) => Err(DeliveryError::Http(e)),
            Err(_) => Ok(DeliveryOutcome::Retry(format!(
                "no response after {:?}",
                self.timeout
            ))),
        }
    }
}
