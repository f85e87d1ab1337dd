//! Push transport adapters.
//!
//! Adapters own transport details only: request shaping, timeouts, and HTTP
//! error mapping. The delivery worker treats any non-error return as a
//! successful send.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;

use crate::domain::message::NotificationEnvelope;
use crate::domain::ports::{PushSendError, PushTransport};

const DEFAULT_USER_AGENT: &str = "notification-broker-push/0.1";

/// Gateway-relayed push sender.
///
/// Posts `{token, notification}` to one provider-facing relay endpoint
/// (a Web Push relay, an APNs bridge, and so on). One instance per channel
/// kind, each with its own endpoint.
pub struct HttpPushGateway {
    client: Client,
    endpoint: Url,
}

#[derive(Serialize)]
struct GatewayRequest<'a> {
    token: &'a serde_json::Value,
    notification: &'a NotificationEnvelope,
}

impl HttpPushGateway {
    /// Build a sender with an explicit request timeout.
    ///
    /// # Errors
    /// Returns an error when the reqwest client cannot be constructed.
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(DEFAULT_USER_AGENT)
            .build()?;
        Ok(Self { client, endpoint })
    }
}

fn map_status_error(status: StatusCode, body: &[u8]) -> PushSendError {
    let preview = body_preview(body);
    if preview.is_empty() {
        PushSendError::new(format!("gateway returned status {}", status.as_u16()))
    } else {
        PushSendError::new(format!(
            "gateway returned status {}: {preview}",
            status.as_u16()
        ))
    }
}

fn body_preview(body: &[u8]) -> String {
    const PREVIEW_CHAR_LIMIT: usize = 160;

    let compact = String::from_utf8_lossy(body)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let preview = compact.chars().take(PREVIEW_CHAR_LIMIT).collect::<String>();
    if compact.chars().count() > PREVIEW_CHAR_LIMIT {
        format!("{preview}...")
    } else {
        preview
    }
}

#[async_trait]
impl PushTransport for HttpPushGateway {
    async fn send(
        &self,
        token: &serde_json::Value,
        envelope: &NotificationEnvelope,
    ) -> Result<(), PushSendError> {
        let request = GatewayRequest {
            token,
            notification: envelope,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|error| PushSendError::new(error.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.bytes().await.unwrap_or_default();
        Err(map_status_error(status, body.as_ref()))
    }
}

/// Sender that accepts every envelope without sending anything.
///
/// Stands in for unconfigured transports in development deployments, where
/// delivery rows should still settle as `sent`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPushSender;

#[async_trait]
impl PushTransport for NoopPushSender {
    async fn send(
        &self,
        _token: &serde_json::Value,
        envelope: &NotificationEnvelope,
    ) -> Result<(), PushSendError> {
        tracing::debug!(message_id = %envelope.message_id, "noop push sender accepted envelope");
        Ok(())
    }
}
