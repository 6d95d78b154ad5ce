use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{config::TwilioConfig, error::ChatError, validate::whatsapp_destination};

/// Outbound message delivery. Implementations only report success or failure;
/// retries and rate limiting belong to the provider.
#[async_trait]
pub trait OutboundProvider: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn send_text(&self, destination: &str, body: &str) -> Result<(), ChatError>;
}

pub fn provider_from_config(twilio: Option<&TwilioConfig>) -> Arc<dyn OutboundProvider> {
    match twilio {
        Some(config) => Arc::new(TwilioProvider::new(config.clone())),
        None => Arc::new(UnconfiguredProvider),
    }
}

pub struct TwilioProvider {
    client: reqwest::Client,
    config: TwilioConfig,
}

impl TwilioProvider {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base, self.config.account_sid
        )
    }
}

#[async_trait]
impl OutboundProvider for TwilioProvider {
    fn is_configured(&self) -> bool {
        true
    }

    async fn send_text(&self, destination: &str, body: &str) -> Result<(), ChatError> {
        let from = whatsapp_destination(&self.config.from_number);
        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[("From", from.as_str()), ("To", destination), ("Body", body)])
            .send()
            .await
            .map_err(|e| ChatError::Delivery(e.to_string()))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if status.is_success() {
            let sid = serde_json::from_str::<Value>(&raw_body)
                .ok()
                .and_then(|v| v.get("sid").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            debug!(%destination, %sid, "twilio accepted outbound message");
            return Ok(());
        }

        let detail = serde_json::from_str::<Value>(&raw_body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(raw_body);
        warn!(%destination, status = status.as_u16(), %detail, "twilio rejected outbound message");
        Err(ChatError::Delivery(format!("{status}: {detail}")))
    }
}

pub struct UnconfiguredProvider;

#[async_trait]
impl OutboundProvider for UnconfiguredProvider {
    fn is_configured(&self) -> bool {
        false
    }

    async fn send_text(&self, _destination: &str, _body: &str) -> Result<(), ChatError> {
        Err(ChatError::Delivery(
            "outbound provider is not configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn twilio() -> TwilioConfig {
        TwilioConfig {
            account_sid: "AC123".into(),
            auth_token: "secret".into(),
            from_number: "+14155238886".into(),
            api_base: "https://api.twilio.com".into(),
        }
    }

    #[test]
    fn builds_messages_endpoint() {
        let provider = TwilioProvider::new(twilio());
        assert_eq!(
            provider.messages_url(),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Messages.json"
        );
    }

    #[test]
    fn chooses_provider_from_config() {
        assert!(provider_from_config(Some(&twilio())).is_configured());
        assert!(!provider_from_config(None).is_configured());
    }

    #[tokio::test]
    async fn unconfigured_provider_always_fails() {
        let err = UnconfiguredProvider
            .send_text("whatsapp:+551199990000", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Delivery(_)));
    }
}
