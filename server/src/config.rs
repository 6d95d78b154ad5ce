use std::{env, str::FromStr, time::Duration};

use chrono::{FixedOffset, Offset, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub environment: String,
    pub twilio: Option<TwilioConfig>,
    pub inbound_dedup_window: Duration,
    pub outbound_dedup_window: Duration,
    pub inbound_bucket_secs: i64,
    pub display_offset: FixedOffset,
    pub max_message_chars: usize,
    pub max_inbound_chars: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick
    /// up a local `.env`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| text_var(&lookup, key);

        let twilio = match (
            text("TWILIO_ACCOUNT_SID"),
            text("TWILIO_AUTH_TOKEN"),
            text("TWILIO_PHONE_NUMBER"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from_number)) => Some(TwilioConfig {
                account_sid,
                auth_token,
                from_number,
                api_base: text("TWILIO_API_BASE")
                    .unwrap_or_else(|| "https://api.twilio.com".to_string())
                    .trim_end_matches('/')
                    .to_string(),
            }),
            _ => None,
        };

        let offset_minutes: i32 = parsed_var(&lookup, "DISPLAY_UTC_OFFSET_MINUTES", -180);
        let display_offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix());

        Self {
            port: parsed_var(&lookup, "PORT", 4000),
            environment: text("APP_ENV")
                .or_else(|| text("NODE_ENV"))
                .unwrap_or_else(|| "development".to_string()),
            twilio,
            inbound_dedup_window: Duration::from_secs(parsed_var(
                &lookup,
                "INBOUND_DEDUP_WINDOW_SECS",
                600,
            )),
            outbound_dedup_window: Duration::from_secs(parsed_var(
                &lookup,
                "OUTBOUND_DEDUP_WINDOW_SECS",
                5,
            )),
            inbound_bucket_secs: parsed_var::<i64>(&lookup, "INBOUND_BUCKET_SECS", 60).max(1),
            display_offset,
            max_message_chars: parsed_var::<usize>(&lookup, "MAX_MESSAGE_CHARS", 1000).max(1),
            max_inbound_chars: parsed_var::<usize>(&lookup, "MAX_INBOUND_MESSAGE_CHARS", 4096)
                .max(1),
        }
    }

    pub fn provider_configured(&self) -> bool {
        self.twilio.is_some()
    }
}

fn text_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    text_var(lookup, key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
