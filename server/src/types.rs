use std::{fmt, str::FromStr};

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Pending,
    Active,
    Finished,
}

impl ChatStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatStatus::Pending => "pending",
            ChatStatus::Active => "active",
            ChatStatus::Finished => "finished",
        }
    }

    /// Pending and active conversations own their counterparty address.
    pub fn is_live(self) -> bool {
        !matches!(self, ChatStatus::Finished)
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ChatStatus::Pending),
            "active" => Ok(ChatStatus::Active),
            "finished" => Ok(ChatStatus::Finished),
            other => Err(format!("unknown chat status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub body: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    pub formatted_timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormattedTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attended: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub address: String,
    pub display_name: Option<String>,
    pub status: ChatStatus,
    pub messages: Vec<ChatMessage>,
    pub last_message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub attended_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub formatted_time: FormattedTime,
    /// Seconds spent pending, fixed when an agent attends.
    pub wait_time: Option<i64>,
    /// Seconds spent active, fixed when the conversation finishes.
    pub handle_time: Option<i64>,
}

/// A provider webhook delivery after form decoding and address normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundDelivery {
    pub address: String,
    pub body: String,
    pub display_name: Option<String>,
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub conversation_id: String,
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangedPayload {
    pub conversation_id: String,
    pub status: ChatStatus,
    pub conversation: Conversation,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub elapsed_seconds: Option<i64>,
    pub elapsed_display: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub live_conversations: usize,
    pub total_conversations: usize,
    pub inbound_ledger_size: usize,
    pub outbound_ledger_size: usize,
    pub provider_configured: bool,
    pub connected_clients: usize,
    pub environment: String,
}

pub fn display_time(at: DateTime<Utc>, offset: FixedOffset) -> String {
    at.with_timezone(&offset).format("%H:%M:%S").to_string()
}

pub fn display_clock(at: DateTime<Utc>, offset: FixedOffset) -> String {
    at.with_timezone(&offset).format("%H:%M").to_string()
}
