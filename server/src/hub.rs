use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::{lifecycle::DeskEvent, types::ChatStatus};

pub type ClientId = usize;

/// Connected agent sessions. Every committed change goes to every session;
/// each session has its own unbounded queue so a stalled socket never holds
/// up the others.
#[derive(Default)]
pub struct BroadcastHub {
    clients: Mutex<HashMap<ClientId, mpsc::UnboundedSender<String>>>,
    next_client_id: AtomicUsize,
}

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

impl BroadcastHub {
    pub async fn subscribe(&self) -> (ClientId, mpsc::UnboundedReceiver<String>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        self.clients.lock().await.insert(client_id, tx);
        (client_id, rx)
    }

    pub async fn unsubscribe(&self, client_id: ClientId) {
        self.clients.lock().await.remove(&client_id);
    }

    /// Sends to every subscribed session, originator included, and prunes
    /// sessions whose receiver is gone. Returns the number reached.
    pub async fn broadcast<T: Serialize>(&self, event: &str, data: T) -> usize {
        let Some(payload) = event_payload(event, data) else {
            return 0;
        };

        let mut clients = self.clients.lock().await;
        clients.retain(|client_id, sender| {
            let alive = sender.send(payload.clone()).is_ok();
            if !alive {
                debug!(client_id, "dropping closed session");
            }
            alive
        });
        clients.len()
    }

    pub async fn publish(&self, event: &DeskEvent) -> usize {
        self.broadcast(event.name(), event.payload()).await
    }

    pub async fn emit_to<T: Serialize>(&self, client_id: ClientId, event: &str, data: T) {
        let Some(payload) = event_payload(event, data) else {
            return;
        };

        let tx = {
            let clients = self.clients.lock().await;
            clients.get(&client_id).cloned()
        };

        if let Some(sender) = tx {
            let _ = sender.send(payload);
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

#[derive(Debug, Deserialize)]
struct EventEnvelopeIn {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationRef {
    #[serde(alias = "chatId")]
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageData {
    #[serde(alias = "chatId")]
    conversation_id: String,
    #[serde(alias = "content")]
    body: String,
    #[serde(default)]
    client_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusData {
    #[serde(alias = "chatId")]
    conversation_id: String,
    status: ChatStatus,
}

/// Actions an agent session can submit over the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Join,
    Attend {
        conversation_id: String,
    },
    Finish {
        conversation_id: String,
    },
    SendMessage {
        conversation_id: String,
        body: String,
        client_token: Option<String>,
    },
    UpdateStatus {
        conversation_id: String,
        status: ChatStatus,
    },
}

impl ClientAction {
    pub fn parse(text: &str) -> Option<Self> {
        let envelope = serde_json::from_str::<EventEnvelopeIn>(text).ok()?;
        let data = envelope.data;
        let action = match envelope.event.as_str() {
            "agent:join" | "join" => ClientAction::Join,
            "attend" => {
                let target = serde_json::from_value::<ConversationRef>(data).ok()?;
                ClientAction::Attend {
                    conversation_id: target.conversation_id,
                }
            }
            "finish" => {
                let target = serde_json::from_value::<ConversationRef>(data).ok()?;
                ClientAction::Finish {
                    conversation_id: target.conversation_id,
                }
            }
            "sendMessage" | "send_message" => {
                let data = serde_json::from_value::<SendMessageData>(data).ok()?;
                ClientAction::SendMessage {
                    conversation_id: data.conversation_id,
                    body: data.body,
                    client_token: data.client_token.filter(|t| !t.trim().is_empty()),
                }
            }
            "updateChatStatus" | "update_chat_status" => {
                let data = serde_json::from_value::<StatusData>(data).ok()?;
                ClientAction::UpdateStatus {
                    conversation_id: data.conversation_id,
                    status: data.status,
                }
            }
            _ => return None,
        };
        Some(action)
    }
}
