//! The single coordination point for chat state.
//!
//! Registry, ledgers and timers live in one `DeskState` behind one mutex.
//! Events for a committed change are published before the lock is released,
//! so every session sees a conversation's changes in commit order. The
//! provider call for an outbound send runs with the lock released.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    dedup::{DedupLedger, Fingerprint},
    error::ChatError,
    hub::{BroadcastHub, ClientAction, ClientId},
    lifecycle::{DeskEvent, InboundKind, LifecycleEngine},
    provider::OutboundProvider,
    types::{ChatMessage, ChatStatus, Conversation, ConversationView, HealthSnapshot, InboundDelivery},
    validate::{normalize_address, validate_body, whatsapp_destination},
};

struct DeskState {
    engine: LifecycleEngine,
    inbound: DedupLedger,
    outbound: DedupLedger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAck {
    Admitted {
        conversation_id: String,
        kind: InboundKind,
    },
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub conversation_id: String,
    pub body: String,
    /// Session-local token distinguishing intentional repeats from
    /// double-submits. Falls back to the session id when absent.
    pub client_token: Option<String>,
}

pub struct Desk {
    state: Mutex<DeskState>,
    hub: BroadcastHub,
    provider: Arc<dyn OutboundProvider>,
    inbound_bucket_secs: i64,
    max_message_chars: usize,
    max_inbound_chars: usize,
    environment: String,
}

impl Desk {
    pub fn new(config: &Config, provider: Arc<dyn OutboundProvider>) -> Self {
        Self {
            state: Mutex::new(DeskState {
                engine: LifecycleEngine::new(config.display_offset),
                inbound: DedupLedger::new(config.inbound_dedup_window),
                outbound: DedupLedger::new(config.outbound_dedup_window),
            }),
            hub: BroadcastHub::default(),
            provider,
            inbound_bucket_secs: config.inbound_bucket_secs,
            max_message_chars: config.max_message_chars,
            max_inbound_chars: config.max_inbound_chars,
            environment: config.environment.clone(),
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub async fn handle_inbound(&self, delivery: InboundDelivery) -> Result<InboundAck, ChatError> {
        self.handle_inbound_at(delivery, Utc::now()).await
    }

    pub async fn handle_inbound_at(
        &self,
        delivery: InboundDelivery,
        now: DateTime<Utc>,
    ) -> Result<InboundAck, ChatError> {
        let delivery = InboundDelivery {
            address: normalize_address(&delivery.address)?,
            body: validate_body(&delivery.body, self.max_inbound_chars)?,
            display_name: delivery
                .display_name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty()),
            provider_message_id: delivery.provider_message_id,
        };
        let fingerprint = Fingerprint::inbound(
            &delivery.address,
            &delivery.body,
            delivery.provider_message_id.as_deref(),
            now,
            self.inbound_bucket_secs,
        );

        let mut state = self.state.lock().await;
        if !state.inbound.admit(fingerprint, now) {
            debug!(
                address = %delivery.address,
                provider_message_id = ?delivery.provider_message_id,
                "duplicate inbound delivery ignored"
            );
            return Ok(InboundAck::Duplicate);
        }

        let outcome = state.engine.apply_inbound(&delivery, now);
        info!(
            conversation_id = %outcome.conversation_id,
            address = %delivery.address,
            kind = ?outcome.kind,
            "inbound message admitted"
        );
        self.publish_all(&outcome.events).await;
        Ok(InboundAck::Admitted {
            conversation_id: outcome.conversation_id,
            kind: outcome.kind,
        })
    }

    pub async fn attend(&self, conversation_id: &str) -> Result<Conversation, ChatError> {
        let mut state = self.state.lock().await;
        let events = state.engine.attend(conversation_id, Utc::now())?;
        if !events.is_empty() {
            info!(%conversation_id, "conversation attended");
        }
        self.publish_all(&events).await;
        current(&state, conversation_id)
    }

    pub async fn finish(&self, conversation_id: &str) -> Result<Conversation, ChatError> {
        let mut state = self.state.lock().await;
        let events = state.engine.finish(conversation_id, Utc::now())?;
        if !events.is_empty() {
            info!(%conversation_id, "conversation finished");
        }
        self.publish_all(&events).await;
        current(&state, conversation_id)
    }

    /// Validates and dedups under the lock, calls the provider without it, then
    /// commits the message. Nothing is appended when delivery fails or when the
    /// conversation stopped being active while the provider call ran.
    pub async fn send_message(
        &self,
        client_id: ClientId,
        request: SendRequest,
    ) -> Result<ChatMessage, ChatError> {
        let body = validate_body(&request.body, self.max_message_chars)?;
        let conversation_id = request.conversation_id;
        let token = request
            .client_token
            .unwrap_or_else(|| format!("session:{client_id}"));
        let fingerprint = Fingerprint::outbound(&conversation_id, &body, &token);

        let address = {
            let mut state = self.state.lock().await;
            let address = state.engine.ensure_can_send(&conversation_id)?;
            if !state.outbound.admit(fingerprint.clone(), Utc::now()) {
                debug!(%conversation_id, client_id, "duplicate outbound send ignored");
                return Err(ChatError::Duplicate);
            }
            address
        };

        if let Err(err) = self
            .provider
            .send_text(&whatsapp_destination(&address), &body)
            .await
        {
            warn!(%conversation_id, error = %err, "outbound send failed");
            self.state.lock().await.outbound.forget(&fingerprint);
            return Err(err);
        }

        let committed = {
            let mut state = self.state.lock().await;
            let committed = state
                .engine
                .append_agent_message(&conversation_id, &body, Utc::now());
            if let Ok((_, events)) = &committed {
                self.publish_all(events).await;
            }
            committed
        };

        let message = match committed {
            Ok((message, _)) => message,
            Err(err) => {
                warn!(%conversation_id, error = %err, "delivered message not recorded");
                self.hub
                    .emit_to(
                        client_id,
                        "messageSent",
                        json!({ "conversationId": conversation_id, "status": "delivered-after-finish" }),
                    )
                    .await;
                return Err(err);
            }
        };
        info!(%conversation_id, message_id = %message.id, "agent message delivered");

        self.hub
            .emit_to(
                client_id,
                "messageSent",
                json!({ "conversationId": conversation_id, "messageId": message.id, "status": "sent" }),
            )
            .await;
        Ok(message)
    }

    /// Agent-initiated first contact with an address.
    pub async fn start_conversation(&self, address: &str, body: &str) -> Result<String, ChatError> {
        let address = normalize_address(address)?;
        let body = validate_body(body, self.max_message_chars)?;
        let fingerprint = Fingerprint::start_conversation(&address, &body);

        {
            let mut state = self.state.lock().await;
            if !state.outbound.admit(fingerprint.clone(), Utc::now()) {
                debug!(%address, "duplicate start-conversation ignored");
                return Err(ChatError::Duplicate);
            }
        }

        if let Err(err) = self
            .provider
            .send_text(&whatsapp_destination(&address), &body)
            .await
        {
            warn!(%address, error = %err, "start-conversation send failed");
            self.state.lock().await.outbound.forget(&fingerprint);
            return Err(err);
        }

        let mut state = self.state.lock().await;
        let (conversation_id, events) = state.engine.open_outbound(&address, &body, Utc::now());
        info!(%conversation_id, %address, "conversation started by agent");
        self.publish_all(&events).await;
        Ok(conversation_id)
    }

    /// Runs an action received from a socket session. Failures are reported
    /// back to that session only; duplicates are dropped silently.
    pub async fn dispatch(&self, client_id: ClientId, action: ClientAction) {
        let result = match action {
            ClientAction::Join => {
                let snapshot = self.conversations(None).await;
                self.hub.emit_to(client_id, "snapshot", snapshot).await;
                Ok(())
            }
            ClientAction::Attend { conversation_id } => {
                self.attend(&conversation_id).await.map(|_| ())
            }
            ClientAction::Finish { conversation_id } => {
                self.finish(&conversation_id).await.map(|_| ())
            }
            ClientAction::UpdateStatus {
                conversation_id,
                status,
            } => match status {
                ChatStatus::Active => self.attend(&conversation_id).await.map(|_| ()),
                ChatStatus::Finished => self.finish(&conversation_id).await.map(|_| ()),
                ChatStatus::Pending => Err(ChatError::Validation(
                    "conversations return to pending only on new inbound contact".into(),
                )),
            },
            ClientAction::SendMessage {
                conversation_id,
                body,
                client_token,
            } => self
                .send_message(
                    client_id,
                    SendRequest {
                        conversation_id,
                        body,
                        client_token,
                    },
                )
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) | Err(ChatError::Duplicate) => {}
            Err(err) => {
                debug!(client_id, error = %err, "client action rejected");
                self.hub
                    .emit_to(
                        client_id,
                        "error",
                        json!({ "message": err.to_string(), "kind": err.kind() }),
                    )
                    .await;
            }
        }
    }

    pub async fn get(&self, conversation_id: &str) -> Option<Conversation> {
        let state = self.state.lock().await;
        state.engine.registry().get(conversation_id).cloned()
    }

    pub async fn conversations(&self, status: Option<ChatStatus>) -> Vec<ConversationView> {
        let state = self.state.lock().await;
        let registry = state.engine.registry();
        let now = Utc::now();
        let list = match status {
            Some(status) => registry.all_by_status(status),
            None => registry.all(),
        };
        list.into_iter()
            .map(|chat| state.engine.view(chat, now))
            .collect()
    }

    pub async fn health(&self) -> HealthSnapshot {
        let (live, total, inbound, outbound) = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            state.inbound.sweep(now);
            state.outbound.sweep(now);
            let registry = state.engine.registry();
            (
                registry.live_count(),
                registry.len(),
                state.inbound.len(),
                state.outbound.len(),
            )
        };

        HealthSnapshot {
            status: "OK",
            live_conversations: live,
            total_conversations: total,
            inbound_ledger_size: inbound,
            outbound_ledger_size: outbound,
            provider_configured: self.provider.is_configured(),
            connected_clients: self.hub.client_count().await,
            environment: self.environment.clone(),
        }
    }

    async fn publish_all(&self, events: &[DeskEvent]) {
        for event in events {
            let reached = self.hub.publish(event).await;
            debug!(event = event.name(), reached, "broadcast");
        }
    }
}

fn current(state: &DeskState, conversation_id: &str) -> Result<Conversation, ChatError> {
    state
        .engine
        .registry()
        .get(conversation_id)
        .cloned()
        .ok_or_else(|| ChatError::NotFound(conversation_id.to_string()))
}
