//! Conversation state machine.
//!
//! ```text
//! (none) --inbound--> pending --attend--> active --finish--> finished
//!                        ^                                      |
//!                        +---------------inbound----------------+
//! ```
//!
//! Every operation takes `now` explicitly and returns the events that must be
//! broadcast for the committed change. Repeated attend/finish calls return no
//! events.

use chrono::{DateTime, FixedOffset, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::ChatError,
    registry::ChatRegistry,
    timers::{elapsed_seconds, format_seconds, ElapsedTracker},
    types::{
        display_clock, display_time, ChatMessage, ChatStatus, Conversation, ConversationView,
        FormattedTime, InboundDelivery, NewMessagePayload, Sender, StatusChangedPayload,
    },
    validate::address_digits,
};

#[derive(Debug, Clone)]
pub enum DeskEvent {
    NewConversation(Conversation),
    NewMessage(NewMessagePayload),
    StatusChanged(StatusChangedPayload),
    Reopened(Conversation),
}

impl DeskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DeskEvent::NewConversation(_) => "newConversation",
            DeskEvent::NewMessage(_) => "newMessage",
            DeskEvent::StatusChanged(_) => "statusChanged",
            DeskEvent::Reopened(_) => "reopened",
        }
    }

    pub fn payload(&self) -> Value {
        let value = match self {
            DeskEvent::NewConversation(chat) | DeskEvent::Reopened(chat) => {
                serde_json::to_value(chat)
            }
            DeskEvent::NewMessage(payload) => serde_json::to_value(payload),
            DeskEvent::StatusChanged(payload) => serde_json::to_value(payload),
        };
        value.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Created,
    Appended,
    Reopened,
}

#[derive(Debug, Clone)]
pub struct InboundOutcome {
    pub conversation_id: String,
    pub kind: InboundKind,
    pub events: Vec<DeskEvent>,
}

#[derive(Debug)]
pub struct LifecycleEngine {
    registry: ChatRegistry,
    timers: ElapsedTracker,
    display_offset: FixedOffset,
}

impl LifecycleEngine {
    pub fn new(display_offset: FixedOffset) -> Self {
        Self {
            registry: ChatRegistry::default(),
            timers: ElapsedTracker::default(),
            display_offset,
        }
    }

    pub fn registry(&self) -> &ChatRegistry {
        &self.registry
    }

    pub fn apply_inbound(&mut self, delivery: &InboundDelivery, now: DateTime<Utc>) -> InboundOutcome {
        let message = self.new_message(&delivery.body, Sender::User, now);

        let Some(mut chat) = self.registry.find_any_by_address(&delivery.address).cloned() else {
            let chat = self.new_conversation(
                &delivery.address,
                delivery.display_name.clone(),
                ChatStatus::Pending,
                message,
                now,
            );
            self.timers.start(&chat.id, now);
            let conversation_id = chat.id.clone();
            self.registry.upsert(chat.clone());
            return InboundOutcome {
                conversation_id,
                kind: InboundKind::Created,
                events: vec![DeskEvent::NewConversation(chat)],
            };
        };

        if delivery.display_name.is_some() {
            chat.display_name = delivery.display_name.clone();
        }
        chat.messages.push(message.clone());
        chat.last_message = Some(message.body.clone());

        let mut events = Vec::with_capacity(2);
        let kind = if chat.status == ChatStatus::Finished {
            self.reopen(&mut chat, ChatStatus::Pending, now);
            events.push(DeskEvent::Reopened(chat.clone()));
            InboundKind::Reopened
        } else {
            InboundKind::Appended
        };
        events.push(DeskEvent::NewMessage(NewMessagePayload {
            conversation_id: chat.id.clone(),
            message,
        }));

        let conversation_id = chat.id.clone();
        self.registry.upsert(chat);
        InboundOutcome {
            conversation_id,
            kind,
            events,
        }
    }

    pub fn attend(&mut self, id: &str, now: DateTime<Utc>) -> Result<Vec<DeskEvent>, ChatError> {
        let mut chat = self.existing(id)?;
        match chat.status {
            ChatStatus::Active => return Ok(vec![]),
            ChatStatus::Finished => {
                return Err(ChatError::InvalidTransition {
                    id: id.to_string(),
                    from: chat.status,
                    action: "attend",
                })
            }
            ChatStatus::Pending => {}
        }

        self.timers.stop(id, now);
        chat.status = ChatStatus::Active;
        chat.attended_at = Some(now);
        chat.formatted_time.attended = Some(display_time(now, self.display_offset));
        chat.wait_time = Some(elapsed_seconds(chat.received_at, now));
        self.timers.start(id, now);

        Ok(vec![self.commit_status(chat)])
    }

    /// Finishing a pending conversation is accepted: its wait time is fixed and
    /// the handle time is zero.
    pub fn finish(&mut self, id: &str, now: DateTime<Utc>) -> Result<Vec<DeskEvent>, ChatError> {
        let mut chat = self.existing(id)?;
        match chat.status {
            ChatStatus::Finished => return Ok(vec![]),
            ChatStatus::Pending => {
                chat.wait_time = Some(elapsed_seconds(chat.received_at, now));
                chat.handle_time = Some(0);
            }
            ChatStatus::Active => {
                let attended_at = chat.attended_at.unwrap_or(chat.received_at);
                chat.handle_time = Some(elapsed_seconds(attended_at, now));
            }
        }

        self.timers.stop(id, now);
        chat.status = ChatStatus::Finished;
        chat.finished_at = Some(now);
        chat.formatted_time.finished = Some(display_time(now, self.display_offset));

        Ok(vec![self.commit_status(chat)])
    }

    /// Returns the destination address when an agent may message `id`.
    pub fn ensure_can_send(&self, id: &str) -> Result<String, ChatError> {
        let chat = self
            .registry
            .get(id)
            .ok_or_else(|| ChatError::NotFound(id.to_string()))?;
        if chat.status != ChatStatus::Active {
            return Err(ChatError::InvalidTransition {
                id: id.to_string(),
                from: chat.status,
                action: "send a message to",
            });
        }
        Ok(chat.address.clone())
    }

    /// Appends an agent message that the provider already accepted. The
    /// conversation must still be active: one finished while the send was in
    /// flight keeps its message list.
    pub fn append_agent_message(
        &mut self,
        id: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<(ChatMessage, Vec<DeskEvent>), ChatError> {
        let mut chat = self.existing(id)?;
        if chat.status != ChatStatus::Active {
            return Err(ChatError::InvalidTransition {
                id: id.to_string(),
                from: chat.status,
                action: "record a delivered message on",
            });
        }
        let message = self.new_message(body, Sender::Agent, now);
        chat.messages.push(message.clone());
        chat.last_message = Some(message.body.clone());
        self.registry.upsert(chat);

        let event = DeskEvent::NewMessage(NewMessagePayload {
            conversation_id: id.to_string(),
            message: message.clone(),
        });
        Ok((message, vec![event]))
    }

    /// Records an agent-initiated first message. A live conversation for the
    /// address just gains the message; otherwise the conversation is created or
    /// reopened directly as active, since an agent is already handling it.
    pub fn open_outbound(&mut self, address: &str, body: &str, now: DateTime<Utc>) -> (String, Vec<DeskEvent>) {
        let message = self.new_message(body, Sender::Agent, now);

        match self.registry.find_any_by_address(address).cloned() {
            None => {
                let chat =
                    self.new_conversation(address, None, ChatStatus::Active, message, now);
                self.timers.start(&chat.id, now);
                let id = chat.id.clone();
                self.registry.upsert(chat.clone());
                (id, vec![DeskEvent::NewConversation(chat)])
            }
            Some(mut chat) => {
                chat.messages.push(message.clone());
                chat.last_message = Some(message.body.clone());
                let id = chat.id.clone();
                let event = if chat.status == ChatStatus::Finished {
                    self.reopen(&mut chat, ChatStatus::Active, now);
                    DeskEvent::Reopened(chat.clone())
                } else {
                    DeskEvent::NewMessage(NewMessagePayload {
                        conversation_id: id.clone(),
                        message,
                    })
                };
                self.registry.upsert(chat);
                (id, vec![event])
            }
        }
    }

    pub fn view(&self, chat: &Conversation, now: DateTime<Utc>) -> ConversationView {
        let elapsed = self.timers.sample(&chat.id, now);
        ConversationView {
            conversation: chat.clone(),
            elapsed_seconds: elapsed,
            elapsed_display: elapsed.map(format_seconds),
        }
    }

    fn existing(&self, id: &str) -> Result<Conversation, ChatError> {
        self.registry
            .get(id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(id.to_string()))
    }

    fn commit_status(&mut self, chat: Conversation) -> DeskEvent {
        let event = DeskEvent::StatusChanged(StatusChangedPayload {
            conversation_id: chat.id.clone(),
            status: chat.status,
            conversation: chat.clone(),
        });
        self.registry.upsert(chat);
        event
    }

    fn reopen(&mut self, chat: &mut Conversation, status: ChatStatus, now: DateTime<Utc>) {
        let stamp = display_time(now, self.display_offset);
        chat.status = status;
        chat.received_at = now;
        chat.finished_at = None;
        chat.handle_time = None;
        chat.formatted_time = FormattedTime {
            received: Some(stamp.clone()),
            ..FormattedTime::default()
        };
        if status == ChatStatus::Active {
            chat.attended_at = Some(now);
            chat.wait_time = Some(0);
            chat.formatted_time.attended = Some(stamp);
        } else {
            chat.attended_at = None;
            chat.wait_time = None;
        }
        self.timers.start(&chat.id, now);
    }

    fn new_conversation(
        &self,
        address: &str,
        display_name: Option<String>,
        status: ChatStatus,
        first_message: ChatMessage,
        now: DateTime<Utc>,
    ) -> Conversation {
        let stamp = display_time(now, self.display_offset);
        let attended = status == ChatStatus::Active;
        Conversation {
            id: self.unused_id(address, now),
            address: address.to_string(),
            display_name,
            status,
            last_message: Some(first_message.body.clone()),
            messages: vec![first_message],
            received_at: now,
            attended_at: attended.then_some(now),
            finished_at: None,
            formatted_time: FormattedTime {
                received: Some(stamp.clone()),
                attended: attended.then_some(stamp),
                finished: None,
            },
            wait_time: attended.then_some(0),
            handle_time: None,
        }
    }

    /// `chat-{digits}-{millis}`, suffixed with a counter if that id is taken.
    fn unused_id(&self, address: &str, now: DateTime<Utc>) -> String {
        let base = format!("chat-{}-{}", address_digits(address), now.timestamp_millis());
        if self.registry.get(&base).is_none() {
            return base;
        }
        (2..)
            .map(|n| format!("{base}-{n}"))
            .find(|id| self.registry.get(id).is_none())
            .unwrap_or(base)
    }

    fn new_message(&self, body: &str, sender: Sender, now: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4().to_string(),
            body: body.to_string(),
            sender,
            timestamp: now,
            formatted_timestamp: display_clock(now, self.display_offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const ADDRESS: &str = "+551199990000";

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn engine() -> LifecycleEngine {
        LifecycleEngine::new(FixedOffset::west_opt(3 * 3600).unwrap())
    }

    fn delivery(address: &str, body: &str) -> InboundDelivery {
        InboundDelivery {
            address: address.to_string(),
            body: body.to_string(),
            display_name: Some("Maria".into()),
            provider_message_id: None,
        }
    }

    fn event_names(events: &[DeskEvent]) -> Vec<&'static str> {
        events.iter().map(DeskEvent::name).collect()
    }

    #[test]
    fn first_inbound_creates_pending_record() {
        let mut engine = engine();
        let outcome = engine.apply_inbound(&delivery(ADDRESS, "hello"), t(0));

        assert_eq!(outcome.kind, InboundKind::Created);
        assert_eq!(event_names(&outcome.events), vec!["newConversation"]);
        let chat = engine.registry().get(&outcome.conversation_id).unwrap();
        assert_eq!(chat.status, ChatStatus::Pending);
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.display_name.as_deref(), Some("Maria"));
        assert_eq!(chat.formatted_time.received.as_deref(), Some("09:00:00"));
        assert!(chat.id.starts_with("chat-551199990000-"));
        assert_eq!(engine.timers.sample(&chat.id, t(0)), Some(0));
    }

    #[test]
    fn inbound_to_live_conversation_appends_without_status_change() {
        let mut engine = engine();
        let id = engine.apply_inbound(&delivery(ADDRESS, "hello"), t(0)).conversation_id;
        engine.attend(&id, t(5)).unwrap();

        let outcome = engine.apply_inbound(&delivery(ADDRESS, "are you there?"), t(10));
        assert_eq!(outcome.kind, InboundKind::Appended);
        assert_eq!(outcome.conversation_id, id);
        assert_eq!(event_names(&outcome.events), vec!["newMessage"]);

        let chat = engine.registry().get(&id).unwrap();
        assert_eq!(chat.status, ChatStatus::Active);
        assert_eq!(chat.last_message.as_deref(), Some("are you there?"));
        assert_eq!(engine.registry().len(), 1);
    }

    #[test]
    fn distinct_addresses_get_one_live_conversation_each() {
        let mut engine = engine();
        for (i, address) in ["+551100000001", "+551100000002", "+551100000001"]
            .iter()
            .enumerate()
        {
            engine.apply_inbound(&delivery(address, &format!("msg {i}")), t(i as i64));
        }
        assert_eq!(engine.registry().live_count(), 2);
        assert_eq!(engine.registry().all_by_status(ChatStatus::Pending).len(), 2);
    }

    #[test]
    fn attend_fixes_wait_time_and_is_idempotent() {
        let mut engine = engine();
        let id = engine.apply_inbound(&delivery(ADDRESS, "hello"), t(0)).conversation_id;

        let events = engine.attend(&id, t(30)).unwrap();
        assert_eq!(event_names(&events), vec!["statusChanged"]);
        let chat = engine.registry().get(&id).cloned().unwrap();
        assert_eq!(chat.status, ChatStatus::Active);
        assert_eq!(chat.wait_time, Some(30));
        assert_eq!(chat.attended_at, Some(t(30)));

        assert!(engine.attend(&id, t(50)).unwrap().is_empty());
        assert_eq!(engine.registry().get(&id), Some(&chat));
        assert_eq!(engine.timers.sample(&id, t(60)), Some(30));
    }

    #[test]
    fn finish_fixes_handle_time_and_is_idempotent() {
        let mut engine = engine();
        let id = engine.apply_inbound(&delivery(ADDRESS, "hello"), t(0)).conversation_id;
        engine.attend(&id, t(10)).unwrap();

        let events = engine.finish(&id, t(100)).unwrap();
        assert_eq!(event_names(&events), vec!["statusChanged"]);
        let chat = engine.registry().get(&id).cloned().unwrap();
        assert_eq!(chat.status, ChatStatus::Finished);
        assert_eq!(chat.handle_time, Some(90));
        assert_eq!(chat.finished_at, Some(t(100)));
        assert_eq!(engine.timers.sample(&id, t(100)), None);

        assert!(engine.finish(&id, t(200)).unwrap().is_empty());
        assert_eq!(engine.registry().get(&id), Some(&chat));
        assert_eq!(engine.registry().all_by_status(ChatStatus::Finished).len(), 1);
        assert!(engine.registry().find_by_address(ADDRESS).is_none());
    }

    #[test]
    fn finish_from_pending_records_zero_handle_time() {
        let mut engine = engine();
        let id = engine.apply_inbound(&delivery(ADDRESS, "hello"), t(0)).conversation_id;

        engine.finish(&id, t(20)).unwrap();
        let chat = engine.registry().get(&id).unwrap();
        assert_eq!(chat.status, ChatStatus::Finished);
        assert_eq!(chat.wait_time, Some(20));
        assert_eq!(chat.handle_time, Some(0));
    }

    #[test]
    fn unknown_ids_are_not_found_and_do_not_mutate() {
        let mut engine = engine();
        engine.apply_inbound(&delivery(ADDRESS, "hello"), t(0));

        assert!(matches!(engine.attend("chat-x", t(1)), Err(ChatError::NotFound(_))));
        assert!(matches!(engine.finish("chat-x", t(1)), Err(ChatError::NotFound(_))));
        assert!(matches!(engine.ensure_can_send("chat-x"), Err(ChatError::NotFound(_))));
        assert_eq!(engine.registry().len(), 1);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut engine = engine();
        let id = engine.apply_inbound(&delivery(ADDRESS, "hello"), t(0)).conversation_id;

        assert!(matches!(
            engine.ensure_can_send(&id),
            Err(ChatError::InvalidTransition { from: ChatStatus::Pending, .. })
        ));

        engine.finish(&id, t(5)).unwrap();
        assert!(matches!(
            engine.attend(&id, t(6)),
            Err(ChatError::InvalidTransition { from: ChatStatus::Finished, .. })
        ));
    }

    #[test]
    fn inbound_after_finish_reopens_same_conversation() {
        let mut engine = engine();
        let id = engine.apply_inbound(&delivery(ADDRESS, "hello"), t(0)).conversation_id;
        engine.attend(&id, t(10)).unwrap();
        engine.append_agent_message(&id, "hi, how can I help?", t(20)).unwrap();
        engine.finish(&id, t(30)).unwrap();
        let before = engine.registry().get(&id).cloned().unwrap();

        let outcome = engine.apply_inbound(&delivery(ADDRESS, "one more thing"), t(500));
        assert_eq!(outcome.kind, InboundKind::Reopened);
        assert_eq!(outcome.conversation_id, id);
        assert_eq!(event_names(&outcome.events), vec!["reopened", "newMessage"]);

        let chat = engine.registry().get(&id).unwrap();
        assert_eq!(chat.status, ChatStatus::Pending);
        assert_eq!(chat.messages[..before.messages.len()], before.messages[..]);
        assert_eq!(chat.messages.len(), before.messages.len() + 1);
        assert_eq!(chat.messages.last().unwrap().body, "one more thing");
        assert_eq!(chat.received_at, t(500));
        assert_eq!(chat.finished_at, None);
        assert_eq!(chat.attended_at, None);
        assert_eq!(chat.handle_time, None);
        assert_eq!(chat.formatted_time.finished, None);
        assert_eq!(engine.registry().len(), 1);
        assert_eq!(engine.timers.sample(&id, t(510)), Some(10));
    }

    #[test]
    fn agent_messages_keep_order() {
        let mut engine = engine();
        let id = engine.apply_inbound(&delivery(ADDRESS, "hello"), t(0)).conversation_id;
        engine.attend(&id, t(1)).unwrap();
        assert_eq!(engine.ensure_can_send(&id).unwrap(), ADDRESS);

        let (message, events) = engine.append_agent_message(&id, "first", t(2)).unwrap();
        assert_eq!(message.sender, Sender::Agent);
        assert_eq!(event_names(&events), vec!["newMessage"]);
        engine.append_agent_message(&id, "second", t(3)).unwrap();

        let bodies = engine
            .registry()
            .get(&id)
            .unwrap()
            .messages
            .iter()
            .map(|m| m.body.as_str())
            .collect::<Vec<_>>();
        assert_eq!(bodies, vec!["hello", "first", "second"]);
    }

    #[test]
    fn finished_conversation_rejects_late_agent_message() {
        let mut engine = engine();
        let id = engine.apply_inbound(&delivery(ADDRESS, "hello"), t(0)).conversation_id;
        engine.attend(&id, t(1)).unwrap();
        engine.finish(&id, t(2)).unwrap();
        let finished = engine.registry().get(&id).cloned().unwrap();

        assert!(matches!(
            engine.append_agent_message(&id, "late", t(3)),
            Err(ChatError::InvalidTransition { from: ChatStatus::Finished, .. })
        ));
        assert_eq!(engine.registry().get(&id), Some(&finished));
    }

    #[test]
    fn ids_stay_unique_within_one_millisecond() {
        let mut engine = engine();
        let other = engine.apply_inbound(&delivery("+441199990000", "hello"), t(0)).conversation_id;
        engine.finish(&other, t(1)).unwrap();
        let mut squatter = engine.registry().get(&other).cloned().unwrap();
        squatter.id = format!("chat-551199990001-{}", t(5).timestamp_millis());
        engine.registry.upsert(squatter.clone());

        let outcome = engine.apply_inbound(&delivery("+551199990001", "hi"), t(5));
        assert_eq!(outcome.kind, InboundKind::Created);
        assert_eq!(outcome.conversation_id, format!("{}-2", squatter.id));
        assert_eq!(engine.registry().get(&squatter.id), Some(&squatter));
        assert_eq!(engine.registry().live_count(), 1);
    }

    #[test]
    fn outbound_open_creates_or_reopens_as_active() {
        let mut engine = engine();
        let (id, events) = engine.open_outbound(ADDRESS, "Olá!", t(0));
        assert_eq!(event_names(&events), vec!["newConversation"]);
        let chat = engine.registry().get(&id).unwrap();
        assert_eq!(chat.status, ChatStatus::Active);
        assert_eq!(chat.wait_time, Some(0));

        let (again, events) = engine.open_outbound(ADDRESS, "Still there?", t(5));
        assert_eq!(again, id);
        assert_eq!(event_names(&events), vec!["newMessage"]);

        engine.finish(&id, t(10)).unwrap();
        let (reopened, events) = engine.open_outbound(ADDRESS, "Following up", t(60));
        assert_eq!(reopened, id);
        assert_eq!(event_names(&events), vec!["reopened"]);
        let chat = engine.registry().get(&id).unwrap();
        assert_eq!(chat.status, ChatStatus::Active);
        assert_eq!(chat.messages.len(), 3);
    }

    #[test]
    fn event_payloads_carry_full_record() {
        let mut engine = engine();
        let id = engine.apply_inbound(&delivery(ADDRESS, "hello"), t(0)).conversation_id;
        let events = engine.attend(&id, t(3)).unwrap();

        let payload = events[0].payload();
        assert_eq!(payload["conversationId"], id.as_str());
        assert_eq!(payload["status"], "active");
        assert_eq!(payload["conversation"]["waitTime"], 3);
    }

    #[test]
    fn view_samples_running_timer() {
        let mut engine = engine();
        let id = engine.apply_inbound(&delivery(ADDRESS, "hello"), t(0)).conversation_id;
        let chat = engine.registry().get(&id).cloned().unwrap();

        let view = engine.view(&chat, t(75));
        assert_eq!(view.elapsed_seconds, Some(75));
        assert_eq!(view.elapsed_display.as_deref(), Some("01:15"));
    }
}
