use std::collections::HashMap;

use crate::types::{ChatStatus, Conversation};

/// In-memory conversation table keyed by id, indexed by counterparty address.
///
/// `live_by_address` only holds pending and active conversations;
/// `latest_by_address` remembers the most recent record for an address
/// regardless of status so a finished conversation can be reopened.
#[derive(Debug, Default)]
pub struct ChatRegistry {
    chats: HashMap<String, Conversation>,
    live_by_address: HashMap<String, String>,
    latest_by_address: HashMap<String, String>,
}

impl ChatRegistry {
    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.chats.get(id)
    }

    pub fn find_by_address(&self, address: &str) -> Option<&Conversation> {
        self.live_by_address
            .get(address)
            .and_then(|id| self.chats.get(id))
    }

    pub fn find_any_by_address(&self, address: &str) -> Option<&Conversation> {
        self.find_by_address(address).or_else(|| {
            self.latest_by_address
                .get(address)
                .and_then(|id| self.chats.get(id))
        })
    }

    /// Replaces the whole record stored under its id and keeps the address
    /// indices in step with its status.
    pub fn upsert(&mut self, record: Conversation) {
        if record.status.is_live() {
            let previous = self
                .live_by_address
                .insert(record.address.clone(), record.id.clone());
            debug_assert!(
                previous.as_deref().map_or(true, |id| id == record.id),
                "two live conversations for address {}",
                record.address
            );
        } else if self.live_by_address.get(&record.address) == Some(&record.id) {
            self.live_by_address.remove(&record.address);
        }
        self.latest_by_address
            .insert(record.address.clone(), record.id.clone());
        self.chats.insert(record.id.clone(), record);
    }

    /// Conversations in `status`, oldest request first.
    pub fn all_by_status(&self, status: ChatStatus) -> Vec<&Conversation> {
        let mut list = self
            .chats
            .values()
            .filter(|chat| chat.status == status)
            .collect::<Vec<_>>();
        sort_by_received(&mut list);
        list
    }

    pub fn all(&self) -> Vec<&Conversation> {
        let mut list = self.chats.values().collect::<Vec<_>>();
        sort_by_received(&mut list);
        list
    }

    pub fn live_count(&self) -> usize {
        self.live_by_address.len()
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }
}

fn sort_by_received(list: &mut [&Conversation]) {
    list.sort_by(|a, b| {
        a.received_at
            .cmp(&b.received_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
