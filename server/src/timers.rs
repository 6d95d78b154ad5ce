use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Running wait/handle timers, one per conversation. Elapsed time is always
/// derived from the stored start instant.
#[derive(Debug, Default)]
pub struct ElapsedTracker {
    started_at: HashMap<String, DateTime<Utc>>,
}

impl ElapsedTracker {
    pub fn start(&mut self, conversation_id: &str, now: DateTime<Utc>) {
        self.started_at.insert(conversation_id.to_string(), now);
    }

    pub fn stop(&mut self, conversation_id: &str, now: DateTime<Utc>) -> Option<i64> {
        self.started_at
            .remove(conversation_id)
            .map(|start| elapsed_seconds(start, now))
    }

    pub fn sample(&self, conversation_id: &str, now: DateTime<Utc>) -> Option<i64> {
        self.started_at
            .get(conversation_id)
            .map(|start| elapsed_seconds(*start, now))
    }
}

pub fn elapsed_seconds(start: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - start).num_seconds().max(0)
}

pub fn format_seconds(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}
