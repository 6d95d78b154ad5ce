#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use serde_json::Value;
use support_desk::{
    config::Config, desk::Desk, error::ChatError, provider::OutboundProvider,
    types::InboundDelivery,
};
use tokio::sync::{mpsc::UnboundedReceiver, Notify};

pub const ADDRESS: &str = "+551199990000";

#[derive(Default)]
pub struct FakeProvider {
    pub sent: Mutex<Vec<(String, String)>>,
    pub failing: AtomicBool,
}

impl FakeProvider {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundProvider for FakeProvider {
    fn is_configured(&self) -> bool {
        true
    }

    async fn send_text(&self, destination: &str, body: &str) -> Result<(), ChatError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChatError::Delivery("provider unavailable".into()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), body.to_string()));
        Ok(())
    }
}

/// Holds every send until `release` is called; `started` fires once the
/// provider call is in flight.
#[derive(Default)]
pub struct GatedProvider {
    pub started: Notify,
    pub gate: Notify,
}

impl GatedProvider {
    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl OutboundProvider for GatedProvider {
    fn is_configured(&self) -> bool {
        true
    }

    async fn send_text(&self, _destination: &str, _body: &str) -> Result<(), ChatError> {
        self.started.notify_one();
        self.gate.notified().await;
        Ok(())
    }
}

pub fn desk_with(config: Config) -> (Arc<Desk>, Arc<FakeProvider>) {
    let provider = Arc::new(FakeProvider::default());
    let desk = Arc::new(Desk::new(&config, provider.clone()));
    (desk, provider)
}

pub fn desk() -> (Arc<Desk>, Arc<FakeProvider>) {
    desk_with(Config::default())
}

pub fn delivery(address: &str, body: &str, sid: Option<&str>) -> InboundDelivery {
    InboundDelivery {
        address: address.to_string(),
        body: body.to_string(),
        display_name: Some("Maria".into()),
        provider_message_id: sid.map(str::to_string),
    }
}

/// Everything queued for a session so far, as (event, data) pairs.
pub fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<(String, Value)> {
    let mut events = Vec::new();
    while let Ok(raw) = rx.try_recv() {
        let value: Value = serde_json::from_str(&raw).unwrap();
        events.push((
            value["event"].as_str().unwrap_or_default().to_string(),
            value["data"].clone(),
        ));
    }
    events
}

pub fn names(events: &[(String, Value)]) -> Vec<&str> {
    events.iter().map(|(name, _)| name.as_str()).collect()
}
