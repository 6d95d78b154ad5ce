//! Time-windowed fingerprint ledgers used to drop repeated webhook deliveries
//! and double-submitted agent sends.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Inbound deliveries key on the provider message id when present. Without
    /// one the creation instant is reduced to a coarse bucket, which is
    /// best-effort: repeats straddling a bucket boundary are admitted twice.
    pub fn inbound(
        address: &str,
        body: &str,
        provider_message_id: Option<&str>,
        received_at: DateTime<Utc>,
        bucket_secs: i64,
    ) -> Self {
        let discriminator = match provider_message_id.map(str::trim) {
            Some(id) if !id.is_empty() => format!("sid:{id}"),
            _ => format!(
                "bucket:{}",
                received_at.timestamp().div_euclid(bucket_secs.max(1))
            ),
        };
        Self::from_parts(&["inbound", address, body, &discriminator])
    }

    pub fn outbound(conversation_id: &str, body: &str, client_token: &str) -> Self {
        Self::from_parts(&["outbound", conversation_id, body, client_token])
    }

    pub fn start_conversation(address: &str, body: &str) -> Self {
        Self::from_parts(&["start", address, body])
    }

    fn from_parts(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug)]
pub struct DedupLedger {
    window: Duration,
    expires_at: HashMap<Fingerprint, DateTime<Utc>>,
}

impl DedupLedger {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::days(365)),
            expires_at: HashMap::new(),
        }
    }

    /// Records the fingerprint and returns true unless it was already seen
    /// inside the window.
    pub fn admit(&mut self, fingerprint: Fingerprint, now: DateTime<Utc>) -> bool {
        self.sweep(now);
        if self.expires_at.contains_key(&fingerprint) {
            return false;
        }
        let expiry = now.checked_add_signed(self.window).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.expires_at.insert(fingerprint, expiry);
        true
    }

    /// Drops a fingerprint early so a failed action can be retried at once.
    pub fn forget(&mut self, fingerprint: &Fingerprint) {
        self.expires_at.remove(fingerprint);
    }

    pub fn sweep(&mut self, now: DateTime<Utc>) {
        self.expires_at.retain(|_, expiry| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.expires_at.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expires_at.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn repeat_inside_window_is_rejected() {
        let mut ledger = DedupLedger::new(std::time::Duration::from_secs(600));
        let fp = Fingerprint::inbound("+551199990000", "hello", Some("SM1"), at(0), 60);

        assert!(ledger.admit(fp.clone(), at(0)));
        assert!(!ledger.admit(fp.clone(), at(1)));
        assert!(!ledger.admit(fp, at(599)));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn repeat_after_window_is_admitted_again() {
        let mut ledger = DedupLedger::new(std::time::Duration::from_secs(5));
        let fp = Fingerprint::outbound("chat-1", "hi", "token-1");

        assert!(ledger.admit(fp.clone(), at(0)));
        assert!(ledger.admit(fp, at(5)));
    }

    #[test]
    fn sweep_evicts_only_expired_entries() {
        let mut ledger = DedupLedger::new(std::time::Duration::from_secs(10));
        assert!(ledger.admit(Fingerprint::outbound("a", "x", "1"), at(0)));
        assert!(ledger.admit(Fingerprint::outbound("b", "x", "1"), at(8)));

        ledger.sweep(at(12));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn forget_allows_immediate_retry() {
        let mut ledger = DedupLedger::new(std::time::Duration::from_secs(5));
        let fp = Fingerprint::outbound("chat-1", "hi", "token-1");
        assert!(ledger.admit(fp.clone(), at(0)));
        ledger.forget(&fp);
        assert!(ledger.admit(fp, at(1)));
    }

    #[test]
    fn provider_id_takes_precedence_over_time_bucket() {
        let first = Fingerprint::inbound("+55", "hi", Some("SM1"), at(0), 60);
        let later = Fingerprint::inbound("+55", "hi", Some("SM1"), at(3600), 60);
        assert_eq!(first, later);

        let other_sid = Fingerprint::inbound("+55", "hi", Some("SM2"), at(0), 60);
        assert_ne!(first, other_sid);
    }

    #[test]
    fn bucket_fallback_groups_nearby_deliveries() {
        let a = Fingerprint::inbound("+55", "hi", None, at(0), 60);
        let b = Fingerprint::inbound("+55", "hi", Some("  "), at(30), 60);
        let c = Fingerprint::inbound("+55", "hi", None, at(61), 60);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn parts_are_length_prefixed() {
        let a = Fingerprint::outbound("ab", "c", "t");
        let b = Fingerprint::outbound("a", "bc", "t");
        assert_ne!(a, b);
        assert_eq!(a.0.len(), 64);
    }
}
