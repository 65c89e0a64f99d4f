//! Gossip validation plumbing: the ticket table that bridges gossipsub's
//! held-back messages to the host's asynchronous verdicts, and the
//! subscription index maps.
//!
//! Gossipsub runs with message validation delegated to the application:
//! every inbound message is parked until someone reports a verdict for it.
//! The swarm driver mints a ticket per message, emits a `validate` upcall,
//! and either the host's `validationComplete` or the 5-minute deadline
//! reports the verdict. A ticket is only removed when the host answers —
//! deliberately not on timeout, so a verdict arriving minutes late is still
//! recognized (and its latency logged) instead of surfacing as an unknown
//! seqno.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use libp2p::gossipsub::{IdentTopic, MessageAcceptance, MessageId, TopicHash};
use libp2p::PeerId;
use parking_lot::Mutex;
use tracing::warn;

/// Gossipsub refuses messages above this size.
pub const GOSSIP_MAX_SIZE: usize = 32 * 1024 * 1024;

/// How long a parked message waits for the host's verdict.
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The host's verdict on one gossip message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
    Ignore,
}

impl Verdict {
    /// Maps the wire string. Anything unrecognized downgrades to `Ignore`
    /// rather than failing the RPC.
    pub fn parse(s: &str) -> Verdict {
        match s {
            "accept" => Verdict::Accept,
            "reject" => Verdict::Reject,
            "ignore" => Verdict::Ignore,
            other => {
                warn!(verdict = other, "unknown validation verdict, ignoring message");
                Verdict::Ignore
            }
        }
    }

    pub fn acceptance(self) -> MessageAcceptance {
        match self {
            Verdict::Accept => MessageAcceptance::Accept,
            Verdict::Reject => MessageAcceptance::Reject,
            Verdict::Ignore => MessageAcceptance::Ignore,
        }
    }
}

/// One pending validator round-trip.
#[derive(Debug, Clone)]
pub struct ValidationTicket {
    pub message_id: MessageId,
    pub source: PeerId,
    /// Set when the deadline fired before the host answered. The verdict has
    /// already been reported to gossipsub by then; the host's late answer is
    /// only logged.
    pub timed_out_at: Option<Instant>,
}

/// seqno → pending ticket, shared between the swarm driver (inserts,
/// timeouts) and the dispatcher (`validationComplete`).
#[derive(Default)]
pub struct Validators {
    inner: Mutex<HashMap<u64, ValidationTicket>>,
}

impl Validators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, seqno: u64, ticket: ValidationTicket) {
        self.inner.lock().insert(seqno, ticket);
    }

    /// The host answered: remove and return the ticket. `None` means the
    /// seqno was never issued or was already answered.
    pub fn complete(&self, seqno: u64) -> Option<ValidationTicket> {
        self.inner.lock().remove(&seqno)
    }

    /// The deadline fired. Marks the ticket and returns what to report to
    /// gossipsub — or `None` if the host already answered, or the deadline
    /// already fired once.
    pub fn begin_timeout(&self, seqno: u64, now: Instant) -> Option<(MessageId, PeerId)> {
        let mut table = self.inner.lock();
        let ticket = table.get_mut(&seqno)?;
        if ticket.timed_out_at.is_some() {
            return None;
        }
        ticket.timed_out_at = Some(now);
        Some((ticket.message_id.clone(), ticket.source))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[derive(Default)]
struct SubscriptionMaps {
    topic_by_idx: HashMap<u64, String>,
    idx_by_topic: HashMap<TopicHash, u64>,
}

/// The host-chosen subscription indices, mapped both ways: the dispatcher
/// removes by index on `unsubscribe`, the swarm driver looks up the index
/// for each inbound message's topic.
#[derive(Default)]
pub struct SubscriptionTable {
    inner: Mutex<SubscriptionMaps>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, idx: u64, topic: String) {
        let hash = IdentTopic::new(topic.clone()).hash();
        let mut maps = self.inner.lock();
        maps.topic_by_idx.insert(idx, topic);
        maps.idx_by_topic.insert(hash, idx);
    }

    /// Removes a subscription by index, returning its topic.
    pub fn remove(&self, idx: u64) -> Option<String> {
        let mut maps = self.inner.lock();
        let topic = maps.topic_by_idx.remove(&idx)?;
        maps.idx_by_topic.remove(&IdentTopic::new(topic.clone()).hash());
        Some(topic)
    }

    pub fn idx_for(&self, topic: &TopicHash) -> Option<u64> {
        self.inner.lock().idx_by_topic.get(topic).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> ValidationTicket {
        ValidationTicket {
            message_id: MessageId::new(b"msg-1"),
            source: PeerId::random(),
            timed_out_at: None,
        }
    }

    #[test]
    fn test_verdict_parsing() {
        assert_eq!(Verdict::parse("accept"), Verdict::Accept);
        assert_eq!(Verdict::parse("reject"), Verdict::Reject);
        assert_eq!(Verdict::parse("ignore"), Verdict::Ignore);
        assert_eq!(Verdict::parse("maybe?"), Verdict::Ignore);
    }

    #[test]
    fn test_complete_removes_ticket() {
        let validators = Validators::new();
        validators.insert(3, ticket());
        assert!(validators.complete(3).is_some());
        assert!(validators.complete(3).is_none(), "second answer is unknown");
        assert!(validators.is_empty());
    }

    #[test]
    fn test_timeout_keeps_ticket_for_late_answers() {
        let validators = Validators::new();
        validators.insert(5, ticket());

        let report = validators.begin_timeout(5, Instant::now());
        assert!(report.is_some(), "first deadline reports a verdict");
        assert_eq!(validators.len(), 1, "ticket survives the timeout");

        assert!(
            validators.begin_timeout(5, Instant::now()).is_none(),
            "deadline only fires once"
        );

        let late = validators.complete(5).expect("late answer still resolves");
        assert!(late.timed_out_at.is_some());
    }

    #[test]
    fn test_timeout_after_answer_is_a_no_op() {
        let validators = Validators::new();
        validators.insert(8, ticket());
        validators.complete(8);
        assert!(validators.begin_timeout(8, Instant::now()).is_none());
    }

    #[test]
    fn test_subscription_table_maps_both_ways() {
        let subs = SubscriptionTable::new();
        subs.insert(7, "blocks".to_string());

        let hash = IdentTopic::new("blocks").hash();
        assert_eq!(subs.idx_for(&hash), Some(7));

        assert_eq!(subs.remove(7), Some("blocks".to_string()));
        assert_eq!(subs.idx_for(&hash), None);
        assert_eq!(subs.remove(7), None);
    }
}
