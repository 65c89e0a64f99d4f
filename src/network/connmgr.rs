//! Connection bookkeeping and watermark trimming.
//!
//! The tracker mirrors the swarm's open connections (the swarm driver feeds
//! it established/closed events) and answers the address questions the RPC
//! surface asks: `findPeer`, `listPeers`, and the sender lookup the pubsub
//! validator performs. When the connection count exceeds the high-water mark
//! it nominates victims, least-valuable peers first, down to the low-water
//! mark. Connections younger than the grace period and protected peers are
//! never nominated.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use libp2p::swarm::ConnectionId;
use libp2p::{Multiaddr, PeerId};

pub const LOW_WATER: usize = 25;
pub const HIGH_WATER: usize = 250;
pub const GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct TrackedConnection {
    peer: PeerId,
    addr: Multiaddr,
    opened_at: Instant,
}

#[derive(Default)]
pub struct ConnectionTracker {
    connections: HashMap<ConnectionId, TrackedConnection>,
    weights: HashMap<PeerId, i64>,
    protected: HashSet<PeerId>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_established(&mut self, peer: PeerId, id: ConnectionId, addr: Multiaddr) {
        self.connections.insert(
            id,
            TrackedConnection {
                peer,
                addr,
                opened_at: Instant::now(),
            },
        );
    }

    pub fn on_closed(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// The remote address of the first open connection to a peer, if any.
    pub fn first_addr(&self, peer: &PeerId) -> Option<Multiaddr> {
        self.connections
            .values()
            .find(|c| c.peer == *peer)
            .map(|c| c.addr.clone())
    }

    /// All remote addresses currently connected for a peer.
    pub fn addresses_of(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.connections
            .values()
            .filter(|c| c.peer == *peer)
            .map(|c| c.addr.clone())
            .collect()
    }

    /// One `(peer, remote address)` entry per open connection.
    pub fn all(&self) -> Vec<(PeerId, Multiaddr)> {
        self.connections
            .values()
            .map(|c| (c.peer, c.addr.clone()))
            .collect()
    }

    /// Adds to a peer's tag weight; heavier peers survive trimming longer.
    pub fn tag_peer(&mut self, peer: PeerId, weight: i64) {
        *self.weights.entry(peer).or_insert(0) += weight;
    }

    /// Marks a peer exempt from trimming (direct peers).
    pub fn protect(&mut self, peer: PeerId) {
        self.protected.insert(peer);
    }

    pub fn over_high_water(&self) -> bool {
        self.connections.len() > HIGH_WATER
    }

    /// Connections to close to get back down to the low-water mark, ordered
    /// least-valuable first. `now` is passed in for testability.
    pub fn trim_candidates(&self, now: Instant) -> Vec<ConnectionId> {
        if self.connections.len() <= HIGH_WATER {
            return Vec::new();
        }
        let excess = self.connections.len() - LOW_WATER;

        let mut candidates: Vec<(&ConnectionId, &TrackedConnection)> = self
            .connections
            .iter()
            .filter(|(_, c)| !self.protected.contains(&c.peer))
            .filter(|(_, c)| now.duration_since(c.opened_at) >= GRACE_PERIOD)
            .collect();
        candidates.sort_by_key(|(_, c)| {
            (
                self.weights.get(&c.peer).copied().unwrap_or(0),
                c.opened_at,
            )
        });

        candidates
            .into_iter()
            .take(excess)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(count: usize, opened_at: Instant) -> ConnectionTracker {
        let mut tracker = ConnectionTracker::new();
        for i in 0..count {
            let conn = TrackedConnection {
                peer: PeerId::random(),
                addr: "/ip4/10.0.0.1/tcp/8302".parse().unwrap(),
                opened_at,
            };
            tracker
                .connections
                .insert(ConnectionId::new_unchecked(i), conn);
        }
        tracker
    }

    #[test]
    fn test_no_trim_below_high_water() {
        let old = Instant::now() - GRACE_PERIOD * 2;
        let tracker = tracker_with(HIGH_WATER, old);
        assert!(tracker.trim_candidates(Instant::now()).is_empty());
    }

    #[test]
    fn test_trim_reaches_low_water() {
        let old = Instant::now() - GRACE_PERIOD * 2;
        let tracker = tracker_with(HIGH_WATER + 10, old);
        let victims = tracker.trim_candidates(Instant::now());
        assert_eq!(victims.len(), HIGH_WATER + 10 - LOW_WATER);
    }

    #[test]
    fn test_trim_skips_connections_in_grace() {
        let tracker = tracker_with(HIGH_WATER + 10, Instant::now());
        assert!(
            tracker.trim_candidates(Instant::now()).is_empty(),
            "fresh connections must not be trimmed"
        );
    }

    #[test]
    fn test_trim_prefers_lowest_weight_and_spares_protected() {
        let old = Instant::now() - GRACE_PERIOD * 2;
        let mut tracker = tracker_with(HIGH_WATER + 1, old);

        let heavy = tracker.connections[&ConnectionId::new_unchecked(0)].peer;
        let protected = tracker.connections[&ConnectionId::new_unchecked(1)].peer;
        tracker.tag_peer(heavy, 100);
        tracker.protect(protected);

        let victims = tracker.trim_candidates(Instant::now());
        assert_eq!(victims.len(), HIGH_WATER + 1 - LOW_WATER);
        assert!(!victims.contains(&ConnectionId::new_unchecked(1)));
        // The heavy peer sorts last; with this many zero-weight victims
        // available it survives.
        assert!(!victims.contains(&ConnectionId::new_unchecked(0)));
    }

    #[test]
    fn test_address_lookups() {
        let mut tracker = ConnectionTracker::new();
        let peer = PeerId::random();
        let addr: Multiaddr = "/ip4/10.0.0.9/tcp/8302".parse().unwrap();
        assert!(tracker.first_addr(&peer).is_none());

        tracker.on_established(peer, ConnectionId::new_unchecked(7), addr.clone());
        assert_eq!(tracker.first_addr(&peer), Some(addr.clone()));
        assert_eq!(tracker.addresses_of(&peer), vec![addr]);
        assert_eq!(tracker.all().len(), 1);

        tracker.on_closed(ConnectionId::new_unchecked(7));
        assert!(tracker.is_empty());
    }
}
