//! Discovery constants and the rendezvous key.
//!
//! Peers on the same network agree on a rendezvous string derived from the
//! network id; each node advertises itself as a provider of that key in the
//! DHT and periodically asks for other providers. Local peers are found over
//! mDNS, and every new connection doubles as a discovery event.

use std::time::Duration;

use libp2p::kad::RecordKey;

/// mDNS query interval.
pub const MDNS_QUERY_INTERVAL: Duration = Duration::from_secs(60);

/// How often the rendezvous provider query re-runs.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Cap on providers ingested per rendezvous query round.
pub const DISCOVERY_LIMIT: usize = 20;

/// The rendezvous string shared by every node on a network.
pub fn rendezvous_string(network_id: &str) -> String {
    format!("/coda/0.0.1/{network_id}")
}

/// The DHT key nodes advertise under.
pub fn rendezvous_key(rendezvous: &str) -> RecordKey {
    RecordKey::new(&rendezvous.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendezvous_embeds_network_id() {
        assert_eq!(rendezvous_string("mainnet"), "/coda/0.0.1/mainnet");
        assert_ne!(
            rendezvous_key(&rendezvous_string("a")),
            rendezvous_key(&rendezvous_string("b"))
        );
    }
}
