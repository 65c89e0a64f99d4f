//! Combined network behaviour for the helper host.

use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{gossipsub, identify, kad, mdns, ping, upnp, StreamProtocol};
use libp2p_stream as stream;

use super::discovery::MDNS_QUERY_INTERVAL;
use super::gating::{self, GatingState};
use super::pubsub::GOSSIP_MAX_SIZE;
use crate::storage::DhtStore;

/// Kademlia protocol path; one routing table serves both WAN and LAN peers.
pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/coda/kad/1.0.0");

/// Identify protocol version and the agent string announced with it.
pub const IDENTIFY_PROTOCOL: &str = "/coda/id/1.0.0";
pub const AGENT_VERSION: &str = concat!("libp2p-helper/", env!("CARGO_PKG_VERSION"));

/// Combined behaviour: gating first (it vetoes connections before anything
/// else sees them), then the protocol stack.
#[derive(NetworkBehaviour)]
pub struct HelperBehaviour {
    /// Allow/deny checks at every dial, accept and secure checkpoint.
    pub gating: gating::Behaviour,
    /// Gossip overlay with host-supervised message validation.
    pub gossipsub: gossipsub::Behaviour,
    /// Kademlia DHT for rendezvous discovery and public-key records.
    pub kademlia: kad::Behaviour<DhtStore>,
    /// Peer info exchange; learned listen addresses feed the routing table.
    pub identify: identify::Behaviour,
    /// Connection keepalive.
    pub ping: ping::Behaviour,
    /// Local discovery.
    pub mdns: mdns::tokio::Behaviour,
    /// NAT port mapping.
    pub upnp: upnp::tokio::Behaviour,
    /// Application-defined bidirectional streams.
    pub stream: stream::Behaviour,
}

impl HelperBehaviour {
    pub fn new(
        keypair: &Keypair,
        gating: GatingState,
        dht_store: DhtStore,
        flood: bool,
        peer_exchange: bool,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let local_peer_id = keypair.public().to_peer_id();

        let mut gossipsub_config = gossipsub::ConfigBuilder::default();
        gossipsub_config
            .max_transmit_size(GOSSIP_MAX_SIZE)
            .validate_messages()
            .flood_publish(flood);
        if peer_exchange {
            gossipsub_config.do_px();
        }
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossipsub_config.build()?,
        )?;

        let mut kad_config = kad::Config::new(KAD_PROTOCOL);
        kad_config.set_query_timeout(Duration::from_secs(60));
        // Inbound records are filtered by the swarm driver: only the public
        // key namespace is ever stored.
        kad_config.set_record_filtering(kad::StoreInserts::FilterBoth);
        let mut kademlia = kad::Behaviour::with_config(local_peer_id, dht_store, kad_config);
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
                .with_agent_version(AGENT_VERSION.to_string()),
        );

        let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(30)));

        let mdns = mdns::tokio::Behaviour::new(
            mdns::Config {
                query_interval: MDNS_QUERY_INTERVAL,
                ..Default::default()
            },
            local_peer_id,
        )?;

        Ok(Self {
            gating: gating::Behaviour::new(gating),
            gossipsub,
            kademlia,
            identify,
            ping,
            mdns,
            upnp: upnp::tokio::Behaviour::default(),
            stream: stream::Behaviour::new(),
        })
    }
}
