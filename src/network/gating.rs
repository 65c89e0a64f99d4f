//! Connection gating: mutable allow/deny sets over peer ids and IP ranges,
//! consulted at every dial, accept and security-upgrade checkpoint.
//!
//! The policy is replaced wholesale by `setGatingConfig`; existing
//! connections are left alone, the new rules only apply at future
//! checkpoints. All connections are symmetric: if we may connect to a peer,
//! that peer may connect to us, so the inbound and outbound checks share the
//! same rules.

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::task::{Context, Poll};

use libp2p::core::transport::PortUse;
use libp2p::core::{Endpoint, Multiaddr};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{
    dummy, ConnectionDenied, ConnectionId, FromSwarm, NetworkBehaviour, THandler, THandlerInEvent,
    THandlerOutEvent, ToSwarm,
};
use libp2p::PeerId;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::warn;

use crate::rpc::types::GatingConfig;
use crate::rpc::HelperError;

/// An IP range in CIDR form. Only what the gating rules need: /32 host
/// rules, the deny-all `0.0.0.0/0`, and exact containment checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    ip: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// A rule matching exactly one address.
    pub fn host(ip: IpAddr) -> Self {
        let prefix = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { ip, prefix }
    }

    /// `0.0.0.0/0`.
    pub fn any_v4() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix: 0,
        }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.ip, addr) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

/// The full rule set. Allow rules always win over deny rules, both for
/// addresses and for peers: a peer that is simultaneously trusted and banned
/// is trusted.
#[derive(Debug, Clone, Default)]
pub struct GatingPolicy {
    allow_addrs: Vec<Cidr>,
    deny_addrs: Vec<Cidr>,
    allowed_peers: HashSet<PeerId>,
    denied_peers: HashSet<PeerId>,
}

impl GatingPolicy {
    /// Builds a policy from the wire configuration. Banned and trusted IPs
    /// must be IPv4 (stored as /32 rules); undecodable peer ids are logged
    /// and skipped rather than failing the whole config.
    pub fn from_config(config: &GatingConfig) -> Result<Self, HelperError> {
        let mut policy = GatingPolicy::default();

        if config.isolate {
            policy.deny_addrs.push(Cidr::any_v4());
        }
        for ip in &config.banned_ips {
            policy.deny_addrs.push(parse_host_rule(ip)?);
        }
        for ip in &config.trusted_ips {
            policy.allow_addrs.push(parse_host_rule(ip)?);
        }
        for peer in &config.banned_peers {
            match peer.parse() {
                Ok(id) => {
                    policy.denied_peers.insert(id);
                }
                Err(e) => warn!(peer, error = %e, "skipping unparseable banned peer id"),
            }
        }
        for peer in &config.trusted_peers {
            match peer.parse() {
                Ok(id) => {
                    policy.allowed_peers.insert(id);
                }
                Err(e) => warn!(peer, error = %e, "skipping unparseable trusted peer id"),
            }
        }

        Ok(policy)
    }

    /// Peer rule: allowed unless denied, and `allowed_peers` overrides
    /// `denied_peers`.
    pub fn peer_allowed(&self, peer: &PeerId) -> bool {
        self.allowed_peers.contains(peer) || !self.denied_peers.contains(peer)
    }

    /// Address rule. Non-IP multiaddresses carry no address to filter and
    /// pass through.
    pub fn addr_allowed(&self, addr: &Multiaddr) -> bool {
        let ip = match addr.iter().next() {
            Some(Protocol::Ip4(ip)) => IpAddr::V4(ip),
            Some(Protocol::Ip6(ip)) => IpAddr::V6(ip),
            _ => return true,
        };
        if self.allow_addrs.iter().any(|c| c.contains(&ip)) {
            return true;
        }
        !self.deny_addrs.iter().any(|c| c.contains(&ip))
    }

    /// The post-security-handshake rule: both the peer and the address rule
    /// must pass.
    pub fn secured_allowed(&self, peer: &PeerId, addr: &Multiaddr) -> bool {
        self.peer_allowed(peer) && self.addr_allowed(addr)
    }
}

fn parse_host_rule(ip: &str) -> Result<Cidr, HelperError> {
    match ip.parse::<Ipv4Addr>() {
        Ok(v4) => Ok(Cidr::host(IpAddr::V4(v4))),
        Err(_) => Err(HelperError::rpc("unparsable IP or IPv6")),
    }
}

/// Shared, atomically replaceable gating state. The p2p layer reads it
/// without coordination; a reader sees either the full old policy or the
/// full new one.
#[derive(Clone)]
pub struct GatingState {
    inner: Arc<RwLock<GatingPolicy>>,
}

impl GatingState {
    pub fn new(policy: GatingPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(policy)),
        }
    }

    pub fn replace(&self, policy: GatingPolicy) {
        *self.inner.write() = policy;
    }

    pub fn peer_allowed(&self, peer: &PeerId) -> bool {
        self.inner.read().peer_allowed(peer)
    }

    pub fn addr_allowed(&self, addr: &Multiaddr) -> bool {
        self.inner.read().addr_allowed(addr)
    }

    pub fn secured_allowed(&self, peer: &PeerId, addr: &Multiaddr) -> bool {
        self.inner.read().secured_allowed(peer, addr)
    }
}

#[derive(Debug, Error)]
#[error("connection gated")]
struct Gated;

/// The connection-gating behaviour. It produces no events and installs no
/// protocol handlers; its whole job is to veto connections at the swarm's
/// connection-lifecycle checkpoints.
pub struct Behaviour {
    state: GatingState,
}

impl Behaviour {
    pub fn new(state: GatingState) -> Self {
        Self { state }
    }
}

impl NetworkBehaviour for Behaviour {
    type ConnectionHandler = dummy::ConnectionHandler;
    type ToSwarm = Infallible;

    // Inbound accept: the remote peer id is not known yet, only the address
    // rule applies.
    fn handle_pending_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        _local_addr: &Multiaddr,
        remote_addr: &Multiaddr,
    ) -> Result<(), ConnectionDenied> {
        if self.state.addr_allowed(remote_addr) {
            Ok(())
        } else {
            Err(ConnectionDenied::new(Gated))
        }
    }

    // Inbound secured: peer id is authenticated by now.
    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        _local_addr: &Multiaddr,
        remote_addr: &Multiaddr,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        if self.state.secured_allowed(&peer, remote_addr) {
            Ok(dummy::ConnectionHandler)
        } else {
            Err(ConnectionDenied::new(Gated))
        }
    }

    // Peer dial.
    fn handle_pending_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        maybe_peer: Option<PeerId>,
        _addresses: &[Multiaddr],
        _effective_role: Endpoint,
    ) -> Result<Vec<Multiaddr>, ConnectionDenied> {
        if let Some(peer) = maybe_peer {
            if !self.state.peer_allowed(&peer) {
                return Err(ConnectionDenied::new(Gated));
            }
        }
        Ok(Vec::new())
    }

    // Outbound secured: the address rule applies here, after the dial has
    // resolved to a concrete remote address.
    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        addr: &Multiaddr,
        _role_override: Endpoint,
        _port_use: PortUse,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        if self.state.secured_allowed(&peer, addr) {
            Ok(dummy::ConnectionHandler)
        } else {
            Err(ConnectionDenied::new(Gated))
        }
    }

    fn on_swarm_event(&mut self, _event: FromSwarm) {}

    fn on_connection_handler_event(
        &mut self,
        _peer_id: PeerId,
        _connection_id: ConnectionId,
        event: THandlerOutEvent<Self>,
    ) {
        match event {}
    }

    fn poll(
        &mut self,
        _cx: &mut Context<'_>,
    ) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(
        banned_ips: &[&str],
        trusted_ips: &[&str],
        banned_peers: &[PeerId],
        trusted_peers: &[PeerId],
        isolate: bool,
    ) -> GatingConfig {
        GatingConfig {
            banned_ips: banned_ips.iter().map(|s| s.to_string()).collect(),
            trusted_ips: trusted_ips.iter().map(|s| s.to_string()).collect(),
            banned_peers: banned_peers.iter().map(|p| p.to_base58()).collect(),
            trusted_peers: trusted_peers.iter().map(|p| p.to_base58()).collect(),
            isolate,
        }
    }

    fn maddr(ip: &str) -> Multiaddr {
        format!("/ip4/{ip}/tcp/8302").parse().unwrap()
    }

    #[test]
    fn test_default_policy_allows_everything() {
        let policy = GatingPolicy::default();
        assert!(policy.peer_allowed(&PeerId::random()));
        assert!(policy.addr_allowed(&maddr("8.8.8.8")));
    }

    #[test]
    fn test_allowed_peers_override_denied_peers() {
        let peer = PeerId::random();
        let policy =
            GatingPolicy::from_config(&config(&[], &[], &[peer], &[peer], false)).unwrap();
        assert!(policy.peer_allowed(&peer), "trusted wins over banned");

        let denied_only =
            GatingPolicy::from_config(&config(&[], &[], &[peer], &[], false)).unwrap();
        assert!(!denied_only.peer_allowed(&peer));
    }

    #[test]
    fn test_banned_ip_matches_exactly_one_host() {
        let policy =
            GatingPolicy::from_config(&config(&["10.0.0.7"], &[], &[], &[], false)).unwrap();
        assert!(!policy.addr_allowed(&maddr("10.0.0.7")));
        assert!(policy.addr_allowed(&maddr("10.0.0.8")));
    }

    #[test]
    fn test_isolate_denies_all_except_trusted() {
        let policy =
            GatingPolicy::from_config(&config(&[], &["10.0.0.7"], &[], &[], true)).unwrap();
        assert!(!policy.addr_allowed(&maddr("8.8.8.8")));
        assert!(!policy.addr_allowed(&maddr("192.168.1.1")));
        assert!(policy.addr_allowed(&maddr("10.0.0.7")));
    }

    #[test]
    fn test_non_ip_addresses_pass_the_address_rule() {
        let policy = GatingPolicy::from_config(&config(&[], &[], &[], &[], true)).unwrap();
        let addr: Multiaddr = "/memory/4".parse().unwrap();
        assert!(policy.addr_allowed(&addr));
    }

    #[test]
    fn test_unparseable_ips_are_config_errors() {
        assert!(GatingPolicy::from_config(&config(&["nonsense"], &[], &[], &[], false)).is_err());
        assert!(GatingPolicy::from_config(&config(&[], &["::1"], &[], &[], false)).is_err());
    }

    #[test]
    fn test_unparseable_peer_ids_are_skipped() {
        let cfg = GatingConfig {
            banned_peers: vec!["not-a-peer-id".into()],
            ..Default::default()
        };
        let policy = GatingPolicy::from_config(&cfg).unwrap();
        assert!(policy.peer_allowed(&PeerId::random()));
    }

    #[test]
    fn test_replace_swaps_the_whole_policy() {
        let peer = PeerId::random();
        let state = GatingState::new(
            GatingPolicy::from_config(&config(&[], &[], &[peer], &[], false)).unwrap(),
        );
        assert!(!state.peer_allowed(&peer));

        state.replace(
            GatingPolicy::from_config(&config(&[], &[], &[peer], &[peer], false)).unwrap(),
        );
        assert!(state.peer_allowed(&peer));
    }

    #[test]
    fn test_cidr_v6_containment() {
        let rule = Cidr::host("::1".parse().unwrap());
        assert!(rule.contains(&"::1".parse().unwrap()));
        assert!(!rule.contains(&"::2".parse().unwrap()));
        assert!(!rule.contains(&"127.0.0.1".parse().unwrap()));
    }
}
