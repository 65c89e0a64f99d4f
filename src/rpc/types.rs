//! Wire data model shared by requests, responses and upcalls.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

use super::HelperError;

/// Binary blobs cross the pipe as standard base64 with padding.
pub fn encode_blob(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn decode_blob(data: &str) -> Result<Vec<u8>, HelperError> {
    BASE64.decode(data).map_err(HelperError::rpc)
}

/// A peer as the host sees it: IP host, TCP port, base58 peer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub host: String,
    pub libp2p_port: u16,
    pub peer_id: String,
}

/// Extracts `PeerInfo` from a remote multiaddress. Only addresses whose
/// first component is IPv4 or IPv6 followed immediately by TCP are
/// representable on the pipe; everything else is refused.
pub fn peer_info_from_multiaddr(addr: &Multiaddr, peer: &PeerId) -> Result<PeerInfo, HelperError> {
    let mut components = addr.iter();
    let host = match components.next() {
        Some(Protocol::Ip4(ip)) => ip.to_string(),
        Some(Protocol::Ip6(ip)) => ip.to_string(),
        _ => {
            return Err(HelperError::rpc(format!(
                "only IP connections are supported right now, how did this peer connect?: {addr}"
            )))
        }
    };
    let libp2p_port = match components.next() {
        Some(Protocol::Tcp(port)) => port,
        _ => {
            return Err(HelperError::rpc(
                "only TCP connections are supported right now, how did this peer connect?",
            ))
        }
    };
    Ok(PeerInfo {
        host,
        libp2p_port,
        peer_id: peer.to_base58(),
    })
}

/// Maps an optional remote address to `PeerInfo`, honoring the
/// `unsafe_no_trust_ip` testing mode: with no open connection to the peer the
/// helper normally errors, but in unsafe mode it pretends the peer is
/// localhost.
pub fn resolve_peer_info(
    remote: Option<Multiaddr>,
    peer: &PeerId,
    unsafe_no_trust_ip: bool,
) -> Result<PeerInfo, HelperError> {
    match remote {
        Some(addr) => peer_info_from_multiaddr(&addr, peer),
        None if unsafe_no_trust_ip => Ok(PeerInfo {
            host: "127.0.0.1".to_string(),
            libp2p_port: 0,
            peer_id: peer.to_base58(),
        }),
        None => Err(HelperError::p2p(
            "tried to find peer info but no open connections to that peer ID",
        )),
    }
}

/// Splits a `/ip./.../p2p/<id>` multiaddress into the peer id and the
/// transport address used to reach it.
pub fn peer_addr_of_string(s: &str) -> Result<(PeerId, Multiaddr), HelperError> {
    let mut addr: Multiaddr = s.parse().map_err(HelperError::rpc)?;
    match addr.pop() {
        Some(Protocol::P2p(peer)) => Ok((peer, addr)),
        _ => Err(HelperError::rpc(format!(
            "multiaddr {s} does not end with a /p2p component"
        ))),
    }
}

/// Gating configuration as it appears on the wire, both inside `configure`
/// and as the body of `setGatingConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatingConfig {
    #[serde(default)]
    pub banned_ips: Vec<String>,
    #[serde(default)]
    pub banned_peers: Vec<String>,
    #[serde(default)]
    pub trusted_ips: Vec<String>,
    #[serde(default)]
    pub trusted_peers: Vec<String>,
    #[serde(default)]
    pub isolate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_peer() -> PeerId {
        PeerId::random()
    }

    #[test]
    fn test_blob_codec_is_standard_padded_base64() {
        assert_eq!(encode_blob(b"hi"), "aGk=");
        assert_eq!(decode_blob("aGVsbG8=").unwrap(), b"hello");
        assert!(decode_blob("not base64!!").is_err());
    }

    #[test]
    fn test_peer_info_from_ip4_tcp() {
        let peer = some_peer();
        let addr: Multiaddr = "/ip4/10.0.0.7/tcp/8302".parse().unwrap();
        let info = peer_info_from_multiaddr(&addr, &peer).unwrap();
        assert_eq!(info.host, "10.0.0.7");
        assert_eq!(info.libp2p_port, 8302);
        assert_eq!(info.peer_id, peer.to_base58());
    }

    #[test]
    fn test_peer_info_from_ip6_tcp() {
        let addr: Multiaddr = "/ip6/::1/tcp/9000".parse().unwrap();
        let info = peer_info_from_multiaddr(&addr, &some_peer()).unwrap();
        assert_eq!(info.host, "::1");
        assert_eq!(info.libp2p_port, 9000);
    }

    #[test]
    fn test_peer_info_rejects_non_ip_and_non_tcp() {
        let peer = some_peer();
        for bad in [
            "/dns4/example.com/tcp/8302",
            "/ip4/10.0.0.7/udp/8302",
            "/ip4/10.0.0.7/udp/8302/quic-v1",
            "/memory/4",
        ] {
            let addr: Multiaddr = bad.parse().unwrap();
            assert!(
                peer_info_from_multiaddr(&addr, &peer).is_err(),
                "{bad} should be refused"
            );
        }
    }

    #[test]
    fn test_resolve_peer_info_unsafe_mode_pretends_localhost() {
        let peer = some_peer();
        let err = resolve_peer_info(None, &peer, false).unwrap_err();
        assert!(err.to_string().starts_with("libp2p error"));

        let info = resolve_peer_info(None, &peer, true).unwrap();
        assert_eq!(info.host, "127.0.0.1");
        assert_eq!(info.libp2p_port, 0);
    }

    #[test]
    fn test_peer_addr_of_string_splits_p2p_suffix() {
        let peer = some_peer();
        let s = format!("/ip4/192.168.1.4/tcp/8302/p2p/{}", peer.to_base58());
        let (parsed, addr) = peer_addr_of_string(&s).unwrap();
        assert_eq!(parsed, peer);
        assert_eq!(addr, "/ip4/192.168.1.4/tcp/8302".parse::<Multiaddr>().unwrap());

        assert!(peer_addr_of_string("/ip4/192.168.1.4/tcp/8302").is_err());
        assert!(peer_addr_of_string("garbage").is_err());
    }
}
