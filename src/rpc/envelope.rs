//! Command envelopes and the closed method enumeration.
//!
//! The host addresses methods by integer tag; the tags are positionally
//! assigned and stable, so the enum below is the single source of truth for
//! the wire numbering.

use serde::Deserialize;
use thiserror::Error;

use super::types::GatingConfig;

/// One line on stdin.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub method: u64,
    pub seqno: u64,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// The closed method enumeration. Integer values are positional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Configure = 0,
    Listen,
    Publish,
    Subscribe,
    Unsubscribe,
    ValidationComplete,
    GenerateKeypair,
    OpenStream,
    CloseStream,
    ResetStream,
    SendStreamMsg,
    RemoveStreamHandler,
    AddStreamHandler,
    ListeningAddrs,
    AddPeer,
    BeginAdvertising,
    FindPeer,
    ListPeers,
    SetGatingConfig,
}

impl Method {
    pub fn from_tag(tag: u64) -> Option<Method> {
        use Method::*;
        Some(match tag {
            0 => Configure,
            1 => Listen,
            2 => Publish,
            3 => Subscribe,
            4 => Unsubscribe,
            5 => ValidationComplete,
            6 => GenerateKeypair,
            7 => OpenStream,
            8 => CloseStream,
            9 => ResetStream,
            10 => SendStreamMsg,
            11 => RemoveStreamHandler,
            12 => AddStreamHandler,
            13 => ListeningAddrs,
            14 => AddPeer,
            15 => BeginAdvertising,
            16 => FindPeer,
            17 => ListPeers,
            18 => SetGatingConfig,
            _ => return None,
        })
    }
}

/// Fatal protocol errors. Any of these terminates the helper; the host is
/// expected to restart it.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),
    #[error("unknown method tag {0}")]
    UnknownMethod(u64),
    #[error("malformed body for {method:?}: {source}")]
    MalformedBody {
        method: Method,
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
pub struct ConfigureBody {
    pub statedir: String,
    pub privk: String,
    pub network_id: String,
    #[serde(rename = "ifaces", default)]
    pub listen_on: Vec<String>,
    #[serde(rename = "external_maddr")]
    pub external: String,
    #[serde(default)]
    pub unsafe_no_trust_ip: bool,
    #[serde(default)]
    pub flood: bool,
    #[serde(default)]
    pub peer_exchange: bool,
    #[serde(default)]
    pub direct_peers: Vec<String>,
    #[serde(default)]
    pub seed_peers: Vec<String>,
    #[serde(default)]
    pub gating_config: GatingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ListenBody {
    pub iface: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishBody {
    pub topic: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeBody {
    pub topic: String,
    #[serde(rename = "subscription_idx")]
    pub subscription: u64,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeBody {
    #[serde(rename = "subscription_idx")]
    pub subscription: u64,
}

#[derive(Debug, Deserialize)]
pub struct ValidationCompleteBody {
    pub seqno: u64,
    #[serde(rename = "is_valid")]
    pub verdict: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenStreamBody {
    pub peer: String,
    #[serde(rename = "protocol")]
    pub protocol_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamIdxBody {
    pub stream_idx: u64,
}

#[derive(Debug, Deserialize)]
pub struct SendStreamMsgBody {
    pub stream_idx: u64,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct ProtocolBody {
    pub protocol: String,
}

#[derive(Debug, Deserialize)]
pub struct AddPeerBody {
    pub multiaddr: String,
}

#[derive(Debug, Deserialize)]
pub struct FindPeerBody {
    pub peer_id: String,
}

/// A fully parsed request: the tagged-variant counterpart of the dynamic
/// tag → handler table the wire format implies.
#[derive(Debug)]
pub enum Request {
    Configure(ConfigureBody),
    Listen(ListenBody),
    Publish(PublishBody),
    Subscribe(SubscribeBody),
    Unsubscribe(UnsubscribeBody),
    ValidationComplete(ValidationCompleteBody),
    GenerateKeypair,
    OpenStream(OpenStreamBody),
    CloseStream(StreamIdxBody),
    ResetStream(StreamIdxBody),
    SendStreamMsg(SendStreamMsgBody),
    RemoveStreamHandler(ProtocolBody),
    AddStreamHandler(ProtocolBody),
    ListeningAddrs,
    AddPeer(AddPeerBody),
    BeginAdvertising,
    FindPeer(FindPeerBody),
    ListPeers,
    SetGatingConfig(GatingConfig),
}

impl Request {
    /// Resolves the numeric tag and deserializes the body. Both failure
    /// modes are protocol violations, not per-request errors.
    pub fn parse(tag: u64, body: serde_json::Value) -> Result<Request, ProtocolViolation> {
        let method = Method::from_tag(tag).ok_or(ProtocolViolation::UnknownMethod(tag))?;

        fn body_of<T: serde::de::DeserializeOwned>(
            method: Method,
            body: serde_json::Value,
        ) -> Result<T, ProtocolViolation> {
            serde_json::from_value(body)
                .map_err(|source| ProtocolViolation::MalformedBody { method, source })
        }

        Ok(match method {
            Method::Configure => Request::Configure(body_of(method, body)?),
            Method::Listen => Request::Listen(body_of(method, body)?),
            Method::Publish => Request::Publish(body_of(method, body)?),
            Method::Subscribe => Request::Subscribe(body_of(method, body)?),
            Method::Unsubscribe => Request::Unsubscribe(body_of(method, body)?),
            Method::ValidationComplete => Request::ValidationComplete(body_of(method, body)?),
            Method::GenerateKeypair => Request::GenerateKeypair,
            Method::OpenStream => Request::OpenStream(body_of(method, body)?),
            Method::CloseStream => Request::CloseStream(body_of(method, body)?),
            Method::ResetStream => Request::ResetStream(body_of(method, body)?),
            Method::SendStreamMsg => Request::SendStreamMsg(body_of(method, body)?),
            Method::RemoveStreamHandler => Request::RemoveStreamHandler(body_of(method, body)?),
            Method::AddStreamHandler => Request::AddStreamHandler(body_of(method, body)?),
            Method::ListeningAddrs => Request::ListeningAddrs,
            Method::AddPeer => Request::AddPeer(body_of(method, body)?),
            Method::BeginAdvertising => Request::BeginAdvertising,
            Method::FindPeer => Request::FindPeer(body_of(method, body)?),
            Method::ListPeers => Request::ListPeers,
            Method::SetGatingConfig => Request::SetGatingConfig(body_of(method, body)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_tag_parses() {
        let bodies: Vec<(u64, serde_json::Value)> = vec![
            (
                0,
                json!({
                    "statedir": "/tmp/x",
                    "privk": "",
                    "network_id": "testnet",
                    "ifaces": [],
                    "external_maddr": "/ip4/1.2.3.4/tcp/1",
                    "unsafe_no_trust_ip": false,
                    "flood": false,
                    "peer_exchange": false,
                    "direct_peers": [],
                    "seed_peers": [],
                    "gating_config": {
                        "banned_ips": [],
                        "banned_peers": [],
                        "trusted_ips": [],
                        "trusted_peers": [],
                        "isolate": false
                    }
                }),
            ),
            (1, json!({"iface": "/ip4/0.0.0.0/tcp/0"})),
            (2, json!({"topic": "t", "data": "aGk="})),
            (3, json!({"topic": "t", "subscription_idx": 7})),
            (4, json!({"subscription_idx": 7})),
            (5, json!({"seqno": 3, "is_valid": "accept"})),
            (6, json!({})),
            (7, json!({"peer": "x", "protocol": "/p/1"})),
            (8, json!({"stream_idx": 1})),
            (9, json!({"stream_idx": 1})),
            (10, json!({"stream_idx": 1, "data": "aGk="})),
            (11, json!({"protocol": "/p/1"})),
            (12, json!({"protocol": "/p/1"})),
            (13, json!({})),
            (14, json!({"multiaddr": "/ip4/1.2.3.4/tcp/1"})),
            (15, json!({})),
            (16, json!({"peer_id": "x"})),
            (17, json!({})),
            (18, json!({"banned_ips": [], "banned_peers": [], "trusted_ips": [], "trusted_peers": [], "isolate": false})),
        ];

        for (tag, body) in bodies {
            Request::parse(tag, body).unwrap_or_else(|e| panic!("tag {tag}: {e}"));
        }
    }

    #[test]
    fn test_unknown_tag_is_a_protocol_violation() {
        assert!(matches!(
            Request::parse(19, json!({})),
            Err(ProtocolViolation::UnknownMethod(19))
        ));
    }

    #[test]
    fn test_malformed_body_is_a_protocol_violation() {
        assert!(matches!(
            Request::parse(2, json!({"topic": 42})),
            Err(ProtocolViolation::MalformedBody { .. })
        ));
    }

    #[test]
    fn test_envelope_parses_with_raw_body() {
        let env: Envelope =
            serde_json::from_str(r#"{"method":2,"seqno":17,"body":{"topic":"t","data":"aGk="}}"#)
                .unwrap();
        assert_eq!(env.method, 2);
        assert_eq!(env.seqno, 17);
        assert!(matches!(
            Request::parse(env.method, env.body).unwrap(),
            Request::Publish(_)
        ));
    }
}
