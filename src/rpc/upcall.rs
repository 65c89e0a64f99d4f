//! Outbound message shapes: per-request responses and unsolicited upcalls.
//!
//! Responses always carry the request's `seqno` and never an `upcall` field;
//! upcalls always carry the `upcall` discriminator and never a `seqno`. The
//! serializer tests below pin both properties.

use serde::Serialize;

use super::types::PeerInfo;

/// Exactly one of these is produced for every accepted envelope.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Success {
        seqno: u64,
        success: serde_json::Value,
        duration: String,
    },
    Error {
        seqno: u64,
        error: String,
    },
}

/// Unsolicited helper → host notifications.
#[derive(Debug, Serialize)]
#[serde(tag = "upcall", rename_all = "camelCase")]
pub enum Upcall {
    Validate {
        sender: Option<PeerInfo>,
        data: String,
        seqno: u64,
        subscription_idx: u64,
    },
    /// Post-validation delivery. Deliberately never emitted: the host already
    /// received the payload inside `validate`, and re-emitting it here would
    /// deliver every message twice.
    Publish {
        subscription_idx: u64,
        data: String,
        sender: Option<PeerInfo>,
    },
    IncomingStream {
        peer: PeerInfo,
        stream_idx: u64,
        protocol: String,
    },
    IncomingStreamMsg {
        stream_idx: u64,
        data: String,
    },
    StreamReadComplete {
        stream_idx: u64,
    },
    StreamLost {
        stream_idx: u64,
        reason: String,
    },
    DiscoveredPeer {
        peer_id: String,
        multiaddrs: Vec<String>,
    },
}

/// Everything that can appear on stdout.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Response(Response),
    Upcall(Upcall),
}

impl From<Response> for OutboundMessage {
    fn from(r: Response) -> Self {
        OutboundMessage::Response(r)
    }
}

impl From<Upcall> for OutboundMessage {
    fn from(u: Upcall) -> Self {
        OutboundMessage::Upcall(u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn as_json(msg: OutboundMessage) -> Value {
        serde_json::to_value(&msg).unwrap()
    }

    #[test]
    fn test_success_shape() {
        let v = as_json(
            Response::Success {
                seqno: 4,
                success: json!("subscribe success"),
                duration: "1.2ms".into(),
            }
            .into(),
        );
        assert_eq!(v["seqno"], 4);
        assert_eq!(v["success"], "subscribe success");
        assert_eq!(v["duration"], "1.2ms");
        assert!(v.get("upcall").is_none());
        assert!(v.get("error").is_none());
    }

    #[test]
    fn test_error_shape() {
        let v = as_json(
            Response::Error {
                seqno: 9,
                error: "internal RPC error: helper not yet configured".into(),
            }
            .into(),
        );
        assert_eq!(v["seqno"], 9);
        assert_eq!(
            v["error"],
            "internal RPC error: helper not yet configured"
        );
        assert!(v.get("upcall").is_none());
    }

    #[test]
    fn test_upcalls_carry_discriminator_and_no_seqno_field() {
        let v = as_json(
            Upcall::IncomingStreamMsg {
                stream_idx: 3,
                data: "aGk=".into(),
            }
            .into(),
        );
        assert_eq!(v["upcall"], "incomingStreamMsg");
        assert_eq!(v["stream_idx"], 3);
        assert_eq!(v["data"], "aGk=");
        assert!(v.get("seqno").is_none());

        let v = as_json(
            Upcall::StreamLost {
                stream_idx: 3,
                reason: "read failure: reset".into(),
            }
            .into(),
        );
        assert_eq!(v["upcall"], "streamLost");

        let v = as_json(
            Upcall::DiscoveredPeer {
                peer_id: "12D3Koo".into(),
                multiaddrs: vec!["/ip4/10.0.0.1/tcp/8302".into()],
            }
            .into(),
        );
        assert_eq!(v["upcall"], "discoveredPeer");
        assert_eq!(v["multiaddrs"][0], "/ip4/10.0.0.1/tcp/8302");
    }

    #[test]
    fn test_validate_upcall_seqno_is_the_ticket() {
        // `validate` is the one upcall with a seqno-named field: it names the
        // validation ticket, not a request.
        let v = as_json(
            Upcall::Validate {
                sender: None,
                data: "aGVsbG8=".into(),
                seqno: 42,
                subscription_idx: 7,
            }
            .into(),
        );
        assert_eq!(v["upcall"], "validate");
        assert_eq!(v["seqno"], 42);
        assert_eq!(v["subscription_idx"], 7);
        assert_eq!(v["sender"], Value::Null);
    }
}
