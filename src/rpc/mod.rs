//! The JSON command pipe: envelopes, wire types, upcalls and the single
//! outbound writer.

pub mod envelope;
pub mod types;
pub mod upcall;
pub mod writer;

use thiserror::Error;

pub use envelope::{Envelope, Method, ProtocolViolation, Request};
pub use types::{decode_blob, encode_blob, GatingConfig, PeerInfo};
pub use upcall::{OutboundMessage, Response, Upcall};
pub use writer::OutboundQueue;

/// Per-request error taxonomy. The `Display` rendering is the wire format:
/// `<tag>: <detail>`.
#[derive(Debug, Error)]
pub enum HelperError {
    /// Handler-detected bad arguments or a helper that is not yet configured.
    #[error("internal RPC error: {0}")]
    Rpc(String),
    /// A libp2p operation failed (dial, write, publish, subscribe).
    #[error("libp2p error: {0}")]
    P2p(String),
    /// `configure` itself failed partway through host construction.
    #[error("initializing helper: {0}")]
    Helper(String),
    /// The supplied external multiaddress did not parse.
    #[error("initializing external addr: {0}")]
    ExternalAddr(String),
    /// Operations that are wired up but permanently refused.
    #[error("{0}")]
    Disabled(&'static str),
}

impl HelperError {
    pub fn rpc(detail: impl ToString) -> Self {
        HelperError::Rpc(detail.to_string())
    }

    pub fn p2p(detail: impl ToString) -> Self {
        HelperError::P2p(detail.to_string())
    }

    pub fn helper(detail: impl ToString) -> Self {
        HelperError::Helper(detail.to_string())
    }

    pub fn not_configured() -> Self {
        HelperError::Rpc("helper not yet configured".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_tags_render_on_the_wire() {
        assert_eq!(
            HelperError::not_configured().to_string(),
            "internal RPC error: helper not yet configured"
        );
        assert_eq!(
            HelperError::p2p("dial refused").to_string(),
            "libp2p error: dial refused"
        );
        assert_eq!(
            HelperError::helper("datastore").to_string(),
            "initializing helper: datastore"
        );
        assert_eq!(
            HelperError::ExternalAddr("bad maddr".into()).to_string(),
            "initializing external addr: bad maddr"
        );
    }
}
