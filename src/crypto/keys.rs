//! Ed25519 identities in their libp2p wire forms.
//!
//! Keys cross the pipe in the libp2p protobuf marshalling, base64-encoded;
//! peer ids travel as base58btc multihashes. Both directions go through the
//! libp2p identity types so the host can hand keys to any other libp2p
//! implementation.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use libp2p::identity::Keypair;
use serde::Serialize;

use crate::rpc::types::{decode_blob, encode_blob};
use crate::rpc::HelperError;

type Blake2b256 = Blake2b<U32>;

/// A freshly generated identity, in wire form.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedKeypair {
    #[serde(rename = "sk")]
    pub secret: String,
    #[serde(rename = "pk")]
    pub public: String,
    pub peer_id: String,
}

/// Generates a fresh Ed25519 keypair and returns all three wire forms.
pub fn generate_keypair() -> Result<GeneratedKeypair, HelperError> {
    let keypair = Keypair::generate_ed25519();
    let secret = keypair.to_protobuf_encoding().map_err(HelperError::rpc)?;
    let public = keypair.public().encode_protobuf();
    let peer_id = keypair.public().to_peer_id();
    Ok(GeneratedKeypair {
        secret: encode_blob(&secret),
        public: encode_blob(&public),
        peer_id: peer_id.to_base58(),
    })
}

/// Decodes a base64 protobuf-marshalled private key, as produced by
/// `generate_keypair` (or any libp2p implementation).
pub fn decode_keypair(privk: &str) -> Result<Keypair, HelperError> {
    let bytes = decode_blob(privk)?;
    Keypair::from_protobuf_encoding(&bytes).map_err(HelperError::rpc)
}

/// The private-network PSK: blake2b-256 of the rendezvous string. Hosts on
/// different networks derive different keys, so their transports cannot
/// complete a handshake even when they share seed addresses.
pub fn preshared_key(rendezvous: &str) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(rendezvous.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keypair_round_trips() {
        let generated = generate_keypair().unwrap();
        assert!(!generated.secret.is_empty());
        assert!(!generated.public.is_empty());
        assert!(!generated.peer_id.is_empty());

        let keypair = decode_keypair(&generated.secret).unwrap();
        assert_eq!(
            keypair.public().to_peer_id().to_base58(),
            generated.peer_id,
            "peer id must derive from the public key"
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_keypair("!!!not-base64!!!").is_err());
        assert!(decode_keypair("aGVsbG8=").is_err());
    }

    #[test]
    fn test_preshared_key_depends_on_rendezvous() {
        let a = preshared_key("/coda/0.0.1/mainnet");
        let b = preshared_key("/coda/0.0.1/testnet");
        assert_ne!(a, b);
        assert_eq!(a, preshared_key("/coda/0.0.1/mainnet"));
    }
}
