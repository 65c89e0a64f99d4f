//! Identity material: keypair generation, marshalling, and the
//! private-network pre-shared key.

pub mod keys;

pub use keys::{decode_keypair, generate_keypair, preshared_key, GeneratedKeypair};
