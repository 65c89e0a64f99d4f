//! libp2p-helper - a child process that owns peer-to-peer networking on
//! behalf of a host application.
//!
//! The host drives the helper over line-delimited JSON on stdin and reads
//! responses and unsolicited upcalls from stdout; stderr carries structured
//! logs. The helper brings up a libp2p host on demand: Ed25519 identity,
//! a pre-shared-key TCP transport, a Kademlia DHT for rendezvous discovery,
//! gossipsub with host-supervised message validation, mDNS, mutable
//! connection gating, and application-defined bidirectional streams.
//!
//! ## Architecture
//!
//! One task reads stdin and runs one handler at a time; one task owns the
//! libp2p swarm and is driven over a command channel; one task drains every
//! outbound message through a single writer, making it the ordering
//! authority for stdout. Everything else - stream readers, inbound-stream
//! accept loops, validation deadline timers - is a short-lived task that
//! reports back through the outbound queue.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `rpc` | envelopes, wire types, upcalls, the outbound writer |
//! | `dispatch` | shared state and one handler per method |
//! | `network` | swarm construction, driver task, gating, pubsub, streams |
//! | `crypto` | keypair wire forms and the private-network PSK |
//! | `storage` | sled datastores for the DHT and the peer address book |
//! | `seq` | process-wide sequence source |

pub mod crypto;
pub mod dispatch;
pub mod network;
pub mod rpc;
pub mod seq;
pub mod storage;

pub use dispatch::App;
pub use rpc::{Envelope, HelperError, OutboundQueue, ProtocolViolation, Response, Upcall};
pub use seq::SeqSource;
