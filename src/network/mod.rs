//! The p2p side of the helper: swarm construction, the driver task, gating,
//! connection management, pubsub validation plumbing, streams and discovery.

pub mod behaviour;
pub mod builder;
pub mod connmgr;
pub mod discovery;
pub mod gating;
pub mod node;
pub mod pubsub;
pub mod streams;

pub use behaviour::HelperBehaviour;
pub use builder::{build_node, BuiltNode, NodeConfig};
pub use gating::{GatingPolicy, GatingState};
pub use node::{NodeDriver, NodeHandle};
