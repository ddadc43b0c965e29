//! The engine: framing, session security, RPC dispatch, the peer registry, P2P group
//! coordination, scheduling and the two node types.
//!
//! Inbound bytes flow socket → [`transport`] (framing via [`codec`], envelopes via
//! [`security`]) → the node's dispatcher, which handles engine traffic in place (mutating the
//! [`registry`] and the [`p2p_group`] coordinator) and hands everything else to the
//! [`task_queue`], where user callbacks run with at most one task in flight per peer.

/// Length-delimited framing of the byte stream
pub(crate) mod codec;
pub mod destination;
pub(crate) mod disconnect_tracker;
/// The services the engine speaks itself
pub mod engine_rpc;
pub mod events;
pub(crate) mod host_id;
pub mod message;
pub mod misc;
pub mod p2p_group;
/// For creating and validating control packets
pub(crate) mod packet_crafter;
pub(crate) mod peer;
pub(crate) mod registry;
pub mod rpc;
pub mod security;
pub(crate) mod send_queue;
pub mod settings;
pub(crate) mod task_queue;
pub(crate) mod timer_queue;
pub mod transport;

pub mod client;
pub mod server;
