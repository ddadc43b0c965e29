//! The callback surface of the nodes.
//!
//! Every method has a no-op default, so applications only implement what they care about.
//! Callbacks run on the user pool through the task queue: at most one callback per peer runs at
//! any time, in the order the triggering traffic arrived. They may block; a panic is caught and
//! reported through `on_exception`.
use crate::error::NetworkError;
use crate::proto::message::ReceivedMessage;
use crate::proto::rpc::RpcId;
use auto_impl::auto_impl;
use bytes::Bytes;
use lan_types::errors::{ErrorCategory, ErrorType};
use lan_types::proto::HostId;
use std::net::SocketAddr;
use std::time::Duration;

/// The answer to a connection request. The payload is delivered to the client with the result
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionVerdict {
    Accept(Bytes),
    Reject(Bytes),
}

/// A reason-coded report attached to disposals, warnings and errors
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorInfo {
    pub error_type: ErrorType,
    /// A finer reason when `error_type` alone is ambiguous
    pub detail: ErrorType,
    pub comment: String,
    /// The host the report concerns, if any
    pub remote: HostId,
}

impl ErrorInfo {
    pub fn new(error_type: ErrorType, remote: HostId, comment: impl Into<String>) -> Self {
        Self {
            error_type,
            detail: ErrorType::Ok,
            comment: comment.into(),
            remote,
        }
    }

    pub fn with_detail(mut self, detail: ErrorType) -> Self {
        self.detail = detail;
        self
    }

    pub fn from_network_error(err: &NetworkError, remote: HostId) -> Self {
        Self::new(err.error_type(), remote, err.to_string())
    }

    pub fn category(&self) -> ErrorCategory {
        self.error_type.category()
    }
}

/// What the server knows about a connected client
#[derive(Clone, Debug)]
pub struct NetClientInfo {
    pub host_id: HostId,
    pub tcp_addr: SocketAddr,
    /// The payload the client sent with its connection request
    pub user_data: Bytes,
    pub joined_groups: Vec<HostId>,
    /// Where the client accepts direct links from group members
    pub p2p_addr: Option<SocketAddr>,
    /// As last reported by the client
    pub recent_ping: Option<Duration>,
}

/// What a client knows about another member of its groups
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerInfo {
    pub host_id: HostId,
    pub groups: Vec<HostId>,
    /// A validated direct link exists; traffic does not go through the server
    pub direct: bool,
    pub recent_ping: Option<Duration>,
}

#[auto_impl(Box, Arc)]
pub trait LanServerEvents: Send + Sync + 'static {
    /// Decides whether a client that finished the security handshake is admitted. No host id
    /// has been assigned yet
    fn on_connection_request(&self, remote_addr: SocketAddr, user_data: &[u8]) -> ConnectionVerdict {
        let _ = (remote_addr, user_data);
        ConnectionVerdict::Accept(Bytes::new())
    }

    fn on_client_join(&self, client: &NetClientInfo) {
        let _ = client;
    }

    /// Delivered exactly once per admitted client
    fn on_client_leave(&self, client: &NetClientInfo, reason: &ErrorInfo, comment: &Bytes) {
        let _ = (client, reason, comment);
    }

    /// Every member acknowledged `member_id` joining `group_id`, or the join failed
    fn on_p2p_group_join_member_ack_complete(
        &self,
        group_id: HostId,
        member_id: HostId,
        result: ErrorType,
    ) {
        let _ = (group_id, member_id, result);
    }

    fn on_p2p_group_member_left(&self, group_id: HostId, member_id: HostId, member_count: u32) {
        let _ = (group_id, member_id, member_count);
    }

    /// Every pair of members in the group holds a direct link. Reported once per group: members
    /// joining after the report link up without a second one
    fn on_p2p_group_fully_connected(&self, group_id: HostId) {
        let _ = group_id;
    }

    fn on_p2p_group_removed(&self, group_id: HostId) {
        let _ = group_id;
    }

    fn on_received_user_message(&self, message: ReceivedMessage) {
        let _ = message;
    }

    fn on_rpc_not_implemented(&self, rpc_id: RpcId, sender: HostId) {
        let _ = (rpc_id, sender);
    }

    fn on_error(&self, error: &ErrorInfo) {
        let _ = error;
    }

    fn on_warning(&self, warning: &ErrorInfo) {
        let _ = warning;
    }

    /// A callback for `subject` panicked
    fn on_exception(&self, subject: HostId, reason: &str) {
        let _ = (subject, reason);
    }
}

#[auto_impl(Box, Arc)]
pub trait LanClientEvents: Send + Sync + 'static {
    /// The outcome of `connect`. `reply` is the payload of the server's verdict
    fn on_join_server_complete(&self, result: &ErrorInfo, reply: &Bytes) {
        let _ = (result, reply);
    }

    /// Delivered exactly once per successful connection
    fn on_leave_server(&self, reason: &ErrorInfo) {
        let _ = reason;
    }

    fn on_p2p_member_join(
        &self,
        member_id: HostId,
        group_id: HostId,
        member_count: u32,
        custom_field: &Bytes,
    ) {
        let _ = (member_id, group_id, member_count, custom_field);
    }

    fn on_p2p_member_leave(&self, member_id: HostId, group_id: HostId, member_count: u32) {
        let _ = (member_id, group_id, member_count);
    }

    /// Relayed from the server, so also at most once per group
    fn on_p2p_group_fully_connected(&self, group_id: HostId) {
        let _ = group_id;
    }

    fn on_p2p_connection_established(&self, peer_id: HostId) {
        let _ = peer_id;
    }

    fn on_p2p_connection_lost(&self, peer_id: HostId, reason: ErrorType) {
        let _ = (peer_id, reason);
    }

    fn on_received_user_message(&self, message: ReceivedMessage) {
        let _ = message;
    }

    fn on_rpc_not_implemented(&self, rpc_id: RpcId, sender: HostId) {
        let _ = (rpc_id, sender);
    }

    fn on_error(&self, error: &ErrorInfo) {
        let _ = error;
    }

    fn on_warning(&self, warning: &ErrorInfo) {
        let _ = warning;
    }

    fn on_exception(&self, subject: HostId, reason: &str) {
        let _ = (subject, reason);
    }
}

/// Ignores every event
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopEvents;

impl LanServerEvents for NoopEvents {}

impl LanClientEvents for NoopEvents {}
