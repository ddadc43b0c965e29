//! The server's record of one remote client.
use crate::proto::events::{ErrorInfo, NetClientInfo};
use crate::proto::misc::Ticket;
use crate::proto::task_queue::{TaskQueue, TaskSubject};
use crate::proto::transport::Link;
use bytes::Bytes;
use lan_io::tokio::time::Instant;
use lan_io::Mutex;
use lan_types::errors::ErrorType;
use lan_types::proto::HostId;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PeerState {
    /// Connected, not yet admitted
    Candidate,
    Authenticated,
    /// Teardown began. The record stays reachable by host id until it is disposed
    DisposeIssued,
    Disposed,
}

/// Progress of a candidate through the connection handshake
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum HandshakeStage {
    AwaitingSessionKey,
    AwaitingConnectionRequest,
    /// The application is deciding on the request
    AwaitingApproval,
    Done,
}

/// The single, definitive reason a peer is being torn down
#[derive(Clone, Debug)]
pub struct DisposeWaiter {
    pub reason: ErrorType,
    pub detail: ErrorType,
    pub comment: Bytes,
    pub issued_at: Instant,
}

struct Lifecycle {
    state: PeerState,
    stage: HandshakeStage,
    dispose: Option<DisposeWaiter>,
}

pub(crate) struct RemoteClient {
    link: Link,
    ticket: Ticket,
    host_id: OnceLock<HostId>,
    created_at: Instant,
    lifecycle: Mutex<Lifecycle>,
    profile: Mutex<ClientProfile>,
}

#[derive(Default)]
struct ClientProfile {
    user_data: Bytes,
    p2p_addr: Option<SocketAddr>,
    recent_ping: Option<Duration>,
}

impl RemoteClient {
    pub fn new(link: Link, now: Instant) -> Self {
        Self {
            link,
            ticket: Ticket::random(),
            host_id: OnceLock::new(),
            created_at: now,
            lifecycle: Mutex::new(Lifecycle {
                state: PeerState::Candidate,
                stage: HandshakeStage::AwaitingSessionKey,
                dispose: None,
            }),
            profile: Mutex::new(ClientProfile::default()),
        }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn host_id(&self) -> Option<HostId> {
        self.host_id.get().copied()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The queue subject this peer's callbacks are serialized under
    pub fn subject(&self) -> TaskSubject {
        match self.host_id() {
            Some(host_id) => TaskSubject::Peer(host_id),
            None => TaskSubject::Candidate(self.link.id()),
        }
    }

    pub fn state(&self) -> PeerState {
        self.lifecycle.lock().state
    }

    pub fn stage(&self) -> HandshakeStage {
        self.lifecycle.lock().stage
    }

    pub fn set_stage(&self, stage: HandshakeStage) {
        self.lifecycle.lock().stage = stage;
    }

    /// Moves a candidate to `Authenticated`. The host id can only ever be set once
    pub fn authenticate(&self, host_id: HostId) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != PeerState::Candidate || self.host_id.set(host_id).is_err() {
            return false;
        }

        lifecycle.state = PeerState::Authenticated;
        lifecycle.stage = HandshakeStage::Done;
        true
    }

    /// Attaches the dispose waiter and closes the link. Only the first call has any effect;
    /// it returns `true`
    pub fn request_dispose(&self, reason: ErrorType, detail: ErrorType, comment: Bytes) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.dispose.is_some() {
                return false;
            }

            lifecycle.dispose = Some(DisposeWaiter {
                reason,
                detail,
                comment,
                issued_at: Instant::now(),
            });
            lifecycle.state = PeerState::DisposeIssued;
        }

        log::trace!(target: "lan", "Dispose issued for {:?} ({reason})", self.link);
        self.link.close();
        true
    }

    pub fn dispose_waiter(&self) -> Option<DisposeWaiter> {
        self.lifecycle.lock().dispose.clone()
    }

    /// Nothing references the peer anymore: its I/O tasks are done, no user holds a use of the
    /// link and no callback for it is queued or running
    pub fn is_safe_to_destroy(&self, tasks: &TaskQueue) -> bool {
        self.lifecycle.lock().dispose.is_some()
            && self.link.io_finished()
            && self.link.use_count().is_idle()
            && tasks.is_idle(self.subject())
    }

    pub fn mark_disposed(&self) {
        self.lifecycle.lock().state = PeerState::Disposed;
    }

    pub fn set_connection_request(&self, user_data: Bytes, p2p_port: u16) {
        let mut profile = self.profile.lock();
        profile.user_data = user_data;
        profile.p2p_addr =
            (p2p_port != 0).then(|| SocketAddr::new(self.link.remote_addr().ip(), p2p_port));
    }

    pub fn user_data(&self) -> Bytes {
        self.profile.lock().user_data.clone()
    }

    pub fn p2p_addr(&self) -> Option<SocketAddr> {
        self.profile.lock().p2p_addr
    }

    pub fn set_recent_ping(&self, ping: Duration) {
        self.profile.lock().recent_ping = Some(ping);
    }

    pub fn info(&self, joined_groups: Vec<HostId>) -> NetClientInfo {
        let profile = self.profile.lock();
        NetClientInfo {
            host_id: self.host_id().unwrap_or(HostId::NONE),
            tcp_addr: self.link.remote_addr(),
            user_data: profile.user_data.clone(),
            joined_groups,
            p2p_addr: profile.p2p_addr,
            recent_ping: profile.recent_ping,
        }
    }

    /// The report delivered with `on_client_leave`
    pub fn leave_report(&self) -> (ErrorInfo, Bytes) {
        let host_id = self.host_id().unwrap_or(HostId::NONE);
        match self.dispose_waiter() {
            Some(waiter) => (
                ErrorInfo::new(
                    waiter.reason,
                    host_id,
                    String::from_utf8_lossy(&waiter.comment),
                )
                .with_detail(waiter.detail),
                waiter.comment,
            ),
            None => (
                ErrorInfo::new(ErrorType::Unexpected, host_id, "Disposed without a reason"),
                Bytes::new(),
            ),
        }
    }
}
