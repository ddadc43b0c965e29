//! The client node.
//!
//! A [`LanClient`] holds one link to the server and at most one direct link per group member.
//! Traffic to a member goes over its direct link once that link passed the peer handshake;
//! until then (or when the link cannot satisfy the requested encryption) the server relays it.
mod dispatch;
mod handshake;
mod heartbeat;
mod p2p;
mod peers;

use crate::error::NetworkError;
use crate::proto::disconnect_tracker::DisconnectSignalTracker;
use crate::proto::events::{ErrorInfo, LanClientEvents, PeerInfo};
use crate::proto::message::{Message, MessageType};
use crate::proto::misc::Ticket;
use crate::proto::packet_crafter::do_disconnect::ShutdownTcp;
use crate::proto::packet_crafter::ControlPacket;
use crate::proto::rpc::{RpcStub, StubRegistry};
use crate::proto::security::SendOptions;
use crate::proto::settings::ClientConfig;
use crate::proto::task_queue::{TaskQueue, TaskSubject};
use crate::proto::timer_queue::{TimerQueue, TimerQueueHandle};
use crate::proto::transport::Link;
use bytes::Bytes;
use handshake::ServerLinkHandler;
use lan_io::tokio::net::{TcpListener, TcpStream};
use lan_io::tokio::sync::watch;
use lan_io::tokio::time::Instant;
use lan_io::tokio_util::sync::CancellationToken;
use lan_io::{Mutex, RwLock, WorkerPool};
use lan_types::errors::ErrorType;
use lan_types::proto::{ClientSettings, HostId, DEFAULT_MAX_MESSAGE_LENGTH};
use peers::PeerTable;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type EventSlot = Arc<RwLock<Arc<dyn LanClientEvents>>>;

/// How long a failed `connect` waits for its completion event to be delivered
const FAILED_JOIN_DRAIN: Duration = Duration::from_secs(1);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct LanClient {
    inner: Arc<ClientInner>,
}

/// A group this client belongs to, as far as the server told it
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JoinedGroupInfo {
    pub group_id: HostId,
    pub members: Vec<HostId>,
    pub custom_field: Bytes,
}

pub(crate) struct ClientInner {
    settings: Arc<ClientSettings>,
    server: Link,
    session: Mutex<Session>,
    peers: Mutex<PeerTable>,
    join: watch::Sender<JoinState>,
    tasks: TaskQueue,
    events: EventSlot,
    stubs: RwLock<StubRegistry>,
    tracker: DisconnectSignalTracker,
    timers: TimerQueueHandle<ClientInner>,
    /// Where group members reach this node directly
    p2p_addr: Option<SocketAddr>,
    started_at: Instant,
    ping: Mutex<PingState>,
    /// Stops the direct-link listener and silences loss reports
    shutdown: CancellationToken,
    disconnect_requested: AtomicBool,
    terminated: AtomicBool,
    // dropped last: an owned runtime must outlive everything spawned onto it
    net_pool: WorkerPool,
    user_pool: WorkerPool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum HandshakeStage {
    AwaitingHint,
    AwaitingKeyAck,
    AwaitingVerdict,
    Joined,
    Left,
}

struct Session {
    stage: HandshakeStage,
    host_id: HostId,
    ticket: Ticket,
    external_addr: Option<SocketAddr>,
    /// Announced by the server; it drops clients idle for longer
    idle_timeout: Duration,
    /// The first recorded reason wins
    leave_reason: Option<(ErrorType, Bytes)>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum JoinState {
    Handshaking,
    Joined,
    Failed(ErrorType, Bytes),
}

#[derive(Default)]
struct PingState {
    server_ping: Option<Duration>,
    /// The server clock estimate and when it was taken
    server_clock: Option<(Duration, Instant)>,
}

impl LanClient {
    /// Connects to the server and completes the security handshake and admission. Resource
    /// failures (socket, timeout) and the server's refusal are returned as errors; the
    /// outcome is also reported through `on_join_server_complete`
    pub async fn connect(
        config: ClientConfig,
        events: impl LanClientEvents,
    ) -> Result<LanClient, NetworkError> {
        let ClientConfig {
            settings,
            net_pool,
            user_pool,
        } = config;
        let net_pool = WorkerPool::new(&net_pool, "lan-client-net")?;
        let user_pool = WorkerPool::new(&user_pool, "lan-client-user")?;

        let server_addr = settings.server_addr;
        let connect_timeout = settings.connect_timeout;
        let connected = net_pool
            .spawn(async move {
                lan_io::tokio::time::timeout(connect_timeout, TcpStream::connect(server_addr))
                    .await
            })
            .await
            .map_err(|err| NetworkError::Generic(err.to_string()))?;
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                log::warn!(target: "lan", "Unable to reach {server_addr}: {err}");
                return Err(NetworkError::ConnectFailed {
                    reason: ErrorType::TcpConnectFailure,
                    reply: Bytes::new(),
                });
            }
            Err(_) => {
                log::warn!(target: "lan", "Connecting to {server_addr} timed out");
                return Err(NetworkError::ConnectFailed {
                    reason: ErrorType::ConnectServerTimeout,
                    reply: Bytes::new(),
                });
            }
        };

        let (link, io, p2p_listener) = {
            let _guard = net_pool.handle().enter();
            let p2p_listener = if settings.enable_direct_p2p {
                let std_listener = std::net::TcpListener::bind((settings.p2p_bind_ip, 0))?;
                std_listener.set_nonblocking(true)?;
                Some(TcpListener::from_std(std_listener)?)
            } else {
                None
            };
            // the server announces the real bound in its connection hint
            let (link, io) = Link::new(stream, DEFAULT_MAX_MESSAGE_LENGTH, settings.enable_nagle)?;
            (link, io, p2p_listener)
        };
        let p2p_addr = match &p2p_listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        let events: EventSlot = Arc::new(RwLock::new(Arc::new(events)));
        let exception_slot = events.clone();
        let tasks = TaskQueue::new(Arc::new(move |subject, reason: String| {
            let host_id = match subject {
                TaskSubject::Peer(host_id) => host_id,
                TaskSubject::Local | TaskSubject::Candidate(_) => HostId::NONE,
            };
            let events = exception_slot.read().clone();
            events.on_exception(host_id, &reason);
        }));
        tasks.start(user_pool.handle(), settings.user_worker_count);

        let (join, mut join_rx) = watch::channel(JoinState::Handshaking);
        let mut timer_queue = None;
        let inner = Arc::new_cyclic(|weak| {
            let (queue, timers) = TimerQueue::new(weak.clone());
            timer_queue = Some(queue);
            ClientInner {
                server: link.clone(),
                session: Mutex::new(Session {
                    stage: HandshakeStage::AwaitingHint,
                    host_id: HostId::NONE,
                    ticket: Ticket::default(),
                    external_addr: None,
                    idle_timeout: Duration::ZERO,
                    leave_reason: None,
                }),
                peers: Mutex::new(PeerTable::default()),
                join,
                tasks,
                events,
                stubs: RwLock::new(StubRegistry::default()),
                tracker: DisconnectSignalTracker::new(),
                timers,
                p2p_addr,
                started_at: Instant::now(),
                ping: Mutex::new(PingState::default()),
                shutdown: CancellationToken::new(),
                disconnect_requested: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                settings,
                net_pool,
                user_pool,
            }
        });
        // from here on, dropping the client tears everything down
        let client = LanClient {
            inner: inner.clone(),
        };

        if let Some(timer_queue) = timer_queue {
            ClientInner::register_timers(&inner.timers, &inner.settings);
            let _ = inner.net_pool.spawn(async move {
                if let Err(err) = timer_queue.await {
                    log::error!(target: "lan", "Client timers stopped: {err}");
                }
            });
        }

        let handler = ServerLinkHandler::new(Arc::downgrade(&inner));
        link.start(io, Arc::new(handler), inner.net_pool.handle());

        if let Some(listener) = p2p_listener {
            let _ = inner
                .net_pool
                .spawn(ClientInner::p2p_listener_loop(inner.clone(), listener));
        }

        let outcome = lan_io::tokio::time::timeout(connect_timeout, async {
            loop {
                let state = join_rx.borrow_and_update().clone();
                if state != JoinState::Handshaking {
                    return state;
                }
                if join_rx.changed().await.is_err() {
                    return JoinState::Failed(ErrorType::Unexpected, Bytes::new());
                }
            }
        })
        .await;

        let (reason, reply) = match outcome {
            Ok(JoinState::Joined) => {
                log::info!(target: "lan", "Joined {server_addr} as {}", inner.host_id());
                return Ok(client);
            }
            Ok(JoinState::Failed(reason, reply)) => (reason, reply),
            Ok(JoinState::Handshaking) | Err(_) => {
                inner.fail_join(ErrorType::ConnectServerTimeout, Bytes::new());
                match inner.join.borrow().clone() {
                    JoinState::Joined => return Ok(client),
                    JoinState::Failed(reason, reply) => (reason, reply),
                    JoinState::Handshaking => (ErrorType::ConnectServerTimeout, Bytes::new()),
                }
            }
        };

        log::warn!(target: "lan", "Unable to join {server_addr}: {reason}");
        inner.server.close();
        let info = ErrorInfo::new(reason, HostId::SERVER, format!("Unable to join {server_addr}"));
        let events = inner.events();
        let event_reply = reply.clone();
        let _ = inner.tasks.push(TaskSubject::Local, move || {
            events.on_join_server_complete(&info, &event_reply)
        });
        inner
            .wait_drained(Instant::now() + FAILED_JOIN_DRAIN)
            .await;
        drop(client);

        Err(match reason {
            ErrorType::ProtocolVersionMismatch => NetworkError::ProtocolVersionMismatch,
            reason => NetworkError::ConnectFailed { reason, reply },
        })
    }

    /// Says goodbye to the server and waits (up to `timeout`) for it to close the connection
    /// and for the remaining callbacks, including `on_leave_server`
    pub async fn disconnect(&self, timeout: Duration, comment: &[u8]) {
        let inner = &self.inner;
        if inner.disconnect_requested.swap(true, Ordering::AcqRel) {
            return;
        }

        let deadline = Instant::now() + timeout;
        let comment = Bytes::copy_from_slice(comment);
        inner.record_leave_reason(ErrorType::DisconnectFromLocal, comment.clone());

        if inner.is_joined() {
            let farewell = ShutdownTcp { comment };
            if inner
                .server
                .send(&farewell.craft(), SendOptions::RELIABLE)
                .is_ok()
            {
                // the server acknowledges and the link winds down from its end
                inner.wait_io_finished(deadline).await;
            }
        }

        inner.shutdown.cancel();
        inner.server.close();
        for link in inner.peers.lock().clear() {
            link.close();
        }

        inner.wait_io_finished(deadline).await;
        inner.wait_drained(deadline).await;
        inner.tasks.shutdown();
        inner.terminated.store(true, Ordering::Release);
        log::info!(target: "lan", "Client {} disconnected", inner.host_id());
    }

    /// Sends a freeform message. Groups this client belongs to expand into their members; the
    /// client's own id delivers locally
    pub fn send(
        &self,
        targets: &[HostId],
        payload: &[u8],
        options: SendOptions,
    ) -> Result<(), NetworkError> {
        self.inner
            .send_message(targets, &Message::user(payload), options)
    }

    /// Sends a call produced by a proxy
    pub fn send_rpc(
        &self,
        targets: &[HostId],
        message: &Message,
        options: SendOptions,
    ) -> Result<(), NetworkError> {
        if message.message_type() != Some(MessageType::Rpc) {
            return Err(NetworkError::InvalidRequest("Not an rpc message"));
        }
        self.inner.send_message(targets, message, options)
    }

    pub fn set_event_handler(&self, events: impl LanClientEvents) {
        *self.inner.events.write() = Arc::new(events);
    }

    pub fn attach_stub(&self, stub: Arc<dyn RpcStub>) -> Result<(), NetworkError> {
        self.inner.stubs.write().attach(stub)
    }

    /// [`HostId::NONE`] until admitted and after leaving
    pub fn host_id(&self) -> HostId {
        self.inner.host_id()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_joined()
    }

    /// This client's address as the server sees it
    pub fn external_addr(&self) -> Option<SocketAddr> {
        self.inner.session.lock().external_addr
    }

    /// Where group members connect to this client, if direct links are enabled
    pub fn p2p_addr(&self) -> Option<SocketAddr> {
        self.inner.p2p_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.server.local_addr()
    }

    pub fn get_joined_p2p_groups(&self) -> Vec<HostId> {
        self.inner.peers.lock().group_ids()
    }

    pub fn get_p2p_group_info(&self, group_id: HostId) -> Option<JoinedGroupInfo> {
        self.inner.peers.lock().group_info(group_id)
    }

    pub fn get_peer_info(&self, peer_id: HostId) -> Option<PeerInfo> {
        self.inner.peers.lock().peer_info(peer_id)
    }

    pub fn get_peer_host_ids(&self) -> Vec<HostId> {
        self.inner.peers.lock().peer_ids()
    }

    /// Half the smoothed round trip to the server
    pub fn server_ping(&self) -> Option<Duration> {
        self.inner.ping.lock().server_ping
    }

    /// Half the smoothed round trip over the direct link to `peer_id`
    pub fn peer_ping(&self, peer_id: HostId) -> Option<Duration> {
        self.inner.peers.lock().recent_ping(peer_id)
    }

    /// The estimated time since the server started. Known after the first pong
    pub fn server_time(&self) -> Option<Duration> {
        self.inner
            .ping
            .lock()
            .server_clock
            .map(|(estimate, taken_at)| estimate + taken_at.elapsed())
    }
}

impl Drop for LanClient {
    fn drop(&mut self) {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        log::trace!(target: "lan", "Client dropped without disconnect; closing every link");
        self.inner.shutdown.cancel();
        self.inner.tasks.shutdown();
        self.inner.server.close();
        for link in self.inner.peers.lock().clear() {
            link.close();
        }
    }
}

impl ClientInner {
    fn events(&self) -> Arc<dyn LanClientEvents> {
        self.events.read().clone()
    }

    fn host_id(&self) -> HostId {
        self.session.lock().host_id
    }

    fn ticket(&self) -> Ticket {
        self.session.lock().ticket
    }

    fn is_joined(&self) -> bool {
        self.session.lock().stage == HandshakeStage::Joined
    }

    /// Resolves a pending `connect` with a failure. No effect once the join was decided
    fn fail_join(&self, reason: ErrorType, reply: Bytes) {
        let _ = self.join.send_if_modified(|state| {
            if *state == JoinState::Handshaking {
                *state = JoinState::Failed(reason, reply);
                true
            } else {
                false
            }
        });
    }

    fn record_leave_reason(&self, reason: ErrorType, comment: Bytes) {
        let _ = self
            .session
            .lock()
            .leave_reason
            .get_or_insert((reason, comment));
    }

    /// Microseconds on this node's clock
    fn local_time_us(&self) -> u64 {
        self.started_at.elapsed().as_micros() as u64
    }

    async fn wait_io_finished(&self, deadline: Instant) {
        while !self.server.io_finished() && Instant::now() < deadline {
            lan_io::tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    async fn wait_drained(&self, deadline: Instant) {
        while !self.tasks.is_drained() && Instant::now() < deadline {
            lan_io::tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    fn raise_event(&self, event: impl FnOnce(&dyn LanClientEvents) + Send + 'static) {
        let events = self.events();
        let _ = self
            .tasks
            .push(TaskSubject::Local, move || event(events.as_ref()));
    }

    fn raise_warning(&self, warning: ErrorInfo) {
        log::warn!(target: "lan", "{}: {}", warning.error_type, warning.comment);
        self.raise_event(move |events| events.on_warning(&warning));
    }
}
