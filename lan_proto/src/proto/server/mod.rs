//! The server node.
//!
//! A [`LanServer`] owns the listener, the registry of candidates and clients, the group
//! coordinator and the queue that runs user callbacks. Socket I/O runs on the network pool;
//! user callbacks run on the user pool through the [`TaskQueue`].
mod dispatch;
mod handshake;
mod heartbeat;

use crate::error::NetworkError;
use crate::proto::events::{LanServerEvents, NetClientInfo};
use crate::proto::message::{Message, MessageType};
use crate::proto::p2p_group::{P2PGroupInfo, PairwiseInfo};
use crate::proto::packet_crafter::do_disconnect::ShutdownTcp;
use crate::proto::packet_crafter::ControlPacket;
use crate::proto::peer::{PeerState, RemoteClient};
use crate::proto::registry::ServerRegistry;
use crate::proto::rpc::RpcStub;
use crate::proto::rpc::StubRegistry;
use crate::proto::security::SendOptions;
use crate::proto::settings::ServerConfig;
use crate::proto::task_queue::{TaskQueue, TaskSubject};
use crate::proto::timer_queue::TimerQueue;
use bytes::Bytes;
use lan_crypt::key_exchange::KeyExchangeSecret;
use lan_io::tokio::net::TcpListener;
use lan_io::tokio::time::Instant;
use lan_io::tokio_util::sync::CancellationToken;
use lan_io::{Mutex, RwLock, WorkerPool};
use lan_types::errors::ErrorType;
use lan_types::proto::{HostId, ServerSettings};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type EventSlot = Arc<RwLock<Arc<dyn LanServerEvents>>>;

pub struct LanServer {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    settings: Arc<ServerSettings>,
    registry: Mutex<ServerRegistry>,
    /// Held from a group change until its notifications are queued. Taken before `registry`
    group_sequence: Mutex<()>,
    tasks: TaskQueue,
    events: EventSlot,
    stubs: RwLock<StubRegistry>,
    key_exchange: KeyExchangeSecret,
    local_addr: SocketAddr,
    started_at: Instant,
    /// Stops the listener and refuses new connections
    shutdown: CancellationToken,
    /// Set once the drain finished; ends the timers
    terminated: AtomicBool,
    // dropped last: an owned runtime must outlive everything spawned onto it
    net_pool: WorkerPool,
    user_pool: WorkerPool,
}

impl LanServer {
    /// Binds the listener and starts serving. Bind failures are returned here and leave
    /// nothing running
    pub fn start(
        config: ServerConfig,
        events: impl LanServerEvents,
    ) -> Result<LanServer, NetworkError> {
        let ServerConfig {
            settings,
            net_pool,
            user_pool,
        } = config;
        let net_pool = WorkerPool::new(&net_pool, "lan-server-net")?;
        let user_pool = WorkerPool::new(&user_pool, "lan-server-user")?;

        let std_listener = std::net::TcpListener::bind(settings.listen_addr).map_err(|err| {
            NetworkError::SocketError(format!(
                "Unable to listen on {}: {err}",
                settings.listen_addr
            ))
        })?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;
        let listener = {
            let _guard = net_pool.handle().enter();
            TcpListener::from_std(std_listener)?
        };

        let events: EventSlot = Arc::new(RwLock::new(Arc::new(events)));
        let exception_slot = events.clone();
        let tasks = TaskQueue::new(Arc::new(move |subject, reason: String| {
            let host_id = match subject {
                TaskSubject::Local => HostId::SERVER,
                TaskSubject::Peer(host_id) => host_id,
                TaskSubject::Candidate(_) => HostId::NONE,
            };
            let events = exception_slot.read().clone();
            events.on_exception(host_id, &reason);
        }));
        tasks.start(user_pool.handle(), settings.user_worker_count);

        let inner = Arc::new(ServerInner {
            registry: Mutex::new(ServerRegistry::new(&settings)),
            group_sequence: Mutex::new(()),
            tasks,
            events,
            stubs: RwLock::new(StubRegistry::default()),
            key_exchange: KeyExchangeSecret::generate(),
            local_addr,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            terminated: AtomicBool::new(false),
            settings,
            net_pool,
            user_pool,
        });

        let (timer_queue, timers) = TimerQueue::new(Arc::downgrade(&inner));
        ServerInner::register_timers(&timers, &inner.settings);
        let _ = inner.net_pool.spawn(async move {
            if let Err(err) = timer_queue.await {
                log::error!(target: "lan", "Server timers stopped: {err}");
            }
        });

        let _ = inner
            .net_pool
            .spawn(ServerInner::listener_loop(inner.clone(), listener));

        log::info!(target: "lan", "Server listening on {local_addr}");
        Ok(LanServer { inner })
    }

    /// Disconnects every client and waits (up to the graceful shutdown timeout) for their
    /// disposal and the remaining callbacks
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.shutdown.cancel();

        let clients = inner.registry.lock().all();
        for client in clients {
            if client.state() == PeerState::Authenticated {
                let farewell = ShutdownTcp {
                    comment: Bytes::new(),
                };
                let _ = client.link().send(&farewell.craft(), SendOptions::RELIABLE);
            }
            let _ = inner.dispose_client(
                &client,
                ErrorType::DisconnectFromLocal,
                ErrorType::ServerStopped,
                Bytes::new(),
            );
        }

        let timeout = inner.settings.graceful_shutdown_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            inner.sweep_disposed(Instant::now(), timeout);
            if inner.registry.lock().is_empty() && inner.tasks.is_drained() {
                break;
            }

            if Instant::now() >= deadline {
                log::warn!(target: "lan", "Server drain exceeded {timeout:?}; forcing shutdown");
                inner.sweep_disposed(Instant::now(), Duration::ZERO);
                break;
            }

            lan_io::tokio::time::sleep(inner.settings.heartbeat_interval).await;
        }

        inner.tasks.shutdown();
        inner.terminated.store(true, Ordering::Release);
        log::info!(target: "lan", "Server on {} stopped", inner.local_addr);
    }

    /// Creates a group of `members` (which may be empty if empty groups are allowed) and
    /// returns its id
    pub fn create_p2p_group(
        &self,
        members: &[HostId],
        custom_field: Bytes,
    ) -> Result<HostId, NetworkError> {
        self.inner.run_group_op(|registry| {
            registry.create_group(members, custom_field, Instant::now())
        })
    }

    pub fn join_p2p_group(
        &self,
        group_id: HostId,
        member_id: HostId,
        custom_field: Bytes,
    ) -> Result<(), NetworkError> {
        self.inner.run_group_op(|registry| {
            let actions = registry.join_group(group_id, member_id, custom_field, Instant::now())?;
            Ok(((), actions))
        })
    }

    pub fn leave_p2p_group(&self, group_id: HostId, member_id: HostId) -> Result<(), NetworkError> {
        self.inner.run_group_op(|registry| {
            let actions = registry.leave_group(group_id, member_id, Instant::now())?;
            Ok(((), actions))
        })
    }

    pub fn destroy_p2p_group(&self, group_id: HostId) -> Result<(), NetworkError> {
        self.inner.run_group_op(|registry| {
            let actions = registry.destroy_group(group_id, Instant::now())?;
            Ok(((), actions))
        })
    }

    /// Sends a freeform message. Groups expand into their members; the server's own id
    /// delivers locally
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

    /// Disconnects a client. Its leave event follows once it is disposed
    pub fn close_connection(&self, host_id: HostId) -> Result<(), NetworkError> {
        let client = self
            .inner
            .registry
            .lock()
            .lookup_active(host_id)
            .ok_or(NetworkError::UnknownHost(host_id))?;
        let farewell = ShutdownTcp {
            comment: Bytes::new(),
        };
        let _ = client.link().send(&farewell.craft(), SendOptions::RELIABLE);
        let _ = self.inner.dispose_client(
            &client,
            ErrorType::DisconnectFromLocal,
            ErrorType::Ok,
            Bytes::new(),
        );
        Ok(())
    }

    pub fn set_event_handler(&self, events: impl LanServerEvents) {
        *self.inner.events.write() = Arc::new(events);
    }

    pub fn attach_stub(&self, stub: Arc<dyn RpcStub>) -> Result<(), NetworkError> {
        self.inner.stubs.write().attach(stub)
    }

    pub fn get_client_info(&self, host_id: HostId) -> Option<NetClientInfo> {
        let registry = self.inner.registry.lock();
        let client = registry.lookup_active(host_id)?;
        Some(client.info(registry.groups.groups_of(host_id)))
    }

    pub fn get_client_host_ids(&self) -> Vec<HostId> {
        self.inner.registry.lock().active_host_ids()
    }

    pub fn get_p2p_group_info(&self, group_id: HostId) -> Option<P2PGroupInfo> {
        self.inner.registry.lock().groups.group_info(group_id)
    }

    pub fn get_p2p_group_ids(&self) -> Vec<HostId> {
        self.inner.registry.lock().groups.group_ids()
    }

    pub fn get_p2p_pair_info(&self, a: HostId, b: HostId) -> Option<PairwiseInfo> {
        self.inner.registry.lock().groups.pair_info(a, b)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Time since the server started; clients estimate it from their pings
    pub fn server_time(&self) -> Duration {
        self.inner.started_at.elapsed()
    }
}

impl Drop for LanServer {
    fn drop(&mut self) {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        log::trace!(target: "lan", "Server dropped without stop; closing every link");
        self.inner.shutdown.cancel();
        self.inner.tasks.shutdown();
        for client in self.inner.registry.lock().all() {
            client.link().close();
        }
    }
}

impl ServerInner {
    async fn listener_loop(this: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = lan_io::tokio::select! {
                biased;
                _ = this.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    log::trace!(target: "lan", "Received stream from {peer_addr}");
                    if let Err(err) = this.on_new_connection(stream) {
                        log::warn!(target: "lan", "Dropping connection from {peer_addr}: {err}");
                    }
                }

                Err(err) => {
                    log::error!(target: "lan", "Error accepting stream: {err}");
                }
            }
        }

        log::trace!(target: "lan", "Listener on {} closed", this.local_addr);
    }

    fn events(&self) -> Arc<dyn LanServerEvents> {
        self.events.read().clone()
    }

    fn server_time_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Issues the disposal of `client` and drops it from every group. Only the first call per
    /// client has any effect
    fn dispose_client(
        self: &Arc<Self>,
        client: &Arc<RemoteClient>,
        reason: ErrorType,
        detail: ErrorType,
        comment: Bytes,
    ) -> bool {
        if !client.request_dispose(reason, detail, comment) {
            return false;
        }

        if let Some(host_id) = client.host_id() {
            log::trace!(target: "lan", "Disposing {host_id} ({reason})");
            let _ = self.run_group_op(|registry| {
                Ok(((), registry.leave_all_groups(host_id, Instant::now())))
            });
        }

        true
    }

    /// Removes every record that became safe to destroy and reports the departure of the
    /// admitted ones
    fn sweep_disposed(self: &Arc<Self>, now: Instant, force_after: Duration) {
        let removed = self
            .registry
            .lock()
            .collect_disposed(&self.tasks, now, force_after);

        for (client, forced) in removed {
            if forced {
                log::warn!(target: "lan", "Forced disposal of {:?} after {force_after:?}", client.link());
            }

            let Some(host_id) = client.host_id() else {
                continue;
            };

            let (reason, comment) = client.leave_report();
            let info = client.info(Vec::new());
            let events = self.events();
            let _ = self.tasks.push(TaskSubject::Peer(host_id), move || {
                events.on_client_leave(&info, &reason, &comment)
            });
        }
    }
}
