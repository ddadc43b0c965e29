//! Shared test utilities: event recorders that forward every callback into a channel, and
//! helpers to start nodes on the loopback interface.
#![allow(dead_code)]

use lan_io::tokio;
use lan_io::tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use lan_proto::prelude::*;
use std::net::SocketAddr;
use std::time::Duration;

/// How long a test waits for a single event before failing
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Joined(ErrorType, bytes::Bytes),
    Left(ErrorType),
    MemberJoin {
        member: HostId,
        group: HostId,
        count: u32,
    },
    MemberLeave {
        member: HostId,
        group: HostId,
        count: u32,
    },
    FullyConnected(HostId),
    DirectEstablished(HostId),
    DirectLost(HostId),
    Message {
        sender: HostId,
        payload: Vec<u8>,
        relayed: bool,
    },
    NotImplemented(RpcId, HostId),
    Warning(ErrorType),
    Exception(HostId),
}

pub struct ClientRecorder {
    tx: UnboundedSender<ClientEvent>,
    /// Payloads starting with this byte make the message callback panic
    panic_marker: Option<u8>,
}

impl ClientRecorder {
    pub fn new() -> (Self, UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = unbounded_channel();
        (
            Self {
                tx,
                panic_marker: None,
            },
            rx,
        )
    }

    pub fn panicking_on(mut self, marker: u8) -> Self {
        self.panic_marker = Some(marker);
        self
    }

    fn record(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }
}

impl LanClientEvents for ClientRecorder {
    fn on_join_server_complete(&self, result: &ErrorInfo, reply: &bytes::Bytes) {
        self.record(ClientEvent::Joined(result.error_type, reply.clone()))
    }

    fn on_leave_server(&self, reason: &ErrorInfo) {
        self.record(ClientEvent::Left(reason.error_type))
    }

    fn on_p2p_member_join(
        &self,
        member_id: HostId,
        group_id: HostId,
        member_count: u32,
        _custom_field: &bytes::Bytes,
    ) {
        self.record(ClientEvent::MemberJoin {
            member: member_id,
            group: group_id,
            count: member_count,
        })
    }

    fn on_p2p_member_leave(&self, member_id: HostId, group_id: HostId, member_count: u32) {
        self.record(ClientEvent::MemberLeave {
            member: member_id,
            group: group_id,
            count: member_count,
        })
    }

    fn on_p2p_group_fully_connected(&self, group_id: HostId) {
        self.record(ClientEvent::FullyConnected(group_id))
    }

    fn on_p2p_connection_established(&self, peer_id: HostId) {
        self.record(ClientEvent::DirectEstablished(peer_id))
    }

    fn on_p2p_connection_lost(&self, peer_id: HostId, _reason: ErrorType) {
        self.record(ClientEvent::DirectLost(peer_id))
    }

    fn on_received_user_message(&self, message: ReceivedMessage) {
        if self.panic_marker.is_some() && message.payload().first() == self.panic_marker.as_ref() {
            panic!("marker payload");
        }

        self.record(ClientEvent::Message {
            sender: message.sender,
            payload: message.payload().to_vec(),
            relayed: message.relayed,
        })
    }

    fn on_rpc_not_implemented(&self, rpc_id: RpcId, sender: HostId) {
        self.record(ClientEvent::NotImplemented(rpc_id, sender))
    }

    fn on_warning(&self, warning: &ErrorInfo) {
        self.record(ClientEvent::Warning(warning.error_type))
    }

    fn on_exception(&self, subject: HostId, _reason: &str) {
        self.record(ClientEvent::Exception(subject))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    ClientJoin(HostId, Vec<u8>),
    ClientLeave(HostId, ErrorType),
    JoinAckComplete {
        group: HostId,
        member: HostId,
        result: ErrorType,
    },
    FullyConnected(HostId),
    GroupRemoved(HostId),
    Message {
        sender: HostId,
        payload: Vec<u8>,
    },
    NotImplemented(RpcId, HostId),
}

pub struct ServerRecorder {
    tx: UnboundedSender<ServerEvent>,
    /// Connection requests carrying this user data are rejected
    reject: Option<Vec<u8>>,
}

impl ServerRecorder {
    pub fn new() -> (Self, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx, reject: None }, rx)
    }

    pub fn rejecting(mut self, user_data: &[u8]) -> Self {
        self.reject = Some(user_data.to_vec());
        self
    }

    fn record(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}

impl LanServerEvents for ServerRecorder {
    fn on_connection_request(&self, _remote_addr: SocketAddr, user_data: &[u8]) -> ConnectionVerdict {
        match &self.reject {
            Some(rejected) if rejected.as_slice() == user_data => {
                ConnectionVerdict::Reject(bytes::Bytes::from_static(b"go away"))
            }
            _ => ConnectionVerdict::Accept(bytes::Bytes::from_static(b"welcome")),
        }
    }

    fn on_client_join(&self, client: &NetClientInfo) {
        self.record(ServerEvent::ClientJoin(
            client.host_id,
            client.user_data.to_vec(),
        ))
    }

    fn on_client_leave(&self, client: &NetClientInfo, reason: &ErrorInfo, _comment: &bytes::Bytes) {
        self.record(ServerEvent::ClientLeave(client.host_id, reason.error_type))
    }

    fn on_p2p_group_join_member_ack_complete(
        &self,
        group_id: HostId,
        member_id: HostId,
        result: ErrorType,
    ) {
        self.record(ServerEvent::JoinAckComplete {
            group: group_id,
            member: member_id,
            result,
        })
    }

    fn on_p2p_group_fully_connected(&self, group_id: HostId) {
        self.record(ServerEvent::FullyConnected(group_id))
    }

    fn on_p2p_group_removed(&self, group_id: HostId) {
        self.record(ServerEvent::GroupRemoved(group_id))
    }

    fn on_received_user_message(&self, message: ReceivedMessage) {
        self.record(ServerEvent::Message {
            sender: message.sender,
            payload: message.payload().to_vec(),
        })
    }

    fn on_rpc_not_implemented(&self, rpc_id: RpcId, sender: HostId) {
        self.record(ServerEvent::NotImplemented(rpc_id, sender))
    }
}

pub fn server_config(max_message_length: Option<usize>) -> ServerConfig {
    let mut builder = ServerSettingsBuilder::default();
    builder.with_listen_addr(SocketAddr::from(([127, 0, 0, 1], 0)));
    if let Some(len) = max_message_length {
        builder.with_max_message_length(len);
    }
    builder.build().unwrap()
}

pub fn start_server(events: ServerRecorder) -> LanServer {
    LanServer::start(server_config(None), events).unwrap()
}

pub fn client_config(server_addr: SocketAddr, direct_p2p: bool, user_data: &[u8]) -> ClientConfig {
    ClientSettingsBuilder::default()
        .with_server_addr(server_addr)
        .with_user_data(user_data)
        .with_direct_p2p(direct_p2p)
        .with_ping_interval(Duration::from_millis(200))
        .build()
        .unwrap()
}

pub async fn connect(
    server_addr: SocketAddr,
    direct_p2p: bool,
) -> (LanClient, UnboundedReceiver<ClientEvent>) {
    let (events, rx) = ClientRecorder::new();
    let client = LanClient::connect(client_config(server_addr, direct_p2p, b"hello"), events)
        .await
        .unwrap();
    (client, rx)
}

/// Waits for the first event accepted by `select`, skipping everything else
pub async fn wait_for<E: std::fmt::Debug, T>(
    rx: &mut UnboundedReceiver<E>,
    mut select: impl FnMut(&E) -> Option<T>,
) -> T {
    let wait = async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            log::trace!(target: "lan", "Test observed {event:?}");
            if let Some(value) = select(&event) {
                return value;
            }
        }
    };

    tokio::time::timeout(EVENT_TIMEOUT, wait)
        .await
        .expect("timed out waiting for an event")
}

/// Waits for `expected`, skipping every other event
pub async fn expect_event<E: std::fmt::Debug + PartialEq>(rx: &mut UnboundedReceiver<E>, expected: E) {
    wait_for(rx, |event| (*event == expected).then_some(())).await
}

/// Collects whatever arrives within `window`
pub async fn drain_for<E>(rx: &mut UnboundedReceiver<E>, window: Duration) -> Vec<E> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        events.push(event);
    }
    events
}

/// Polls `condition` until it holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };

    tokio::time::timeout(EVENT_TIMEOUT, wait)
        .await
        .expect("condition never held")
}
