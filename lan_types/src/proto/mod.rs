use crate::crypto::{StrongKeyLength, WeakKeyLength};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_SERVER_PORT: u16 = 33445;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CANDIDATE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ACK_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_LONG_TICK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HOST_ID_RECYCLE_DELAY: Duration = Duration::from_secs(0);
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 1024 * 1024;
pub const DEFAULT_SEND_QUEUE_WARNING_CAPACITY: usize = 4 * 1024 * 1024;
pub const DEFAULT_USER_WORKER_COUNT: usize = 4;

/// Identifies a client, a P2P group, or one of the reserved ids. Clients and groups share a
/// single namespace
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize, Default)]
#[repr(transparent)]
pub struct HostId(pub u32);

impl HostId {
    /// The absence of a host
    pub const NONE: HostId = HostId(0);
    /// The server node
    pub const SERVER: HostId = HostId(1);
    /// The first id handed out to clients and groups
    pub const FIRST_ASSIGNABLE: HostId = HostId(2);

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }

    pub const fn is_server(self) -> bool {
        self.0 == Self::SERVER.0
    }

    pub const fn is_assignable(self) -> bool {
        self.0 >= Self::FIRST_ASSIGNABLE.0
    }
}

impl Debug for HostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::NONE => write!(f, "HostId(none)"),
            Self::SERVER => write!(f, "HostId(server)"),
            HostId(id) => write!(f, "HostId({id})"),
        }
    }
}

impl Display for HostId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::NONE => write!(f, "none"),
            Self::SERVER => write!(f, "server"),
            HostId(id) => write!(f, "{id}"),
        }
    }
}

impl From<u32> for HostId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Whether released host ids may be handed out again
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum HostIdGenerationPolicy {
    /// Reuse released ids once their recycle delay elapsed
    #[default]
    Recycle,
    /// Every id is issued at most once for the lifetime of the server
    NoRecycle,
}

/// Application-defined protocol version. A client whose version differs from the server's is
/// turned away during the handshake
#[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[repr(transparent)]
pub struct ProtocolVersion(pub u128);

impl ProtocolVersion {
    pub fn random() -> Self {
        Self(Uuid::new_v4().as_u128())
    }
}

impl Debug for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Uuid::from_u128(self.0))
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl From<Uuid> for ProtocolVersion {
    fn from(value: Uuid) -> Self {
        Self(value.as_u128())
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MessageReliability {
    #[default]
    Reliable,
    /// May be dropped when the send queue of a slow peer backs up
    Unreliable,
}

/// How a message is protected on the wire
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EncryptMode {
    #[default]
    None = 0,
    /// The strong (AES-GCM) tier of the session key
    Secure = 1,
    /// The weak (ChaCha20-Poly1305) tier of the session key
    Fast = 2,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CompressMode {
    #[default]
    None,
    Zstd,
}

/// Tunables of a `LanServer`. Built once and shared immutably for the lifetime of the server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSettings {
    pub listen_addr: SocketAddr,
    pub protocol_version: ProtocolVersion,
    /// A client that produces no traffic for this long is disposed
    pub default_timeout: Duration,
    /// A candidate that does not finish the handshake within this window is disposed
    pub candidate_timeout: Duration,
    pub ack_wait_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub long_tick_interval: Duration,
    pub max_message_length: usize,
    pub enable_nagle: bool,
    pub strong_key_length: StrongKeyLength,
    pub weak_key_length: WeakKeyLength,
    pub allow_server_as_p2p_group_member: bool,
    pub allow_empty_p2p_group: bool,
    /// Hand group members fresh pairwise keys for their direct links
    pub enable_p2p_encryption: bool,
    pub host_id_generation_policy: HostIdGenerationPolicy,
    pub host_id_recycle_delay: Duration,
    pub send_queue_warning_capacity: usize,
    pub graceful_shutdown_timeout: Duration,
    /// How many user callbacks may run at once (across distinct subjects)
    pub user_worker_count: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_SERVER_PORT),
            protocol_version: ProtocolVersion::default(),
            default_timeout: DEFAULT_TIMEOUT,
            candidate_timeout: DEFAULT_CANDIDATE_TIMEOUT,
            ack_wait_timeout: DEFAULT_ACK_WAIT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            long_tick_interval: DEFAULT_LONG_TICK_INTERVAL,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            enable_nagle: false,
            strong_key_length: StrongKeyLength::default(),
            weak_key_length: WeakKeyLength::default(),
            allow_server_as_p2p_group_member: false,
            allow_empty_p2p_group: false,
            enable_p2p_encryption: true,
            host_id_generation_policy: HostIdGenerationPolicy::default(),
            host_id_recycle_delay: DEFAULT_HOST_ID_RECYCLE_DELAY,
            send_queue_warning_capacity: DEFAULT_SEND_QUEUE_WARNING_CAPACITY,
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
            user_worker_count: DEFAULT_USER_WORKER_COUNT,
        }
    }
}

/// Tunables of a `LanClient`. The idle timeout and the maximum message length are dictated
/// by the server during the handshake
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientSettings {
    pub server_addr: SocketAddr,
    pub protocol_version: ProtocolVersion,
    /// Opaque payload handed to the server's connection-request callback
    pub user_data: Vec<u8>,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub long_tick_interval: Duration,
    pub ping_interval: Duration,
    pub enable_nagle: bool,
    /// Accept and open direct links to other members of shared P2P groups
    pub enable_direct_p2p: bool,
    pub p2p_bind_ip: IpAddr,
    pub send_queue_warning_capacity: usize,
    pub user_worker_count: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_SERVER_PORT),
            protocol_version: ProtocolVersion::default(),
            user_data: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            long_tick_interval: DEFAULT_LONG_TICK_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
            enable_nagle: false,
            enable_direct_p2p: true,
            p2p_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            send_queue_warning_capacity: DEFAULT_SEND_QUEUE_WARNING_CAPACITY,
            user_worker_count: DEFAULT_USER_WORKER_COUNT,
        }
    }
}
