use lan_io::tokio::time::Duration;

/// Bumped whenever the handshake or framing changes incompatibly. Checked before any key
/// material is exchanged
pub const INTERNAL_PROTOCOL_VERSION: u32 = 4;

/// The first two bytes of every frame
pub const MESSAGE_SPLITTER: u16 = 0x5713;
/// Splitter (2) plus the longest compact-scalar length prefix this codec accepts (5)
pub const MAX_FRAME_HEADER_LEN: usize = 7;
/// An LEB128 scalar never needs more than this many bytes for a `u64`
pub const MAX_SCALAR_LEN: usize = 10;
pub const CODEC_MIN_BUFFER: usize = 8 * 1024;
pub const CODEC_BUFFER_CAPACITY: usize = 64 * 1024;
/// Upper bound of a single write issued by a link's writer task
pub const MAX_SEND_BATCH_BYTES: usize = 256 * 1024;
/// Room reserved on the wire for the compression and encryption envelopes around a message
pub const ENVELOPE_OVERHEAD: usize = 64;
/// Targets carried by one relay request. Longer target lists are split across requests
pub const MAX_RELAY_TARGETS: usize = 64;
/// Room a relay request (type, target list, flag, payload length) adds around the message it
/// carries. A relayed message of the maximum length still fits in a frame
pub const RELAY_ENVELOPE_OVERHEAD: usize =
    1 + MAX_SCALAR_LEN + MAX_RELAY_TARGETS * 4 + 1 + MAX_SCALAR_LEN;
/// Limits how deep encrypted/compressed envelopes may nest inside each other
pub const MAX_ENVELOPE_DEPTH: usize = 3;

/// Frames sitting in a send queue for longer than this are eligible for dropping when the
/// queue is over its warning capacity (unreliable frames only)
pub const UNRELIABLE_FRAME_MAX_AGE: Duration = Duration::from_millis(1500);
/// Time given to a closing link to flush its last frames (e.g., a rejection notice)
pub const LINK_FLUSH_ON_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);
/// Direct links that do not complete their handshake in this window are dropped
pub const P2P_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Smoothing factor applied to each new latency sample
pub const PING_SMOOTHING_FACTOR: f64 = 0.3;

/// Rpc ids at or above this value belong to the engine and are never delivered to user stubs
pub const ENGINE_RPC_ID_BASE: u16 = 64000;
pub const ENGINE_S2C_RPC_BASE: u16 = ENGINE_RPC_ID_BASE;
pub const ENGINE_C2S_RPC_BASE: u16 = ENGINE_RPC_ID_BASE + 100;

pub(crate) const HEARTBEAT_TICKET: usize = 0;
pub(crate) const LONG_TICK_TICKET: usize = 1;
pub(crate) const PING_TICKET: usize = 2;
