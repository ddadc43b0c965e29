//! Message construction and parsing.
//!
//! Every message begins with a [`MessageType`] byte followed by type-specific fields. Fields are
//! written with a compact little-endian encoding: fixed-width primitives are written as-is,
//! while lengths and counts use an LEB128 scalar. The [`Marshal`] trait ties a Rust type to
//! that encoding; proxies write arguments through it and stubs read them back in the same
//! order.
use crate::constants::MAX_SCALAR_LEN;
use crate::error::NetworkError;
use bytes::{BufMut, Bytes, BytesMut};
use lan_types::errors::ErrorType;
use lan_types::proto::{EncryptMode, HostId, ProtocolVersion};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Rpc = 1,
    UserMessage = 2,
    Encrypted = 3,
    Compressed = 4,
    /// A message forwarded by the server on behalf of another client
    Relayed = 5,
    /// A client asking the server to forward a message to other clients
    RelayRequest = 6,
    ConnectionHint = 10,
    EncryptedSessionKey = 11,
    SessionKeySuccess = 12,
    RequestServerConnection = 13,
    ConnectSuccess = 14,
    ConnectDenied = 15,
    ProtocolVersionMismatch = 16,
    Ping = 17,
    Pong = 18,
    ShutdownTcp = 19,
    ShutdownTcpAck = 20,
    PeerHandshake = 21,
    PeerHandshakeAck = 22,
}

impl TryFrom<u8> for MessageType {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Rpc,
            2 => Self::UserMessage,
            3 => Self::Encrypted,
            4 => Self::Compressed,
            5 => Self::Relayed,
            6 => Self::RelayRequest,
            10 => Self::ConnectionHint,
            11 => Self::EncryptedSessionKey,
            12 => Self::SessionKeySuccess,
            13 => Self::RequestServerConnection,
            14 => Self::ConnectSuccess,
            15 => Self::ConnectDenied,
            16 => Self::ProtocolVersionMismatch,
            17 => Self::Ping,
            18 => Self::Pong,
            19 => Self::ShutdownTcp,
            20 => Self::ShutdownTcpAck,
            21 => Self::PeerHandshake,
            22 => Self::PeerHandshakeAck,
            _ => return Err(NetworkError::InvalidPacket("Unknown message type")),
        })
    }
}

/// An outbound message under construction
#[derive(Clone)]
pub struct Message {
    buf: BytesMut,
}

impl Message {
    pub fn new(message_type: MessageType) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(message_type as u8);
        Self { buf }
    }

    /// A freeform message carrying `payload` verbatim
    pub fn user(payload: &[u8]) -> Self {
        let mut this = Self::new(MessageType::UserMessage);
        this.write_raw(payload);
        this
    }

    /// Re-wraps an already encoded message, e.g., one that was just unwrapped from an envelope
    pub fn from_encoded(encoded: &[u8]) -> Result<Self, NetworkError> {
        let first = *encoded
            .first()
            .ok_or(NetworkError::InvalidPacket("Empty message"))?;
        MessageType::try_from(first)?;
        Ok(Self {
            buf: BytesMut::from(encoded),
        })
    }

    pub fn write<T: Marshal>(&mut self, value: &T) -> &mut Self {
        value.marshal(self);
        self
    }

    pub fn write_scalar(&mut self, value: u64) -> &mut Self {
        encode_scalar(value, &mut self.buf);
        self
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write_scalar(value.len() as u64);
        self.write_raw(value.as_bytes())
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.buf
            .first()
            .and_then(|ty| MessageType::try_from(*ty).ok())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    pub(crate) fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message({:?}, {} bytes)", self.message_type(), self.len())
    }
}

/// A cursor over a received message. Reads that fail leave the cursor where it was
#[derive(Clone)]
pub struct MessageReader {
    buf: Bytes,
    pos: usize,
}

impl MessageReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn remaining_slice(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// The whole underlying message, independent of the cursor
    pub fn full(&self) -> &Bytes {
        &self.buf
    }

    pub fn read<T: Marshal>(&mut self) -> Result<T, NetworkError> {
        let checkpoint = self.pos;
        let result = T::unmarshal(self);
        if result.is_err() {
            self.pos = checkpoint;
        }
        result
    }

    pub fn read_scalar(&mut self) -> Result<u64, NetworkError> {
        match decode_scalar(self.remaining_slice(), MAX_SCALAR_LEN) {
            ScalarDecode::Complete { value, consumed } => {
                self.pos += consumed;
                Ok(value)
            }
            ScalarDecode::Incomplete => Err(NetworkError::InvalidPacket("Truncated scalar")),
            ScalarDecode::Malformed => Err(NetworkError::InvalidPacket("Malformed scalar")),
        }
    }

    /// A zero-copy view of the next `len` bytes
    pub fn read_exact(&mut self, len: usize) -> Result<Bytes, NetworkError> {
        if self.remaining() < len {
            return Err(NetworkError::InvalidPacket("Truncated message"));
        }
        let out = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Consumes everything after the cursor
    pub fn read_rest(&mut self) -> Bytes {
        let out = self.buf.slice(self.pos..);
        self.pos = self.buf.len();
        out
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], NetworkError> {
        if self.remaining() < N {
            return Err(NetworkError::InvalidPacket("Truncated message"));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }
}

impl Debug for MessageReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageReader({}/{})", self.pos, self.buf.len())
    }
}

/// Conversion between a value and its wire encoding
pub trait Marshal: Sized {
    fn marshal(&self, msg: &mut Message);
    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError>;
}

macro_rules! impl_marshal_le {
    ($($ty:ty),*) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, msg: &mut Message) {
                    msg.write_raw(&self.to_le_bytes());
                }

                fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
                    reader.take().map(<$ty>::from_le_bytes)
                }
            }
        )*
    };
}

impl_marshal_le!(u8, i8, u16, i16, u32, i32, u64, i64, u128, f32, f64);

impl Marshal for bool {
    fn marshal(&self, msg: &mut Message) {
        msg.buf_mut().put_u8(*self as u8);
    }

    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        match u8::unmarshal(reader)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(NetworkError::InvalidPacket("Invalid boolean")),
        }
    }
}

impl Marshal for Bytes {
    fn marshal(&self, msg: &mut Message) {
        msg.write_scalar(self.len() as u64);
        msg.write_raw(self);
    }

    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        let len = reader.read_scalar()?;
        if len > reader.remaining() as u64 {
            return Err(NetworkError::InvalidPacket("Byte array longer than message"));
        }
        reader.read_exact(len as usize)
    }
}

impl Marshal for String {
    fn marshal(&self, msg: &mut Message) {
        msg.write_str(self);
    }

    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        let bytes = Bytes::unmarshal(reader)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| NetworkError::InvalidPacket("Invalid UTF-8"))
    }
}

impl<T: Marshal> Marshal for Vec<T> {
    fn marshal(&self, msg: &mut Message) {
        msg.write_scalar(self.len() as u64);
        for item in self {
            item.marshal(msg);
        }
    }

    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        let count = reader.read_scalar()?;
        // every encoded element occupies at least one byte
        if count > reader.remaining() as u64 {
            return Err(NetworkError::InvalidPacket("Array count longer than message"));
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(T::unmarshal(reader)?);
        }
        Ok(out)
    }
}

impl<T: Marshal> Marshal for Option<T> {
    fn marshal(&self, msg: &mut Message) {
        match self {
            Some(value) => {
                msg.buf_mut().put_u8(1);
                value.marshal(msg);
            }
            None => {
                msg.buf_mut().put_u8(0);
            }
        }
    }

    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        if bool::unmarshal(reader)? {
            Ok(Some(T::unmarshal(reader)?))
        } else {
            Ok(None)
        }
    }
}

impl Marshal for HostId {
    fn marshal(&self, msg: &mut Message) {
        self.0.marshal(msg)
    }

    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        u32::unmarshal(reader).map(HostId)
    }
}

impl Marshal for ProtocolVersion {
    fn marshal(&self, msg: &mut Message) {
        self.0.marshal(msg)
    }

    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        u128::unmarshal(reader).map(ProtocolVersion)
    }
}

impl Marshal for ErrorType {
    fn marshal(&self, msg: &mut Message) {
        (*self as u8).marshal(msg)
    }

    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        ErrorType::from_u8(u8::unmarshal(reader)?)
            .ok_or(NetworkError::InvalidPacket("Unknown error type"))
    }
}

impl Marshal for EncryptMode {
    fn marshal(&self, msg: &mut Message) {
        (*self as u8).marshal(msg)
    }

    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        match u8::unmarshal(reader)? {
            0 => Ok(EncryptMode::None),
            1 => Ok(EncryptMode::Secure),
            2 => Ok(EncryptMode::Fast),
            _ => Err(NetworkError::InvalidPacket("Unknown encryption mode")),
        }
    }
}

impl Marshal for SocketAddr {
    fn marshal(&self, msg: &mut Message) {
        match self.ip() {
            IpAddr::V4(ip) => {
                msg.write(&4u8).write_raw(&ip.octets());
            }
            IpAddr::V6(ip) => {
                msg.write(&6u8).write_raw(&ip.octets());
            }
        }
        msg.write(&self.port());
    }

    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        let ip = match u8::unmarshal(reader)? {
            4 => IpAddr::V4(Ipv4Addr::from(reader.take::<4>()?)),
            6 => IpAddr::V6(Ipv6Addr::from(reader.take::<16>()?)),
            _ => return Err(NetworkError::InvalidPacket("Unknown address family")),
        };
        Ok(SocketAddr::new(ip, u16::unmarshal(reader)?))
    }
}

macro_rules! impl_marshal_tuple {
    ($($name:ident),+) => {
        impl<$($name: Marshal),+> Marshal for ($($name,)+) {
            #[allow(non_snake_case)]
            fn marshal(&self, msg: &mut Message) {
                let ($($name,)+) = self;
                $($name.marshal(msg);)+
            }

            fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
                Ok(($($name::unmarshal(reader)?,)+))
            }
        }
    };
}

impl_marshal_tuple!(A, B);
impl_marshal_tuple!(A, B, C);
impl_marshal_tuple!(A, B, C, D);

/// Carries any serde type as a length-prefixed bincode blob
#[derive(Clone, Debug, PartialEq)]
pub struct Bincode<T>(pub T);

impl<T: Serialize + DeserializeOwned> Marshal for Bincode<T> {
    fn marshal(&self, msg: &mut Message) {
        match bincode::serialize(&self.0) {
            Ok(bytes) => Bytes::from(bytes).marshal(msg),
            Err(err) => {
                log::error!(target: "lan", "Unable to serialize argument: {err}");
                Bytes::new().marshal(msg)
            }
        }
    }

    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        let bytes = Bytes::unmarshal(reader)?;
        bincode::deserialize(&bytes)
            .map(Bincode)
            .map_err(|_| NetworkError::InvalidPacket("Invalid bincode argument"))
    }
}

/// A message delivered to the application, tagged with who sent it and how it arrived
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub sender: HostId,
    /// True when the server forwarded the message because no direct link existed
    pub relayed: bool,
    pub encrypt_mode: EncryptMode,
    pub compressed: bool,
    reader: MessageReader,
}

impl ReceivedMessage {
    pub(crate) fn new(sender: HostId, reader: MessageReader, relayed: bool) -> Self {
        Self {
            sender,
            relayed,
            encrypt_mode: EncryptMode::None,
            compressed: false,
            reader,
        }
    }

    pub(crate) fn with_security(mut self, encrypt_mode: EncryptMode, compressed: bool) -> Self {
        self.encrypt_mode = encrypt_mode;
        self.compressed = compressed;
        self
    }

    /// The application payload, i.e., everything after the message header
    pub fn payload(&self) -> &[u8] {
        self.reader.remaining_slice()
    }

    pub fn reader(&mut self) -> &mut MessageReader {
        &mut self.reader
    }
}

pub(crate) enum ScalarDecode {
    Complete { value: u64, consumed: usize },
    /// More bytes are needed
    Incomplete,
    /// Longer than `max_len` bytes or overflowing a u64
    Malformed,
}

pub(crate) fn encode_scalar(mut value: u64, buf: &mut impl BufMut) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub(crate) fn decode_scalar(buf: &[u8], max_len: usize) -> ScalarDecode {
    let mut value = 0u64;
    for (idx, byte) in buf.iter().enumerate() {
        if idx >= max_len || idx >= MAX_SCALAR_LEN {
            return ScalarDecode::Malformed;
        }
        let bits = (*byte & 0x7F) as u64;
        let shift = 7 * idx as u32;
        if shift == 63 && bits > 1 {
            return ScalarDecode::Malformed;
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return ScalarDecode::Complete {
                value,
                consumed: idx + 1,
            };
        }
    }

    if buf.len() >= max_len {
        ScalarDecode::Malformed
    } else {
        ScalarDecode::Incomplete
    }
}

/// Reads the leading type byte of an encoded message
pub(crate) fn split_message_type(
    encoded: Bytes,
) -> Result<(MessageType, MessageReader), NetworkError> {
    let mut reader = MessageReader::new(encoded);
    let ty = MessageType::try_from(u8::unmarshal(&mut reader)?)?;
    Ok((ty, reader))
}
