use serde::{Deserialize, Serialize};

/// Reason codes reported with every disposal, join result and diagnostic. The codes travel on
/// the wire (e.g., inside a disconnect notice), so the discriminants are fixed
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[repr(u8)]
pub enum ErrorType {
    #[default]
    Ok = 0,
    Unexpected = 1,
    AlreadyConnected = 2,
    TcpConnectFailure = 3,
    InvalidSessionKey = 4,
    EncryptFail = 5,
    DecryptFail = 6,
    ConnectServerTimeout = 7,
    ProtocolVersionMismatch = 8,
    NotifyServerDeniedConnection = 9,
    DisconnectFromRemote = 10,
    DisconnectFromLocal = 11,
    InvalidHostId = 12,
    ServerPortListenFailure = 13,
    MessageTooLong = 14,
    StreamInconsistent = 15,
    InvalidPacketFormat = 16,
    CryptoCounterMismatch = 17,
    ConnectionTimeout = 18,
    AuthenticationTimeout = 19,
    P2PGroupJoinTimeout = 20,
    P2PGroupJoinAborted = 21,
    P2PGroupNotFound = 22,
    RpcNotImplemented = 23,
    UserCallbackException = 24,
    SendQueueOverload = 25,
    P2PConnectFailure = 26,
    ServerStopped = 27,
}

/// The failure taxonomy a reason code belongs to
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, strum::Display)]
pub enum ErrorCategory {
    /// Not a failure
    None,
    /// An explicit, orderly close
    Graceful,
    /// Malformed or unexpected traffic. Always fatal to the connection it arrived on
    Protocol,
    /// Socket or pool setup failed. Reported synchronously at the API boundary
    Resource,
    /// A peer or protocol step took too long. A normal disposal reason
    Timeout,
    /// User code failed
    Application,
}

impl ErrorType {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Ok => ErrorCategory::None,

            Self::DisconnectFromRemote
            | Self::DisconnectFromLocal
            | Self::NotifyServerDeniedConnection
            | Self::ServerStopped => ErrorCategory::Graceful,

            Self::InvalidSessionKey
            | Self::EncryptFail
            | Self::DecryptFail
            | Self::ProtocolVersionMismatch
            | Self::InvalidHostId
            | Self::MessageTooLong
            | Self::StreamInconsistent
            | Self::InvalidPacketFormat
            | Self::CryptoCounterMismatch
            | Self::AlreadyConnected
            | Self::P2PGroupNotFound
            | Self::P2PGroupJoinAborted
            | Self::Unexpected => ErrorCategory::Protocol,

            Self::TcpConnectFailure
            | Self::ServerPortListenFailure
            | Self::SendQueueOverload
            | Self::P2PConnectFailure => ErrorCategory::Resource,

            Self::ConnectServerTimeout
            | Self::ConnectionTimeout
            | Self::AuthenticationTimeout
            | Self::P2PGroupJoinTimeout => ErrorCategory::Timeout,

            Self::RpcNotImplemented | Self::UserCallbackException => ErrorCategory::Application,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|ty| *ty as u8 == value)
    }
}
