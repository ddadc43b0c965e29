use bytes::Bytes;
use lan_crypt::misc::CryptError;
use lan_io::tokio::sync::mpsc::error::SendError;
use lan_types::errors::ErrorType;
use lan_types::proto::HostId;
use std::error::Error;
use std::fmt::Formatter;
use std::fmt::{Debug, Display};

/// The basic error type for this crate
pub enum NetworkError {
    /// Thrown when the underlying socket fails
    SocketError(String),
    /// A peer did not respond in time
    Timeout(HostId),
    /// A frame or message that cannot be parsed
    InvalidPacket(&'static str),
    /// A message longer than the configured maximum was either produced or announced
    MessageTooLong { length: usize, max: usize },
    /// The inbound byte stream can no longer be trusted
    StreamInconsistent(&'static str),
    /// A bad external request
    InvalidRequest(&'static str),
    InternalError(&'static str),
    /// The session layer rejected a frame
    Crypt(ErrorType, String),
    /// No live client or group has this id
    UnknownHost(HostId),
    ProtocolVersionMismatch,
    /// Joining the server failed. `reply` is the payload of the server's verdict, if any
    ConnectFailed { reason: ErrorType, reply: Bytes },
    /// For a converted error
    Generic(String),
    ProperShutdown,
}

impl Error for NetworkError {}

impl Debug for NetworkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_msg())
    }
}

impl NetworkError {
    fn to_msg(&self) -> String {
        match self {
            NetworkError::SocketError(err) => err.to_string(),
            NetworkError::Generic(err) => err.to_string(),
            NetworkError::Timeout(host) => format!("Timeout waiting on {host}"),
            NetworkError::InternalError(err) => (*err).to_string(),
            NetworkError::MessageTooLong { length, max } => {
                format!("Message length {length} exceeds the maximum of {max}")
            }
            NetworkError::StreamInconsistent(err) => format!("Stream inconsistent: {err}"),
            NetworkError::InvalidRequest(err) => (*err).to_string(),
            NetworkError::InvalidPacket(err) => (*err).to_string(),
            NetworkError::Crypt(_, err) => err.to_string(),
            NetworkError::UnknownHost(host) => format!("Unknown host {host}"),
            NetworkError::ProtocolVersionMismatch => "Protocol version mismatch".to_string(),
            NetworkError::ConnectFailed { reason, .. } => {
                format!("Unable to join the server: {reason}")
            }
            NetworkError::ProperShutdown => "Proper shutdown called".to_string(),
        }
    }

    pub fn into_string(self) -> String {
        match self {
            NetworkError::SocketError(err) | NetworkError::Generic(err) => err,
            NetworkError::Crypt(_, err) => err,
            other => other.to_msg(),
        }
    }

    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Generic(msg.into())
    }

    /// The reason code reported when this error tears a connection down
    pub fn error_type(&self) -> ErrorType {
        match self {
            NetworkError::SocketError(_) => ErrorType::DisconnectFromRemote,
            NetworkError::Timeout(_) => ErrorType::ConnectionTimeout,
            NetworkError::InvalidPacket(_) => ErrorType::InvalidPacketFormat,
            NetworkError::MessageTooLong { .. } => ErrorType::MessageTooLong,
            NetworkError::StreamInconsistent(_) => ErrorType::StreamInconsistent,
            NetworkError::Crypt(ty, _) => *ty,
            NetworkError::UnknownHost(_) => ErrorType::InvalidHostId,
            NetworkError::ProtocolVersionMismatch => ErrorType::ProtocolVersionMismatch,
            NetworkError::ConnectFailed { reason, .. } => *reason,
            NetworkError::ProperShutdown => ErrorType::DisconnectFromLocal,
            NetworkError::InvalidRequest(_)
            | NetworkError::InternalError(_)
            | NetworkError::Generic(_) => ErrorType::Unexpected,
        }
    }
}

impl Display for NetworkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        <Self as Debug>::fmt(self, f)
    }
}

impl<T> From<SendError<T>> for NetworkError {
    fn from(err: SendError<T>) -> Self {
        NetworkError::Generic(err.to_string())
    }
}

impl From<anyhow::Error> for NetworkError {
    fn from(err: anyhow::Error) -> Self {
        NetworkError::Generic(err.to_string())
    }
}

impl From<CryptError> for NetworkError {
    fn from(err: CryptError) -> Self {
        let ty = match &err {
            CryptError::CounterMismatch { .. } => ErrorType::CryptoCounterMismatch,
            CryptError::Encrypt(_) => ErrorType::EncryptFail,
            CryptError::KeyExchange(_) | CryptError::BadKeyLength(_) => {
                ErrorType::InvalidSessionKey
            }
            CryptError::Decrypt(_) | CryptError::BadEncryptMode => ErrorType::DecryptFail,
        };
        Self::Crypt(ty, err.into_string())
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        NetworkError::SocketError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_failures_keep_their_reason_code() {
        let err: NetworkError = CryptError::CounterMismatch {
            expected: 4,
            received: 9,
        }
        .into();
        assert_eq!(err.error_type(), ErrorType::CryptoCounterMismatch);
        assert!(err.to_string().contains("Expected 4"));
    }

    #[test]
    fn oversize_message_reports_both_lengths() {
        let err = NetworkError::MessageTooLong {
            length: 11,
            max: 10,
        };
        assert_eq!(err.error_type(), ErrorType::MessageTooLong);
        assert_eq!(
            err.into_string(),
            "Message length 11 exceeds the maximum of 10"
        );
    }
}
