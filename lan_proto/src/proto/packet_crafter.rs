//! Layouts of the engine's control messages.
//!
//! Each packet is a [`ControlPacket`]: its fields follow the type byte in declaration order,
//! encoded with [`Marshal`]. Crafting and validation always go through the same impl, so both
//! ends agree on the layout by construction.
use crate::error::NetworkError;
use crate::proto::message::{Marshal, Message, MessageReader, MessageType};

pub trait ControlPacket: Marshal {
    const TYPE: MessageType;

    fn craft(&self) -> Message {
        let mut message = Message::new(Self::TYPE);
        message.write(self);
        message
    }

    /// Reads the packet at the cursor. The type byte must already be consumed
    fn validate(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        let packet = Self::unmarshal(reader)?;
        if reader.remaining() != 0 {
            return Err(NetworkError::InvalidPacket("Trailing bytes after control packet"));
        }
        Ok(packet)
    }
}

macro_rules! control_packet {
    ($packet:ident, $ty:expr, { $($field:ident),* }) => {
        impl Marshal for $packet {
            #[allow(unused_variables)]
            fn marshal(&self, msg: &mut Message) {
                $( msg.write(&self.$field); )*
            }

            #[allow(unused_variables)]
            fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
                Ok(Self { $( $field: reader.read()?, )* })
            }
        }

        impl ControlPacket for $packet {
            const TYPE: MessageType = $ty;
        }
    };
}

pub(crate) mod do_connect {
    use super::ControlPacket;
    use crate::error::NetworkError;
    use crate::proto::message::{Marshal, Message, MessageReader, MessageType};
    use bytes::Bytes;
    use lan_types::crypto::{StrongKeyLength, WeakKeyLength, X25519_PUBLIC_KEY_LENGTH};
    use lan_types::proto::{HostId, ProtocolVersion};
    use std::net::SocketAddr;

    /// First message on a new connection, sent by the server
    #[derive(Clone, Debug, PartialEq)]
    pub struct ConnectionHint {
        pub internal_version: u32,
        pub public_key: [u8; X25519_PUBLIC_KEY_LENGTH],
        pub strong_key_length: StrongKeyLength,
        pub weak_key_length: WeakKeyLength,
        /// The server disposes clients idle for longer than this
        pub idle_timeout_ms: u64,
        pub max_message_length: u64,
    }

    impl Marshal for ConnectionHint {
        fn marshal(&self, msg: &mut Message) {
            msg.write(&self.internal_version)
                .write_raw(&self.public_key)
                .write(&(self.strong_key_length as u8))
                .write(&(self.weak_key_length as u8))
                .write(&self.idle_timeout_ms)
                .write(&self.max_message_length);
        }

        fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
            let internal_version = reader.read()?;
            let mut public_key = [0u8; X25519_PUBLIC_KEY_LENGTH];
            public_key.copy_from_slice(&reader.read_exact(X25519_PUBLIC_KEY_LENGTH)?);
            let strong_key_length = StrongKeyLength::from_u8(reader.read()?)
                .ok_or(NetworkError::InvalidPacket("Unknown strong key length"))?;
            let weak_key_length = WeakKeyLength::from_u8(reader.read()?)
                .ok_or(NetworkError::InvalidPacket("Unknown weak key length"))?;
            Ok(Self {
                internal_version,
                public_key,
                strong_key_length,
                weak_key_length,
                idle_timeout_ms: reader.read()?,
                max_message_length: reader.read()?,
            })
        }
    }

    impl ControlPacket for ConnectionHint {
        const TYPE: MessageType = MessageType::ConnectionHint;
    }

    /// The client's session key, wrapped for the server's public key
    #[derive(Clone, Debug, PartialEq)]
    pub struct EncryptedSessionKey {
        pub wrapped: Bytes,
    }

    control_packet!(EncryptedSessionKey, MessageType::EncryptedSessionKey, { wrapped });

    #[derive(Clone, Debug, PartialEq)]
    pub struct SessionKeySuccess;

    control_packet!(SessionKeySuccess, MessageType::SessionKeySuccess, {});

    /// Must arrive sealed with the session key
    #[derive(Clone, Debug, PartialEq)]
    pub struct RequestServerConnection {
        pub protocol_version: ProtocolVersion,
        pub user_data: Bytes,
        /// Port of the client's direct-link listener, 0 when it accepts none
        pub p2p_port: u16,
    }

    control_packet!(
        RequestServerConnection,
        MessageType::RequestServerConnection,
        { protocol_version, user_data, p2p_port }
    );

    #[derive(Clone, Debug, PartialEq)]
    pub struct ConnectSuccess {
        pub host_id: HostId,
        pub ticket: u128,
        pub reply: Bytes,
        /// The client's address as the server sees it
        pub external_addr: SocketAddr,
    }

    control_packet!(ConnectSuccess, MessageType::ConnectSuccess, {
        host_id,
        ticket,
        reply,
        external_addr
    });

    #[derive(Clone, Debug, PartialEq)]
    pub struct ConnectDenied {
        pub reply: Bytes,
    }

    control_packet!(ConnectDenied, MessageType::ConnectDenied, { reply });

    #[derive(Clone, Debug, PartialEq)]
    pub struct ProtocolVersionMismatch;

    control_packet!(ProtocolVersionMismatch, MessageType::ProtocolVersionMismatch, {});
}

pub(crate) mod keep_alive {
    use super::ControlPacket;
    use crate::error::NetworkError;
    use crate::proto::message::{Marshal, Message, MessageReader, MessageType};

    #[derive(Copy, Clone, Debug, PartialEq)]
    pub struct Ping {
        /// Microseconds on the sender's clock
        pub sent_at_us: u64,
        /// The sender's latest latency estimate in microseconds, 0 when unknown
        pub recent_ping_us: u64,
    }

    control_packet!(Ping, MessageType::Ping, { sent_at_us, recent_ping_us });

    #[derive(Copy, Clone, Debug, PartialEq)]
    pub struct Pong {
        /// Echo of [`Ping::sent_at_us`]
        pub sent_at_us: u64,
        /// Milliseconds on the responder's clock
        pub responder_time_ms: u64,
    }

    control_packet!(Pong, MessageType::Pong, { sent_at_us, responder_time_ms });
}

pub(crate) mod do_disconnect {
    use super::ControlPacket;
    use crate::error::NetworkError;
    use crate::proto::message::{Marshal, Message, MessageReader, MessageType};
    use bytes::Bytes;

    #[derive(Clone, Debug, PartialEq)]
    pub struct ShutdownTcp {
        pub comment: Bytes,
    }

    control_packet!(ShutdownTcp, MessageType::ShutdownTcp, { comment });

    #[derive(Clone, Debug, PartialEq)]
    pub struct ShutdownTcpAck;

    control_packet!(ShutdownTcpAck, MessageType::ShutdownTcpAck, {});
}

pub(crate) mod relay {
    use super::ControlPacket;
    use crate::error::NetworkError;
    use crate::proto::message::{Marshal, Message, MessageReader, MessageType};
    use bytes::Bytes;
    use lan_types::proto::HostId;

    /// Asks the server to forward `inner` (a complete encoded message) to `targets`
    #[derive(Clone, Debug, PartialEq)]
    pub struct RelayRequest {
        pub targets: Vec<HostId>,
        pub unreliable: bool,
        pub inner: Bytes,
    }

    control_packet!(RelayRequest, MessageType::RelayRequest, {
        targets,
        unreliable,
        inner
    });

    #[derive(Clone, Debug, PartialEq)]
    pub struct Relayed {
        pub sender: HostId,
        pub inner: Bytes,
    }

    control_packet!(Relayed, MessageType::Relayed, { sender, inner });
}

pub(crate) mod peer_handshake {
    use super::ControlPacket;
    use crate::error::NetworkError;
    use crate::proto::message::{Marshal, Message, MessageReader, MessageType};
    use lan_types::proto::HostId;

    /// First message on a direct link, sent by the initiator
    #[derive(Copy, Clone, Debug, PartialEq)]
    pub struct PeerHandshake {
        pub from: HostId,
        pub to: HostId,
        pub signature: u64,
    }

    control_packet!(PeerHandshake, MessageType::PeerHandshake, { from, to, signature });

    #[derive(Copy, Clone, Debug, PartialEq)]
    pub struct PeerHandshakeAck {
        pub from: HostId,
    }

    control_packet!(PeerHandshakeAck, MessageType::PeerHandshakeAck, { from });
}

#[cfg(test)]
mod tests {
    use super::do_connect::{ConnectionHint, SessionKeySuccess};
    use super::relay::RelayRequest;
    use super::*;
    use crate::proto::message::split_message_type;
    use bytes::Bytes;
    use lan_types::crypto::{StrongKeyLength, WeakKeyLength};
    use lan_types::proto::HostId;

    fn reopen<P: ControlPacket>(packet: &P) -> Result<P, NetworkError> {
        let (ty, mut reader) = split_message_type(packet.craft().freeze())?;
        assert_eq!(ty, P::TYPE);
        P::validate(&mut reader)
    }

    #[test]
    fn connection_hint_keeps_the_key_lengths() {
        let hint = ConnectionHint {
            internal_version: 4,
            public_key: [9; 32],
            strong_key_length: StrongKeyLength::Aes128,
            weak_key_length: WeakKeyLength::Bits256,
            idle_timeout_ms: 60_000,
            max_message_length: 1 << 20,
        };
        assert_eq!(reopen(&hint).unwrap(), hint);
    }

    #[test]
    fn empty_packets_carry_only_their_type() {
        assert_eq!(SessionKeySuccess.craft().len(), 1);
        let relay = RelayRequest {
            targets: vec![HostId(3), HostId(9)],
            unreliable: true,
            inner: Bytes::from_static(b"\x02hi"),
        };
        assert_eq!(reopen(&relay).unwrap(), relay);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut message = SessionKeySuccess.craft();
        message.write(&1u8);
        let (_, mut reader) = split_message_type(message.freeze()).unwrap();
        assert!(SessionKeySuccess::validate(&mut reader).is_err());
    }
}
