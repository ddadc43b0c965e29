//! Joining the server: connection hint, session key, connection request and verdict. Also
//! where the loss of the server link is turned into `on_leave_server`.
use super::{ClientInner, HandshakeStage, JoinState};
use crate::constants::INTERNAL_PROTOCOL_VERSION;
use crate::error::NetworkError;
use crate::proto::events::ErrorInfo;
use crate::proto::message::MessageType;
use crate::proto::misc::Ticket;
use crate::proto::packet_crafter::do_connect::{
    ConnectDenied, ConnectSuccess, ConnectionHint, EncryptedSessionKey, RequestServerConnection,
    SessionKeySuccess,
};
use crate::proto::packet_crafter::do_disconnect::ShutdownTcpAck;
use crate::proto::packet_crafter::ControlPacket;
use crate::proto::security::{SendOptions, Unsealed};
use crate::proto::settings::MAX_CONFIGURABLE_MESSAGE_LENGTH;
use crate::proto::transport::{Link, LinkHandler};
use bytes::Bytes;
use lan_crypt::key_exchange::wrap_session_key;
use lan_crypt::session_crypto::{Role, SessionCrypto};
use lan_crypt::session_key::SessionKey;
use lan_types::errors::ErrorType;
use lan_types::proto::{EncryptMode, HostId};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Feeds the traffic of the server link into the client
pub(super) struct ServerLinkHandler {
    client: Weak<ClientInner>,
}

impl ServerLinkHandler {
    pub fn new(client: Weak<ClientInner>) -> Self {
        Self { client }
    }
}

impl LinkHandler for ServerLinkHandler {
    fn on_message(&self, _link: &Link, message: Unsealed) -> Result<(), NetworkError> {
        let client = self.client.upgrade().ok_or(NetworkError::ProperShutdown)?;
        let stage = client.session.lock().stage;
        match stage {
            HandshakeStage::Joined => client.dispatch(message),
            HandshakeStage::Left => Err(NetworkError::ProperShutdown),
            stage => client.process_handshake(stage, message),
        }
    }

    fn on_closed(&self, _link: &Link, reason: NetworkError) {
        if let Some(client) = self.client.upgrade() {
            client.on_server_link_closed(reason);
        }
    }
}

impl ClientInner {
    fn process_handshake(
        self: &Arc<Self>,
        stage: HandshakeStage,
        message: Unsealed,
    ) -> Result<(), NetworkError> {
        let Unsealed {
            message_type,
            mut reader,
            encrypt_mode,
            ..
        } = message;

        match (stage, message_type) {
            (HandshakeStage::AwaitingHint, MessageType::ConnectionHint) => {
                let hint = ConnectionHint::validate(&mut reader)?;
                if hint.internal_version != INTERNAL_PROTOCOL_VERSION {
                    log::warn!(target: "lan", "Server speaks internal protocol {}, expected {INTERNAL_PROTOCOL_VERSION}", hint.internal_version);
                    self.fail_join(ErrorType::ProtocolVersionMismatch, Bytes::new());
                    return Err(NetworkError::ProtocolVersionMismatch);
                }

                let max = usize::try_from(hint.max_message_length).unwrap_or(usize::MAX);
                if max == 0 || max > MAX_CONFIGURABLE_MESSAGE_LENGTH {
                    return Err(NetworkError::InvalidPacket(
                        "Announced message length is out of range",
                    ));
                }
                self.server.set_max_message_length(max);

                let key = SessionKey::generate(hint.strong_key_length, hint.weak_key_length);
                let wrapped = wrap_session_key(&hint.public_key, &key)?;
                // the key travels in the clear (wrapped); everything after it is sealed
                self.server.send(
                    &EncryptedSessionKey {
                        wrapped: Bytes::from(wrapped),
                    }
                    .craft(),
                    SendOptions::RELIABLE,
                )?;
                self.server
                    .install_crypto(SessionCrypto::new(&key, Role::Initiator)?);

                let mut session = self.session.lock();
                session.idle_timeout = Duration::from_millis(hint.idle_timeout_ms);
                session.stage = HandshakeStage::AwaitingKeyAck;
                Ok(())
            }

            (HandshakeStage::AwaitingKeyAck, MessageType::SessionKeySuccess) => {
                let _ = SessionKeySuccess::validate(&mut reader)?;
                let request = RequestServerConnection {
                    protocol_version: self.settings.protocol_version,
                    user_data: Bytes::from(self.settings.user_data.clone()),
                    p2p_port: self.p2p_addr.map(|addr| addr.port()).unwrap_or(0),
                };
                self.server.send(&request.craft(), SendOptions::SECURE)?;
                self.session.lock().stage = HandshakeStage::AwaitingVerdict;
                Ok(())
            }

            (HandshakeStage::AwaitingVerdict, MessageType::ConnectSuccess) => {
                if encrypt_mode != EncryptMode::Secure {
                    return Err(NetworkError::InvalidPacket(
                        "Admission must be sealed with the session key",
                    ));
                }

                let success = ConnectSuccess::validate(&mut reader)?;
                if !success.host_id.is_assignable() {
                    return Err(NetworkError::UnknownHost(success.host_id));
                }

                {
                    let mut session = self.session.lock();
                    session.stage = HandshakeStage::Joined;
                    session.host_id = success.host_id;
                    session.ticket = Ticket::from(success.ticket);
                    session.external_addr = Some(success.external_addr);
                }
                self.peers.lock().set_me(success.host_id);

                let info = ErrorInfo::new(ErrorType::Ok, HostId::SERVER, "Joined the server");
                let reply = success.reply;
                self.raise_event(move |events| events.on_join_server_complete(&info, &reply));
                let _ = self.join.send_replace(JoinState::Joined);
                Ok(())
            }

            (HandshakeStage::AwaitingVerdict, MessageType::ConnectDenied) => {
                let denied = ConnectDenied::validate(&mut reader)?;
                self.fail_join(ErrorType::NotifyServerDeniedConnection, denied.reply.clone());
                Err(NetworkError::ConnectFailed {
                    reason: ErrorType::NotifyServerDeniedConnection,
                    reply: denied.reply,
                })
            }

            (_, MessageType::ProtocolVersionMismatch) => {
                self.fail_join(ErrorType::ProtocolVersionMismatch, Bytes::new());
                Err(NetworkError::ProtocolVersionMismatch)
            }

            (_, MessageType::ShutdownTcp) => {
                let _ = self
                    .server
                    .send(&ShutdownTcpAck.craft(), SendOptions::RELIABLE);
                self.fail_join(ErrorType::DisconnectFromRemote, Bytes::new());
                Err(NetworkError::ProperShutdown)
            }

            (stage, message_type) => {
                log::warn!(target: "lan", "Unexpected {message_type:?} from the server while {stage:?}");
                Err(NetworkError::InvalidPacket("Unexpected message during handshake"))
            }
        }
    }

    /// Runs once, after the reader of the server link stopped
    pub(super) fn on_server_link_closed(self: &Arc<Self>, reason: NetworkError) {
        let cause = reason.error_type();
        let (was_joined, ticket, leave) = {
            let mut session = self.session.lock();
            let was_joined = session.stage == HandshakeStage::Joined;
            session.stage = HandshakeStage::Left;
            let leave = session.leave_reason.take();
            (was_joined, session.ticket, leave)
        };

        self.fail_join(cause, Bytes::new());
        self.shutdown.cancel();
        let direct_links = self.peers.lock().clear();
        for link in direct_links {
            link.close();
        }

        if !was_joined || !self.tracker.try_c2s_disconnect(ticket) {
            return;
        }

        let (error_type, comment) = leave.unwrap_or((cause, Bytes::new()));
        log::info!(target: "lan", "Left the server ({error_type})");
        let mut info = ErrorInfo::new(
            error_type,
            HostId::SERVER,
            String::from_utf8_lossy(&comment),
        );
        if error_type != cause {
            info = info.with_detail(cause);
        }
        self.raise_event(move |events| events.on_leave_server(&info));
    }
}
