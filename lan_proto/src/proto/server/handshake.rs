//! Admission of new connections: connection hint, session key, connection request and the
//! application's verdict.
use super::ServerInner;
use crate::constants::INTERNAL_PROTOCOL_VERSION;
use crate::error::NetworkError;
use crate::proto::events::ConnectionVerdict;
use crate::proto::message::MessageType;
use crate::proto::packet_crafter::do_connect::{
    ConnectDenied, ConnectSuccess, ConnectionHint, EncryptedSessionKey, ProtocolVersionMismatch,
    RequestServerConnection, SessionKeySuccess,
};
use crate::proto::packet_crafter::do_disconnect::{ShutdownTcp, ShutdownTcpAck};
use crate::proto::packet_crafter::ControlPacket;
use crate::proto::peer::{HandshakeStage, PeerState, RemoteClient};
use crate::proto::security::{SendOptions, Unsealed};
use crate::proto::task_queue::TaskSubject;
use crate::proto::transport::{Link, LinkHandler};
use bytes::Bytes;
use lan_crypt::session_crypto::{Role, SessionCrypto};
use lan_io::tokio::net::TcpStream;
use lan_io::tokio::time::Instant;
use lan_types::errors::ErrorType;
use lan_types::proto::EncryptMode;
use std::sync::{Arc, Weak};

/// Feeds the traffic of one server-side link into the node
pub(super) struct ServerLinkHandler {
    server: Weak<ServerInner>,
    client: Arc<RemoteClient>,
}

impl LinkHandler for ServerLinkHandler {
    fn on_message(&self, _link: &Link, message: Unsealed) -> Result<(), NetworkError> {
        let server = self.server.upgrade().ok_or(NetworkError::ProperShutdown)?;
        if self.client.stage() == HandshakeStage::Done {
            server.dispatch(&self.client, message)
        } else {
            server.process_handshake(&self.client, message)
        }
    }

    fn on_closed(&self, _link: &Link, reason: NetworkError) {
        if let Some(server) = self.server.upgrade() {
            let _ = server.dispose_client(
                &self.client,
                reason.error_type(),
                ErrorType::Ok,
                Bytes::new(),
            );
        }
    }
}

impl ServerInner {
    pub(super) fn on_new_connection(self: &Arc<Self>, stream: TcpStream) -> Result<(), NetworkError> {
        if self.shutdown.is_cancelled() {
            return Err(NetworkError::InvalidRequest("Server is shutting down"));
        }

        let (link, io) = Link::new(
            stream,
            self.settings.max_message_length,
            self.settings.enable_nagle,
        )?;
        let client = Arc::new(RemoteClient::new(link.clone(), Instant::now()));
        self.registry.lock().add_candidate(client.clone());

        let handler = ServerLinkHandler {
            server: Arc::downgrade(self),
            client,
        };
        link.start(io, Arc::new(handler), self.net_pool.handle());

        let hint = ConnectionHint {
            internal_version: INTERNAL_PROTOCOL_VERSION,
            public_key: self.key_exchange.public_key(),
            strong_key_length: self.settings.strong_key_length,
            weak_key_length: self.settings.weak_key_length,
            idle_timeout_ms: self.settings.default_timeout.as_millis() as u64,
            max_message_length: self.settings.max_message_length as u64,
        };
        link.send(&hint.craft(), SendOptions::RELIABLE)
    }

    /// Advances the handshake of a candidate. Anything out of order is a protocol error
    pub(super) fn process_handshake(
        self: &Arc<Self>,
        client: &Arc<RemoteClient>,
        message: Unsealed,
    ) -> Result<(), NetworkError> {
        let Unsealed {
            message_type,
            mut reader,
            encrypt_mode,
            ..
        } = message;

        match (client.stage(), message_type) {
            (HandshakeStage::AwaitingSessionKey, MessageType::EncryptedSessionKey) => {
                let packet = EncryptedSessionKey::validate(&mut reader)?;
                let key = self.key_exchange.unwrap_session_key(&packet.wrapped)?;
                if key.strong_key_length() != self.settings.strong_key_length
                    || key.weak_key_length() != self.settings.weak_key_length
                {
                    return Err(NetworkError::Crypt(
                        ErrorType::InvalidSessionKey,
                        "Session key does not match the announced lengths".to_string(),
                    ));
                }

                client
                    .link()
                    .install_crypto(SessionCrypto::new(&key, Role::Acceptor)?);
                client.set_stage(HandshakeStage::AwaitingConnectionRequest);
                log::trace!(target: "lan", "Session key installed on {:?}", client.link());
                client
                    .link()
                    .send(&SessionKeySuccess.craft(), SendOptions::RELIABLE)
            }

            (HandshakeStage::AwaitingConnectionRequest, MessageType::RequestServerConnection) => {
                if encrypt_mode != EncryptMode::Secure {
                    return Err(NetworkError::InvalidRequest(
                        "Connection request must be sealed with the session key",
                    ));
                }

                let request = RequestServerConnection::validate(&mut reader)?;
                if request.protocol_version != self.settings.protocol_version {
                    log::warn!(target: "lan", "Rejecting {:?}: protocol version {} differs from {}", client.link(), request.protocol_version, self.settings.protocol_version);
                    let _ = client
                        .link()
                        .send(&ProtocolVersionMismatch.craft(), SendOptions::RELIABLE);
                    let _ = self.dispose_client(
                        client,
                        ErrorType::ProtocolVersionMismatch,
                        ErrorType::Ok,
                        Bytes::new(),
                    );
                    return Ok(());
                }

                client.set_connection_request(request.user_data.clone(), request.p2p_port);
                client.set_stage(HandshakeStage::AwaitingApproval);

                let server = self.clone();
                let candidate = client.clone();
                if !self.tasks.push(client.subject(), move || {
                    server.approve(&candidate, request.user_data)
                }) {
                    return Err(NetworkError::ProperShutdown);
                }
                Ok(())
            }

            (_, MessageType::ShutdownTcp) => {
                let packet = ShutdownTcp::validate(&mut reader)?;
                let _ = client
                    .link()
                    .send(&ShutdownTcpAck.craft(), SendOptions::RELIABLE);
                let _ = self.dispose_client(
                    client,
                    ErrorType::DisconnectFromRemote,
                    ErrorType::Ok,
                    packet.comment,
                );
                Ok(())
            }

            (stage, message_type) => {
                log::warn!(target: "lan", "Unexpected {message_type:?} from {:?} while {stage:?}", client.link());
                Err(NetworkError::InvalidPacket("Unexpected message during handshake"))
            }
        }
    }

    /// Runs on the user pool: asks the application and admits or turns away the candidate
    fn approve(self: &Arc<Self>, client: &Arc<RemoteClient>, user_data: Bytes) {
        if client.state() != PeerState::Candidate {
            return;
        }

        let verdict = self
            .events()
            .on_connection_request(client.link().remote_addr(), &user_data);

        match verdict {
            ConnectionVerdict::Accept(reply) => {
                let admitted = self
                    .registry
                    .lock()
                    .authenticate(client.link().id(), Instant::now());
                let host_id = match admitted {
                    Ok(host_id) => host_id,
                    Err(err) => {
                        log::warn!(target: "lan", "Unable to admit {:?}: {err}", client.link());
                        let _ = self.dispose_client(
                            client,
                            err.error_type(),
                            ErrorType::Ok,
                            Bytes::new(),
                        );
                        return;
                    }
                };

                // queued before the client can learn its id, so it precedes all of its traffic
                let events = self.events();
                let info = client.info(Vec::new());
                let _ = self.tasks.push(TaskSubject::Peer(host_id), move || {
                    events.on_client_join(&info)
                });

                let success = ConnectSuccess {
                    host_id,
                    ticket: client.ticket().0,
                    reply,
                    external_addr: client.link().remote_addr(),
                };
                log::trace!(target: "lan", "Admitted {:?} as {host_id}", client.link());
                if let Err(err) = client.link().send(&success.craft(), SendOptions::SECURE) {
                    log::trace!(target: "lan", "Unable to confirm admission of {host_id}: {err}");
                    let _ = self.dispose_client(
                        client,
                        err.error_type(),
                        ErrorType::Ok,
                        Bytes::new(),
                    );
                }
            }

            ConnectionVerdict::Reject(reply) => {
                log::trace!(target: "lan", "Application rejected {:?}", client.link());
                let _ = client
                    .link()
                    .send(&ConnectDenied { reply }.craft(), SendOptions::SECURE);
                let _ = self.dispose_client(
                    client,
                    ErrorType::NotifyServerDeniedConnection,
                    ErrorType::Ok,
                    Bytes::new(),
                );
            }
        }
    }
}
