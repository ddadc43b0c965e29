//! Direct links between group members.
//!
//! The server decides who connects: of every pair, the member with the larger host id opens
//! the connection and presents the pair's signature in a [`PeerHandshake`]. The other side
//! checks it against the grant it received with the member-join notification, installs the
//! pairwise key and acknowledges. A link that does not complete this within
//! [`P2P_HANDSHAKE_TIMEOUT`] is dropped, and so is any second link for a pair that already has
//! one, so a pair converges on a single link.
use super::ClientInner;
use crate::constants::P2P_HANDSHAKE_TIMEOUT;
use crate::error::NetworkError;
use crate::proto::engine_rpc::{P2PEngineC2SProxy, PairwiseGrant};
use crate::proto::events::ErrorInfo;
use crate::proto::message::{MessageType, ReceivedMessage};
use crate::proto::packet_crafter::keep_alive::{Ping, Pong};
use crate::proto::packet_crafter::peer_handshake::{PeerHandshake, PeerHandshakeAck};
use crate::proto::packet_crafter::ControlPacket;
use crate::proto::rpc::RpcContext;
use crate::proto::security::{SendOptions, Unsealed};
use crate::proto::transport::{Link, LinkHandler};
use lan_crypt::session_crypto::{Role, SessionCrypto};
use lan_crypt::session_key::SessionKey;
use lan_io::tokio::net::{TcpListener, TcpStream};
use lan_types::errors::ErrorType;
use lan_types::proto::HostId;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

/// Feeds the traffic of one direct link into the client
pub(super) struct PeerLinkHandler {
    client: Weak<ClientInner>,
    /// The peer this node dialed; `None` on the accepting side
    expected: Option<HostId>,
    /// Set once the peer handshake completed
    validated: OnceLock<HostId>,
}

impl PeerLinkHandler {
    fn acceptor(client: Weak<ClientInner>) -> Self {
        Self {
            client,
            expected: None,
            validated: OnceLock::new(),
        }
    }

    fn initiator(client: Weak<ClientInner>, peer_id: HostId) -> Self {
        Self {
            client,
            expected: Some(peer_id),
            validated: OnceLock::new(),
        }
    }

    fn is_validated(&self) -> bool {
        self.validated.get().is_some()
    }
}

impl LinkHandler for PeerLinkHandler {
    fn on_message(&self, link: &Link, message: Unsealed) -> Result<(), NetworkError> {
        let client = self.client.upgrade().ok_or(NetworkError::ProperShutdown)?;
        if let Some(peer_id) = self.validated.get() {
            return client.dispatch_peer(*peer_id, link, message);
        }

        let Unsealed {
            message_type,
            mut reader,
            ..
        } = message;
        match (self.expected, message_type) {
            (None, MessageType::PeerHandshake) => {
                let packet = PeerHandshake::validate(&mut reader)?;
                let peer_id = client.accept_peer(link, packet)?;
                let _ = self.validated.set(peer_id);
                Ok(())
            }

            (Some(peer_id), MessageType::PeerHandshakeAck) => {
                let ack = PeerHandshakeAck::validate(&mut reader)?;
                if ack.from != peer_id {
                    return Err(NetworkError::InvalidRequest(
                        "Peer handshake acknowledged by another host",
                    ));
                }
                client.establish_direct(peer_id, link)?;
                let _ = self.validated.set(peer_id);
                Ok(())
            }

            (_, message_type) => {
                log::warn!(target: "lan", "Unexpected {message_type:?} on {link:?} before the peer handshake");
                Err(NetworkError::InvalidPacket("Unexpected message before the peer handshake"))
            }
        }
    }

    fn on_closed(&self, link: &Link, reason: NetworkError) {
        let Some(client) = self.client.upgrade() else {
            return;
        };

        match (self.validated.get(), self.expected) {
            (Some(peer_id), _) => client.on_direct_link_lost(*peer_id, link, reason.error_type()),
            (None, Some(peer_id)) => {
                log::trace!(target: "lan", "Direct link to {peer_id} failed before its handshake: {reason}");
                client.peers.lock().end_connect(peer_id);
            }
            (None, None) => {
                log::trace!(target: "lan", "Unvalidated direct link {link:?} closed: {reason}")
            }
        }
    }
}

/// Checks an inbound peer handshake. `grant` is what the server handed out for the pair;
/// `has_direct` tells whether the pair already has a validated link
pub(super) fn check_peer_handshake(
    me: HostId,
    packet: &PeerHandshake,
    grant: Option<&PairwiseGrant>,
    has_direct: bool,
) -> Result<(), NetworkError> {
    if me.is_none() || packet.to != me {
        return Err(NetworkError::InvalidRequest(
            "Peer handshake addressed to another host",
        ));
    }

    if packet.from <= me {
        return Err(NetworkError::InvalidRequest(
            "Only the member with the larger host id opens a direct link",
        ));
    }

    let grant = grant.ok_or(NetworkError::UnknownHost(packet.from))?;
    if grant.signature != packet.signature {
        return Err(NetworkError::InvalidRequest("Peer handshake signature mismatch"));
    }

    if has_direct {
        return Err(NetworkError::InvalidRequest(
            "A direct link to this peer already exists",
        ));
    }

    Ok(())
}

/// The session layer of a direct link, or `None` when the server hands out no pairwise keys
fn pairwise_crypto(grant: &PairwiseGrant, role: Role) -> Result<Option<SessionCrypto>, NetworkError> {
    if !grant.has_keys() {
        return Ok(None);
    }

    let key = SessionKey::from_parts(&grant.strong_key, &grant.weak_key)?;
    Ok(Some(SessionCrypto::new(&key, role)?))
}

impl ClientInner {
    pub(super) async fn p2p_listener_loop(this: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = lan_io::tokio::select! {
                biased;
                _ = this.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    log::trace!(target: "lan", "Direct connection from {peer_addr}");
                    if let Err(err) = this.on_direct_connection(stream) {
                        log::warn!(target: "lan", "Dropping direct connection from {peer_addr}: {err}");
                    }
                }

                Err(err) => {
                    log::error!(target: "lan", "Error accepting direct connection: {err}");
                }
            }
        }

        log::trace!(target: "lan", "Direct-link listener closed");
    }

    fn on_direct_connection(self: &Arc<Self>, stream: TcpStream) -> Result<(), NetworkError> {
        if !self.is_joined() {
            return Err(NetworkError::InvalidRequest("Not connected to a server"));
        }

        let (link, io) = Link::new(
            stream,
            self.server.max_message_length(),
            self.settings.enable_nagle,
        )?;
        let handler = Arc::new(PeerLinkHandler::acceptor(Arc::downgrade(self)));
        link.start(io, handler.clone(), self.net_pool.handle());
        self.expire_unvalidated(link, handler);
        Ok(())
    }

    /// Closes `link` if its handshake has not completed in time
    fn expire_unvalidated(&self, link: Link, handler: Arc<PeerLinkHandler>) {
        self.timers.insert_oneshot(P2P_HANDSHAKE_TIMEOUT, move |_| {
            if !handler.is_validated() && !link.is_closed() {
                log::trace!(target: "lan", "Peer handshake on {link:?} timed out");
                link.close();
            }
        });
    }

    /// Acts on the server's request to open a direct link
    pub(super) fn connect_to_peer(
        self: &Arc<Self>,
        peer_id: HostId,
        peer_addr: SocketAddr,
        signature: u64,
    ) {
        if !self.settings.enable_direct_p2p || self.shutdown.is_cancelled() {
            return;
        }

        let me = self.host_id();
        if me <= peer_id {
            log::warn!(target: "lan", "Asked to dial {peer_id}, which has the larger host id");
            return;
        }

        if !self.peers.lock().begin_connect(peer_id, signature) {
            log::trace!(target: "lan", "Not dialing {peer_id}: already linked, dialing or not granted");
            return;
        }

        let this = self.clone();
        let _ = self.net_pool.spawn(async move {
            if let Err(err) = this.dial_peer(me, peer_id, peer_addr, signature).await {
                this.peers.lock().end_connect(peer_id);
                this.raise_warning(ErrorInfo::new(
                    ErrorType::P2PConnectFailure,
                    peer_id,
                    format!("Direct link to {peer_id} at {peer_addr} failed: {err}"),
                ));
            }
        });
    }

    async fn dial_peer(
        self: &Arc<Self>,
        me: HostId,
        peer_id: HostId,
        peer_addr: SocketAddr,
        signature: u64,
    ) -> Result<(), NetworkError> {
        log::trace!(target: "lan", "Dialing {peer_id} at {peer_addr}");
        let stream =
            lan_io::tokio::time::timeout(P2P_HANDSHAKE_TIMEOUT, TcpStream::connect(peer_addr))
                .await
                .map_err(|_| NetworkError::Timeout(peer_id))??;

        let grant = self
            .peers
            .lock()
            .grant(peer_id)
            .ok_or(NetworkError::UnknownHost(peer_id))?;
        let crypto = pairwise_crypto(&grant, Role::Initiator)?;

        let (link, io) = Link::new(
            stream,
            self.server.max_message_length(),
            self.settings.enable_nagle,
        )?;
        let handler = Arc::new(PeerLinkHandler::initiator(Arc::downgrade(self), peer_id));
        link.start(io, handler.clone(), self.net_pool.handle());

        let hello = PeerHandshake {
            from: me,
            to: peer_id,
            signature,
        };
        // the handshake goes out in the clear; the acceptor needs it to pick the key
        link.send(&hello.craft(), SendOptions::RELIABLE)?;
        if let Some(crypto) = crypto {
            link.install_crypto(crypto);
        }

        self.expire_unvalidated(link, handler);
        Ok(())
    }

    /// Validates an inbound handshake and answers it. Returns the peer on success
    fn accept_peer(self: &Arc<Self>, link: &Link, packet: PeerHandshake) -> Result<HostId, NetworkError> {
        let me = self.host_id();
        let grant = {
            let peers = self.peers.lock();
            let grant = peers.grant(packet.from);
            check_peer_handshake(
                me,
                &packet,
                grant.as_ref(),
                peers.direct_link(packet.from).is_some(),
            )?;
            grant.ok_or(NetworkError::UnknownHost(packet.from))?
        };

        if let Some(crypto) = pairwise_crypto(&grant, Role::Acceptor)? {
            link.install_crypto(crypto);
        }
        link.send(&PeerHandshakeAck { from: me }.craft(), SendOptions::RELIABLE)?;
        self.establish_direct(packet.from, link)?;
        Ok(packet.from)
    }

    fn establish_direct(self: &Arc<Self>, peer_id: HostId, link: &Link) -> Result<(), NetworkError> {
        let ticket = self.ticket();
        self.peers.lock().set_direct(peer_id, link.clone())?;
        self.tracker.clear_p2p(ticket, peer_id);
        log::trace!(target: "lan", "Direct link to {peer_id} established over {link:?}");

        let notice = P2PEngineC2SProxy::notify_p2p_connected(&peer_id);
        if let Err(err) = self.server.send(&notice, SendOptions::SECURE) {
            log::trace!(target: "lan", "Unable to report the link to {peer_id}: {err}");
        }

        self.raise_event(move |events| events.on_p2p_connection_established(peer_id));
        Ok(())
    }

    fn on_direct_link_lost(self: &Arc<Self>, peer_id: HostId, link: &Link, reason: ErrorType) {
        // a link dropped because the pair no longer shares a group is not a loss
        if !self.peers.lock().clear_direct(peer_id, link.id()) || self.shutdown.is_cancelled() {
            return;
        }

        let ticket = self.ticket();
        if !self.tracker.try_p2p_disconnect(ticket, peer_id) {
            return;
        }

        log::trace!(target: "lan", "Direct link to {peer_id} lost ({reason}); traffic is relayed");
        let notice = P2PEngineC2SProxy::notify_p2p_disconnected(&peer_id, &reason);
        if let Err(err) = self.server.send(&notice, SendOptions::SECURE) {
            log::trace!(target: "lan", "Unable to report the loss of {peer_id}: {err}");
        }

        self.raise_event(move |events| events.on_p2p_connection_lost(peer_id, reason));
    }

    fn dispatch_peer(
        self: &Arc<Self>,
        peer_id: HostId,
        link: &Link,
        message: Unsealed,
    ) -> Result<(), NetworkError> {
        let Unsealed {
            message_type,
            mut reader,
            encrypt_mode,
            compressed,
        } = message;

        match message_type {
            MessageType::Rpc => {
                let ctx = RpcContext {
                    rpc_id: 0,
                    sender: peer_id,
                    relayed: false,
                    encrypt_mode,
                    compressed,
                };
                self.on_rpc(ctx, reader)
            }

            MessageType::UserMessage => {
                let message = ReceivedMessage::new(peer_id, reader, false)
                    .with_security(encrypt_mode, compressed);
                self.deliver_user_message(message);
                Ok(())
            }

            MessageType::Ping => {
                let ping = Ping::validate(&mut reader)?;
                let pong = Pong {
                    sent_at_us: ping.sent_at_us,
                    responder_time_ms: self.local_time_us() / 1000,
                };
                link.send(&pong.craft(), SendOptions::UNRELIABLE)
            }

            MessageType::Pong => {
                let pong = Pong::validate(&mut reader)?;
                self.on_peer_pong(peer_id, pong);
                Ok(())
            }

            other => {
                log::warn!(target: "lan", "Unexpected {other:?} from {peer_id} on {link:?}");
                Err(NetworkError::InvalidPacket("Unexpected message type on a direct link"))
            }
        }
    }
}
