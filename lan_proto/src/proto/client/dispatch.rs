//! Traffic of the server link after admission, the client's side of the group protocol and
//! the routing of outbound messages.
use super::ClientInner;
use crate::constants::{ENGINE_RPC_ID_BASE, MAX_RELAY_TARGETS};
use crate::error::NetworkError;
use crate::proto::destination::Destination;
use crate::proto::engine_rpc::{
    P2PEngineC2SProxy, P2PEngineS2CHandler, P2PEngineS2CStub, PairwiseGrant,
};
use crate::proto::events::ErrorInfo;
use crate::proto::message::{
    split_message_type, Message, MessageReader, MessageType, ReceivedMessage,
};
use crate::proto::packet_crafter::do_disconnect::{ShutdownTcp, ShutdownTcpAck};
use crate::proto::packet_crafter::keep_alive::Pong;
use crate::proto::packet_crafter::relay::{RelayRequest, Relayed};
use crate::proto::packet_crafter::ControlPacket;
use crate::proto::rpc::{
    RpcContext, RpcError, RpcHeader, RpcResult, RpcStatus, RpcStub, StubOutcome,
};
use crate::proto::security::{SendOptions, Unsealed};
use crate::proto::task_queue::TaskSubject;
use crate::proto::transport::Link;
use bytes::Bytes;
use lan_types::errors::ErrorType;
use lan_types::proto::{EncryptMode, HostId, MessageReliability};
use std::net::SocketAddr;
use std::sync::Arc;

/// The client's side of the group protocol
struct ClientEngine(Arc<ClientInner>);

impl P2PEngineS2CHandler for ClientEngine {
    fn p2p_group_member_join(
        &self,
        _ctx: &RpcContext,
        group_id: HostId,
        member_id: HostId,
        custom_field: Bytes,
        event_id: u32,
        member_count: u32,
        grant: Option<PairwiseGrant>,
    ) -> RpcResult {
        self.0
            .peers
            .lock()
            .member_joined(group_id, member_id, &custom_field, grant);

        let ack = P2PEngineC2SProxy::p2p_group_member_join_ack(&group_id, &member_id, &event_id);
        self.0
            .server
            .send(&ack, SendOptions::SECURE)
            .map_err(|err| RpcError::Failed(err.into_string()))?;

        log::trace!(target: "lan", "{member_id} joined {group_id} ({member_count} members)");
        self.0.raise_event(move |events| {
            events.on_p2p_member_join(member_id, group_id, member_count, &custom_field)
        });
        Ok(())
    }

    fn p2p_group_member_leave(
        &self,
        _ctx: &RpcContext,
        group_id: HostId,
        member_id: HostId,
        member_count: u32,
    ) -> RpcResult {
        let dropped = self.0.peers.lock().member_left(group_id, member_id);
        for (peer_id, link) in dropped {
            if let Some(link) = link {
                log::trace!(target: "lan", "No group shared with {peer_id} anymore; closing {link:?}");
                link.close();
            }
        }

        self.0.raise_event(move |events| {
            events.on_p2p_member_leave(member_id, group_id, member_count)
        });
        Ok(())
    }

    fn request_p2p_connect(
        &self,
        _ctx: &RpcContext,
        peer_id: HostId,
        peer_addr: SocketAddr,
        signature: u64,
    ) -> RpcResult {
        self.0.connect_to_peer(peer_id, peer_addr, signature);
        Ok(())
    }

    fn p2p_group_fully_connected(&self, _ctx: &RpcContext, group_id: HostId) -> RpcResult {
        self.0
            .raise_event(move |events| events.on_p2p_group_fully_connected(group_id));
        Ok(())
    }
}

impl ClientInner {
    pub(super) fn dispatch(self: &Arc<Self>, message: Unsealed) -> Result<(), NetworkError> {
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
                    sender: HostId::SERVER,
                    relayed: false,
                    encrypt_mode,
                    compressed,
                };
                self.on_rpc(ctx, reader)
            }

            MessageType::UserMessage => {
                let message = ReceivedMessage::new(HostId::SERVER, reader, false)
                    .with_security(encrypt_mode, compressed);
                self.deliver_user_message(message);
                Ok(())
            }

            MessageType::Relayed => {
                let relayed = Relayed::validate(&mut reader)?;
                if !relayed.sender.is_assignable() {
                    return Err(NetworkError::InvalidPacket("Relayed message without a sender"));
                }
                self.deliver_inbound(relayed.sender, relayed.inner, true, encrypt_mode)
            }

            MessageType::Pong => {
                let pong = Pong::validate(&mut reader)?;
                self.on_server_pong(pong);
                Ok(())
            }

            MessageType::ShutdownTcp => {
                let packet = ShutdownTcp::validate(&mut reader)?;
                log::trace!(target: "lan", "Server is closing the connection");
                self.record_leave_reason(ErrorType::DisconnectFromRemote, packet.comment);
                let _ = self
                    .server
                    .send(&ShutdownTcpAck.craft(), SendOptions::RELIABLE);
                Ok(())
            }

            MessageType::ShutdownTcpAck => {
                let _ = ShutdownTcpAck::validate(&mut reader)?;
                self.server.close();
                Ok(())
            }

            other => {
                log::warn!(target: "lan", "Unexpected {other:?} from the server");
                Err(NetworkError::InvalidPacket("Unexpected message type"))
            }
        }
    }

    /// Engine calls are only accepted straight from the server; user calls are queued for
    /// the stubs
    pub(super) fn on_rpc(
        self: &Arc<Self>,
        ctx: RpcContext,
        mut reader: MessageReader,
    ) -> Result<(), NetworkError> {
        let header = RpcHeader::peek(&reader)?;

        if header.rpc_id >= ENGINE_RPC_ID_BASE {
            if ctx.relayed || !ctx.sender.is_server() {
                return Err(NetworkError::InvalidPacket("Engine rpc from a peer"));
            }

            let stub = P2PEngineS2CStub::new(ClientEngine(self.clone()));
            return match stub.dispatch(&ctx, &mut reader)? {
                StubOutcome::Handled => Ok(()),
                StubOutcome::Failed(_, reason) => {
                    log::warn!(target: "lan", "Engine rpc {} failed: {reason}", header.rpc_id);
                    Err(NetworkError::InternalError("Engine rpc failed"))
                }
                _ => Err(NetworkError::InvalidPacket("Unknown engine rpc")),
            };
        }

        if header.status == RpcStatus::NotImplemented {
            self.raise_warning(ErrorInfo::new(
                ErrorType::RpcNotImplemented,
                ctx.sender,
                format!("Rpc {} is not implemented by {}", header.rpc_id, ctx.sender),
            ));
            return Ok(());
        }

        let client = self.clone();
        let _ = self.tasks.push(subject_of(ctx.sender), move || {
            client.invoke_stub(ctx.with_rpc_id(header.rpc_id), header, reader)
        });
        Ok(())
    }

    /// Runs on the user pool
    fn invoke_stub(self: &Arc<Self>, ctx: RpcContext, header: RpcHeader, mut reader: MessageReader) {
        let stub = self.stubs.read().stub_for(header.rpc_id);
        let outcome = match stub {
            Some(stub) => stub.dispatch(&ctx, &mut reader),
            None => Ok(StubOutcome::NotHandled),
        };

        let events = self.events();
        match outcome {
            Ok(StubOutcome::Handled) => {}

            Ok(StubOutcome::NotImplemented(_)) | Ok(StubOutcome::NotHandled) => {
                events.on_rpc_not_implemented(header.rpc_id, ctx.sender);
                if ctx.sender != self.host_id() {
                    let reply = header.not_implemented_reply();
                    if let Err(err) = self.send_message(&[ctx.sender], &reply, SendOptions::RELIABLE) {
                        log::trace!(target: "lan", "Unable to tell {} about rpc {}: {err}", ctx.sender, header.rpc_id);
                    }
                }
            }

            Ok(StubOutcome::Failed(_, reason)) => {
                events.on_error(&ErrorInfo::new(
                    ErrorType::Unexpected,
                    ctx.sender,
                    format!("Rpc {} failed: {reason}", header.rpc_id),
                ));
            }

            Err(err) => {
                events.on_error(&ErrorInfo::from_network_error(&err, ctx.sender));
            }
        }
    }

    pub(super) fn deliver_user_message(&self, message: ReceivedMessage) {
        let events = self.events();
        let _ = self
            .tasks
            .push(subject_of(message.sender), move || {
                events.on_received_user_message(message)
            });
    }

    /// Hands an encoded message to this node as if it had arrived from `sender`
    pub(super) fn deliver_inbound(
        self: &Arc<Self>,
        sender: HostId,
        encoded: Bytes,
        relayed: bool,
        encrypt_mode: EncryptMode,
    ) -> Result<(), NetworkError> {
        let (message_type, reader) = split_message_type(encoded)?;
        match message_type {
            MessageType::Rpc => {
                let ctx = RpcContext {
                    rpc_id: 0,
                    sender,
                    relayed,
                    encrypt_mode,
                    compressed: false,
                };
                self.on_rpc(ctx, reader)
            }

            MessageType::UserMessage => {
                let message = ReceivedMessage::new(sender, reader, relayed)
                    .with_security(encrypt_mode, false);
                self.deliver_user_message(message);
                Ok(())
            }

            _ => Err(NetworkError::InvalidPacket("Only user traffic may be relayed")),
        }
    }

    /// Routes `message` to `targets`: the server link for the server, validated direct links
    /// for peers, and one relay request for every peer without a usable direct link
    pub(super) fn send_message(
        self: &Arc<Self>,
        targets: &[HostId],
        message: &Message,
        options: SendOptions,
    ) -> Result<(), NetworkError> {
        if !self.is_joined() {
            return Err(NetworkError::InvalidRequest("Not connected to a server"));
        }

        let max = self.server.max_message_length();
        if message.len() > max {
            return Err(NetworkError::MessageTooLong {
                length: message.len(),
                max,
            });
        }

        let me = self.host_id();
        let mut to_server = false;
        let mut local = false;
        let mut direct: Vec<(HostId, Link)> = Vec::new();
        let mut relay = Vec::new();
        {
            let peers = self.peers.lock();
            let (destinations, unknown) = Destination::expand(
                targets,
                |host_id| peers.classify(host_id),
                |group_id| peers.members(group_id),
            );
            if let Some(host_id) = unknown.first() {
                return Err(NetworkError::UnknownHost(*host_id));
            }

            for destination in destinations {
                match destination {
                    Destination::Local => local = true,
                    Destination::Server => to_server = true,
                    Destination::Peer(host_id) => match peers.direct_link(host_id) {
                        Some(link)
                            if options.encrypt == EncryptMode::None || link.has_crypto() =>
                        {
                            direct.push((host_id, link.clone()))
                        }
                        _ => relay.push(host_id),
                    },
                    Destination::Group(_) => {}
                }
            }
        }

        let mut result = Ok(());
        if to_server {
            result = self.server.send(message, options);
        }

        for (host_id, link) in direct {
            if let Err(err) = link.send(message, options) {
                log::trace!(target: "lan", "Direct send to {host_id} failed, relaying: {err}");
                relay.push(host_id);
            }
        }

        let inner = Bytes::copy_from_slice(message.as_bytes());
        for targets in relay.chunks(MAX_RELAY_TARGETS) {
            let request = RelayRequest {
                targets: targets.to_vec(),
                unreliable: options.reliability == MessageReliability::Unreliable,
                inner: inner.clone(),
            };
            if let Err(err) = self
                .server
                .send_relay(&request.craft(), inner.len(), options)
            {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        if local {
            self.deliver_inbound(me, inner, false, options.encrypt)?;
        }

        result
    }
}

fn subject_of(sender: HostId) -> TaskSubject {
    if sender.is_none() {
        TaskSubject::Local
    } else {
        TaskSubject::Peer(sender)
    }
}
