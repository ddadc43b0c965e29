//! Traffic of admitted clients, local delivery and the execution of group actions.
use super::ServerInner;
use crate::constants::{ENGINE_RPC_ID_BASE, MAX_RELAY_TARGETS};
use crate::error::NetworkError;
use crate::proto::destination::Destination;
use crate::proto::engine_rpc::{P2PEngineC2SHandler, P2PEngineC2SStub, P2PEngineS2CProxy};
use crate::proto::events::ErrorInfo;
use crate::proto::message::{
    split_message_type, Message, MessageReader, MessageType, ReceivedMessage,
};
use crate::proto::p2p_group::GroupAction;
use crate::proto::packet_crafter::do_disconnect::{ShutdownTcp, ShutdownTcpAck};
use crate::proto::packet_crafter::keep_alive::{Ping, Pong};
use crate::proto::packet_crafter::relay::{RelayRequest, Relayed};
use crate::proto::packet_crafter::ControlPacket;
use crate::proto::peer::RemoteClient;
use crate::proto::registry::ServerRegistry;
use crate::proto::rpc::{RpcContext, RpcHeader, RpcResult, RpcStatus, RpcStub, StubOutcome};
use crate::proto::security::{SendOptions, Unsealed};
use crate::proto::task_queue::TaskSubject;
use crate::proto::transport::Link;
use bytes::Bytes;
use lan_types::errors::ErrorType;
use lan_types::proto::{EncryptMode, HostId, MessageReliability};
use std::sync::Arc;
use std::time::Duration;

/// The server's side of the group protocol
struct ServerEngine(Arc<ServerInner>);

impl P2PEngineC2SHandler for ServerEngine {
    fn p2p_group_member_join_ack(
        &self,
        ctx: &RpcContext,
        group_id: HostId,
        member_id: HostId,
        event_id: u32,
    ) -> RpcResult {
        let _ = self.0.run_group_op(|registry| {
            let actions = registry
                .groups
                .on_join_ack(ctx.sender, group_id, member_id, event_id);
            Ok(((), actions))
        });
        Ok(())
    }

    fn notify_p2p_connected(&self, ctx: &RpcContext, peer_id: HostId) -> RpcResult {
        log::trace!(target: "lan", "{} reports a direct link to {peer_id}", ctx.sender);
        let _ = self.0.run_group_op(|registry| {
            Ok(((), registry.groups.on_p2p_connected(ctx.sender, peer_id)))
        });
        Ok(())
    }

    fn notify_p2p_disconnected(
        &self,
        ctx: &RpcContext,
        peer_id: HostId,
        reason: ErrorType,
    ) -> RpcResult {
        log::trace!(target: "lan", "{} lost its direct link to {peer_id} ({reason})", ctx.sender);
        let _ = self.0.run_group_op(|registry| {
            registry.groups.on_p2p_disconnected(ctx.sender, peer_id);
            Ok(((), Vec::new()))
        });
        Ok(())
    }
}

impl ServerInner {
    pub(super) fn dispatch(
        self: &Arc<Self>,
        client: &Arc<RemoteClient>,
        message: Unsealed,
    ) -> Result<(), NetworkError> {
        let sender = client
            .host_id()
            .ok_or(NetworkError::InternalError("Admitted client without a host id"))?;
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
                    sender,
                    relayed: false,
                    encrypt_mode,
                    compressed,
                };
                self.on_rpc(ctx, reader)
            }

            MessageType::UserMessage => {
                let message = ReceivedMessage::new(sender, reader, false)
                    .with_security(encrypt_mode, compressed);
                self.deliver_user_message(message);
                Ok(())
            }

            MessageType::RelayRequest => {
                let request = RelayRequest::validate(&mut reader)?;
                self.relay(sender, request, encrypt_mode)
            }

            MessageType::Ping => {
                let ping = Ping::validate(&mut reader)?;
                if ping.recent_ping_us > 0 {
                    client.set_recent_ping(Duration::from_micros(ping.recent_ping_us));
                }
                let pong = Pong {
                    sent_at_us: ping.sent_at_us,
                    responder_time_ms: self.server_time_ms(),
                };
                client
                    .link()
                    .send(&pong.craft(), SendOptions::UNRELIABLE)
            }

            MessageType::ShutdownTcp => {
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

            other => {
                log::warn!(target: "lan", "Unexpected {other:?} from {sender}");
                Err(NetworkError::InvalidPacket("Unexpected message type"))
            }
        }
    }

    /// Engine calls are handled in place; user calls are queued for the stubs
    fn on_rpc(self: &Arc<Self>, ctx: RpcContext, mut reader: MessageReader) -> Result<(), NetworkError> {
        let header = RpcHeader::peek(&reader)?;

        if header.rpc_id >= ENGINE_RPC_ID_BASE {
            if ctx.relayed {
                return Err(NetworkError::InvalidPacket("Relayed engine rpc"));
            }

            let stub = P2PEngineC2SStub::new(ServerEngine(self.clone()));
            return match stub.dispatch(&ctx, &mut reader)? {
                StubOutcome::Handled => Ok(()),
                _ => Err(NetworkError::InvalidPacket("Unknown engine rpc")),
            };
        }

        if header.status == RpcStatus::NotImplemented {
            let warning = ErrorInfo::new(
                ErrorType::RpcNotImplemented,
                ctx.sender,
                format!("Rpc {} is not implemented by {}", header.rpc_id, ctx.sender),
            );
            self.raise_warning(warning);
            return Ok(());
        }

        let server = self.clone();
        let _ = self.tasks.push(subject_of(ctx.sender), move || {
            server.invoke_stub(ctx.with_rpc_id(header.rpc_id), header, reader)
        });
        Ok(())
    }

    /// Runs on the user pool
    fn invoke_stub(&self, ctx: RpcContext, header: RpcHeader, mut reader: MessageReader) {
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
                let caller = self.registry.lock().lookup_active(ctx.sender);
                if let Some(caller) = caller {
                    let reply = header.not_implemented_reply();
                    let _ = caller.link().send(&reply, SendOptions::RELIABLE);
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

    fn deliver_user_message(&self, message: ReceivedMessage) {
        let events = self.events();
        let _ = self
            .tasks
            .push(subject_of(message.sender), move || {
                events.on_received_user_message(message)
            });
    }

    /// Hands an encoded message to this node as if it had arrived from `sender`
    fn deliver_local(
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

    /// Forwards a message a client could not deliver directly
    fn relay(
        self: &Arc<Self>,
        sender: HostId,
        request: RelayRequest,
        encrypt_mode: EncryptMode,
    ) -> Result<(), NetworkError> {
        let (inner_type, _) = split_message_type(request.inner.clone())?;
        if !matches!(inner_type, MessageType::Rpc | MessageType::UserMessage) {
            return Err(NetworkError::InvalidPacket("Only user traffic may be relayed"));
        }
        if request.targets.len() > MAX_RELAY_TARGETS {
            return Err(NetworkError::InvalidPacket("Too many relay targets"));
        }
        let max = self.settings.max_message_length;
        if request.inner.len() > max {
            return Err(NetworkError::MessageTooLong {
                length: request.inner.len(),
                max,
            });
        }

        let (destinations, unknown) = {
            let registry = self.registry.lock();
            let (destinations, unknown) = registry.resolve(&request.targets);
            let destinations = destinations
                .into_iter()
                .filter_map(|destination| match destination {
                    Destination::Peer(host_id) if host_id != sender => registry
                        .lookup_active(host_id)
                        .map(|client| Some(client.link().clone())),
                    Destination::Local => Some(None),
                    _ => None,
                })
                .collect::<Vec<_>>();
            (destinations, unknown)
        };

        if !unknown.is_empty() {
            log::trace!(target: "lan", "Relay from {sender} skips unknown hosts {unknown:?}");
        }

        let relayed = Relayed {
            sender,
            inner: request.inner.clone(),
        }
        .craft();
        let reliability = if request.unreliable {
            MessageReliability::Unreliable
        } else {
            MessageReliability::Reliable
        };
        let options = SendOptions::RELIABLE
            .with_reliability(reliability)
            .with_encryption(encrypt_mode);

        for destination in destinations {
            match destination {
                Some(link) => {
                    if let Err(err) = link.send_relay(&relayed, request.inner.len(), options) {
                        log::warn!(target: "lan", "Relay from {sender} to {link:?} failed: {err}");
                    }
                }
                None => self.deliver_local(sender, request.inner.clone(), true, encrypt_mode)?,
            }
        }

        Ok(())
    }

    /// Sends `message` to `targets`. Every target is resolved before anything is sent, so an
    /// unknown id or an oversize message sends nothing
    pub(super) fn send_message(
        self: &Arc<Self>,
        targets: &[HostId],
        message: &Message,
        options: SendOptions,
    ) -> Result<(), NetworkError> {
        let max = self.settings.max_message_length;
        if message.len() > max {
            return Err(NetworkError::MessageTooLong {
                length: message.len(),
                max,
            });
        }

        let (links, local) = {
            let registry = self.registry.lock();
            let (destinations, unknown) = registry.resolve(targets);
            if let Some(host_id) = unknown.first() {
                return Err(NetworkError::UnknownHost(*host_id));
            }

            let mut local = false;
            let mut links = Vec::new();
            for destination in destinations {
                match destination {
                    Destination::Local => local = true,
                    Destination::Peer(host_id) => {
                        if let Some(client) = registry.lookup_active(host_id) {
                            links.push(client.link().clone());
                        }
                    }
                    _ => {}
                }
            }
            (links, local)
        };

        let mut result = Ok(());
        for link in links {
            if let Err(err) = link.send(message, options) {
                log::trace!(target: "lan", "Send to {link:?} failed: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        if local {
            self.deliver_local(
                HostId::SERVER,
                Bytes::copy_from_slice(message.as_bytes()),
                false,
                options.encrypt,
            )?;
        }

        result
    }

    /// Runs a group change and carries out the actions it produced. Changes are serialized
    /// from the registry update until their notifications sit in the link queues, so every
    /// client observes them in the order the coordinator made them. Must be called without the
    /// registry lock held
    pub(super) fn run_group_op<T>(
        self: &Arc<Self>,
        op: impl FnOnce(&mut ServerRegistry) -> Result<(T, Vec<GroupAction>), NetworkError>,
    ) -> Result<T, NetworkError> {
        let _sequence = self.group_sequence.lock();
        let (value, resolved) = {
            let mut registry = self.registry.lock();
            let (value, actions) = op(&mut registry)?;
            (value, resolve_group_actions(&registry, actions))
        };

        let ResolvedActions { outbound, local } = resolved;
        for (link, message) in outbound {
            if let Err(err) = link.send(&message, SendOptions::SECURE) {
                log::trace!(target: "lan", "Group notification to {link:?} failed: {err}");
            }
        }

        for action in local {
            self.raise_group_event(action);
        }

        Ok(value)
    }

    fn raise_group_event(&self, action: GroupAction) {
        let events = self.events();
        let task: Box<dyn FnOnce() + Send> = match action {
            GroupAction::JoinAckComplete {
                group_id,
                member_id,
                result,
            } => Box::new(move || {
                events.on_p2p_group_join_member_ack_complete(group_id, member_id, result)
            }),

            GroupAction::MemberLeft {
                group_id,
                member_id,
                member_count,
            } => Box::new(move || {
                events.on_p2p_group_member_left(group_id, member_id, member_count)
            }),

            GroupAction::FullyConnected { group_id, .. } => {
                Box::new(move || events.on_p2p_group_fully_connected(group_id))
            }

            GroupAction::GroupRemoved { group_id } => {
                Box::new(move || events.on_p2p_group_removed(group_id))
            }

            _ => return,
        };

        let _ = self.tasks.push(TaskSubject::Local, task);
    }

    pub(super) fn raise_warning(&self, warning: ErrorInfo) {
        log::warn!(target: "lan", "{}: {}", warning.error_type, warning.comment);
        let events = self.events();
        let _ = self
            .tasks
            .push(TaskSubject::Local, move || events.on_warning(&warning));
    }
}

fn subject_of(sender: HostId) -> TaskSubject {
    if sender.is_server() {
        TaskSubject::Local
    } else {
        TaskSubject::Peer(sender)
    }
}

/// Notifications to queue and events to raise for one batch of group actions
struct ResolvedActions {
    outbound: Vec<(Link, Message)>,
    local: Vec<GroupAction>,
}

/// Turns coordinator actions into addressed notifications while the registry that produced
/// them is still locked
fn resolve_group_actions(
    registry: &ServerRegistry,
    actions: Vec<GroupAction>,
) -> ResolvedActions {
    let mut outbound: Vec<(Link, Message)> = Vec::new();
    let mut local = Vec::new();
    for action in actions {
        match action {
            GroupAction::NotifyMemberJoin {
                to,
                group_id,
                member_id,
                custom_field,
                event_id,
                member_count,
                grant,
            } => {
                let Some(recipient) = registry.lookup_active(to) else {
                    continue;
                };
                let grant = grant.map(|mut grant| {
                    grant.peer_addr =
                        registry.lookup(member_id).and_then(|member| member.p2p_addr());
                    grant
                });
                let notification = P2PEngineS2CProxy::p2p_group_member_join(
                    &group_id,
                    &member_id,
                    &custom_field,
                    &event_id,
                    &member_count,
                    &grant,
                );
                outbound.push((recipient.link().clone(), notification));
            }

            GroupAction::NotifyMemberLeave {
                to,
                group_id,
                member_id,
                member_count,
            } => {
                if let Some(recipient) = registry.lookup_active(to) {
                    let notification = P2PEngineS2CProxy::p2p_group_member_leave(
                        &group_id,
                        &member_id,
                        &member_count,
                    );
                    outbound.push((recipient.link().clone(), notification));
                }
            }

            GroupAction::RequestP2PConnect {
                to,
                peer_id,
                signature,
            } => {
                let recipient = registry.lookup_active(to);
                let peer_addr = registry
                    .lookup_active(peer_id)
                    .and_then(|peer| peer.p2p_addr());
                match (recipient, peer_addr) {
                    (Some(recipient), Some(peer_addr)) => {
                        log::trace!(target: "lan", "Asking {to} to connect to {peer_id} at {peer_addr}");
                        let request = P2PEngineS2CProxy::request_p2p_connect(
                            &peer_id, &peer_addr, &signature,
                        );
                        outbound.push((recipient.link().clone(), request));
                    }
                    _ => {
                        log::trace!(target: "lan", "{to} and {peer_id} stay relayed: no direct address");
                    }
                }
            }

            GroupAction::FullyConnected { group_id, members } => {
                for member in &members {
                    if let Some(recipient) = registry.lookup_active(*member) {
                        let notification =
                            P2PEngineS2CProxy::p2p_group_fully_connected(&group_id);
                        outbound.push((recipient.link().clone(), notification));
                    }
                }
                local.push(GroupAction::FullyConnected { group_id, members });
            }

            other => local.push(other),
        }
    }

    ResolvedActions { outbound, local }
}
