//! Remote procedure calls.
//!
//! A call is a [`MessageType::Rpc`](crate::proto::message::MessageType::Rpc) message carrying
//! an [`RpcHeader`] followed by the arguments in declaration order. Services are declared with
//! [`rpc_service!`](crate::rpc_service), which generates a handler trait, a stub that decodes
//! inbound calls into that trait, and a proxy that encodes outbound calls.
use crate::constants::ENGINE_RPC_ID_BASE;
use crate::error::NetworkError;
use crate::proto::message::{Marshal, Message, MessageReader};
use lan_types::proto::{EncryptMode, HostId};
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

pub type RpcId = u16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RpcStatus {
    Call = 0,
    /// Sent back when the receiving side has no implementation for the call
    NotImplemented = 1,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RpcHeader {
    pub rpc_id: RpcId,
    pub status: RpcStatus,
}

impl RpcHeader {
    pub const fn call(rpc_id: RpcId) -> Self {
        Self {
            rpc_id,
            status: RpcStatus::Call,
        }
    }

    pub const fn not_implemented(rpc_id: RpcId) -> Self {
        Self {
            rpc_id,
            status: RpcStatus::NotImplemented,
        }
    }

    /// Reads the header at the cursor without moving it
    pub fn peek(reader: &MessageReader) -> Result<Self, NetworkError> {
        reader.clone().read()
    }

    /// The reply sent back to a caller whose call was not implemented
    pub fn not_implemented_reply(self) -> Message {
        let mut message = Message::new(crate::proto::message::MessageType::Rpc);
        message.write(&RpcHeader::not_implemented(self.rpc_id));
        message
    }
}

impl Marshal for RpcHeader {
    fn marshal(&self, msg: &mut Message) {
        msg.write(&self.rpc_id).write(&(self.status as u8));
    }

    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        let rpc_id = reader.read::<u16>()?;
        let status = match reader.read::<u8>()? {
            0 => RpcStatus::Call,
            1 => RpcStatus::NotImplemented,
            _ => return Err(NetworkError::InvalidPacket("Unknown rpc status")),
        };
        Ok(Self { rpc_id, status })
    }
}

/// Describes the call being handled
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RpcContext {
    pub rpc_id: RpcId,
    pub sender: HostId,
    pub relayed: bool,
    pub encrypt_mode: EncryptMode,
    pub compressed: bool,
}

impl RpcContext {
    pub fn new(sender: HostId) -> Self {
        Self {
            rpc_id: 0,
            sender,
            relayed: false,
            encrypt_mode: EncryptMode::None,
            compressed: false,
        }
    }

    pub fn with_rpc_id(mut self, rpc_id: RpcId) -> Self {
        self.rpc_id = rpc_id;
        self
    }
}

pub enum RpcError {
    /// The default of every generated handler method
    NotImplemented,
    /// The handler ran but could not process the call
    Failed(String),
}

impl Debug for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::NotImplemented => write!(f, "Rpc not implemented"),
            RpcError::Failed(reason) => write!(f, "Rpc failed: {reason}"),
        }
    }
}

impl Display for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl std::error::Error for RpcError {}

pub type RpcResult = Result<(), RpcError>;

/// What a stub did with a message
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StubOutcome {
    Handled,
    /// The handler has no implementation for this call
    NotImplemented(RpcHeader),
    Failed(RpcHeader, String),
    /// The rpc id does not belong to this stub. The cursor was left where it was
    NotHandled,
}

/// The receiving side of a service
pub trait RpcStub: Send + Sync + 'static {
    fn service_name(&self) -> &'static str;
    fn rpc_ids(&self) -> Vec<RpcId>;
    /// Decodes the call at the cursor (which must point at the [`RpcHeader`]) and invokes the
    /// handler
    fn dispatch(
        &self,
        ctx: &RpcContext,
        reader: &mut MessageReader,
    ) -> Result<StubOutcome, NetworkError>;
}

/// The user stubs attached to a node, keyed by rpc id
#[derive(Clone, Default)]
pub struct StubRegistry {
    stubs: HashMap<RpcId, Arc<dyn RpcStub>>,
}

impl StubRegistry {
    /// Adds every rpc id of `stub`. Fails without changing anything if an id is already taken
    /// or lies in the range reserved for the engine
    pub fn attach(&mut self, stub: Arc<dyn RpcStub>) -> Result<(), NetworkError> {
        let ids = stub.rpc_ids();
        if ids.iter().any(|id| *id >= ENGINE_RPC_ID_BASE) {
            return Err(NetworkError::InvalidRequest(
                "Rpc ids at or above 64000 are reserved",
            ));
        }

        if ids.iter().any(|id| self.stubs.contains_key(id)) {
            return Err(NetworkError::InvalidRequest("Duplicate rpc id"));
        }

        for id in ids {
            let _ = self.stubs.insert(id, stub.clone());
        }

        log::trace!(target: "lan", "Attached stub {}", stub.service_name());
        Ok(())
    }

    pub fn stub_for(&self, rpc_id: RpcId) -> Option<Arc<dyn RpcStub>> {
        self.stubs.get(&rpc_id).cloned()
    }

    pub fn dispatch(
        &self,
        ctx: &RpcContext,
        reader: &mut MessageReader,
    ) -> Result<StubOutcome, NetworkError> {
        let header = RpcHeader::peek(reader)?;
        match self.stubs.get(&header.rpc_id) {
            Some(stub) => stub.dispatch(&ctx.with_rpc_id(header.rpc_id), reader),
            None => Ok(StubOutcome::NotHandled),
        }
    }

    pub fn len(&self) -> usize {
        self.stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }
}
