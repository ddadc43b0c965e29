//! The services the engine itself speaks. Their ids start at
//! [`ENGINE_RPC_ID_BASE`](crate::constants::ENGINE_RPC_ID_BASE) and are always dispatched before
//! any user stub.
use crate::error::NetworkError;
use crate::proto::message::{Marshal, Message, MessageReader};
use bytes::Bytes;
use lan_types::errors::ErrorType;
use lan_types::proto::HostId;
use std::net::SocketAddr;

/// What a member needs to know to reach another member directly
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PairwiseGrant {
    /// One-time token the initiator presents on the direct connection
    pub signature: u64,
    /// Where the other member accepts direct connections, if it does
    pub peer_addr: Option<SocketAddr>,
    /// Empty when pairwise encryption is disabled
    pub strong_key: Bytes,
    pub weak_key: Bytes,
}

impl PairwiseGrant {
    pub fn has_keys(&self) -> bool {
        !self.strong_key.is_empty() && !self.weak_key.is_empty()
    }
}

impl Marshal for PairwiseGrant {
    fn marshal(&self, msg: &mut Message) {
        msg.write(&self.signature)
            .write(&self.peer_addr)
            .write(&self.strong_key)
            .write(&self.weak_key);
    }

    fn unmarshal(reader: &mut MessageReader) -> Result<Self, NetworkError> {
        Ok(Self {
            signature: reader.read()?,
            peer_addr: reader.read()?,
            strong_key: reader.read()?,
            weak_key: reader.read()?,
        })
    }
}

crate::rpc_service! {
    /// Server to client group protocol
    pub service P2PEngineS2C {
        base: crate::constants::ENGINE_S2C_RPC_BASE;
        handler: P2PEngineS2CHandler;
        stub: P2PEngineS2CStub;
        proxy: P2PEngineS2CProxy;
        /// `member_id` joined `group_id`. Must be answered with `p2p_group_member_join_ack`
        1 => fn p2p_group_member_join(
            group_id: HostId,
            member_id: HostId,
            custom_field: Bytes,
            event_id: u32,
            member_count: u32,
            grant: Option<PairwiseGrant>,
        );
        2 => fn p2p_group_member_leave(group_id: HostId, member_id: HostId, member_count: u32);
        /// Open a direct connection to `peer_id`
        3 => fn request_p2p_connect(peer_id: HostId, peer_addr: SocketAddr, signature: u64);
        4 => fn p2p_group_fully_connected(group_id: HostId);
    }
}

crate::rpc_service! {
    /// Client to server group protocol
    pub service P2PEngineC2S {
        base: crate::constants::ENGINE_C2S_RPC_BASE;
        handler: P2PEngineC2SHandler;
        stub: P2PEngineC2SStub;
        proxy: P2PEngineC2SProxy;
        1 => fn p2p_group_member_join_ack(group_id: HostId, member_id: HostId, event_id: u32);
        2 => fn notify_p2p_connected(peer_id: HostId);
        3 => fn notify_p2p_disconnected(peer_id: HostId, reason: ErrorType);
    }
}
