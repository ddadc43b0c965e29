//! The client's view of its groups and of the members it shares them with.
use super::JoinedGroupInfo;
use crate::error::NetworkError;
use crate::proto::destination::Destination;
use crate::proto::engine_rpc::PairwiseGrant;
use crate::proto::events::PeerInfo;
use crate::proto::transport::Link;
use bytes::Bytes;
use lan_types::proto::HostId;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

#[derive(Default)]
pub(super) struct PeerTable {
    me: HostId,
    groups: HashMap<HostId, JoinedGroup>,
    peers: HashMap<HostId, RemotePeer>,
}

#[derive(Default)]
struct JoinedGroup {
    members: BTreeSet<HostId>,
    custom_field: Bytes,
}

#[derive(Default)]
struct RemotePeer {
    grant: Option<PairwiseGrant>,
    direct: Option<Link>,
    /// A direct connection attempt is in flight
    connecting: bool,
    recent_ping: Option<Duration>,
}

impl PeerTable {
    pub fn set_me(&mut self, me: HostId) {
        self.me = me;
    }

    pub fn me(&self) -> HostId {
        self.me
    }

    pub fn member_joined(
        &mut self,
        group_id: HostId,
        member_id: HostId,
        custom_field: &Bytes,
        grant: Option<PairwiseGrant>,
    ) {
        let group = self.groups.entry(group_id).or_default();
        if member_id == self.me {
            group.custom_field = custom_field.clone();
        }
        let _ = group.members.insert(member_id);

        if member_id != self.me && member_id.is_assignable() {
            let peer = self.peers.entry(member_id).or_default();
            if grant.is_some() {
                peer.grant = grant;
            }
        }
    }

    /// Applies a departure and returns the members no longer shared with any group, along
    /// with their direct link if one existed
    pub fn member_left(
        &mut self,
        group_id: HostId,
        member_id: HostId,
    ) -> Vec<(HostId, Option<Link>)> {
        let candidates = if member_id == self.me {
            self.groups
                .remove(&group_id)
                .map(|group| group.members.into_iter().collect::<Vec<_>>())
                .unwrap_or_default()
        } else {
            match self.groups.get_mut(&group_id) {
                Some(group) => {
                    if group.members.remove(&member_id) {
                        vec![member_id]
                    } else {
                        Vec::new()
                    }
                }
                None => Vec::new(),
            }
        };

        let unshared = candidates
            .into_iter()
            .filter(|candidate| *candidate != self.me && !self.shares_group(*candidate))
            .collect::<Vec<_>>();

        unshared
            .into_iter()
            .filter_map(|candidate| {
                self.peers
                    .remove(&candidate)
                    .map(|peer| (candidate, peer.direct))
            })
            .collect()
    }

    fn shares_group(&self, host_id: HostId) -> bool {
        self.groups
            .values()
            .any(|group| group.members.contains(&host_id))
    }

    pub fn classify(&self, host_id: HostId) -> Option<Destination> {
        if host_id.is_none() {
            return None;
        }

        Some(if host_id == self.me {
            Destination::Local
        } else if host_id.is_server() {
            Destination::Server
        } else if self.groups.contains_key(&host_id) {
            Destination::Group(host_id)
        } else {
            // ids this node knows nothing about go through the server, which owns the namespace
            Destination::Peer(host_id)
        })
    }

    pub fn members(&self, group_id: HostId) -> Vec<HostId> {
        self.groups
            .get(&group_id)
            .map(|group| group.members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn group_ids(&self) -> Vec<HostId> {
        let mut ids = self.groups.keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn group_info(&self, group_id: HostId) -> Option<JoinedGroupInfo> {
        let group = self.groups.get(&group_id)?;
        Some(JoinedGroupInfo {
            group_id,
            members: group.members.iter().copied().collect(),
            custom_field: group.custom_field.clone(),
        })
    }

    pub fn peer_ids(&self) -> Vec<HostId> {
        let mut ids = self.peers.keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn peer_info(&self, host_id: HostId) -> Option<PeerInfo> {
        let peer = self.peers.get(&host_id)?;
        let mut groups = self
            .groups
            .iter()
            .filter(|(_, group)| group.members.contains(&host_id))
            .map(|(group_id, _)| *group_id)
            .collect::<Vec<_>>();
        groups.sort();

        Some(PeerInfo {
            host_id,
            groups,
            direct: peer.direct.is_some(),
            recent_ping: peer.recent_ping,
        })
    }

    pub fn grant(&self, host_id: HostId) -> Option<PairwiseGrant> {
        self.peers.get(&host_id)?.grant.clone()
    }

    pub fn direct_link(&self, host_id: HostId) -> Option<&Link> {
        self.peers.get(&host_id)?.direct.as_ref()
    }

    pub fn direct_links(&self) -> Vec<(HostId, Link)> {
        self.peers
            .iter()
            .filter_map(|(host_id, peer)| peer.direct.clone().map(|link| (*host_id, link)))
            .collect()
    }

    /// Marks a connection attempt to `host_id` as started. Returns `false` when one is
    /// already running, a direct link exists or `signature` does not match the grant
    pub fn begin_connect(&mut self, host_id: HostId, signature: u64) -> bool {
        let Some(peer) = self.peers.get_mut(&host_id) else {
            return false;
        };
        let granted = peer
            .grant
            .as_ref()
            .map(|grant| grant.signature == signature)
            .unwrap_or(false);
        if !granted || peer.connecting || peer.direct.is_some() {
            return false;
        }

        peer.connecting = true;
        true
    }

    pub fn end_connect(&mut self, host_id: HostId) {
        if let Some(peer) = self.peers.get_mut(&host_id) {
            peer.connecting = false;
        }
    }

    /// Records a validated direct link. At most one exists per peer
    pub fn set_direct(&mut self, host_id: HostId, link: Link) -> Result<(), NetworkError> {
        let peer = self
            .peers
            .get_mut(&host_id)
            .ok_or(NetworkError::UnknownHost(host_id))?;
        if peer.direct.is_some() {
            return Err(NetworkError::InvalidRequest(
                "A direct link to this peer already exists",
            ));
        }

        peer.connecting = false;
        peer.direct = Some(link);
        Ok(())
    }

    /// Forgets the direct link of `host_id` if it is the one identified by `link_id`
    pub fn clear_direct(&mut self, host_id: HostId, link_id: u64) -> bool {
        match self.peers.get_mut(&host_id) {
            Some(peer) if peer.direct.as_ref().map(Link::id) == Some(link_id) => {
                peer.direct = None;
                true
            }
            _ => false,
        }
    }

    pub fn set_recent_ping(&mut self, host_id: HostId, ping: Duration) {
        if let Some(peer) = self.peers.get_mut(&host_id) {
            peer.recent_ping = Some(ping);
        }
    }

    pub fn recent_ping(&self, host_id: HostId) -> Option<Duration> {
        self.peers.get(&host_id)?.recent_ping
    }

    /// Drops every group and peer, returning the direct links that must be closed
    pub fn clear(&mut self) -> Vec<Link> {
        self.groups.clear();
        self.peers
            .drain()
            .filter_map(|(_, peer)| peer.direct)
            .collect()
    }
}
