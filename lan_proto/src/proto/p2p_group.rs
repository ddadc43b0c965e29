//! P2P group membership and the member-join acknowledgment protocol.
//!
//! The coordinator holds no sockets. Every operation mutates the group tables and returns the
//! [`GroupAction`]s the server must carry out once it has released the registry lock.
use crate::error::NetworkError;
use crate::proto::engine_rpc::PairwiseGrant;
use bytes::Bytes;
use itertools::Itertools;
use lan_crypt::session_key::SessionKey;
use lan_io::tokio::time::Instant;
use lan_types::crypto::{StrongKeyLength, WeakKeyLength};
use lan_types::errors::ErrorType;
use lan_types::proto::HostId;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// The unordered pair of two clients
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PairKey {
    low: HostId,
    high: HostId,
}

impl PairKey {
    pub fn new(a: HostId, b: HostId) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
        }
    }

    /// The larger id always opens the direct connection
    pub fn initiator(&self) -> HostId {
        self.high
    }

    pub fn acceptor(&self) -> HostId {
        self.low
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PairPhase {
    /// Join notifications are out, acknowledgments pending
    Joining,
    /// The initiator was told to connect
    Connecting,
    Connected,
}

struct PairState {
    phase: PairPhase,
    /// Number of live groups containing both members
    dup_count: u32,
    signature: u64,
    keys: Option<(Bytes, Bytes)>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PairwiseInfo {
    pub phase: PairPhase,
    pub dup_count: u32,
    pub initiator: HostId,
}

struct P2PGroup {
    members: BTreeSet<HostId>,
    custom_field: Bytes,
    fully_connected_reported: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct P2PGroupInfo {
    pub group_id: HostId,
    pub members: Vec<HostId>,
    pub custom_field: Bytes,
}

#[derive(Clone, Debug)]
struct AckWaiter {
    group_id: HostId,
    /// The member that must acknowledge
    owner: HostId,
    /// The member the notification was about
    subject: HostId,
    joining: HostId,
    event_id: u32,
    created_at: Instant,
}

/// Work for the server to carry out after a coordinator call
#[derive(Clone, Debug, PartialEq)]
pub enum GroupAction {
    NotifyMemberJoin {
        to: HostId,
        group_id: HostId,
        member_id: HostId,
        custom_field: Bytes,
        event_id: u32,
        member_count: u32,
        grant: Option<PairwiseGrant>,
    },
    NotifyMemberLeave {
        to: HostId,
        group_id: HostId,
        member_id: HostId,
        member_count: u32,
    },
    RequestP2PConnect {
        to: HostId,
        peer_id: HostId,
        signature: u64,
    },
    JoinAckComplete {
        group_id: HostId,
        member_id: HostId,
        result: ErrorType,
    },
    MemberLeft {
        group_id: HostId,
        member_id: HostId,
        member_count: u32,
    },
    FullyConnected {
        group_id: HostId,
        members: Vec<HostId>,
    },
    GroupRemoved {
        group_id: HostId,
    },
}

#[derive(Copy, Clone, Debug, Default)]
pub struct GroupPolicy {
    pub allow_server_member: bool,
    pub allow_empty: bool,
    /// Fresh pairwise keys of these lengths are handed to both members of every new pair
    pub pairwise_keys: Option<(StrongKeyLength, WeakKeyLength)>,
}

#[derive(Default)]
pub struct P2PGroupCoordinator {
    policy: GroupPolicy,
    groups: HashMap<HostId, P2PGroup>,
    pairs: HashMap<PairKey, PairState>,
    waiters: Vec<AckWaiter>,
    next_event_id: u32,
}

impl P2PGroupCoordinator {
    pub fn new(policy: GroupPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// Creates `group_id` and joins `members` to it in order
    pub fn create_group(
        &mut self,
        group_id: HostId,
        members: &[HostId],
        custom_field: Bytes,
        now: Instant,
    ) -> Result<Vec<GroupAction>, NetworkError> {
        if self.groups.contains_key(&group_id) {
            return Err(NetworkError::InvalidRequest("Group id already in use"));
        }

        let members = members.iter().copied().unique().collect::<Vec<_>>();
        if members.is_empty() && !self.policy.allow_empty {
            return Err(NetworkError::InvalidRequest("Empty groups are not allowed"));
        }

        for member in &members {
            self.check_member(*member)?;
        }

        let _ = self.groups.insert(
            group_id,
            P2PGroup {
                members: BTreeSet::new(),
                custom_field: custom_field.clone(),
                fully_connected_reported: false,
            },
        );

        let mut actions = Vec::new();
        for member in members {
            actions.extend(self.join_inner(group_id, member, custom_field.clone(), now));
        }
        Ok(actions)
    }

    pub fn join(
        &mut self,
        group_id: HostId,
        member: HostId,
        custom_field: Bytes,
        now: Instant,
    ) -> Result<Vec<GroupAction>, NetworkError> {
        self.check_member(member)?;
        let group = self
            .groups
            .get(&group_id)
            .ok_or(NetworkError::UnknownHost(group_id))?;
        if group.members.contains(&member) {
            return Err(NetworkError::InvalidRequest("Already a member of the group"));
        }

        Ok(self.join_inner(group_id, member, custom_field, now))
    }

    pub fn leave(
        &mut self,
        group_id: HostId,
        member: HostId,
    ) -> Result<Vec<GroupAction>, NetworkError> {
        let group = self
            .groups
            .get(&group_id)
            .ok_or(NetworkError::UnknownHost(group_id))?;
        if !group.members.contains(&member) {
            return Err(NetworkError::InvalidRequest("Not a member of the group"));
        }

        Ok(self.leave_inner(group_id, member, true))
    }

    /// Removes every member, then the group itself
    pub fn destroy(&mut self, group_id: HostId) -> Result<Vec<GroupAction>, NetworkError> {
        let group = self
            .groups
            .get(&group_id)
            .ok_or(NetworkError::UnknownHost(group_id))?;
        let members = group.members.iter().copied().collect::<Vec<_>>();

        let mut actions = Vec::new();
        for member in members {
            actions.extend(self.leave_inner(group_id, member, false));
        }

        if self.groups.remove(&group_id).is_some() {
            actions.push(GroupAction::GroupRemoved { group_id });
        }
        Ok(actions)
    }

    /// Leaves every group `member` belongs to. Used when a client is disposed
    pub fn remove_member_everywhere(&mut self, member: HostId) -> Vec<GroupAction> {
        let mut actions = Vec::new();
        for group_id in self.groups_of(member) {
            actions.extend(self.leave_inner(group_id, member, true));
        }
        actions
    }

    /// Handles a `member-join-ack`. Acks that match no outstanding waiter (e.g., ones for an
    /// earlier membership of the same member) are ignored
    pub fn on_join_ack(
        &mut self,
        owner: HostId,
        group_id: HostId,
        subject: HostId,
        event_id: u32,
    ) -> Vec<GroupAction> {
        let Some(pos) = self.waiters.iter().position(|waiter| {
            waiter.group_id == group_id
                && waiter.owner == owner
                && waiter.subject == subject
                && waiter.event_id == event_id
        }) else {
            log::trace!(target: "lan", "Ignoring stale join ack from {owner} for {subject} in {group_id}");
            return Vec::new();
        };

        let waiter = self.waiters.remove(pos);
        if self.has_waiters_for(group_id, waiter.joining, waiter.event_id) {
            Vec::new()
        } else {
            self.complete_join(group_id, waiter.joining, ErrorType::Ok)
        }
    }

    /// A direct connection between `a` and `b` was validated
    pub fn on_p2p_connected(&mut self, a: HostId, b: HostId) -> Vec<GroupAction> {
        let key = PairKey::new(a, b);
        match self.pairs.get_mut(&key) {
            Some(pair) if pair.phase != PairPhase::Connected => pair.phase = PairPhase::Connected,
            _ => return Vec::new(),
        }

        self.groups_containing(key)
            .into_iter()
            .flat_map(|group_id| self.check_fully_connected(group_id))
            .collect()
    }

    pub fn on_p2p_disconnected(&mut self, a: HostId, b: HostId) {
        if let Some(pair) = self.pairs.get_mut(&PairKey::new(a, b)) {
            if pair.phase == PairPhase::Connected {
                pair.phase = PairPhase::Connecting;
            }
        }
    }

    /// Completes every join that still has a waiter older than `timeout`
    pub fn expire_ack_waiters(&mut self, now: Instant, timeout: Duration) -> Vec<GroupAction> {
        let expired = self
            .waiters
            .iter()
            .filter(|waiter| now.saturating_duration_since(waiter.created_at) >= timeout)
            .map(|waiter| (waiter.group_id, waiter.joining, waiter.event_id))
            .unique()
            .collect::<Vec<_>>();

        let mut actions = Vec::new();
        for (group_id, joining, event_id) in expired {
            self.waiters.retain(|waiter| {
                !(waiter.group_id == group_id
                    && waiter.joining == joining
                    && waiter.event_id == event_id)
            });
            log::warn!(target: "lan", "Join of {joining} into {group_id} timed out waiting for acks");
            actions.push(GroupAction::JoinAckComplete {
                group_id,
                member_id: joining,
                result: ErrorType::P2PGroupJoinTimeout,
            });
        }
        actions
    }

    pub fn group_info(&self, group_id: HostId) -> Option<P2PGroupInfo> {
        self.groups.get(&group_id).map(|group| P2PGroupInfo {
            group_id,
            members: group.members.iter().copied().collect(),
            custom_field: group.custom_field.clone(),
        })
    }

    pub fn pair_info(&self, a: HostId, b: HostId) -> Option<PairwiseInfo> {
        let key = PairKey::new(a, b);
        self.pairs.get(&key).map(|pair| PairwiseInfo {
            phase: pair.phase,
            dup_count: pair.dup_count,
            initiator: key.initiator(),
        })
    }

    pub fn groups_of(&self, member: HostId) -> Vec<HostId> {
        self.groups
            .iter()
            .filter(|(_, group)| group.members.contains(&member))
            .map(|(id, _)| *id)
            .sorted()
            .collect()
    }

    pub fn group_ids(&self) -> Vec<HostId> {
        self.groups.keys().copied().sorted().collect()
    }

    pub fn contains_group(&self, group_id: HostId) -> bool {
        self.groups.contains_key(&group_id)
    }

    pub fn pending_acks(&self, group_id: HostId) -> usize {
        self.waiters
            .iter()
            .filter(|waiter| waiter.group_id == group_id)
            .count()
    }

    fn check_member(&self, member: HostId) -> Result<(), NetworkError> {
        if member.is_server() {
            if self.policy.allow_server_member {
                Ok(())
            } else {
                Err(NetworkError::InvalidRequest(
                    "The server may not be a group member",
                ))
            }
        } else if member.is_assignable() && !self.groups.contains_key(&member) {
            Ok(())
        } else {
            Err(NetworkError::UnknownHost(member))
        }
    }

    fn next_event_id(&mut self) -> u32 {
        self.next_event_id = self.next_event_id.wrapping_add(1);
        self.next_event_id
    }

    fn join_inner(
        &mut self,
        group_id: HostId,
        member: HostId,
        custom_field: Bytes,
        now: Instant,
    ) -> Vec<GroupAction> {
        let event_id = self.next_event_id();
        let Some(group) = self.groups.get_mut(&group_id) else {
            return Vec::new();
        };
        let existing = group.members.iter().copied().collect::<Vec<_>>();
        let _ = group.members.insert(member);
        let member_count = group.members.len() as u32;

        let mut actions = Vec::new();
        let mut notify = |to: HostId, about: HostId, grant: Option<PairwiseGrant>| {
            actions.push(GroupAction::NotifyMemberJoin {
                to,
                group_id,
                member_id: about,
                custom_field: custom_field.clone(),
                event_id,
                member_count,
                grant,
            });
        };

        let mut waiters = Vec::new();
        for other in existing {
            let grant = (other.is_assignable() && member.is_assignable())
                .then(|| self.retain_pair(other, member));

            if other.is_assignable() {
                notify(other, member, grant.clone());
                waiters.push((other, member));
            }

            if member.is_assignable() {
                notify(member, other, grant);
                waiters.push((member, other));
            }
        }

        if member.is_assignable() {
            notify(member, member, None);
            waiters.push((member, member));
        }

        let no_waiters = waiters.is_empty();
        self.waiters
            .extend(waiters.into_iter().map(|(owner, subject)| AckWaiter {
                group_id,
                owner,
                subject,
                joining: member,
                event_id,
                created_at: now,
            }));

        if no_waiters {
            actions.extend(self.complete_join(group_id, member, ErrorType::Ok));
        }

        actions
    }

    fn leave_inner(
        &mut self,
        group_id: HostId,
        member: HostId,
        remove_if_empty: bool,
    ) -> Vec<GroupAction> {
        let Some(group) = self.groups.get_mut(&group_id) else {
            return Vec::new();
        };
        if !group.members.remove(&member) {
            return Vec::new();
        }
        let remaining = group.members.iter().copied().collect::<Vec<_>>();
        let member_count = remaining.len() as u32;

        let mut actions = Vec::new();

        // purge every waiter that involves the departing member
        let (purged, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|waiter| {
                waiter.group_id == group_id
                    && (waiter.owner == member
                        || waiter.subject == member
                        || waiter.joining == member)
            });
        self.waiters = kept;

        for (joining, event_id) in purged
            .iter()
            .map(|waiter| (waiter.joining, waiter.event_id))
            .unique()
        {
            if joining == member {
                actions.push(GroupAction::JoinAckComplete {
                    group_id,
                    member_id: member,
                    result: ErrorType::P2PGroupJoinAborted,
                });
            } else if !self.has_waiters_for(group_id, joining, event_id) {
                actions.extend(self.complete_join(group_id, joining, ErrorType::Ok));
            }
        }

        if member.is_assignable() {
            for other in remaining.iter().filter(|other| other.is_assignable()) {
                self.release_pair(*other, member);
            }
        }

        for other in remaining.iter().filter(|other| other.is_assignable()) {
            actions.push(GroupAction::NotifyMemberLeave {
                to: *other,
                group_id,
                member_id: member,
                member_count,
            });
        }

        if member.is_assignable() {
            actions.push(GroupAction::NotifyMemberLeave {
                to: member,
                group_id,
                member_id: member,
                member_count,
            });
        }

        actions.push(GroupAction::MemberLeft {
            group_id,
            member_id: member,
            member_count,
        });

        if remaining.is_empty() && remove_if_empty && !self.policy.allow_empty {
            let _ = self.groups.remove(&group_id);
            actions.push(GroupAction::GroupRemoved { group_id });
        } else {
            actions.extend(self.check_fully_connected(group_id));
        }

        actions
    }

    fn complete_join(
        &mut self,
        group_id: HostId,
        joining: HostId,
        result: ErrorType,
    ) -> Vec<GroupAction> {
        let mut actions = vec![GroupAction::JoinAckComplete {
            group_id,
            member_id: joining,
            result,
        }];

        if !result.is_ok() || !joining.is_assignable() {
            actions.extend(self.check_fully_connected(group_id));
            return actions;
        }

        let others = self
            .groups
            .get(&group_id)
            .map(|group| {
                group
                    .members
                    .iter()
                    .copied()
                    .filter(|other| other.is_assignable() && *other != joining)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        for other in others {
            let key = PairKey::new(joining, other);
            // both sides must have acknowledged each other first
            if self.pair_has_waiters(key) {
                continue;
            }

            if let Some(pair) = self.pairs.get_mut(&key) {
                if pair.phase == PairPhase::Joining {
                    pair.phase = PairPhase::Connecting;
                    actions.push(GroupAction::RequestP2PConnect {
                        to: key.initiator(),
                        peer_id: key.acceptor(),
                        signature: pair.signature,
                    });
                }
            }
        }

        actions.extend(self.check_fully_connected(group_id));
        actions
    }

    fn check_fully_connected(&mut self, group_id: HostId) -> Vec<GroupAction> {
        if self.waiters.iter().any(|waiter| waiter.group_id == group_id) {
            return Vec::new();
        }

        let Some(group) = self.groups.get(&group_id) else {
            return Vec::new();
        };
        if group.fully_connected_reported {
            return Vec::new();
        }

        let clients = group
            .members
            .iter()
            .copied()
            .filter(|member| member.is_assignable())
            .collect::<Vec<_>>();
        let pairs = clients
            .iter()
            .tuple_combinations()
            .map(|(a, b)| PairKey::new(*a, *b))
            .collect::<Vec<_>>();

        if pairs.is_empty()
            || !pairs.iter().all(|key| {
                self.pairs
                    .get(key)
                    .map(|pair| pair.phase == PairPhase::Connected)
                    .unwrap_or(false)
            })
        {
            return Vec::new();
        }

        if let Some(group) = self.groups.get_mut(&group_id) {
            group.fully_connected_reported = true;
        }

        vec![GroupAction::FullyConnected {
            group_id,
            members: clients,
        }]
    }

    fn retain_pair(&mut self, a: HostId, b: HostId) -> PairwiseGrant {
        let keys = self.policy.pairwise_keys;
        let pair = self
            .pairs
            .entry(PairKey::new(a, b))
            .or_insert_with(|| PairState {
                phase: PairPhase::Joining,
                dup_count: 0,
                signature: rand::random(),
                keys: keys.map(|(strong, weak)| {
                    let key = SessionKey::generate(strong, weak);
                    (
                        Bytes::copy_from_slice(key.strong_material()),
                        Bytes::copy_from_slice(key.weak_material()),
                    )
                }),
            });
        pair.dup_count += 1;

        let (strong_key, weak_key) = pair.keys.clone().unwrap_or_default();
        PairwiseGrant {
            signature: pair.signature,
            peer_addr: None,
            strong_key,
            weak_key,
        }
    }

    fn release_pair(&mut self, a: HostId, b: HostId) {
        let key = PairKey::new(a, b);
        if let Some(pair) = self.pairs.get_mut(&key) {
            pair.dup_count = pair.dup_count.saturating_sub(1);
            if pair.dup_count == 0 {
                let _ = self.pairs.remove(&key);
            }
        }
    }

    fn has_waiters_for(&self, group_id: HostId, joining: HostId, event_id: u32) -> bool {
        self.waiters.iter().any(|waiter| {
            waiter.group_id == group_id && waiter.joining == joining && waiter.event_id == event_id
        })
    }

    fn pair_has_waiters(&self, key: PairKey) -> bool {
        self.waiters
            .iter()
            .any(|waiter| PairKey::new(waiter.owner, waiter.subject) == key)
    }

    fn groups_containing(&self, key: PairKey) -> Vec<HostId> {
        self.groups
            .iter()
            .filter(|(_, group)| {
                group.members.contains(&key.low) && group.members.contains(&key.high)
            })
            .map(|(id, _)| *id)
            .sorted()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: HostId = HostId(2);
    const B: HostId = HostId(3);
    const C: HostId = HostId(4);
    const G1: HostId = HostId(100);
    const G2: HostId = HostId(101);

    fn coordinator() -> P2PGroupCoordinator {
        P2PGroupCoordinator::new(GroupPolicy {
            allow_server_member: true,
            allow_empty: false,
            pairwise_keys: Some((StrongKeyLength::Aes128, WeakKeyLength::Bits128)),
        })
    }

    /// Acknowledges every join notification in `actions`, returning everything that followed
    fn ack_all(coordinator: &mut P2PGroupCoordinator, actions: &[GroupAction]) -> Vec<GroupAction> {
        actions
            .iter()
            .filter_map(|action| match action {
                GroupAction::NotifyMemberJoin {
                    to,
                    group_id,
                    member_id,
                    event_id,
                    ..
                } => Some((*to, *group_id, *member_id, *event_id)),
                _ => None,
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flat_map(|(to, group_id, member_id, event_id)| {
                coordinator.on_join_ack(to, group_id, member_id, event_id)
            })
            .collect()
    }

    fn connect_requests(actions: &[GroupAction]) -> Vec<(HostId, HostId)> {
        actions
            .iter()
            .filter_map(|action| match action {
                GroupAction::RequestP2PConnect { to, peer_id, .. } => Some((*to, *peer_id)),
                _ => None,
            })
            .collect()
    }

    fn dup_count(coordinator: &P2PGroupCoordinator, a: HostId, b: HostId) -> u32 {
        coordinator
            .pair_info(a, b)
            .map(|info| info.dup_count)
            .unwrap_or(0)
    }

    #[test]
    fn group_of_two_notifies_both_and_connects_once() {
        let now = Instant::now();
        let mut coordinator = coordinator();
        let actions = coordinator
            .create_group(G1, &[A, B], Bytes::from_static(b"room"), now)
            .unwrap();

        let notified = |to: HostId, about: HostId| {
            actions.iter().any(|action| {
                matches!(action, GroupAction::NotifyMemberJoin { to: t, member_id, grant, .. }
                    if *t == to && *member_id == about && (to == about || grant.as_ref().is_some_and(|g| g.has_keys())))
            })
        };
        assert!(notified(A, B));
        assert!(notified(B, A));
        assert!(notified(A, A));
        assert!(notified(B, B));
        assert!(connect_requests(&actions).is_empty());

        let after_acks = ack_all(&mut coordinator, &actions);
        assert_eq!(connect_requests(&after_acks), vec![(B, A)]);
        assert!(after_acks.iter().any(|action| matches!(
            action,
            GroupAction::JoinAckComplete { member_id, result: ErrorType::Ok, .. } if *member_id == B
        )));
        assert_eq!(coordinator.pair_info(A, B).unwrap().phase, PairPhase::Connecting);

        let connected = coordinator.on_p2p_connected(B, A);
        assert_eq!(
            connected,
            vec![GroupAction::FullyConnected {
                group_id: G1,
                members: vec![A, B]
            }]
        );
        // the acceptor reports too, but the event is not repeated
        assert!(coordinator.on_p2p_connected(A, B).is_empty());
    }

    #[test]
    fn dup_count_tracks_groups_containing_both_members() {
        let now = Instant::now();
        let mut coordinator = coordinator();
        let _ = coordinator
            .create_group(G1, &[A, B], Bytes::new(), now)
            .unwrap();
        let _ = coordinator
            .create_group(G2, &[A, B, C], Bytes::new(), now)
            .unwrap();
        assert_eq!(dup_count(&coordinator, A, B), 2);
        assert_eq!(dup_count(&coordinator, A, C), 1);

        let _ = coordinator.leave(G1, A).unwrap();
        assert_eq!(dup_count(&coordinator, A, B), 1);

        let actions = coordinator.destroy(G2).unwrap();
        assert!(actions.contains(&GroupAction::GroupRemoved { group_id: G2 }));
        assert_eq!(dup_count(&coordinator, A, B), 0);
        assert_eq!(dup_count(&coordinator, B, C), 0);
        assert!(coordinator.contains_group(G1));
        assert_eq!(coordinator.pending_acks(G2), 0);
    }

    #[test]
    fn departing_joiner_aborts_its_join() {
        let now = Instant::now();
        let mut coordinator = coordinator();
        let _ = coordinator.create_group(G1, &[A], Bytes::new(), now).unwrap();
        let _ = coordinator.join(G1, B, Bytes::new(), now).unwrap();

        let actions = coordinator.leave(G1, B).unwrap();
        assert!(actions.contains(&GroupAction::JoinAckComplete {
            group_id: G1,
            member_id: B,
            result: ErrorType::P2PGroupJoinAborted
        }));
        assert!(actions.contains(&GroupAction::MemberLeft {
            group_id: G1,
            member_id: B,
            member_count: 1
        }));
        assert_eq!(coordinator.pending_acks(G1), 1);
    }

    #[test]
    fn stale_ack_after_rejoin_is_ignored() {
        let now = Instant::now();
        let mut coordinator = coordinator();
        let _ = coordinator.create_group(G1, &[A], Bytes::new(), now).unwrap();
        let first = coordinator.join(G1, B, Bytes::new(), now).unwrap();
        let _ = coordinator.leave(G1, B).unwrap();
        let second = coordinator.join(G1, B, Bytes::new(), now).unwrap();

        // acks for the first membership change nothing
        assert!(ack_all(&mut coordinator, &first).is_empty());
        assert_eq!(coordinator.pending_acks(G1), 4);

        let after = ack_all(&mut coordinator, &second);
        assert_eq!(connect_requests(&after), vec![(B, A)]);
    }

    #[test]
    fn unanswered_acks_expire() {
        let now = Instant::now();
        let mut coordinator = coordinator();
        let _ = coordinator
            .create_group(G1, &[A, B], Bytes::new(), now)
            .unwrap();
        assert!(coordinator
            .expire_ack_waiters(now, Duration::from_secs(30))
            .is_empty());
        let expired = coordinator.expire_ack_waiters(now + Duration::from_secs(30), Duration::from_secs(30));
        assert_eq!(expired.len(), 2);
        assert!(expired.iter().all(|action| matches!(
            action,
            GroupAction::JoinAckComplete { result: ErrorType::P2PGroupJoinTimeout, .. }
        )));
        assert_eq!(coordinator.pending_acks(G1), 0);
    }

    #[test]
    fn last_leave_removes_the_group_unless_empty_groups_are_allowed() {
        let now = Instant::now();
        let mut coordinator = coordinator();
        let _ = coordinator.create_group(G1, &[A], Bytes::new(), now).unwrap();
        let actions = coordinator.leave(G1, A).unwrap();
        assert!(actions.contains(&GroupAction::GroupRemoved { group_id: G1 }));
        assert!(!coordinator.contains_group(G1));

        let mut keeps_empty = P2PGroupCoordinator::new(GroupPolicy {
            allow_empty: true,
            ..Default::default()
        });
        let _ = keeps_empty.create_group(G1, &[], Bytes::new(), now).unwrap();
        let _ = keeps_empty.join(G1, A, Bytes::new(), now).unwrap();
        let _ = keeps_empty.leave(G1, A).unwrap();
        assert!(keeps_empty.contains_group(G1));
        assert!(coordinator.create_group(G2, &[], Bytes::new(), now).is_err());
    }

    #[test]
    fn server_member_needs_no_ack_and_forms_no_pair() {
        let now = Instant::now();
        let mut coordinator = coordinator();
        let actions = coordinator
            .create_group(G1, &[HostId::SERVER, A], Bytes::new(), now)
            .unwrap();
        assert!(actions.contains(&GroupAction::JoinAckComplete {
            group_id: G1,
            member_id: HostId::SERVER,
            result: ErrorType::Ok
        }));
        assert!(coordinator.pair_info(HostId::SERVER, A).is_none());

        let mut strict = P2PGroupCoordinator::new(GroupPolicy::default());
        assert!(strict
            .create_group(G1, &[HostId::SERVER, A], Bytes::new(), now)
            .is_err());
    }

    #[test]
    fn removing_a_member_everywhere_purges_its_waiters() {
        let now = Instant::now();
        let mut coordinator = coordinator();
        let _ = coordinator
            .create_group(G1, &[A, B], Bytes::new(), now)
            .unwrap();
        let _ = coordinator
            .create_group(G2, &[A, C], Bytes::new(), now)
            .unwrap();

        let actions = coordinator.remove_member_everywhere(A);
        assert_eq!(coordinator.groups_of(A), Vec::<HostId>::new());
        assert_eq!(coordinator.pending_acks(G1), 1);
        assert_eq!(coordinator.pending_acks(G2), 1);
        assert_eq!(dup_count(&coordinator, A, B), 0);
        assert!(actions.contains(&GroupAction::JoinAckComplete {
            group_id: G1,
            member_id: A,
            result: ErrorType::P2PGroupJoinAborted
        }));
    }

    #[test]
    fn late_joiners_do_not_repeat_the_fully_connected_report() {
        let now = Instant::now();
        let mut coordinator = coordinator();
        let created = coordinator.create_group(G1, &[A, B], Bytes::new(), now).unwrap();
        let _ = ack_all(&mut coordinator, &created);
        assert_eq!(coordinator.on_p2p_connected(B, A).len(), 1);

        let joined = coordinator.join(G1, C, Bytes::new(), now).unwrap();
        let after_acks = ack_all(&mut coordinator, &joined);
        let mut requests = connect_requests(&after_acks);
        requests.sort();
        assert_eq!(requests, vec![(C, A), (C, B)]);

        assert!(coordinator.on_p2p_connected(C, A).is_empty());
        assert!(coordinator.on_p2p_connected(C, B).is_empty());
        assert_eq!(coordinator.pair_info(B, C).unwrap().phase, PairPhase::Connected);
    }
}
