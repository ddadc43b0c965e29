//! The server's authoritative tables: candidates, admitted clients, groups and pairs, plus the
//! host id allocator they all draw from. One lock guards the whole registry; a link's own lock
//! is never taken while it is held.
use crate::error::NetworkError;
use crate::proto::destination::Destination;
use crate::proto::host_id::HostIdFactory;
use crate::proto::p2p_group::{GroupAction, GroupPolicy, P2PGroupCoordinator};
use crate::proto::peer::{PeerState, RemoteClient};
use crate::proto::task_queue::TaskQueue;
use bytes::Bytes;
use lan_io::tokio::time::Instant;
use lan_types::proto::{HostId, ServerSettings};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct ServerRegistry {
    candidates: HashMap<u64, Arc<RemoteClient>>,
    /// Admitted clients, including those being disposed
    clients: HashMap<HostId, Arc<RemoteClient>>,
    pub groups: P2PGroupCoordinator,
    host_ids: HostIdFactory,
}

impl ServerRegistry {
    pub fn new(settings: &ServerSettings) -> Self {
        Self {
            candidates: HashMap::new(),
            clients: HashMap::new(),
            groups: P2PGroupCoordinator::new(GroupPolicy {
                allow_server_member: settings.allow_server_as_p2p_group_member,
                allow_empty: settings.allow_empty_p2p_group,
                pairwise_keys: settings
                    .enable_p2p_encryption
                    .then_some((settings.strong_key_length, settings.weak_key_length)),
            }),
            host_ids: HostIdFactory::new(
                settings.host_id_generation_policy,
                settings.host_id_recycle_delay,
            ),
        }
    }

    pub fn add_candidate(&mut self, client: Arc<RemoteClient>) {
        let _ = self.candidates.insert(client.link().id(), client);
    }

    pub fn candidate(&self, link_id: u64) -> Option<Arc<RemoteClient>> {
        self.candidates.get(&link_id).cloned()
    }

    /// Admits the candidate on `link_id`, assigning its host id
    pub fn authenticate(&mut self, link_id: u64, now: Instant) -> Result<HostId, NetworkError> {
        let candidate = self
            .candidates
            .get(&link_id)
            .cloned()
            .ok_or(NetworkError::InvalidRequest("No such candidate"))?;
        if candidate.state() != PeerState::Candidate {
            return Err(NetworkError::InvalidRequest("Candidate is being disposed"));
        }

        let host_id = self
            .host_ids
            .create(now)
            .ok_or(NetworkError::InternalError("Host id space exhausted"))?;
        if !candidate.authenticate(host_id) {
            self.host_ids.release(host_id, now);
            return Err(NetworkError::InvalidRequest("Candidate already authenticated"));
        }

        let _ = self.candidates.remove(&link_id);
        let _ = self.clients.insert(host_id, candidate);
        Ok(host_id)
    }

    /// Finds an admitted client, even one that is being disposed
    pub fn lookup(&self, host_id: HostId) -> Option<Arc<RemoteClient>> {
        self.clients.get(&host_id).cloned()
    }

    /// Finds an admitted client that is not being disposed
    pub fn lookup_active(&self, host_id: HostId) -> Option<Arc<RemoteClient>> {
        self.lookup(host_id)
            .filter(|client| client.state() == PeerState::Authenticated)
    }

    pub fn active_host_ids(&self) -> Vec<HostId> {
        let mut ids = self
            .clients
            .iter()
            .filter(|(_, client)| client.state() == PeerState::Authenticated)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn classify(&self, host_id: HostId) -> Option<Destination> {
        if host_id.is_server() {
            Some(Destination::Local)
        } else if self.groups.contains_group(host_id) {
            Some(Destination::Group(host_id))
        } else if self.clients.contains_key(&host_id) {
            Some(Destination::Peer(host_id))
        } else {
            None
        }
    }

    /// Resolves `targets` to individual hosts (the server itself being [`Destination::Local`])
    pub fn resolve(&self, targets: &[HostId]) -> (Vec<Destination>, Vec<HostId>) {
        Destination::expand(
            targets,
            |id| self.classify(id),
            |group_id| {
                self.groups
                    .group_info(group_id)
                    .map(|info| info.members)
                    .unwrap_or_default()
            },
        )
    }

    pub fn create_group(
        &mut self,
        members: &[HostId],
        custom_field: Bytes,
        now: Instant,
    ) -> Result<(HostId, Vec<GroupAction>), NetworkError> {
        self.check_members(members)?;
        let group_id = self
            .host_ids
            .create(now)
            .ok_or(NetworkError::InternalError("Host id space exhausted"))?;

        match self.groups.create_group(group_id, members, custom_field, now) {
            Ok(actions) => Ok((group_id, self.absorb(actions, now))),
            Err(err) => {
                self.host_ids.release(group_id, now);
                Err(err)
            }
        }
    }

    pub fn join_group(
        &mut self,
        group_id: HostId,
        member: HostId,
        custom_field: Bytes,
        now: Instant,
    ) -> Result<Vec<GroupAction>, NetworkError> {
        self.check_members(&[member])?;
        let actions = self.groups.join(group_id, member, custom_field, now)?;
        Ok(self.absorb(actions, now))
    }

    pub fn leave_group(
        &mut self,
        group_id: HostId,
        member: HostId,
        now: Instant,
    ) -> Result<Vec<GroupAction>, NetworkError> {
        let actions = self.groups.leave(group_id, member)?;
        Ok(self.absorb(actions, now))
    }

    pub fn destroy_group(
        &mut self,
        group_id: HostId,
        now: Instant,
    ) -> Result<Vec<GroupAction>, NetworkError> {
        let actions = self.groups.destroy(group_id)?;
        Ok(self.absorb(actions, now))
    }

    /// Drops `host_id` from every group. Called as soon as its disposal is issued, so that no
    /// ack waiter outlives the peer
    pub fn leave_all_groups(&mut self, host_id: HostId, now: Instant) -> Vec<GroupAction> {
        let actions = self.groups.remove_member_everywhere(host_id);
        self.absorb(actions, now)
    }

    pub fn expire_ack_waiters(&mut self, now: Instant, timeout: Duration) -> Vec<GroupAction> {
        self.groups.expire_ack_waiters(now, timeout)
    }

    /// Every record (candidate or client) whose disposal was issued
    pub fn disposing(&self) -> Vec<Arc<RemoteClient>> {
        self.candidates
            .values()
            .chain(self.clients.values())
            .filter(|client| client.dispose_waiter().is_some())
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<RemoteClient>> {
        self.candidates
            .values()
            .chain(self.clients.values())
            .cloned()
            .collect()
    }

    /// Removes and returns every record that is safe to destroy. With `force`, every disposing
    /// record is removed regardless
    pub fn collect_disposed(
        &mut self,
        tasks: &TaskQueue,
        now: Instant,
        force_after: Duration,
    ) -> Vec<(Arc<RemoteClient>, bool)> {
        let mut removed = Vec::new();
        let ready = |client: &Arc<RemoteClient>| -> Option<bool> {
            let waiter = client.dispose_waiter()?;
            if client.is_safe_to_destroy(tasks) {
                Some(false)
            } else if now.saturating_duration_since(waiter.issued_at) >= force_after {
                Some(true)
            } else {
                None
            }
        };

        let candidates = self
            .candidates
            .iter()
            .filter_map(|(id, client)| ready(client).map(|forced| (*id, forced)))
            .collect::<Vec<_>>();
        for (id, forced) in candidates {
            if let Some(client) = self.candidates.remove(&id) {
                client.mark_disposed();
                removed.push((client, forced));
            }
        }

        let clients = self
            .clients
            .iter()
            .filter_map(|(id, client)| ready(client).map(|forced| (*id, forced)))
            .collect::<Vec<_>>();
        for (id, forced) in clients {
            if let Some(client) = self.clients.remove(&id) {
                client.mark_disposed();
                self.host_ids.release(id, now);
                removed.push((client, forced));
            }
        }

        removed
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty() && self.clients.is_empty()
    }

    fn check_members(&self, members: &[HostId]) -> Result<(), NetworkError> {
        for member in members {
            if !member.is_server() && self.lookup_active(*member).is_none() {
                return Err(NetworkError::UnknownHost(*member));
            }
        }
        Ok(())
    }

    /// Returns the ids of removed groups to the allocator
    fn absorb(&mut self, actions: Vec<GroupAction>, now: Instant) -> Vec<GroupAction> {
        for action in &actions {
            if let GroupAction::GroupRemoved { group_id } = action {
                self.host_ids.release(*group_id, now);
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::security::Unsealed;
    use crate::proto::transport::{Link, LinkHandler};
    use lan_io::tokio::net::{TcpListener, TcpStream};
    use lan_io::tokio::runtime::Handle;
    use lan_types::errors::ErrorType;

    struct Ignore;

    impl LinkHandler for Ignore {
        fn on_message(&self, _link: &Link, _message: Unsealed) -> Result<(), NetworkError> {
            Ok(())
        }

        fn on_closed(&self, _link: &Link, _reason: NetworkError) {}
    }

    async fn candidate(listener: &TcpListener) -> (Arc<RemoteClient>, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let (remote, accepted) = lan_io::tokio::join!(TcpStream::connect(addr), listener.accept());
        let (link, io) = Link::new(accepted.unwrap().0, 1024, false).unwrap();
        link.start(io, Arc::new(Ignore), &Handle::current());
        (
            Arc::new(RemoteClient::new(link, Instant::now())),
            remote.unwrap(),
        )
    }

    #[tokio::test]
    async fn authentication_assigns_distinct_ids() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut registry = ServerRegistry::new(&ServerSettings::default());
        let (a, _ra) = candidate(&listener).await;
        let (b, _rb) = candidate(&listener).await;
        registry.add_candidate(a.clone());
        registry.add_candidate(b.clone());

        let now = Instant::now();
        let id_a = registry.authenticate(a.link().id(), now).unwrap();
        let id_b = registry.authenticate(b.link().id(), now).unwrap();
        assert_ne!(id_a, id_b);
        assert!(registry.authenticate(a.link().id(), now).is_err());
        assert_eq!(registry.active_host_ids(), vec![id_a.min(id_b), id_a.max(id_b)]);
        assert_eq!(registry.classify(id_a), Some(Destination::Peer(id_a)));
        assert_eq!(registry.classify(HostId::SERVER), Some(Destination::Local));
    }

    #[tokio::test]
    async fn disposing_clients_stay_reachable_until_collected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut registry = ServerRegistry::new(&ServerSettings::default());
        let tasks = TaskQueue::new(Arc::new(|_, _| {}));
        let (a, _ra) = candidate(&listener).await;
        registry.add_candidate(a.clone());
        let id = registry.authenticate(a.link().id(), Instant::now()).unwrap();

        assert!(a.request_dispose(ErrorType::DisconnectFromLocal, ErrorType::Ok, Bytes::new()));
        assert!(registry.lookup(id).is_some());
        assert!(registry.lookup_active(id).is_none());
        assert!(registry.active_host_ids().is_empty());

        let hold = a.link().acquire();
        while !a.link().io_finished() {
            lan_io::tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registry
            .collect_disposed(&tasks, Instant::now(), Duration::from_secs(60))
            .is_empty());

        drop(hold);
        while a.link().use_count().get() > 0 {
            lan_io::tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let removed = registry.collect_disposed(&tasks, Instant::now(), Duration::from_secs(60));
        assert_eq!(removed.len(), 1);
        assert!(!removed[0].1);
        assert_eq!(a.state(), PeerState::Disposed);
        assert!(registry.lookup(id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stuck_disposal_is_forced_after_the_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut registry = ServerRegistry::new(&ServerSettings::default());
        let tasks = TaskQueue::new(Arc::new(|_, _| {}));
        let (a, _ra) = candidate(&listener).await;
        registry.add_candidate(a.clone());
        let _hold = a.link().acquire();
        assert!(a.request_dispose(ErrorType::AuthenticationTimeout, ErrorType::Ok, Bytes::new()));

        let later = Instant::now() + Duration::from_secs(61);
        let removed = registry.collect_disposed(&tasks, later, Duration::from_secs(60));
        assert_eq!(removed.len(), 1);
        assert!(removed[0].1);
    }

    #[tokio::test]
    async fn groups_require_live_members_and_release_their_ids() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut registry = ServerRegistry::new(&ServerSettings::default());
        let (a, _ra) = candidate(&listener).await;
        registry.add_candidate(a.clone());
        let now = Instant::now();
        let id = registry.authenticate(a.link().id(), now).unwrap();

        assert!(registry
            .create_group(&[HostId(999)], Bytes::new(), now)
            .is_err());

        let (group_id, _) = registry.create_group(&[id], Bytes::new(), now).unwrap();
        assert_eq!(registry.classify(group_id), Some(Destination::Group(group_id)));
        let (resolved, unknown) = registry.resolve(&[group_id]);
        assert_eq!(resolved, vec![Destination::Peer(id)]);
        assert!(unknown.is_empty());

        let actions = registry.leave_all_groups(id, now);
        assert!(actions.contains(&GroupAction::GroupRemoved { group_id }));
        assert_eq!(registry.classify(group_id), None);
    }
}
