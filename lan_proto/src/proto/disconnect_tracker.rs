//! Guarantees a single terminal event per connection.
//!
//! A link to the server can be lost from several places at once (explicit disconnect, the
//! reader hitting EOF, the idle timeout), and so can a direct link to a peer. Every path asks
//! the tracker first; only the first one reports.
use crate::proto::misc::Ticket;
use lan_io::Mutex;
use lan_types::proto::HostId;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct DisconnectSignalTracker {
    inner: Arc<DisconnectSignalTrackerInner>,
}

#[derive(Default)]
struct DisconnectSignalTrackerInner {
    c2s_disconnected: Mutex<HashSet<Ticket>>,
    /// (connection ticket, peer) pairs whose direct link was reported lost
    p2p_disconnected: Mutex<HashSet<(Ticket, HostId)>>,
}

impl DisconnectSignalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the first report of the server connection identified by `ticket`
    pub fn try_c2s_disconnect(&self, ticket: Ticket) -> bool {
        self.inner.c2s_disconnected.lock().insert(ticket)
    }

    /// Returns `true` for the first report of the direct link to `peer`
    pub fn try_p2p_disconnect(&self, ticket: Ticket, peer: HostId) -> bool {
        self.inner.p2p_disconnected.lock().insert((ticket, peer))
    }

    /// A new direct link to `peer` was established, so its loss may be reported again
    pub fn clear_p2p(&self, ticket: Ticket, peer: HostId) {
        let _ = self.inner.p2p_disconnected.lock().remove(&(ticket, peer));
    }

    pub fn clear_session(&self, ticket: Ticket) {
        let _ = self.inner.c2s_disconnected.lock().remove(&ticket);
        self.inner
            .p2p_disconnected
            .lock()
            .retain(|(t, _)| *t != ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_disconnect_reported_once_per_connection() {
        let tracker = DisconnectSignalTracker::new();
        let first = Ticket::from(1u128);
        let second = Ticket::from(2u128);

        assert!(tracker.try_c2s_disconnect(first));
        assert!(!tracker.try_c2s_disconnect(first));
        // a reconnect gets a fresh ticket
        assert!(tracker.try_c2s_disconnect(second));
    }

    #[test]
    fn peer_loss_reported_once_until_relinked() {
        let tracker = DisconnectSignalTracker::new();
        let ticket = Ticket::from(7u128);

        assert!(tracker.try_p2p_disconnect(ticket, HostId(3)));
        assert!(tracker.try_p2p_disconnect(ticket, HostId(4)));
        assert!(!tracker.try_p2p_disconnect(ticket, HostId(3)));

        tracker.clear_p2p(ticket, HostId(3));
        assert!(tracker.try_p2p_disconnect(ticket, HostId(3)));
    }

    #[test]
    fn clones_share_state_and_clear_resets() {
        let tracker = DisconnectSignalTracker::new();
        let other = tracker.clone();
        let ticket = Ticket::from(9u128);

        assert!(tracker.try_c2s_disconnect(ticket));
        assert!(tracker.try_p2p_disconnect(ticket, HostId(5)));
        assert!(!other.try_c2s_disconnect(ticket));

        other.clear_session(ticket);
        assert!(tracker.try_c2s_disconnect(ticket));
        assert!(tracker.try_p2p_disconnect(ticket, HostId(5)));
    }
}
