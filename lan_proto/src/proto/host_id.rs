use lan_io::tokio::time::Instant;
use lan_types::proto::{HostId, HostIdGenerationPolicy};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

/// Issues the ids of clients and groups, which share one namespace
pub struct HostIdFactory {
    policy: HostIdGenerationPolicy,
    recycle_delay: Duration,
    next: u32,
    released: VecDeque<(Instant, HostId)>,
    in_use: HashSet<HostId>,
}

impl HostIdFactory {
    pub fn new(policy: HostIdGenerationPolicy, recycle_delay: Duration) -> Self {
        Self {
            policy,
            recycle_delay,
            next: HostId::FIRST_ASSIGNABLE.0,
            released: VecDeque::new(),
            in_use: HashSet::new(),
        }
    }

    /// Returns `None` only when the id space is exhausted
    pub fn create(&mut self, now: Instant) -> Option<HostId> {
        if self.policy == HostIdGenerationPolicy::Recycle {
            if let Some((released_at, _)) = self.released.front() {
                if now.saturating_duration_since(*released_at) >= self.recycle_delay {
                    if let Some((_, id)) = self.released.pop_front() {
                        let _ = self.in_use.insert(id);
                        return Some(id);
                    }
                }
            }
        }

        let id = HostId(self.next);
        self.next = self.next.checked_add(1)?;
        let _ = self.in_use.insert(id);
        Some(id)
    }

    /// Gives `id` back. Under the recycle policy it becomes available again once the recycle
    /// delay has passed
    pub fn release(&mut self, id: HostId, now: Instant) {
        if !self.in_use.remove(&id) {
            log::warn!(target: "lan", "Released {id:?} which was not in use");
            return;
        }

        if self.policy == HostIdGenerationPolicy::Recycle {
            self.released.push_back((now, id));
        }
    }

    pub fn is_in_use(&self, id: HostId) -> bool {
        self.in_use.contains(&id)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_after_reserved_values() {
        let mut factory = HostIdFactory::new(HostIdGenerationPolicy::Recycle, Duration::ZERO);
        let now = Instant::now();
        let first = factory.create(now).unwrap();
        assert_eq!(first, HostId::FIRST_ASSIGNABLE);
        assert!(first.is_assignable());
        assert_ne!(factory.create(now).unwrap(), first);
    }

    #[test]
    fn recycled_ids_wait_for_the_delay() {
        let delay = Duration::from_secs(2);
        let mut factory = HostIdFactory::new(HostIdGenerationPolicy::Recycle, delay);
        let now = Instant::now();
        let a = factory.create(now).unwrap();
        factory.release(a, now);
        assert!(!factory.is_in_use(a));

        let b = factory.create(now + Duration::from_secs(1)).unwrap();
        assert_ne!(a, b);
        let c = factory.create(now + delay).unwrap();
        assert_eq!(a, c);
        assert_eq!(factory.in_use_count(), 2);
    }

    #[test]
    fn no_recycle_policy_never_reuses() {
        let mut factory = HostIdFactory::new(HostIdGenerationPolicy::NoRecycle, Duration::ZERO);
        let now = Instant::now();
        let a = factory.create(now).unwrap();
        factory.release(a, now);
        assert_ne!(factory.create(now).unwrap(), a);
    }

    #[test]
    fn double_release_is_ignored() {
        let mut factory = HostIdFactory::new(HostIdGenerationPolicy::Recycle, Duration::ZERO);
        let now = Instant::now();
        let a = factory.create(now).unwrap();
        factory.release(a, now);
        factory.release(a, now);
        let b = factory.create(now).unwrap();
        let c = factory.create(now).unwrap();
        assert_eq!(a, b);
        assert_ne!(b, c);
    }
}
