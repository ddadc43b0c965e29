use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts the I/O tasks and queued callbacks that still reference a peer. A peer is only
/// destroyed once this reaches zero
#[derive(Clone, Default, Debug)]
pub struct UseCount {
    inner: Arc<AtomicUsize>,
}

/// Keeps a [`UseCount`] raised for as long as it lives
#[derive(Debug)]
pub struct UseGuard {
    inner: Arc<AtomicUsize>,
}

impl UseCount {
    pub fn acquire(&self) -> UseGuard {
        let _ = self.inner.fetch_add(1, Ordering::AcqRel);
        UseGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn get(&self) -> usize {
        self.inner.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.get() == 0
    }
}

impl Drop for UseGuard {
    fn drop(&mut self) {
        let _ = self.inner.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_release_on_drop() {
        let count = UseCount::default();
        assert!(count.is_idle());
        let first = count.acquire();
        let second = count.clone().acquire();
        assert_eq!(count.get(), 2);
        drop(first);
        assert_eq!(count.get(), 1);
        drop(second);
        assert!(count.is_idle());
    }

    #[test]
    fn guards_moved_across_threads() {
        let count = UseCount::default();
        let handles = (0..8)
            .map(|_| {
                let guard = count.acquire();
                std::thread::spawn(move || drop(guard))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(count.get(), 0);
    }
}
