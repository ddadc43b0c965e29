//! Lock aliases. Every lock in the engine is a `parking_lot` lock: they are never held across an
//! `.await`, and never poison when a user callback panics on another thread.

/// Guards the peer registry and the per-link send state
pub type Mutex<T> = parking_lot::Mutex<T>;

pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

/// Guards read-mostly state such as the installed event handler and stub tables
pub type RwLock<T> = parking_lot::RwLock<T>;

pub type RwLockReadGuard<'a, T> = parking_lot::RwLockReadGuard<'a, T>;

pub type RwLockWriteGuard<'a, T> = parking_lot::RwLockWriteGuard<'a, T>;
