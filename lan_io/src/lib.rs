//! Runtime plumbing shared by the engine crates: the tokio re-exports, `parking_lot` lock
//! aliases and the worker pools that host network I/O and user callbacks.
pub mod standard;

pub use standard::locks::*;
pub use standard::pool::{ThreadPoolSource, WorkerPool};

#[cfg(feature = "deadlock-detection")]
pub use parking_lot::deadlock;

pub use parking_lot::{const_mutex, const_rwlock};

pub use tokio;

pub use tokio_util;

pub use tokio_stream;
