use std::fmt::{Debug, Formatter};
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

/// Where a worker pool gets its threads from. The engine runs two pools: one for socket I/O
/// and one for user callbacks. Either may be owned by the engine or supplied by the application
#[derive(Clone, Default)]
pub enum ThreadPoolSource {
    /// Use the tokio runtime that is current when the node starts
    #[default]
    Current,
    /// Build a dedicated multi-threaded runtime with the given number of workers
    Owned { worker_threads: usize },
    /// Use a runtime managed by the application
    External(Handle),
}

impl Debug for ThreadPoolSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Current => write!(f, "Current"),
            Self::Owned { worker_threads } => write!(f, "Owned({worker_threads})"),
            Self::External(_) => write!(f, "External"),
        }
    }
}

/// A live pool. Dropping an owned pool shuts its runtime down in the background, so it is safe
/// to drop from inside an async context
pub struct WorkerPool {
    handle: Handle,
    owned: Option<Runtime>,
}

impl WorkerPool {
    pub fn new(source: &ThreadPoolSource, thread_name: &str) -> std::io::Result<Self> {
        match source {
            ThreadPoolSource::Current => {
                let handle = Handle::try_current().map_err(|err| {
                    std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
                })?;
                Ok(Self {
                    handle,
                    owned: None,
                })
            }

            ThreadPoolSource::Owned { worker_threads } => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads((*worker_threads).max(1))
                    .thread_name(thread_name)
                    .enable_all()
                    .build()?;
                Ok(Self {
                    handle: runtime.handle().clone(),
                    owned: Some(runtime),
                })
            }

            ThreadPoolSource::External(handle) => Ok(Self {
                handle: handle.clone(),
                owned: None,
            }),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_owned(&self) -> bool {
        self.owned.is_some()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.owned.take() {
            runtime.shutdown_background();
        }
    }
}
