//! The queue feeding user callbacks.
//!
//! Work is appended to a FIFO per [`TaskSubject`]. A subject is scheduled at most once at a
//! time, so its next task only starts after the previous callback returned. Callbacks run on
//! the blocking threads of the user pool; a panic is caught at this boundary and handed to the
//! exception handler instead of unwinding into the engine.
use lan_io::tokio::runtime::Handle;
use lan_io::tokio::sync::Notify;
use lan_io::tokio_util::sync::CancellationToken;
use lan_io::Mutex;
use lan_types::proto::HostId;
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub enum TaskSubject {
    /// Work concerning the node itself (e.g., group events)
    Local,
    Peer(HostId),
    /// A connection that has not been assigned a host id yet
    Candidate(u64),
}

impl Debug for TaskSubject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "Local"),
            Self::Peer(host_id) => write!(f, "Peer({host_id})"),
            Self::Candidate(link_id) => write!(f, "Candidate({link_id})"),
        }
    }
}

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub type ExceptionHandler = Arc<dyn Fn(TaskSubject, String) + Send + Sync + 'static>;

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<TaskQueueInner>,
}

struct TaskQueueInner {
    state: Mutex<TaskQueueState>,
    notify: Notify,
    cancel: CancellationToken,
    on_exception: ExceptionHandler,
}

#[derive(Default)]
struct TaskQueueState {
    pending: HashMap<TaskSubject, VecDeque<Task>>,
    /// Subjects with work whose previous task is not running
    ready: VecDeque<TaskSubject>,
    /// Subjects that are either ready or running
    scheduled: HashSet<TaskSubject>,
    running: HashSet<TaskSubject>,
    closed: bool,
}

impl TaskQueue {
    pub fn new(on_exception: ExceptionHandler) -> Self {
        Self {
            inner: Arc::new(TaskQueueInner {
                state: Mutex::new(TaskQueueState::default()),
                notify: Notify::new(),
                cancel: CancellationToken::new(),
                on_exception,
            }),
        }
    }

    /// Spawns `workers` workers onto `handle`. At most that many callbacks run at once
    pub fn start(&self, handle: &Handle, workers: usize) {
        for _ in 0..workers.max(1) {
            let this = self.clone();
            let handle_inner = handle.clone();
            let _ = handle.spawn(async move { this.worker(handle_inner).await });
        }
    }

    /// Appends `task` to the FIFO of `subject`. Returns `false` once the queue is closed
    pub fn push(&self, subject: TaskSubject, task: impl FnOnce() + Send + 'static) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return false;
            }

            state
                .pending
                .entry(subject)
                .or_default()
                .push_back(Box::new(task));

            if state.scheduled.insert(subject) {
                state.ready.push_back(subject);
            } else {
                return true;
            }
        }

        self.inner.notify.notify_one();
        true
    }

    /// No task for `subject` is queued or running
    pub fn is_idle(&self, subject: TaskSubject) -> bool {
        !self.inner.state.lock().scheduled.contains(&subject)
    }

    /// Nothing is queued or running at all
    pub fn is_drained(&self) -> bool {
        self.inner.state.lock().scheduled.is_empty()
    }

    /// Refuses new work. Queued tasks still run
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
    }

    /// Stops the workers. Tasks that have not started are dropped
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.pending.clear();
            state.ready.clear();
            let TaskQueueState {
                scheduled, running, ..
            } = &mut *state;
            scheduled.retain(|subject| running.contains(subject));
        }
        self.inner.cancel.cancel();
    }

    async fn worker(self, handle: Handle) {
        loop {
            let next = {
                let mut state = self.inner.state.lock();
                let next = state.ready.pop_front().and_then(|subject| {
                    state
                        .pending
                        .get_mut(&subject)
                        .and_then(|fifo| fifo.pop_front())
                        .map(|task| (subject, task))
                });
                if let Some((subject, _)) = &next {
                    let _ = state.running.insert(*subject);
                }
                next
            };

            let Some((subject, task)) = next else {
                lan_io::tokio::select! {
                    _ = self.inner.notify.notified() => {}
                    _ = self.inner.cancel.cancelled() => return,
                }
                continue;
            };

            if let Err(err) = handle.spawn_blocking(task).await {
                if err.is_panic() {
                    let reason = panic_message(err.into_panic());
                    log::warn!(target: "lan", "User callback for {subject:?} panicked: {reason}");
                    self.report_exception(&handle, subject, reason).await;
                }
            }

            let rescheduled = {
                let mut state = self.inner.state.lock();
                let _ = state.running.remove(&subject);
                let more = state
                    .pending
                    .get(&subject)
                    .map(|fifo| !fifo.is_empty())
                    .unwrap_or(false);
                if more {
                    state.ready.push_back(subject);
                } else {
                    let _ = state.pending.remove(&subject);
                    let _ = state.scheduled.remove(&subject);
                }
                more
            };

            if rescheduled {
                self.inner.notify.notify_one();
            }
        }
    }

    async fn report_exception(&self, handle: &Handle, subject: TaskSubject, reason: String) {
        let on_exception = self.inner.on_exception.clone();
        if let Err(err) = handle
            .spawn_blocking(move || (on_exception)(subject, reason))
            .await
        {
            log::error!(target: "lan", "Exception handler failed: {err:?}");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn queue_with_exceptions() -> (TaskQueue, Arc<Mutex<Vec<(TaskSubject, String)>>>) {
        let exceptions = Arc::new(Mutex::new(Vec::new()));
        let sink = exceptions.clone();
        let queue = TaskQueue::new(Arc::new(move |subject, reason| {
            sink.lock().push((subject, reason));
        }));
        (queue, exceptions)
    }

    async fn wait_drained(queue: &TaskQueue) {
        while !queue.is_drained() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_task_per_subject_in_arrival_order() {
        lan_logging::setup_test_log();
        let (queue, _) = queue_with_exceptions();
        queue.start(&Handle::current(), 4);

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            let order = order.clone();
            assert!(queue.push(TaskSubject::Peer(HostId(2)), move || {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = max_in_flight.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
                order.lock().push(i);
                let _ = in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        wait_drained(&queue).await;
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
        assert!(queue.is_idle(TaskSubject::Peer(HostId(2))));
        queue.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_subjects_run_concurrently() {
        let (queue, _) = queue_with_exceptions();
        queue.start(&Handle::current(), 2);

        let barrier = Arc::new(std::sync::Barrier::new(2));
        for subject in [TaskSubject::Peer(HostId(2)), TaskSubject::Local] {
            let barrier = barrier.clone();
            let _ = queue.push(subject, move || {
                let _ = barrier.wait();
            });
        }

        tokio::time::timeout(Duration::from_secs(5), wait_drained(&queue))
            .await
            .unwrap();
        queue.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panics_are_reported_and_the_subject_keeps_running() {
        lan_logging::setup_test_log();
        let (queue, exceptions) = queue_with_exceptions();
        queue.start(&Handle::current(), 1);

        let ran_after = Arc::new(AtomicUsize::new(0));
        let subject = TaskSubject::Candidate(7);
        let _ = queue.push(subject, || panic!("handler exploded"));
        let counter = ran_after.clone();
        let _ = queue.push(subject, move || {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        });

        wait_drained(&queue).await;
        assert_eq!(ran_after.load(Ordering::SeqCst), 1);
        assert_eq!(
            *exceptions.lock(),
            vec![(subject, "handler exploded".to_string())]
        );
        queue.shutdown();
    }

    #[test]
    fn closed_queue_refuses_work() {
        let (queue, _) = queue_with_exceptions();
        assert!(queue.push(TaskSubject::Local, || {}));
        assert!(!queue.is_idle(TaskSubject::Local));
        queue.close();
        assert!(!queue.push(TaskSubject::Local, || {}));
        queue.shutdown();
        assert!(queue.is_drained());
    }
}
