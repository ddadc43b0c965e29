//! Timed work of a node (heartbeat, long tick, ping), driven by a [`DelayQueue`].
//!
//! Every entry is a function of the node state. Periodic entries are re-armed according to the
//! [`TimerResult`] they return; the queue finishes once the node state is dropped or an entry
//! returns [`TimerResult::EndSession`].
use crate::error::NetworkError;
use futures::Stream;
use lan_io::tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use lan_io::tokio_util::time::{delay_queue, DelayQueue};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

/// Indices below this value are reserved for the node's own periodic work
pub const TIMER_RESERVED_INDEX: usize = 10;

pub trait TimerFunction<C>: Fn(&Arc<C>) -> TimerResult + Send + 'static {}

impl<C, T: Fn(&Arc<C>) -> TimerResult + Send + 'static> TimerFunction<C> for T {}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TimerTicket {
    Oneshot(usize),
    Periodic(usize),
}

pub enum TimerResult {
    /// Remove the entry
    Complete,
    /// Run again after the same period
    Incomplete,
    /// Stop the whole queue
    EndSession,
    AdjustPeriodicity(Duration),
}

type ChannelInner<C> = (TimerTicket, Duration, Box<dyn TimerFunction<C>>);

#[allow(clippy::type_complexity)]
pub struct TimerQueue<C> {
    entries: HashMap<TimerTicket, (Box<dyn TimerFunction<C>>, delay_queue::Key, Duration)>,
    expirations: DelayQueue<TimerTicket>,
    state: Weak<C>,
    rx: UnboundedReceiver<ChannelInner<C>>,
}

pub struct TimerQueueHandle<C> {
    tx: UnboundedSender<ChannelInner<C>>,
    rolling_idx: Arc<AtomicUsize>,
}

impl<C> Clone for TimerQueueHandle<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rolling_idx: self.rolling_idx.clone(),
        }
    }
}

impl<C: Send + Sync + 'static> TimerQueueHandle<C> {
    pub fn insert_periodic(
        &self,
        idx: usize,
        period: Duration,
        on_tick: impl Fn(&Arc<C>) -> TimerResult + Send + 'static,
    ) {
        let _ = self
            .tx
            .send((TimerTicket::Periodic(idx), period, Box::new(on_tick)));
    }

    /// Runs `on_call` once after `call_in`
    pub fn insert_oneshot(&self, call_in: Duration, on_call: impl Fn(&Arc<C>) + Send + 'static) {
        let idx = TIMER_RESERVED_INDEX + self.rolling_idx.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send((
            TimerTicket::Oneshot(idx),
            call_in,
            Box::new(move |state: &Arc<C>| {
                (on_call)(state);
                TimerResult::Complete
            }),
        ));
    }
}

impl<C: Send + Sync + 'static> TimerQueue<C> {
    pub fn new(state: Weak<C>) -> (Self, TimerQueueHandle<C>) {
        let (tx, rx) = lan_io::tokio::sync::mpsc::unbounded_channel();
        let handle = TimerQueueHandle {
            tx,
            rolling_idx: Arc::new(AtomicUsize::new(0)),
        };
        (
            Self {
                entries: HashMap::new(),
                expirations: DelayQueue::new(),
                state,
                rx,
            },
            handle,
        )
    }

    fn insert(
        &mut self,
        ticket: TimerTicket,
        timeout: Duration,
        on_timeout: Box<dyn TimerFunction<C>>,
    ) {
        let key = self.expirations.insert(ticket, timeout);

        if let Some((_, old_key, _)) = self.entries.insert(ticket, (on_timeout, key, timeout)) {
            log::warn!(target: "lan", "Overwrote timer entry {ticket:?}");
            let _ = self.expirations.try_remove(&old_key);
        }
    }

    fn poll_purge(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let TimerQueue {
            entries,
            expirations,
            state,
            ..
        } = self;

        while let Some(expired) = futures::ready!(expirations.poll_expired(cx)) {
            let Some(state) = state.upgrade() else {
                return Poll::Ready(());
            };

            let ticket = expired.into_inner();
            match ticket {
                TimerTicket::Oneshot(_) => {
                    if let Some((fx, _, _)) = entries.remove(&ticket) {
                        if let TimerResult::EndSession = (fx)(&state) {
                            return Poll::Ready(());
                        }
                    }
                }

                TimerTicket::Periodic(_) => {
                    let Some((fx, _, period)) = entries.get(&ticket) else {
                        continue;
                    };
                    let period = *period;

                    let next_key = match fx(&state) {
                        TimerResult::Complete => {
                            let _ = entries.remove(&ticket);
                            continue;
                        }
                        TimerResult::EndSession => return Poll::Ready(()),
                        TimerResult::AdjustPeriodicity(new_period) => {
                            expirations.insert(ticket, new_period)
                        }
                        TimerResult::Incomplete => expirations.insert(ticket, period),
                    };

                    if let Some((_, key, _)) = entries.get_mut(&ticket) {
                        *key = next_key;
                    }
                }
            }
        }

        // the queue is empty; stop only once the node is gone
        if self.state.strong_count() == 0 {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl<C: Send + Sync + 'static> Stream for TimerQueue<C> {
    type Item = ();

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        while let Poll::Ready(Some((ticket, timeout, on_timeout))) = this.rx.poll_recv(cx) {
            this.insert(ticket, timeout, on_timeout);
        }

        match this.poll_purge(cx) {
            Poll::Ready(()) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<C: Send + Sync + 'static> Future for TimerQueue<C> {
    type Output = Result<(), NetworkError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match futures::ready!(self.as_mut().poll_next(cx)) {
            Some(_) => Poll::Pending,
            None => Poll::Ready(Ok(())),
        }
    }
}
