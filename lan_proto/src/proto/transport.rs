//! One TCP connection and its two I/O tasks.
//!
//! Every [`Link`] owns an ordered send queue and a receive stream. Outbound messages are sealed
//! and framed under the link's own lock, so the crypto counter order always equals the order
//! in which frames reach the wire. The writer task flushes the queue whenever it is woken
//! ("conditional issue send"); the reader task extracts frames, peels their envelopes and hands
//! them to a [`LinkHandler`].
use crate::constants::{
    CODEC_BUFFER_CAPACITY, ENVELOPE_OVERHEAD, LINK_FLUSH_ON_CLOSE_TIMEOUT, MAX_SEND_BATCH_BYTES,
    RELAY_ENVELOPE_OVERHEAD,
};
use crate::error::NetworkError;
use crate::proto::codec::MessageCodec;
use crate::proto::message::Message;
use crate::proto::misc::use_count::{UseCount, UseGuard};
use crate::proto::security::{seal, unseal, SendOptions, Unsealed};
use crate::proto::send_queue::{LongTickReport, SendQueue};
use bytes::BytesMut;
use futures::StreamExt;
use lan_crypt::session_crypto::SessionCrypto;
use lan_io::tokio::io::AsyncWriteExt;
use lan_io::tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use lan_io::tokio::net::TcpStream;
use lan_io::tokio::runtime::Handle;
use lan_io::tokio::sync::Notify;
use lan_io::tokio::time::Instant;
use lan_io::tokio_util::codec::FramedRead;
use lan_io::tokio_util::sync::CancellationToken;
use lan_io::Mutex;
use lan_types::proto::EncryptMode;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Receives what the reader task of a link produces. Both methods run on the network pool and
/// must not block
pub(crate) trait LinkHandler: Send + Sync + 'static {
    /// Returning an error closes the link; the error becomes the close reason
    fn on_message(&self, link: &Link, message: Unsealed) -> Result<(), NetworkError>;
    /// Called exactly once, after the reader task has stopped
    fn on_closed(&self, link: &Link, reason: NetworkError);
}

#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    id: u64,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    max_message_length: AtomicUsize,
    state: Mutex<LinkState>,
    wake_writer: Notify,
    cancel: CancellationToken,
    use_count: UseCount,
    reader_done: AtomicBool,
    writer_done: AtomicBool,
}

struct LinkState {
    send_queue: SendQueue,
    crypto: Option<SessionCrypto>,
    last_recv: Instant,
}

/// The socket halves of a link that has not been started yet
pub(crate) struct LinkIo {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
}

impl Link {
    pub(crate) fn new(
        stream: TcpStream,
        max_message_length: usize,
        enable_nagle: bool,
    ) -> Result<(Link, LinkIo), NetworkError> {
        stream.set_nodelay(!enable_nagle)?;
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (read, write) = stream.into_split();

        let link = Link {
            inner: Arc::new(LinkInner {
                id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
                remote_addr,
                local_addr,
                max_message_length: AtomicUsize::new(max_message_length),
                state: Mutex::new(LinkState {
                    send_queue: SendQueue::default(),
                    crypto: None,
                    last_recv: Instant::now(),
                }),
                wake_writer: Notify::new(),
                cancel: CancellationToken::new(),
                use_count: UseCount::default(),
                reader_done: AtomicBool::new(false),
                writer_done: AtomicBool::new(false),
            }),
        };

        Ok((link, LinkIo { read, write }))
    }

    /// Spawns the reader and writer tasks onto `handle`. Each holds a use of the link until it
    /// finishes
    pub(crate) fn start<H: LinkHandler>(&self, io: LinkIo, handler: Arc<H>, handle: &Handle) {
        let reader_guard = self.inner.use_count.acquire();
        let writer_guard = self.inner.use_count.acquire();
        drop(handle.spawn(reader_task(
            self.clone(),
            io.read,
            handler,
            reader_guard,
        )));
        drop(handle.spawn(writer_task(self.inner.clone(), io.write, writer_guard)));
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn max_message_length(&self) -> usize {
        self.inner.max_message_length.load(Ordering::Relaxed)
    }

    /// Adopts the bound the remote end announced. Applies to both directions
    pub(crate) fn set_max_message_length(&self, max_message_length: usize) {
        self.inner
            .max_message_length
            .store(max_message_length, Ordering::Relaxed)
    }

    pub fn use_count(&self) -> &UseCount {
        &self.inner.use_count
    }

    pub(crate) fn acquire(&self) -> UseGuard {
        self.inner.use_count.acquire()
    }

    /// Seals, frames and queues `message`, then wakes the writer. Messages longer than the
    /// configured maximum are rejected here and never transmitted
    pub fn send(&self, message: &Message, options: SendOptions) -> Result<(), NetworkError> {
        let max = self.max_message_length();
        MessageCodec::new(max).check_length(message.len())?;
        self.enqueue(message, options)
    }

    /// Sends a relay envelope around a user message of `payload_len` bytes. The payload is held
    /// to the configured maximum; the envelope may exceed it by [`RELAY_ENVELOPE_OVERHEAD`]
    pub(crate) fn send_relay(
        &self,
        envelope: &Message,
        payload_len: usize,
        options: SendOptions,
    ) -> Result<(), NetworkError> {
        let max = self.max_message_length();
        MessageCodec::new(max).check_length(payload_len)?;
        MessageCodec::new(max + RELAY_ENVELOPE_OVERHEAD).check_length(envelope.len())?;
        self.enqueue(envelope, options)
    }

    fn enqueue(&self, message: &Message, options: SendOptions) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::SocketError(format!(
                "Link to {} is closed",
                self.inner.remote_addr
            )));
        }

        let max = self.max_message_length();
        let mut state = self.inner.state.lock();
        let sealed = seal(message, options, state.crypto.as_mut())?;
        let mut frame = BytesMut::new();
        codec_for(max).encode_frame(&sealed, &mut frame)?;
        let counted = options.encrypt != EncryptMode::None;
        state
            .send_queue
            .push(frame.freeze(), options.reliability, counted, Instant::now());
        drop(state);

        self.issue_send();
        Ok(())
    }

    /// Wakes the writer task. A no-op when a flush is already pending
    pub fn issue_send(&self) {
        self.inner.wake_writer.notify_one()
    }

    pub(crate) fn install_crypto(&self, crypto: SessionCrypto) {
        self.inner.state.lock().crypto = Some(crypto);
    }

    pub fn has_crypto(&self) -> bool {
        self.inner.state.lock().crypto.is_some()
    }

    /// When the last frame arrived
    pub fn last_recv(&self) -> Instant {
        self.inner.state.lock().last_recv
    }

    pub fn queued_bytes(&self) -> usize {
        self.inner.state.lock().send_queue.queued_bytes()
    }

    pub(crate) fn long_tick(&self, warning_capacity: usize) -> LongTickReport {
        self.inner
            .state
            .lock()
            .send_queue
            .long_tick(Instant::now(), warning_capacity)
    }

    /// Stops both I/O tasks. Frames already queued get a short window to reach the wire
    pub fn close(&self) {
        self.inner.cancel.cancel()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// True once neither I/O task is running
    pub fn io_finished(&self) -> bool {
        self.inner.reader_done.load(Ordering::Acquire)
            && self.inner.writer_done.load(Ordering::Acquire)
    }

    fn unseal(&self, frame: bytes::Bytes) -> Result<Unsealed, NetworkError> {
        let max = self.max_message_length();
        let mut state = self.inner.state.lock();
        state.last_recv = Instant::now();
        unseal(frame, state.crypto.as_mut(), max + RELAY_ENVELOPE_OVERHEAD)
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Link({}, {} -> {})",
            self.inner.id, self.inner.local_addr, self.inner.remote_addr
        )
    }
}

/// Frames carry a message, possibly inside a relay envelope, inside the security envelopes
fn frame_bound(max_message_length: usize) -> usize {
    max_message_length + RELAY_ENVELOPE_OVERHEAD + ENVELOPE_OVERHEAD
}

fn codec_for(max_message_length: usize) -> MessageCodec {
    MessageCodec::new(frame_bound(max_message_length))
}

async fn reader_task<H: LinkHandler>(
    link: Link,
    read: OwnedReadHalf,
    handler: Arc<H>,
    _guard: UseGuard,
) {
    let max = link.max_message_length();
    let mut framed = FramedRead::with_capacity(read, codec_for(max), CODEC_BUFFER_CAPACITY);

    let reason = loop {
        let max = link.max_message_length();
        if framed.decoder().max_message_length() != frame_bound(max) {
            *framed.decoder_mut() = codec_for(max);
        }

        let next = lan_io::tokio::select! {
            biased;
            _ = link.inner.cancel.cancelled() => break NetworkError::ProperShutdown,
            next = framed.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                let result = link
                    .unseal(frame)
                    .and_then(|message| handler.on_message(&link, message));
                if let Err(err) = result {
                    log::warn!(target: "lan", "Closing {link:?}: {err}");
                    break err;
                }
            }

            Some(Err(err)) => {
                log::warn!(target: "lan", "Inbound stream of {link:?} failed: {err}");
                break err;
            }

            None => {
                break NetworkError::SocketError(format!(
                    "Connection closed by {}",
                    link.remote_addr()
                ))
            }
        }
    };

    link.inner.cancel.cancel();
    handler.on_closed(&link, reason);
    link.inner.reader_done.store(true, Ordering::Release);
}

async fn writer_task(inner: Arc<LinkInner>, mut write: OwnedWriteHalf, _guard: UseGuard) {
    loop {
        lan_io::tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            _ = inner.wake_writer.notified() => {}
        }

        if let Err(err) = flush_queue(&inner, &mut write).await {
            log::trace!(target: "lan", "Write to {} failed: {err}", inner.remote_addr);
            inner.cancel.cancel();
            break;
        }
    }

    // a rejection notice or shutdown ack may still be queued
    if lan_io::tokio::time::timeout(LINK_FLUSH_ON_CLOSE_TIMEOUT, flush_queue(&inner, &mut write))
        .await
        .is_err()
    {
        log::trace!(target: "lan", "Discarding unflushed frames to {}", inner.remote_addr);
    }

    inner.state.lock().send_queue.clear();
    let _ = write.shutdown().await;
    inner.writer_done.store(true, Ordering::Release);
}

async fn flush_queue(inner: &LinkInner, write: &mut OwnedWriteHalf) -> std::io::Result<()> {
    loop {
        let batch = inner
            .state
            .lock()
            .send_queue
            .take_batch(MAX_SEND_BATCH_BYTES);
        match batch {
            Some(batch) => write.write_all(&batch).await?,
            None => return write.flush().await,
        }
    }
}
