use crate::constants::UNRELIABLE_FRAME_MAX_AGE;
use bytes::{Bytes, BytesMut};
use lan_io::tokio::time::Instant;
use lan_types::proto::MessageReliability;
use std::collections::VecDeque;

struct QueuedFrame {
    bytes: Bytes,
    /// Unreliable and not carrying a cipher counter. Dropping anything else would leave the
    /// receiver waiting for a frame that never comes
    droppable: bool,
    enqueued_at: Instant,
}

/// What a long tick did to a queue
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LongTickReport {
    pub dropped_frames: usize,
    pub dropped_bytes: usize,
    /// Still above the warning capacity after dropping what could be dropped
    pub over_capacity: bool,
}

/// Ordered, already-framed bytes waiting for the writer task of a link
#[derive(Default)]
pub struct SendQueue {
    frames: VecDeque<QueuedFrame>,
    queued_bytes: usize,
}

impl SendQueue {
    /// Queues `frame`. `counted` marks a frame that consumed a cipher counter
    pub fn push(
        &mut self,
        frame: Bytes,
        reliability: MessageReliability,
        counted: bool,
        now: Instant,
    ) {
        self.queued_bytes += frame.len();
        self.frames.push_back(QueuedFrame {
            bytes: frame,
            droppable: reliability == MessageReliability::Unreliable && !counted,
            enqueued_at: now,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Removes frames from the front, in order, until `max_bytes` would be exceeded. At least one
    /// frame is taken whenever the queue is non-empty
    pub fn take_batch(&mut self, max_bytes: usize) -> Option<BytesMut> {
        let first = self.frames.pop_front()?;
        self.queued_bytes -= first.bytes.len();
        let mut batch = BytesMut::from(first.bytes.as_ref());

        while let Some(next) = self.frames.front() {
            if batch.len() + next.bytes.len() > max_bytes {
                break;
            }
            if let Some(next) = self.frames.pop_front() {
                self.queued_bytes -= next.bytes.len();
                batch.extend_from_slice(&next.bytes);
            }
        }

        Some(batch)
    }

    /// Ages the queue. While it holds more than `warning_capacity` bytes, unreliable plaintext
    /// frames older than [`UNRELIABLE_FRAME_MAX_AGE`] are discarded. Encrypted frames always stay
    /// since the receiver checks their counters in sequence. An empty queue gives its memory back
    pub fn long_tick(&mut self, now: Instant, warning_capacity: usize) -> LongTickReport {
        let mut report = LongTickReport::default();

        if self.queued_bytes > warning_capacity {
            let before_frames = self.frames.len();
            let before_bytes = self.queued_bytes;
            self.frames.retain(|frame| {
                !frame.droppable
                    || now.saturating_duration_since(frame.enqueued_at) < UNRELIABLE_FRAME_MAX_AGE
            });
            self.queued_bytes = self.frames.iter().map(|frame| frame.bytes.len()).sum();
            report.dropped_frames = before_frames - self.frames.len();
            report.dropped_bytes = before_bytes - self.queued_bytes;
            report.over_capacity = self.queued_bytes > warning_capacity;
        }

        if self.frames.is_empty() {
            self.frames.shrink_to_fit();
        }

        report
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.queued_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn batches_preserve_order_and_respect_the_limit() {
        let now = Instant::now();
        let mut queue = SendQueue::default();
        for idx in 0..5u8 {
            queue.push(
                Bytes::from(vec![idx; 4]),
                MessageReliability::Reliable,
                false,
                now,
            );
        }

        let first = queue.take_batch(10).unwrap();
        assert_eq!(&first[..], &[0, 0, 0, 0, 1, 1, 1, 1]);
        assert_eq!(queue.queued_bytes(), 12);

        let rest = queue.take_batch(1024).unwrap();
        assert_eq!(rest.len(), 12);
        assert!(queue.take_batch(1024).is_none());
    }

    #[test]
    fn oversized_single_frame_is_still_sent() {
        let mut queue = SendQueue::default();
        queue.push(
            Bytes::from(vec![1u8; 100]),
            MessageReliability::Reliable,
            false,
            Instant::now(),
        );
        assert_eq!(queue.take_batch(10).unwrap().len(), 100);
    }

    #[test]
    fn long_tick_drops_only_stale_unreliable_frames_over_capacity() {
        let then = Instant::now();
        let later = then + UNRELIABLE_FRAME_MAX_AGE + Duration::from_millis(1);
        let mut queue = SendQueue::default();
        queue.push(Bytes::from(vec![0u8; 50]), MessageReliability::Unreliable, false, then);
        queue.push(Bytes::from(vec![0u8; 50]), MessageReliability::Reliable, false, then);
        queue.push(Bytes::from(vec![0u8; 50]), MessageReliability::Unreliable, false, later);

        // under capacity nothing is touched
        assert_eq!(queue.long_tick(later, 1000), LongTickReport::default());
        assert_eq!(queue.len(), 3);

        let report = queue.long_tick(later, 100);
        assert_eq!(report.dropped_frames, 1);
        assert_eq!(report.dropped_bytes, 50);
        assert!(!report.over_capacity);
        assert_eq!(queue.queued_bytes(), 100);
    }

    #[test]
    fn stale_encrypted_frames_are_kept() {
        let then = Instant::now();
        let later = then + UNRELIABLE_FRAME_MAX_AGE + Duration::from_millis(1);
        let mut queue = SendQueue::default();
        queue.push(Bytes::from(vec![1u8; 50]), MessageReliability::Unreliable, true, then);
        queue.push(Bytes::from(vec![2u8; 50]), MessageReliability::Unreliable, false, then);
        queue.push(Bytes::from(vec![3u8; 50]), MessageReliability::Unreliable, true, then);

        let report = queue.long_tick(later, 0);
        assert_eq!(report.dropped_frames, 1);
        assert!(report.over_capacity);

        let batch = queue.take_batch(1024).unwrap();
        assert_eq!(&batch[..50], &[1u8; 50]);
        assert_eq!(&batch[50..], &[3u8; 50]);
    }
}
