//! The delay scheduler.
//!
//! Every decoded input event is buffered as a packet with a randomly
//! sampled release time, then replayed to the compositor once that time
//! arrives. The sampling keeps release order equal to arrival order while
//! giving each packet as much timing randomness as ordering allows:
//!
//! ```text
//! lower      = min(max(prev_release - now, 0), max_delay)
//! delay      = uniform(lower, max_delay)
//! sched_time = now + delay
//! ```
//!
//! The `lower` clamp can never exceed `max_delay` (the previous packet's
//! delay was itself at most `max_delay`), so the interval is always valid,
//! release times are non-decreasing along the queue, and once the queue has
//! drained the full `[0, max_delay]` range is available again. Delays are
//! strictly additive: no event ever reaches the compositor earlier than it
//! would have unaltered.
//!
//! Pointer moves get one extra treatment: when a new move arrives while the
//! queue tail is an unreleased move, the tail's target is overwritten in
//! place instead of growing the queue. Intermediate positions would have
//! been visually overwritten anyway, and the reduced event rate is itself
//! part of the obfuscation. Device events never coalesce.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::trace;

use crate::util::Entropy;

/// Default maximum per-event delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: i64 = 100;

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The entropy source failed.
    #[error("could not read from the entropy source: {0}")]
    Entropy(#[from] std::io::Error),

    /// Release-time arithmetic left the representable range.
    #[error("scheduled release time overflowed")]
    TimeOverflow,
}

/// Payload of a buffered packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody<E> {
    /// An opaque decoded device event, replayed as-is at release.
    Device(E),
    /// An absolute pointer target in global coordinates.
    PointerMove {
        /// Target X in global space.
        x: i32,
        /// Target Y in global space.
        y: i32,
    },
}

/// A buffered input packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet<E> {
    /// The buffered payload.
    pub body: PacketBody<E>,
    /// Scheduled release time in clock milliseconds.
    pub sched_time: i64,
}

/// FIFO queue of delayed packets with non-decreasing release times.
#[derive(Debug)]
pub struct DelayQueue<E> {
    packets: VecDeque<Packet<E>>,
    prev_release: i64,
    max_delay: i64,
}

impl<E> DelayQueue<E> {
    /// Creates an empty queue with the given maximum delay (ms).
    pub fn new(max_delay: i64) -> Self {
        Self {
            packets: VecDeque::new(),
            prev_release: 0,
            max_delay,
        }
    }

    /// The delay interval a packet enqueued at `now` may be assigned.
    pub fn delay_bounds(&self, now: i64) -> (i64, i64) {
        let lower = (self.prev_release - now).max(0).min(self.max_delay);
        (lower, self.max_delay)
    }

    /// Samples a delay and appends a packet. Returns the release time.
    pub fn enqueue(
        &mut self,
        body: PacketBody<E>,
        now: i64,
        entropy: &mut Entropy,
    ) -> Result<i64, SchedulerError> {
        let (lower, upper) = self.delay_bounds(now);
        let delay = entropy.uniform(lower, upper)?;
        let sched_time = now.checked_add(delay).ok_or(SchedulerError::TimeOverflow)?;
        self.push(body, sched_time);
        Ok(sched_time)
    }

    /// Appends a packet with an explicit release time.
    ///
    /// The release time must not precede the current tail's; the delay
    /// bounds guarantee this for sampled delays, and the assertion holds in
    /// every build profile.
    pub fn push(&mut self, body: PacketBody<E>, sched_time: i64) {
        assert!(
            self.packets
                .back()
                .map_or(true, |tail| sched_time >= tail.sched_time),
            "release times must be non-decreasing"
        );
        trace!("[scheduler] packet scheduled for t={sched_time}");
        self.packets.push_back(Packet { body, sched_time });
        self.prev_release = sched_time;
    }

    /// Folds a new pointer target into an unreleased tail move, if any.
    ///
    /// Returns `true` when the tail absorbed the update and no new packet
    /// is needed. The tail keeps its release time.
    pub fn coalesce_pointer_move(&mut self, x: i32, y: i32) -> bool {
        match self.packets.back_mut() {
            Some(Packet {
                body: PacketBody::PointerMove { x: tx, y: ty },
                ..
            }) => {
                *tx = x;
                *ty = y;
                true
            }
            _ => false,
        }
    }

    /// Pops the head packet if its release time has arrived.
    pub fn pop_due(&mut self, now: i64) -> Option<Packet<E>> {
        if self.packets.front()?.sched_time <= now {
            self.packets.pop_front()
        } else {
            None
        }
    }

    /// Milliseconds until the head packet is due; `None` when empty.
    ///
    /// This is the poll deadline for the event loop: sleep exactly until
    /// the next release instead of busy-waiting.
    pub fn poll_deadline(&self, now: i64) -> Option<i64> {
        self.packets
            .front()
            .map(|head| (head.sched_time - now).max(0))
    }

    /// Removes every buffered device packet matching the predicate.
    ///
    /// Used when an input device is destroyed: its packets must never
    /// reach release. Removal cannot violate release-time ordering.
    pub fn drain_device(&mut self, mut predicate: impl FnMut(&E) -> bool) -> usize {
        let before = self.packets.len();
        self.packets.retain(|packet| match &packet.body {
            PacketBody::Device(event) => !predicate(event),
            PacketBody::PointerMove { .. } => true,
        });
        before - self.packets.len()
    }

    /// Number of buffered packets.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Iterates the buffered packets in release order.
    pub fn iter(&self) -> impl Iterator<Item = &Packet<E>> {
        self.packets.iter()
    }
}
