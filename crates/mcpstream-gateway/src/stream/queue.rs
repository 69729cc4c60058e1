//! Delivery queue for a single connection
//!
//! Holds events between enqueue and flush and decides when a flush is due.
//! The queue is a plain data structure; the connection guards it with its
//! own lock and drives the timers.
//!
//! - **Backpressure**: at `batch_size * queue_ceiling_factor` entries the
//!   oldest events are shed, keeping the most recent `retention_ratio`
//!   share plus every error and cancel event, in their original order.
//!   Backpressure ends once depth falls below half the ceiling.
//! - **Adaptive batching**: see [`DeliveryQueue::plan`].

use mcpstream_core::{DeliveryTuning, StreamingEvent};
use std::collections::VecDeque;
use std::time::Duration;

/// What `push` did besides appending
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Events shed to make room
    pub dropped: usize,
    /// Backpressure switched on by this push
    pub engaged: bool,
}

/// When the next flush should happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPlan {
    Immediate,
    After(Duration),
}

#[derive(Debug)]
pub struct DeliveryQueue {
    entries: VecDeque<StreamingEvent>,
    batch_size: usize,
    batch_timeout: Duration,
    tuning: DeliveryTuning,
    backpressure: bool,
    flushing: bool,
    dropped: u64,
}

impl DeliveryQueue {
    pub fn new(batch_size: usize, batch_timeout: Duration, tuning: DeliveryTuning) -> Self {
        Self {
            entries: VecDeque::new(),
            batch_size,
            batch_timeout,
            tuning,
            backpressure: false,
            flushing: false,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Soft ceiling that triggers shedding
    pub fn ceiling(&self) -> usize {
        (self.batch_size * self.tuning.queue_ceiling_factor).max(1)
    }

    pub fn is_backpressure_engaged(&self) -> bool {
        self.backpressure
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Total events shed over the queue's lifetime
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Append an event, shedding old entries first if the ceiling is reached
    pub fn push(&mut self, event: StreamingEvent) -> PushOutcome {
        let mut outcome = PushOutcome::default();

        if self.entries.len() >= self.ceiling() {
            outcome.dropped = self.shed();
            if !self.backpressure {
                self.backpressure = true;
                outcome.engaged = true;
            }
        }

        self.entries.push_back(event);
        outcome
    }

    fn shed(&mut self) -> usize {
        let len = self.entries.len();
        let keep_recent = ((len as f64 * self.tuning.retention_ratio).floor() as usize)
            .max(1)
            .min(len);
        let cutoff = len - keep_recent;

        let mut index = 0;
        self.entries.retain(|event| {
            let keep = index >= cutoff || event.is_priority();
            index += 1;
            keep
        });

        let dropped = len - self.entries.len();
        self.dropped += dropped as u64;
        dropped
    }

    /// Decide when the queued events should be flushed
    ///
    /// - `batch_size <= 1`: every event is flushed immediately
    /// - depth at `emergency_factor * batch_size`: immediate, even mid-flush
    /// - depth at `batch_size` with no flush in progress: immediate
    /// - otherwise after the batch timeout, halved above `batch_size` and
    ///   quartered above `2 * batch_size`
    pub fn plan(&self) -> Option<FlushPlan> {
        let depth = self.entries.len();
        if depth == 0 {
            return None;
        }
        if self.batch_size <= 1 {
            return Some(FlushPlan::Immediate);
        }
        if depth >= self.batch_size * self.tuning.emergency_factor {
            return Some(FlushPlan::Immediate);
        }
        if !self.flushing && depth >= self.batch_size {
            return Some(FlushPlan::Immediate);
        }

        let timeout = if depth > self.batch_size * 2 {
            self.batch_timeout / 4
        } else if depth > self.batch_size {
            self.batch_timeout / 2
        } else {
            self.batch_timeout
        };
        Some(FlushPlan::After(timeout))
    }

    /// Mark a flush as started and return how many events it should cover
    pub fn begin_flush(&mut self) -> usize {
        self.flushing = true;
        self.entries.len()
    }

    pub fn end_flush(&mut self) {
        self.flushing = false;
    }

    /// Remove up to `max` events from the front
    ///
    /// Returns the events and whether backpressure was released by this take.
    pub fn take_chunk(&mut self, max: usize) -> (Vec<StreamingEvent>, bool) {
        let count = max.min(self.entries.len());
        let chunk: Vec<_> = self.entries.drain(..count).collect();

        let recovered = self.backpressure && self.entries.len() < self.ceiling() / 2;
        if recovered {
            self.backpressure = false;
        }
        (chunk, recovered)
    }

    /// Remove everything
    pub fn drain_all(&mut self) -> Vec<StreamingEvent> {
        let max = self.entries.len();
        self.take_chunk(max).0
    }
}
