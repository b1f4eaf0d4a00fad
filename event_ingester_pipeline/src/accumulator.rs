//! In-memory batching of decoded events.

use std::{fmt::Display, num::NonZeroUsize, sync::Arc, time::Duration};

use event_ingester_queue::MessageRef;
use event_ingester_time::{Time, TimeProvider};

use crate::decoder::DecodedEvent;

/// When a pending batch should be flushed.
///
/// Any trigger that fires is sufficient, and none fires for an empty batch. Triggers are only
/// evaluated at the end of a poll cycle, so a batch may overshoot `max_events` or `max_bytes`
/// by up to one receive worth of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Flush after this many poll cycles that added at least one event
    pub cycles: NonZeroUsize,
    pub max_events: Option<NonZeroUsize>,
    /// Upper bound on the summed size of the message bodies in the batch
    pub max_bytes: Option<NonZeroUsize>,
    /// Upper bound on the time since the first event of the batch was added
    pub max_age: Option<Duration>,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            cycles: NonZeroUsize::MIN,
            max_events: None,
            max_bytes: None,
            max_age: None,
        }
    }
}

impl FlushPolicy {
    pub fn every_cycles(cycles: NonZeroUsize) -> Self {
        Self {
            cycles,
            ..Default::default()
        }
    }
}

/// The reason a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Cycles,
    MaxEvents,
    MaxBytes,
    MaxAge,
    /// Flushed regardless of the policy, e.g. when the poll loop stops
    Forced,
}

impl Display for FlushTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cycles => "cycles",
            Self::MaxEvents => "max_events",
            Self::MaxBytes => "max_bytes",
            Self::MaxAge => "max_age",
            Self::Forced => "forced",
        };
        f.write_str(s)
    }
}

/// A drained batch: events in arrival order and the refs of the messages they came from.
#[derive(Debug, Default)]
pub struct Batch {
    events: Vec<DecodedEvent>,
    refs: Vec<MessageRef>,
    n_bytes: usize,
}

impl Batch {
    pub fn events(&self) -> &[DecodedEvent] {
        &self.events
    }

    pub fn refs(&self) -> &[MessageRef] {
        &self.refs
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Summed size of the source message bodies
    pub fn n_bytes(&self) -> usize {
        self.n_bytes
    }

    pub fn into_parts(self) -> (Vec<DecodedEvent>, Vec<MessageRef>) {
        (self.events, self.refs)
    }
}

/// Collects events between flushes and decides when to flush them.
///
/// Owned by the poll loop; no internal synchronisation.
#[derive(Debug)]
pub struct BatchAccumulator {
    policy: FlushPolicy,
    time_provider: Arc<dyn TimeProvider>,

    batch: Batch,
    /// Completed poll cycles that added at least one event to the current batch
    non_empty_cycles: usize,
    added_this_cycle: bool,
    first_added_at: Option<Time>,
}

impl BatchAccumulator {
    pub fn new(policy: FlushPolicy, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            policy,
            time_provider,
            batch: Batch::default(),
            non_empty_cycles: 0,
            added_this_cycle: false,
            first_added_at: None,
        }
    }

    pub fn policy(&self) -> &FlushPolicy {
        &self.policy
    }

    pub fn add(&mut self, event: DecodedEvent, message_ref: MessageRef) {
        if self.first_added_at.is_none() {
            self.first_added_at = Some(self.time_provider.now());
        }
        self.added_this_cycle = true;
        self.batch.n_bytes += event.encoded_len();
        self.batch.events.push(event);
        self.batch.refs.push(message_ref);
    }

    /// Mark the end of a poll cycle.
    pub fn complete_cycle(&mut self) {
        if self.added_this_cycle {
            self.non_empty_cycles += 1;
        }
        self.added_this_cycle = false;
    }

    /// The first trigger that fires at `now`, if any.
    pub fn should_flush(&self, now: Time) -> Option<FlushTrigger> {
        if self.batch.is_empty() {
            return None;
        }

        let FlushPolicy {
            cycles,
            max_events,
            max_bytes,
            max_age,
        } = self.policy;

        if max_events.is_some_and(|max| self.batch.len() >= max.get()) {
            return Some(FlushTrigger::MaxEvents);
        }
        if max_bytes.is_some_and(|max| self.batch.n_bytes >= max.get()) {
            return Some(FlushTrigger::MaxBytes);
        }
        if let (Some(max_age), Some(first)) = (max_age, self.first_added_at) {
            // a clock that moved backwards counts as no age at all
            let age = now.checked_duration_since(first).unwrap_or_default();
            if age >= max_age {
                return Some(FlushTrigger::MaxAge);
            }
        }
        if self.non_empty_cycles >= cycles.get() {
            return Some(FlushTrigger::Cycles);
        }

        None
    }

    /// Take the pending batch, leaving the accumulator empty with its counters reset.
    pub fn drain(&mut self) -> Batch {
        self.non_empty_cycles = 0;
        self.added_this_cycle = false;
        self.first_added_at = None;
        std::mem::take(&mut self.batch)
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn n_bytes(&self) -> usize {
        self.batch.n_bytes
    }

    /// Non-empty cycles counted towards the cycle trigger so far.
    pub fn pending_cycles(&self) -> usize {
        self.non_empty_cycles
    }
}
