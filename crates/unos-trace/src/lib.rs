//! Kernel event log
//!
//! Records scheduler dispatches, blocks/wakes, timer expiries and mailbox
//! traffic for post-incident analysis of the controller. The log is an
//! append-only capped ring with monotonic ids; it is owned by the kernel
//! object and never touches the platform.
//!
//! Events carry raw numeric ids (task, semaphore, timer indices) so this
//! crate stays independent of the kernel's typed handles.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

/// Monotonic event id.
pub type EventId = u64;

/// One recorded kernel event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// Kernel tick at which the event was recorded
    pub tick: u64,
    /// What happened
    pub kind: TraceKind,
}

/// Kind of kernel event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceKind {
    /// A task entered the task table
    TaskCreated { task: u32, priority: u8 },
    /// The dispatcher switched tasks (reason codes from the kernel entry)
    Dispatch {
        reason: u8,
        from: Option<u32>,
        to: u32,
    },
    /// A task blocked on a semaphore
    Blocked { task: u32, sem: u32 },
    /// A blocked task was made runnable again
    Woken { task: u32, sem: u32, timeout: bool },
    /// A waiter's dynamic priority was promoted by aging
    Promoted { task: u32, level: u8 },
    /// A task's static priority was changed
    PriorityChanged { task: u32, from: u8, to: u8 },
    /// A software timer expired
    TimerExpired { timer: u32, repeating: bool },
    /// A message was queued into a mailbox
    MessageSent { from: Option<u32>, to: u32, len: u32 },
    /// A message was taken out of a mailbox
    MessageReceived { task: u32, len: u32 },
    /// A send was rejected because the destination ring was full
    MessageRejected { to: u32 },
}

/// Default maximum number of events to keep in memory
pub const DEFAULT_CAPACITY: usize = 4096;

/// Append-only capped event log.
pub struct TraceLog {
    events: Vec<TraceEvent>,
    next_id: EventId,
    capacity: usize,
}

impl TraceLog {
    /// Create a log with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a log that keeps at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            next_id: 0,
            capacity: capacity.max(1),
        }
    }

    /// Append an event, returning its id.
    pub fn record(&mut self, tick: u64, kind: TraceKind) -> EventId {
        let id = self.next_id;
        self.next_id += 1;

        self.events.push(TraceEvent { id, tick, kind });
        self.trim_if_needed();
        id
    }

    /// All retained events, oldest first.
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// The most recent `count` events, newest first.
    pub fn recent(&self, count: usize) -> Vec<&TraceEvent> {
        self.events.iter().rev().take(count).collect()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the log holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The id the next recorded event will receive.
    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    /// Drop the oldest events once over capacity.
    fn trim_if_needed(&mut self) {
        if self.events.len() > self.capacity {
            let drain_count = self.events.len() - self.capacity;
            self.events.drain(0..drain_count);
        }
    }
}

impl Default for TraceLog {
    fn default() -> Self {
        Self::new()
    }
}
