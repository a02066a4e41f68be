//! Task control blocks and the central ready-queue table.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use unos_hal::TaskEntry;
use unos_trace::TraceKind;

use crate::sem::{SemId, Wake};
use crate::timer::TimerHandle;
use crate::{KernelCore, KernelError};

/// Task identifier; doubles as the index into the task table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

impl TaskId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Scheduling state of a task.
///
/// Tasks never terminate: once created they cycle between these three
/// states for the life of the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Queued in its priority level's ready queue
    Ready,
    /// Currently occupying the CPU slot
    Running,
    /// Parked in the wait queue of the given semaphore
    Blocked(SemId),
}

/// Per-task scheduling counters.
#[derive(Clone, Debug, Default)]
pub struct TaskMetrics {
    /// Times this task was given the CPU
    pub dispatches: u64,
    /// Clock ticks spent running
    pub ticks_run: u64,
    /// Times this task blocked on a semaphore
    pub blocks: u64,
    /// Times this task was made runnable by a signal or timeout
    pub wakeups: u64,
}

/// Parameters for a boot-time task.
pub struct TaskSpec<'a> {
    /// Unique task name; senders address this task's mailbox by it
    pub name: &'a str,
    /// Static priority level, 1 (highest precedence) through the
    /// configured number of levels
    pub priority: u8,
    /// Sub-priority scaling of the time slice: the task runs for
    /// `base_slice_ticks * slice_class` ticks per quantum
    pub slice_class: u8,
    /// Stack size in bytes, passed to the platform
    pub stack_size: usize,
    /// Entry function; tasks never return
    pub entry: TaskEntry,
    /// Opaque argument for `entry`
    pub arg: usize,
}

/// Task control block.
pub(crate) struct Tcb {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    /// Priority fixed at creation
    pub(crate) static_priority: u8,
    /// Current scheduling priority; raised by aging, reset on dispatch
    pub(crate) dynamic_priority: u8,
    pub(crate) slice_class: u8,
    pub(crate) state: TaskState,
    /// Ticks left in the current quantum; 0 means refill on next dispatch
    pub(crate) slice_left: u32,
    /// Scheduling passes spent blocked since the last promotion
    pub(crate) wait_rounds: u32,
    /// Index into the mailbox table, once `create_mbx` has run
    pub(crate) mailbox: Option<usize>,
    /// One-shot timer armed by a timed wait, cancelled on wake
    pub(crate) timeout_timer: Option<TimerHandle>,
    /// Whether the current block came from `rcv_mess`
    pub(crate) blocked_in_receive: bool,
    /// Completion handed to the task when it next runs
    pub(crate) wake: Option<Wake>,
    pub(crate) metrics: TaskMetrics,
}

/// The kernel's central scheduling table: the running-task slot plus one
/// FIFO ready queue per static priority level.
///
/// Invariant: at most one task occupies the running slot; every other
/// runnable task sits in exactly one ready queue, and every blocked task
/// in exactly one semaphore wait queue - never both.
pub(crate) struct CentralTable {
    pub(crate) running: Option<TaskId>,
    /// Ready queues; level `n` lives at index `n - 1`
    ready: Vec<VecDeque<TaskId>>,
}

impl CentralTable {
    pub(crate) fn new(levels: u8) -> Self {
        Self {
            running: None,
            ready: (0..levels).map(|_| VecDeque::new()).collect(),
        }
    }

    pub(crate) fn enqueue_tail(&mut self, level: u8, id: TaskId) {
        self.ready[level as usize - 1].push_back(id);
    }

    pub(crate) fn enqueue_head(&mut self, level: u8, id: TaskId) {
        self.ready[level as usize - 1].push_front(id);
    }

    pub(crate) fn remove(&mut self, level: u8, id: TaskId) -> bool {
        let queue = &mut self.ready[level as usize - 1];
        if let Some(pos) = queue.iter().position(|&t| t == id) {
            queue.remove(pos);
            true
        } else {
            false
        }
    }

    /// Lowest-numbered (highest-precedence) level with a queued task.
    pub(crate) fn highest_ready_level(&self) -> Option<u8> {
        self.ready
            .iter()
            .position(|q| !q.is_empty())
            .map(|i| i as u8 + 1)
    }

    /// Dequeue the head of the highest-precedence non-empty queue.
    pub(crate) fn pop_highest(&mut self) -> Option<TaskId> {
        let level = self.highest_ready_level()?;
        self.ready[level as usize - 1].pop_front()
    }
}

impl KernelCore {
    /// Add a task to the table and its priority's ready queue.
    ///
    /// Only valid before `start`: the task set is fixed at boot.
    pub(crate) fn create_task(
        &mut self,
        name: &str,
        priority: u8,
        slice_class: u8,
    ) -> Result<TaskId, KernelError> {
        if self.started {
            return Err(KernelError::AlreadyStarted);
        }
        if self.tasks.len() >= self.config.max_tasks {
            return Err(KernelError::TableFull);
        }
        if priority == 0 || priority > self.config.priority_levels {
            return Err(KernelError::InvalidPriority);
        }
        if slice_class == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if self.names.contains_key(name) {
            return Err(KernelError::DuplicateName);
        }

        let id = TaskId(self.tasks.len() as u32);
        self.tasks.push(Tcb {
            id,
            name: String::from(name),
            static_priority: priority,
            dynamic_priority: priority,
            slice_class,
            state: TaskState::Ready,
            slice_left: 0,
            wait_rounds: 0,
            mailbox: None,
            timeout_timer: None,
            blocked_in_receive: false,
            wake: None,
            metrics: TaskMetrics::default(),
        });
        self.names.insert(String::from(name), id);
        self.table.enqueue_tail(priority, id);
        self.trace.record(
            self.tick,
            TraceKind::TaskCreated {
                task: id.0,
                priority,
            },
        );
        Ok(id)
    }

    pub(crate) fn task_id_by_name(&self, name: &str) -> Option<TaskId> {
        self.names.get(name).copied()
    }
}
