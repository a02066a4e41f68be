//! UNOS Kernel Core
//!
//! The real-time kernel beneath the ground-station antenna controller.
//! This crate implements the core kernel functionality:
//! - Priority scheduling with time slicing and dynamic-priority aging
//! - Counting semaphores (SYNC and CRITICAL-SECTION semantics)
//! - Name-addressed mailbox IPC
//! - Software timers
//! - The pool-backed memory services
//!
//! All kernel state lives in one [`Kernel`] value, generic over the
//! [`Platform`] trait; there are no module-level statics. Every service
//! runs under an interrupt-disable bracket and every scheduling decision
//! funnels through the single kernel-entry dispatcher. The control loops,
//! protocol tasks and UI tasks of the controller are ordinary clients of
//! the services exported here.

#![no_std]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use unos_hal::InterruptGuard;
use unos_pool::Pool;
use unos_trace::TraceLog;

mod mailbox;
mod sched;
mod sem;
mod task;
mod timer;

pub use mailbox::{
    MailboxKind, MailboxMetrics, ReceivedMessage, RecvOutcome, RecvStatus,
};
pub use sched::EntryReason;
pub use sem::{SemId, SemKind, Wake, WaitOutcome, WaitStatus};
pub use task::{TaskId, TaskMetrics, TaskSpec, TaskState};
pub use timer::{TimerAction, TimerCallback, TimerHandle, TimerKind, TimerOps};

// Re-export the seam types clients touch directly
pub use unos_hal::{Platform, PlatformError, TaskEntry};
pub use unos_pool::{BlockRef, PoolError};
pub use unos_trace::{TraceEvent, TraceKind};

use mailbox::Mailbox;
use sched::{SignalContext, Switch};
use sem::Semaphore;
use task::{CentralTable, Tcb};
use timer::{TimerFire, TimerTable};

/// Kernel errors
///
/// Exhaustion of a fixed table or the pool is fatal only during boot-time
/// construction; at run time the expected failures are a timed wait
/// reporting a timeout and a send into a full mailbox ring. No failure
/// panics across the kernel boundary; everything is value-returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// A fixed kernel table has no free entries
    TableFull,
    /// Task id does not name a task
    NoSuchTask,
    /// Semaphore id does not name a semaphore
    NoSuchSemaphore,
    /// Timer handle does not name a live timer
    NoSuchTimer,
    /// Destination name is not a registered task
    UnknownTaskName,
    /// Task name already registered
    DuplicateName,
    /// The task has no mailbox
    NoMailbox,
    /// The task already owns a mailbox
    MailboxExists,
    /// Destination ring is full; the message was not queued
    MailboxFull,
    /// Message exceeds the mailbox's slot size
    MessageTooLong,
    /// Fixed-record mailbox requires exactly slot-sized messages
    MessageSizeMismatch,
    /// Caller does not own this critical-section semaphore
    NotOwner,
    /// The service needs a running task and the CPU slot is empty
    NoCurrentTask,
    /// The task set is frozen once the scheduler has started
    AlreadyStarted,
    /// No task is eligible to run
    NoRunnableTask,
    /// Priority outside the configured levels
    InvalidPriority,
    /// Malformed argument (zero ticks, zero capacity, value above max)
    InvalidArgument,
    /// Pool allocator failure
    Pool(PoolError),
    /// Platform failure
    Platform(PlatformError),
}

impl From<PoolError> for KernelError {
    fn from(e: PoolError) -> Self {
        KernelError::Pool(e)
    }
}

impl From<PlatformError> for KernelError {
    fn from(e: PlatformError) -> Self {
        KernelError::Platform(e)
    }
}

/// Kernel tuning knobs, fixed at construction.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KernelConfig {
    /// Number of static priority levels; 1 is the highest precedence
    pub priority_levels: u8,
    /// Clock ticks per quantum before scaling by a task's slice class
    pub base_slice_ticks: u32,
    /// Scheduling passes a blocked waiter sits out before its dynamic
    /// priority is promoted one level
    pub aging_rounds: u32,
    /// Capacity of the task table
    pub max_tasks: usize,
    /// Capacity of the semaphore table (each mailbox consumes two)
    pub max_semaphores: usize,
    /// Capacity of the mailbox table
    pub max_mailboxes: usize,
    /// Capacity of the timer arena
    pub max_timers: usize,
    /// Size of the kernel memory pool in bytes
    pub pool_bytes: usize,
    /// Events retained by the kernel trace ring
    pub trace_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            priority_levels: 8,
            base_slice_ticks: 10,
            aging_rounds: 8,
            max_tasks: 16,
            max_semaphores: 64,
            max_mailboxes: 16,
            max_timers: 32,
            pool_bytes: 32 * 1024,
            trace_capacity: 1024,
        }
    }
}

/// Kernel-wide counters.
#[derive(Clone, Debug, Default)]
pub struct KernelMetrics {
    /// Tasks dispatched since boot
    pub dispatches: u64,
    /// Dispatches that preempted a lower-priority runner
    pub preemptions: u64,
    /// Time-slice expiries
    pub slice_expiries: u64,
    /// Software-timer expiries
    pub timer_expiries: u64,
    /// Mailbox messages queued since boot
    pub messages_sent: u64,
}

/// Point-in-time view of the kernel's tables and counters.
#[derive(Clone, Debug)]
pub struct KernelSnapshot {
    /// Current clock tick
    pub tick: u64,
    pub task_count: usize,
    pub semaphore_count: usize,
    pub mailbox_count: usize,
    /// Timers currently armed
    pub active_timers: usize,
    /// Free allocation units left in the pool
    pub pool_free_units: usize,
    pub metrics: KernelMetrics,
}

// ============================================================================
// KernelCore - all mutable kernel state, no platform access
// ============================================================================

/// The kernel core holds every table and queue. Service methods return a
/// result plus an optional context-switch decision; the platform-facing
/// [`Kernel`] wrapper is what actually performs the switch, so the core
/// stays fully host-testable.
pub(crate) struct KernelCore {
    pub(crate) config: KernelConfig,
    pub(crate) tasks: Vec<Tcb>,
    /// Task-name registry backing mailbox addressing; filled at creation,
    /// so no name is hashed after boot
    pub(crate) names: BTreeMap<String, TaskId>,
    pub(crate) table: CentralTable,
    pub(crate) sems: Vec<Semaphore>,
    pub(crate) mailboxes: Vec<Mailbox>,
    pub(crate) timers: TimerTable,
    pub(crate) pool: Pool,
    pub(crate) trace: TraceLog,
    pub(crate) tick: u64,
    /// Reentrant task-switch lock depth
    pub(crate) switch_lock: u32,
    /// A deferred pass is owed at the next opportunity
    pub(crate) resched_pending: bool,
    pub(crate) started: bool,
    pub(crate) metrics: KernelMetrics,
}

impl KernelCore {
    fn new(mut config: KernelConfig) -> Self {
        config.priority_levels = config.priority_levels.max(1);
        let table = CentralTable::new(config.priority_levels);
        let pool = Pool::new(config.pool_bytes);
        let trace = TraceLog::with_capacity(config.trace_capacity);
        Self {
            config,
            tasks: Vec::new(),
            names: BTreeMap::new(),
            table,
            sems: Vec::new(),
            mailboxes: Vec::new(),
            timers: TimerTable::new(),
            pool,
            trace,
            tick: 0,
            switch_lock: 0,
            resched_pending: false,
            started: false,
            metrics: KernelMetrics::default(),
        }
    }
}

// ============================================================================
// Kernel - the platform-facing service surface
// ============================================================================

/// The kernel, generic over the platform implementation.
///
/// Owns the core state, the platform, and one saved execution context per
/// task. Every public service takes `&mut self`, runs under an
/// interrupt-disable bracket, and applies whatever context switch the
/// dispatcher decided on before returning.
pub struct Kernel<P: Platform> {
    core: KernelCore,
    platform: P,
    contexts: Vec<P::Context>,
}

impl<P: Platform> Kernel<P> {
    pub fn new(platform: P, config: KernelConfig) -> Self {
        Self {
            core: KernelCore::new(config),
            platform,
            contexts: Vec::new(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &KernelConfig {
        &self.core.config
    }

    // === Boot ===

    /// Create a task. Only valid before [`Kernel::start`]; the task set
    /// is fixed at boot and tasks never terminate.
    pub fn create_task(&mut self, spec: TaskSpec<'_>) -> Result<TaskId, KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        let context = self
            .platform
            .create_context(spec.stack_size, spec.entry, spec.arg)?;
        let id = self
            .core
            .create_task(spec.name, spec.priority, spec.slice_class)?;
        self.contexts.push(context);
        Ok(id)
    }

    /// Freeze the task set and dispatch the highest-priority task.
    pub fn start(&mut self) -> Result<TaskId, KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        if self.core.started {
            return Err(KernelError::AlreadyStarted);
        }
        self.core.started = true;
        match self.core.kernel_entry(EntryReason::TaskCreated) {
            Some(sw) => {
                self.platform.debug_write("unos: scheduler started");
                Self::dispatch(&self.platform, &mut self.contexts, sw);
                Ok(sw.to)
            }
            None => {
                self.core.started = false;
                Err(KernelError::NoRunnableTask)
            }
        }
    }

    // === Semaphores ===

    pub fn create_semaphore(&mut self, kind: SemKind) -> Result<SemId, KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        self.core.create_semaphore(kind)
    }

    pub fn init_semaphore(
        &mut self,
        id: SemId,
        initial: u32,
        max: u32,
    ) -> Result<(), KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        self.core.init_semaphore(id, initial, max)
    }

    /// Wait on a semaphore, blocking the running task while the count is
    /// exhausted.
    pub fn wait(&mut self, id: SemId) -> Result<WaitStatus, KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        let (res, sw) = self.core.wait(id);
        Self::finish_blocking(&self.platform, &mut self.contexts, &self.core, &res, sw);
        res
    }

    /// Wait with a deadline; the completion reports a timeout if no
    /// signal arrives within `ticks` clock ticks.
    pub fn timed_wait(&mut self, id: SemId, ticks: u32) -> Result<WaitStatus, KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        let (res, sw) = self.core.timed_wait(id, ticks);
        Self::finish_blocking(&self.platform, &mut self.contexts, &self.core, &res, sw);
        res
    }

    pub fn signal(&mut self, id: SemId) -> Result<(), KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        let (res, sw) = self.core.signal(id, SignalContext::Task);
        if let Some(sw) = sw {
            Self::dispatch(&self.platform, &mut self.contexts, sw);
        }
        res
    }

    /// Signal from an interrupt service routine: the wakeup is recorded
    /// and the scheduling pass deferred to the next preemption point.
    pub fn signal_from_isr(&mut self, id: SemId) -> Result<(), KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        let (res, _) = self.core.signal(id, SignalContext::Isr);
        res
    }

    /// Take the completion left for a task woken out of a blocking call.
    ///
    /// On a hardware target the resume path consumes this; tests and
    /// executors read it to learn how a wait or receive ended.
    pub fn take_wake(&mut self, task: TaskId) -> Option<Wake> {
        let _irq = InterruptGuard::new(&self.platform);
        self.core.tasks.get_mut(task.index())?.wake.take()
    }

    // === Mailboxes ===

    /// Bind a message ring to a task.
    pub fn create_mbx(
        &mut self,
        task: TaskId,
        kind: MailboxKind,
        capacity: usize,
        msg_size: usize,
    ) -> Result<(), KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        self.core.create_mbx(task, kind, capacity, msg_size)
    }

    /// Send to the named task's mailbox. Reports `MailboxFull` instead of
    /// blocking when the ring has no free slot.
    pub fn send_mess(&mut self, dest: &str, data: &[u8]) -> Result<(), KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        let task = self
            .core
            .task_id_by_name(dest)
            .ok_or(KernelError::UnknownTaskName)?;
        let (res, sw) = self.core.send_mess(task, data, SignalContext::Task);
        if let Some(sw) = sw {
            Self::dispatch(&self.platform, &mut self.contexts, sw);
        }
        res
    }

    /// Send addressed by task id rather than name.
    pub fn send_mess_to(&mut self, dest: TaskId, data: &[u8]) -> Result<(), KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        let (res, sw) = self.core.send_mess(dest, data, SignalContext::Task);
        if let Some(sw) = sw {
            Self::dispatch(&self.platform, &mut self.contexts, sw);
        }
        res
    }

    /// Send from an interrupt service routine; the receiver wakeup is
    /// deferred to the next preemption point and the sender reference is
    /// null.
    pub fn send_mess_from_isr(&mut self, dest: &str, data: &[u8]) -> Result<(), KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        let task = self
            .core
            .task_id_by_name(dest)
            .ok_or(KernelError::UnknownTaskName)?;
        let (res, _) = self.core.send_mess(task, data, SignalContext::Isr);
        res
    }

    /// Receive the oldest message from the running task's mailbox,
    /// blocking while it is empty. `timeout` of `None` waits forever.
    pub fn rcv_mess(&mut self, timeout: Option<u32>) -> Result<RecvStatus, KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        let (res, sw) = self.core.rcv_mess(timeout);
        match (&res, sw) {
            (_, Some(sw)) => Self::dispatch(&self.platform, &mut self.contexts, sw),
            (Ok(RecvStatus::Blocked), None) => self.platform.wait_for_interrupt(),
            _ => {}
        }
        res
    }

    /// Messages queued for the named task.
    pub fn used_mbx(&self, name: &str) -> Result<usize, KernelError> {
        self.core.used_mbx(name)
    }

    /// Free slots left in the named task's ring.
    pub fn free_mbx(&self, name: &str) -> Result<usize, KernelError> {
        self.core.free_mbx(name)
    }

    /// Discard everything queued in the running task's mailbox,
    /// returning how many messages were dropped.
    pub fn flush_mbx(&mut self) -> Result<usize, KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        self.core.flush_mbx()
    }

    // === Timers ===

    pub fn start_timer(
        &mut self,
        kind: TimerKind,
        ticks: u32,
        action: TimerAction,
    ) -> Result<TimerHandle, KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        self.core.start_timer(kind, ticks, TimerFire::User(action))
    }

    pub fn stop_timer(&mut self, handle: TimerHandle) -> Result<(), KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        self.core.stop_timer(handle)
    }

    // === Interrupt-side services ===

    /// Hardware clock-tick service routine: runs down the timers,
    /// accounts the running task's slice, and performs at most one
    /// scheduling pass for everything the tick woke up.
    pub fn clock_tick(&mut self) {
        let _irq = InterruptGuard::new(&self.platform);
        if let Some(sw) = self.core.clock_tick() {
            Self::dispatch(&self.platform, &mut self.contexts, sw);
        }
    }

    /// Run a deferred scheduling pass if one is owed. Called at the tail
    /// of device interrupt handlers after `signal_from_isr`.
    pub fn preemption_point(&mut self) {
        let _irq = InterruptGuard::new(&self.platform);
        if !self.core.resched_pending || self.core.switch_lock != 0 {
            return;
        }
        self.core.resched_pending = false;
        if let Some(sw) = self.core.kernel_entry(EntryReason::Preempt) {
            Self::dispatch(&self.platform, &mut self.contexts, sw);
        }
    }

    // === Task-switch lock ===

    /// Suppress all task switches except those caused by an explicit
    /// wait. Reentrant; pair each call with `enable_task_switch`.
    pub fn disable_task_switch(&mut self) {
        let _irq = InterruptGuard::new(&self.platform);
        self.core.disable_task_switch();
    }

    /// Drop one level of the task-switch lock, running any pass that was
    /// deferred while it was held.
    pub fn enable_task_switch(&mut self) {
        let _irq = InterruptGuard::new(&self.platform);
        if let Some(sw) = self.core.enable_task_switch() {
            Self::dispatch(&self.platform, &mut self.contexts, sw);
        }
    }

    // === Interrupt mask ===

    /// Disable processor interrupts, returning the previous mask state.
    pub fn disable_interrupts(&self) -> bool {
        self.platform.set_interrupts_enabled(false)
    }

    /// Enable processor interrupts, returning the previous mask state.
    pub fn enable_interrupts(&self) -> bool {
        self.platform.set_interrupts_enabled(true)
    }

    /// Current state of the processor interrupt mask.
    pub fn interrupts_enabled(&self) -> bool {
        self.platform.interrupts_enabled()
    }

    // === Priorities ===

    /// Change a task's static priority, preempting the running task if
    /// the change makes someone else the best candidate.
    pub fn change_priority(&mut self, task: TaskId, priority: u8) -> Result<(), KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        let (res, sw) = self.core.change_priority(task, priority);
        if let Some(sw) = sw {
            Self::dispatch(&self.platform, &mut self.contexts, sw);
        }
        res
    }

    // === Memory services ===

    /// Allocate a block from the kernel pool.
    pub fn alloc(&mut self, bytes: usize) -> Result<BlockRef, KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        Ok(self.core.pool.alloc(bytes)?)
    }

    /// Allocate a zero-filled block for `count` elements of `elem_bytes`.
    pub fn alloc_zeroed(&mut self, count: usize, elem_bytes: usize) -> Result<BlockRef, KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        Ok(self.core.pool.alloc_zeroed(count, elem_bytes)?)
    }

    /// Return a block to the kernel pool.
    pub fn free(&mut self, block: BlockRef) -> Result<(), KernelError> {
        let _irq = InterruptGuard::new(&self.platform);
        Ok(self.core.pool.free(block)?)
    }

    /// Read access to an allocated block.
    pub fn block_data(&self, block: &BlockRef) -> &[u8] {
        self.core.pool.data(block)
    }

    /// Write access to an allocated block.
    pub fn block_data_mut(&mut self, block: &BlockRef) -> &mut [u8] {
        self.core.pool.data_mut(block)
    }

    /// Free allocation units left in the pool.
    pub fn pool_remaining_units(&self) -> usize {
        self.core.pool.remaining_units()
    }

    // === Introspection ===

    /// Task occupying the CPU slot, if any.
    pub fn running_task(&self) -> Option<TaskId> {
        self.core.table.running
    }

    pub fn task_state(&self, task: TaskId) -> Result<TaskState, KernelError> {
        self.core
            .tasks
            .get(task.index())
            .map(|t| t.state)
            .ok_or(KernelError::NoSuchTask)
    }

    /// A task's (static, dynamic) priority pair.
    pub fn task_priorities(&self, task: TaskId) -> Result<(u8, u8), KernelError> {
        self.core
            .tasks
            .get(task.index())
            .map(|t| (t.static_priority, t.dynamic_priority))
            .ok_or(KernelError::NoSuchTask)
    }

    pub fn task_id_by_name(&self, name: &str) -> Option<TaskId> {
        self.core.task_id_by_name(name)
    }

    pub fn list_tasks(&self) -> Vec<(TaskId, &str, TaskState)> {
        self.core
            .tasks
            .iter()
            .map(|t| (t.id, t.name.as_str(), t.state))
            .collect()
    }

    pub fn task_metrics(&self, task: TaskId) -> Result<&TaskMetrics, KernelError> {
        self.core
            .tasks
            .get(task.index())
            .map(|t| &t.metrics)
            .ok_or(KernelError::NoSuchTask)
    }

    /// Traffic counters for the named task's mailbox.
    pub fn mailbox_metrics(&self, name: &str) -> Result<&MailboxMetrics, KernelError> {
        let m = self.core.mailbox_of(name)?;
        Ok(&self.core.mailboxes[m].metrics)
    }

    pub fn sem_value(&self, id: SemId) -> Result<u32, KernelError> {
        self.core
            .sems
            .get(id.index())
            .map(|s| s.value)
            .ok_or(KernelError::NoSuchSemaphore)
    }

    /// Number of tasks blocked on a semaphore.
    pub fn sem_waiters(&self, id: SemId) -> Result<usize, KernelError> {
        self.core
            .sems
            .get(id.index())
            .map(|s| s.waiters.len())
            .ok_or(KernelError::NoSuchSemaphore)
    }

    /// Current clock tick.
    pub fn now_ticks(&self) -> u64 {
        self.core.tick
    }

    pub fn snapshot(&self) -> KernelSnapshot {
        KernelSnapshot {
            tick: self.core.tick,
            task_count: self.core.tasks.len(),
            semaphore_count: self.core.sems.len(),
            mailbox_count: self.core.mailboxes.len(),
            active_timers: self.core.timers.active.len(),
            pool_free_units: self.core.pool.remaining_units(),
            metrics: self.core.metrics.clone(),
        }
    }

    /// All retained trace events, oldest first.
    pub fn trace_events(&self) -> &[TraceEvent] {
        self.core.trace.events()
    }

    /// The most recent `count` trace events, newest first.
    pub fn recent_events(&self, count: usize) -> Vec<&TraceEvent> {
        self.core.trace.recent(count)
    }

    // === Internals ===

    /// Finish a wait-style call: apply the switch decision, or park the
    /// CPU when the caller blocked and nothing else is runnable.
    fn finish_blocking<T>(
        platform: &P,
        contexts: &mut [P::Context],
        core: &KernelCore,
        res: &Result<T, KernelError>,
        sw: Option<Switch>,
    ) {
        match sw {
            Some(sw) => Self::dispatch(platform, contexts, sw),
            None => {
                if res.is_ok() && core.table.running.is_none() {
                    platform.wait_for_interrupt();
                }
            }
        }
    }

    /// Hand a switch decision to the platform's context-switch primitive.
    fn dispatch(platform: &P, contexts: &mut [P::Context], sw: Switch) {
        let to = sw.to.index();
        match sw.from {
            Some(from) if from.index() != to => {
                let f = from.index();
                let (low, high) = if f < to { (f, to) } else { (to, f) };
                let (head, tail) = contexts.split_at_mut(high);
                let head_ctx = &mut head[low];
                let tail_ctx = &mut tail[0];
                let (from_ctx, to_ctx) = if f < to {
                    (head_ctx, tail_ctx)
                } else {
                    (tail_ctx, head_ctx)
                };
                platform.switch_context(Some(from_ctx), to_ctx);
            }
            // Dispatcher re-selected the same task; nothing to switch.
            Some(_) => {}
            None => platform.switch_context(None, &mut contexts[to]),
        }
    }
}

// ============================================================================
// Test support
// ============================================================================
