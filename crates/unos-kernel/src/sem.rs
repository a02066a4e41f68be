//! Counting semaphores with per-semaphore FIFO wait queues.
//!
//! A semaphore is either a SYNC resource counter or a CRITICAL-SECTION
//! ownership flag. The distinction matters when a semaphore is seeded with
//! a nonzero value: a SYNC wait may consume a count the caller never
//! blocked for, while a CRITICAL-SECTION wait takes ownership and only the
//! owner may signal. Tracking the owner turns a mis-signalled mutex - the
//! flow-control bug class the SYNC type was introduced to fix - into a
//! detected error instead of silent queue corruption.
//!
//! Signal uses direct handoff: with waiters queued, the count is passed to
//! the head waiter and the stored value stays unchanged.

use alloc::collections::VecDeque;

use unos_trace::TraceKind;

use crate::mailbox::RecvOutcome;
use crate::sched::{EntryReason, SignalContext, Switch};
use crate::task::{TaskId, TaskState};
use crate::{KernelCore, KernelError};

/// Semaphore identifier; doubles as the index into the semaphore table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemId(pub u32);

impl SemId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Usage semantics of a semaphore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SemKind {
    /// Resource counter: waits consume counts without taking ownership
    Sync,
    /// Mutual-exclusion flag: a successful wait takes ownership and only
    /// the owner may signal
    CriticalSection,
}

/// Immediate result of a wait call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    /// The count was available; the caller holds it
    Acquired,
    /// The caller is parked in the wait queue and the CPU moved on
    Blocked,
}

/// How a blocked wait ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A signal handed the count to this task
    Acquired,
    /// The timed wait expired before any signal arrived
    TimedOut,
}

/// Completion delivered to a task when it is dispatched after blocking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Wake {
    /// A `wait`/`timed_wait` finished
    Wait(WaitOutcome),
    /// A `rcv_mess` finished
    Receive(RecvOutcome),
}

pub(crate) struct Semaphore {
    pub(crate) value: u32,
    pub(crate) max: u32,
    pub(crate) kind: SemKind,
    /// Holder of a critical-section semaphore; always `None` for SYNC
    pub(crate) owner: Option<TaskId>,
    /// Blocked tasks in block order
    pub(crate) waiters: VecDeque<TaskId>,
}

impl KernelCore {
    pub(crate) fn create_semaphore(&mut self, kind: SemKind) -> Result<SemId, KernelError> {
        if self.sems.len() >= self.config.max_semaphores {
            return Err(KernelError::TableFull);
        }
        let id = SemId(self.sems.len() as u32);
        self.sems.push(Semaphore {
            value: 0,
            max: 1,
            kind,
            owner: None,
            waiters: VecDeque::new(),
        });
        Ok(id)
    }

    pub(crate) fn init_semaphore(
        &mut self,
        id: SemId,
        initial: u32,
        max: u32,
    ) -> Result<(), KernelError> {
        let sem = self
            .sems
            .get_mut(id.index())
            .ok_or(KernelError::NoSuchSemaphore)?;
        if max == 0 || initial > max {
            return Err(KernelError::InvalidArgument);
        }
        sem.value = initial;
        sem.max = max;
        sem.owner = None;
        Ok(())
    }

    pub(crate) fn wait(&mut self, id: SemId) -> (Result<WaitStatus, KernelError>, Option<Switch>) {
        self.wait_inner(id, false, None)
    }

    pub(crate) fn timed_wait(
        &mut self,
        id: SemId,
        ticks: u32,
    ) -> (Result<WaitStatus, KernelError>, Option<Switch>) {
        if ticks == 0 {
            return (Err(KernelError::InvalidArgument), None);
        }
        self.wait_inner(id, false, Some(ticks))
    }

    pub(crate) fn wait_inner(
        &mut self,
        id: SemId,
        in_receive: bool,
        timeout: Option<u32>,
    ) -> (Result<WaitStatus, KernelError>, Option<Switch>) {
        let current = match self.table.running {
            Some(t) => t,
            None => return (Err(KernelError::NoCurrentTask), None),
        };
        if id.index() >= self.sems.len() {
            return (Err(KernelError::NoSuchSemaphore), None);
        }

        let sem = &mut self.sems[id.index()];
        if sem.value > 0 {
            sem.value -= 1;
            if sem.kind == SemKind::CriticalSection {
                sem.owner = Some(current);
            }
            return (Ok(WaitStatus::Acquired), None);
        }

        self.block_current(current, id, in_receive, timeout)
    }

    /// Park the running task in `id`'s wait queue and hand the CPU on.
    fn block_current(
        &mut self,
        current: TaskId,
        id: SemId,
        in_receive: bool,
        timeout: Option<u32>,
    ) -> (Result<WaitStatus, KernelError>, Option<Switch>) {
        // Arm the timeout first so a full timer table fails the call
        // before any scheduling state has moved.
        let timer = match timeout {
            Some(ticks) => match self.arm_wait_timeout(current, id, ticks) {
                Ok(handle) => Some(handle),
                Err(e) => return (Err(e), None),
            },
            None => None,
        };

        self.sems[id.index()].waiters.push_back(current);
        let tcb = &mut self.tasks[current.index()];
        tcb.state = TaskState::Blocked(id);
        tcb.blocked_in_receive = in_receive;
        tcb.timeout_timer = timer;
        tcb.wake = None;
        tcb.wait_rounds = 0;
        tcb.metrics.blocks += 1;
        self.trace.record(
            self.tick,
            TraceKind::Blocked {
                task: current.0,
                sem: id.0,
            },
        );

        let sw = self.kernel_entry(EntryReason::Wait);
        (Ok(WaitStatus::Blocked), sw)
    }

    pub(crate) fn signal(
        &mut self,
        id: SemId,
        ctx: SignalContext,
    ) -> (Result<(), KernelError>, Option<Switch>) {
        let i = id.index();
        if i >= self.sems.len() {
            return (Err(KernelError::NoSuchSemaphore), None);
        }

        if self.sems[i].kind == SemKind::CriticalSection {
            let caller = match ctx {
                SignalContext::Task => self.table.running,
                _ => None,
            };
            match caller {
                Some(c) if self.sems[i].owner == Some(c) => {}
                _ => return (Err(KernelError::NotOwner), None),
            }
        }

        if let Some(waiter) = self.sems[i].waiters.pop_front() {
            // Direct handoff: the count goes to the head waiter, the
            // stored value stays where it is.
            if self.sems[i].kind == SemKind::CriticalSection {
                self.sems[i].owner = Some(waiter);
            }
            self.wake_waiter(waiter, id, false);
            let sw = match ctx {
                SignalContext::Task => self.kernel_entry(EntryReason::Reschedule),
                SignalContext::Isr | SignalContext::TimerHandler => {
                    self.resched_pending = true;
                    None
                }
            };
            (Ok(()), sw)
        } else {
            let sem = &mut self.sems[i];
            if sem.kind == SemKind::CriticalSection {
                sem.owner = None;
            }
            sem.value = (sem.value + 1).min(sem.max);
            (Ok(()), None)
        }
    }

    /// Complete a blocked task's wait and queue it as runnable.
    pub(crate) fn wake_waiter(&mut self, waiter: TaskId, id: SemId, timed_out: bool) {
        // A wake by signal cancels the pending timeout; a wake by timeout
        // arrives from a timer that has already been reclaimed.
        if let Some(handle) = self.tasks[waiter.index()].timeout_timer.take() {
            if !timed_out {
                let _ = self.stop_timer(handle);
            }
        }

        let in_receive = self.tasks[waiter.index()].blocked_in_receive;
        let wake = if in_receive {
            if timed_out {
                Wake::Receive(RecvOutcome::TimedOut)
            } else {
                match self.tasks[waiter.index()].mailbox {
                    Some(m) => match self.try_receive(m) {
                        Some(msg) => Wake::Receive(RecvOutcome::Message(msg)),
                        // Signalled without a queued message; surface it
                        // as a bare wait completion.
                        None => Wake::Wait(WaitOutcome::Acquired),
                    },
                    None => Wake::Wait(WaitOutcome::Acquired),
                }
            }
        } else if timed_out {
            Wake::Wait(WaitOutcome::TimedOut)
        } else {
            Wake::Wait(WaitOutcome::Acquired)
        };

        let tcb = &mut self.tasks[waiter.index()];
        tcb.blocked_in_receive = false;
        tcb.state = TaskState::Ready;
        tcb.wake = Some(wake);
        tcb.metrics.wakeups += 1;
        let level = tcb.dynamic_priority;
        self.table.enqueue_tail(level, waiter);
        self.trace.record(
            self.tick,
            TraceKind::Woken {
                task: waiter.0,
                sem: id.0,
                timeout: timed_out,
            },
        );
    }

    /// Timer-driven expiry of a timed wait.
    ///
    /// The task may have been signalled on this same tick; only a task
    /// still queued on the semaphore times out.
    pub(crate) fn handle_wait_timeout(&mut self, task: TaskId, id: SemId) {
        let sem = &mut self.sems[id.index()];
        if let Some(pos) = sem.waiters.iter().position(|&t| t == task) {
            sem.waiters.remove(pos);
            self.wake_waiter(task, id, true);
            self.resched_pending = true;
        }
    }
}
