//! The kernel entry dispatcher.
//!
//! Every scheduling decision funnels through [`KernelCore::kernel_entry`],
//! parameterized by the reason the kernel was entered. Selection policy:
//! the lowest-numbered non-empty ready queue wins, FIFO within a level.
//!
//! A task's dynamic priority is promoted one level for every
//! `aging_rounds` scheduling passes it spends blocked on a semaphore, and
//! resets to its static priority when it is dispatched. Aging keeps a
//! low-priority task from starving under steady higher-priority traffic -
//! the failure mode behind the sequencer overruns that pure static
//! priorities produced in the field.
//!
//! The task-switch lock suppresses every switch except one caused by an
//! explicit wait; a pass deferred by the lock runs when the lock drops.

use unos_trace::TraceKind;

use crate::task::{TaskId, TaskState};
use crate::KernelCore;

/// Why the kernel entry dispatcher was invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryReason {
    /// The running task blocked on a semaphore
    Wait,
    /// A signal made a blocked task runnable
    Reschedule,
    /// The running task exhausted its time slice
    TimeSlice,
    /// Initial dispatch of the boot-time task set
    TaskCreated,
    /// An interrupt-driven wakeup requested a pass
    Preempt,
    /// A task's priority changed
    ChangePriority,
}

impl EntryReason {
    /// Compact code recorded in trace events.
    pub(crate) fn code(self) -> u8 {
        match self {
            EntryReason::Wait => 0,
            EntryReason::Reschedule => 1,
            EntryReason::TimeSlice => 2,
            EntryReason::TaskCreated => 3,
            EntryReason::Preempt => 4,
            EntryReason::ChangePriority => 5,
        }
    }
}

/// Execution context the kernel is being called from; interrupt and
/// timer-handler contexts defer their scheduling pass to the tick tail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SignalContext {
    Task,
    Isr,
    TimerHandler,
}

/// A context-switch decision handed to the platform layer.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Switch {
    pub(crate) from: Option<TaskId>,
    pub(crate) to: TaskId,
}

impl KernelCore {
    /// The single dispatch point for all scheduling decisions.
    pub(crate) fn kernel_entry(&mut self, reason: EntryReason) -> Option<Switch> {
        self.age_waiters();

        match reason {
            EntryReason::Wait => {
                // The caller has already parked the running task on its
                // semaphore; switches forced by an explicit wait are the
                // one kind the task-switch lock never suppresses.
                let from = self.table.running.take();
                self.select_and_run(reason, from)
            }
            EntryReason::TimeSlice => {
                if self.switch_lock > 0 {
                    self.resched_pending = true;
                    return None;
                }
                let from = self.table.running.take();
                if let Some(f) = from {
                    let tcb = &mut self.tasks[f.index()];
                    tcb.state = TaskState::Ready;
                    tcb.dynamic_priority = tcb.static_priority;
                    tcb.slice_left = 0;
                    let level = tcb.dynamic_priority;
                    self.table.enqueue_tail(level, f);
                    self.metrics.slice_expiries += 1;
                }
                self.select_and_run(reason, from)
            }
            EntryReason::TaskCreated => {
                let from = self.table.running;
                self.select_and_run(reason, from)
            }
            EntryReason::Reschedule | EntryReason::Preempt | EntryReason::ChangePriority => {
                if self.switch_lock > 0 {
                    self.resched_pending = true;
                    return None;
                }
                let best = self.table.highest_ready_level()?;
                match self.table.running {
                    Some(r) => {
                        let current_level = self.tasks[r.index()].dynamic_priority;
                        if best >= current_level {
                            return None;
                        }
                        // Preempted task keeps its remaining slice and
                        // rejoins at the head of its level.
                        let tcb = &mut self.tasks[r.index()];
                        tcb.state = TaskState::Ready;
                        let level = tcb.dynamic_priority;
                        self.table.enqueue_head(level, r);
                        self.table.running = None;
                        self.metrics.preemptions += 1;
                        self.select_and_run(reason, Some(r))
                    }
                    None => self.select_and_run(reason, None),
                }
            }
        }
    }

    /// Pop the highest-precedence ready task and install it as running.
    fn select_and_run(&mut self, reason: EntryReason, from: Option<TaskId>) -> Option<Switch> {
        let next = self.table.pop_highest()?;

        let tcb = &mut self.tasks[next.index()];
        tcb.state = TaskState::Running;
        tcb.dynamic_priority = tcb.static_priority;
        tcb.wait_rounds = 0;
        if tcb.slice_left == 0 {
            tcb.slice_left = self.config.base_slice_ticks * tcb.slice_class as u32;
        }
        tcb.metrics.dispatches += 1;

        self.table.running = Some(next);
        self.resched_pending = false;
        self.metrics.dispatches += 1;
        self.trace.record(
            self.tick,
            TraceKind::Dispatch {
                reason: reason.code(),
                from: from.map(|t| t.0),
                to: next.0,
            },
        );
        Some(Switch { from, to: next })
    }

    /// Age every task blocked on a semaphore. After `aging_rounds` passes
    /// a waiter is promoted one level, to a floor of level 1, and its
    /// round counter restarts.
    fn age_waiters(&mut self) {
        let rounds = self.config.aging_rounds.max(1);
        for s in 0..self.sems.len() {
            for w in 0..self.sems[s].waiters.len() {
                let task = self.sems[s].waiters[w];
                let tcb = &mut self.tasks[task.index()];
                tcb.wait_rounds += 1;
                if tcb.wait_rounds < rounds {
                    continue;
                }
                tcb.wait_rounds = 0;
                if tcb.dynamic_priority > 1 {
                    tcb.dynamic_priority -= 1;
                    let level = tcb.dynamic_priority;
                    self.trace.record(
                        self.tick,
                        TraceKind::Promoted {
                            task: task.0,
                            level,
                        },
                    );
                }
            }
        }
    }

    /// Hardware clock-tick service: run down the timers, account the
    /// running task's slice, and perform at most one scheduling pass.
    pub(crate) fn clock_tick(&mut self) -> Option<Switch> {
        self.tick += 1;
        self.dec_timers();

        let mut sw = None;
        if let Some(r) = self.table.running {
            let tcb = &mut self.tasks[r.index()];
            tcb.metrics.ticks_run += 1;
            tcb.slice_left = tcb.slice_left.saturating_sub(1);
            if tcb.slice_left == 0 {
                sw = self.kernel_entry(EntryReason::TimeSlice);
            }
        }
        if sw.is_none() && self.resched_pending && self.switch_lock == 0 {
            self.resched_pending = false;
            sw = self.kernel_entry(EntryReason::Preempt);
        }
        sw
    }

    pub(crate) fn disable_task_switch(&mut self) {
        self.switch_lock += 1;
    }

    pub(crate) fn enable_task_switch(&mut self) -> Option<Switch> {
        if self.switch_lock > 0 {
            self.switch_lock -= 1;
        }
        if self.switch_lock != 0 || !self.resched_pending {
            return None;
        }
        self.resched_pending = false;
        // A slice expiry deferred by the lock leaves the running task
        // with no quantum; settle that before any plain preemption.
        if let Some(r) = self.table.running {
            if self.tasks[r.index()].slice_left == 0 {
                return self.kernel_entry(EntryReason::TimeSlice);
            }
        }
        self.kernel_entry(EntryReason::Preempt)
    }

    pub(crate) fn change_priority(
        &mut self,
        task: TaskId,
        priority: u8,
    ) -> (Result<(), crate::KernelError>, Option<Switch>) {
        if task.index() >= self.tasks.len() {
            return (Err(crate::KernelError::NoSuchTask), None);
        }
        if priority == 0 || priority > self.config.priority_levels {
            return (Err(crate::KernelError::InvalidPriority), None);
        }

        let old_static = self.tasks[task.index()].static_priority;
        let old_dynamic = self.tasks[task.index()].dynamic_priority;
        let state = self.tasks[task.index()].state;
        {
            let tcb = &mut self.tasks[task.index()];
            tcb.static_priority = priority;
            tcb.dynamic_priority = priority;
        }
        if state == TaskState::Ready {
            self.table.remove(old_dynamic, task);
            self.table.enqueue_tail(priority, task);
        }
        self.trace.record(
            self.tick,
            TraceKind::PriorityChanged {
                task: task.0,
                from: old_static,
                to: priority,
            },
        );

        let sw = self.kernel_entry(EntryReason::ChangePriority);
        (Ok(()), sw)
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{kernel, kernel_with, spawn};
    use crate::{KernelConfig, SemKind, TaskState, WaitStatus};

    #[test]
    fn test_higher_static_priority_runs_first() {
        let mut k = kernel();
        let _lo = spawn(&mut k, "lo", 3);
        let hi = spawn(&mut k, "hi", 1);
        let _mid = spawn(&mut k, "mid", 2);
        k.start().unwrap();
        assert_eq!(k.running_task(), Some(hi));
    }

    #[test]
    fn test_time_slice_round_robin_within_level() {
        let mut k = kernel_with(KernelConfig {
            base_slice_ticks: 3,
            ..KernelConfig::default()
        });
        let a = spawn(&mut k, "a", 2);
        let b = spawn(&mut k, "b", 2);
        k.start().unwrap();
        assert_eq!(k.running_task(), Some(a));

        k.clock_tick();
        k.clock_tick();
        assert_eq!(k.running_task(), Some(a));
        k.clock_tick();
        assert_eq!(k.running_task(), Some(b));

        for _ in 0..3 {
            k.clock_tick();
        }
        assert_eq!(k.running_task(), Some(a));
    }

    #[test]
    fn test_slice_scales_with_slice_class() {
        let mut k = kernel_with(KernelConfig {
            base_slice_ticks: 2,
            ..KernelConfig::default()
        });
        let a = k
            .create_task(crate::TaskSpec {
                name: "wide",
                priority: 2,
                slice_class: 3,
                stack_size: 4096,
                entry: crate::testutil::entry,
                arg: 0,
            })
            .unwrap();
        let b = spawn(&mut k, "narrow", 2);
        k.start().unwrap();
        assert_eq!(k.running_task(), Some(a));

        // slice_class 3 on a base of 2 gives six ticks.
        for _ in 0..5 {
            k.clock_tick();
        }
        assert_eq!(k.running_task(), Some(a));
        k.clock_tick();
        assert_eq!(k.running_task(), Some(b));
    }

    #[test]
    fn test_blocked_waiter_is_promoted_by_aging() {
        let mut k = kernel_with(KernelConfig {
            aging_rounds: 2,
            ..KernelConfig::default()
        });
        let hi = spawn(&mut k, "hi", 1);
        let lo = spawn(&mut k, "lo", 3);
        let s_hi = k.create_semaphore(SemKind::Sync).unwrap();
        let s_lo = k.create_semaphore(SemKind::Sync).unwrap();
        k.start().unwrap();

        // hi blocks, lo runs and blocks too; then hi churns while lo
        // waits its rounds out.
        assert_eq!(k.running_task(), Some(hi));
        k.wait(s_hi).unwrap();
        assert_eq!(k.running_task(), Some(lo));
        k.wait(s_lo).unwrap();
        assert_eq!(k.running_task(), None);

        // lo's wait was the first pass against it; this signal is the
        // second, which crosses the aging threshold.
        k.signal(s_hi).unwrap();
        assert_eq!(k.running_task(), Some(hi));
        assert_eq!(k.task_priorities(lo).unwrap(), (3, 2));

        // Two more passes promote lo again, to the level-1 floor.
        k.wait(s_hi).unwrap();
        k.signal(s_hi).unwrap();
        assert_eq!(k.task_priorities(lo).unwrap(), (3, 1));

        // Waking lo enqueues it at its promoted level; dispatch resets
        // the dynamic priority back to static.
        k.signal(s_lo).unwrap();
        k.wait(s_hi).unwrap();
        assert_eq!(k.running_task(), Some(lo));
        assert_eq!(k.task_priorities(lo).unwrap(), (3, 3));
    }

    #[test]
    fn test_task_switch_lock_defers_preemption() {
        let mut k = kernel();
        let hi = spawn(&mut k, "hi", 1);
        let lo = spawn(&mut k, "lo", 2);
        let s = k.create_semaphore(SemKind::Sync).unwrap();
        k.start().unwrap();

        k.wait(s).unwrap();
        assert_eq!(k.running_task(), Some(lo));

        k.disable_task_switch();
        k.signal(s).unwrap();
        // hi is runnable but the lock holds the CPU with lo.
        assert_eq!(k.running_task(), Some(lo));
        assert_eq!(k.task_state(hi).unwrap(), TaskState::Ready);

        k.enable_task_switch();
        assert_eq!(k.running_task(), Some(hi));
    }

    #[test]
    fn test_task_switch_lock_is_reentrant() {
        let mut k = kernel();
        let hi = spawn(&mut k, "hi", 1);
        let lo = spawn(&mut k, "lo", 2);
        let s = k.create_semaphore(SemKind::Sync).unwrap();
        k.start().unwrap();

        k.wait(s).unwrap();
        assert_eq!(k.running_task(), Some(lo));

        k.disable_task_switch();
        k.disable_task_switch();
        k.signal(s).unwrap();
        k.enable_task_switch();
        assert_eq!(k.running_task(), Some(lo));
        k.enable_task_switch();
        assert_eq!(k.running_task(), Some(hi));
    }

    #[test]
    fn test_lock_still_allows_wait_switches() {
        let mut k = kernel();
        let _hi = spawn(&mut k, "hi", 1);
        let lo = spawn(&mut k, "lo", 2);
        let s = k.create_semaphore(SemKind::Sync).unwrap();
        k.start().unwrap();

        k.disable_task_switch();
        // An explicit wait must still hand the CPU on.
        assert_eq!(k.wait(s).unwrap(), WaitStatus::Blocked);
        assert_eq!(k.running_task(), Some(lo));
        k.enable_task_switch();
    }

    #[test]
    fn test_isr_wakeup_defers_until_preemption_point() {
        let mut k = kernel();
        let hi = spawn(&mut k, "hi", 1);
        let lo = spawn(&mut k, "lo", 2);
        let s = k.create_semaphore(SemKind::Sync).unwrap();
        k.start().unwrap();

        k.wait(s).unwrap();
        assert_eq!(k.running_task(), Some(lo));

        k.signal_from_isr(s).unwrap();
        // The ISR only marks hi ready; the switch happens at the
        // preemption point after the ISR tail.
        assert_eq!(k.running_task(), Some(lo));
        assert_eq!(k.task_state(hi).unwrap(), TaskState::Ready);

        k.preemption_point();
        assert_eq!(k.running_task(), Some(hi));
    }

    #[test]
    fn test_change_priority_preempts_demoted_runner() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 1);
        let b = spawn(&mut k, "b", 2);
        k.start().unwrap();
        assert_eq!(k.running_task(), Some(a));

        k.change_priority(a, 3).unwrap();
        assert_eq!(k.running_task(), Some(b));
        assert_eq!(k.task_priorities(a).unwrap(), (3, 3));
    }

    #[test]
    fn test_change_priority_requeues_ready_task() {
        let mut k = kernel();
        let a = spawn(&mut k, "a", 1);
        let b = spawn(&mut k, "b", 2);
        let _c = spawn(&mut k, "c", 2);
        k.start().unwrap();
        assert_eq!(k.running_task(), Some(a));

        // Promote b over the running task; it takes the CPU.
        k.change_priority(b, 1).unwrap();
        assert_eq!(k.running_task(), Some(a));

        let s = k.create_semaphore(SemKind::Sync).unwrap();
        k.wait(s).unwrap();
        assert_eq!(k.running_task(), Some(b));
    }
}
