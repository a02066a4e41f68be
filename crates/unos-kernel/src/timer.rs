//! Software timers driven by the hardware clock tick.
//!
//! Timer descriptors live in a fixed arena. Armed timers sit in one
//! active list ordered by expiry and delta-encoded against their
//! predecessors, so each clock tick decrements only the head. Idle
//! descriptors sit in a free list and are recycled.
//!
//! Expiry handlers run with task switching deferred: a handler's signals
//! and sends only mark tasks ready, and the tick path performs a single
//! scheduling pass once every expired timer has been serviced. That
//! batches a burst of simultaneous expiries into one reschedule and keeps
//! the tick tail bounded.

use alloc::boxed::Box;
use alloc::vec::Vec;
use alloc::collections::VecDeque;

use unos_trace::TraceKind;

use crate::sched::SignalContext;
use crate::sem::SemId;
use crate::task::TaskId;
use crate::{KernelCore, KernelError};

/// Handle to a started timer; doubles as the index into the timer arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u32);

impl TimerHandle {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Rearm behavior of a timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TimerKind {
    /// Fire once, then return to the free list
    OneShot,
    /// Fire and rearm with the initial tick count
    Periodic,
}

/// Callback run on timer expiry, in the deferred tick context.
pub type TimerCallback = Box<dyn FnMut(&mut TimerOps<'_>, u32) + 'static>;

/// What a timer does when it expires.
pub enum TimerAction {
    /// Signal a semaphore
    Signal(SemId),
    /// Run a callback with the stored word of user data
    Callback { hook: TimerCallback, data: u32 },
}

/// Expiry behavior, including the kernel-internal timed-wait variant.
pub(crate) enum TimerFire {
    User(TimerAction),
    /// Expire a `timed_wait`: pull the task off the semaphore's wait
    /// queue and complete it with a timeout
    WaitTimeout { task: TaskId, sem: SemId },
}

pub(crate) struct TimerSlot {
    pub(crate) in_use: bool,
    pub(crate) kind: TimerKind,
    pub(crate) initial: u32,
    pub(crate) fire: Option<TimerFire>,
}

impl TimerSlot {
    fn empty() -> Self {
        Self {
            in_use: false,
            kind: TimerKind::OneShot,
            initial: 0,
            fire: None,
        }
    }
}

/// One entry in the active list. `delta` is the tick count remaining
/// after all predecessors have expired.
pub(crate) struct ActiveTimer {
    pub(crate) slot: u32,
    pub(crate) delta: u32,
}

pub(crate) struct TimerTable {
    pub(crate) slots: Vec<TimerSlot>,
    /// Indices of idle descriptors
    pub(crate) free: Vec<u32>,
    pub(crate) active: VecDeque<ActiveTimer>,
}

impl TimerTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            active: VecDeque::new(),
        }
    }
}

/// Kernel operations available to a timer callback.
///
/// Everything here runs in the deferred tick context: wakeups mark tasks
/// ready and request a pass, but the actual switch happens once the tick
/// handler has drained all expired timers.
pub struct TimerOps<'a> {
    pub(crate) core: &'a mut KernelCore,
}

impl TimerOps<'_> {
    /// Signal a semaphore without triggering an immediate reschedule.
    pub fn signal(&mut self, sem: SemId) -> Result<(), KernelError> {
        let (res, _) = self.core.signal(sem, SignalContext::TimerHandler);
        res
    }

    /// Queue a message for the named task's mailbox.
    pub fn send_mess(&mut self, dest: &str, data: &[u8]) -> Result<(), KernelError> {
        let task = self
            .core
            .task_id_by_name(dest)
            .ok_or(KernelError::UnknownTaskName)?;
        let (res, _) = self.core.send_mess(task, data, SignalContext::TimerHandler);
        res
    }

    /// Current kernel tick count.
    pub fn now_ticks(&self) -> u64 {
        self.core.tick
    }
}

impl KernelCore {
    pub(crate) fn start_timer(
        &mut self,
        kind: TimerKind,
        ticks: u32,
        fire: TimerFire,
    ) -> Result<TimerHandle, KernelError> {
        if ticks == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let slot = match self.timers.free.pop() {
            Some(slot) => slot,
            None => {
                if self.timers.slots.len() >= self.config.max_timers {
                    return Err(KernelError::TableFull);
                }
                self.timers.slots.push(TimerSlot::empty());
                (self.timers.slots.len() - 1) as u32
            }
        };

        self.timers.slots[slot as usize] = TimerSlot {
            in_use: true,
            kind,
            initial: ticks,
            fire: Some(fire),
        };
        self.insert_active(slot, ticks);
        Ok(TimerHandle(slot))
    }

    pub(crate) fn stop_timer(&mut self, handle: TimerHandle) -> Result<(), KernelError> {
        let i = handle.index();
        if i >= self.timers.slots.len() || !self.timers.slots[i].in_use {
            return Err(KernelError::NoSuchTimer);
        }

        // Unlink from the active list, giving the removed delta to the
        // successor so later expiries keep their absolute times.
        if let Some(pos) = self
            .timers
            .active
            .iter()
            .position(|t| t.slot == handle.0)
        {
            let delta = self.timers.active[pos].delta;
            self.timers.active.remove(pos);
            if let Some(next) = self.timers.active.get_mut(pos) {
                next.delta += delta;
            }
        }

        self.timers.slots[i] = TimerSlot::empty();
        self.timers.free.push(handle.0);
        Ok(())
    }

    /// One-shot internal timer backing `timed_wait`.
    pub(crate) fn arm_wait_timeout(
        &mut self,
        task: TaskId,
        sem: SemId,
        ticks: u32,
    ) -> Result<TimerHandle, KernelError> {
        self.start_timer(TimerKind::OneShot, ticks, TimerFire::WaitTimeout { task, sem })
    }

    /// Insert into the active list, maintaining expiry order and delta
    /// encoding. Equal expiries fire in arming order.
    fn insert_active(&mut self, slot: u32, ticks: u32) {
        let mut remaining = ticks;
        let mut pos = 0;
        for t in self.timers.active.iter() {
            if remaining < t.delta {
                break;
            }
            remaining -= t.delta;
            pos += 1;
        }
        if let Some(next) = self.timers.active.get_mut(pos) {
            next.delta -= remaining;
        }
        self.timers
            .active
            .insert(pos, ActiveTimer { slot, delta: remaining });
    }

    /// Clock-tick service: decrement the head of the active list and fire
    /// everything that reached zero.
    pub(crate) fn dec_timers(&mut self) {
        match self.timers.active.front_mut() {
            Some(front) => front.delta = front.delta.saturating_sub(1),
            None => return,
        }
        loop {
            let expired = match self.timers.active.front() {
                Some(t) if t.delta == 0 => t.slot,
                _ => break,
            };
            self.timers.active.pop_front();
            self.fire_timer(expired);
        }
    }

    fn fire_timer(&mut self, slot: u32) {
        let i = slot as usize;
        let fire = match self.timers.slots.get_mut(i).and_then(|s| s.fire.take()) {
            Some(f) => f,
            None => return,
        };
        let kind = self.timers.slots[i].kind;
        let initial = self.timers.slots[i].initial;

        self.metrics.timer_expiries += 1;
        self.trace.record(
            self.tick,
            TraceKind::TimerExpired {
                timer: slot,
                repeating: kind == TimerKind::Periodic,
            },
        );

        let fire_back = match fire {
            TimerFire::WaitTimeout { task, sem } => {
                self.timers.slots[i] = TimerSlot::empty();
                self.timers.free.push(slot);
                self.handle_wait_timeout(task, sem);
                return;
            }
            TimerFire::User(TimerAction::Signal(sem)) => {
                let _ = self.signal(sem, SignalContext::TimerHandler);
                TimerFire::User(TimerAction::Signal(sem))
            }
            TimerFire::User(TimerAction::Callback { mut hook, data }) => {
                let mut ops = TimerOps { core: &mut *self };
                hook(&mut ops, data);
                TimerFire::User(TimerAction::Callback { hook, data })
            }
        };

        // The handler may have stopped its own timer; only a still-live
        // slot is rearmed or retired here.
        if !self.timers.slots[i].in_use {
            return;
        }
        match kind {
            TimerKind::Periodic => {
                self.timers.slots[i].fire = Some(fire_back);
                self.insert_active(slot, initial);
            }
            TimerKind::OneShot => {
                self.timers.slots[i] = TimerSlot::empty();
                self.timers.free.push(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;

    use crate::testutil::{kernel, kernel_with, spawn};
    use crate::{
        KernelConfig, KernelError, SemKind, TimerAction, TimerKind,
    };

    #[test]
    fn test_one_shot_signals_after_exact_ticks() {
        let mut k = kernel();
        spawn(&mut k, "ctl", 1);
        let s = k.create_semaphore(SemKind::Sync).unwrap();
        k.init_semaphore(s, 0, 8).unwrap();
        k.start().unwrap();

        k.start_timer(TimerKind::OneShot, 3, TimerAction::Signal(s))
            .unwrap();
        k.clock_tick();
        k.clock_tick();
        assert_eq!(k.sem_value(s).unwrap(), 0);
        k.clock_tick();
        assert_eq!(k.sem_value(s).unwrap(), 1);

        // One-shot: no further fires.
        for _ in 0..5 {
            k.clock_tick();
        }
        assert_eq!(k.sem_value(s).unwrap(), 1);
    }

    #[test]
    fn test_periodic_rearms_with_initial_count() {
        let mut k = kernel();
        spawn(&mut k, "ctl", 1);
        let s = k.create_semaphore(SemKind::Sync).unwrap();
        k.init_semaphore(s, 0, 16).unwrap();
        k.start().unwrap();

        k.start_timer(TimerKind::Periodic, 2, TimerAction::Signal(s))
            .unwrap();
        for _ in 0..6 {
            k.clock_tick();
        }
        assert_eq!(k.sem_value(s).unwrap(), 3);
    }

    #[test]
    fn test_stop_timer_prevents_fire_and_recycles_slot() {
        let mut k = kernel_with(KernelConfig {
            max_timers: 1,
            ..KernelConfig::default()
        });
        spawn(&mut k, "ctl", 1);
        let s = k.create_semaphore(SemKind::Sync).unwrap();
        k.init_semaphore(s, 0, 8).unwrap();
        k.start().unwrap();

        let t = k
            .start_timer(TimerKind::OneShot, 2, TimerAction::Signal(s))
            .unwrap();
        k.stop_timer(t).unwrap();
        for _ in 0..4 {
            k.clock_tick();
        }
        assert_eq!(k.sem_value(s).unwrap(), 0);
        assert_eq!(k.stop_timer(t).unwrap_err(), KernelError::NoSuchTimer);

        // The lone descriptor went back to the inactive queue.
        k.start_timer(TimerKind::OneShot, 1, TimerAction::Signal(s))
            .unwrap();
    }

    #[test]
    fn test_delta_encoding_keeps_absolute_expiries() {
        let mut k = kernel();
        spawn(&mut k, "ctl", 1);
        let s1 = k.create_semaphore(SemKind::Sync).unwrap();
        let s2 = k.create_semaphore(SemKind::Sync).unwrap();
        let s3 = k.create_semaphore(SemKind::Sync).unwrap();
        for s in [s1, s2, s3] {
            k.init_semaphore(s, 0, 8).unwrap();
        }
        k.start().unwrap();

        // Armed out of order; must fire at ticks 2, 4 and 5.
        k.start_timer(TimerKind::OneShot, 4, TimerAction::Signal(s2))
            .unwrap();
        k.start_timer(TimerKind::OneShot, 2, TimerAction::Signal(s1))
            .unwrap();
        k.start_timer(TimerKind::OneShot, 5, TimerAction::Signal(s3))
            .unwrap();

        k.clock_tick();
        k.clock_tick();
        assert_eq!(k.sem_value(s1).unwrap(), 1);
        assert_eq!(k.sem_value(s2).unwrap(), 0);

        k.clock_tick();
        k.clock_tick();
        assert_eq!(k.sem_value(s2).unwrap(), 1);
        assert_eq!(k.sem_value(s3).unwrap(), 0);

        k.clock_tick();
        assert_eq!(k.sem_value(s3).unwrap(), 1);
    }

    #[test]
    fn test_stop_middle_timer_preserves_successor_expiry() {
        let mut k = kernel();
        spawn(&mut k, "ctl", 1);
        let s1 = k.create_semaphore(SemKind::Sync).unwrap();
        let s2 = k.create_semaphore(SemKind::Sync).unwrap();
        k.init_semaphore(s1, 0, 8).unwrap();
        k.init_semaphore(s2, 0, 8).unwrap();
        k.start().unwrap();

        let t1 = k
            .start_timer(TimerKind::OneShot, 2, TimerAction::Signal(s1))
            .unwrap();
        k.start_timer(TimerKind::OneShot, 5, TimerAction::Signal(s2))
            .unwrap();
        k.stop_timer(t1).unwrap();

        for _ in 0..4 {
            k.clock_tick();
        }
        assert_eq!(k.sem_value(s2).unwrap(), 0);
        k.clock_tick();
        assert_eq!(k.sem_value(s2).unwrap(), 1);
    }

    #[test]
    fn test_callback_runs_deferred() {
        let mut k = kernel();
        let hi = spawn(&mut k, "hi", 1);
        let lo = spawn(&mut k, "lo", 2);
        let s = k.create_semaphore(SemKind::Sync).unwrap();
        k.init_semaphore(s, 0, 1).unwrap();
        k.start().unwrap();

        // hi parks on the semaphore; lo takes over.
        k.wait(s).unwrap();
        assert_eq!(k.running_task(), Some(lo));

        k.start_timer(
            TimerKind::OneShot,
            2,
            TimerAction::Callback {
                hook: Box::new(move |ops, data| {
                    assert_eq!(data, 42);
                    let _ = ops.signal(s);
                }),
                data: 42,
            },
        )
        .unwrap();

        k.clock_tick();
        assert_eq!(k.running_task(), Some(lo));
        // The expiry wakes hi inside the tick, and the single end-of-tick
        // pass performs the switch.
        k.clock_tick();
        assert_eq!(k.running_task(), Some(hi));
    }

    #[test]
    fn test_timer_table_exhaustion() {
        let mut k = kernel_with(KernelConfig {
            max_timers: 2,
            ..KernelConfig::default()
        });
        spawn(&mut k, "ctl", 1);
        let s = k.create_semaphore(SemKind::Sync).unwrap();
        k.init_semaphore(s, 0, 8).unwrap();
        k.start().unwrap();

        k.start_timer(TimerKind::OneShot, 10, TimerAction::Signal(s))
            .unwrap();
        k.start_timer(TimerKind::OneShot, 10, TimerAction::Signal(s))
            .unwrap();
        assert_eq!(
            k.start_timer(TimerKind::OneShot, 10, TimerAction::Signal(s))
                .unwrap_err(),
            KernelError::TableFull
        );
    }

    #[test]
    fn test_zero_tick_timer_rejected() {
        let mut k = kernel();
        spawn(&mut k, "ctl", 1);
        let s = k.create_semaphore(SemKind::Sync).unwrap();
        k.start().unwrap();
        assert_eq!(
            k.start_timer(TimerKind::OneShot, 0, TimerAction::Signal(s))
                .unwrap_err(),
            KernelError::InvalidArgument
        );
    }
}
