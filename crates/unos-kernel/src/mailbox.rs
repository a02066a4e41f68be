//! Name-addressed mailbox IPC.
//!
//! Each task owns at most one mailbox: a bounded ring of fixed-size slots
//! carved out of the kernel pool, guarded by a message-count/free-slot
//! semaphore pair. Senders resolve the destination by task name through
//! the registry built at task creation, so drivers never need to know
//! task numbers. Delivery is strictly FIFO per mailbox; nothing is
//! guaranteed across mailboxes.
//!
//! A send into a full ring reports `MailboxFull` rather than blocking;
//! producers that need lossless delivery check `free_mbx` first.

use alloc::vec;
use alloc::vec::Vec;

use unos_pool::BlockRef;
use unos_trace::TraceKind;

use crate::sched::SignalContext;
use crate::sem::{SemId, SemKind, WaitStatus};
use crate::task::TaskId;
use crate::{KernelCore, KernelError};

/// Record discipline for messages in a mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MailboxKind {
    /// Every message is exactly the slot size
    Fixed,
    /// Messages may be any length up to the slot size
    Bounded,
}

/// Per-mailbox traffic counters.
#[derive(Clone, Debug, Default)]
pub struct MailboxMetrics {
    /// Messages ever queued
    pub total_messages: u64,
    /// Payload bytes ever queued
    pub total_bytes: u64,
    /// Deepest the ring has been
    pub queue_high_water: usize,
    /// Sends rejected because the ring was full
    pub rejected: u64,
}

/// A message taken out of a mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Sending task, or `None` for interrupt- and timer-context sends
    pub sender: Option<TaskId>,
    /// Payload copy
    pub data: Vec<u8>,
}

/// Immediate result of a receive call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecvStatus {
    /// A queued message was available
    Message(ReceivedMessage),
    /// The ring was empty; the caller is parked on the message-available
    /// semaphore and the CPU moved on
    Blocked,
}

/// How a blocked receive ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A send completed the receive
    Message(ReceivedMessage),
    /// The timeout expired with the ring still empty
    TimedOut,
}

#[derive(Clone, Copy, Default)]
pub(crate) struct SlotMeta {
    sender: Option<TaskId>,
    len: usize,
}

pub(crate) struct Mailbox {
    pub(crate) owner: TaskId,
    pub(crate) kind: MailboxKind,
    pub(crate) capacity: usize,
    pub(crate) msg_size: usize,
    /// Slot payload storage inside the kernel pool
    pub(crate) ring: BlockRef,
    pub(crate) head: usize,
    pub(crate) count: usize,
    pub(crate) meta: Vec<SlotMeta>,
    /// Counts queued messages; receivers block here
    pub(crate) msg_avail: SemId,
    /// Counts free slots; senders check rather than block
    pub(crate) space_avail: SemId,
    pub(crate) metrics: MailboxMetrics,
}

impl KernelCore {
    /// Bind a bounded message ring to a task.
    pub(crate) fn create_mbx(
        &mut self,
        task: TaskId,
        kind: MailboxKind,
        capacity: usize,
        msg_size: usize,
    ) -> Result<(), KernelError> {
        if task.index() >= self.tasks.len() {
            return Err(KernelError::NoSuchTask);
        }
        if self.tasks[task.index()].mailbox.is_some() {
            return Err(KernelError::MailboxExists);
        }
        if capacity == 0 || msg_size == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if self.mailboxes.len() >= self.config.max_mailboxes {
            return Err(KernelError::TableFull);
        }
        // Both flow-control semaphores must fit before anything is built.
        if self.sems.len() + 2 > self.config.max_semaphores {
            return Err(KernelError::TableFull);
        }

        let ring = self.pool.alloc(capacity * msg_size)?;
        let msg_avail = self.create_semaphore(SemKind::Sync)?;
        self.init_semaphore(msg_avail, 0, capacity as u32)?;
        let space_avail = self.create_semaphore(SemKind::Sync)?;
        self.init_semaphore(space_avail, capacity as u32, capacity as u32)?;

        let index = self.mailboxes.len();
        self.mailboxes.push(Mailbox {
            owner: task,
            kind,
            capacity,
            msg_size,
            ring,
            head: 0,
            count: 0,
            meta: vec![SlotMeta::default(); capacity],
            msg_avail,
            space_avail,
            metrics: MailboxMetrics::default(),
        });
        self.tasks[task.index()].mailbox = Some(index);
        Ok(())
    }

    /// Queue a message for `dest`, waking its owner if it is blocked in a
    /// receive. Never blocks the sender: a full ring is an error.
    pub(crate) fn send_mess(
        &mut self,
        dest: TaskId,
        data: &[u8],
        ctx: SignalContext,
    ) -> (Result<(), KernelError>, Option<crate::sched::Switch>) {
        let sender = match ctx {
            SignalContext::Task => self.table.running,
            _ => None,
        };
        if dest.index() >= self.tasks.len() {
            return (Err(KernelError::NoSuchTask), None);
        }
        let m = match self.tasks[dest.index()].mailbox {
            Some(m) => m,
            None => return (Err(KernelError::NoMailbox), None),
        };

        {
            let mbx = &self.mailboxes[m];
            match mbx.kind {
                MailboxKind::Fixed if data.len() != mbx.msg_size => {
                    return (Err(KernelError::MessageSizeMismatch), None)
                }
                MailboxKind::Bounded if data.len() > mbx.msg_size => {
                    return (Err(KernelError::MessageTooLong), None)
                }
                _ => {}
            }
        }

        let space_avail = self.mailboxes[m].space_avail;
        if self.sems[space_avail.index()].value == 0 {
            self.mailboxes[m].metrics.rejected += 1;
            self.trace
                .record(self.tick, TraceKind::MessageRejected { to: dest.0 });
            return (Err(KernelError::MailboxFull), None);
        }
        self.sems[space_avail.index()].value -= 1;

        {
            let mbx = &mut self.mailboxes[m];
            let slot = (mbx.head + mbx.count) % mbx.capacity;
            let base = slot * mbx.msg_size;
            let ring = mbx.ring;
            let storage = self.pool.data_mut(&ring);
            storage[base..base + data.len()].copy_from_slice(data);
            mbx.meta[slot] = SlotMeta {
                sender,
                len: data.len(),
            };
            mbx.count += 1;
            mbx.metrics.total_messages += 1;
            mbx.metrics.total_bytes += data.len() as u64;
            if mbx.count > mbx.metrics.queue_high_water {
                mbx.metrics.queue_high_water = mbx.count;
            }
        }
        self.metrics.messages_sent += 1;
        self.trace.record(
            self.tick,
            TraceKind::MessageSent {
                from: sender.map(|t| t.0),
                to: dest.0,
                len: data.len() as u32,
            },
        );

        // Hand the message to a blocked receiver, or bank the count.
        let msg_avail = self.mailboxes[m].msg_avail;
        let (_, sw) = self.signal(msg_avail, ctx);
        (Ok(()), sw)
    }

    /// Receive the oldest message from the running task's mailbox,
    /// blocking (optionally with a tick timeout) while the ring is empty.
    pub(crate) fn rcv_mess(
        &mut self,
        timeout: Option<u32>,
    ) -> (Result<RecvStatus, KernelError>, Option<crate::sched::Switch>) {
        let current = match self.table.running {
            Some(t) => t,
            None => return (Err(KernelError::NoCurrentTask), None),
        };
        let m = match self.tasks[current.index()].mailbox {
            Some(m) => m,
            None => return (Err(KernelError::NoMailbox), None),
        };

        if let Some(msg) = self.try_receive(m) {
            return (Ok(RecvStatus::Message(msg)), None);
        }

        let msg_avail = self.mailboxes[m].msg_avail;
        let (res, sw) = self.wait_inner(msg_avail, true, timeout);
        match res {
            Ok(WaitStatus::Blocked) | Ok(WaitStatus::Acquired) => {
                (Ok(RecvStatus::Blocked), sw)
            }
            Err(e) => (Err(e), sw),
        }
    }

    /// Dequeue the oldest message if one is present.
    ///
    /// Used both by a running receiver finding data already queued (a SYNC
    /// consume with no ownership taken) and by the wake path delivering
    /// into a blocked receiver.
    pub(crate) fn try_receive(&mut self, m: usize) -> Option<ReceivedMessage> {
        if self.mailboxes[m].count == 0 {
            return None;
        }

        let mbx = &mut self.mailboxes[m];
        let slot = mbx.head;
        let meta = mbx.meta[slot];
        let base = slot * mbx.msg_size;
        let ring = mbx.ring;
        mbx.head = (mbx.head + 1) % mbx.capacity;
        mbx.count -= 1;
        let owner = mbx.owner;
        let msg_avail = mbx.msg_avail;
        let space_avail = mbx.space_avail;

        let data = self.pool.data(&ring)[base..base + meta.len].to_vec();
        self.sems[msg_avail.index()].value =
            self.sems[msg_avail.index()].value.saturating_sub(1);
        let space = &mut self.sems[space_avail.index()];
        space.value = (space.value + 1).min(space.max);

        self.trace.record(
            self.tick,
            TraceKind::MessageReceived {
                task: owner.0,
                len: meta.len as u32,
            },
        );
        Some(ReceivedMessage {
            sender: meta.sender,
            data,
        })
    }

    /// Discard everything queued in the running task's mailbox.
    pub(crate) fn flush_mbx(&mut self) -> Result<usize, KernelError> {
        let current = match self.table.running {
            Some(t) => t,
            None => return Err(KernelError::NoCurrentTask),
        };
        let m = match self.tasks[current.index()].mailbox {
            Some(m) => m,
            None => return Err(KernelError::NoMailbox),
        };

        let mbx = &mut self.mailboxes[m];
        let drained = mbx.count;
        mbx.head = 0;
        mbx.count = 0;
        for meta in mbx.meta.iter_mut() {
            *meta = SlotMeta::default();
        }
        let msg_avail = mbx.msg_avail;
        let space_avail = mbx.space_avail;
        let capacity = mbx.capacity;
        self.sems[msg_avail.index()].value = 0;
        self.sems[space_avail.index()].value = capacity as u32;
        Ok(drained)
    }

    pub(crate) fn mailbox_of(&self, name: &str) -> Result<usize, KernelError> {
        let task = self
            .task_id_by_name(name)
            .ok_or(KernelError::UnknownTaskName)?;
        self.tasks[task.index()]
            .mailbox
            .ok_or(KernelError::NoMailbox)
    }

    /// Messages currently queued for the named task.
    pub(crate) fn used_mbx(&self, name: &str) -> Result<usize, KernelError> {
        Ok(self.mailboxes[self.mailbox_of(name)?].count)
    }

    /// Free slots left in the named task's ring.
    pub(crate) fn free_mbx(&self, name: &str) -> Result<usize, KernelError> {
        let mbx = &self.mailboxes[self.mailbox_of(name)?];
        Ok(mbx.capacity - mbx.count)
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::{kernel, spawn};
    use crate::{
        KernelError, MailboxKind, RecvOutcome, RecvStatus, Wake,
    };

    #[test]
    fn test_fifo_delivery_order() {
        let mut k = kernel();
        let a = spawn(&mut k, "ctl", 1);
        k.create_mbx(a, MailboxKind::Bounded, 8, 16).unwrap();
        k.start().unwrap();

        for i in 0..5u8 {
            k.send_mess_from_isr("ctl", &[i, i + 1]).unwrap();
        }
        for i in 0..5u8 {
            match k.rcv_mess(None).unwrap() {
                RecvStatus::Message(msg) => {
                    assert_eq!(msg.data, [i, i + 1]);
                    assert_eq!(msg.sender, None);
                }
                RecvStatus::Blocked => panic!("message should be queued"),
            }
        }
    }

    #[test]
    fn test_full_ring_rejects_without_corruption() {
        let mut k = kernel();
        let a = spawn(&mut k, "ctl", 1);
        k.create_mbx(a, MailboxKind::Bounded, 4, 8).unwrap();
        k.start().unwrap();

        for i in 0..4u8 {
            k.send_mess_from_isr("ctl", &[i]).unwrap();
        }
        // Fifth and sixth sends both fail the same way; the ring and its
        // counts are untouched.
        assert_eq!(
            k.send_mess_from_isr("ctl", &[9]).unwrap_err(),
            KernelError::MailboxFull
        );
        assert_eq!(
            k.send_mess_from_isr("ctl", &[9]).unwrap_err(),
            KernelError::MailboxFull
        );
        assert_eq!(k.used_mbx("ctl").unwrap(), 4);
        assert_eq!(k.free_mbx("ctl").unwrap(), 0);

        // Draining one message makes room for exactly one more.
        match k.rcv_mess(None).unwrap() {
            RecvStatus::Message(msg) => assert_eq!(msg.data, [0]),
            RecvStatus::Blocked => panic!("message should be queued"),
        }
        k.send_mess_from_isr("ctl", &[4]).unwrap();

        // The oldest survivors come out first, unharmed.
        for expect in 1..5u8 {
            match k.rcv_mess(None).unwrap() {
                RecvStatus::Message(msg) => assert_eq!(msg.data, [expect]),
                RecvStatus::Blocked => panic!("message should be queued"),
            }
        }
    }

    #[test]
    fn test_count_plus_free_equals_capacity() {
        let mut k = kernel();
        let a = spawn(&mut k, "ctl", 1);
        k.create_mbx(a, MailboxKind::Bounded, 4, 8).unwrap();
        k.start().unwrap();

        for sent in 1..=3u8 {
            k.send_mess_from_isr("ctl", &[sent]).unwrap();
            let used = k.used_mbx("ctl").unwrap();
            let free = k.free_mbx("ctl").unwrap();
            assert_eq!(used + free, 4);
            assert_eq!(used, sent as usize);
        }
    }

    #[test]
    fn test_blocked_receive_completed_by_send() {
        let mut k = kernel();
        let a = spawn(&mut k, "ctl", 1);
        k.create_mbx(a, MailboxKind::Bounded, 4, 8).unwrap();
        k.start().unwrap();

        assert_eq!(k.rcv_mess(None).unwrap(), RecvStatus::Blocked);
        assert_eq!(k.running_task(), None);

        k.send_mess_from_isr("ctl", b"go").unwrap();
        k.preemption_point();
        assert_eq!(k.running_task(), Some(a));
        match k.take_wake(a) {
            Some(Wake::Receive(RecvOutcome::Message(msg))) => {
                assert_eq!(msg.data, b"go");
            }
            other => panic!("expected delivered message, got {other:?}"),
        }
        // Handoff leaves nothing banked.
        assert_eq!(k.used_mbx("ctl").unwrap(), 0);
    }

    #[test]
    fn test_receive_timeout_returns_null_sender() {
        let mut k = kernel();
        let a = spawn(&mut k, "ctl", 1);
        let _b = spawn(&mut k, "bg", 2);
        k.create_mbx(a, MailboxKind::Bounded, 4, 8).unwrap();
        k.start().unwrap();

        assert_eq!(k.rcv_mess(Some(2)).unwrap(), RecvStatus::Blocked);
        k.clock_tick();
        k.clock_tick();
        assert_eq!(k.running_task(), Some(a));
        assert_eq!(k.take_wake(a), Some(Wake::Receive(RecvOutcome::TimedOut)));
    }

    #[test]
    fn test_fixed_kind_requires_exact_length() {
        let mut k = kernel();
        let a = spawn(&mut k, "plc", 1);
        k.create_mbx(a, MailboxKind::Fixed, 4, 4).unwrap();
        k.start().unwrap();

        assert_eq!(
            k.send_mess_from_isr("plc", &[1, 2]).unwrap_err(),
            KernelError::MessageSizeMismatch
        );
        k.send_mess_from_isr("plc", &[1, 2, 3, 4]).unwrap();
        assert_eq!(k.used_mbx("plc").unwrap(), 1);
    }

    #[test]
    fn test_bounded_kind_rejects_oversize() {
        let mut k = kernel();
        let a = spawn(&mut k, "ui", 1);
        k.create_mbx(a, MailboxKind::Bounded, 4, 4).unwrap();
        k.start().unwrap();

        assert_eq!(
            k.send_mess_from_isr("ui", &[0; 5]).unwrap_err(),
            KernelError::MessageTooLong
        );
    }

    #[test]
    fn test_flush_resets_ring_and_counts() {
        let mut k = kernel();
        let a = spawn(&mut k, "ctl", 1);
        k.create_mbx(a, MailboxKind::Bounded, 4, 8).unwrap();
        k.start().unwrap();

        for i in 0..3u8 {
            k.send_mess_from_isr("ctl", &[i]).unwrap();
        }
        assert_eq!(k.flush_mbx().unwrap(), 3);
        assert_eq!(k.used_mbx("ctl").unwrap(), 0);
        assert_eq!(k.free_mbx("ctl").unwrap(), 4);

        k.send_mess_from_isr("ctl", &[7]).unwrap();
        match k.rcv_mess(None).unwrap() {
            RecvStatus::Message(msg) => assert_eq!(msg.data, [7]),
            RecvStatus::Blocked => panic!("message should be queued"),
        }
    }

    #[test]
    fn test_send_by_name_records_sender() {
        let mut k = kernel();
        let a = spawn(&mut k, "poser", 1);
        let b = spawn(&mut k, "beacon", 2);
        k.create_mbx(b, MailboxKind::Bounded, 4, 16).unwrap();
        k.start().unwrap();

        // A is running; its send carries its own id as the sender.
        k.send_mess("beacon", b"az=102.5").unwrap();
        assert_eq!(k.used_mbx("beacon").unwrap(), 1);

        // Park A so the beacon task can drain its mailbox.
        let gate = k.create_semaphore(crate::SemKind::Sync).unwrap();
        k.wait(gate).unwrap();
        assert_eq!(k.running_task(), Some(b));
        match k.rcv_mess(None).unwrap() {
            RecvStatus::Message(msg) => {
                assert_eq!(msg.sender, Some(a));
                assert_eq!(msg.data, b"az=102.5");
            }
            RecvStatus::Blocked => panic!("message should be queued"),
        }
    }

    #[test]
    fn test_unknown_destination_name() {
        let mut k = kernel();
        spawn(&mut k, "ctl", 1);
        k.start().unwrap();
        assert_eq!(
            k.send_mess("nobody", b"x").unwrap_err(),
            KernelError::UnknownTaskName
        );
    }

    #[test]
    fn test_second_mailbox_rejected() {
        let mut k = kernel();
        let a = spawn(&mut k, "ctl", 1);
        k.create_mbx(a, MailboxKind::Bounded, 4, 8).unwrap();
        assert_eq!(
            k.create_mbx(a, MailboxKind::Bounded, 4, 8).unwrap_err(),
            KernelError::MailboxExists
        );
    }
}
