//! Platform abstraction trait for the UNOS kernel
//!
//! This crate defines the `Platform` trait that allows the kernel to run
//! on different targets (the ground-station controller board, QEMU, host
//! tests) by abstracting the machine-level operations: saved execution
//! contexts, the processor interrupt mask, and debug output.
//!
//! The kernel itself never touches hardware. Everything it needs from the
//! machine comes through this trait, which keeps the scheduler, semaphore,
//! mailbox and timer logic testable on a plain host build.

#![no_std]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicU64, Ordering};

/// Entry function for a kernel task. Tasks never return.
pub type TaskEntry = fn(usize) -> !;

/// Platform abstraction trait
///
/// Implementations provide target-specific functionality for:
/// - Saved execution contexts (create at boot, switch on dispatch)
/// - Interrupt mask control
/// - Idling the CPU when no task is runnable
/// - Debug output
///
/// # Associated Types
///
/// - `Context`: the saved execution state of one task
///   - On the controller board: stack pointer plus callee-saved registers
///   - On host tests: a plain record of what the kernel asked for
pub trait Platform: 'static {
    /// Saved execution context of one task
    type Context;

    // === Contexts ===

    /// Build the initial saved context for a task created at boot.
    ///
    /// # Arguments
    /// * `stack_size` - Requested stack size in bytes
    /// * `entry` - Task entry function
    /// * `arg` - Opaque argument passed to `entry`
    ///
    /// # Returns
    /// * `Ok(Context)` - Context ready for its first dispatch
    /// * `Err(PlatformError::StackAllocationFailed)` - No room for the stack
    fn create_context(
        &self,
        stack_size: usize,
        entry: TaskEntry,
        arg: usize,
    ) -> Result<Self::Context, PlatformError>;

    /// Switch execution from one saved context to another.
    ///
    /// `from` is `None` on the very first dispatch after boot, when there is
    /// no previous task whose state needs saving.
    fn switch_context(&self, from: Option<&mut Self::Context>, to: &mut Self::Context);

    // === Interrupt mask ===

    /// Current state of the processor interrupt mask.
    fn interrupts_enabled(&self) -> bool;

    /// Set the interrupt mask, returning the previous state.
    ///
    /// Returning the previous state is what makes nested disable/restore
    /// brackets (see [`InterruptGuard`]) reentrant.
    fn set_interrupts_enabled(&self, enabled: bool) -> bool;

    // === Idle ===

    /// Park the CPU until the next interrupt.
    ///
    /// Called when every task is blocked. The default is a no-op; hardware
    /// targets map this to a wait-for-interrupt instruction.
    fn wait_for_interrupt(&self) {}

    // === Debug ===

    /// Write a debug message to the target's console/log.
    fn debug_write(&self, msg: &str);
}

/// Platform errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlatformError {
    /// No memory for a task stack
    StackAllocationFailed,
    /// Requested stack size is outside what the target supports
    UnsupportedStackSize,
    /// Operation not supported on this target
    NotSupported,
}

/// RAII interrupt-disable bracket.
///
/// Disables interrupts on construction and restores the *previous* mask
/// state on drop, so nested guards compose: the inner guard's drop leaves
/// interrupts disabled if an outer guard is still alive.
pub struct InterruptGuard<'p, P: Platform> {
    platform: &'p P,
    was_enabled: bool,
}

impl<'p, P: Platform> InterruptGuard<'p, P> {
    /// Disable interrupts, remembering the prior mask state.
    pub fn new(platform: &'p P) -> Self {
        let was_enabled = platform.set_interrupts_enabled(false);
        Self {
            platform,
            was_enabled,
        }
    }

    /// Whether interrupts were enabled when this guard was taken.
    pub fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

impl<P: Platform> Drop for InterruptGuard<'_, P> {
    fn drop(&mut self) {
        self.platform.set_interrupts_enabled(self.was_enabled);
    }
}

/// Saved context used by [`TestPlatform`]: a record of what the kernel
/// asked for, plus a resume counter.
#[derive(Clone, Debug)]
pub struct TestContext {
    /// Sequential id assigned at creation
    pub id: u64,
    /// Stack size the kernel requested
    pub stack_size: usize,
    /// Entry argument the kernel passed
    pub arg: usize,
    /// Number of times this context has been switched to
    pub resumes: u64,
}

/// A minimal test platform for unit testing
///
/// Records context switches and debug output, and models the interrupt
/// mask as a plain flag, so kernel logic can be exercised without any
/// hardware behind it.
#[derive(Default)]
pub struct TestPlatform {
    next_ctx: AtomicU64,
    interrupts: Cell<bool>,
    switches: RefCell<Vec<(Option<u64>, u64)>>,
    debug_log: RefCell<Vec<String>>,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self {
            next_ctx: AtomicU64::new(1),
            interrupts: Cell::new(true),
            switches: RefCell::new(Vec::new()),
            debug_log: RefCell::new(Vec::new()),
        }
    }

    /// Recorded (from, to) context-switch pairs, oldest first.
    pub fn switch_log(&self) -> Vec<(Option<u64>, u64)> {
        self.switches.borrow().clone()
    }

    /// Recorded debug messages, oldest first.
    pub fn debug_log(&self) -> Vec<String> {
        self.debug_log.borrow().clone()
    }
}

// TestPlatform is only accessed from single-threaded test contexts
unsafe impl Send for TestPlatform {}
unsafe impl Sync for TestPlatform {}

impl Platform for TestPlatform {
    type Context = TestContext;

    fn create_context(
        &self,
        stack_size: usize,
        _entry: TaskEntry,
        arg: usize,
    ) -> Result<Self::Context, PlatformError> {
        if stack_size == 0 {
            return Err(PlatformError::UnsupportedStackSize);
        }
        let id = self.next_ctx.fetch_add(1, Ordering::SeqCst);
        Ok(TestContext {
            id,
            stack_size,
            arg,
            resumes: 0,
        })
    }

    fn switch_context(&self, from: Option<&mut Self::Context>, to: &mut Self::Context) {
        to.resumes += 1;
        self.switches
            .borrow_mut()
            .push((from.map(|c| c.id), to.id));
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts.get()
    }

    fn set_interrupts_enabled(&self, enabled: bool) -> bool {
        self.interrupts.replace(enabled)
    }

    fn debug_write(&self, msg: &str) {
        self.debug_log.borrow_mut().push(String::from(msg));
    }
}
