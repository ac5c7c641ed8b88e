//! Thread registry and per-mutator state used by the pause protocol.
//!
//! Every application thread that can touch the managed heap owns a
//! [`MutatorThread`]. Its state word moves through a small, fixed set of
//! transitions, each of which may only be driven by one party:
//!
//! | from            | to              | driven by    |
//! |-----------------|-----------------|--------------|
//! | `InApplication` | `InNativeCode`  | mutator      |
//! | `InNativeCode`  | `InApplication` | mutator      |
//! | `InNativeCode`  | `InGc`          | coordinator  |
//! | `InGc`          | `InNativeCode`  | coordinator  |
//!
//! # Examples
//!
//! ```
//! use stw_pause::thread::{CallSite, MutatorState, MutatorThread, ThreadRegistry};
//!
//! let registry = ThreadRegistry::new();
//! let thread = MutatorThread::new(1);
//! assert!(registry.register(thread.clone()));
//!
//! {
//!     let _native = thread.enter_native(CallSite::new(0x1000, 0x7ff0, 0x7ff8));
//!     assert_eq!(thread.state(), MutatorState::InNativeCode);
//! }
//! assert_eq!(thread.state(), MutatorState::InApplication);
//!
//! assert_eq!(registry.snapshot().len(), 1);
//! assert!(registry.deregister(1).is_some());
//! ```

use crate::config::SyncStrategy;
use crate::error::{FatalPolicy, ProtocolViolation, fatal};
use crate::safepoint::TriggerCallback;
use crossbeam_utils::Backoff;
use parking_lot::{Mutex, MutexGuard};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering, fence};

/// Value of a mutator's state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MutatorState {
    /// Running application code; must be stopped through a safepoint trigger.
    InApplication = 0,
    /// Running native code; already safe, but may return at any moment.
    InNativeCode = 1,
    /// Claimed by the coordinator for the current pause.
    InGc = 2,
}

impl MutatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MutatorState::InApplication,
            1 => MutatorState::InNativeCode,
            _ => MutatorState::InGc,
        }
    }
}

/// Which party performs a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Mutator,
    Coordinator,
}

const TRANSITIONS: [(MutatorState, MutatorState, Driver); 4] = [
    (
        MutatorState::InApplication,
        MutatorState::InNativeCode,
        Driver::Mutator,
    ),
    (
        MutatorState::InNativeCode,
        MutatorState::InApplication,
        Driver::Mutator,
    ),
    (
        MutatorState::InNativeCode,
        MutatorState::InGc,
        Driver::Coordinator,
    ),
    (
        MutatorState::InGc,
        MutatorState::InNativeCode,
        Driver::Coordinator,
    ),
];

/// Whether `driver` may move a state word from `from` to `to`.
pub fn transition_allowed(from: MutatorState, to: MutatorState, driver: Driver) -> bool {
    TRANSITIONS.contains(&(from, to, driver))
}

/// Instruction, stack and frame pointer of the last call out of application
/// code. Only meaningful while the owning thread is outside application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallSite {
    pub instruction_pointer: usize,
    pub stack_pointer: usize,
    pub frame_pointer: usize,
}

impl CallSite {
    pub const fn new(instruction_pointer: usize, stack_pointer: usize, frame_pointer: usize) -> Self {
        Self {
            instruction_pointer,
            stack_pointer,
            frame_pointer,
        }
    }

    pub const fn is_zero(&self) -> bool {
        self.instruction_pointer == 0 && self.stack_pointer == 0 && self.frame_pointer == 0
    }

    /// Approximate call site of the caller: the address of this function
    /// stands in for the return address and a local's address for the stack
    /// and frame pointers.
    #[inline(never)]
    pub fn capture() -> Self {
        let marker = 0u8;
        let stack = std::hint::black_box(&marker) as *const u8 as usize;
        let entry: fn() -> CallSite = CallSite::capture;
        Self {
            instruction_pointer: entry as usize,
            stack_pointer: stack,
            frame_pointer: stack,
        }
    }
}

/// Protocol settings a mutator needs on its own side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThreadPolicy {
    pub strategy: SyncStrategy,
    pub fatal_policy: FatalPolicy,
}

struct MutatorInner {
    id: usize,
    collector: bool,
    policy: ThreadPolicy,
    state: AtomicU8,
    gc_pending: AtomicBool,
    stack_map_prepared: AtomicBool,
    lowest_active_slot: AtomicUsize,
    native_call_site: Mutex<CallSite>,
    trigger_armed: AtomicBool,
    trigger: Mutex<Option<TriggerCallback>>,
    triggers_disabled: AtomicBool,
    allocation_enabled: AtomicBool,
    force_released: AtomicBool,
}

impl MutatorInner {
    fn new(id: usize, collector: bool, policy: ThreadPolicy) -> Self {
        Self {
            id,
            collector,
            policy,
            state: AtomicU8::new(MutatorState::InApplication as u8),
            gc_pending: AtomicBool::new(false),
            stack_map_prepared: AtomicBool::new(false),
            lowest_active_slot: AtomicUsize::new(0),
            native_call_site: Mutex::new(CallSite::default()),
            trigger_armed: AtomicBool::new(false),
            trigger: Mutex::new(None),
            triggers_disabled: AtomicBool::new(false),
            allocation_enabled: AtomicBool::new(true),
            force_released: AtomicBool::new(false),
        }
    }
}

/// Per-thread state block of a mutator.
///
/// Cloning yields another handle to the same block.
pub struct MutatorThread {
    inner: Arc<MutatorInner>,
}

thread_local! {
    static CURRENT: RefCell<Option<MutatorThread>> = const { RefCell::new(None) };
}

impl MutatorThread {
    pub fn new(id: usize) -> Self {
        Self::with_policy(id, ThreadPolicy::default())
    }

    pub fn with_policy(id: usize, policy: ThreadPolicy) -> Self {
        Self {
            inner: Arc::new(MutatorInner::new(id, false, policy)),
        }
    }

    /// State block for a collector thread. Collector threads are skipped by
    /// [`RegistryGuard::for_each_except`].
    pub fn collector(id: usize, policy: ThreadPolicy) -> Self {
        Self {
            inner: Arc::new(MutatorInner::new(id, true, policy)),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn is_collector(&self) -> bool {
        self.inner.collector
    }

    pub fn policy(&self) -> ThreadPolicy {
        self.inner.policy
    }

    pub fn state(&self) -> MutatorState {
        MutatorState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn gc_pending(&self) -> bool {
        self.inner.gc_pending.load(Ordering::Acquire)
    }

    pub fn stack_map_prepared(&self) -> bool {
        self.inner.stack_map_prepared.load(Ordering::Acquire)
    }

    /// Lowest stack slot covered by a partial stack map, or zero when the
    /// thread has not prepared any part of its map.
    pub fn lowest_active_slot(&self) -> usize {
        self.inner.lowest_active_slot.load(Ordering::Acquire)
    }

    pub fn native_call_site(&self) -> CallSite {
        *self.inner.native_call_site.lock()
    }

    pub fn allocation_enabled(&self) -> bool {
        self.inner.allocation_enabled.load(Ordering::Acquire)
    }

    pub fn trigger_installed(&self) -> bool {
        self.inner.trigger_armed.load(Ordering::Acquire)
    }

    /// Make this handle the current thread's mutator.
    pub fn attach_current(&self) {
        CURRENT.with(|current| *current.borrow_mut() = Some(self.clone()));
    }

    pub fn detach_current() {
        CURRENT.with(|current| *current.borrow_mut() = None);
    }

    /// Mutator attached to the calling OS thread, if any.
    pub fn current() -> Option<MutatorThread> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Leave application code. The returned scope re-enters application
    /// code when dropped, waiting out any pause that claimed the thread.
    pub fn enter_native(&self, call_site: CallSite) -> NativeScope<'_> {
        *self.inner.native_call_site.lock() = call_site;
        let from = self.state();
        if from != MutatorState::InApplication {
            self.violation(ProtocolViolation::IllegalTransition {
                thread_id: self.id(),
                from,
                to: MutatorState::InNativeCode,
            });
        }
        self.inner
            .state
            .store(MutatorState::InNativeCode as u8, Ordering::SeqCst);
        NativeScope {
            thread: self,
            _not_send: PhantomData,
        }
    }

    fn leave_native(&self) {
        match self.inner.policy.strategy {
            SyncStrategy::CompareAndSwap => self.leave_native_cas(),
            SyncStrategy::Polling => self.leave_native_polling(),
        }
    }

    fn leave_native_cas(&self) {
        let backoff = Backoff::new();
        loop {
            match self.inner.state.compare_exchange(
                MutatorState::InNativeCode as u8,
                MutatorState::InApplication as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) if observed == MutatorState::InApplication as u8 => {
                    self.violation(ProtocolViolation::IllegalTransition {
                        thread_id: self.id(),
                        from: MutatorState::InApplication,
                        to: MutatorState::InApplication,
                    });
                }
                // Claimed by a pause; stay out until it is released.
                Err(_) => backoff.snooze(),
            }
        }
    }

    fn leave_native_polling(&self) {
        let backoff = Backoff::new();
        loop {
            self.inner
                .state
                .store(MutatorState::InApplication as u8, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if !self.inner.gc_pending.load(Ordering::SeqCst) {
                return;
            }
            self.inner
                .state
                .store(MutatorState::InNativeCode as u8, Ordering::SeqCst);
            while self.inner.gc_pending.load(Ordering::SeqCst) {
                backoff.snooze();
            }
        }
    }

    /// Cooperative safepoint check. Runs the installed trigger callback, if
    /// any, with further triggers disabled.
    #[inline]
    pub fn poll_safepoint(&self) {
        if !self.inner.trigger_armed.load(Ordering::Acquire) {
            return;
        }
        self.poll_safepoint_slow();
    }

    #[cold]
    fn poll_safepoint_slow(&self) {
        if self.inner.triggers_disabled.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = self.inner.trigger.lock().clone();
        if let Some(callback) = callback {
            callback(self);
        }
        self.inner.triggers_disabled.store(false, Ordering::Release);
    }

    pub(crate) fn install_trigger(&self, callback: TriggerCallback) {
        *self.inner.trigger.lock() = Some(callback);
        self.inner.trigger_armed.store(true, Ordering::Release);
    }

    pub(crate) fn clear_trigger(&self) {
        self.inner.trigger_armed.store(false, Ordering::Release);
        *self.inner.trigger.lock() = None;
    }

    pub(crate) fn set_allocation_enabled(&self, enabled: bool) {
        self.inner
            .allocation_enabled
            .store(enabled, Ordering::Release);
    }

    pub(crate) fn mark_lowest_active_slot(&self, slot: usize) {
        self.inner.lowest_active_slot.store(slot, Ordering::Release);
    }

    pub(crate) fn mark_stack_map_prepared(&self) {
        self.inner.stack_map_prepared.store(true, Ordering::Release);
    }

    /// Forget any stack map prepared for the pause that is ending.
    pub(crate) fn clear_stack_map(&self) {
        self.inner.lowest_active_slot.store(0, Ordering::Release);
        self.inner.stack_map_prepared.store(false, Ordering::Release);
    }

    pub(crate) fn set_gc_pending(&self) {
        self.inner.gc_pending.store(true, Ordering::SeqCst);
    }

    /// `InNativeCode -> InGc`. Returns false if the thread was not in native
    /// code when the swap was attempted.
    pub(crate) fn try_claim_native(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                MutatorState::InNativeCode as u8,
                MutatorState::InGc as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Let a stopped thread resume. This is the final write the coordinator
    /// makes to the block during a reset.
    pub(crate) fn release_from_gc(&self, fatal_policy: FatalPolicy) {
        match self.inner.policy.strategy {
            SyncStrategy::CompareAndSwap => {
                self.inner.gc_pending.store(false, Ordering::SeqCst);
                if let Err(observed) = self.inner.state.compare_exchange(
                    MutatorState::InGc as u8,
                    MutatorState::InNativeCode as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    fatal(
                        fatal_policy,
                        ProtocolViolation::IllegalTransition {
                            thread_id: self.id(),
                            from: MutatorState::from_u8(observed),
                            to: MutatorState::InNativeCode,
                        },
                    );
                }
            }
            SyncStrategy::Polling => self.inner.gc_pending.store(false, Ordering::SeqCst),
        }
    }

    /// Release a thread left claimed by a pause that unwound.
    pub(crate) fn force_release(&self) {
        self.inner.force_released.store(true, Ordering::SeqCst);
        self.clear_trigger();
        self.clear_stack_map();
        self.inner.gc_pending.store(false, Ordering::SeqCst);
        let _ = self.inner.state.compare_exchange(
            MutatorState::InGc as u8,
            MutatorState::InNativeCode as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Whether [`MutatorThread::force_release`] ran since the last call.
    pub(crate) fn take_force_released(&self) -> bool {
        self.inner.force_released.swap(false, Ordering::SeqCst)
    }

    fn violation(&self, violation: ProtocolViolation) -> ! {
        fatal(self.inner.policy.fatal_policy, violation)
    }
}

impl Clone for MutatorThread {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl PartialEq for MutatorThread {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MutatorThread {}

impl fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorThread")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("collector", &self.is_collector())
            .finish()
    }
}

/// A stretch of native code on the owning thread.
#[must_use = "the thread re-enters application code when the scope is dropped"]
pub struct NativeScope<'a> {
    thread: &'a MutatorThread,
    _not_send: PhantomData<*const ()>,
}

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        self.thread.leave_native();
    }
}

/// The lockable set of registered mutators.
///
/// Its lock doubles as the parking spot for stopped mutators: a pause holds
/// it from start to finish, so registration, deregistration and
/// [`ThreadRegistry::park`] all block until the pause ends.
#[derive(Default)]
pub struct ThreadRegistry {
    mutators: Mutex<Vec<MutatorThread>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            mutators: Mutex::new(Vec::new()),
        }
    }

    /// Returns false if a mutator with the same id is already registered.
    pub fn register(&self, thread: MutatorThread) -> bool {
        let mut mutators = self.mutators.lock();
        if mutators.iter().any(|existing| existing.id() == thread.id()) {
            return false;
        }
        mutators.push(thread);
        true
    }

    pub fn deregister(&self, id: usize) -> Option<MutatorThread> {
        let mut mutators = self.mutators.lock();
        let position = mutators.iter().position(|thread| thread.id() == id)?;
        Some(mutators.swap_remove(position))
    }

    pub fn get(&self, id: usize) -> Option<MutatorThread> {
        self.mutators
            .lock()
            .iter()
            .find(|thread| thread.id() == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.mutators.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<MutatorThread> {
        self.mutators.lock().clone()
    }

    /// Block until no pause holds the registry lock.
    pub fn park(&self) {
        drop(self.mutators.lock());
    }

    pub(crate) fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            mutators: self.mutators.lock(),
        }
    }
}

impl fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mutators.try_lock() {
            Some(mutators) => f.debug_list().entries(mutators.iter()).finish(),
            None => f.write_str("ThreadRegistry(<locked>)"),
        }
    }
}

/// Exclusive hold on the registry.
pub struct RegistryGuard<'a> {
    mutators: MutexGuard<'a, Vec<MutatorThread>>,
}

impl RegistryGuard<'_> {
    /// Visit every registered mutator other than `current` and collector
    /// threads.
    pub fn for_each_except<F>(&self, current: &MutatorThread, mut visitor: F)
    where
        F: FnMut(&MutatorThread),
    {
        self.mutators
            .iter()
            .filter(|thread| thread.id() != current.id() && !thread.is_collector())
            .for_each(|thread| visitor(thread));
    }

    pub fn len(&self) -> usize {
        self.mutators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::violation_from_panic;
    use std::thread;
    use std::time::Duration;

    fn panicking(strategy: SyncStrategy) -> ThreadPolicy {
        ThreadPolicy {
            strategy,
            fatal_policy: FatalPolicy::Panic,
        }
    }

    #[test]
    fn transition_table_matches_ownership() {
        use MutatorState::*;
        assert!(transition_allowed(InApplication, InNativeCode, Driver::Mutator));
        assert!(transition_allowed(InNativeCode, InApplication, Driver::Mutator));
        assert!(transition_allowed(InNativeCode, InGc, Driver::Coordinator));
        assert!(transition_allowed(InGc, InNativeCode, Driver::Coordinator));

        assert!(!transition_allowed(InApplication, InGc, Driver::Coordinator));
        assert!(!transition_allowed(InNativeCode, InGc, Driver::Mutator));
        assert!(!transition_allowed(InGc, InApplication, Driver::Mutator));
        assert!(!transition_allowed(InGc, InApplication, Driver::Coordinator));
    }

    #[test]
    fn native_scope_records_call_site() {
        let thread = MutatorThread::new(1);
        let site = CallSite::new(0x40, 0x80, 0x88);
        {
            let _native = thread.enter_native(site);
            assert_eq!(thread.state(), MutatorState::InNativeCode);
            assert_eq!(thread.native_call_site(), site);
        }
        assert_eq!(thread.state(), MutatorState::InApplication);
    }

    #[test]
    fn claimed_thread_cannot_leave_native_until_released() {
        let thread = MutatorThread::with_policy(2, panicking(SyncStrategy::CompareAndSwap));
        let worker = thread.clone();
        let (entered_tx, entered_rx) = crossbeam::channel::bounded(1);
        let (claimed_tx, claimed_rx) = crossbeam::channel::bounded::<()>(1);

        let handle = thread::spawn(move || {
            let native = worker.enter_native(CallSite::capture());
            entered_tx.send(()).unwrap();
            claimed_rx.recv().unwrap();
            drop(native);
            worker.state()
        });

        entered_rx.recv().unwrap();
        assert!(thread.try_claim_native());
        claimed_tx.send(()).unwrap();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(thread.state(), MutatorState::InGc);

        thread.release_from_gc(FatalPolicy::Panic);
        assert_eq!(handle.join().unwrap(), MutatorState::InApplication);
    }

    #[test]
    fn polling_strategy_backs_off_while_gc_pending() {
        let thread = MutatorThread::with_policy(3, panicking(SyncStrategy::Polling));
        let worker = thread.clone();
        let native = thread.enter_native(CallSite::capture());
        thread.set_gc_pending();

        let handle = thread::spawn(move || {
            // Simulates the owner returning from native code while a pause is pending.
            worker.leave_native();
            worker.state()
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(thread.state(), MutatorState::InNativeCode);
        thread.release_from_gc(FatalPolicy::Panic);
        assert_eq!(handle.join().unwrap(), MutatorState::InApplication);
        std::mem::forget(native);
    }

    #[test]
    fn entering_native_twice_is_a_violation() {
        let thread = MutatorThread::with_policy(4, panicking(SyncStrategy::CompareAndSwap));
        let _outer = thread.enter_native(CallSite::capture());
        let payload = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _inner = thread.enter_native(CallSite::capture());
        }))
        .expect_err("second native entry must fail");
        assert!(matches!(
            violation_from_panic(payload.as_ref()),
            Some(ProtocolViolation::IllegalTransition { thread_id: 4, .. })
        ));
    }

    #[test]
    fn trigger_runs_with_triggers_disabled() {
        let thread = MutatorThread::new(5);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        thread.install_trigger(Arc::new(move |me: &MutatorThread| {
            counter.fetch_add(1, Ordering::SeqCst);
            // Nested polls inside the callback are ignored.
            me.poll_safepoint();
        }));

        thread.poll_safepoint();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        thread.clear_trigger();
        thread.poll_safepoint();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registry_rejects_duplicates_and_skips_collectors() {
        let registry = ThreadRegistry::new();
        let collector = MutatorThread::collector(usize::MAX, ThreadPolicy::default());
        assert!(registry.register(MutatorThread::new(1)));
        assert!(!registry.register(MutatorThread::new(1)));
        assert!(registry.register(MutatorThread::new(2)));
        assert!(registry.register(MutatorThread::collector(99, ThreadPolicy::default())));

        let guard = registry.lock();
        let mut seen = Vec::new();
        guard.for_each_except(&collector, |thread| seen.push(thread.id()));
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn current_thread_attachment_is_thread_local() {
        let thread = MutatorThread::new(6);
        thread.attach_current();
        assert_eq!(MutatorThread::current(), Some(thread.clone()));

        let other = thread::spawn(|| MutatorThread::current().is_none())
            .join()
            .unwrap();
        assert!(other);

        MutatorThread::detach_current();
        assert!(MutatorThread::current().is_none());
    }
}
