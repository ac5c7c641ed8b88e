//! Safepoint triggers.
//!
//! A trigger arranges for a mutator running application code to invoke a
//! callback at its next cooperative check. The protocol only needs to install
//! and clear triggers; how they fire is up to the runtime. [`LatchTrigger`]
//! is the software implementation: it arms a per-thread latch that
//! [`MutatorThread::poll_safepoint`] (or [`pollcheck`]) tests with a single
//! load and branch.
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use stw_pause::safepoint::{LatchTrigger, SafepointTrigger};
//! use stw_pause::thread::MutatorThread;
//!
//! let thread = MutatorThread::new(1);
//! let fired = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&fired);
//!
//! LatchTrigger.install(&thread, Arc::new(move |_: &MutatorThread| {
//!     flag.store(true, Ordering::SeqCst);
//! }));
//! thread.poll_safepoint();
//! assert!(fired.load(Ordering::SeqCst));
//!
//! LatchTrigger.clear(&thread);
//! assert!(!thread.trigger_installed());
//! ```

use crate::thread::MutatorThread;
use std::sync::Arc;

/// Callback run on the mutator's own thread when its trigger fires.
pub type TriggerCallback = Arc<dyn Fn(&MutatorThread) + Send + Sync>;

/// Installs and removes per-thread execution traps.
///
/// Both operations must be idempotent. Callbacks run with triggers disabled
/// on the thread that takes the trap.
pub trait SafepointTrigger: Send + Sync + 'static {
    fn install(&self, thread: &MutatorThread, callback: TriggerCallback);
    fn clear(&self, thread: &MutatorThread);
}

/// Software safepoint latch polled by [`MutatorThread::poll_safepoint`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LatchTrigger;

impl SafepointTrigger for LatchTrigger {
    fn install(&self, thread: &MutatorThread, callback: TriggerCallback) {
        thread.install_trigger(callback);
    }

    fn clear(&self, thread: &MutatorThread) {
        thread.clear_trigger();
    }
}

/// Poll the safepoint latch of the mutator attached to the calling thread.
///
/// A no-op on threads without an attached mutator.
#[inline]
pub fn pollcheck() {
    if let Some(thread) = MutatorThread::current() {
        thread.poll_safepoint();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn install_is_idempotent() {
        let thread = MutatorThread::new(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let callback: TriggerCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        LatchTrigger.install(&thread, Arc::clone(&callback));
        LatchTrigger.install(&thread, callback);
        thread.poll_safepoint();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        LatchTrigger.clear(&thread);
        LatchTrigger.clear(&thread);
        thread.poll_safepoint();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pollcheck_uses_attached_mutator() {
        pollcheck();

        let thread = MutatorThread::new(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        LatchTrigger.install(
            &thread,
            Arc::new(move |me: &MutatorThread| {
                assert_eq!(me.id(), 2);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        thread.attach_current();
        pollcheck();
        MutatorThread::detach_current();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
