//! Test utilities shared by unit and integration tests.
//!
//! [`RecordingStackMaps`] records every call the pause protocol makes into a
//! stack map service, and [`MutatorHarness`] runs registered mutators on real
//! OS threads that either spin in application code or sit in native code.

use crate::stack_map::StackMapService;
use crate::thread::{CallSite, MutatorState, MutatorThread, ThreadRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Stack map service that records calls instead of scanning anything.
#[derive(Debug)]
pub struct RecordingStackMaps {
    own: AtomicUsize,
    own_by_thread: Mutex<Vec<usize>>,
    completed: Mutex<Vec<(usize, CallSite, bool)>>,
    collector: AtomicUsize,
    consistent: AtomicBool,
}

impl Default for RecordingStackMaps {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingStackMaps {
    pub fn new() -> Self {
        Self {
            own: AtomicUsize::new(0),
            own_by_thread: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            collector: AtomicUsize::new(0),
            consistent: AtomicBool::new(true),
        }
    }

    pub fn own_preparations(&self) -> usize {
        self.own.load(Ordering::SeqCst)
    }

    /// Ids of threads that prepared their own top frames, in call order.
    pub fn own_prepared_threads(&self) -> Vec<usize> {
        self.own_by_thread.lock().clone()
    }

    /// `(thread id, call site, top frames already prepared)` per completion.
    pub fn completions(&self) -> Vec<(usize, CallSite, bool)> {
        self.completed.lock().clone()
    }

    pub fn collector_preparations(&self) -> usize {
        self.collector.load(Ordering::SeqCst)
    }

    pub fn set_collector_frame_consistent(&self, consistent: bool) {
        self.consistent.store(consistent, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.own.store(0, Ordering::SeqCst);
        self.own_by_thread.lock().clear();
        self.completed.lock().clear();
        self.collector.store(0, Ordering::SeqCst);
    }
}

impl StackMapService for RecordingStackMaps {
    fn prepare_own_stack_map(&self, thread: &MutatorThread) -> Duration {
        self.own.fetch_add(1, Ordering::SeqCst);
        self.own_by_thread.lock().push(thread.id());
        Duration::from_nanos(1)
    }

    fn complete_stack_map(&self, thread: &MutatorThread, call_site: CallSite) -> Duration {
        self.completed
            .lock()
            .push((thread.id(), call_site, thread.lowest_active_slot() != 0));
        Duration::from_nanos(1)
    }

    fn prepare_collector_stack_map(&self) -> Duration {
        self.collector.fetch_add(1, Ordering::SeqCst);
        Duration::from_nanos(1)
    }

    fn collector_frame_consistent(&self) -> bool {
        self.consistent.load(Ordering::SeqCst)
    }
}

/// How a harness thread behaves until it is told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutatorBehavior {
    /// Loop in application code, polling the safepoint latch.
    Spin,
    /// Sit in native code.
    Native,
}

/// A registered mutator running on its own OS thread.
pub struct MutatorHarness {
    pub thread: MutatorThread,
    stop: Arc<AtomicBool>,
    polls: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl MutatorHarness {
    /// Register `thread` and start it. Returns once the thread has reached
    /// its steady state.
    pub fn start(registry: &ThreadRegistry, thread: MutatorThread, behavior: MutatorBehavior) -> Self {
        assert!(registry.register(thread.clone()), "duplicate mutator id");
        let stop = Arc::new(AtomicBool::new(false));
        let polls = Arc::new(AtomicUsize::new(0));
        let (ready_tx, ready_rx) = crossbeam::channel::bounded(1);

        let handle = {
            let thread = thread.clone();
            let stop = Arc::clone(&stop);
            let polls = Arc::clone(&polls);
            thread::Builder::new()
                .name(format!("mutator-{}", thread.id()))
                .spawn(move || {
                    thread.attach_current();
                    match behavior {
                        MutatorBehavior::Spin => {
                            let _ = ready_tx.send(());
                            while !stop.load(Ordering::Acquire) {
                                thread.poll_safepoint();
                                polls.fetch_add(1, Ordering::Relaxed);
                                std::hint::spin_loop();
                            }
                        }
                        MutatorBehavior::Native => {
                            let _native = thread.enter_native(CallSite::capture());
                            let _ = ready_tx.send(());
                            while !stop.load(Ordering::Acquire) {
                                thread::sleep(Duration::from_millis(1));
                            }
                        }
                    }
                    MutatorThread::detach_current();
                })
                .expect("spawn mutator thread")
        };
        ready_rx.recv().expect("mutator thread started");

        Self {
            thread,
            stop,
            polls,
            handle: Some(handle),
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::Relaxed)
    }

    /// Stop the OS thread and wait for it to exit.
    pub fn join(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.join().expect("mutator thread panicked");
        }
    }
}

impl Drop for MutatorHarness {
    fn drop(&mut self) {
        if !thread::panicking() {
            self.finish();
        }
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Wait until `thread` reports `state`.
pub fn wait_for_state(thread: &MutatorThread, state: MutatorState) -> bool {
    wait_for(Duration::from_secs(5), || thread.state() == state)
}
