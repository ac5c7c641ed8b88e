//! Stop-the-world pause protocol.
//!
//! One run of [`PauseCoordinator::run_pause`] moves through
//! `Idle -> Stopping -> WaitingQuiescent -> Collecting -> Resetting -> Idle`
//! on the collector thread:
//!
//! 1. Take the finalization and registry locks (held for the whole pause)
//!    and disable the collector's own allocation.
//! 2. Stop every other mutator. Threads in native code are claimed directly;
//!    the rest get the GC-pending flag and a safepoint trigger whose callback
//!    runs [`stop_for_collection`] on the mutator itself. A store-load fence
//!    follows.
//! 3. Wait until each mutator is quiescent and complete its stack map.
//! 4. Run the collection routine.
//! 5. Reset every mutator, releasing it last.
//! 6. Drop the locks and re-enable allocation.

use crate::config::{PauseConfig, SyncStrategy};
use crate::error::{FatalPolicy, ProtocolViolation, fatal};
use crate::safepoint::{SafepointTrigger, TriggerCallback};
use crate::stack_map::StackMapService;
use crate::thread::{CallSite, MutatorState, MutatorThread, ThreadRegistry};
use crate::world_lock::{FinalizationLock, WorldLock};
use crossbeam_utils::Backoff;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering, fence};
use std::thread;
use std::time::{Duration, Instant};

/// Id of the coordinator's own state block.
pub const COLLECTOR_THREAD_ID: usize = usize::MAX;

/// Phase of the pause state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PausePhase {
    Idle = 0,
    Stopping = 1,
    WaitingQuiescent = 2,
    Collecting = 3,
    Resetting = 4,
}

impl From<u8> for PausePhase {
    fn from(value: u8) -> Self {
        match value {
            1 => PausePhase::Stopping,
            2 => PausePhase::WaitingQuiescent,
            3 => PausePhase::Collecting,
            4 => PausePhase::Resetting,
            _ => PausePhase::Idle,
        }
    }
}

/// What a single pause did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PauseReport {
    /// Mutators claimed while in native code.
    pub stopped_in_native: usize,
    /// Mutators stopped through their safepoint trigger.
    pub stopped_at_trap: usize,
    /// Stack map time spent on the collector thread.
    pub stack_map_time: Duration,
    /// Wall time from lock acquisition to release.
    pub pause_time: Duration,
}

impl PauseReport {
    pub fn mutators_stopped(&self) -> usize {
        self.stopped_in_native + self.stopped_at_trap
    }
}

/// Drives the pause protocol. Only the collector thread calls
/// [`PauseCoordinator::run_pause`].
pub struct PauseCoordinator {
    config: PauseConfig,
    registry: Arc<ThreadRegistry>,
    finalization: Arc<FinalizationLock>,
    stack_maps: Arc<dyn StackMapService>,
    trigger: Arc<dyn SafepointTrigger>,
    stop_callback: TriggerCallback,
    this: MutatorThread,
    phase: AtomicU8,
}

impl PauseCoordinator {
    pub fn new(
        config: PauseConfig,
        registry: Arc<ThreadRegistry>,
        finalization: Arc<FinalizationLock>,
        stack_maps: Arc<dyn StackMapService>,
        trigger: Arc<dyn SafepointTrigger>,
    ) -> Self {
        let stop_callback: TriggerCallback = {
            let registry = Arc::clone(&registry);
            let stack_maps = Arc::clone(&stack_maps);
            let policy = config.fatal_policy;
            Arc::new(move |thread: &MutatorThread| {
                stop_for_collection(thread, &registry, stack_maps.as_ref(), policy);
            })
        };
        let this = MutatorThread::collector(COLLECTOR_THREAD_ID, config.thread_policy());

        Self {
            config,
            registry,
            finalization,
            stack_maps,
            trigger,
            stop_callback,
            this,
            phase: AtomicU8::new(PausePhase::Idle as u8),
        }
    }

    pub fn phase(&self) -> PausePhase {
        PausePhase::from(self.phase.load(Ordering::Acquire))
    }

    pub fn collector_thread(&self) -> &MutatorThread {
        &self.this
    }

    pub fn config(&self) -> &PauseConfig {
        &self.config
    }

    fn set_phase(&self, phase: PausePhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Run one complete pause around `routine`.
    pub fn run_pause(&self, routine: &dyn Fn()) -> PauseReport {
        let world = WorldLock::acquire(&self.finalization, &self.registry);
        let started = Instant::now();
        self.this.set_allocation_enabled(false);
        let mut report = PauseReport::default();

        self.set_phase(PausePhase::Stopping);
        if self.config.trace_phases {
            tracing::debug!(mutators = world.registered(), "triggering safepoints for all mutators");
        }
        world.for_each_except(&self.this, |thread| self.stop_mutator(thread));
        // Publish every GC-pending flag before any state word is read.
        fence(Ordering::SeqCst);

        self.set_phase(PausePhase::WaitingQuiescent);
        if self.config.trace_phases {
            tracing::debug!("waiting for all mutators to stop");
        }
        world.for_each_except(&self.this, |thread| {
            self.wait_until_non_mutating(thread, &mut report)
        });
        world.for_each_except(&self.this, |thread| {
            if !thread.stack_map_prepared() {
                self.violation(ProtocolViolation::IncompleteStackMap {
                    thread_id: thread.id(),
                });
            }
        });

        self.set_phase(PausePhase::Collecting);
        if self.config.trace_phases {
            tracing::debug!("running collection routine");
        }
        report.stack_map_time += self.stack_maps.prepare_collector_stack_map();
        if !self.stack_maps.collector_frame_consistent() {
            self.violation(ProtocolViolation::CollectorFrameMismatch);
        }
        routine();

        self.set_phase(PausePhase::Resetting);
        if self.config.trace_phases {
            tracing::debug!("resetting mutators");
        }
        world.for_each_except(&self.this, |thread| self.reset_mutator(thread));

        report.pause_time = started.elapsed();
        drop(world);
        self.this.set_allocation_enabled(true);
        self.set_phase(PausePhase::Idle);

        if self.config.trace_time {
            tracing::info!(
                stack_map_time = ?report.stack_map_time,
                pause_time = ?report.pause_time,
                stopped_in_native = report.stopped_in_native,
                stopped_at_trap = report.stopped_at_trap,
                "stop-the-world pause complete"
            );
        }
        if self.config.trace_phases {
            tracing::debug!("completed pause request");
        }
        report
    }

    /// Put every mutator back into a runnable state after a pause unwound
    /// part way through. Only reachable under [`FatalPolicy::Panic`].
    pub(crate) fn abandon(&self) {
        for thread in self.registry.snapshot() {
            thread.force_release();
        }
        self.this.set_allocation_enabled(true);
        self.set_phase(PausePhase::Idle);
    }

    fn stop_mutator(&self, thread: &MutatorThread) {
        if thread.stack_map_prepared() {
            self.violation(ProtocolViolation::StaleStackMap {
                thread_id: thread.id(),
            });
        }
        thread.take_force_released();
        thread.set_gc_pending();
        if self.config.strategy == SyncStrategy::CompareAndSwap && thread.try_claim_native() {
            return;
        }
        self.trigger.install(thread, Arc::clone(&self.stop_callback));
    }

    fn wait_until_non_mutating(&self, thread: &MutatorThread, report: &mut PauseReport) {
        let backoff = Backoff::new();
        loop {
            let quiescent = match (self.config.strategy, thread.state()) {
                (SyncStrategy::CompareAndSwap, MutatorState::InGc) => true,
                (SyncStrategy::CompareAndSwap, MutatorState::InNativeCode) => {
                    thread.try_claim_native()
                }
                (SyncStrategy::Polling, MutatorState::InNativeCode) => true,
                _ => false,
            };
            if quiescent {
                break;
            }
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }

        let was_in_native = thread.lowest_active_slot() == 0;
        if self.config.trace_phases {
            tracing::debug!(
                thread = thread.id(),
                was_in_native,
                "stopped mutator thread which was in {}",
                if was_in_native { "native code" } else { "application code" }
            );
        }

        let call_site = thread.native_call_site();
        if was_in_native {
            if call_site.is_zero() {
                self.violation(ProtocolViolation::NativeWithoutCallSite {
                    thread_id: thread.id(),
                });
            }
            report.stopped_in_native += 1;
        } else {
            if call_site.instruction_pointer == 0 {
                self.violation(ProtocolViolation::TrappedWithoutCallSite {
                    thread_id: thread.id(),
                });
            }
            report.stopped_at_trap += 1;
        }
        report.stack_map_time += self.stack_maps.complete_stack_map(thread, call_site);
        thread.mark_stack_map_prepared();
    }

    fn reset_mutator(&self, thread: &MutatorThread) {
        if self.config.trace_phases {
            tracing::debug!(thread = thread.id(), "resetting mutator thread");
        }
        thread.clear_stack_map();
        self.trigger.clear(thread);
        thread.release_from_gc(self.config.fatal_policy);
    }

    fn violation(&self, violation: ProtocolViolation) -> ! {
        fatal(self.config.fatal_policy, violation)
    }
}

/// Mutator-side half of the protocol, run from the safepoint trigger with
/// triggers disabled. Prepares the top of the thread's stack map, then parks
/// on the registry lock until the pause is over.
pub fn stop_for_collection(
    thread: &MutatorThread,
    registry: &ThreadRegistry,
    stack_maps: &dyn StackMapService,
    policy: FatalPolicy,
) {
    thread.set_allocation_enabled(false);
    if thread.state() != MutatorState::InApplication {
        fatal(
            policy,
            ProtocolViolation::TrappedOutsideApplication {
                thread_id: thread.id(),
            },
        );
    }
    if thread.lowest_active_slot() != 0 {
        fatal(
            policy,
            ProtocolViolation::MarkerSetBeforeTrap {
                thread_id: thread.id(),
            },
        );
    }

    let call_site = CallSite::capture();
    let _ = stack_maps.prepare_own_stack_map(thread);
    thread.mark_lowest_active_slot(call_site.stack_pointer.max(1));

    {
        let _native = thread.enter_native(call_site);
        registry.park();
    }

    if thread.lowest_active_slot() != 0 {
        // Set after an unwound pause already released this thread.
        if thread.take_force_released() {
            thread.clear_stack_map();
        } else {
            fatal(
                policy,
                ProtocolViolation::MarkerSetAfterTrap {
                    thread_id: thread.id(),
                },
            );
        }
    }
    thread.set_allocation_enabled(true);
}
