//! Pause request gateway.
//!
//! [`PauseDaemon`] owns the long-lived collector thread. Any thread may ask
//! for a pause through [`PauseDaemon::execute`] or
//! [`PauseDaemon::execute_with`]; callers are serialized on a single request
//! slot and each blocks until its own pause has completed.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use stw_pause::{PauseConfig, PauseDaemon};
//!
//! let daemon = PauseDaemon::with_defaults(PauseConfig::default()).unwrap();
//! let collections = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&collections);
//!
//! daemon
//!     .execute_with(move || {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     })
//!     .unwrap();
//! // The routine is remembered for parameterless requests.
//! daemon.execute().unwrap();
//!
//! assert_eq!(collections.load(Ordering::SeqCst), 2);
//! assert_eq!(daemon.stats().pauses, 2);
//! ```

use crate::config::PauseConfig;
use crate::coordinator::{PauseCoordinator, PauseReport};
use crate::error::{FatalPolicy, PauseError, PauseResult, ProtocolViolation, violation_from_panic};
use crate::safepoint::{LatchTrigger, SafepointTrigger};
use crate::stack_map::{NoopStackMaps, StackMapService};
use crate::thread::{CallSite, MutatorState, MutatorThread, ThreadRegistry};
use crate::world_lock::FinalizationLock;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A collection routine: runs once per pause with the world stopped.
pub type Routine = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
enum PauseFailure {
    Violation(ProtocolViolation),
    RoutinePanicked,
}

enum Message {
    Pause {
        routine: Routine,
        done: Sender<Result<PauseReport, PauseFailure>>,
    },
    Shutdown,
}

/// Cumulative pause statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PauseStats {
    pub pauses: u64,
    pub total_pause_time: Duration,
    pub total_stack_map_time: Duration,
}

#[derive(Debug, Default)]
struct StatsCounters {
    pauses: AtomicU64,
    pause_nanos: AtomicU64,
    stack_map_nanos: AtomicU64,
}

impl StatsCounters {
    fn record(&self, report: &PauseReport) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
        add_nanos(&self.pause_nanos, report.pause_time);
        add_nanos(&self.stack_map_nanos, report.stack_map_time);
    }

    fn snapshot(&self) -> PauseStats {
        PauseStats {
            pauses: self.pauses.load(Ordering::Relaxed),
            total_pause_time: Duration::from_nanos(self.pause_nanos.load(Ordering::Relaxed)),
            total_stack_map_time: Duration::from_nanos(
                self.stack_map_nanos.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Saturating accumulation of a duration into a nanosecond counter.
fn add_nanos(counter: &AtomicU64, elapsed: Duration) {
    let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
        Some(total.saturating_add(nanos))
    });
}

/// Gateway to the collector thread.
pub struct PauseDaemon {
    config: PauseConfig,
    registry: Arc<ThreadRegistry>,
    finalization: Arc<FinalizationLock>,
    /// The single request slot. Holding it is owning the next pause; its
    /// content is the routine used by parameterless requests.
    slot: Mutex<Option<Routine>>,
    requests: Sender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stats: StatsCounters,
}

impl PauseDaemon {
    /// Start the collector thread with no routine configured.
    pub fn new(
        config: PauseConfig,
        stack_maps: Arc<dyn StackMapService>,
        trigger: Arc<dyn SafepointTrigger>,
    ) -> PauseResult<Self> {
        let registry = Arc::new(ThreadRegistry::new());
        let finalization = Arc::new(FinalizationLock::new());
        let coordinator = PauseCoordinator::new(
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&finalization),
            stack_maps,
            trigger,
        );

        let (requests, inbox) = channel::unbounded();
        let handle = thread::Builder::new()
            .name(config.daemon_name.clone())
            .spawn(move || serve(coordinator, inbox))?;

        Ok(Self {
            config,
            registry,
            finalization,
            slot: Mutex::new(None),
            requests,
            handle: Mutex::new(Some(handle)),
            stats: StatsCounters::default(),
        })
    }

    /// Start the collector thread with an initial routine.
    pub fn with_routine<F>(
        config: PauseConfig,
        stack_maps: Arc<dyn StackMapService>,
        trigger: Arc<dyn SafepointTrigger>,
        routine: F,
    ) -> PauseResult<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let daemon = Self::new(config, stack_maps, trigger)?;
        *daemon.slot.lock() = Some(Arc::new(routine));
        Ok(daemon)
    }

    /// Start with the software safepoint latch and no stack map service.
    pub fn with_defaults(config: PauseConfig) -> PauseResult<Self> {
        Self::new(config, Arc::new(NoopStackMaps), Arc::new(LatchTrigger))
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn finalization_lock(&self) -> &Arc<FinalizationLock> {
        &self.finalization
    }

    pub fn config(&self) -> &PauseConfig {
        &self.config
    }

    /// A fresh, unregistered mutator that follows this daemon's protocol
    /// settings.
    pub fn new_mutator(&self, id: usize) -> MutatorThread {
        MutatorThread::with_policy(id, self.config.thread_policy())
    }

    pub fn stats(&self) -> PauseStats {
        self.stats.snapshot()
    }

    /// Pause with the most recently configured routine.
    pub fn execute(&self) -> PauseResult<PauseReport> {
        reject_nested()?;
        blocking_in_native(|| {
            let slot = self.slot.lock();
            let routine = slot.clone().ok_or(PauseError::NoRoutine)?;
            self.dispatch(routine)
        })
    }

    /// Pause with `routine`, which also becomes the routine for later
    /// parameterless requests.
    pub fn execute_with<F>(&self, routine: F) -> PauseResult<PauseReport>
    where
        F: Fn() + Send + Sync + 'static,
    {
        reject_nested()?;
        let routine: Routine = Arc::new(routine);
        blocking_in_native(|| {
            let mut slot = self.slot.lock();
            *slot = Some(Arc::clone(&routine));
            self.dispatch(routine)
        })
    }

    /// Send one request and wait for its completion. Callers hold the slot.
    fn dispatch(&self, routine: Routine) -> PauseResult<PauseReport> {
        let (done, completion) = channel::bounded(1);
        self.requests
            .send(Message::Pause { routine, done })
            .map_err(|_| PauseError::DaemonStopped)?;
        let outcome = completion.recv();

        match outcome {
            Ok(Ok(report)) => {
                self.stats.record(&report);
                Ok(report)
            }
            Ok(Err(PauseFailure::Violation(violation))) => Err(PauseError::Fatal(violation)),
            Ok(Err(PauseFailure::RoutinePanicked)) => Err(PauseError::RoutinePanicked),
            Err(_) => Err(PauseError::DaemonStopped),
        }
    }

    /// Stop the collector thread. Later requests fail with
    /// [`PauseError::DaemonStopped`].
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.requests.send(Message::Shutdown);
        if handle.join().is_err() {
            tracing::error!("pause daemon thread panicked");
        }
    }
}

impl Drop for PauseDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run `wait` with the calling mutator, if any, in native code. A caller
/// blocked on the request slot or on its own pause never polls, so it must
/// already be claimable when it starts waiting.
fn blocking_in_native<R>(wait: impl FnOnce() -> R) -> R {
    let caller = MutatorThread::current()
        .filter(|thread| !thread.is_collector())
        .filter(|thread| thread.state() == MutatorState::InApplication);
    let _native = caller
        .as_ref()
        .map(|thread| thread.enter_native(CallSite::capture()));
    wait()
}

fn reject_nested() -> PauseResult<()> {
    match MutatorThread::current() {
        Some(thread) if thread.is_collector() => Err(PauseError::NestedRequest),
        _ => Ok(()),
    }
}

fn serve(coordinator: PauseCoordinator, inbox: Receiver<Message>) {
    coordinator.collector_thread().attach_current();
    tracing::debug!(name = %coordinator.config().daemon_name, "pause daemon started");

    for message in inbox.iter() {
        let (routine, done) = match message {
            Message::Pause { routine, done } => (routine, done),
            Message::Shutdown => break,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| coordinator.run_pause(&*routine)))
            .map_err(|payload| match violation_from_panic(payload.as_ref()) {
                Some(violation) => PauseFailure::Violation(violation),
                None => PauseFailure::RoutinePanicked,
            });

        if let Err(failure) = &outcome {
            if coordinator.config().fatal_policy == FatalPolicy::Abort {
                tracing::error!(?failure, "pause unwound with the world stopped");
                std::process::abort();
            }
            coordinator.abandon();
        }
        let _ = done.send(outcome);
    }

    MutatorThread::detach_current();
    tracing::debug!("pause daemon stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn execute_without_routine_fails() {
        let daemon = PauseDaemon::with_defaults(PauseConfig::for_testing()).unwrap();
        assert!(matches!(daemon.execute(), Err(PauseError::NoRoutine)));
    }

    #[test]
    fn initial_routine_is_used_by_execute() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let daemon = PauseDaemon::with_routine(
            PauseConfig::for_testing(),
            Arc::new(NoopStackMaps),
            Arc::new(LatchTrigger),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        daemon.execute().unwrap();
        daemon.execute().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn execute_with_replaces_default_routine() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let daemon = PauseDaemon::with_defaults(PauseConfig::for_testing()).unwrap();

        let counter = Arc::clone(&first);
        daemon
            .execute_with(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let counter = Arc::clone(&second);
        daemon
            .execute_with(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        daemon.execute().unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nested_request_from_routine_is_rejected() {
        let daemon = Arc::new(PauseDaemon::with_defaults(PauseConfig::for_testing()).unwrap());
        let inner = Arc::clone(&daemon);
        let nested = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&nested);

        // The routine holds a strong reference to the daemon only for this
        // pause; the slot is overwritten below so the daemon can drop.
        daemon
            .execute_with(move || {
                *seen.lock() = Some(matches!(inner.execute(), Err(PauseError::NestedRequest)));
            })
            .unwrap();
        daemon.execute_with(|| {}).unwrap();

        assert_eq!(*nested.lock(), Some(true));
    }

    #[test]
    fn routine_panic_is_reported_without_killing_daemon() {
        let daemon = PauseDaemon::with_defaults(PauseConfig::for_testing()).unwrap();
        let result = daemon.execute_with(|| panic!("collector bug"));
        assert!(matches!(result, Err(PauseError::RoutinePanicked)));

        daemon.execute_with(|| {}).unwrap();
        assert_eq!(daemon.stats().pauses, 1);
    }

    #[test]
    fn stats_saturate_instead_of_wrapping() {
        let counter = AtomicU64::new(u64::MAX - 5);
        add_nanos(&counter, Duration::from_nanos(3));
        assert_eq!(counter.load(Ordering::Relaxed), u64::MAX - 2);

        add_nanos(&counter, Duration::MAX);
        assert_eq!(counter.load(Ordering::Relaxed), u64::MAX);
    }

    #[test]
    fn shutdown_rejects_later_requests() {
        let daemon = PauseDaemon::with_defaults(PauseConfig::for_testing()).unwrap();
        daemon.shutdown();
        daemon.shutdown();
        assert!(matches!(
            daemon.execute_with(|| {}),
            Err(PauseError::DaemonStopped)
        ));
    }
}
