//! Error types for the pause coordinator.
//!
//! Two kinds of failure exist. Gateway errors ([`PauseError`]) are ordinary
//! `Result` values returned to a caller of [`crate::PauseDaemon::execute`].
//! Protocol violations ([`ProtocolViolation`]) are never recoverable: once a
//! stack may have been scanned from inconsistent state the collector cannot be
//! trusted, so [`fatal`] terminates the process (or panics under
//! [`FatalPolicy::Panic`]).

use thiserror::Error;

/// Broken invariants of the stop-the-world protocol.
///
/// # Examples
///
/// ```
/// use stw_pause::error::ProtocolViolation;
///
/// let violation = ProtocolViolation::StaleStackMap { thread_id: 3 };
/// assert_eq!(
///     violation.to_string(),
///     "mutator 3 has a prepared stack map before the pause started"
/// );
/// ```
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("mutator {thread_id} has a prepared stack map before the pause started")]
    StaleStackMap { thread_id: usize },
    #[error("stack reference map preparer for mutator {thread_id} should be cleared before GC")]
    MarkerSetBeforeTrap { thread_id: usize },
    #[error("stack reference map preparer for mutator {thread_id} should be cleared after GC")]
    MarkerSetAfterTrap { thread_id: usize },
    #[error("mutator {thread_id} trapped while not in application code")]
    TrappedOutsideApplication { thread_id: usize },
    #[error("mutator {thread_id} stopped at a safepoint has no native caller snapshot")]
    TrappedWithoutCallSite { thread_id: usize },
    #[error("mutator {thread_id} in native code has no captured call site")]
    NativeWithoutCallSite { thread_id: usize },
    #[error("mutator {thread_id} has an incomplete stack map at collection time")]
    IncompleteStackMap { thread_id: usize },
    #[error("collector frame reference map changed between preparation and collection")]
    CollectorFrameMismatch,
    #[error("illegal transition of mutator {thread_id} from {from:?} to {to:?}")]
    IllegalTransition {
        thread_id: usize,
        from: crate::thread::MutatorState,
        to: crate::thread::MutatorState,
    },
}

/// Errors returned by the pause gateway.
#[derive(Error, Debug)]
pub enum PauseError {
    #[error("no collection routine configured")]
    NoRoutine,
    #[error("pause requested from inside a running pause")]
    NestedRequest,
    #[error("pause daemon is not running")]
    DaemonStopped,
    #[error("collection routine panicked")]
    RoutinePanicked,
    #[error("fatal protocol violation: {0}")]
    Fatal(ProtocolViolation),
    #[error("failed to spawn pause daemon: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type for gateway operations.
pub type PauseResult<T> = Result<T, PauseError>;

/// What [`fatal`] does after logging a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Abort the process.
    #[default]
    Abort,
    /// Unwind with the violation as panic payload. Scoped lock guards are
    /// released on the way out; used by tests that provoke violations.
    Panic,
}

/// Report an unrecoverable protocol violation.
#[cold]
pub fn fatal(policy: FatalPolicy, violation: ProtocolViolation) -> ! {
    tracing::error!(%violation, "stop-the-world protocol violation");
    match policy {
        FatalPolicy::Abort => std::process::abort(),
        FatalPolicy::Panic => std::panic::panic_any(violation),
    }
}

/// Recover a violation from a panic payload produced by [`fatal`].
pub fn violation_from_panic(payload: &(dyn std::any::Any + Send)) -> Option<ProtocolViolation> {
    payload.downcast_ref::<ProtocolViolation>().copied()
}
