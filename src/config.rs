//! Pause coordinator configuration.

use crate::error::FatalPolicy;
use crate::thread::ThreadPolicy;

/// How the coordinator detects and claims a mutator sitting in native code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStrategy {
    /// Atomically swing `InNativeCode -> InGc`. The mutator leaving native
    /// code must swing `InNativeCode -> InApplication`, so it cannot slip out
    /// once claimed.
    #[default]
    CompareAndSwap,
    /// The coordinator only reads the state word. A mutator leaving native
    /// code publishes `InApplication`, fences, and backs off into native code
    /// while its GC-pending flag is set.
    Polling,
}

/// Configuration for [`crate::PauseDaemon`].
///
/// # Examples
///
/// ```
/// use stw_pause::{PauseConfig, SyncStrategy};
///
/// let config = PauseConfig::default();
/// assert_eq!(config.strategy, SyncStrategy::CompareAndSwap);
/// assert!(!config.trace_phases);
///
/// let tracing = PauseConfig {
///     trace_phases: true,
///     trace_time: true,
///     ..PauseConfig::default()
/// };
/// assert!(tracing.trace_time);
/// ```
#[derive(Debug, Clone)]
pub struct PauseConfig {
    pub strategy: SyncStrategy,
    /// Emit an event for each protocol phase and each stopped mutator.
    pub trace_phases: bool,
    /// Emit a timing summary at the end of every pause.
    pub trace_time: bool,
    pub fatal_policy: FatalPolicy,
    /// Name of the coordinator thread.
    pub daemon_name: String,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            strategy: SyncStrategy::CompareAndSwap,
            trace_phases: false,
            trace_time: false,
            fatal_policy: FatalPolicy::Abort,
            daemon_name: "stw-pause".to_string(),
        }
    }
}

impl PauseConfig {
    /// Configuration used by the test suite: violations panic instead of
    /// aborting so they can be asserted on.
    pub fn for_testing() -> Self {
        Self {
            fatal_policy: FatalPolicy::Panic,
            ..Self::default()
        }
    }

    /// The part of the configuration mutator threads act on.
    pub fn thread_policy(&self) -> ThreadPolicy {
        ThreadPolicy {
            strategy: self.strategy,
            fatal_policy: self.fatal_policy,
        }
    }
}
