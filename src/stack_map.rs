//! Stack reference map preparation.
//!
//! Computing which stack slots hold live references is the runtime's job.
//! The pause protocol only divides the work: a mutator stopped by a trap
//! prepares the frames above its trap point itself, and the coordinator
//! completes the rest of the stack from the thread's last native call site.
//! A mutator stopped in native code has its whole map prepared by the
//! coordinator.

use crate::thread::{CallSite, MutatorThread};
use std::time::Duration;

/// Builds stack reference maps for mutator threads.
///
/// Each method is called at most once per thread per pause and returns the
/// time spent.
pub trait StackMapService: Send + Sync + 'static {
    /// Called on the mutator's own thread from inside its trap callback.
    fn prepare_own_stack_map(&self, thread: &MutatorThread) -> Duration;

    /// Called by the coordinator once `thread` is quiescent. `call_site` is
    /// the thread's last exit from application code. When
    /// [`MutatorThread::lowest_active_slot`] is non-zero the frames below it
    /// are already prepared.
    fn complete_stack_map(&self, thread: &MutatorThread, call_site: CallSite) -> Duration;

    /// Prepare the coordinator's own frame immediately before the collection
    /// routine runs.
    fn prepare_collector_stack_map(&self) -> Duration {
        Duration::ZERO
    }

    /// Whether the reference map prepared for the coordinator's frame still
    /// describes the frame at the routine call.
    fn collector_frame_consistent(&self) -> bool {
        true
    }
}

/// Service for runtimes without precise stack maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStackMaps;

impl StackMapService for NoopStackMaps {
    fn prepare_own_stack_map(&self, _thread: &MutatorThread) -> Duration {
        Duration::ZERO
    }

    fn complete_stack_map(&self, _thread: &MutatorThread, _call_site: CallSite) -> Duration {
        Duration::ZERO
    }
}
