//! Stop-the-world pause coordination for a managed-runtime garbage collector.
//!
//! A [`PauseDaemon`] brings every registered mutator thread to a safe,
//! simultaneous stop, runs a collection routine while the world is frozen,
//! and restarts each mutator where it was interrupted. The collection
//! algorithm, the stack map builder and the trap mechanism are supplied by
//! the runtime through [`StackMapService`] and [`SafepointTrigger`].

pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod safepoint;
pub mod stack_map;
pub mod test_utils;
pub mod thread;
pub mod world_lock;

pub use config::{PauseConfig, SyncStrategy};
pub use coordinator::{PauseCoordinator, PausePhase, PauseReport, stop_for_collection};
pub use daemon::{PauseDaemon, PauseStats, Routine};
pub use error::{FatalPolicy, PauseError, PauseResult, ProtocolViolation};
pub use safepoint::{LatchTrigger, SafepointTrigger, TriggerCallback, pollcheck};
pub use stack_map::{NoopStackMaps, StackMapService};
pub use thread::{CallSite, MutatorState, MutatorThread, NativeScope, ThreadRegistry};
pub use world_lock::{FinalizationLock, WorldGuard, WorldLock};
