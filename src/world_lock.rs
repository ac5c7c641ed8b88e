//! The two global locks held for the whole of a pause.
//!
//! Lock order is fixed: the deferred-finalization lock first, then the
//! mutator registry lock. [`WorldLock::acquire`] is the only place both are
//! taken, and [`WorldGuard`] releases them innermost first on every exit
//! path, unwinding included.

use crate::thread::{MutatorThread, RegistryGuard, ThreadRegistry};
use parking_lot::{Mutex, MutexGuard};

/// Lock owned by the deferred-finalization subsystem. Finalization must not
/// run while a collection is in progress.
#[derive(Debug, Default)]
pub struct FinalizationLock {
    lock: Mutex<()>,
}

impl FinalizationLock {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }

    /// Hold the lock for a finalization pass. Code that also needs the
    /// registry must use [`WorldLock::acquire`] instead.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

/// Acquires the finalization and registry locks in their fixed order.
pub struct WorldLock;

impl WorldLock {
    pub fn acquire<'a>(
        finalization: &'a FinalizationLock,
        registry: &'a ThreadRegistry,
    ) -> WorldGuard<'a> {
        let finalization = finalization.lock.lock();
        let registry = registry.lock();
        WorldGuard {
            registry,
            _finalization: finalization,
        }
    }
}

/// Both global locks. Fields drop in declaration order, so the registry is
/// released before the finalization lock.
pub struct WorldGuard<'a> {
    registry: RegistryGuard<'a>,
    _finalization: MutexGuard<'a, ()>,
}

impl WorldGuard<'_> {
    pub fn for_each_except<F>(&self, current: &MutatorThread, visitor: F)
    where
        F: FnMut(&MutatorThread),
    {
        self.registry.for_each_except(current, visitor);
    }

    pub fn registered(&self) -> usize {
        self.registry.len()
    }
}
