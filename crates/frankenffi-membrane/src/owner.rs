//! Execution-owner identity for confined arenas.
//!
//! Every thread has a lazily assigned [`OwnerId`]. The scheduler overrides it
//! while a task is being polled by entering an [`OwnerScope`], so confinement
//! follows the logical task across carrier threads rather than the thread
//! that happens to run it. A scope can also carry an [`ArenaLedger`] that
//! records confined arenas opened inside it.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arena::ArenaLedger;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Identity of a thread or task that may own confined arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Allocate a process-unique owner identity.
    #[must_use]
    pub fn fresh() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

struct Installed {
    owner: OwnerId,
    ledger: Option<Arc<ArenaLedger>>,
}

std::thread_local! {
    static THREAD_OWNER: OwnerId = OwnerId::fresh();
    static CURRENT: RefCell<Option<Installed>> = const { RefCell::new(None) };
}

/// Owner identity of the current execution flow.
#[must_use]
pub fn current_owner() -> OwnerId {
    CURRENT
        .with(|cell| cell.borrow().as_ref().map(|installed| installed.owner))
        .unwrap_or_else(|| THREAD_OWNER.with(|owner| *owner))
}

/// Ledger of the innermost scope, if it carries one.
pub(crate) fn current_ledger() -> Option<Arc<ArenaLedger>> {
    CURRENT.with(|cell| {
        cell.borrow()
            .as_ref()
            .and_then(|installed| installed.ledger.clone())
    })
}

/// RAII guard that installs an owner identity on the current thread.
///
/// Dropping the guard restores whatever was installed before, so scopes nest.
pub struct OwnerScope {
    previous: Option<Installed>,
    // Scopes are tied to the thread-local slot they modified.
    _not_send: PhantomData<*const ()>,
}

impl OwnerScope {
    /// Install `owner` (and optionally a ledger) until the guard is dropped.
    #[must_use]
    pub fn enter(owner: OwnerId, ledger: Option<Arc<ArenaLedger>>) -> Self {
        let previous = CURRENT.with(|cell| cell.replace(Some(Installed { owner, ledger })));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for OwnerScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|cell| {
            *cell.borrow_mut() = previous;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_owner_is_stable() {
        assert_eq!(current_owner(), current_owner());
    }

    #[test]
    fn threads_get_distinct_owners() {
        let here = current_owner();
        let there = std::thread::spawn(current_owner).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn scopes_nest_and_restore() {
        let base = current_owner();
        let outer = OwnerId::fresh();
        let inner = OwnerId::fresh();
        {
            let _outer = OwnerScope::enter(outer, None);
            assert_eq!(current_owner(), outer);
            {
                let _inner = OwnerScope::enter(inner, None);
                assert_eq!(current_owner(), inner);
            }
            assert_eq!(current_owner(), outer);
        }
        assert_eq!(current_owner(), base);
    }

    #[test]
    fn ledger_travels_with_scope() {
        assert!(current_ledger().is_none());
        let ledger = Arc::new(ArenaLedger::new());
        let _scope = OwnerScope::enter(OwnerId::fresh(), Some(Arc::clone(&ledger)));
        let installed = current_ledger().expect("ledger installed");
        assert!(Arc::ptr_eq(&installed, &ledger));
    }
}
