//! Named in-process locks.
//!
//! These locks only serialize tasks inside one process, so that concurrent
//! requests touching the same subnet or port queue here instead of piling up
//! on store row locks. Correctness across processes comes from the store's
//! transactions, never from these locks.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::trace;

use crate::uuid::{NetworkId, PortId};

/// Lock name guarding address ranges and allocations of a network.
#[must_use]
pub fn ipam_lock(network_id: &NetworkId) -> String {
    format!("ipam:{network_id}")
}

/// Lock name guarding a port row and its bindings.
#[must_use]
pub fn port_lock(port_id: &PortId) -> String {
    format!("port:{port_id}")
}

/// Registry of named async mutexes.
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockManager {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock with the given name.
    ///
    /// The lock is held until the returned guard is dropped.
    pub async fn acquire(&self, name: impl Into<String>) -> NamedLockGuard {
        let name = name.into();
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only referenced by the map are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(name.clone()).or_default())
        };

        let guard = mutex.lock_owned().await;
        trace!(lock = %name, "acquired named lock");
        NamedLockGuard {
            name,
            _guard: guard,
        }
    }

    /// Number of locks currently held or waited on.
    #[must_use]
    pub fn active_locks(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("active_locks", &self.active_locks())
            .finish()
    }
}

/// Guard for a named lock.
pub struct NamedLockGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl NamedLockGuard {
    /// Name of the held lock.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for NamedLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLockGuard")
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        trace!(lock = %self.name, "released named lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_lock_names() {
        let network = NetworkId::new_v4();
        let port = PortId::new_v4();
        assert_eq!(ipam_lock(&network), format!("ipam:{network}"));
        assert_eq!(port_lock(&port), format!("port:{port}"));
    }

    #[tokio::test]
    async fn test_guard_reports_name() {
        let locks = LockManager::new();
        let guard = locks.acquire("ipam:a").await;
        assert_eq!(guard.name(), "ipam:a");
        assert_eq!(locks.active_locks(), 1);
        drop(guard);
        assert_eq!(locks.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_distinct_names_do_not_block() {
        let locks = LockManager::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_same_name_blocks_until_released() {
        let locks = LockManager::new();
        let first = locks.acquire("port:1").await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.acquire("port:1")).await;
        assert!(second.is_err());

        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(100), locks.acquire("port:1")).await;
        assert!(third.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_critical_sections_are_serialized() {
        let locks = Arc::new(LockManager::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("shared").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_locks(), 0);
    }
}
