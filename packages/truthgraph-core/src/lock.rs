//! Named async locks
//!
//! One lazily created `tokio::sync::Mutex` per `namespace.key`. Guards are
//! owned, so they can be held across awaits and are released on drop
//! whether the holder returns, fails or is cancelled. Acquiring a key that
//! the current task already holds deadlocks.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::config::LockSettings;
use crate::error::{GraphError, Result};

/// Lock namespaces used by the core and its collaborators
pub mod namespace {
    /// Schema and graph migrations, keyed by branch
    pub const MIGRATION: &str = "migration";
    /// Branch merge and rebase, keyed by branch
    pub const BRANCH: &str = "branch";
    /// Repository sync, keyed by repository name
    pub const REPOSITORY: &str = "repository";
    /// Artifact generation, keyed by target and definition
    pub const ARTIFACT: &str = "artifact";
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!(lock = %self.name, "lock released");
    }
}

pub struct LockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl LockRegistry {
    pub fn new(settings: &LockSettings) -> Self {
        Self::with_timeout(settings.acquire_timeout())
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    /// `namespace.key`, or the bare key without a namespace
    pub fn lock_name(key: &str, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) => format!("{}.{}", ns, key),
            None => key.to_string(),
        }
    }

    fn get(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait until the lock is free and take it
    pub async fn acquire(&self, key: &str, namespace: Option<&str>) -> LockGuard {
        let name = Self::lock_name(key, namespace);
        let guard = self.get(&name).lock_owned().await;
        debug!(lock = %name, "lock acquired");
        LockGuard {
            name,
            _guard: guard,
        }
    }

    /// Like [`acquire`](Self::acquire), giving up after the configured wait
    pub async fn acquire_timeout(&self, key: &str, namespace: Option<&str>) -> Result<LockGuard> {
        let name = Self::lock_name(key, namespace);
        let lock = self.get(&name);
        match tokio::time::timeout(self.timeout, lock.lock_owned()).await {
            Ok(guard) => {
                debug!(lock = %name, "lock acquired");
                Ok(LockGuard {
                    name,
                    _guard: guard,
                })
            }
            Err(_) => Err(GraphError::Conflict(format!(
                "lock '{}' is still held after {}ms",
                name,
                self.timeout.as_millis()
            ))),
        }
    }

    pub fn is_locked(&self, key: &str, namespace: Option<&str>) -> bool {
        let name = Self::lock_name(key, namespace);
        self.locks
            .get(&name)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of locks created so far
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn registry() -> Arc<LockRegistry> {
        Arc::new(LockRegistry::with_timeout(Duration::from_millis(50)))
    }

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = registry();
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("main", Some(namespace::MIGRATION)).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_different_keys_run_concurrently() {
        let locks = registry();
        let _a = locks.acquire("repo-a", Some(namespace::REPOSITORY)).await;
        let start = Instant::now();
        let _b = locks.acquire("repo-b", Some(namespace::REPOSITORY)).await;
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(locks.is_locked("repo-a", Some(namespace::REPOSITORY)));
    }

    #[tokio::test]
    async fn test_timeout_is_conflict() {
        let locks = registry();
        let guard = locks.acquire("main", Some(namespace::BRANCH)).await;
        assert_eq!(guard.name(), "branch.main");

        let err = locks
            .acquire_timeout("main", Some(namespace::BRANCH))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Conflict(_)));

        drop(guard);
        assert!(locks.acquire_timeout("main", Some(namespace::BRANCH)).await.is_ok());
    }

    #[tokio::test]
    async fn test_released_when_holder_fails() {
        let locks = registry();
        let failing = {
            let locks = locks.clone();
            async move {
                let _guard = locks.acquire("a1", Some(namespace::ARTIFACT)).await;
                Err::<(), _>(GraphError::internal("render failed"))
            }
        };
        assert!(failing.await.is_err());
        assert!(!locks.is_locked("a1", Some(namespace::ARTIFACT)));
    }
}
