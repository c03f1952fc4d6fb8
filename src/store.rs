//! Read-modify-write state collaborator
//!
//! Event handlers update domain state through [`ApplyUpdate`]: they pass a
//! mutation that maps the current state to the next one, and the store
//! commits it only if nobody else wrote in between.

use crate::error::{BoxError, StoreError};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Mutation applied to the current state
pub type Mutation<'a, S> = &'a (dyn Fn(&S) -> Result<S, BoxError> + Send + Sync);

/// Optimistic update of one piece of state
#[async_trait]
pub trait ApplyUpdate<S>: Send + Sync + 'static {
    /// Run `mutate` against the latest state and commit the result.
    ///
    /// The mutation may run more than once when writes race, so it must be
    /// free of side effects. Returns the committed state.
    async fn apply(&self, mutate: Mutation<'_, S>) -> Result<S, StoreError>;
}

/// State plus the version it was committed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<S> {
    pub state: S,
    pub version: u64,
}

/// In-memory versioned [`ApplyUpdate`] implementation
#[derive(Debug)]
pub struct MemoryStateStore<S> {
    current: Mutex<Versioned<S>>,
    max_attempts: u32,
}

impl<S: Default> Default for MemoryStateStore<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S> MemoryStateStore<S> {
    /// Store starting at version 0
    pub fn new(initial: S) -> Self {
        Self {
            current: Mutex::new(Versioned {
                state: initial,
                version: 0,
            }),
            max_attempts: 5,
        }
    }

    /// Attempts made before [`StoreError::Conflict`]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Versioned<S>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the state if it is still at `expected_version`.
    ///
    /// Returns the new version.
    pub fn compare_and_swap(&self, expected_version: u64, state: S) -> Result<u64, StoreError> {
        let mut current = self.lock();
        if current.version != expected_version {
            return Err(StoreError::Conflict { attempts: 1 });
        }
        current.state = state;
        current.version += 1;
        Ok(current.version)
    }
}

impl<S: Clone> MemoryStateStore<S> {
    /// Current state and version
    pub fn load(&self) -> Versioned<S> {
        self.lock().clone()
    }
}

#[async_trait]
impl<S> ApplyUpdate<S> for MemoryStateStore<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn apply(&self, mutate: Mutation<'_, S>) -> Result<S, StoreError> {
        for attempt in 1..=self.max_attempts {
            let snapshot = self.load();
            let next = mutate(&snapshot.state).map_err(StoreError::Rejected)?;

            match self.compare_and_swap(snapshot.version, next.clone()) {
                Ok(version) => {
                    tracing::debug!(version, attempt, "State updated");
                    return Ok(next);
                }
                Err(_) => {
                    tracing::debug!(attempt, "State changed underneath update, retrying");
                }
            }
        }

        tracing::warn!(attempts = self.max_attempts, "Giving up on contended update");
        Err(StoreError::Conflict {
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Rewards {
        granted: HashSet<String>,
        claimed: HashSet<String>,
    }

    #[tokio::test]
    async fn test_apply_commits_and_bumps_version() {
        let store = MemoryStateStore::<Rewards>::default();

        let next = store
            .apply(&|current: &Rewards| {
                let mut next = current.clone();
                next.granted.insert("starter".to_string());
                Ok(next)
            })
            .await
            .unwrap();

        assert!(next.granted.contains("starter"));
        let loaded = store.load();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.state, next);
    }

    #[tokio::test]
    async fn test_rejected_mutation_leaves_state() {
        let store = MemoryStateStore::<Rewards>::default();

        let result = store
            .apply(&|current: &Rewards| {
                if !current.granted.contains("starter") {
                    return Err("kit not granted".into());
                }
                Ok(current.clone())
            })
            .await;

        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert_eq!(store.load().version, 0);
    }

    #[tokio::test]
    async fn test_retries_after_concurrent_write() {
        let store = Arc::new(MemoryStateStore::new(0u32));
        let calls = AtomicU32::new(0);

        let racer = store.clone();
        let result = store
            .apply(&|current: &u32| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    // Another writer lands between read and commit.
                    let seen = racer.load();
                    racer.compare_and_swap(seen.version, seen.state + 10).unwrap();
                }
                Ok(current + 1)
            })
            .await
            .unwrap();

        assert_eq!(result, 11);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.load(), Versioned { state: 11, version: 2 });
    }

    #[tokio::test]
    async fn test_conflict_after_max_attempts() {
        let store = Arc::new(MemoryStateStore::new(0u32).with_max_attempts(3));
        let racer = store.clone();

        let result = store
            .apply(&|current: &u32| {
                let seen = racer.load();
                racer.compare_and_swap(seen.version, seen.state).unwrap();
                Ok(current + 1)
            })
            .await;

        assert!(matches!(result, Err(StoreError::Conflict { attempts: 3 })));
        assert_eq!(store.load().version, 3);
    }

    #[test]
    fn test_compare_and_swap_stale_version() {
        let store = MemoryStateStore::new(1u32);
        assert_eq!(store.compare_and_swap(0, 2).unwrap(), 1);
        assert!(store.compare_and_swap(0, 3).is_err());
        assert_eq!(store.load().state, 2);
    }
}
