//! Shared engine state handed to every subsystem and HTTP handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::Config;
use crate::gateway::LedgerGateway;
use crate::stage::StageTransitionEvent;

/// Per-key async mutexes. Mutations on one event serialize against each
/// other without starving unrelated events behind a global lock.
#[derive(Default)]
pub struct KeyedLocks {
    inner: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: i64) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().expect("lock map poisoned");
            // Drop entries nobody holds or waits on, so the map stays
            // bounded by the number of events under mutation.
            map.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(map.entry(key).or_default())
        };
        entry.lock_owned().await
    }
}

pub struct AppState<G> {
    pub pool: SqlitePool,
    pub gateway: G,
    pub config: Config,
    /// Successful `publish`/`switch_stage` transitions are broadcast here
    /// for notification and audit consumers.
    pub stage_events: broadcast::Sender<StageTransitionEvent>,
    /// Serializes stage transitions per event.
    pub event_locks: KeyedLocks,
}

impl<G: LedgerGateway> AppState<G> {
    pub fn new(pool: SqlitePool, gateway: G, config: Config) -> Self {
        let (stage_events, _) = broadcast::channel(256);
        Self {
            pool,
            gateway,
            config,
            stage_events,
            event_locks: KeyedLocks::default(),
        }
    }

    pub fn subscribe_stage_events(&self) -> broadcast::Receiver<StageTransitionEvent> {
        self.stage_events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_lock_entries_are_evicted() {
        let locks = KeyedLocks::default();
        {
            let _held = locks.lock(1).await;
            let _other = locks.lock(2).await;
            // Entry 1 is still held, so locking 2 must not evict it.
            assert!(locks.inner.lock().unwrap().contains_key(&1));
        }

        let _fresh = locks.lock(3).await;
        let map = locks.inner.lock().unwrap();
        assert!(!map.contains_key(&1));
        assert!(!map.contains_key(&2));
        assert!(map.contains_key(&3));
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use crate::db;
    use crate::gateway::mock::MockGateway;

    pub async fn mock_state() -> AppState<MockGateway> {
        AppState::new(
            db::test_pool().await,
            MockGateway::default(),
            Config::for_tests(),
        )
    }
}
