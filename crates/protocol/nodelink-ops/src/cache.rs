//! Topology cache with single-flight recomputation.
//!
//! Computing the reachable node set means one peer listing per node, so the
//! result is cached until a topology change invalidates it. Concurrent
//! callers that find the cache stale wait for a single recomputation and
//! share its result.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nodelink_types::NodeIdentity;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::OpsResult;
use crate::routing::TopologyChange;
use crate::state::NetworkStateModel;

/// Computes a fresh topology snapshot.
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn compute(&self) -> OpsResult<TopologySnapshot>;
}

/// Reachable nodes and the matching state model.
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    /// Reachable nodes, sorted by id.
    pub reachable: Vec<NodeIdentity>,
    /// Model built from `reachable`.
    pub state: NetworkStateModel,
    /// Cache generation the snapshot was computed for.
    pub generation: u64,
}

/// Caches the latest [`TopologySnapshot`].
pub struct TopologyCache {
    source: Arc<dyn TopologySource>,
    current: Mutex<Option<Arc<TopologySnapshot>>>,
    generation: AtomicU64,
    recomputations: AtomicUsize,
}

impl TopologyCache {
    pub fn new(source: Arc<dyn TopologySource>) -> Self {
        Self {
            source,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            recomputations: AtomicUsize::new(0),
        }
    }

    /// Current snapshot, recomputed if stale or if `force_refresh` is set.
    ///
    /// Callers arriving during a recomputation wait for it and receive its
    /// result. A failed recomputation yields an empty snapshot, which is
    /// not cached.
    pub async fn get(&self, force_refresh: bool) -> Arc<TopologySnapshot> {
        let mut current = self.current.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);

        if !force_refresh {
            if let Some(snapshot) = current.as_ref() {
                if snapshot.generation == generation {
                    return snapshot.clone();
                }
            }
        }

        self.recomputations.fetch_add(1, Ordering::SeqCst);
        match self.source.compute().await {
            Ok(mut snapshot) => {
                snapshot.generation = generation;
                debug!(generation, nodes = snapshot.reachable.len(), "Topology recomputed");
                let snapshot = Arc::new(snapshot);
                *current = Some(snapshot.clone());
                snapshot
            }
            Err(e) => {
                warn!(error = %e, "Topology recomputation failed");
                *current = None;
                Arc::new(TopologySnapshot {
                    generation,
                    ..TopologySnapshot::default()
                })
            }
        }
    }

    /// The cached snapshot if it is still valid, without recomputing.
    pub async fn peek(&self) -> Option<Arc<TopologySnapshot>> {
        let current = self.current.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);
        current.as_ref().filter(|s| s.generation == generation).cloned()
    }

    /// Mark the cached snapshot stale.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Number of recomputations started so far.
    pub fn recomputations(&self) -> usize {
        self.recomputations.load(Ordering::SeqCst)
    }

    /// Invalidate the cache on every topology change received on `changes`.
    pub fn watch(self: &Arc<Self>, mut changes: broadcast::Receiver<TopologyChange>) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let result = changes.recv().await;
                let Some(cache) = cache.upgrade() else { return };
                match result {
                    Ok(change) => {
                        debug!(generation = change.generation, "Invalidating topology cache");
                        cache.invalidate();
                    }
                    Err(RecvError::Lagged(_)) => cache.invalidate(),
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OpsError;
    use crate::routing::TopologyChangeCause;
    use nodelink_types::NodeId;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl TopologySource for CountingSource {
        async fn compute(&self) -> OpsResult<TopologySnapshot> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(OpsError::invalid_operation("source unavailable"));
            }
            let local = NodeId::new("aaa").unwrap();
            let reachable = vec![NodeIdentity::new(local.clone(), format!("call {}", call))];
            Ok(TopologySnapshot {
                state: NetworkStateModel::from_identities(&reachable, &local),
                reachable,
                generation: 0,
            })
        }
    }

    #[tokio::test]
    async fn test_cached_until_invalidated() {
        let source = Arc::new(CountingSource::default());
        let cache = TopologyCache::new(source.clone());

        let first = cache.get(false).await;
        let second = cache.get(false).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        cache.invalidate();
        assert!(cache.peek().await.is_none());
        let third = cache.get(false).await;
        assert_eq!(third.reachable[0].display_name, "call 1");
        assert_eq!(third.generation, 1);

        cache.get(true).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_recomputation() {
        let source = Arc::new(CountingSource::default());
        let cache = Arc::new(TopologyCache::new(source.clone()));

        let callers: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get(false).await })
            })
            .collect();
        let snapshots = futures::future::join_all(callers).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.recomputations(), 1);
        let first = snapshots[0].as_ref().unwrap();
        assert!(snapshots.iter().all(|s| Arc::ptr_eq(s.as_ref().unwrap(), first)));
    }

    #[tokio::test]
    async fn test_failure_yields_empty_snapshot() {
        let source = Arc::new(CountingSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let cache = TopologyCache::new(source.clone());

        let snapshot = cache.get(false).await;
        assert!(snapshot.reachable.is_empty());
        assert!(snapshot.state.is_empty());
        assert!(cache.peek().await.is_none());

        source.fail.store(false, Ordering::SeqCst);
        assert_eq!(cache.get(false).await.reachable.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_invalidates_on_change() {
        let cache = Arc::new(TopologyCache::new(Arc::new(CountingSource::default())));
        let (tx, rx) = broadcast::channel(4);
        let watcher = cache.watch(rx);

        cache.get(false).await;
        tx.send(TopologyChange {
            generation: 1,
            cause: TopologyChangeCause::Resynchronized,
        })
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while cache.generation() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(cache.peek().await.is_none());

        drop(tx);
        watcher.await.unwrap();
    }
}
