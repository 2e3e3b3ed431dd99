use crate::config::{ReshardingConfig, TransferConfig};
use crate::error::{Result, StorageError};
use crate::partitioning::HashRingFilter;
use crate::resharding::ReshardingCoordinator;
use crate::storage::{InMemoryPointStore, PointBatch, PointStore, ShardLocation};
use crate::types::{CollectionConfig, PeerId, Point, PointId, ShardKey};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll `action` every 100ms until `predicate` accepts its result or `timeout` elapses.
pub async fn wait_for_result<F, Fut, T, P>(
    mut action: F,
    predicate: P,
    timeout: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(100);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// Point store with injectable faults on writes.
///
/// `fail_next_upserts(n)` makes the next `n` upserts fail with a retryable
/// storage error. `set_upsert_delay` slows every upsert down, which keeps
/// transfers running long enough to be observed mid-flight.
#[derive(Debug, Default)]
pub struct FlakyPointStore {
    inner: InMemoryPointStore,
    failures: AtomicUsize,
    injected: AtomicUsize,
    delay_ms: AtomicU64,
}

impl FlakyPointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_upserts(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn set_upsert_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of upserts that failed by injection.
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PointStore for FlakyPointStore {
    async fn upsert(&self, location: &ShardLocation, points: Vec<Point>) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Timeout(location.peer_id).into());
        }
        self.inner.upsert(location, points).await
    }

    async fn fetch_batch(
        &self,
        location: &ShardLocation,
        offset: Option<PointId>,
        limit: usize,
    ) -> Result<PointBatch> {
        self.inner.fetch_batch(location, offset, limit).await
    }

    async fn get(&self, location: &ShardLocation, point_id: &PointId) -> Result<Option<Point>> {
        self.inner.get(location, point_id).await
    }

    async fn scroll(
        &self,
        location: &ShardLocation,
        filter: Option<&HashRingFilter>,
    ) -> Result<Vec<Point>> {
        self.inner.scroll(location, filter).await
    }

    async fn count(&self, location: &ShardLocation, filter: Option<&HashRingFilter>) -> Result<usize> {
        self.inner.count(location, filter).await
    }

    async fn delete_matching(&self, location: &ShardLocation, filter: &HashRingFilter) -> Result<usize> {
        self.inner.delete_matching(location, filter).await
    }

    async fn drop_shard(&self, location: &ShardLocation) -> Result<()> {
        self.inner.drop_shard(location).await
    }
}

/// Name of the collection created by [`bootstrap_cluster`].
pub const COLLECTION: &str = "test_collection";

/// Peers in a [`bootstrap_cluster`] cluster.
pub const PEERS: [PeerId; 3] = [1, 2, 3];

/// Coordinator config with small batches and short backoff.
pub fn test_config() -> ReshardingConfig {
    ReshardingConfig::new(PEERS[0])
        .with_vnodes_per_shard(64)
        .with_transfer_config(TransferConfig::fast().with_batch_size(10))
}

/// Three peers, one collection with the given layout, `points` points upserted.
pub async fn bootstrap_cluster(
    store: Arc<dyn PointStore>,
    collection_config: CollectionConfig,
    points: u64,
) -> Arc<ReshardingCoordinator> {
    let coordinator = ReshardingCoordinator::new(test_config(), store);
    for peer_id in PEERS {
        coordinator.add_peer(peer_id).await.unwrap();
    }
    coordinator
        .create_collection(COLLECTION, collection_config)
        .await
        .unwrap();
    if points > 0 {
        coordinator
            .upsert_points(COLLECTION, None, make_points(0..points))
            .await
            .unwrap();
    }
    coordinator
}

pub fn make_points(ids: std::ops::Range<u64>) -> Vec<Point> {
    ids.map(|i| Point::new(i, format!("payload-{}", i))).collect()
}

/// Every point readable through the coordinator, by id.
pub async fn readable_points(
    coordinator: &ReshardingCoordinator,
    shard_key: Option<ShardKey>,
    ids: std::ops::Range<u64>,
) -> Vec<Point> {
    let mut found = Vec::new();
    for id in ids {
        if let Some(point) = coordinator
            .get_point(COLLECTION, shard_key.clone(), PointId::Num(id))
            .await
            .unwrap()
        {
            found.push(point);
        }
    }
    found
}
