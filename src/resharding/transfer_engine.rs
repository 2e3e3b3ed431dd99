//! Background shard transfer execution.
//!
//! Each transfer runs as its own tokio task:
//!
//! ```text
//!   ┌──────────┐  fetch_batch(offset)   ┌──────────┐
//!   │  source  │ ─────────────────────▶ │   task   │── filter by ring membership
//!   │ replica  │                        │          │
//!   └──────────┘                        │          │  upsert (idempotent)
//!                                       │          │ ─────────────────────▶ destination
//!                                       │          │
//!                                       │          │── advance checkpoint
//!                                       └──────────┘
//!                                            │ verify, then report finished / failed
//!                                            ▼
//!                                     TransferReporter
//! ```
//!
//! The checkpoint only advances after a batch is acknowledged by the
//! destination, so a retry always resumes from the last applied batch and
//! re-applying points is harmless. Cancellation is cooperative through a
//! [`CancellationToken`]. A cancelled task applies nothing further and never
//! reports; the caller cleans up partial destination data after joining it.

use super::transfer::TransferKey;
use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::metrics::ReshardingMetrics;
use crate::partitioning::HashRingFilter;
use crate::storage::{PointStore, ShardLocation};
use crate::types::{CollectionId, Point, PointId};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Receives the outcome of transfers. Held weakly by running tasks.
#[async_trait::async_trait]
pub trait TransferReporter: Send + Sync {
    /// The destination holds every selected source point.
    async fn transfer_finished(&self, collection: &str, key: TransferKey, epoch: u64) -> Result<()>;

    /// The transfer gave up after exhausting retries or failing verification.
    async fn transfer_failed(&self, collection: &str, key: TransferKey, epoch: u64, reason: String) -> Result<()>;
}

/// Transfer to execute.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub collection: CollectionId,
    pub key: TransferKey,
    /// Epoch of the scheduled transfer, echoed back in reports.
    pub epoch: u64,
    /// Only points matching the filter are copied. `None` copies everything.
    pub filter: Option<HashRingFilter>,
}

impl TransferRequest {
    fn source(&self) -> ShardLocation {
        ShardLocation::new(self.collection.clone(), self.key.from, self.key.shard_id)
    }

    fn destination(&self) -> ShardLocation {
        ShardLocation::new(self.collection.clone(), self.key.to, self.key.to_shard_id)
    }

    fn selects(&self, point_id: &PointId) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter.check(point_id))
    }
}

/// Last acknowledged position of a transfer.
#[derive(Debug, Default)]
pub struct TransferCheckpoint {
    offset: Mutex<Option<PointId>>,
    batches_acked: AtomicU64,
    points_acked: AtomicU64,
}

impl TransferCheckpoint {
    pub fn offset(&self) -> Option<PointId> {
        *self.offset.lock()
    }

    fn advance(&self, offset: PointId, points: usize) {
        *self.offset.lock() = Some(offset);
        self.batches_acked.fetch_add(1, Ordering::Relaxed);
        self.points_acked.fetch_add(points as u64, Ordering::Relaxed);
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            offset: self.offset(),
            batches_acked: self.batches_acked.load(Ordering::Relaxed),
            points_acked: self.points_acked.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a transfer checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub offset: Option<PointId>,
    pub batches_acked: u64,
    pub points_acked: u64,
}

type TaskKey = (CollectionId, TransferKey);

struct TransferHandle {
    id: Uuid,
    cancel: CancellationToken,
    checkpoint: Arc<TransferCheckpoint>,
    join: JoinHandle<()>,
}

/// Spawns, tracks and cancels transfer tasks.
pub struct TransferEngine {
    store: Arc<dyn PointStore>,
    config: TransferConfig,
    metrics: Arc<ReshardingMetrics>,
    tasks: Arc<Mutex<HashMap<TaskKey, TransferHandle>>>,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("config", &self.config)
            .field("active", &self.tasks.lock().len())
            .finish()
    }
}

impl TransferEngine {
    pub fn new(
        store: Arc<dyn PointStore>,
        config: TransferConfig,
        metrics: Arc<ReshardingMetrics>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a transfer task. A task already running for the same key is left alone.
    pub fn start_transfer(
        &self,
        request: TransferRequest,
        reporter: Weak<dyn TransferReporter>,
    ) -> TransferKey {
        let key = request.key;
        let task_key = (request.collection.clone(), key);

        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&task_key) {
            tracing::debug!(collection = %request.collection, transfer = %key, "Transfer already running");
            return key;
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let checkpoint = Arc::new(TransferCheckpoint::default());
        let task = TransferTask {
            id,
            request,
            store: self.store.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            cancel: cancel.clone(),
            checkpoint: checkpoint.clone(),
            tasks: Arc::downgrade(&self.tasks),
        };

        self.metrics.record_transfer_start();
        let join = tokio::spawn(task.run(reporter));
        tasks.insert(
            task_key,
            TransferHandle {
                id,
                cancel,
                checkpoint,
                join,
            },
        );
        key
    }

    /// Cancel a transfer and wait for its task to stop. Returns false if it was not running.
    pub async fn cancel(&self, collection: &str, key: TransferKey) -> bool {
        let handle = self.tasks.lock().remove(&(collection.to_string(), key));
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                if let Err(e) = handle.join.await {
                    tracing::warn!(collection, transfer = %key, error = %e, "Transfer task did not stop cleanly");
                }
                true
            }
            None => false,
        }
    }

    /// Cancel every running transfer.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.tasks.lock().drain().map(|(_, handle)| handle).collect();
        for handle in &handles {
            handle.cancel.cancel();
        }
        for handle in handles {
            let _ = handle.join.await;
        }
    }

    /// Progress of a running transfer.
    pub fn progress(&self, collection: &str, key: TransferKey) -> Option<TransferProgress> {
        self.tasks
            .lock()
            .get(&(collection.to_string(), key))
            .map(|handle| handle.checkpoint.progress())
    }

    pub fn is_running(&self, collection: &str, key: TransferKey) -> bool {
        self.tasks.lock().contains_key(&(collection.to_string(), key))
    }

    pub fn active_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

struct TransferTask {
    id: Uuid,
    request: TransferRequest,
    store: Arc<dyn PointStore>,
    config: TransferConfig,
    metrics: Arc<ReshardingMetrics>,
    cancel: CancellationToken,
    checkpoint: Arc<TransferCheckpoint>,
    tasks: Weak<Mutex<HashMap<TaskKey, TransferHandle>>>,
}

impl TransferTask {
    async fn run(self, reporter: Weak<dyn TransferReporter>) {
        let collection = self.request.collection.clone();
        let key = self.request.key;
        let start = Instant::now();
        tracing::info!(collection = %collection, transfer = %key, "Shard transfer started");

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = self.stream() => result,
        };

        match outcome {
            Ok(points) => {
                self.metrics.record_transfer_finished(start.elapsed());
                tracing::info!(
                    collection = %collection,
                    transfer = %key,
                    points,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Shard transfer finished"
                );
                if let Some(reporter) = reporter.upgrade() {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        result = reporter.transfer_finished(&collection, key, self.request.epoch) => {
                            if let Err(e) = result {
                                tracing::debug!(collection = %collection, transfer = %key, error = %e, "Transfer completion not applied");
                            }
                        }
                    }
                }
            }
            Err(Error::Cancelled) => {
                self.metrics.record_transfer_cancelled();
                tracing::info!(collection = %collection, transfer = %key, "Shard transfer cancelled");
            }
            Err(e) => {
                self.metrics.record_transfer_failed();
                tracing::error!(collection = %collection, transfer = %key, error = %e, "Shard transfer failed");
                if let Some(reporter) = reporter.upgrade() {
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        result = reporter.transfer_failed(&collection, key, self.request.epoch, e.to_string()) => {
                            if let Err(e) = result {
                                tracing::debug!(collection = %collection, transfer = %key, error = %e, "Transfer failure not applied");
                            }
                        }
                    }
                }
            }
        }

        if let Some(tasks) = self.tasks.upgrade() {
            let mut tasks = tasks.lock();
            let task_key = (collection, key);
            if tasks.get(&task_key).is_some_and(|handle| handle.id == self.id) {
                tasks.remove(&task_key);
            }
        }
    }

    /// Copy all selected points, then verify. Returns the number of points applied.
    async fn stream(&self) -> Result<u64> {
        let source = self.request.source();
        let destination = self.request.destination();
        let mut offset = self.checkpoint.offset();
        let mut applied = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let batch = self
                .with_retry("fetch", || {
                    self.store.fetch_batch(&source, offset, self.config.batch_size)
                })
                .await?;

            let last_id = batch.points.last().map(|point| point.id);
            let is_final = batch.is_final();
            let selected: Vec<Point> = batch
                .points
                .into_iter()
                .filter(|point| self.request.selects(&point.id))
                .collect();
            let selected_len = selected.len();

            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if !selected.is_empty() {
                self.with_retry("apply", || self.store.upsert(&destination, selected.clone()))
                    .await?;
            }

            if let Some(last_id) = last_id {
                self.checkpoint.advance(last_id, selected_len);
                offset = Some(last_id);
            }
            applied += selected_len as u64;
            self.metrics.record_points_transferred(selected_len as u64);

            tracing::debug!(
                collection = %self.request.collection,
                transfer = %self.request.key,
                batch_points = selected_len,
                total = applied,
                "Transfer batch applied"
            );

            if is_final {
                break;
            }
        }

        if self.config.verify_on_finish {
            self.verify(&source, &destination).await?;
        }
        Ok(applied)
    }

    /// Every selected source point must be present on the destination.
    async fn verify(&self, source: &ShardLocation, destination: &ShardLocation) -> Result<()> {
        let filter = self.request.filter.as_ref();
        let expected = self
            .with_retry("verify", || self.store.scroll(source, filter))
            .await?;
        let present: HashSet<PointId> = self
            .with_retry("verify", || self.store.scroll(destination, filter))
            .await?
            .into_iter()
            .map(|point| point.id)
            .collect();

        let missing = expected
            .iter()
            .filter(|point| !present.contains(&point.id))
            .count();
        if missing > 0 || present.len() < expected.len() {
            return Err(Error::TransferFailed(format!(
                "verification failed: {} of {} points missing on {}",
                missing,
                expected.len(),
                destination
            )));
        }
        Ok(())
    }

    /// Run `op`, retrying retryable errors with capped exponential backoff.
    async fn with_retry<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let backoff = self.config.backoff_for(attempt) + self.jitter(attempt);
                    attempt += 1;
                    self.metrics.record_transfer_retry();
                    tracing::warn!(
                        collection = %self.request.collection,
                        transfer = %self.request.key,
                        step = what,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transfer step failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(Error::TransferFailed(format!(
                        "{} failed after {} attempts: {}",
                        what,
                        attempt + 1,
                        e
                    )))
                }
            }
        }
    }

    fn jitter(&self, attempt: u32) -> Duration {
        let max_ms = (self.config.backoff_for(attempt).as_millis() / 10) as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}
