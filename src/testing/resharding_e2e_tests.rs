//! Resharding E2E Test Suite
//!
//! Drives whole operations through [`ReshardingCoordinator`] against an
//! in-memory point store, with real transfer tasks running in the background.
//!
//! | Scenario                          | Verification                                   |
//! |-----------------------------------|------------------------------------------------|
//! | Up on a 3x2 collection            | one `Resharding` replica until transfers end   |
//! | Up finish                         | sources keep none of the new shard's points    |
//! | Out-of-order commit               | 400, metadata unchanged                        |
//! | Down abort mid-transfer           | receivers purged of shard 2 points, all Active |
//! | Shard key deletion                | operation disappears without explicit abort    |
//! | Down receiver peer removed        | forced abort, receivers Active and purged      |
//! | Transient transfer failures       | same final point set as an undisturbed run     |
//! | Concurrent starts                 | exactly one wins                               |
//! | Abort from every stage            | rings restored, no data lost                   |
//! | Finish                            | target replicas Active, rings equal new ring   |

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::resharding::{ReshardStage, ReshardingCoordinator, ReshardingRequest};
    use crate::storage::{InMemoryPointStore, PointStore, ShardLocation};
    use crate::testing::utils::{
        bootstrap_cluster, make_points, readable_points, wait_for_result, FlakyPointStore,
        COLLECTION, PEERS,
    };
    use crate::types::{CollectionConfig, Point, PointId, ReplicaState, ShardKey};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;
    use tracing::info;

    const POINTS: u64 = 1000;
    const STAGE_TIMEOUT: Duration = Duration::from_secs(20);

    async fn wait_for_stage(coordinator: &ReshardingCoordinator, stage: ReshardStage) {
        let reached = wait_for_result(
            || async { coordinator.resharding_operation(COLLECTION).map(|op| op.stage) },
            |current| *current == Some(stage),
            STAGE_TIMEOUT,
        )
        .await;
        assert!(reached.is_some(), "collection never reached stage {}", stage);
    }

    /// Advance a live operation to `stage`.
    async fn drive_to(coordinator: &ReshardingCoordinator, stage: ReshardStage) {
        if stage == ReshardStage::Starting {
            return;
        }
        wait_for_stage(coordinator, ReshardStage::AwaitingReadCommit).await;
        if stage == ReshardStage::AwaitingReadCommit {
            return;
        }
        coordinator.commit_read_hash_ring(COLLECTION).await.unwrap();
        if stage == ReshardStage::AwaitingWriteCommit {
            return;
        }
        coordinator.commit_write_hash_ring(COLLECTION).await.unwrap();
    }

    fn replicas_in_state(coordinator: &ReshardingCoordinator, state: ReplicaState) -> usize {
        coordinator
            .metadata()
            .registry()
            .get(COLLECTION)
            .unwrap()
            .count_in_state(state)
    }

    fn point_ids(points: &[Point]) -> BTreeSet<PointId> {
        points.iter().map(|point| point.id).collect()
    }

    // =========================================================================
    // Up resharding
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_up_resharding_keeps_one_resharding_replica_until_transfers_finish() {
        let store = Arc::new(FlakyPointStore::new());
        let coordinator = bootstrap_cluster(store.clone(), CollectionConfig::new(3, 2), POINTS).await;
        store.set_upsert_delay(Duration::from_millis(5));

        coordinator
            .start_resharding(COLLECTION, ReshardingRequest::up())
            .await
            .unwrap();

        let operation = coordinator.resharding_operation(COLLECTION).unwrap();
        assert_eq!(operation.shard_id, 3);
        info!(peer_id = operation.peer_id, "New shard placed");

        loop {
            let info = coordinator.get_cluster_info(COLLECTION).await.unwrap();
            let resharding: Vec<_> = info
                .local_shards
                .iter()
                .map(|shard| (shard.shard_id, shard.state))
                .chain(info.remote_shards.iter().map(|shard| (shard.shard_id, shard.state)))
                .filter(|(_, state)| *state == ReplicaState::Resharding)
                .collect();
            assert_eq!(resharding, vec![(3, ReplicaState::Resharding)]);
            assert_eq!(info.resharding_operations.len(), 1);

            let stage = info.resharding_operations[0].stage;
            if stage == ReshardStage::AwaitingReadCommit {
                assert!(info.shard_transfers.is_empty());
                assert!(info.resharding_operations[0]
                    .comment
                    .starts_with("awaiting_read_commit: "));
                break;
            }
            assert_eq!(stage, ReshardStage::Starting);
            // One transfer per source shard, at most one running into the new replica.
            assert!(info.shard_transfers.len() <= 3);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drive_to(&coordinator, ReshardStage::AwaitingFinish).await;
        coordinator.finish_resharding(COLLECTION).await.unwrap();

        assert!(coordinator.resharding_operation(COLLECTION).is_none());
        assert_eq!(replicas_in_state(&coordinator, ReplicaState::Resharding), 0);
        let readable = readable_points(&coordinator, None, 0..POINTS).await;
        assert_eq!(readable.len() as u64, POINTS);

        let metrics = coordinator.metrics().snapshot();
        assert_eq!(metrics.operations_started, 1);
        assert_eq!(metrics.operations_finished, 1);
        assert_eq!(metrics.transfers_started, 3);
        assert_eq!(metrics.transfers_finished, 3);
        assert_eq!(metrics.active_operations, 0);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_commit_write_before_read_is_rejected() {
        let store = Arc::new(InMemoryPointStore::new());
        let coordinator = bootstrap_cluster(store, CollectionConfig::new(3, 2), POINTS).await;
        coordinator
            .start_resharding(COLLECTION, ReshardingRequest::up())
            .await
            .unwrap();
        wait_for_stage(&coordinator, ReshardStage::AwaitingReadCommit).await;

        let before = coordinator.metadata();
        let err = coordinator.commit_write_hash_ring(COLLECTION).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(coordinator.metadata(), before);

        // Finish is not legal either, and start conflicts with the live operation.
        assert_eq!(
            coordinator.finish_resharding(COLLECTION).await.unwrap_err().status_code(),
            400
        );
        let err = coordinator
            .start_resharding(COLLECTION, ReshardingRequest::up())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OperationInProgress { .. }));
        assert_eq!(coordinator.metadata(), before);
        assert_eq!(coordinator.metrics().rejected_requests.get(), 3);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_up_finish_moves_points_off_source_shards() {
        let store = Arc::new(InMemoryPointStore::new());
        let coordinator = bootstrap_cluster(store.clone(), CollectionConfig::new(3, 2), POINTS).await;
        let sources = coordinator.metadata().registry().replicas(COLLECTION).unwrap();

        coordinator
            .start_resharding(COLLECTION, ReshardingRequest::up())
            .await
            .unwrap();
        let operation = coordinator.resharding_operation(COLLECTION).unwrap();
        drive_to(&coordinator, ReshardStage::AwaitingFinish).await;
        coordinator.finish_resharding(COLLECTION).await.unwrap();

        let moved = coordinator
            .hash_ring_filter(COLLECTION, None, operation.shard_id)
            .unwrap();
        for replica in &sources {
            let location = ShardLocation::new(COLLECTION, replica.peer_id, replica.shard_id);
            let kept = store.scroll(&location, None).await.unwrap();
            assert!(!kept.is_empty(), "shard {} on peer {} lost everything", replica.shard_id, replica.peer_id);
            assert!(
                kept.iter().all(|point| !moved.check(&point.id)),
                "shard {} on peer {} still holds points owned by shard {}",
                replica.shard_id,
                replica.peer_id,
                operation.shard_id
            );
        }

        let new_replica = ShardLocation::new(COLLECTION, operation.peer_id, operation.shard_id);
        let gained = store.scroll(&new_replica, None).await.unwrap();
        assert!(!gained.is_empty());
        assert!(gained.iter().all(|point| moved.check(&point.id)));

        let readable = readable_points(&coordinator, None, 0..POINTS).await;
        assert_eq!(readable, make_points(0..POINTS));
    }

    // =========================================================================
    // Down resharding
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_down_abort_mid_transfer_purges_receivers() {
        let store = Arc::new(FlakyPointStore::new());
        let coordinator = bootstrap_cluster(store.clone(), CollectionConfig::new(3, 2), POINTS).await;
        store.set_upsert_delay(Duration::from_millis(50));

        coordinator
            .start_resharding(COLLECTION, ReshardingRequest::down().with_shard_id(2))
            .await
            .unwrap();
        let filter = coordinator.hash_ring_filter(COLLECTION, None, 2).unwrap();

        let receivers: Vec<_> = coordinator
            .metadata()
            .registry()
            .shard_replicas(COLLECTION, 0)
            .unwrap();
        assert!(receivers.iter().all(|r| r.state == ReplicaState::Resharding));
        let target = receivers[0].peer_id;

        let seen = wait_for_result(
            || async {
                coordinator
                    .count_points(COLLECTION, target, 0, Some(&filter))
                    .await
                    .unwrap()
            },
            |count| *count > 0,
            STAGE_TIMEOUT,
        )
        .await;
        assert!(seen.is_some(), "no shard 2 points reached shard 0 on peer {}", target);
        assert_eq!(
            coordinator.resharding_operation(COLLECTION).unwrap().stage,
            ReshardStage::Starting
        );

        coordinator.abort_resharding(COLLECTION).await.unwrap();
        store.set_upsert_delay(Duration::ZERO);

        assert!(coordinator.resharding_operation(COLLECTION).is_none());
        for receiver in &receivers {
            let moved = coordinator
                .scroll_points(COLLECTION, receiver.peer_id, 0, Some(&filter))
                .await
                .unwrap();
            assert!(moved.is_empty(), "peer {} still holds shard 2 points", receiver.peer_id);
        }
        let snapshot = coordinator.metadata().registry().get(COLLECTION).unwrap();
        assert!(snapshot.all().all(|replica| replica.state == ReplicaState::Active));
        assert_eq!(snapshot.all().count(), 6);

        let readable = readable_points(&coordinator, None, 0..POINTS).await;
        assert_eq!(readable.len() as u64, POINTS);
        assert_eq!(coordinator.metrics().snapshot().operations_aborted, 1);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_down_finish_drops_removed_shard() {
        let store = Arc::new(InMemoryPointStore::new());
        let coordinator = bootstrap_cluster(store.clone(), CollectionConfig::new(3, 2), POINTS).await;
        let removed: Vec<_> = coordinator
            .metadata()
            .registry()
            .shard_replicas(COLLECTION, 2)
            .unwrap();

        coordinator
            .start_resharding(COLLECTION, ReshardingRequest::down())
            .await
            .unwrap();
        assert_eq!(coordinator.resharding_operation(COLLECTION).unwrap().shard_id, 2);
        drive_to(&coordinator, ReshardStage::AwaitingFinish).await;

        // Writes in the last stage also reach shard 2, which is about to be dropped.
        coordinator
            .upsert_points(COLLECTION, None, make_points(POINTS..POINTS + 20))
            .await
            .unwrap();
        coordinator.finish_resharding(COLLECTION).await.unwrap();

        let meta = coordinator.metadata();
        let router = meta.router(COLLECTION, None).unwrap();
        assert!(!router.is_resharding());
        assert_eq!(router.read_ring(), router.write_ring());
        assert_eq!(router.shards(), vec![0, 1]);

        let info = coordinator.get_cluster_info(COLLECTION).await.unwrap();
        assert_eq!(info.shard_count, 2);
        assert!(info.resharding_operations.is_empty());
        for replica in &removed {
            let location = ShardLocation::new(COLLECTION, replica.peer_id, 2);
            assert_eq!(store.count(&location, None).await.unwrap(), 0);
        }
        let readable = readable_points(&coordinator, None, 0..POINTS + 20).await;
        assert_eq!(readable.len() as u64, POINTS + 20);
    }

    // =========================================================================
    // Topology changes
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_shard_key_deletion_aborts_operation() {
        let store = Arc::new(InMemoryPointStore::new());
        let coordinator = bootstrap_cluster(
            store,
            CollectionConfig::new(2, 1).with_custom_sharding(),
            0,
        )
        .await;
        let tenant = ShardKey::from("tenant_a");
        coordinator.create_shard_key(COLLECTION, tenant.clone()).await.unwrap();
        coordinator.create_shard_key(COLLECTION, "tenant_b").await.unwrap();
        coordinator
            .upsert_points(COLLECTION, Some(tenant.clone()), make_points(0..200))
            .await
            .unwrap();

        // A custom-sharded collection needs the shard key on every request.
        let err = coordinator
            .start_resharding(COLLECTION, ReshardingRequest::up())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        coordinator
            .start_resharding(COLLECTION, ReshardingRequest::up().with_shard_key(tenant.clone()))
            .await
            .unwrap();
        let operation = coordinator.resharding_operation(COLLECTION).unwrap();
        assert_eq!(operation.shard_key, Some(tenant.clone()));
        assert_eq!(operation.shard_id, 4);
        assert_eq!(coordinator.metadata().operations().count(), 1);

        coordinator.delete_shard_key(COLLECTION, tenant).await.unwrap();

        let meta = coordinator.metadata();
        assert_eq!(meta.operations().count(), 0);
        assert!(meta.transfers(COLLECTION).is_empty());
        assert_eq!(replicas_in_state(&coordinator, ReplicaState::Resharding), 0);
        assert_eq!(
            meta.collection(COLLECTION).unwrap().shard_keys(),
            vec![ShardKey::from("tenant_b")]
        );
        let metrics = coordinator.metrics().snapshot();
        assert_eq!(metrics.operations_force_aborted, 1);
        assert_eq!(metrics.operations_aborted, 1);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_forced_peer_removal_aborts_operation() {
        let store = Arc::new(FlakyPointStore::new());
        let coordinator = bootstrap_cluster(store.clone(), CollectionConfig::new(3, 2), POINTS).await;
        store.set_upsert_delay(Duration::from_millis(20));

        coordinator
            .start_resharding(COLLECTION, ReshardingRequest::up().with_peer(PEERS[2]))
            .await
            .unwrap();

        // The new shard's only replica cannot be dropped while the operation runs.
        let err = coordinator.drop_replica(COLLECTION, 3, PEERS[2]).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        // Neither can a peer that still hosts replicas be removed without force.
        let err = coordinator.remove_peer(PEERS[2], false).await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        coordinator.remove_peer(PEERS[2], true).await.unwrap();
        store.set_upsert_delay(Duration::ZERO);

        let meta = coordinator.metadata();
        assert!(meta.operation(COLLECTION).is_none());
        assert!(!meta.peers().contains(&PEERS[2]));
        assert_eq!(meta.registry().replica_count_on(COLLECTION, PEERS[2]), 0);
        assert!(!meta.router(COLLECTION, None).unwrap().is_resharding());
        assert_eq!(coordinator.metrics().snapshot().operations_force_aborted, 1);

        let readable = readable_points(&coordinator, None, 0..POINTS).await;
        assert_eq!(readable.len() as u64, POINTS);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_removing_down_receiver_peer_aborts_operation() {
        let store = Arc::new(FlakyPointStore::new());
        let coordinator = bootstrap_cluster(store.clone(), CollectionConfig::new(3, 2), POINTS).await;
        store.set_upsert_delay(Duration::from_millis(50));

        coordinator
            .start_resharding(COLLECTION, ReshardingRequest::down().with_shard_id(2))
            .await
            .unwrap();
        let operation = coordinator.resharding_operation(COLLECTION).unwrap();
        let filter = coordinator.hash_ring_filter(COLLECTION, None, 2).unwrap();

        // A peer that only receives shard 2 points, not the one sending them.
        let receivers: Vec<_> = coordinator
            .metadata()
            .registry()
            .replicas(COLLECTION)
            .unwrap()
            .into_iter()
            .filter(|replica| replica.state == ReplicaState::Resharding)
            .collect();
        let removed_peer = receivers
            .iter()
            .map(|replica| replica.peer_id)
            .find(|&peer_id| peer_id != operation.peer_id)
            .unwrap();
        assert_eq!(
            coordinator.resharding_operation(COLLECTION).unwrap().stage,
            ReshardStage::Starting
        );

        coordinator.remove_peer(removed_peer, true).await.unwrap();
        store.set_upsert_delay(Duration::ZERO);

        let meta = coordinator.metadata();
        assert!(meta.operation(COLLECTION).is_none());
        assert!(meta.transfers(COLLECTION).is_empty());
        assert!(!meta.peers().contains(&removed_peer));
        assert_eq!(meta.registry().replica_count_on(COLLECTION, removed_peer), 0);
        assert_eq!(meta.router(COLLECTION, None).unwrap().shards(), vec![0, 1, 2]);

        let snapshot = meta.registry().get(COLLECTION).unwrap();
        assert!(snapshot.all().all(|replica| replica.state == ReplicaState::Active));
        for receiver in receivers.iter().filter(|r| r.peer_id != removed_peer) {
            let moved = coordinator
                .scroll_points(COLLECTION, receiver.peer_id, receiver.shard_id, Some(&filter))
                .await
                .unwrap();
            assert!(moved.is_empty(), "peer {} still holds shard 2 points", receiver.peer_id);
        }
        for receiver in receivers.iter().filter(|r| r.peer_id == removed_peer) {
            let location = ShardLocation::new(COLLECTION, removed_peer, receiver.shard_id);
            assert_eq!(store.count(&location, None).await.unwrap(), 0);
        }

        let metrics = coordinator.metrics().snapshot();
        assert_eq!(metrics.operations_force_aborted, 1);
        let readable = readable_points(&coordinator, None, 0..POINTS).await;
        assert_eq!(readable.len() as u64, POINTS);
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_transfer_resumes_after_transient_failures() {
        async fn run_up(store: Arc<FlakyPointStore>, failures: usize) -> Vec<Point> {
            let coordinator =
                bootstrap_cluster(store.clone(), CollectionConfig::new(3, 2), POINTS).await;
            store.fail_next_upserts(failures);
            coordinator
                .start_resharding(COLLECTION, ReshardingRequest::up())
                .await
                .unwrap();
            wait_for_stage(&coordinator, ReshardStage::AwaitingReadCommit).await;
            assert_eq!(store.injected_failures(), failures);

            let operation = coordinator.resharding_operation(COLLECTION).unwrap();
            let mut points = coordinator
                .scroll_points(COLLECTION, operation.peer_id, operation.shard_id, None)
                .await
                .unwrap();
            points.sort_by_key(|point| point.id);
            points
        }

        let undisturbed = run_up(Arc::new(FlakyPointStore::new()), 0).await;
        let flaky_store = Arc::new(FlakyPointStore::new());
        let disturbed = run_up(flaky_store, 2).await;

        assert!(!undisturbed.is_empty());
        assert_eq!(point_ids(&undisturbed), point_ids(&disturbed));
        assert_eq!(undisturbed, disturbed);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_concurrent_starts_one_wins() {
        let store = Arc::new(InMemoryPointStore::new());
        let coordinator = bootstrap_cluster(store, CollectionConfig::new(3, 2), 100).await;

        let mut handles = Vec::new();
        for i in 0..4 {
            let coordinator = coordinator.clone();
            let request = if i % 2 == 0 {
                ReshardingRequest::up()
            } else {
                ReshardingRequest::down()
            };
            handles.push(tokio::spawn(async move {
                coordinator.start_resharding(COLLECTION, request).await
            }));
        }

        let mut won = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => won += 1,
                Err(e) => assert!(matches!(e, Error::OperationInProgress { .. }), "{}", e),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(coordinator.metadata().operations().count(), 1);
        assert_eq!(coordinator.metrics().snapshot().operations_started, 1);
    }

    // =========================================================================
    // Abort
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_abort_from_every_stage_restores_rings() {
        let stages = [
            ReshardStage::Starting,
            ReshardStage::AwaitingReadCommit,
            ReshardStage::AwaitingWriteCommit,
            ReshardStage::AwaitingFinish,
        ];
        for stage in stages {
            let store = Arc::new(FlakyPointStore::new());
            let coordinator =
                bootstrap_cluster(store.clone(), CollectionConfig::new(3, 2), POINTS).await;
            let before = coordinator.metadata().router(COLLECTION, None).unwrap().clone();
            if stage == ReshardStage::Starting {
                store.set_upsert_delay(Duration::from_millis(50));
            }

            coordinator
                .start_resharding(COLLECTION, ReshardingRequest::up())
                .await
                .unwrap();
            drive_to(&coordinator, stage).await;
            assert_eq!(coordinator.resharding_operation(COLLECTION).unwrap().stage, stage);

            coordinator
                .upsert_points(COLLECTION, None, make_points(POINTS..POINTS + 10))
                .await
                .unwrap();
            coordinator.abort_resharding(COLLECTION).await.unwrap();
            store.set_upsert_delay(Duration::ZERO);

            let meta = coordinator.metadata();
            let router = meta.router(COLLECTION, None).unwrap();
            assert_eq!(router, &before, "ring not restored after abort in {}", stage);
            assert_eq!(router.read_ring(), router.old_ring());
            assert_eq!(router.write_ring(), router.old_ring());
            assert!(meta.operation(COLLECTION).is_none());
            assert!(meta.transfers(COLLECTION).is_empty());
            assert_eq!(replicas_in_state(&coordinator, ReplicaState::Resharding), 0);
            assert!(meta.registry().shard_replicas(COLLECTION, 3).is_err());

            let readable = readable_points(&coordinator, None, 0..POINTS + 10).await;
            assert_eq!(readable.len() as u64, POINTS + 10, "points lost by abort in {}", stage);
            coordinator.shutdown().await;
        }
    }
}
