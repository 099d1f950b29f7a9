//! End-to-end sync scenarios
//!
//! Each test drives a [`SyncCoordinator`] against the in-memory backend and
//! checks the local store afterwards, the way a host application would.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use farmsync_core::{SessionStatus, SyncConfig, SyncCoordinator};
use farmsync_remote::RetryPolicy;
use farmsync_schema::{SchemaRegistry, TenantId};
use farmsync_store::{ArenaStore, ChangeSource, LocalStore};
use farmsync_test_utils::fixtures::{at, cow, herd, scope, tenant};
use farmsync_test_utils::{Fault, InMemoryRemote, RemoteOp};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

// =============================================================================
// Test Infrastructure
// =============================================================================

struct Farm {
    tenant: TenantId,
    store: Arc<ArenaStore>,
    remote: Arc<InMemoryRemote>,
    coordinator: Arc<SyncCoordinator>,
}

fn config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        },
        ..SyncConfig::default()
    }
}

impl Farm {
    fn new() -> Self {
        let registry = Arc::new(SchemaRegistry::farm_defaults());
        let store = Arc::new(ArenaStore::new(registry.clone()));
        let remote = Arc::new(InMemoryRemote::new(registry.clone()));
        let coordinator =
            SyncCoordinator::new(store.clone(), remote.clone(), registry, config()).unwrap();
        Self {
            tenant: tenant("farm-1"),
            store,
            remote,
            coordinator,
        }
    }

    async fn cattle(&self) -> HashSet<uuid::Uuid> {
        self.store
            .active_records("cattle", &scope(&self.tenant))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect()
    }

    async fn cattle_checkpoint(&self) -> chrono::DateTime<chrono::Utc> {
        self.store
            .checkpoint(&self.tenant, "cattle")
            .await
            .unwrap()
            .unwrap()
            .last_synced_at
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn first_sync_downloads_everything_and_checkpoints() {
    let farm = Farm::new();
    let cattle = [cow(&farm.tenant, 10), cow(&farm.tenant, 30), cow(&farm.tenant, 20)];
    for record in &cattle {
        farm.remote.seed("cattle", record);
    }

    let session = farm.coordinator.run_pull_only(&farm.tenant).await;

    assert!(session.succeeded(), "{:?}", session.failure);
    assert_eq!(session.stats("cattle").unwrap().applied, 3);
    let expected: HashSet<_> = cattle.iter().map(|r| r.id).collect();
    assert_eq!(farm.cattle().await, expected);
    assert_eq!(farm.cattle_checkpoint().await, at(30));
}

#[tokio::test]
async fn remote_tombstone_propagates_and_advances_checkpoint() {
    let farm = Farm::new();
    let kept = cow(&farm.tenant, 10);
    let sold = cow(&farm.tenant, 20);
    farm.remote.seed("cattle", &kept);
    farm.remote.seed("cattle", &sold);
    farm.coordinator.run_pull_only(&farm.tenant).await;

    farm.remote
        .tombstone("cattle", Some(&farm.tenant), sold.id, at(40));
    let session = farm.coordinator.run_pull_only(&farm.tenant).await;

    assert_eq!(session.stats("cattle").unwrap().tombstoned, 1);
    assert_eq!(farm.cattle().await, HashSet::from([kept.id]));
    let local = farm
        .store
        .record("cattle", &scope(&farm.tenant), sold.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.deleted_at, Some(at(40)));
    assert_eq!(farm.cattle_checkpoint().await, at(40));
}

#[tokio::test]
async fn remote_tombstone_beats_newer_local_edit_without_resurrection() {
    let farm = Farm::new();
    let record = cow(&farm.tenant, 10);
    farm.remote.seed("cattle", &record);
    farm.coordinator.run_full_sync(&farm.tenant).await;

    let edited = record.clone().with_field("sex", json!("male"));
    farm.store
        .write_local("cattle", &scope(&farm.tenant), edited)
        .await
        .unwrap();
    farm.remote
        .tombstone("cattle", Some(&farm.tenant), record.id, at(60));

    let session = farm.coordinator.run_full_sync(&farm.tenant).await;

    assert!(session.succeeded(), "{:?}", session.failure);
    assert!(farm.cattle().await.is_empty());
    assert!(
        farm.store
            .pending_mutations("cattle", &scope(&farm.tenant))
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(farm.remote.call_count(RemoteOp::Upsert), 0);
    let remote_copy = farm
        .remote
        .record("cattle", Some(&farm.tenant), record.id)
        .unwrap();
    assert_eq!(remote_copy.deleted_at, Some(at(60)));
}

#[tokio::test]
async fn partial_push_failure_keeps_only_the_rejected_record() {
    let farm = Farm::new();
    let records: Vec<_> = (1..=5).map(|n| cow(&farm.tenant, n * 10)).collect();
    for record in &records {
        farm.store
            .write_local("cattle", &scope(&farm.tenant), record.clone())
            .await
            .unwrap();
    }
    let rejected = records[2].id;
    farm.remote.fail_record(rejected, Fault::Validation);

    let session = farm.coordinator.run_push_only(&farm.tenant).await;

    let stats = session.stats("cattle").unwrap();
    assert_eq!((stats.pushed, stats.failed), (4, 1));
    assert_eq!(session.summary().failed_records, 1);
    assert!(session.issues.iter().any(|i| i.record_id == Some(rejected)));

    let pending = farm
        .store
        .pending_mutations("cattle", &scope(&farm.tenant))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].record_id, rejected);
    assert_eq!(pending[0].attempts, 1);
    for record in records.iter().filter(|r| r.id != rejected) {
        assert!(
            farm.remote
                .record("cattle", Some(&farm.tenant), record.id)
                .is_some()
        );
    }
}

#[tokio::test]
async fn other_tenants_rows_never_reach_the_store() {
    let farm = Farm::new();
    let neighbour = tenant("farm-2");
    let own = cow(&farm.tenant, 10);
    farm.remote.seed("cattle", &own);
    farm.remote.seed("cattle", &cow(&neighbour, 10));
    farm.remote.seed("herds", &herd(&neighbour, 10));

    farm.coordinator.run_full_sync(&farm.tenant).await;

    assert_eq!(farm.cattle().await, HashSet::from([own.id]));
    assert!(
        farm.store
            .active_records("herds", &scope(&farm.tenant))
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        farm.remote
            .calls()
            .iter()
            .filter(|c| c.table != "breeds")
            .all(|c| c.tenant.as_ref() == Some(&farm.tenant))
    );
}

#[tokio::test]
async fn store_broadcasts_pulled_and_pushed_changes() {
    let farm = Farm::new();
    farm.remote.seed("herds", &herd(&farm.tenant, 10));
    farm.remote.seed("herds", &herd(&farm.tenant, 20));
    farm.store
        .write_local("cattle", &scope(&farm.tenant), cow(&farm.tenant, 30))
        .await
        .unwrap();
    let mut changes = farm.store.subscribe();

    farm.coordinator.run_full_sync(&farm.tenant).await;

    let mut seen = Vec::new();
    while let Ok(change) = changes.try_recv() {
        seen.push((change.entity, change.source, change.ids.len()));
    }
    assert!(seen.contains(&("herds".to_string(), ChangeSource::Pull, 2)));
    assert!(seen.contains(&("cattle".to_string(), ChangeSource::Push, 1)));
}

#[tokio::test]
async fn checkpoints_survive_a_restart() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("sync.toml");
    fs::write(
        &config_path,
        r#"
clock_skew_secs = 30
apply_batch_size = 1

[retry]
max_retries = 0
"#,
    )
    .unwrap();
    let config = SyncConfig::load(&config_path).unwrap();
    let store_path = dir.path().join("farm-1.json");

    let registry = Arc::new(SchemaRegistry::farm_defaults());
    let remote = Arc::new(InMemoryRemote::new(registry.clone()));
    let farm = tenant("farm-1");
    remote.seed("herds", &herd(&farm, 10));
    remote.seed("herds", &herd(&farm, 20));

    {
        let store = Arc::new(ArenaStore::open(registry.clone(), &store_path).unwrap());
        let coordinator =
            SyncCoordinator::new(store, remote.clone(), registry.clone(), config.clone()).unwrap();
        let session = coordinator.run_full_sync(&farm).await;
        assert_eq!(session.stats("herds").unwrap().applied, 2);
    }

    let store = Arc::new(ArenaStore::open(registry.clone(), &store_path).unwrap());
    assert_eq!(
        store
            .active_records("herds", &scope(&farm))
            .await
            .unwrap()
            .len(),
        2
    );
    let coordinator = SyncCoordinator::new(store, remote.clone(), registry, config).unwrap();
    let session = coordinator.run_pull_only(&farm).await;

    assert_eq!(session.status, SessionStatus::Succeeded);
    assert_eq!(session.summary().applied, 0);
    let last_fetch = remote
        .calls()
        .into_iter()
        .rfind(|c| c.op == RemoteOp::FetchActive && c.table == "herds")
        .unwrap();
    assert_eq!(last_fetch.since, Some(at(20) - chrono::Duration::seconds(30)));
}
