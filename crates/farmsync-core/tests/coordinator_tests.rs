//! SyncCoordinator sessions end to end against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use farmsync_core::{
    Error, FailureKind, SessionStatus, SyncConfig, SyncCoordinator, SyncMode, SyncRequest,
    SyncTrigger,
};
use farmsync_remote::RetryPolicy;
use farmsync_schema::{SchemaRegistry, epoch};
use farmsync_store::{ArenaStore, LocalStore};
use farmsync_test_utils::fixtures::{cow, health_record, herd, scope, tenant};
use farmsync_test_utils::{Fault, FaultyStore, InMemoryRemote, RemoteOp};
use pretty_assertions::assert_eq;

fn config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        },
        ..SyncConfig::default()
    }
}

fn setup() -> (Arc<SyncCoordinator>, Arc<ArenaStore>, Arc<InMemoryRemote>) {
    let registry = Arc::new(SchemaRegistry::farm_defaults());
    let store = Arc::new(ArenaStore::new(registry.clone()));
    let remote = Arc::new(InMemoryRemote::new(registry.clone()));
    let coordinator =
        SyncCoordinator::new(store.clone(), remote.clone(), registry, config()).unwrap();
    (coordinator, store, remote)
}

fn is_fetch(op: RemoteOp) -> bool {
    matches!(op, RemoteOp::FetchActive | RemoteOp::FetchDeleted)
}

#[tokio::test]
async fn full_sync_pulls_everything_before_pushing_parents_first() {
    let (coordinator, store, remote) = setup();
    let farm = tenant("farm-1");
    let remote_herd = herd(&farm, 10);
    let remote_cow = cow(&farm, 20);
    remote.seed("herds", &remote_herd);
    remote.seed("cattle", &remote_cow);

    let treatment = health_record(&farm, remote_cow.id, 30);
    store
        .write_local("health_records", &scope(&farm), treatment)
        .await
        .unwrap();
    store
        .write_local("herds", &scope(&farm), herd(&farm, 40))
        .await
        .unwrap();

    let session = coordinator.run_full_sync(&farm).await;

    assert!(session.succeeded(), "{:?}", session.failure);
    assert_eq!(session.trigger, SyncTrigger::User);
    assert_eq!(session.stats("herds").unwrap().applied, 1);
    assert_eq!(session.stats("cattle").unwrap().applied, 1);
    assert_eq!(session.stats("herds").unwrap().pushed, 1);
    assert_eq!(session.stats("health_records").unwrap().pushed, 1);

    let calls = remote.calls();
    let first_push = calls
        .iter()
        .position(|c| !is_fetch(c.op))
        .expect("something was pushed");
    assert!(calls[..first_push].iter().all(|c| is_fetch(c.op)));
    assert!(calls[first_push..].iter().all(|c| !is_fetch(c.op)));

    let pushed: Vec<&str> = calls[first_push..].iter().map(|c| c.table.as_str()).collect();
    assert_eq!(pushed, vec!["herds", "health_records"]);
}

#[tokio::test]
async fn second_sync_without_changes_is_quiet() {
    let (coordinator, _store, remote) = setup();
    let farm = tenant("farm-1");
    remote.seed("herds", &herd(&farm, 10));

    let first = coordinator.run_full_sync(&farm).await;
    let second = coordinator.run_full_sync(&farm).await;

    assert_eq!(first.summary().applied, 1);
    let summary = second.summary();
    assert_eq!(summary.status, SessionStatus::Succeeded);
    assert_eq!((summary.applied, summary.pushed), (0, 0));
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn concurrent_requests_join_one_session() {
    let (coordinator, _store, remote) = setup();
    let farm = tenant("farm-1");
    remote.pause();

    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        let farm = farm.clone();
        async move { coordinator.run_full_sync(&farm).await }
    });
    remote.wait_for_calls(RemoteOp::FetchActive, 1).await;
    assert!(coordinator.is_running(&farm));

    let (second, ()) = tokio::join!(coordinator.run_pull_only(&farm), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.resume();
    });
    let first = first.await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.mode, SyncMode::Full);
    assert_eq!(remote.call_count(RemoteOp::FetchActive), 5);
    assert!(!coordinator.is_running(&farm));
}

#[tokio::test]
async fn tenants_sync_independently() {
    let (coordinator, store, remote) = setup();
    let north = tenant("north-farm");
    let south = tenant("south-farm");
    let north_cow = cow(&north, 10);
    let south_cow = cow(&south, 20);
    remote.seed("cattle", &north_cow);
    remote.seed("cattle", &south_cow);

    let (a, b) = tokio::join!(
        coordinator.run_full_sync(&north),
        coordinator.run_full_sync(&south)
    );

    assert!(a.succeeded() && b.succeeded());
    assert_ne!(a.id, b.id);
    let north_ids: Vec<_> = store
        .active_records("cattle", &scope(&north))
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(north_ids, vec![north_cow.id]);
}

#[tokio::test]
async fn cancel_stops_the_running_session_only() {
    let (coordinator, _store, remote) = setup();
    let farm = tenant("farm-1");
    assert!(!coordinator.cancel(&farm));
    remote.pause();

    let running = tokio::spawn({
        let coordinator = coordinator.clone();
        let farm = farm.clone();
        async move { coordinator.run_full_sync(&farm).await }
    });
    remote.wait_for_calls(RemoteOp::FetchActive, 1).await;
    assert!(coordinator.cancel(&farm));

    let session = running.await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.summary().failure, Some(FailureKind::Cancelled));

    remote.resume();
    let next = coordinator.run_full_sync(&farm).await;
    assert!(next.succeeded(), "{:?}", next.failure);
}

#[tokio::test]
async fn rejected_credentials_abort_before_any_push() {
    let (coordinator, store, remote) = setup();
    let farm = tenant("farm-1");
    store
        .write_local("herds", &scope(&farm), herd(&farm, 10))
        .await
        .unwrap();
    remote.fail(RemoteOp::FetchActive, Fault::Auth, 1);

    let session = coordinator.run_full_sync(&farm).await;

    assert_eq!(session.summary().failure, Some(FailureKind::Auth));
    assert_eq!(remote.call_count(RemoteOp::Upsert), 0);
    assert_eq!(
        store
            .pending_mutations("herds", &scope(&farm))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn failed_parent_skips_its_descendants() {
    let (coordinator, store, remote) = setup();
    let farm = tenant("farm-1");
    let parent_cow = cow(&farm, 5);
    store
        .write_local("herds", &scope(&farm), herd(&farm, 10))
        .await
        .unwrap();
    store
        .write_local(
            "health_records",
            &scope(&farm),
            health_record(&farm, parent_cow.id, 20),
        )
        .await
        .unwrap();
    remote.fail_entity(RemoteOp::FetchActive, "cattle", Fault::Server(503), 1);

    let session = coordinator.run_full_sync(&farm).await;

    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.summary().failure, Some(FailureKind::Remote));
    assert!(session.stats("cattle").unwrap().errored);
    assert!(session.stats("health_records").unwrap().skipped);
    assert!(session.stats("breeding_records").unwrap().skipped);
    assert_eq!(session.stats("herds").unwrap().pushed, 1);
    assert!(session.issues.iter().any(|i| i.entity == "cattle"));

    let pushed_tables: Vec<String> = remote
        .calls()
        .into_iter()
        .filter(|c| c.op == RemoteOp::Upsert)
        .map(|c| c.table)
        .collect();
    assert_eq!(pushed_tables, vec!["herds".to_string()]);
}

#[tokio::test]
async fn local_store_failure_fails_the_session() {
    let registry = Arc::new(SchemaRegistry::farm_defaults());
    let store = Arc::new(ArenaStore::new(registry.clone()));
    let faulty = Arc::new(FaultyStore::new(store));
    let remote = Arc::new(InMemoryRemote::new(registry.clone()));
    let coordinator =
        SyncCoordinator::new(faulty.clone(), remote.clone(), registry, config()).unwrap();
    let farm = tenant("farm-1");
    remote.seed("herds", &herd(&farm, 10));
    faulty.fail_apply_on(1);

    let session = coordinator.run_full_sync(&farm).await;

    assert_eq!(session.summary().failure, Some(FailureKind::LocalStore));
}

#[tokio::test]
async fn pull_only_from_foreground_never_pushes() {
    let (coordinator, store, remote) = setup();
    let farm = tenant("farm-1");
    store
        .write_local("herds", &scope(&farm), herd(&farm, 10))
        .await
        .unwrap();

    let session = coordinator
        .run(
            &farm,
            SyncRequest::new(SyncMode::PullOnly, SyncTrigger::Foreground),
        )
        .await;

    assert!(session.succeeded());
    assert_eq!(session.trigger, SyncTrigger::Foreground);
    assert_eq!(remote.call_count(RemoteOp::Upsert), 0);
}

#[tokio::test]
async fn full_reconcile_lists_from_the_epoch() {
    let (coordinator, _store, remote) = setup();
    let farm = tenant("farm-1");
    remote.seed("herds", &herd(&farm, 10));
    coordinator.run_pull_only(&farm).await;

    let request = SyncRequest::new(SyncMode::PullOnly, SyncTrigger::User).full_reconcile();
    let session = coordinator.run(&farm, request).await;

    assert!(session.succeeded());
    let last_herd_fetch = remote
        .calls()
        .into_iter()
        .rfind(|c| c.op == RemoteOp::FetchActive && c.table == "herds")
        .unwrap();
    assert_eq!(last_herd_fetch.since, Some(epoch()));
}

#[tokio::test]
async fn progress_reaches_the_session_total() {
    let (coordinator, _store, _remote) = setup();
    let farm = tenant("farm-1");
    let progress = coordinator.progress(&farm);
    assert_eq!(progress.borrow().status, SessionStatus::Idle);

    coordinator.run_full_sync(&farm).await;

    let last = progress.borrow().clone();
    assert_eq!(last.status, SessionStatus::Succeeded);
    assert_eq!((last.completed, last.total), (10, 10));
}

#[tokio::test(start_paused = true)]
async fn periodic_sync_runs_until_shutdown() {
    let (coordinator, _store, remote) = setup();
    let farm = tenant("farm-1");

    let handle = coordinator.spawn_periodic(farm.clone(), Duration::from_secs(1));
    remote.wait_for_calls(RemoteOp::FetchActive, 10).await;
    coordinator.shutdown();
    handle.await.unwrap();

    let calls = remote.calls().len();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(remote.calls().len(), calls);
}

#[test]
fn invalid_config_is_rejected() {
    let registry = Arc::new(SchemaRegistry::farm_defaults());
    let store = Arc::new(ArenaStore::new(registry.clone()));
    let remote = Arc::new(InMemoryRemote::new(registry.clone()));
    let config = SyncConfig {
        parallelism: 0,
        ..SyncConfig::default()
    };

    let result = SyncCoordinator::new(store, remote, registry, config);

    assert!(matches!(result, Err(Error::Config { .. })));
}
