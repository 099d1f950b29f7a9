//! Property tests: one full sync brings local and remote into agreement.

use std::sync::Arc;

use farmsync_core::{SyncConfig, SyncCoordinator};
use farmsync_remote::RetryPolicy;
use farmsync_schema::{SchemaRegistry, SyncableRecord};
use farmsync_store::{ArenaStore, LocalStore};
use farmsync_test_utils::InMemoryRemote;
use farmsync_test_utils::fixtures::{cow, scope, tenant};
use proptest::prelude::*;
use serde_json::json;

/// What happens to one shared record between two syncs.
#[derive(Debug, Clone)]
enum Action {
    Untouched,
    LocalEdit,
    /// Remote edit `delta` seconds after the shared version
    RemoteEdit(i64),
    RemoteDelete,
    LocalDelete,
}

#[derive(Debug, Clone)]
enum Plan {
    RemoteOnly(i64),
    LocalOnly(i64),
    Shared(i64, Action),
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::Untouched),
        Just(Action::LocalEdit),
        (1i64..=5).prop_map(Action::RemoteEdit),
        Just(Action::RemoteDelete),
        Just(Action::LocalDelete),
    ]
}

fn plan() -> impl Strategy<Value = Plan> {
    prop_oneof![
        (0i64..100).prop_map(Plan::RemoteOnly),
        (0i64..100).prop_map(Plan::LocalOnly),
        (0i64..100, action()).prop_map(|(modified, action)| Plan::Shared(modified, action)),
    ]
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

async fn converge(plans: Vec<Plan>) {
    let registry = Arc::new(SchemaRegistry::farm_defaults());
    let store = Arc::new(ArenaStore::new(registry.clone()));
    let remote = Arc::new(InMemoryRemote::new(registry.clone()));
    let config = SyncConfig {
        apply_batch_size: 3,
        retry: RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        },
        ..SyncConfig::default()
    };
    let coordinator = SyncCoordinator::new(store.clone(), remote.clone(), registry, config).unwrap();
    let farm = tenant("farm-1");
    let farm_scope = scope(&farm);

    let shared: Vec<(SyncableRecord, Action)> = plans
        .iter()
        .filter_map(|plan| match plan {
            Plan::Shared(modified, action) => Some((cow(&farm, *modified), action.clone())),
            _ => None,
        })
        .collect();
    for (record, _) in &shared {
        remote.seed("cattle", record);
    }
    assert!(coordinator.run_full_sync(&farm).await.succeeded());

    let mut ids = Vec::new();
    for (record, action) in &shared {
        ids.push(record.id);
        match action {
            Action::Untouched => {}
            Action::LocalEdit => {
                let edited = record.clone().with_field("sex", json!("male"));
                store.write_local("cattle", &farm_scope, edited).await.unwrap();
            }
            Action::RemoteEdit(delta) => {
                let mut edited = record.clone().with_field("ear_tag", json!("IE-EDITED"));
                edited.modified_at = record.modified_at + chrono::Duration::seconds(*delta);
                remote.seed("cattle", &edited);
            }
            Action::RemoteDelete => {
                let deleted_at = record.modified_at + chrono::Duration::seconds(100);
                remote.tombstone("cattle", Some(&farm), record.id, deleted_at);
            }
            Action::LocalDelete => {
                store.delete_local("cattle", &farm_scope, record.id).await.unwrap();
            }
        }
    }
    for plan in &plans {
        match plan {
            Plan::RemoteOnly(modified) => {
                let record = cow(&farm, *modified);
                remote.seed("cattle", &record);
                ids.push(record.id);
            }
            Plan::LocalOnly(modified) => {
                let record = cow(&farm, *modified);
                store.write_local("cattle", &farm_scope, record.clone()).await.unwrap();
                ids.push(record.id);
            }
            Plan::Shared(..) => {}
        }
    }

    let session = coordinator.run_full_sync(&farm).await;
    assert!(session.succeeded(), "{:?}", session.failure);
    assert!(store.pending_mutations("cattle", &farm_scope).await.unwrap().is_empty());

    for id in ids {
        let local = store.record("cattle", &farm_scope, id).await.unwrap();
        let remote_copy = remote.record("cattle", Some(&farm), id);
        let local_active = local.as_ref().filter(|r| r.is_active());
        let remote_active = remote_copy.as_ref().filter(|r| r.is_active());
        assert_eq!(
            local_active.map(|r| r.modified_at),
            remote_active.map(|r| r.modified_at),
            "record {id} diverged"
        );
    }

    // Nothing is left to exchange.
    let again = coordinator.run_full_sync(&farm).await;
    assert_eq!((again.summary().applied, again.summary().pushed), (0, 0));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn one_full_sync_converges(plans in prop::collection::vec(plan(), 1..8)) {
        block_on(converge(plans));
    }
}
