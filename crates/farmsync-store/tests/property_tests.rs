use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use farmsync_schema::{SchemaRegistry, Scope, SyncableRecord, TenantId, Tombstone};
use farmsync_store::{ApplyBatch, ArenaStore, LocalStore, TieBreak};
use proptest::prelude::*;
use uuid::Uuid;

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(1_700_000_000 + secs)
}

fn ids() -> Vec<Uuid> {
    (1..=6u128).map(Uuid::from_u128).collect()
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
        .block_on(future)
}

#[derive(Debug, Clone)]
enum Row {
    Active { id: usize, modified: i64 },
    Deleted { id: usize, modified: i64, deleted: i64 },
    Tombstone { id: usize, deleted: i64 },
}

fn row() -> impl Strategy<Value = Row> {
    prop_oneof![
        (0..6usize, 0..100i64).prop_map(|(id, modified)| Row::Active { id, modified }),
        (0..6usize, 0..100i64, 0..50i64).prop_map(|(id, modified, extra)| Row::Deleted {
            id,
            modified,
            deleted: modified + extra,
        }),
        (0..6usize, 0..100i64).prop_map(|(id, deleted)| Row::Tombstone { id, deleted }),
    ]
}

fn batch(tenant: &TenantId, rows: &[Row], checkpoint: i64) -> ApplyBatch {
    let ids = ids();
    let mut batch = ApplyBatch::new("cattle", tenant.clone(), TieBreak::default()).advance_to(at(checkpoint));
    for row in rows {
        batch = match *row {
            Row::Active { id, modified } => batch.upsert(
                SyncableRecord::new(ids[id], Some(tenant.clone()), at(modified))
                    .with_field("weight", serde_json::json!(modified)),
            ),
            Row::Deleted { id, modified, deleted } => batch.upsert(
                SyncableRecord::new(ids[id], Some(tenant.clone()), at(modified)).tombstoned(at(deleted)),
            ),
            Row::Tombstone { id, deleted } => batch.tombstone(Tombstone {
                id: ids[id],
                deleted_at: at(deleted),
            }),
        };
    }
    batch
}

fn store() -> ArenaStore {
    ArenaStore::new(Arc::new(SchemaRegistry::farm_defaults()))
}

proptest! {
    #[test]
    fn applying_a_batch_twice_is_idempotent(rows in prop::collection::vec(row(), 0..20)) {
        let farm = TenantId::new("farm-1").unwrap();
        let scope = Scope::Tenant(farm.clone());
        let store = store();
        let batch = batch(&farm, &rows, 100);

        block_on(store.apply(batch.clone())).unwrap();
        let first = block_on(store.snapshot());
        let again = block_on(store.apply(batch)).unwrap();
        let second = block_on(store.snapshot());

        prop_assert_eq!(again.inserted, 0);
        prop_assert_eq!(again.tombstoned, 0);
        prop_assert!(again.changed.is_empty());
        for id in ids() {
            prop_assert_eq!(
                first.record("cattle", &scope, id).unwrap(),
                second.record("cattle", &scope, id).unwrap()
            );
        }
        prop_assert_eq!(first.checkpoints(), second.checkpoints());
    }

    #[test]
    fn deleted_records_are_never_active(rows in prop::collection::vec(row(), 0..20)) {
        let farm = TenantId::new("farm-1").unwrap();
        let scope = Scope::Tenant(farm.clone());
        let store = store();

        block_on(store.apply(batch(&farm, &rows, 100))).unwrap();

        let snapshot = block_on(store.snapshot());
        let active: HashSet<Uuid> = snapshot
            .active_records("cattle", &scope)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        for id in ids() {
            if let Some(record) = snapshot.record("cattle", &scope, id).unwrap() {
                prop_assert_eq!(record.is_active(), active.contains(&id));
            } else {
                prop_assert!(!active.contains(&id));
            }
        }
    }

    #[test]
    fn checkpoint_never_moves_backwards(checkpoints in prop::collection::vec(0..1000i64, 1..10)) {
        let farm = TenantId::new("farm-1").unwrap();
        let store = store();

        for cp in &checkpoints {
            block_on(store.apply(batch(&farm, &[], *cp))).unwrap();
        }

        let max = checkpoints.iter().copied().max().unwrap();
        let stored = block_on(store.snapshot()).checkpoint(&farm, "cattle").unwrap();
        prop_assert_eq!(stored.last_synced_at, at(max));
    }

    #[test]
    fn tenants_with_colliding_ids_never_see_each_other(
        a_rows in prop::collection::vec(row(), 0..12),
        b_rows in prop::collection::vec(row(), 0..12),
    ) {
        let a = TenantId::new("farm-a").unwrap();
        let b = TenantId::new("farm-b").unwrap();
        let store = store();

        block_on(store.apply(batch(&a, &a_rows, 100))).unwrap();
        block_on(store.apply(batch(&b, &b_rows, 100))).unwrap();

        let snapshot = block_on(store.snapshot());
        for (tenant, scope) in [(&a, Scope::Tenant(a.clone())), (&b, Scope::Tenant(b.clone()))] {
            for record in snapshot.active_records("cattle", &scope).unwrap() {
                prop_assert_eq!(record.tenant_id.as_ref(), Some(tenant));
            }
        }
    }
}
