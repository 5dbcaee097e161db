//! Convergence properties of the drain and pull passes.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use common::{monitor_config, record, Desktop};
use harbor_db::{Database, DbConfig, LocalHost};
use harbor_sync::remote::RemoteResult;
use harbor_sync::{
    AdapterSettings, ConnectivityMonitor, DatabaseAdapter, DrainSkip, EventHub, MemoryRemote,
    Record, RemoteError, RemoteStore, RuntimeContext, SyncActivity, SyncTable,
};

#[tokio::test]
async fn second_drain_writes_nothing() {
    let desktop = Desktop::new().await;
    desktop.go_online().await;

    desktop
        .adapter
        .insert(SyncTable::Customers, &record(json!({ "id": "cu1", "name": "Ada" })))
        .await
        .unwrap();
    desktop
        .adapter
        .update(SyncTable::Customers, "cu1", &record(json!({ "phone": "555" })))
        .await
        .unwrap();

    let first = desktop.adapter.drain().await.unwrap();
    assert_eq!(first.synced, 2);
    let writes = desktop.remote.write_count();

    let second = desktop.adapter.drain().await.unwrap();
    assert_eq!(second.attempted, 0);
    assert_eq!(desktop.remote.write_count(), writes);

    desktop.close().await;
}

#[tokio::test]
async fn insert_conflict_converges_to_local_values() {
    let desktop = Desktop::new().await;
    desktop.go_online().await;

    desktop.remote.seed(
        "products",
        record(json!({ "id": "p1", "name": "Old name", "sale_price": 1.0, "unit": "box" })),
    );

    desktop
        .adapter
        .insert(
            SyncTable::Products,
            &record(json!({ "id": "p1", "name": "New name", "price": 2.5 })),
        )
        .await
        .unwrap();

    let report = desktop.adapter.drain().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.converted, 1);

    let row = desktop.remote.row("products", "p1").unwrap();
    assert_eq!(row["name"], json!("New name"));
    assert_eq!(row["sale_price"], json!(2.5));
    // Conversion sends a patch, so remote-only columns keep their values.
    assert_eq!(row["unit"], json!("box"));

    desktop.close().await;
}

#[tokio::test]
async fn update_of_row_never_uploaded_becomes_insert() {
    let desktop = Desktop::new().await;
    desktop.go_online().await;

    // Written straight into SQLite, so no queued insert exists.
    desktop
        .local
        .insert("categories", &record(json!({ "id": "c1", "name": "Snacks", "is_active": 1 })))
        .await
        .unwrap();

    desktop
        .adapter
        .update(SyncTable::Categories, "c1", &record(json!({ "description": "Salty" })))
        .await
        .unwrap();

    let report = desktop.adapter.drain().await.unwrap();
    assert_eq!(report.converted, 1);

    let row = desktop.remote.row("categories", "c1").unwrap();
    assert_eq!(row["name"], json!("Snacks"));
    assert_eq!(row["description"], json!("Salty"));
    assert_eq!(row["active"], json!(true));

    desktop.close().await;
}

#[tokio::test]
async fn entries_stop_retrying_at_the_ceiling() {
    let desktop = Desktop::with_settings(AdapterSettings {
        max_attempts: 2,
        ..AdapterSettings::default()
    })
    .await;
    desktop.go_online().await;
    desktop
        .remote
        .fail_table("customers", RemoteError::Transient("connection reset".into()));

    desktop
        .adapter
        .insert(SyncTable::Customers, &record(json!({ "id": "cu1", "name": "Ada" })))
        .await
        .unwrap();

    let first = desktop.adapter.drain().await.unwrap();
    assert_eq!((first.failed, first.exhausted), (1, 0));
    assert_eq!(desktop.adapter.queue_status().await.unwrap().pending, 1);

    let second = desktop.adapter.drain().await.unwrap();
    assert_eq!((second.failed, second.exhausted), (1, 1));

    desktop.remote.clear_failures();
    let third = desktop.adapter.drain().await.unwrap();
    assert_eq!(third.attempted, 0);
    assert!(desktop.remote.row("customers", "cu1").is_none());

    let status = desktop.adapter.queue_status().await.unwrap();
    assert_eq!((status.pending, status.failed), (0, 1));

    let exhausted = desktop.adapter.list_exhausted().await.unwrap();
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].attempts, 2);
    assert!(exhausted[0]
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("connection reset")));

    // The local row is never rolled back.
    assert!(desktop
        .adapter
        .get_by_id(SyncTable::Customers, "cu1")
        .await
        .unwrap()
        .is_some());

    desktop.close().await;
}

#[tokio::test]
async fn failing_entry_does_not_block_the_batch() {
    let desktop = Desktop::new().await;
    desktop.go_online().await;
    desktop.remote.fail_table(
        "customers",
        RemoteError::Rejected {
            status: 422,
            message: "invalid email".into(),
        },
    );

    desktop
        .adapter
        .insert(SyncTable::Customers, &record(json!({ "id": "cu1", "name": "Ada" })))
        .await
        .unwrap();
    desktop
        .adapter
        .insert(SyncTable::Products, &record(json!({ "id": "p1", "name": "Cola" })))
        .await
        .unwrap();

    let report = desktop.adapter.drain().await.unwrap();
    assert_eq!((report.attempted, report.synced, report.failed), (2, 1, 1));
    assert!(desktop.remote.row("products", "p1").is_some());

    desktop.close().await;
}

/// Records the table of every insert and checks parents are present.
struct OrderingRemote {
    inner: MemoryRemote,
    inserts: Mutex<Vec<String>>,
    orphans: Mutex<Vec<String>>,
}

impl OrderingRemote {
    fn parent_of(table: &str, record: &Record) -> Option<(&'static str, String)> {
        let (column, parent) = match table {
            "products" => ("category_id", "categories"),
            "sale_items" => ("sale_id", "sales"),
            "sales" => ("customer_id", "customers"),
            _ => return None,
        };
        record
            .get(column)
            .and_then(|v| v.as_str())
            .map(|id| (parent, id.to_string()))
    }
}

#[async_trait]
impl RemoteStore for OrderingRemote {
    async fn insert(&self, table: &str, record: &Record) -> RemoteResult<()> {
        if let Some((parent, id)) = Self::parent_of(table, record) {
            if self.inner.row(parent, &id).is_none() {
                self.orphans.lock().unwrap().push(format!("{table} -> {parent}/{id}"));
            }
        }
        self.inserts.lock().unwrap().push(table.to_string());
        self.inner.insert(table, record).await
    }

    async fn update(&self, table: &str, key: &str, id: &str, patch: &Record) -> RemoteResult<u64> {
        self.inner.update(table, key, id, patch).await
    }

    async fn delete(&self, table: &str, key: &str, id: &str) -> RemoteResult<u64> {
        self.inner.delete(table, key, id).await
    }

    async fn select_all(&self, table: &str) -> RemoteResult<Vec<Record>> {
        self.inner.select_all(table).await
    }

    async fn select_by_id(&self, table: &str, key: &str, id: &str) -> RemoteResult<Option<Record>> {
        self.inner.select_by_id(table, key, id).await
    }

    async fn ping(&self) -> RemoteResult<()> {
        self.inner.ping().await
    }
}

#[tokio::test]
async fn parents_reach_the_remote_before_children() {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let (host, local) = LocalHost::spawn(&db).await.unwrap();
    let remote = Arc::new(OrderingRemote {
        inner: MemoryRemote::new(),
        inserts: Mutex::new(Vec::new()),
        orphans: Mutex::new(Vec::new()),
    });
    let monitor =
        ConnectivityMonitor::new(RuntimeContext::Desktop, Some(remote.clone()), monitor_config());
    let adapter = DatabaseAdapter::new(
        RuntimeContext::Desktop,
        local,
        remote.clone(),
        monitor.clone(),
        EventHub::new(),
        AdapterSettings::default(),
    );
    monitor.check_now().await;

    // Children written first, as a checkout flow would if it created the
    // line items before the header.
    adapter
        .insert(
            SyncTable::SaleItems,
            &record(json!({
                "id": "si1", "sale_id": "s1", "product_id": "p1",
                "quantity": 1, "unit_price": 2.0, "line_total": 2.0
            })),
        )
        .await
        .unwrap();
    adapter
        .insert(SyncTable::Sales, &record(json!({ "id": "s1", "customer_id": "cu1", "total": 2.0 })))
        .await
        .unwrap();
    adapter
        .insert(SyncTable::Products, &record(json!({ "id": "p1", "name": "Cola", "category_id": "c1" })))
        .await
        .unwrap();
    adapter
        .insert(SyncTable::Customers, &record(json!({ "id": "cu1", "name": "Ada" })))
        .await
        .unwrap();
    adapter
        .insert(SyncTable::Categories, &record(json!({ "id": "c1", "name": "Drinks" })))
        .await
        .unwrap();

    let report = adapter.drain().await.unwrap();
    assert_eq!(report.synced, 5);

    assert!(remote.orphans.lock().unwrap().is_empty());
    assert_eq!(
        *remote.inserts.lock().unwrap(),
        vec!["categories", "customers", "products", "sales", "sale_items"]
    );

    host.shutdown().await;
    db.close().await;
}

#[tokio::test]
async fn offline_edits_converge_after_sync() {
    let desktop = Desktop::new().await;
    desktop.go_offline().await;

    let a = desktop
        .adapter
        .insert(SyncTable::Customers, &record(json!({ "name": "Ada", "tax_id": "A-1" })))
        .await
        .unwrap();
    let b = desktop
        .adapter
        .insert(SyncTable::Customers, &record(json!({ "name": "Bob" })))
        .await
        .unwrap();
    desktop
        .adapter
        .update(SyncTable::Customers, &a, &record(json!({ "name": "Ada Lovelace" })))
        .await
        .unwrap();
    desktop.adapter.delete(SyncTable::Customers, &b).await.unwrap();
    desktop.remote.seed(
        "customers",
        record(json!({ "id": "cu-remote", "name": "Grace", "loyalty_points": 40 })),
    );

    desktop.go_online().await;
    let report = desktop.adapter.sync().await.unwrap();
    assert_eq!(report.drain.synced, 4);
    assert!(report.pull.is_complete());

    let schema = SyncTable::Customers.schema();
    let mut remote_names: Vec<_> = desktop
        .remote
        .rows("customers")
        .iter()
        .map(|row| schema.to_local(row)["name"].clone())
        .collect();
    let mut local_names: Vec<_> = desktop
        .adapter
        .get_all(SyncTable::Customers)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row["name"].clone())
        .collect();
    remote_names.sort_by_key(|v| v.to_string());
    local_names.sort_by_key(|v| v.to_string());

    assert_eq!(remote_names, vec![json!("Ada Lovelace"), json!("Grace")]);
    assert_eq!(local_names, remote_names);
    assert_eq!(desktop.adapter.queue_status().await.unwrap().pending, 0);

    desktop.close().await;
}

#[tokio::test]
async fn queued_delete_is_not_undone_by_pull() {
    let desktop = Desktop::with_settings(AdapterSettings {
        batch_size: 1,
        ..AdapterSettings::default()
    })
    .await;
    desktop.go_online().await;

    desktop
        .adapter
        .insert(SyncTable::Customers, &record(json!({ "id": "cu1", "name": "Ada" })))
        .await
        .unwrap();
    desktop.adapter.drain().await.unwrap();

    desktop.go_offline().await;
    desktop
        .adapter
        .insert(SyncTable::Customers, &record(json!({ "id": "cu2", "name": "Bob" })))
        .await
        .unwrap();
    desktop.adapter.delete(SyncTable::Customers, "cu1").await.unwrap();
    desktop.go_online().await;

    // One entry per pass: the delete is still queued when the first pull runs.
    let first = desktop.adapter.sync().await.unwrap();
    assert_eq!(first.drain.synced, 1);
    assert_eq!(first.pull.tables[&SyncTable::Customers].deferred, 1);
    assert!(desktop
        .adapter
        .get_by_id(SyncTable::Customers, "cu1")
        .await
        .unwrap()
        .is_none());

    desktop.adapter.sync().await.unwrap();
    desktop.adapter.sync().await.unwrap();

    let mut local: Vec<String> = desktop
        .adapter
        .get_all(SyncTable::Customers)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row["id"].as_str().unwrap().to_string())
        .collect();
    let mut remote: Vec<String> = desktop
        .remote
        .rows("customers")
        .iter()
        .map(|row| row["id"].as_str().unwrap().to_string())
        .collect();
    local.sort();
    remote.sort();

    assert_eq!(local, vec!["cu2"]);
    assert_eq!(local, remote);
    assert_eq!(desktop.adapter.queue_status().await.unwrap().pending, 0);

    desktop.close().await;
}

#[tokio::test]
async fn drain_stops_at_failed_reachability_check() {
    let desktop = Desktop::new().await;
    desktop.go_online().await;

    desktop
        .adapter
        .insert(SyncTable::Products, &record(json!({ "id": "p1", "name": "Cola" })))
        .await
        .unwrap();

    // The monitor still reports Online from its last probe.
    desktop.remote.set_online(false);
    let report = desktop.adapter.drain().await.unwrap();
    assert_eq!(report.skipped, Some(DrainSkip::Unreachable));
    assert_eq!(report.attempted, 0);

    let rows = desktop.queue_rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["attempts"], json!(0));
    assert!(rows[0]["last_error"].is_null());

    desktop.close().await;
}

#[tokio::test]
async fn periodic_drain_uploads_while_online() {
    let desktop = Desktop::new().await;
    let mut activity = desktop.events.subscribe_activity();

    desktop
        .adapter
        .insert(SyncTable::Categories, &record(json!({ "id": "c1", "name": "Drinks" })))
        .await
        .unwrap();
    let task = desktop
        .adapter
        .spawn_periodic_drain(Duration::from_millis(50));

    // Ticks while the last probe says Offline do nothing.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(desktop.remote.row("categories", "c1").is_none());

    desktop.go_online().await;
    let report = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(SyncActivity::Drained(report)) = activity.recv().await {
                if report.synced > 0 {
                    return report;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(report.synced, 1);
    assert!(desktop.remote.row("categories", "c1").is_some());

    task.abort();
    desktop.close().await;
}
