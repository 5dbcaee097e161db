//! End-to-end offline/online scenarios for the desktop context.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{record, Desktop};
use harbor_sync::{ConnectivityStatus, DrainSkip, QueueStatus, SyncTable};

#[tokio::test]
async fn offline_insert_is_uploaded_after_reconnect() {
    let desktop = Desktop::new().await;
    desktop.go_offline().await;

    let id = desktop
        .adapter
        .insert(
            SyncTable::Products,
            &record(json!({ "id": "p1", "name": "Cola", "price": 1.5, "stock": 12 })),
        )
        .await
        .unwrap();
    assert_eq!(id, "p1");

    let rows = desktop.queue_rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["operation"], json!("insert"));
    assert_eq!(rows[0]["table_name"], json!("products"));
    assert_eq!(rows[0]["record_id"], json!("p1"));
    assert_eq!(rows[0]["synced"], json!(0));

    let report = desktop.adapter.drain().await.unwrap();
    assert_eq!(report.skipped, Some(DrainSkip::Offline));
    assert!(desktop.remote.row("products", "p1").is_none());

    desktop.go_online().await;
    let report = desktop.adapter.drain().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.failed, 0);

    let remote_row = desktop.remote.row("products", "p1").unwrap();
    assert_eq!(remote_row["sale_price"], json!(1.5));
    assert_eq!(remote_row["stock_quantity"], json!(12));
    assert_eq!(remote_row["unit"], json!("unit"));
    assert!(!remote_row.contains_key("price"));

    let rows = desktop.queue_rows().await;
    assert_eq!(rows[0]["synced"], json!(1));
    assert!(rows[0]["synced_at"].is_string());

    assert_eq!(
        desktop.adapter.queue_status().await.unwrap(),
        QueueStatus { pending: 0, synced: 1, failed: 0 }
    );

    desktop.close().await;
}

#[tokio::test]
async fn update_of_remotely_deleted_row_recreates_it() {
    let desktop = Desktop::new().await;
    desktop.go_online().await;

    desktop
        .adapter
        .insert(
            SyncTable::CashRegisters,
            &record(json!({ "id": "r1", "name": "Front", "opening_balance": 100.0 })),
        )
        .await
        .unwrap();
    desktop.adapter.drain().await.unwrap();
    assert!(desktop.remote.row("cash_registers", "r1").is_some());

    desktop.go_offline().await;
    desktop
        .adapter
        .update(
            SyncTable::CashRegisters,
            "r1",
            &record(json!({ "status": "open", "current_balance": 120.0, "opened_by": "u1" })),
        )
        .await
        .unwrap();
    desktop.remote.remove("cash_registers", "r1");

    desktop.go_online().await;
    let report = desktop.adapter.drain().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.converted, 1);

    let recreated = desktop.remote.row("cash_registers", "r1").unwrap();
    assert_eq!(recreated["name"], json!("Front"));
    assert_eq!(recreated["status"], json!("open"));
    assert_eq!(recreated["current_balance"], json!(120.0));
    assert_eq!(recreated["opening_balance"], json!(100.0));
    assert_eq!(recreated["opened_by_user_id"], json!("u1"));

    desktop.close().await;
}

#[tokio::test]
async fn probe_timeout_does_not_block_local_writes() {
    let desktop = Desktop::new().await;
    desktop.go_online().await;

    desktop.remote.set_latency(Some(Duration::from_millis(500)));
    assert_eq!(desktop.monitor.check_now().await, ConnectivityStatus::Offline);
    assert_eq!(desktop.monitor.status(), ConnectivityStatus::Online);
    assert!(desktop.monitor.is_online());

    let id = desktop
        .adapter
        .insert(
            SyncTable::Customers,
            &record(json!({ "name": "Ada", "tax_id": "X-1" })),
        )
        .await
        .unwrap();

    let row = desktop
        .adapter
        .get_by_id(SyncTable::Customers, &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["tax_id"], json!("X-1"));

    let status = desktop.adapter.queue_status().await.unwrap();
    assert_eq!(status.pending, 1);

    let report = desktop.adapter.drain().await.unwrap();
    assert!(report.is_skipped());

    desktop.close().await;
}

#[tokio::test]
async fn reconnect_trigger_drains_and_pulls() {
    let desktop = Desktop::new().await;
    desktop.go_offline().await;

    let trigger = desktop.adapter.spawn_reconnect_trigger(true);
    let mut activity = desktop.events.subscribe_activity();

    desktop
        .adapter
        .insert(SyncTable::Categories, &record(json!({ "id": "c1", "name": "Drinks" })))
        .await
        .unwrap();
    desktop.remote.seed(
        "users",
        record(json!({ "id": "u1", "username": "ada", "display_name": "Ada L.", "active": true })),
    );

    desktop.go_online().await;

    let pulled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(harbor_sync::SyncActivity::Pulled(report)) = activity.recv().await {
                return report;
            }
        }
    })
    .await
    .unwrap();
    assert!(pulled.is_complete());

    assert!(desktop.remote.row("categories", "c1").is_some());
    let user = desktop.local.get_by_id("users", "id", "u1").await.unwrap().unwrap();
    assert_eq!(user["full_name"], json!("Ada L."));

    trigger.abort();
    desktop.close().await;
}
