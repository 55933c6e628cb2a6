//! Lifecycle tests for the delivery engine's scheduling tasks.
//!
//! These run the real notification and poll tasks on the tokio runtime, so
//! they use the real clock with short intervals.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use serde_json::json;
use sluice_core::{Clock, RealClock};
use sluice_delivery::{
    client::mock::MockGateway,
    storage::mock::{MockOutboxStorage, NewOutboxRow},
    DeliveryConfig, DeliveryEngine, DeliveryError,
};
use tokio::sync::mpsc;

fn build_engine(
    storage: &MockOutboxStorage,
    gateway: &MockGateway,
    config: DeliveryConfig,
) -> Result<DeliveryEngine> {
    Ok(DeliveryEngine::new(
        Arc::new(storage.clone()),
        Arc::new(gateway.clone()),
        config,
        Arc::new(RealClock::new()) as Arc<dyn Clock>,
    )?)
}

fn config(poll_interval: Duration) -> DeliveryConfig {
    DeliveryConfig {
        worker_id: "worker-engine".to_string(),
        poll_interval,
        shutdown_timeout: Duration::from_secs(5),
        ..DeliveryConfig::default()
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

async fn all_processed(storage: &MockOutboxStorage) -> bool {
    let events = storage.events().await;
    !events.is_empty() && events.iter().all(|row| row.processed)
}

async fn insert_patient(storage: &MockOutboxStorage, txid: i64, patient: i32) {
    storage
        .insert(
            NewOutboxRow::new(txid, json!({"identifier_system": "urn:mrn", "identifier_value": patient}))
                .patient(patient),
        )
        .await;
}

#[tokio::test]
async fn notification_drains_pending_groups() -> Result<()> {
    let storage = MockOutboxStorage::new(Arc::new(RealClock::new()));
    let gateway = MockGateway::new();
    let mut engine = build_engine(&storage, &gateway, config(Duration::from_secs(3600)))?;
    let (tx, rx) = mpsc::channel(8);

    engine.start(Box::new(rx)).await;
    assert_eq!(engine.stats().await.active_tasks, 3);

    insert_patient(&storage, 100, 1).await;
    insert_patient(&storage, 101, 2).await;
    tx.send("fhir_outbox insert".to_string()).await?;

    eventually(|| {
        let storage = storage.clone();
        async move { all_processed(&storage).await }
    })
    .await;
    assert_eq!(gateway.call_count().await, 2);
    assert_eq!(storage.ledger().await.len(), 2);

    let stats = engine.stats().await;
    assert_eq!(stats.notifications_received, 1);
    assert_eq!(stats.groups_delivered, 2);

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn poll_covers_missed_notifications() -> Result<()> {
    let storage = MockOutboxStorage::new(Arc::new(RealClock::new()));
    let gateway = MockGateway::new();
    let mut engine = build_engine(&storage, &gateway, config(Duration::from_millis(20)))?;
    let (_tx, rx) = mpsc::channel::<String>(8);

    engine.start(Box::new(rx)).await;
    insert_patient(&storage, 100, 1).await;
    insert_patient(&storage, 101, 2).await;

    eventually(|| {
        let storage = storage.clone();
        async move { all_processed(&storage).await }
    })
    .await;
    assert_eq!(engine.stats().await.notifications_received, 0);

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn overlapping_triggers_deliver_each_group_once() -> Result<()> {
    let storage = MockOutboxStorage::new(Arc::new(RealClock::new()));
    let gateway = MockGateway::new().with_latency(Duration::from_millis(30));
    let mut engine = build_engine(&storage, &gateway, config(Duration::from_millis(1)))?;
    let (tx, rx) = mpsc::channel(64);

    for record in 0..3 {
        storage
            .insert(
                NewOutboxRow::new(100, json!({"identifier_system": "urn:mrn", "identifier_value": 7}))
                    .patient(7)
                    .source("patients", record),
            )
            .await;
    }
    engine.start(Box::new(rx)).await;
    for _ in 0..10 {
        tx.send("fhir_outbox insert".to_string()).await?;
    }

    eventually(|| {
        let storage = storage.clone();
        async move { all_processed(&storage).await }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(gateway.call_count().await, 1);
    assert_eq!(storage.ledger().await.len(), 1);
    assert_eq!(engine.stats().await.cycle_errors, 0);
    assert!(storage.events().await.iter().all(|row| row.attempts == 0));

    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn closed_notification_source_leaves_polling_running() -> Result<()> {
    let storage = MockOutboxStorage::new(Arc::new(RealClock::new()));
    let gateway = MockGateway::new();
    let mut engine = build_engine(&storage, &gateway, config(Duration::from_millis(20)))?;
    let (tx, rx) = mpsc::channel::<String>(8);

    engine.start(Box::new(rx)).await;
    drop(tx);
    insert_patient(&storage, 100, 1).await;

    eventually(|| {
        let storage = storage.clone();
        async move { all_processed(&storage).await }
    })
    .await;
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_lets_in_flight_delivery_settle() -> Result<()> {
    let storage = MockOutboxStorage::new(Arc::new(RealClock::new()));
    let gateway = MockGateway::new().with_latency(Duration::from_millis(100));
    let mut engine = build_engine(&storage, &gateway, config(Duration::from_secs(3600)))?;
    let (tx, rx) = mpsc::channel(8);

    engine.start(Box::new(rx)).await;
    insert_patient(&storage, 100, 1).await;
    tx.send(String::new()).await?;
    eventually(|| {
        let gateway = gateway.clone();
        async move { gateway.call_count().await == 1 }
    })
    .await;

    engine.shutdown().await?;

    assert!(all_processed(&storage).await);
    assert_eq!(storage.ledger().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn shutdown_times_out_on_stuck_delivery() -> Result<()> {
    let storage = MockOutboxStorage::new(Arc::new(RealClock::new()));
    let gateway = MockGateway::new().with_latency(Duration::from_secs(2));
    let mut engine = build_engine(&storage, &gateway, DeliveryConfig {
        shutdown_timeout: Duration::from_millis(50),
        ..config(Duration::from_secs(3600))
    })?;
    let (tx, rx) = mpsc::channel(8);

    engine.start(Box::new(rx)).await;
    insert_patient(&storage, 100, 1).await;
    tx.send(String::new()).await?;
    eventually(|| {
        let gateway = gateway.clone();
        async move { gateway.call_count().await == 1 }
    })
    .await;

    let err = engine.shutdown().await.expect_err("shutdown should time out");
    assert!(matches!(err, DeliveryError::ShutdownTimeout { .. }));
    Ok(())
}

#[tokio::test]
async fn idle_engine_shuts_down_promptly() -> Result<()> {
    let storage = MockOutboxStorage::new(Arc::new(RealClock::new()));
    let gateway = MockGateway::new();
    let mut engine = build_engine(&storage, &gateway, config(Duration::from_secs(3600)))?;
    let (_tx, rx) = mpsc::channel::<String>(8);

    engine.start(Box::new(rx)).await;
    tokio::time::timeout(Duration::from_secs(1), engine.shutdown()).await??;
    Ok(())
}
