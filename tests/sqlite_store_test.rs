mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::*;
use hospital_stock::{QuantityStore, ServiceError, StockTransaction, TransferStock, WarehouseType};
use tokio::sync::Barrier;

#[tokio::test]
async fn sqlite_drain_then_overdraw() {
    let (service, _dir) = sqlite_service().await;
    scenario_drain_and_overdraw(&service).await;
}

#[tokio::test]
async fn sqlite_transfer_moves_stock() {
    let (service, _dir) = sqlite_service().await;
    scenario_transfer_central_to_emergency(&service).await;
}

#[tokio::test]
async fn sqlite_failed_transfer_writes_nothing() {
    let (service, _dir) = sqlite_service().await;
    scenario_failed_transfer_writes_nothing(&service).await;
}

#[tokio::test]
async fn sqlite_missing_source_creates_nothing() {
    let (service, _dir) = sqlite_service().await;
    scenario_transfer_to_new_destination_from_missing_source(&service).await;
}

#[tokio::test]
async fn sqlite_decrement_never_creates_records() {
    let (service, _dir) = sqlite_service().await;
    scenario_decrement_missing_key(&service).await;
}

#[tokio::test]
async fn sqlite_persists_placement_and_principal_rows() {
    let (service, _dir) = sqlite_service().await;
    let central = key(20, WarehouseType::Central, 1);
    let principal = key(20, WarehouseType::Principal, 4);

    let mut seed = increment(central, 12);
    seed.hospital_id = 2;
    seed.site_id = Some(6);
    let seeded = service.increment(seed).await.unwrap();
    assert_eq!(seeded.site_id, Some(6));

    let outcome = service
        .transfer(TransferStock {
            destination_hospital_id: 2,
            destination_site_id: Some(6),
            ..transfer(central, principal, 5)
        })
        .await
        .unwrap();
    assert_eq!(outcome.principal.as_ref().map(|row| row.quantity), Some(5));

    let stored = service.get_stock(&central).await.unwrap().unwrap();
    assert_eq!(stored.quantity, 7);
    assert_eq!(stored.hospital_id, 2);
    assert_eq!(stored.warehouse_type, WarehouseType::Central);

    let row = service.principal_stock(6, 20, 2).await.unwrap().unwrap();
    assert_eq!(row.quantity, 5);
    assert!(row.status);

    let lot: Vec<_> = service
        .list_lot(20)
        .await
        .unwrap()
        .into_iter()
        .map(|record| (record.key(), record.quantity))
        .collect();
    assert_eq!(lot, vec![(central, 7), (principal, 5)]);
}

#[tokio::test]
async fn sqlite_rolled_back_session_leaves_no_rows() {
    let (service, _dir) = sqlite_service().await;
    let pharmacy = key(21, WarehouseType::Pharmacy, 1);

    let mut txn = service.store().begin().await.unwrap();
    service
        .increment_in(&mut txn, &increment(pharmacy, 3))
        .await
        .unwrap();
    txn.rollback().await.unwrap();

    assert_eq!(quantity(&service, pharmacy).await, None);
    assert!(service.list_lot(21).await.unwrap().is_empty());
}

#[tokio::test]
async fn sqlite_serializes_concurrent_increments() {
    let (service, _dir) = sqlite_service().await;
    let target = key(22, WarehouseType::Central, 1);

    let mut tasks = Vec::new();
    for _ in 0..25 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            service.increment(increment(target, 1)).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(quantity(&service, target).await, Some(25));
}

#[tokio::test]
async fn sqlite_overdraw_reports_available_quantity() {
    let (service, _dir) = sqlite_service().await;
    let target = key(23, WarehouseType::CareServices, 2);
    service.increment(increment(target, 3)).await.unwrap();

    let err = service.decrement(decrement(target, 4)).await.unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock { available: 3, .. });
    assert_eq!(quantity(&service, target).await, Some(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_concurrent_decrements_queue_instead_of_failing() {
    let (service, _dir) = sqlite_service().await;
    let target = key(24, WarehouseType::Pharmacy, 1);
    service.increment(increment(target, 10)).await.unwrap();

    let barrier = Arc::new(Barrier::new(20));
    let mut tasks = Vec::new();
    for _ in 0..20 {
        let service = service.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            service.decrement(decrement(target, 1)).await
        }));
    }

    let mut success = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => success += 1,
            Err(err) => assert_matches!(err, ServiceError::InsufficientStock { available: 0, .. }),
        }
    }
    assert_eq!(success, 10);
    assert_eq!(quantity(&service, target).await, Some(0));
}
