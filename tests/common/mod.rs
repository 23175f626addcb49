#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use hospital_stock::{
    config::AppConfig,
    db::{self, DbConfig},
    DecrementStock, IncrementStock, InMemoryQuantityStore, QuantityStore, SeaOrmQuantityStore,
    ServiceError, StockKey, StockService, TransferStock, WarehouseType,
};
use tempfile::TempDir;

pub fn in_memory_service() -> StockService<InMemoryQuantityStore> {
    in_memory_service_with_timeout(Duration::from_secs(5))
}

pub fn in_memory_service_with_timeout(
    lock_timeout: Duration,
) -> StockService<InMemoryQuantityStore> {
    StockService::new(Arc::new(InMemoryQuantityStore::with_lock_timeout(
        lock_timeout,
    )))
}

/// SQLite-backed service on a fresh database file; keep the `TempDir` alive.
pub async fn sqlite_service() -> (StockService<SeaOrmQuantityStore>, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("stock.db");

    // shipped pool defaults; the db layer narrows SQLite to one connection
    let mut cfg = AppConfig::new(format!("sqlite://{}?mode=rwc", path.display()), "test".into());
    cfg.db_acquire_timeout_secs = 30;

    let pool = db::establish_connection_with_config(&DbConfig::from(&cfg))
        .await
        .expect("db connect");
    db::run_migrations(&pool).await.expect("migrations");

    let store = SeaOrmQuantityStore::new(Arc::new(pool), cfg.lock_timeout());
    (StockService::new(Arc::new(store)), dir)
}

pub fn key(lot_id: i64, kind: WarehouseType, warehouse_id: i64) -> StockKey {
    StockKey::new(lot_id, kind, warehouse_id)
}

pub fn increment(key: StockKey, amount: i64) -> IncrementStock {
    IncrementStock {
        lot_id: key.lot_id,
        warehouse_type: key.warehouse_type,
        warehouse_id: key.warehouse_id,
        amount,
        hospital_id: 1,
        site_id: None,
    }
}

pub fn decrement(key: StockKey, amount: i64) -> DecrementStock {
    DecrementStock {
        lot_id: key.lot_id,
        warehouse_type: key.warehouse_type,
        warehouse_id: key.warehouse_id,
        amount,
    }
}

/// Transfer of one lot between two keys; both keys must share the lot.
pub fn transfer(source: StockKey, destination: StockKey, amount: i64) -> TransferStock {
    TransferStock {
        lot_id: source.lot_id,
        source_type: source.warehouse_type,
        source_id: source.warehouse_id,
        destination_type: destination.warehouse_type,
        destination_id: destination.warehouse_id,
        amount,
        destination_hospital_id: 1,
        destination_site_id: None,
    }
}

pub async fn quantity<S: QuantityStore>(service: &StockService<S>, key: StockKey) -> Option<i64> {
    service
        .get_stock(&key)
        .await
        .expect("read stock")
        .map(|record| record.quantity)
}

/// 25 in, 25 out, then one more is refused with nothing left.
pub async fn scenario_drain_and_overdraw<S: QuantityStore>(service: &StockService<S>) {
    let central = key(1, WarehouseType::Central, 1);

    let record = service.increment(increment(central, 25)).await.unwrap();
    assert_eq!(record.quantity, 25);

    let record = service.decrement(decrement(central, 25)).await.unwrap();
    assert_eq!(record.quantity, 0);

    let err = service.decrement(decrement(central, 1)).await.unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock { available: 0, .. });
    assert_eq!(quantity(service, central).await, Some(0));
}

pub async fn scenario_transfer_central_to_emergency<S: QuantityStore>(service: &StockService<S>) {
    let central = key(1, WarehouseType::Central, 1);
    let emergency = key(1, WarehouseType::Emergency, 2);
    service.increment(increment(central, 10)).await.unwrap();

    let outcome = service
        .transfer(transfer(central, emergency, 10))
        .await
        .unwrap();

    assert_eq!(outcome.source.quantity, 0);
    assert_eq!(outcome.destination.quantity, 10);
    assert_eq!(quantity(service, central).await, Some(0));
    assert_eq!(quantity(service, emergency).await, Some(10));
}

pub async fn scenario_failed_transfer_writes_nothing<S: QuantityStore>(service: &StockService<S>) {
    let pharmacy = key(3, WarehouseType::Pharmacy, 1);
    let consultation = key(3, WarehouseType::Consultation, 4);
    service.increment(increment(pharmacy, 5)).await.unwrap();
    service.increment(increment(consultation, 2)).await.unwrap();

    let err = service
        .transfer(transfer(pharmacy, consultation, 6))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock { available: 5, .. });

    assert_eq!(quantity(service, pharmacy).await, Some(5));
    assert_eq!(quantity(service, consultation).await, Some(2));
}

pub async fn scenario_transfer_to_new_destination_from_missing_source<S: QuantityStore>(
    service: &StockService<S>,
) {
    let missing = key(4, WarehouseType::Auxiliary, 1);
    let fresh = key(4, WarehouseType::Parallel, 9);

    let err = service
        .transfer(transfer(missing, fresh, 1))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(k) if k == missing);

    assert_eq!(quantity(service, missing).await, None);
    assert_eq!(quantity(service, fresh).await, None);
}

pub async fn scenario_decrement_missing_key<S: QuantityStore>(service: &StockService<S>) {
    let absent = key(5, WarehouseType::SupportServices, 3);
    let err = service.decrement(decrement(absent, 1)).await.unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
    assert_eq!(quantity(service, absent).await, None);
}
