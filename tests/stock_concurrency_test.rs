mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use common::*;
use hospital_stock::{QuantityStore, ServiceError, StockTransaction, WarehouseType};
use tokio::sync::Barrier;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_on_a_new_key_lose_no_updates() {
    let service = in_memory_service();
    let target = key(1, WarehouseType::Central, 1);
    let barrier = Arc::new(Barrier::new(100));

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let service = service.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            service.increment(increment(target, 1)).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(quantity(&service, target).await, Some(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_decrements_never_overdraw() {
    let service = in_memory_service();
    let target = key(2, WarehouseType::Pharmacy, 1);
    service.increment(increment(target, 10)).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
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
    assert_eq!(
        success, 10,
        "exactly 10 decrements should succeed; got {}",
        success
    );
    assert_eq!(quantity(&service, target).await, Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opposite_transfers_between_the_same_pair_complete() {
    let service = in_memory_service_with_timeout(Duration::from_secs(2));
    let a = key(3, WarehouseType::Central, 1);
    let b = key(3, WarehouseType::Emergency, 2);
    service.increment(increment(a, 500)).await.unwrap();
    service.increment(increment(b, 500)).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..200 {
        let service = service.clone();
        let (from, to) = if i % 2 == 0 { (a, b) } else { (b, a) };
        tasks.push(tokio::spawn(async move {
            service.transfer(transfer(from, to, 1)).await
        }));
    }

    let all = async {
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(10), all)
        .await
        .expect("transfers deadlocked");

    let total = quantity(&service, a).await.unwrap() + quantity(&service, b).await.unwrap();
    assert_eq!(total, 1000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lot_readers_never_see_a_half_applied_transfer() {
    let service = in_memory_service();
    let a = key(9, WarehouseType::Central, 1);
    let b = key(9, WarehouseType::Emergency, 1);
    service.increment(increment(a, 100)).await.unwrap();
    service.increment(increment(b, 0)).await.unwrap();

    let writer = {
        let service = service.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                service.transfer(transfer(a, b, 1)).await.unwrap();
            }
        })
    };

    while !writer.is_finished() {
        let total: i64 = service
            .list_lot(9)
            .await
            .unwrap()
            .iter()
            .map(|record| record.quantity)
            .sum();
        assert_eq!(total, 100);
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();

    assert_eq!(quantity(&service, a).await, Some(0));
    assert_eq!(quantity(&service, b).await, Some(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn held_lock_makes_other_writers_time_out() {
    let service = in_memory_service_with_timeout(Duration::from_millis(100));
    let target = key(4, WarehouseType::Central, 1);
    service.increment(increment(target, 5)).await.unwrap();

    let mut holder = service.store().begin().await.unwrap();
    holder.lock(&target).await.unwrap();

    let err = service.decrement(decrement(target, 1)).await.unwrap_err();
    assert_matches!(err, ServiceError::LockTimeout { waited_ms: 100, .. });
    assert!(err.is_retryable());

    holder.rollback().await.unwrap();
    let record = service.decrement(decrement(target, 1)).await.unwrap();
    assert_eq!(record.quantity, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_a_transaction_releases_its_locks() {
    let service = in_memory_service_with_timeout(Duration::from_millis(100));
    let target = key(5, WarehouseType::Central, 1);
    service.increment(increment(target, 5)).await.unwrap();

    {
        let mut txn = service.store().begin().await.unwrap();
        service
            .decrement_in(&mut txn, &decrement(target, 5))
            .await
            .unwrap();
    }

    let record = service.decrement(decrement(target, 2)).await.unwrap();
    assert_eq!(record.quantity, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiting_writer_proceeds_once_the_holder_commits() {
    let service = in_memory_service_with_timeout(Duration::from_secs(2));
    let target = key(6, WarehouseType::Central, 1);
    service.increment(increment(target, 1)).await.unwrap();

    let mut holder = service.store().begin().await.unwrap();
    service
        .increment_in(&mut holder, &increment(target, 9))
        .await
        .unwrap();

    let waiter = {
        let service = service.clone();
        tokio::spawn(async move { service.decrement(decrement(target, 10)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    holder.commit().await.unwrap();

    let record = waiter.await.unwrap().unwrap();
    assert_eq!(record.quantity, 0);
}
