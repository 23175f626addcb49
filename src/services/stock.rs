use chrono::Utc;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use validator::{Validate, ValidationError};

use crate::errors::ServiceError;
use crate::events::{EventSender, StockEvent};
use crate::models::{PrincipalStock, PrincipalStockKey, QuantityRecord, StockKey, WarehouseType};
use crate::repositories::{QuantityStore, StockTransaction};

/// Adds units of a lot to a warehouse, creating the record when absent.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IncrementStock {
    #[validate(custom = "validate_identifier")]
    pub lot_id: i64,
    pub warehouse_type: WarehouseType,
    #[validate(custom = "validate_identifier")]
    pub warehouse_id: i64,
    /// Negative amounts are accepted; the result is floored at zero.
    pub amount: i64,
    #[validate(custom = "validate_identifier")]
    pub hospital_id: i64,
    #[serde(default)]
    pub site_id: Option<i64>,
}

impl IncrementStock {
    pub fn key(&self) -> StockKey {
        StockKey::new(self.lot_id, self.warehouse_type, self.warehouse_id)
    }
}

/// Removes units of a lot from an existing record.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DecrementStock {
    #[validate(custom = "validate_identifier")]
    pub lot_id: i64,
    pub warehouse_type: WarehouseType,
    #[validate(custom = "validate_identifier")]
    pub warehouse_id: i64,
    #[validate(custom = "validate_non_negative")]
    pub amount: i64,
}

impl DecrementStock {
    pub fn key(&self) -> StockKey {
        StockKey::new(self.lot_id, self.warehouse_type, self.warehouse_id)
    }
}

/// Moves units of a lot between two warehouses in one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TransferStock {
    #[validate(custom = "validate_identifier")]
    pub lot_id: i64,
    pub source_type: WarehouseType,
    #[validate(custom = "validate_identifier")]
    pub source_id: i64,
    pub destination_type: WarehouseType,
    #[validate(custom = "validate_identifier")]
    pub destination_id: i64,
    #[validate(custom = "validate_non_negative")]
    pub amount: i64,
    #[validate(custom = "validate_identifier")]
    pub destination_hospital_id: i64,
    #[serde(default)]
    pub destination_site_id: Option<i64>,
}

impl TransferStock {
    pub fn source_key(&self) -> StockKey {
        StockKey::new(self.lot_id, self.source_type, self.source_id)
    }

    pub fn destination_key(&self) -> StockKey {
        StockKey::new(self.lot_id, self.destination_type, self.destination_id)
    }

    /// Principal aggregate touched by this transfer, if any.
    pub fn principal_key(&self) -> Option<PrincipalStockKey> {
        if self.destination_type != WarehouseType::Principal {
            return None;
        }
        self.destination_site_id.map(|site_id| PrincipalStockKey {
            site_id,
            lot_id: self.lot_id,
            hospital_id: self.destination_hospital_id,
        })
    }
}

fn validate_identifier(id: i64) -> Result<(), ValidationError> {
    if id < 1 {
        let mut err = ValidationError::new("identifier");
        err.message = Some("identifiers must be positive".into());
        return Err(err);
    }
    Ok(())
}

fn validate_non_negative(amount: i64) -> Result<(), ValidationError> {
    if amount < 0 {
        let mut err = ValidationError::new("amount");
        err.message = Some("amount must not be negative".into());
        return Err(err);
    }
    Ok(())
}

/// Committed state after a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub source: QuantityRecord,
    pub destination: QuantityRecord,
    pub principal: Option<PrincipalStock>,
}

/// Stock ledger: the only writer of quantity records.
pub struct StockService<S: QuantityStore> {
    store: Arc<S>,
    event_sender: Option<EventSender>,
}

impl<S: QuantityStore> Clone for StockService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            event_sender: self.event_sender.clone(),
        }
    }
}

impl<S: QuantityStore> StockService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            event_sender: None,
        }
    }

    /// Publishes a [`StockEvent`] after every committed mutation.
    pub fn with_events(mut self, event_sender: EventSender) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    #[instrument(skip(self), fields(lot_id = command.lot_id, warehouse = %command.warehouse_type))]
    pub async fn increment(&self, command: IncrementStock) -> Result<QuantityRecord, ServiceError> {
        let started = Instant::now();
        let mut txn = self.store.begin().await?;
        let result = self.increment_in(&mut txn, &command).await;
        let record = finish(txn, "increment", result).await?;

        histogram!(
            "stock_ledger.operation.duration",
            started.elapsed().as_secs_f64(),
            "operation" => "increment"
        );
        info!(quantity = record.quantity, "stock incremented");
        self.publish(StockEvent::Incremented {
            key: record.key(),
            amount: command.amount,
            quantity: record.quantity,
            at: record.last_updated,
        })
        .await;
        Ok(record)
    }

    #[instrument(skip(self), fields(lot_id = command.lot_id, warehouse = %command.warehouse_type))]
    pub async fn decrement(&self, command: DecrementStock) -> Result<QuantityRecord, ServiceError> {
        let started = Instant::now();
        let mut txn = self.store.begin().await?;
        let result = self.decrement_in(&mut txn, &command).await;
        let record = finish(txn, "decrement", result).await?;

        histogram!(
            "stock_ledger.operation.duration",
            started.elapsed().as_secs_f64(),
            "operation" => "decrement"
        );
        info!(quantity = record.quantity, "stock decremented");
        self.publish(StockEvent::Decremented {
            key: record.key(),
            amount: command.amount,
            quantity: record.quantity,
            at: record.last_updated,
        })
        .await;
        Ok(record)
    }

    #[instrument(skip(self), fields(lot_id = command.lot_id, source = %command.source_type, destination = %command.destination_type))]
    pub async fn transfer(&self, command: TransferStock) -> Result<TransferOutcome, ServiceError> {
        let started = Instant::now();
        let mut txn = self.store.begin().await?;
        let result = self.transfer_in(&mut txn, &command).await;
        let outcome = finish(txn, "transfer", result).await?;

        histogram!(
            "stock_ledger.operation.duration",
            started.elapsed().as_secs_f64(),
            "operation" => "transfer"
        );
        info!(
            source_quantity = outcome.source.quantity,
            destination_quantity = outcome.destination.quantity,
            "stock transferred"
        );
        self.publish(StockEvent::Transferred {
            source: outcome.source.key(),
            destination: outcome.destination.key(),
            amount: command.amount,
            at: outcome.destination.last_updated,
        })
        .await;
        Ok(outcome)
    }

    /// Increment inside a caller-owned transaction.
    pub async fn increment_in(
        &self,
        txn: &mut S::Transaction,
        command: &IncrementStock,
    ) -> Result<QuantityRecord, ServiceError> {
        command.validate()?;
        if command.amount < 0 {
            warn!(
                lot_id = command.lot_id,
                amount = command.amount,
                "negative increment, quantity will be floored at zero"
            );
        }

        let key = command.key();
        let mut record = txn.lock_or_create(&key, command.hospital_id).await?;
        record.hospital_id = command.hospital_id;
        if command.site_id.is_some() {
            record.site_id = command.site_id;
        }
        record.apply_increment(command.amount, Utc::now());
        txn.save(&record).await?;

        debug!(transaction_id = %txn.id(), key = %key, quantity = record.quantity, "incremented");
        Ok(record)
    }

    /// Decrement inside a caller-owned transaction.
    ///
    /// Fails with [`ServiceError::NotFound`] when the key has no record and with
    /// [`ServiceError::InsufficientStock`] when it holds less than `amount`.
    /// Neither failure writes anything.
    pub async fn decrement_in(
        &self,
        txn: &mut S::Transaction,
        command: &DecrementStock,
    ) -> Result<QuantityRecord, ServiceError> {
        command.validate()?;

        let key = command.key();
        let mut record = txn.lock(&key).await?.ok_or(ServiceError::NotFound(key))?;
        record.apply_decrement(command.amount, Utc::now())?;
        txn.save(&record).await?;

        debug!(transaction_id = %txn.id(), key = %key, quantity = record.quantity, "decremented");
        Ok(record)
    }

    /// Transfer inside a caller-owned transaction.
    ///
    /// Both records are locked in canonical key order before either is written.
    pub async fn transfer_in(
        &self,
        txn: &mut S::Transaction,
        command: &TransferStock,
    ) -> Result<TransferOutcome, ServiceError> {
        command.validate()?;

        let source = command.source_key();
        let destination = command.destination_key();
        let mut order = vec![source, destination];
        order.sort();
        order.dedup();

        for key in &order {
            if *key == source {
                if txn.lock(key).await?.is_none() {
                    return Err(ServiceError::NotFound(source));
                }
            } else {
                txn.lock_or_create(key, command.destination_hospital_id)
                    .await?;
            }
        }

        let decremented = self
            .decrement_in(
                txn,
                &DecrementStock {
                    lot_id: command.lot_id,
                    warehouse_type: command.source_type,
                    warehouse_id: command.source_id,
                    amount: command.amount,
                },
            )
            .await?;
        let destination_record = self
            .increment_in(
                txn,
                &IncrementStock {
                    lot_id: command.lot_id,
                    warehouse_type: command.destination_type,
                    warehouse_id: command.destination_id,
                    amount: command.amount,
                    hospital_id: command.destination_hospital_id,
                    site_id: command.destination_site_id,
                },
            )
            .await?;

        let principal = match command.principal_key() {
            Some(principal_key) => {
                let mut row = txn.lock_or_create_principal(&principal_key).await?;
                row.apply_increment(command.amount, Utc::now());
                txn.save_principal(&row).await?;
                Some(row)
            }
            None => None,
        };

        let source_record = if source == destination {
            destination_record.clone()
        } else {
            decremented
        };

        Ok(TransferOutcome {
            source: source_record,
            destination: destination_record,
            principal,
        })
    }

    /// Committed record for `key`, read without locking.
    pub async fn get_stock(&self, key: &StockKey) -> Result<Option<QuantityRecord>, ServiceError> {
        self.store.find(key).await
    }

    /// Every committed record of a lot, in canonical key order.
    pub async fn list_lot(&self, lot_id: i64) -> Result<Vec<QuantityRecord>, ServiceError> {
        self.store.list_lot(lot_id).await
    }

    pub async fn principal_stock(
        &self,
        site_id: i64,
        lot_id: i64,
        hospital_id: i64,
    ) -> Result<Option<PrincipalStock>, ServiceError> {
        self.store
            .find_principal(&PrincipalStockKey {
                site_id,
                lot_id,
                hospital_id,
            })
            .await
    }

    async fn publish(&self, event: StockEvent) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }
}

/// Commits on success, rolls back on error.
async fn finish<T, X>(
    txn: X,
    operation: &'static str,
    result: Result<T, ServiceError>,
) -> Result<T, ServiceError>
where
    X: StockTransaction,
{
    let transaction_id = txn.id();
    match result {
        Ok(value) => {
            txn.commit().await?;
            counter!("stock_ledger.transaction.committed", 1, "operation" => operation);
            Ok(value)
        }
        Err(err) => {
            if matches!(err, ServiceError::LockTimeout { .. }) {
                counter!("stock_ledger.lock_timeouts", 1, "operation" => operation);
            }
            if let Err(rollback_err) = txn.rollback().await {
                error!(%transaction_id, error = %rollback_err, "rollback failed");
            }
            counter!("stock_ledger.transaction.rolled_back", 1, "operation" => operation);
            warn!(%transaction_id, operation, error = %err, "stock operation rolled back");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::InMemoryQuantityStore;
    use assert_matches::assert_matches;

    fn service() -> StockService<InMemoryQuantityStore> {
        StockService::new(Arc::new(InMemoryQuantityStore::new()))
    }

    fn increment(lot_id: i64, kind: WarehouseType, id: i64, amount: i64) -> IncrementStock {
        IncrementStock {
            lot_id,
            warehouse_type: kind,
            warehouse_id: id,
            amount,
            hospital_id: 1,
            site_id: None,
        }
    }

    fn decrement(lot_id: i64, kind: WarehouseType, id: i64, amount: i64) -> DecrementStock {
        DecrementStock {
            lot_id,
            warehouse_type: kind,
            warehouse_id: id,
            amount,
        }
    }

    #[tokio::test]
    async fn increment_creates_then_accumulates() {
        let service = service();
        let first = service
            .increment(increment(1, WarehouseType::Central, 1, 25))
            .await
            .unwrap();
        assert_eq!(first.quantity, 25);

        let second = service
            .increment(increment(1, WarehouseType::Central, 1, 5))
            .await
            .unwrap();
        assert_eq!(second.quantity, 30);
        assert_eq!(second.id, first.id);
    }

    #[tokio::test]
    async fn negative_increment_on_empty_key_floors_at_zero() {
        let service = service();
        let record = service
            .increment(increment(1, WarehouseType::Central, 1, -4))
            .await
            .unwrap();
        assert_eq!(record.quantity, 0);
    }

    #[tokio::test]
    async fn increment_records_site_when_supplied() {
        let service = service();
        let mut command = increment(1, WarehouseType::Pharmacy, 3, 2);
        command.site_id = Some(9);
        service.increment(command).await.unwrap();

        let mut without_site = increment(1, WarehouseType::Pharmacy, 3, 1);
        without_site.hospital_id = 4;
        let record = service.increment(without_site).await.unwrap();
        assert_eq!(record.site_id, Some(9));
        assert_eq!(record.hospital_id, 4);
    }

    #[tokio::test]
    async fn decrement_missing_key_is_not_found_and_creates_nothing() {
        let service = service();
        let err = service
            .decrement(decrement(1, WarehouseType::Central, 1, 1))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::NotFound(_));
        assert!(service.store().is_empty());
    }

    #[tokio::test]
    async fn negative_decrement_is_rejected() {
        let service = service();
        service
            .increment(increment(1, WarehouseType::Central, 1, 5))
            .await
            .unwrap();
        let err = service
            .decrement(decrement(1, WarehouseType::Central, 1, -1))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }

    #[tokio::test]
    async fn zero_identifiers_are_rejected() {
        let service = service();
        let err = service
            .increment(increment(0, WarehouseType::Central, 1, 5))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
        assert!(service.store().is_empty());
    }

    #[tokio::test]
    async fn transfer_into_principal_updates_the_site_aggregate() {
        let service = service();
        service
            .increment(increment(2, WarehouseType::Central, 1, 10))
            .await
            .unwrap();

        let outcome = service
            .transfer(TransferStock {
                lot_id: 2,
                source_type: WarehouseType::Central,
                source_id: 1,
                destination_type: WarehouseType::Principal,
                destination_id: 5,
                amount: 4,
                destination_hospital_id: 3,
                destination_site_id: Some(8),
            })
            .await
            .unwrap();

        assert_eq!(outcome.source.quantity, 6);
        assert_eq!(outcome.destination.quantity, 4);
        assert_eq!(outcome.principal.as_ref().map(|p| p.quantity), Some(4));

        let stored = service.principal_stock(8, 2, 3).await.unwrap().unwrap();
        assert_eq!(stored.quantity, 4);
        assert!(stored.status);
    }

    #[tokio::test]
    async fn events_are_published_only_for_committed_operations() {
        let (sender, mut rx) = crate::events::channel(8);
        let service = service().with_events(sender);

        service
            .increment(increment(1, WarehouseType::Central, 1, 3))
            .await
            .unwrap();
        service
            .decrement(decrement(1, WarehouseType::Central, 1, 9))
            .await
            .unwrap_err();
        service
            .decrement(decrement(1, WarehouseType::Central, 1, 2))
            .await
            .unwrap();

        assert_matches!(rx.recv().await, Some(StockEvent::Incremented { quantity: 3, .. }));
        assert_matches!(rx.recv().await, Some(StockEvent::Decremented { quantity: 1, .. }));
        assert!(rx.try_recv().is_err());
    }
}
