//! Quantity record stores.
//!
//! The ledger never touches persistence directly; it drives a [`QuantityStore`]
//! through a [`StockTransaction`]. Every lock taken through a transaction is held
//! until `commit`, `rollback` or drop, and dropping an uncommitted transaction
//! discards its writes.

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::{PrincipalStock, PrincipalStockKey, QuantityRecord, StockKey};

pub mod in_memory_store;
pub mod sea_orm_store;

pub use in_memory_store::{InMemoryQuantityStore, InMemoryTransaction};
pub use sea_orm_store::{SeaOrmQuantityStore, SeaOrmTransaction};

/// Shared, durable home of quantity records.
#[async_trait]
pub trait QuantityStore: Send + Sync + 'static {
    type Transaction: StockTransaction;

    /// Opens a unit of work.
    async fn begin(&self) -> Result<Self::Transaction, ServiceError>;

    /// Last committed state of `key`, without locking.
    async fn find(&self, key: &StockKey) -> Result<Option<QuantityRecord>, ServiceError>;

    /// Every committed record of a lot, in canonical key order.
    async fn list_lot(&self, lot_id: i64) -> Result<Vec<QuantityRecord>, ServiceError>;

    async fn find_principal(
        &self,
        key: &PrincipalStockKey,
    ) -> Result<Option<PrincipalStock>, ServiceError>;
}

/// One all-or-nothing unit of work against a [`QuantityStore`].
#[async_trait]
pub trait StockTransaction: Send {
    fn id(&self) -> Uuid;

    /// Takes the exclusive lock on `key` and returns the record, if any.
    ///
    /// Blocks until the lock is free or the store's lock timeout elapses, in
    /// which case [`ServiceError::LockTimeout`] is returned. Locking a key the
    /// transaction already holds returns immediately.
    async fn lock(&mut self, key: &StockKey) -> Result<Option<QuantityRecord>, ServiceError>;

    /// Like [`StockTransaction::lock`], creating an empty record first when
    /// none exists.
    async fn lock_or_create(
        &mut self,
        key: &StockKey,
        hospital_id: i64,
    ) -> Result<QuantityRecord, ServiceError>;

    /// Writes a record previously returned by `lock`/`lock_or_create`.
    async fn save(&mut self, record: &QuantityRecord) -> Result<(), ServiceError>;

    async fn lock_or_create_principal(
        &mut self,
        key: &PrincipalStockKey,
    ) -> Result<PrincipalStock, ServiceError>;

    async fn save_principal(&mut self, row: &PrincipalStock) -> Result<(), ServiceError>;

    async fn commit(self) -> Result<(), ServiceError>;

    async fn rollback(self) -> Result<(), ServiceError>;
}
