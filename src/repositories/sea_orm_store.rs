//! Relational quantity store on SeaORM.
//!
//! Row locks are `SELECT ... FOR UPDATE` inside a database transaction. On
//! PostgreSQL the wait for a row lock is bounded with `SET LOCAL lock_timeout`;
//! SQLite ignores the row-lock clause; its pools hold a single connection
//! (see `db::DbConfig::pool_bounds`), so a transaction waits at acquire
//! until the previous one finishes.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ActiveValue::NotSet, ActiveValue::Unchanged, ColumnTrait,
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, DbErr, EntityTrait,
    QueryFilter, QuerySelect, Set, Statement, TransactionTrait,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{QuantityStore, StockTransaction};
use crate::entities::{principal_stock, stock_quantity};
use crate::errors::ServiceError;
use crate::models::{PrincipalStock, PrincipalStockKey, QuantityRecord, StockKey};

#[derive(Debug, Clone)]
pub struct SeaOrmQuantityStore {
    db: Arc<DatabaseConnection>,
    lock_timeout: Duration,
}

impl SeaOrmQuantityStore {
    pub fn new(db: Arc<DatabaseConnection>, lock_timeout: Duration) -> Self {
        Self { db, lock_timeout }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn by_key(key: &StockKey) -> sea_orm::Select<stock_quantity::Entity> {
    stock_quantity::Entity::find()
        .filter(stock_quantity::Column::LotId.eq(key.lot_id))
        .filter(stock_quantity::Column::WarehouseType.eq(key.warehouse_type.as_str()))
        .filter(stock_quantity::Column::WarehouseId.eq(key.warehouse_id))
}

fn by_principal_key(key: &PrincipalStockKey) -> sea_orm::Select<principal_stock::Entity> {
    principal_stock::Entity::find()
        .filter(principal_stock::Column::SiteId.eq(key.site_id))
        .filter(principal_stock::Column::LotId.eq(key.lot_id))
        .filter(principal_stock::Column::HospitalId.eq(key.hospital_id))
}

fn to_i32_id(id: i64) -> Result<i32, ServiceError> {
    i32::try_from(id).map_err(|_| ServiceError::InternalError(format!("row id {} out of range", id)))
}

#[async_trait]
impl QuantityStore for SeaOrmQuantityStore {
    type Transaction = SeaOrmTransaction;

    async fn begin(&self) -> Result<SeaOrmTransaction, ServiceError> {
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let backend = txn.get_database_backend();
        if backend == DbBackend::Postgres {
            let sql = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
            txn.execute(Statement::from_string(DbBackend::Postgres, sql))
                .await
                .map_err(ServiceError::db_error)?;
        }
        let id = Uuid::new_v4();
        debug!(transaction_id = %id, ?backend, "began database transaction");
        Ok(SeaOrmTransaction {
            id,
            txn,
            lock_timeout: self.lock_timeout,
        })
    }

    async fn find(&self, key: &StockKey) -> Result<Option<QuantityRecord>, ServiceError> {
        by_key(key)
            .one(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)?
            .map(QuantityRecord::try_from)
            .transpose()
    }

    async fn list_lot(&self, lot_id: i64) -> Result<Vec<QuantityRecord>, ServiceError> {
        let rows = stock_quantity::Entity::find()
            .filter(stock_quantity::Column::LotId.eq(lot_id))
            .all(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)?;
        let mut records = rows
            .into_iter()
            .map(QuantityRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(QuantityRecord::key);
        Ok(records)
    }

    async fn find_principal(
        &self,
        key: &PrincipalStockKey,
    ) -> Result<Option<PrincipalStock>, ServiceError> {
        Ok(by_principal_key(key)
            .one(self.db.as_ref())
            .await
            .map_err(ServiceError::db_error)?
            .map(PrincipalStock::from))
    }
}

pub struct SeaOrmTransaction {
    id: Uuid,
    txn: DatabaseTransaction,
    lock_timeout: Duration,
}

impl SeaOrmTransaction {
    /// Maps PostgreSQL's lock_not_available (55P03) to a lock timeout.
    fn classify(&self, err: DbErr, resource: impl FnOnce() -> String) -> ServiceError {
        let message = err.to_string();
        if message.contains("lock timeout") || message.contains("55P03") {
            warn!(transaction_id = %self.id, error = %message, "row lock wait exceeded");
            ServiceError::LockTimeout {
                resource: resource(),
                waited_ms: u64::try_from(self.lock_timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else {
            ServiceError::db_error(err)
        }
    }
}

#[async_trait]
impl StockTransaction for SeaOrmTransaction {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn lock(&mut self, key: &StockKey) -> Result<Option<QuantityRecord>, ServiceError> {
        let row = by_key(key)
            .lock_exclusive()
            .one(&self.txn)
            .await
            .map_err(|e| self.classify(e, || key.to_string()))?;
        row.map(QuantityRecord::try_from).transpose()
    }

    async fn lock_or_create(
        &mut self,
        key: &StockKey,
        hospital_id: i64,
    ) -> Result<QuantityRecord, ServiceError> {
        let now = Utc::now();
        let candidate = stock_quantity::ActiveModel {
            id: NotSet,
            lot_id: Set(key.lot_id),
            warehouse_type: Set(key.warehouse_type.as_str().to_string()),
            warehouse_id: Set(key.warehouse_id),
            hospital_id: Set(hospital_id),
            site_id: Set(None),
            quantity: Set(0),
            last_updated: Set(now),
            created_at: Set(now),
        };
        // a concurrent creator wins the race; we then wait on its row lock below
        stock_quantity::Entity::insert(candidate)
            .on_conflict(
                OnConflict::columns([
                    stock_quantity::Column::LotId,
                    stock_quantity::Column::WarehouseType,
                    stock_quantity::Column::WarehouseId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(&self.txn)
            .await
            .map_err(|e| self.classify(e, || key.to_string()))?;

        self.lock(key).await?.ok_or_else(|| {
            ServiceError::InternalError(format!("{} vanished after insert", key))
        })
    }

    async fn save(&mut self, record: &QuantityRecord) -> Result<(), ServiceError> {
        let model = stock_quantity::ActiveModel {
            id: Unchanged(to_i32_id(record.id)?),
            lot_id: NotSet,
            warehouse_type: NotSet,
            warehouse_id: NotSet,
            hospital_id: Set(record.hospital_id),
            site_id: Set(record.site_id),
            quantity: Set(record.quantity),
            last_updated: Set(record.last_updated),
            created_at: NotSet,
        };
        model
            .update(&self.txn)
            .await
            .map_err(|e| self.classify(e, || record.key().to_string()))?;
        Ok(())
    }

    async fn lock_or_create_principal(
        &mut self,
        key: &PrincipalStockKey,
    ) -> Result<PrincipalStock, ServiceError> {
        let candidate = principal_stock::ActiveModel {
            id: NotSet,
            site_id: Set(key.site_id),
            lot_id: Set(key.lot_id),
            hospital_id: Set(key.hospital_id),
            quantity: Set(0),
            status: Set(true),
            updated_at: Set(Utc::now()),
        };
        principal_stock::Entity::insert(candidate)
            .on_conflict(
                OnConflict::columns([
                    principal_stock::Column::SiteId,
                    principal_stock::Column::LotId,
                    principal_stock::Column::HospitalId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(&self.txn)
            .await
            .map_err(|e| self.classify(e, || key.to_string()))?;

        by_principal_key(key)
            .lock_exclusive()
            .one(&self.txn)
            .await
            .map_err(|e| self.classify(e, || key.to_string()))?
            .map(PrincipalStock::from)
            .ok_or_else(|| ServiceError::InternalError(format!("{} vanished after insert", key)))
    }

    async fn save_principal(&mut self, row: &PrincipalStock) -> Result<(), ServiceError> {
        let model = principal_stock::ActiveModel {
            id: Unchanged(to_i32_id(row.id)?),
            site_id: NotSet,
            lot_id: NotSet,
            hospital_id: NotSet,
            quantity: Set(row.quantity),
            status: Set(row.status),
            updated_at: Set(row.updated_at),
        };
        model
            .update(&self.txn)
            .await
            .map_err(|e| self.classify(e, || row.key().to_string()))?;
        Ok(())
    }

    async fn commit(self) -> Result<(), ServiceError> {
        debug!(transaction_id = %self.id, "committing database transaction");
        self.txn.commit().await.map_err(ServiceError::db_error)
    }

    async fn rollback(self) -> Result<(), ServiceError> {
        debug!(transaction_id = %self.id, "rolling back database transaction");
        self.txn.rollback().await.map_err(ServiceError::db_error)
    }
}
