//! Process-local quantity store.
//!
//! Each key owns an async mutex acting as its row lock. Writes made through a
//! transaction are staged and only published to the committed maps on
//! `commit`, while every touched key is still locked. Readers outside a
//! transaction see committed state only; they wait for an in-flight commit to
//! finish publishing, so a transfer is never observed half applied.
//!
//! A key's lock entry lives only while some transaction holds or waits on it.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{QuantityStore, StockTransaction};
use crate::errors::ServiceError;
use crate::models::{PrincipalStock, PrincipalStockKey, QuantityRecord, StockKey};

/// Default bound on lock waits.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

struct LockTable<K> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> LockTable<K>
where
    K: Eq + Hash + Clone,
{
    fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn handle(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    /// Drops the entry once the table holds the only reference.
    fn release(&self, key: &K) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

struct Inner {
    records: DashMap<StockKey, QuantityRecord>,
    record_locks: LockTable<StockKey>,
    principal: DashMap<PrincipalStockKey, PrincipalStock>,
    principal_locks: LockTable<PrincipalStockKey>,
    // readers share, commit publishes exclusively
    publish: RwLock<()>,
    next_id: AtomicI64,
}

impl Inner {
    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct InMemoryQuantityStore {
    inner: Arc<Inner>,
    lock_timeout: Duration,
}

impl InMemoryQuantityStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                records: DashMap::new(),
                record_locks: LockTable::new(),
                principal: DashMap::new(),
                principal_locks: LockTable::new(),
                publish: RwLock::new(()),
                next_id: AtomicI64::new(1),
            }),
            lock_timeout,
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Number of committed quantity records.
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }
}

impl Default for InMemoryQuantityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuantityStore for InMemoryQuantityStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction, ServiceError> {
        let txn = InMemoryTransaction {
            id: Uuid::new_v4(),
            inner: self.inner.clone(),
            lock_timeout: self.lock_timeout,
            held: HashMap::new(),
            staged: BTreeMap::new(),
            held_principal: HashMap::new(),
            staged_principal: BTreeMap::new(),
        };
        trace!(transaction_id = %txn.id, "began in-memory transaction");
        Ok(txn)
    }

    async fn find(&self, key: &StockKey) -> Result<Option<QuantityRecord>, ServiceError> {
        let _published = self.inner.publish.read().await;
        Ok(self.inner.records.get(key).map(|r| r.value().clone()))
    }

    async fn list_lot(&self, lot_id: i64) -> Result<Vec<QuantityRecord>, ServiceError> {
        let _published = self.inner.publish.read().await;
        let mut records: Vec<QuantityRecord> = self
            .inner
            .records
            .iter()
            .filter(|entry| entry.key().lot_id == lot_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(QuantityRecord::key);
        Ok(records)
    }

    async fn find_principal(
        &self,
        key: &PrincipalStockKey,
    ) -> Result<Option<PrincipalStock>, ServiceError> {
        let _published = self.inner.publish.read().await;
        Ok(self.inner.principal.get(key).map(|r| r.value().clone()))
    }
}

pub struct InMemoryTransaction {
    id: Uuid,
    inner: Arc<Inner>,
    lock_timeout: Duration,
    held: HashMap<StockKey, OwnedMutexGuard<()>>,
    staged: BTreeMap<StockKey, QuantityRecord>,
    held_principal: HashMap<PrincipalStockKey, OwnedMutexGuard<()>>,
    staged_principal: BTreeMap<PrincipalStockKey, PrincipalStock>,
}

async fn acquire(
    lock: Arc<Mutex<()>>,
    timeout: Duration,
    resource: impl FnOnce() -> String,
) -> Result<OwnedMutexGuard<()>, ServiceError> {
    tokio::time::timeout(timeout, lock.lock_owned())
        .await
        .map_err(|_| ServiceError::LockTimeout {
            resource: resource(),
            waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })
}

impl InMemoryTransaction {
    fn current(&self, key: &StockKey) -> Option<QuantityRecord> {
        self.staged
            .get(key)
            .cloned()
            .or_else(|| self.inner.records.get(key).map(|r| r.value().clone()))
    }

    fn current_principal(&self, key: &PrincipalStockKey) -> Option<PrincipalStock> {
        self.staged_principal
            .get(key)
            .cloned()
            .or_else(|| self.inner.principal.get(key).map(|r| r.value().clone()))
    }
}

#[async_trait]
impl StockTransaction for InMemoryTransaction {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn lock(&mut self, key: &StockKey) -> Result<Option<QuantityRecord>, ServiceError> {
        if !self.held.contains_key(key) {
            let handle = self.inner.record_locks.handle(key);
            let guard = match acquire(handle, self.lock_timeout, || key.to_string()).await {
                Ok(guard) => guard,
                Err(err) => {
                    self.inner.record_locks.release(key);
                    return Err(err);
                }
            };
            trace!(transaction_id = %self.id, key = %key, "acquired record lock");
            self.held.insert(*key, guard);
        }
        Ok(self.current(key))
    }

    async fn lock_or_create(
        &mut self,
        key: &StockKey,
        hospital_id: i64,
    ) -> Result<QuantityRecord, ServiceError> {
        if let Some(existing) = self.lock(key).await? {
            return Ok(existing);
        }
        let record = QuantityRecord::empty(self.inner.allocate_id(), key, hospital_id, Utc::now());
        self.staged.insert(*key, record.clone());
        Ok(record)
    }

    async fn save(&mut self, record: &QuantityRecord) -> Result<(), ServiceError> {
        let key = record.key();
        if !self.held.contains_key(&key) {
            return Err(ServiceError::InternalError(format!(
                "attempted to save {} without holding its lock",
                key
            )));
        }
        self.staged.insert(key, record.clone());
        Ok(())
    }

    async fn lock_or_create_principal(
        &mut self,
        key: &PrincipalStockKey,
    ) -> Result<PrincipalStock, ServiceError> {
        if !self.held_principal.contains_key(key) {
            let handle = self.inner.principal_locks.handle(key);
            let guard = match acquire(handle, self.lock_timeout, || key.to_string()).await {
                Ok(guard) => guard,
                Err(err) => {
                    self.inner.principal_locks.release(key);
                    return Err(err);
                }
            };
            self.held_principal.insert(*key, guard);
        }
        if let Some(existing) = self.current_principal(key) {
            return Ok(existing);
        }
        let row = PrincipalStock::empty(self.inner.allocate_id(), key, Utc::now());
        self.staged_principal.insert(*key, row.clone());
        Ok(row)
    }

    async fn save_principal(&mut self, row: &PrincipalStock) -> Result<(), ServiceError> {
        let key = row.key();
        if !self.held_principal.contains_key(&key) {
            return Err(ServiceError::InternalError(format!(
                "attempted to save {} without holding its lock",
                key
            )));
        }
        self.staged_principal.insert(key, row.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<(), ServiceError> {
        let staged = std::mem::take(&mut self.staged);
        let staged_principal = std::mem::take(&mut self.staged_principal);
        debug!(
            transaction_id = %self.id,
            records = staged.len(),
            principal_rows = staged_principal.len(),
            "committing in-memory transaction"
        );
        let _publishing = self.inner.publish.write().await;
        for (key, record) in staged {
            self.inner.records.insert(key, record);
        }
        for (key, row) in staged_principal {
            self.inner.principal.insert(key, row);
        }
        // row locks are released when `self` drops
        Ok(())
    }

    async fn rollback(self) -> Result<(), ServiceError> {
        debug!(
            transaction_id = %self.id,
            discarded = self.staged.len() + self.staged_principal.len(),
            "rolling back in-memory transaction"
        );
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        for (key, guard) in self.held.drain() {
            drop(guard);
            self.inner.record_locks.release(&key);
        }
        for (key, guard) in self.held_principal.drain() {
            drop(guard);
            self.inner.principal_locks.release(&key);
        }
    }
}
