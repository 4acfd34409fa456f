//! Batch persistence layer
//!
//! A reconciliation run writes through a [`BatchUnit`]: everything it creates
//! or marks becomes visible to readers on `commit`, and disappears on
//! `rollback`. Reads through [`BatchStore`] only ever see committed batches.

use crate::audit::{AuditStore, InMemoryAuditStore};
use crate::config::AppConfig;
use crate::error::ReconciliationError;
use crate::models::{
    MatchPair, NewTransaction, ReconciliationBatch, Transaction, DEFAULT_BATCH_STATUS,
};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub mod postgres;
pub use postgres::PgBatchStore;

/// Trait for batch persistence
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Open the transactional scope for one run
    async fn begin(&self) -> Result<Box<dyn BatchUnit>>;
    async fn get_batch(&self, batch_id: i64) -> Result<Option<ReconciliationBatch>>;
    /// All transactions of a batch, in id order
    async fn get_transactions(&self, batch_id: i64) -> Result<Vec<Transaction>>;
}

/// Unit of work spanning one reconciliation run
#[async_trait]
pub trait BatchUnit: Send {
    async fn create_batch(&mut self) -> Result<ReconciliationBatch>;
    /// Bulk insert, assigning ids in input order
    async fn save_transactions(
        &mut self,
        batch_id: i64,
        records: Vec<NewTransaction>,
    ) -> Result<Vec<Transaction>>;
    async fn get_transaction(&mut self, id: i64) -> Result<Option<Transaction>>;
    /// Set both sides to matched with reciprocal match ids
    async fn mark_matched(&mut self, pair: MatchPair) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Batch and audit storage sharing one backend
#[derive(Clone)]
pub struct Persistence {
    pub batches: Arc<dyn BatchStore>,
    pub audit: Arc<dyn AuditStore>,
}

impl Persistence {
    pub fn in_memory() -> Self {
        Self {
            batches: Arc::new(InMemoryBatchStore::new()),
            audit: Arc::new(InMemoryAuditStore::new()),
        }
    }
}

/// Pick the configured backend. Postgres when a URL is set and the pool can
/// be created; memory otherwise.
pub fn build_store(config: &AppConfig) -> Persistence {
    if let Some(url) = config.database_url.as_deref() {
        match PgBatchStore::connect_lazy(url) {
            Ok(store) => {
                info!("Store backend: postgres");
                let store = Arc::new(store);
                return Persistence {
                    batches: store.clone(),
                    audit: store,
                };
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres batch store, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Store backend: in-memory");
    Persistence::in_memory()
}

//
// ================= In-memory backend =================
//

#[derive(Debug, Default, Clone)]
struct Tables {
    batches: BTreeMap<i64, ReconciliationBatch>,
    transactions: BTreeMap<i64, Transaction>,
}

#[derive(Debug)]
struct Sequences {
    batch: AtomicI64,
    transaction: AtomicI64,
}

impl Sequences {
    fn next_batch(&self) -> i64 {
        self.batch.fetch_add(1, Ordering::SeqCst)
    }

    fn next_transaction(&self) -> i64 {
        self.transaction.fetch_add(1, Ordering::SeqCst)
    }
}

/// In-memory batch store for development and tests.
/// Ids come from sequences, so ids burnt by a rolled-back run are not reused.
pub struct InMemoryBatchStore {
    tables: Arc<RwLock<Tables>>,
    sequences: Arc<Sequences>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            sequences: Arc::new(Sequences {
                batch: AtomicI64::new(1),
                transaction: AtomicI64::new(1),
            }),
        }
    }

    pub async fn batch_count(&self) -> usize {
        self.tables.read().await.batches.len()
    }

    pub async fn transaction_count(&self) -> usize {
        self.tables.read().await.transactions.len()
    }
}

impl Default for InMemoryBatchStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn begin(&self) -> Result<Box<dyn BatchUnit>> {
        Ok(Box::new(InMemoryUnit {
            tables: Arc::clone(&self.tables),
            sequences: Arc::clone(&self.sequences),
            staged: Tables::default(),
        }))
    }

    async fn get_batch(&self, batch_id: i64) -> Result<Option<ReconciliationBatch>> {
        let tables = self.tables.read().await;
        Ok(tables.batches.get(&batch_id).cloned())
    }

    async fn get_transactions(&self, batch_id: i64) -> Result<Vec<Transaction>> {
        let tables = self.tables.read().await;

        Ok(tables
            .transactions
            .values()
            .filter(|t| t.batch_id == batch_id)
            .cloned()
            .collect())
    }
}

/// Staged writes of one run, published on commit
struct InMemoryUnit {
    tables: Arc<RwLock<Tables>>,
    sequences: Arc<Sequences>,
    staged: Tables,
}

#[async_trait]
impl BatchUnit for InMemoryUnit {
    async fn create_batch(&mut self) -> Result<ReconciliationBatch> {
        let batch = ReconciliationBatch {
            id: self.sequences.next_batch(),
            created_at: Utc::now(),
            status: DEFAULT_BATCH_STATUS.to_string(),
        };

        self.staged.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn save_transactions(
        &mut self,
        batch_id: i64,
        records: Vec<NewTransaction>,
    ) -> Result<Vec<Transaction>> {
        if !self.staged.batches.contains_key(&batch_id) {
            return Err(ReconciliationError::Database(format!(
                "batch {} was not created in this unit",
                batch_id
            )));
        }

        let saved: Vec<Transaction> = records
            .into_iter()
            .map(|record| Transaction::from_new(self.sequences.next_transaction(), batch_id, record))
            .collect();

        for txn in &saved {
            self.staged.transactions.insert(txn.id, txn.clone());
        }

        Ok(saved)
    }

    async fn get_transaction(&mut self, id: i64) -> Result<Option<Transaction>> {
        if let Some(txn) = self.staged.transactions.get(&id) {
            return Ok(Some(txn.clone()));
        }

        let tables = self.tables.read().await;
        Ok(tables.transactions.get(&id).cloned())
    }

    async fn mark_matched(&mut self, pair: MatchPair) -> Result<()> {
        let staged = &mut self.staged.transactions;

        if !staged.contains_key(&pair.bank_id) || !staged.contains_key(&pair.policy_id) {
            return Err(ReconciliationError::Database(format!(
                "cannot mark {:?}: transactions are not part of this run",
                pair
            )));
        }

        if let Some(bank) = staged.get_mut(&pair.bank_id) {
            bank.pair_with(pair.policy_id);
        }
        if let Some(policy) = staged.get_mut(&pair.policy_id) {
            policy.pair_with(pair.bank_id);
        }

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryUnit { tables, staged, .. } = *self;
        let mut tables = tables.write().await;

        tables.batches.extend(staged.batches);
        tables.transactions.extend(staged.transactions);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TransactionSource, TransactionStatus};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn record(source: TransactionSource, amount: i64) -> NewTransaction {
        NewTransaction {
            source,
            transaction_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            amount: Decimal::new(amount, 0),
            reference_id: Some("A1".to_string()),
            description: None,
        }
    }

    #[tokio::test]
    async fn test_commit_publishes_batch() {
        let store = InMemoryBatchStore::new();
        let mut unit = store.begin().await.unwrap();

        let batch = unit.create_batch().await.unwrap();
        let saved = unit
            .save_transactions(
                batch.id,
                vec![
                    record(TransactionSource::BankStatement, 500),
                    record(TransactionSource::PolicyLog, 500),
                ],
            )
            .await
            .unwrap();
        assert!(saved[0].id < saved[1].id);

        // Not visible before commit
        assert!(store.get_batch(batch.id).await.unwrap().is_none());

        unit.mark_matched(MatchPair {
            bank_id: saved[0].id,
            policy_id: saved[1].id,
        })
        .await
        .unwrap();
        unit.commit().await.unwrap();

        let fetched = store.get_batch(batch.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, DEFAULT_BATCH_STATUS);

        let txns = store.get_transactions(batch.id).await.unwrap();
        assert_eq!(txns.len(), 2);
        assert!(txns.iter().all(|t| t.status == TransactionStatus::Matched));
        assert_eq!(txns[0].match_id, Some(txns[1].id));
        assert_eq!(txns[1].match_id, Some(txns[0].id));
    }

    #[tokio::test]
    async fn test_rollback_leaves_nothing() {
        let store = InMemoryBatchStore::new();
        let mut unit = store.begin().await.unwrap();

        let batch = unit.create_batch().await.unwrap();
        unit.save_transactions(batch.id, vec![record(TransactionSource::BankStatement, 1)])
            .await
            .unwrap();
        unit.rollback().await.unwrap();

        assert_eq!(store.batch_count().await, 0);
        assert_eq!(store.transaction_count().await, 0);
        assert!(store.get_transactions(batch.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unit_reads_its_own_writes() {
        let store = InMemoryBatchStore::new();
        let mut unit = store.begin().await.unwrap();
        let batch = unit.create_batch().await.unwrap();
        let saved = unit
            .save_transactions(batch.id, vec![record(TransactionSource::PolicyLog, 7)])
            .await
            .unwrap();

        let fetched = unit.get_transaction(saved[0].id).await.unwrap().unwrap();
        assert_eq!(fetched.batch_id, batch.id);
        assert!(unit.get_transaction(9_999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_outside_unit_rejected() {
        let store = InMemoryBatchStore::new();
        let mut unit = store.begin().await.unwrap();
        let result = unit
            .mark_matched(MatchPair {
                bank_id: 1,
                policy_id: 2,
            })
            .await;
        assert!(matches!(result, Err(ReconciliationError::Database(_))));
    }

    #[tokio::test]
    async fn test_save_requires_batch_from_unit() {
        let store = InMemoryBatchStore::new();
        let mut unit = store.begin().await.unwrap();
        let result = unit
            .save_transactions(42, vec![record(TransactionSource::PolicyLog, 1)])
            .await;
        tokio_test::assert_err!(result);
    }

    #[tokio::test]
    async fn test_build_store_without_url_serves_both_concerns() {
        use crate::audit::{AuditLog, RUN_COMPLETED, RUN_REJECTED};
        use serde_json::json;

        let config = AppConfig::from_lookup(|_| None).unwrap();
        let persistence = build_store(&config);

        let unit = persistence.batches.begin().await.unwrap();
        unit.rollback().await.unwrap();

        let log = AuditLog::with_store(persistence.audit.clone());
        log.record(RUN_REJECTED, json!({ "n": 1 })).await.unwrap();
        log.record(RUN_COMPLETED, json!({ "n": 2 })).await.unwrap();

        let listed = persistence.audit.recent(None, 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].event_type, RUN_COMPLETED);
        assert_eq!(listed[1].event_type, RUN_REJECTED);
    }
}
