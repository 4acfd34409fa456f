//! Postgres batch store
//!
//! One SQL transaction per reconciliation run. Schema is created on first use.
//! The same pool also backs the audit trail.

use super::{BatchStore, BatchUnit};
use crate::audit::{AuditEvent, AuditStore};
use crate::error::ReconciliationError;
use crate::models::{
    MatchPair, NewTransaction, ReconciliationBatch, Transaction, TransactionSource,
    TransactionStatus, DEFAULT_BATCH_STATUS,
};
use crate::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use uuid::Uuid;

const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS reconciliation_batches (
      id BIGSERIAL PRIMARY KEY,
      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
      status TEXT NOT NULL DEFAULT 'Completed'
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS reconciliation_transactions (
      id BIGSERIAL PRIMARY KEY,
      batch_id BIGINT NOT NULL REFERENCES reconciliation_batches (id) ON DELETE CASCADE,
      source TEXT NOT NULL,
      transaction_date DATE NOT NULL,
      amount NUMERIC NOT NULL,
      reference_id TEXT,
      description TEXT,
      status TEXT NOT NULL DEFAULT 'unmatched',
      match_id BIGINT
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_reconciliation_transactions_batch
    ON reconciliation_transactions (batch_id, id);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_events (
      seq BIGSERIAL PRIMARY KEY,
      id UUID NOT NULL UNIQUE,
      event_type TEXT NOT NULL,
      details JSONB NOT NULL,
      details_hash TEXT NOT NULL,
      created_at TIMESTAMPTZ NOT NULL
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_audit_events_type
    ON audit_events (event_type, seq);
    "#,
];

const AUDIT_COLUMNS: &str = "id, event_type, details, details_hash, created_at";

const TRANSACTION_COLUMNS: &str =
    "id, batch_id, source, transaction_date, amount, reference_id, description, status, match_id";

pub struct PgBatchStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgBatchStore {
    /// Build a lazily-connecting pool; no I/O happens until first use
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
            .map_err(|e| ReconciliationError::database("Invalid postgres URL", e))?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&self.pool).await?;
                }
                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                ReconciliationError::database("Failed to initialize reconciliation schema", e)
            })?;

        Ok(())
    }
}

#[async_trait]
impl BatchStore for PgBatchStore {
    async fn begin(&self) -> Result<Box<dyn BatchUnit>> {
        self.ensure_schema().await?;

        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ReconciliationError::database("Failed to begin run transaction", e))?;

        Ok(Box::new(PgBatchUnit { tx }))
    }

    async fn get_batch(&self, batch_id: i64) -> Result<Option<ReconciliationBatch>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            "SELECT id, created_at, status FROM reconciliation_batches WHERE id = $1",
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReconciliationError::database("Failed to load batch", e))?;

        row.as_ref().map(batch_from_row).transpose()
    }

    async fn get_transactions(&self, batch_id: i64) -> Result<Vec<Transaction>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM reconciliation_transactions WHERE batch_id = $1 ORDER BY id ASC",
            TRANSACTION_COLUMNS
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconciliationError::database("Failed to load transactions", e))?;

        rows.iter().map(transaction_from_row).collect()
    }
}

#[async_trait]
impl AuditStore for PgBatchStore {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO audit_events (id, event_type, details, details_hash, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.id)
        .bind(&event.event_type)
        .bind(&event.details)
        .bind(&event.details_hash)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| ReconciliationError::database("Failed to record audit event", e))?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditEvent>> {
        self.ensure_schema().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM audit_events WHERE id = $1",
            AUDIT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReconciliationError::database("Failed to load audit event", e))?;

        row.as_ref().map(audit_from_row).transpose()
    }

    async fn recent(&self, event_type: Option<&str>, limit: usize) -> Result<Vec<AuditEvent>> {
        self.ensure_schema().await?;

        // NULL type matches every event
        let rows = sqlx::query(&format!(
            "SELECT {} FROM audit_events \
             WHERE ($1::TEXT IS NULL OR event_type = $1) \
             ORDER BY seq DESC LIMIT $2",
            AUDIT_COLUMNS
        ))
        .bind(event_type)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconciliationError::database("Failed to list audit events", e))?;

        rows.iter().map(audit_from_row).collect()
    }
}

pub struct PgBatchUnit {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl BatchUnit for PgBatchUnit {
    async fn create_batch(&mut self) -> Result<ReconciliationBatch> {
        let row = sqlx::query(
            "INSERT INTO reconciliation_batches (status) VALUES ($1) RETURNING id, created_at, status",
        )
        .bind(DEFAULT_BATCH_STATUS)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| ReconciliationError::database("Failed to create batch", e))?;

        batch_from_row(&row)
    }

    async fn save_transactions(
        &mut self,
        batch_id: i64,
        records: Vec<NewTransaction>,
    ) -> Result<Vec<Transaction>> {
        let mut saved = Vec::with_capacity(records.len());

        for record in records {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO reconciliation_transactions
                  (batch_id, source, transaction_date, amount, reference_id, description, status)
                VALUES
                  ($1, $2, $3, $4, $5, $6, $7)
                RETURNING id
                "#,
            )
            .bind(batch_id)
            .bind(record.source.as_str())
            .bind(record.transaction_date)
            .bind(record.amount)
            .bind(&record.reference_id)
            .bind(&record.description)
            .bind(TransactionStatus::Unmatched.as_str())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| ReconciliationError::database("Failed to insert transaction", e))?;

            saved.push(Transaction::from_new(id, batch_id, record));
        }

        Ok(saved)
    }

    async fn get_transaction(&mut self, id: i64) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM reconciliation_transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| ReconciliationError::database("Failed to load transaction", e))?;

        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn mark_matched(&mut self, pair: MatchPair) -> Result<()> {
        for (id, other) in [
            (pair.bank_id, pair.policy_id),
            (pair.policy_id, pair.bank_id),
        ] {
            let result = sqlx::query(
                "UPDATE reconciliation_transactions SET status = $1, match_id = $2 WHERE id = $3",
            )
            .bind(TransactionStatus::Matched.as_str())
            .bind(other)
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| ReconciliationError::database("Failed to mark match", e))?;

            if result.rows_affected() != 1 {
                return Err(ReconciliationError::Database(format!(
                    "transaction {} vanished while marking {:?}",
                    id, pair
                )));
            }
        }

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let PgBatchUnit { tx } = *self;
        tx.commit()
            .await
            .map_err(|e| ReconciliationError::database("Failed to commit run transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let PgBatchUnit { tx } = *self;
        tx.rollback()
            .await
            .map_err(|e| ReconciliationError::database("Failed to roll back run transaction", e))
    }
}

fn batch_from_row(row: &PgRow) -> Result<ReconciliationBatch> {
    let read = |e: sqlx::Error| ReconciliationError::database("Malformed batch row", e);

    Ok(ReconciliationBatch {
        id: row.try_get("id").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        status: row.try_get("status").map_err(read)?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let read = |e: sqlx::Error| ReconciliationError::database("Malformed transaction row", e);

    let source: String = row.try_get("source").map_err(read)?;
    let status: String = row.try_get("status").map_err(read)?;

    Ok(Transaction {
        id: row.try_get("id").map_err(read)?,
        batch_id: row.try_get("batch_id").map_err(read)?,
        source: source
            .parse::<TransactionSource>()
            .map_err(ReconciliationError::Database)?,
        transaction_date: row.try_get("transaction_date").map_err(read)?,
        amount: row.try_get("amount").map_err(read)?,
        reference_id: row.try_get("reference_id").map_err(read)?,
        description: row.try_get("description").map_err(read)?,
        status: status
            .parse::<TransactionStatus>()
            .map_err(ReconciliationError::Database)?,
        match_id: row.try_get("match_id").map_err(read)?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditEvent> {
    let read = |e: sqlx::Error| ReconciliationError::database("Malformed audit row", e);

    Ok(AuditEvent {
        id: row.try_get("id").map_err(read)?,
        event_type: row.try_get("event_type").map_err(read)?,
        details: row.try_get("details").map_err(read)?,
        details_hash: row.try_get("details_hash").map_err(read)?,
        timestamp: row.try_get("created_at").map_err(read)?,
    })
}
