//! End-to-end reconciliation run and the batch-details read path
//!
//! A run either leaves a fully-formed batch (with whatever matches were found)
//! or nothing at all: every write goes through one store unit of work.

use crate::audit::{self, AuditLog};
use crate::error::ReconciliationError;
use crate::matching::{ExactMatcher, FuzzyMatcher, MatchPools};
use crate::models::{
    BatchDetails, NewTransaction, RunSummary, TransactionSource, UploadedDocument,
};
use crate::parser::StatementParser;
use crate::store::{BatchStore, BatchUnit};
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const MISSING_FILES_MESSAGE: &str = "Both bank_statement and policy_log files are required.";
pub const NO_TRANSACTIONS_MESSAGE: &str =
    "Could not extract any valid transaction data from one or both PDFs.";

pub struct Orchestrator {
    parser: Arc<StatementParser>,
    exact: ExactMatcher,
    fuzzy: Arc<FuzzyMatcher>,
    store: Arc<dyn BatchStore>,
    audit_log: Arc<AuditLog>,
}

impl Orchestrator {
    pub fn new(
        parser: Arc<StatementParser>,
        fuzzy: Arc<FuzzyMatcher>,
        store: Arc<dyn BatchStore>,
        audit_log: Arc<AuditLog>,
    ) -> Self {
        Self {
            parser,
            exact: ExactMatcher::new(),
            fuzzy,
            store,
            audit_log,
        }
    }

    /// Run one reconciliation: parse both sources, persist, match, commit.
    pub async fn run(
        &self,
        bank_statement: Option<UploadedDocument>,
        policy_log: Option<UploadedDocument>,
    ) -> Result<RunSummary> {
        let (Some(bank_doc), Some(policy_doc)) = (
            bank_statement.filter(|d| !d.bytes.is_empty()),
            policy_log.filter(|d| !d.bytes.is_empty()),
        ) else {
            warn!("Reconciliation run rejected: missing source file");
            return Err(ReconciliationError::InvalidInput(
                MISSING_FILES_MESSAGE.to_string(),
            ));
        };

        info!(
            bank_bytes = bank_doc.bytes.len(),
            policy_bytes = policy_doc.bytes.len(),
            "Starting reconciliation run"
        );

        let (bank_records, policy_records) = tokio::join!(
            self.parser.parse(&bank_doc, TransactionSource::BankStatement),
            self.parser.parse(&policy_doc, TransactionSource::PolicyLog),
        );

        let fingerprints = json!({
            "bankStatement": audit::fingerprint(&bank_doc.bytes),
            "policyLog": audit::fingerprint(&policy_doc.bytes),
        });

        if bank_records.is_empty() || policy_records.is_empty() {
            warn!(
                bank = bank_records.len(),
                policy = policy_records.len(),
                "Reconciliation run rejected: no transactions extracted"
            );
            self.record_audit(
                audit::RUN_REJECTED,
                json!({
                    "reason": NO_TRANSACTIONS_MESSAGE,
                    "bankTransactions": bank_records.len(),
                    "policyTransactions": policy_records.len(),
                    "fingerprints": fingerprints,
                }),
            )
            .await;
            return Err(ReconciliationError::InvalidInput(
                NO_TRANSACTIONS_MESSAGE.to_string(),
            ));
        }

        let bank_count = bank_records.len();
        let policy_count = policy_records.len();
        let mut records = bank_records;
        records.extend(policy_records);

        let summary = match self.persist_and_match(records).await {
            Ok((batch_id, exact_pairs, fuzzy_pairs)) => RunSummary {
                batch_id,
                bank_transactions: bank_count,
                policy_transactions: policy_count,
                exact_pairs,
                fuzzy_pairs,
            },
            Err(e) => {
                error!("Reconciliation run failed: {}", e);
                self.record_audit(
                    audit::RUN_FAILED,
                    json!({ "error": e.to_string(), "fingerprints": fingerprints }),
                )
                .await;
                return Err(e);
            }
        };

        info!(
            batch_id = summary.batch_id,
            exact = summary.exact_pairs,
            fuzzy = summary.fuzzy_pairs,
            "Reconciliation run complete"
        );

        let mut details = serde_json::to_value(&summary).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut details {
            map.insert("fingerprints".to_string(), fingerprints);
        }
        self.record_audit(audit::RUN_COMPLETED, details).await;

        Ok(summary)
    }

    /// Steps inside the unit of work. Any error rolls the whole run back.
    async fn persist_and_match(&self, records: Vec<NewTransaction>) -> Result<(i64, usize, usize)> {
        let mut unit = self.store.begin().await?;

        match self.match_within(unit.as_mut(), records).await {
            Ok(outcome) => {
                unit.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                warn!("Rolling back reconciliation run: {}", e);
                if let Err(rollback_err) = unit.rollback().await {
                    error!("Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    async fn match_within(
        &self,
        unit: &mut dyn BatchUnit,
        records: Vec<NewTransaction>,
    ) -> Result<(i64, usize, usize)> {
        let batch = unit.create_batch().await?;
        let saved = unit.save_transactions(batch.id, records).await?;
        info!(batch_id = batch.id, transactions = saved.len(), "Batch persisted");

        let mut pools = MatchPools::from_transactions(saved);

        let exact_pairs = self.exact.run(&mut pools);
        for pair in &exact_pairs {
            unit.mark_matched(*pair).await?;
        }
        info!(batch_id = batch.id, pairs = exact_pairs.len(), "Exact matching complete");

        let fuzzy_pairs = if pools.both_sides_pending() {
            self.fuzzy.run(batch.id, &mut pools, unit).await?.len()
        } else {
            0
        };

        Ok((batch.id, exact_pairs.len(), fuzzy_pairs))
    }

    pub async fn get_batch_details(&self, batch_id: i64) -> Result<BatchDetails> {
        let batch = self
            .store
            .get_batch(batch_id)
            .await?
            .ok_or(ReconciliationError::BatchNotFound(batch_id))?;
        let transactions = self.store.get_transactions(batch_id).await?;

        Ok(BatchDetails::from_parts(batch, transactions))
    }

    async fn record_audit(&self, event_type: &str, details: Value) {
        match self.audit_log.record(event_type, details).await {
            Ok(id) => info!(audit_id = %id, event_type, "Audit event recorded"),
            Err(e) => warn!(event_type, "Failed to record audit event: {}", e),
        }
    }
}
