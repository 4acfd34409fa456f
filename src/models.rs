//! Core data models for reconciliation batches and their transactions

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_BATCH_STATUS: &str = "Completed";

//
// ================= Enums =================
//

/// Which document a transaction was extracted from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    BankStatement,
    PolicyLog,
}

impl TransactionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionSource::BankStatement => "bank_statement",
            TransactionSource::PolicyLog => "policy_log",
        }
    }

    /// The source a transaction of this source may be paired with
    pub fn counterpart(&self) -> Self {
        match self {
            TransactionSource::BankStatement => TransactionSource::PolicyLog,
            TransactionSource::PolicyLog => TransactionSource::BankStatement,
        }
    }
}

impl FromStr for TransactionSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bank_statement" => Ok(TransactionSource::BankStatement),
            "policy_log" => Ok(TransactionSource::PolicyLog),
            other => Err(format!("unknown transaction source '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Unmatched,
    Matched,
    /// Reserved for manual confirmation after review
    Reconciled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Unmatched => "unmatched",
            TransactionStatus::Matched => "matched",
            TransactionStatus::Reconciled => "reconciled",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unmatched" => Ok(TransactionStatus::Unmatched),
            "matched" => Ok(TransactionStatus::Matched),
            "reconciled" => Ok(TransactionStatus::Reconciled),
            other => Err(format!("unknown transaction status '{}'", other)),
        }
    }
}

impl fmt::Display for TransactionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//
// ================= Batch =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationBatch {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub status: String,
}

//
// ================= Transactions =================
//

/// A validated record extracted from a source document, not yet persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub source: TransactionSource,
    pub transaction_date: NaiveDate,
    pub amount: Decimal,
    pub reference_id: Option<String>,
    pub description: Option<String>,
}

/// A persisted transaction. Serializes to the exception-report shape.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: i64,
    #[serde(skip_serializing)]
    pub batch_id: i64,
    pub source: TransactionSource,
    #[serde(rename = "date")]
    pub transaction_date: NaiveDate,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub reference_id: Option<String>,
    pub description: Option<String>,
    pub status: TransactionStatus,
    pub match_id: Option<i64>,
}

impl Transaction {
    pub fn from_new(id: i64, batch_id: i64, record: NewTransaction) -> Self {
        Self {
            id,
            batch_id,
            source: record.source,
            transaction_date: record.transaction_date,
            amount: record.amount,
            reference_id: record.reference_id,
            description: record.description,
            status: TransactionStatus::Unmatched,
            match_id: None,
        }
    }

    pub fn is_unmatched(&self) -> bool {
        self.status == TransactionStatus::Unmatched
    }

    /// Mark this side of a pair
    pub fn pair_with(&mut self, other_id: i64) {
        self.status = TransactionStatus::Matched;
        self.match_id = Some(other_id);
    }
}

/// Two transactions paired across sources
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct MatchPair {
    pub bank_id: i64,
    pub policy_id: i64,
}

//
// ================= Uploads =================
//

/// Raw document handed in by the request layer
#[derive(Debug, Clone)]
pub struct UploadedDocument {
    pub file_name: Option<String>,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl UploadedDocument {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: None,
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn pdf(bytes: Vec<u8>) -> Self {
        Self::new("application/pdf", bytes)
    }
}

//
// ================= Run Results =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub batch_id: i64,
    pub bank_transactions: usize,
    pub policy_transactions: usize,
    pub exact_pairs: usize,
    pub fuzzy_pairs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchExceptions {
    pub bank: Vec<Transaction>,
    pub policy: Vec<Transaction>,
}

/// Read model for a finished batch: matched pair count plus per-source exceptions
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDetails {
    pub batch_id: i64,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub matched_count: usize,
    pub exceptions: BatchExceptions,
}

impl BatchDetails {
    pub fn from_parts(batch: ReconciliationBatch, transactions: Vec<Transaction>) -> Self {
        let matched = transactions
            .iter()
            .filter(|t| t.status == TransactionStatus::Matched)
            .count();

        let (bank, policy): (Vec<_>, Vec<_>) = transactions
            .into_iter()
            .filter(|t| t.is_unmatched())
            .partition(|t| t.source == TransactionSource::BankStatement);

        Self {
            batch_id: batch.id,
            timestamp: batch.created_at,
            status: batch.status,
            matched_count: matched / 2,
            exceptions: BatchExceptions { bank, policy },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(id: i64, source: TransactionSource, status: TransactionStatus) -> Transaction {
        Transaction {
            id,
            batch_id: 1,
            source,
            transaction_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            amount: Decimal::new(50000, 2),
            reference_id: Some("A1".to_string()),
            description: None,
            status,
            match_id: None,
        }
    }

    #[test]
    fn test_source_round_trip_strings() {
        assert_eq!(
            "bank_statement".parse::<TransactionSource>().unwrap(),
            TransactionSource::BankStatement
        );
        assert!("ledger".parse::<TransactionSource>().is_err());
        assert_eq!(
            TransactionSource::PolicyLog.counterpart(),
            TransactionSource::BankStatement
        );
    }

    #[test]
    fn test_transaction_serialization_shape() {
        let mut t = txn(3, TransactionSource::BankStatement, TransactionStatus::Unmatched);
        t.pair_with(9);
        let json = serde_json::to_value(&t).unwrap();

        assert_eq!(json["date"], "2025-01-01");
        assert_eq!(json["amount"], 500.0);
        assert_eq!(json["referenceId"], "A1");
        assert_eq!(json["status"], "matched");
        assert_eq!(json["matchId"], 9);
        assert_eq!(json["source"], "bank_statement");
        assert!(json.get("batchId").is_none());
    }

    #[test]
    fn test_details_count_pairs_not_singles() {
        let batch = ReconciliationBatch {
            id: 1,
            created_at: Utc::now(),
            status: DEFAULT_BATCH_STATUS.to_string(),
        };
        let details = BatchDetails::from_parts(
            batch,
            vec![
                txn(1, TransactionSource::BankStatement, TransactionStatus::Matched),
                txn(2, TransactionSource::PolicyLog, TransactionStatus::Matched),
                txn(3, TransactionSource::BankStatement, TransactionStatus::Unmatched),
                txn(4, TransactionSource::PolicyLog, TransactionStatus::Unmatched),
                txn(5, TransactionSource::PolicyLog, TransactionStatus::Reconciled),
            ],
        );

        assert_eq!(details.matched_count, 1);
        assert_eq!(details.exceptions.bank.len(), 1);
        assert_eq!(details.exceptions.policy.len(), 1);
        assert_eq!(details.exceptions.policy[0].id, 4);

        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["matchedCount"], 1);
        assert_eq!(json["batchId"], 1);
        assert!(json["exceptions"]["bank"].is_array());
    }
}
