//! AI-assisted pass over whatever the exact pass left unmatched
//!
//! The collaborator only proposes pairs. Every proposal is re-checked against
//! the store before it is applied, so hallucinated, reused or foreign ids are
//! dropped.

use super::MatchPools;
use crate::extraction::{parse_json_reply, Extraction, StructuredExtractor};
use crate::models::{MatchPair, Transaction, TransactionSource};
use crate::parser::with_timeout;
use crate::store::BatchUnit;
use crate::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Pair as proposed by the collaborator, not yet validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposedPair {
    pub bank_transaction_id: i64,
    pub policy_transaction_id: i64,
}

/// Compact view of a candidate sent to the collaborator
#[derive(Debug, Serialize)]
struct CandidateView<'a> {
    id: i64,
    date: NaiveDate,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    reference_id: Option<&'a str>,
    description: Option<&'a str>,
}

impl<'a> From<&'a Transaction> for CandidateView<'a> {
    fn from(t: &'a Transaction) -> Self {
        Self {
            id: t.id,
            date: t.transaction_date,
            amount: t.amount,
            reference_id: t.reference_id.as_deref(),
            description: t.description.as_deref(),
        }
    }
}

pub struct FuzzyMatcher {
    structured: Arc<dyn StructuredExtractor>,
    timeout: Duration,
}

impl FuzzyMatcher {
    pub fn new(structured: Arc<dyn StructuredExtractor>, timeout: Duration) -> Self {
        Self {
            structured,
            timeout,
        }
    }

    /// Ask the collaborator for high-confidence pairs.
    /// Any collaborator or reply failure yields no proposals.
    pub async fn propose(&self, pools: &MatchPools) -> Vec<ProposedPair> {
        if !pools.both_sides_pending() {
            return Vec::new();
        }

        let context = match build_context(pools) {
            Ok(context) => context,
            Err(e) => {
                error!("Failed to serialize fuzzy-match candidates: {}", e);
                return Vec::new();
            }
        };

        let reply = match with_timeout(
            self.timeout,
            self.structured
                .extract_structured(&context, FUZZY_MATCH_INSTRUCTIONS),
        )
        .await
        {
            Ok(reply) => reply,
            Err(e) => {
                error!("Fuzzy-match collaborator failed: {}", e);
                return Vec::new();
            }
        };

        match parse_json_reply(&reply).and_then(proposed_pairs) {
            Extraction::Parsed(pairs) => pairs,
            Extraction::Failed(reason) => {
                error!("Unusable fuzzy-match reply: {}", reason);
                Vec::new()
            }
        }
    }

    /// Apply proposals that survive re-validation against the unit.
    ///
    /// A proposal is applied only if both ids exist, belong to `batch_id`,
    /// come from the expected sources and are still unmatched.
    pub async fn accept(
        &self,
        batch_id: i64,
        proposals: &[ProposedPair],
        pools: &mut MatchPools,
        unit: &mut dyn BatchUnit,
    ) -> Result<Vec<MatchPair>> {
        let mut accepted = Vec::new();

        for proposal in proposals {
            let bank = unit.get_transaction(proposal.bank_transaction_id).await?;
            let policy = unit.get_transaction(proposal.policy_transaction_id).await?;

            if let Err(reason) = check_candidate(bank.as_ref(), TransactionSource::BankStatement, batch_id)
                .and_then(|_| check_candidate(policy.as_ref(), TransactionSource::PolicyLog, batch_id))
            {
                warn!(
                    batch_id,
                    bank_id = proposal.bank_transaction_id,
                    policy_id = proposal.policy_transaction_id,
                    "Rejected fuzzy pair: {}",
                    reason
                );
                continue;
            }

            let pair = MatchPair {
                bank_id: proposal.bank_transaction_id,
                policy_id: proposal.policy_transaction_id,
            };

            unit.mark_matched(pair).await?;
            if !pools.apply(pair) {
                // The unit is authoritative; the pools only feed later passes
                warn!(
                    batch_id,
                    bank_id = pair.bank_id,
                    policy_id = pair.policy_id,
                    "Fuzzy pair matched in store but missing from candidate pools"
                );
            }
            accepted.push(pair);
        }

        Ok(accepted)
    }

    /// Propose, validate and apply. Persistence errors propagate; collaborator
    /// errors only mean no fuzzy pairs.
    pub async fn run(
        &self,
        batch_id: i64,
        pools: &mut MatchPools,
        unit: &mut dyn BatchUnit,
    ) -> Result<Vec<MatchPair>> {
        let proposals = self.propose(pools).await;
        let accepted = self.accept(batch_id, &proposals, pools, unit).await?;

        info!(
            batch_id,
            proposed = proposals.len(),
            accepted = accepted.len(),
            "Fuzzy matching complete"
        );

        Ok(accepted)
    }
}

fn check_candidate(
    txn: Option<&Transaction>,
    expected: TransactionSource,
    batch_id: i64,
) -> std::result::Result<(), String> {
    let txn = txn.ok_or_else(|| format!("{} id does not exist", expected))?;

    if txn.batch_id != batch_id {
        return Err(format!("transaction {} belongs to another batch", txn.id));
    }
    if txn.source != expected {
        return Err(format!("transaction {} is not from {}", txn.id, expected));
    }
    if !txn.is_unmatched() {
        return Err(format!("transaction {} is already {}", txn.id, txn.status));
    }

    Ok(())
}

fn build_context(pools: &MatchPools) -> serde_json::Result<String> {
    let bank: Vec<CandidateView> = pools.bank().iter().map(CandidateView::from).collect();
    let policy: Vec<CandidateView> = pools.policy().iter().map(CandidateView::from).collect();

    Ok(format!(
        "Bank Transactions (unmatched):\n{}\n\nPolicy Log Transactions (unmatched):\n{}",
        serde_json::to_string_pretty(&bank)?,
        serde_json::to_string_pretty(&policy)?
    ))
}

fn proposed_pairs(value: Value) -> Extraction<Vec<ProposedPair>> {
    let Value::Object(mut obj) = value else {
        return Extraction::Failed("expected a JSON object with \"matched_pairs\"".to_string());
    };

    let items = match obj.remove("matched_pairs") {
        None | Some(Value::Null) => return Extraction::Parsed(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Extraction::Failed("\"matched_pairs\" is not an array".to_string()),
    };

    let pairs = items
        .iter()
        .filter_map(|item| {
            let bank = item.get("bank_transaction_id").and_then(as_id);
            let policy = item.get("policy_transaction_id").and_then(as_id);

            match (bank, policy) {
                (Some(bank_transaction_id), Some(policy_transaction_id)) => Some(ProposedPair {
                    bank_transaction_id,
                    policy_transaction_id,
                }),
                _ => {
                    warn!(pair = %item, "Skipping malformed fuzzy pair");
                    None
                }
            }
        })
        .collect();

    Extraction::Parsed(pairs)
}

fn as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

const FUZZY_MATCH_INSTRUCTIONS: &str = r#"Act as an expert financial analyst. Reconcile two lists of unmatched transactions: one from a bank statement and one from an internal policy log.

Find the most likely pairs using fuzzy criteria such as similar (but not exact) amounts, close dates, and descriptions that refer to the same entity (e.g. "UPI/P-SHARMA" vs "Payment from Priya Sharma").

Return ONLY a single JSON object:
- The key must be "matched_pairs".
- Its value is a list of objects with "bank_transaction_id" and "policy_transaction_id", using the ids given below.
- Only include pairs you are highly confident about. Omit any pair you are unsure of.
- Each transaction may appear in at most one pair.

EXAMPLE RESPONSE:
{
  "matched_pairs": [
    { "bank_transaction_id": 15, "policy_transaction_id": 102 }
  ]
}"#;
