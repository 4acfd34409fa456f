//! Statement parser
//!
//! Document bytes → text → LLM-structured candidate records → validated
//! transactions. Collaborator failures degrade to an empty result; a single
//! malformed record is dropped and never fails the document.

use crate::extraction::{
    parse_json_reply, truncate_chars, Extraction, StructuredExtractor, TextExtractor,
};
use crate::models::{NewTransaction, TransactionSource, UploadedDocument};
use crate::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone)]
pub struct ParserOptions {
    pub max_prompt_chars: usize,
    pub timeout: Duration,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            max_prompt_chars: crate::config::DEFAULT_MAX_PROMPT_CHARS,
            timeout: Duration::from_secs(crate::config::DEFAULT_TIMEOUT_SECS),
        }
    }
}

pub struct StatementParser {
    text_extractor: Arc<dyn TextExtractor>,
    structured: Arc<dyn StructuredExtractor>,
    options: ParserOptions,
}

impl StatementParser {
    pub fn new(
        text_extractor: Arc<dyn TextExtractor>,
        structured: Arc<dyn StructuredExtractor>,
        options: ParserOptions,
    ) -> Self {
        Self {
            text_extractor,
            structured,
            options,
        }
    }

    /// Parse one source document into validated transactions.
    /// Returns an empty list when nothing usable could be extracted.
    pub async fn parse(
        &self,
        document: &UploadedDocument,
        source: TransactionSource,
    ) -> Vec<NewTransaction> {
        // Step 1: raw text
        let text = match with_timeout(
            self.options.timeout,
            self.text_extractor
                .extract_text(&document.bytes, &document.mime_type),
        )
        .await
        {
            Ok(text) => text,
            Err(e) => {
                error!(source = %source, "Text extraction failed: {}", e);
                return Vec::new();
            }
        };

        if text.trim().is_empty() {
            warn!(source = %source, "No text could be extracted from the document");
            return Vec::new();
        }

        // Step 2: structured extraction. Statement text is sent verbatim;
        // references and amounts must reach the matcher unchanged.
        let context = truncate_chars(&text, self.options.max_prompt_chars);
        let instructions = build_extraction_prompt(source);

        let reply = match with_timeout(
            self.options.timeout,
            self.structured.extract_structured(context, &instructions),
        )
        .await
        {
            Ok(reply) => reply,
            Err(e) => {
                error!(source = %source, "Structured extraction failed: {}", e);
                return Vec::new();
            }
        };

        let candidates = match parse_json_reply(&reply).and_then(candidate_records) {
            Extraction::Parsed(records) => records,
            Extraction::Failed(reason) => {
                error!(source = %source, "Unusable extraction reply: {}", reason);
                return Vec::new();
            }
        };

        info!(
            source = %source,
            candidates = candidates.len(),
            "Extracted candidate transactions"
        );

        // Step 3: validation
        let validated: Vec<NewTransaction> = candidates
            .iter()
            .filter_map(|record| match validate_record(record, source) {
                Ok(txn) => Some(txn),
                Err(reason) => {
                    warn!(
                        source = %source,
                        record = %record,
                        "Skipping malformed transaction: {}",
                        reason
                    );
                    None
                }
            })
            .collect();

        info!(
            source = %source,
            accepted = validated.len(),
            dropped = candidates.len() - validated.len(),
            "Validated transactions"
        );

        validated
    }
}

/// Await a collaborator call, treating an elapsed deadline as a failure
pub(crate) async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| crate::error::ReconciliationError::Timeout(limit.as_secs()))?
}

fn candidate_records(value: Value) -> Extraction<Vec<Value>> {
    match value {
        Value::Array(items) => Extraction::Parsed(items),
        other => Extraction::Failed(format!(
            "expected a JSON array of transactions, got {}",
            json_kind(&other)
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Validate and normalize one candidate record
pub fn validate_record(
    record: &Value,
    source: TransactionSource,
) -> std::result::Result<NewTransaction, String> {
    let obj = record
        .as_object()
        .ok_or_else(|| format!("record is {}, not an object", json_kind(record)))?;

    let raw_date = obj
        .get("transaction_date")
        .filter(|v| !v.is_null())
        .ok_or("missing transaction_date")?;
    let transaction_date = parse_date(raw_date)?;

    let raw_amount = obj
        .get("amount")
        .filter(|v| !v.is_null())
        .ok_or("missing amount")?;
    let amount = parse_amount(raw_amount)?;

    Ok(NewTransaction {
        source,
        transaction_date,
        amount,
        reference_id: optional_text(obj.get("reference_id")),
        description: optional_text(obj.get("description")),
    })
}

fn parse_date(value: &Value) -> std::result::Result<NaiveDate, String> {
    let raw = value
        .as_str()
        .ok_or_else(|| format!("transaction_date is {}, not a string", json_kind(value)))?;

    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|e| format!("transaction_date '{}' is not YYYY-MM-DD: {}", raw, e))
}

/// Exact decimal from a JSON number or numeric string
pub fn parse_amount(value: &Value) -> std::result::Result<Decimal, String> {
    let raw = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => return Err(format!("amount is {}, not numeric", json_kind(other))),
    };

    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| format!("amount '{}' is not a number", raw))
}

fn optional_text(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    (!text.is_empty()).then_some(text)
}

fn build_extraction_prompt(source: TransactionSource) -> String {
    format!(
        r#"Act as an expert data entry clerk specializing in financial documents.
Analyze the raw text below, extracted from a '{}' document, and identify every financial transaction entry.

For each transaction, extract:
1. "transaction_date": the date of the transaction, formatted as YYYY-MM-DD.
2. "amount": the numerical value of the transaction.
3. "reference_id": any unique identifier, policy number or reference code; null if none is present.
4. "description": a brief description of the transaction; null if none.

Return ONLY a single JSON array of objects, one object per transaction.
If no transactions are present, return an empty array [].

EXAMPLE RESPONSE:
[
  {{
    "transaction_date": "2024-08-15",
    "amount": 5250.00,
    "reference_id": "POL-987654",
    "description": "Premium Payment - A. Kumar"
  }}
]

Raw text:"#,
        source.as_str()
    )
}
