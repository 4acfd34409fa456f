//! AI-assisted field extraction for a single policy document

use crate::error::ReconciliationError;
use crate::extraction::{
    parse_json_reply, redact_pii, truncate_chars, Extraction, StructuredExtractor, TextExtractor,
};
use crate::models::UploadedDocument;
use crate::parser::{parse_amount, with_timeout, ParserOptions, DATE_FORMAT};
use crate::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub const NO_TEXT_MESSAGE: &str = "Could not extract any text from the document.";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyDocumentFields {
    pub policy_number: Option<String>,
    pub customer_name: Option<String>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub premium_amount: Option<Decimal>,
    pub policy_end_date: Option<NaiveDate>,
}

pub struct DocumentProcessor {
    text_extractor: Arc<dyn TextExtractor>,
    structured: Arc<dyn StructuredExtractor>,
    options: ParserOptions,
    redact_pii: bool,
}

impl DocumentProcessor {
    pub fn new(
        text_extractor: Arc<dyn TextExtractor>,
        structured: Arc<dyn StructuredExtractor>,
        options: ParserOptions,
    ) -> Self {
        Self {
            text_extractor,
            structured,
            options,
            redact_pii: true,
        }
    }

    /// Toggle masking of personal identifiers before text leaves the process
    pub fn with_redaction(mut self, redact_pii: bool) -> Self {
        self.redact_pii = redact_pii;
        self
    }

    /// Extract the key policy fields. Unlike statement parsing, every failure
    /// is reported to the caller.
    pub async fn process(&self, document: &UploadedDocument) -> Result<PolicyDocumentFields> {
        let text = with_timeout(
            self.options.timeout,
            self.text_extractor
                .extract_text(&document.bytes, &document.mime_type),
        )
        .await?;

        if text.trim().is_empty() {
            return Err(ReconciliationError::InvalidInput(NO_TEXT_MESSAGE.to_string()));
        }

        let prepared = if self.redact_pii {
            redact_pii(&text)
        } else {
            text
        };
        let context = truncate_chars(&prepared, self.options.max_prompt_chars);

        let reply = with_timeout(
            self.options.timeout,
            self.structured
                .extract_structured(context, POLICY_FIELDS_INSTRUCTIONS),
        )
        .await?;

        let fields = match parse_json_reply(&reply) {
            Extraction::Parsed(Value::Object(obj)) => fields_from_object(&obj),
            Extraction::Parsed(_) => {
                return Err(ReconciliationError::Llm(
                    "expected a JSON object of policy fields".to_string(),
                ))
            }
            Extraction::Failed(reason) => return Err(ReconciliationError::Llm(reason)),
        };

        info!(
            policy_number = ?fields.policy_number,
            "Policy document processed"
        );

        Ok(fields)
    }
}

fn fields_from_object(obj: &Map<String, Value>) -> PolicyDocumentFields {
    let text = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let premium_amount = match obj.get("premium_amount") {
        None | Some(Value::Null) => None,
        Some(value) => parse_amount(value)
            .map_err(|reason| warn!("Discarding premium_amount: {}", reason))
            .ok(),
    };

    let policy_end_date = text("policy_end_date").and_then(|raw| {
        NaiveDate::parse_from_str(&raw, DATE_FORMAT)
            .map_err(|e| warn!("Discarding policy_end_date '{}': {}", raw, e))
            .ok()
    });

    PolicyDocumentFields {
        policy_number: text("policy_number"),
        customer_name: text("customer_name"),
        premium_amount,
        policy_end_date,
    }
}

const POLICY_FIELDS_INSTRUCTIONS: &str = r#"You are an expert insurance document processor. Below is the raw text extracted from a policy document. Extract the following information precisely:
- Policy Number
- Customer Full Name
- Premium Amount (numbers only)
- Policy End Date (in YYYY-MM-DD format)

Return the result ONLY as a valid JSON object. If a field cannot be found, use null as its value. For example:
{
  "policy_number": "POL123456",
  "customer_name": "John Doe",
  "premium_amount": 500.00,
  "policy_end_date": "2026-12-31"
}"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{MockTextExtractor, ScriptedExtractor};

    fn processor(structured: ScriptedExtractor) -> DocumentProcessor {
        DocumentProcessor::new(
            Arc::new(MockTextExtractor::new()),
            Arc::new(structured),
            ParserOptions::default(),
        )
    }

    fn doc(text: &str) -> UploadedDocument {
        UploadedDocument::new("text/plain", text.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_extracts_fields() {
        let reply = "```json\n{\"policy_number\": \"POL123456\", \"customer_name\": \"John Doe\", \"premium_amount\": \"500.00\", \"policy_end_date\": \"2026-12-31\"}\n```";
        let fields = processor(ScriptedExtractor::new().on("Policy Number", reply))
            .process(&doc("Policy POL123456 issued to John Doe"))
            .await
            .unwrap();

        assert_eq!(fields.policy_number.as_deref(), Some("POL123456"));
        assert_eq!(fields.customer_name.as_deref(), Some("John Doe"));
        assert_eq!(fields.premium_amount, Some(Decimal::new(500, 0)));
        assert_eq!(fields.policy_end_date, NaiveDate::from_ymd_opt(2026, 12, 31));
    }

    #[tokio::test]
    async fn test_bad_values_become_null() {
        let reply = r#"{"policy_number": null, "customer_name": "  ", "premium_amount": "unknown", "policy_end_date": "31/12/2026"}"#;
        let fields = processor(ScriptedExtractor::new().on("Policy Number", reply))
            .process(&doc("some policy"))
            .await
            .unwrap();

        assert_eq!(fields, PolicyDocumentFields::default());
        let json = serde_json::to_value(&fields).unwrap();
        assert!(json["premium_amount"].is_null());
    }

    #[tokio::test]
    async fn test_personal_identifiers_masked_before_extraction() {
        let structured = Arc::new(ScriptedExtractor::new().on("Policy Number", "{}"));
        let processor = DocumentProcessor::new(
            Arc::new(MockTextExtractor::new()),
            structured.clone(),
            ParserOptions::default(),
        );

        processor
            .process(&doc("Policy POL-1 holder a@b.com PAN ABCDE1234F"))
            .await
            .unwrap();

        let prompts = structured.prompts();
        assert!(prompts[0].contains("POL-1"));
        assert!(prompts[0].contains("[REDACTED_EMAIL]"));
        assert!(prompts[0].contains("[REDACTED_PAN]"));

        let raw = Arc::new(ScriptedExtractor::new().on("Policy Number", "{}"));
        DocumentProcessor::new(Arc::new(MockTextExtractor::new()), raw.clone(), ParserOptions::default())
            .with_redaction(false)
            .process(&doc("holder a@b.com"))
            .await
            .unwrap();
        assert!(raw.prompts()[0].contains("a@b.com"));
    }

    #[tokio::test]
    async fn test_blank_document_is_input_error() {
        let structured = Arc::new(ScriptedExtractor::new());
        let processor = DocumentProcessor::new(
            Arc::new(MockTextExtractor::new()),
            structured.clone(),
            ParserOptions::default(),
        );

        let err = processor.process(&doc("   ")).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(structured.calls(), 0);
    }

    #[tokio::test]
    async fn test_unparsable_reply_is_server_error() {
        let err = processor(ScriptedExtractor::new().on("Policy Number", "I cannot help with that"))
            .process(&doc("policy text"))
            .await
            .unwrap_err();

        assert!(matches!(err, ReconciliationError::Llm(_)));
        assert_eq!(err.status_code(), 500);
    }
}
