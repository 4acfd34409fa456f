//! Collaborator boundaries for document text and structured (LLM) extraction
//!
//! Both collaborators are injected as trait objects so the parser and the
//! fuzzy matcher never depend on a concrete service.

use crate::error::ReconciliationError;
use crate::Result;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub mod document;
pub use document::DocumentTextExtractor;

/// Turns raw document bytes into plain text.
/// Empty or whitespace-only output means "no text found", not an error.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, bytes: &[u8], mime_type: &str) -> Result<String>;
}

/// Converts unstructured context into a JSON reply following `instructions`.
/// Returns the raw reply text; callers parse it with [`parse_json_reply`].
#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    async fn extract_structured(&self, context: &str, instructions: &str) -> Result<String>;
}

/// Outcome of interpreting a collaborator reply
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction<T> {
    Parsed(T),
    Failed(String),
}

impl<T> Extraction<T> {
    pub fn and_then<U, F>(self, f: F) -> Extraction<U>
    where
        F: FnOnce(T) -> Extraction<U>,
    {
        match self {
            Extraction::Parsed(value) => f(value),
            Extraction::Failed(reason) => Extraction::Failed(reason),
        }
    }
}

/// Parse a JSON payload out of an LLM reply.
///
/// Code fences are stripped first. If that still does not parse, the span from
/// the first `{`/`[` to the last matching closer is tried.
pub fn parse_json_reply(raw: &str) -> Extraction<Value> {
    let cleaned = strip_code_fences(raw);

    if cleaned.is_empty() {
        return Extraction::Failed("empty reply".to_string());
    }

    let first_error = match serde_json::from_str::<Value>(cleaned) {
        Ok(value) => return Extraction::Parsed(value),
        Err(e) => e,
    };

    match locate_json_span(cleaned).map(serde_json::from_str::<Value>) {
        Some(Ok(value)) => Extraction::Parsed(value),
        _ => Extraction::Failed(format!("reply is not valid JSON: {}", first_error)),
    }
}

fn strip_code_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```JSON")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

fn locate_json_span(text: &str) -> Option<&str> {
    let start = text.find(|c| c == '{' || c == '[')?;
    let closer = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(closer)?;

    (end > start).then(|| &text[start..=end])
}

/// Prefix of `text` holding at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

lazy_static! {
    static ref RE_EMAIL: Regex =
        Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap();
    static ref RE_AADHAAR: Regex = Regex::new(r"\b\d{4}[ \t]\d{4}[ \t]\d{4}\b").unwrap();
    static ref RE_PAN: Regex = Regex::new(r"\b[A-Z]{5}[0-9]{4}[A-Z]\b").unwrap();
}

/// Mask personal identifiers before document text is sent out of process
pub fn redact_pii(text: &str) -> String {
    let text = RE_EMAIL.replace_all(text, "[REDACTED_EMAIL]");
    let text = RE_AADHAAR.replace_all(&text, "[REDACTED_AADHAAR]");
    RE_PAN.replace_all(&text, "[REDACTED_PAN]").into_owned()
}

//
// ================= Test Doubles =================
//

/// Text extractor that reads the document bytes as UTF-8 text.
/// Keeps the pipeline runnable without a PDF toolchain.
#[derive(Default)]
pub struct MockTextExtractor {
    calls: AtomicUsize,
}

impl MockTextExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextExtractor for MockTextExtractor {
    async fn extract_text(&self, bytes: &[u8], _mime_type: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Structured extractor answering from a fixed script.
///
/// Each rule is a needle and a reply; the first rule whose needle occurs in the
/// context or instructions wins. Unmatched prompts fail like an unavailable service.
#[derive(Default)]
pub struct ScriptedExtractor {
    rules: Vec<(String, std::result::Result<String, String>)>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, needle: &str, reply: impl Into<String>) -> Self {
        self.rules.push((needle.to_string(), Ok(reply.into())));
        self
    }

    pub fn fail_on(mut self, needle: &str, reason: &str) -> Self {
        self.rules.push((needle.to_string(), Err(reason.to_string())));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Contexts seen so far, in call order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StructuredExtractor for ScriptedExtractor {
    async fn extract_structured(&self, context: &str, instructions: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(context.to_string());
        }

        let rule = self
            .rules
            .iter()
            .find(|(needle, _)| context.contains(needle.as_str()) || instructions.contains(needle.as_str()));

        match rule {
            Some((_, Ok(reply))) => Ok(reply.clone()),
            Some((_, Err(reason))) => Err(ReconciliationError::Llm(reason.clone())),
            None => Err(ReconciliationError::Llm(
                "no scripted reply for prompt".to_string(),
            )),
        }
    }
}
