//! Text extraction for uploaded documents (PDF, plain text, images)

use super::TextExtractor;
use crate::error::ReconciliationError;
use crate::gemini::GeminiClient;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

const PDF_MAGIC: &[u8] = b"%PDF-";

/// Production text extractor.
///
/// PDFs go through `pdf-extract` on a blocking thread. Images are transcribed
/// by the Gemini client when one is configured.
pub struct DocumentTextExtractor {
    ocr: Option<Arc<GeminiClient>>,
}

impl DocumentTextExtractor {
    pub fn new(ocr: Option<Arc<GeminiClient>>) -> Self {
        Self { ocr }
    }

    async fn extract_pdf(bytes: &[u8]) -> Result<String> {
        let owned = bytes.to_vec();

        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&owned))
            .await
            .map_err(|e| {
                ReconciliationError::TextExtraction(format!("PDF extraction aborted: {}", e))
            })?
            .map_err(|e| ReconciliationError::TextExtraction(format!("Unreadable PDF: {}", e)))
    }
}

/// Lowercased media type without parameters, sniffing PDFs sent as octet-stream
pub(crate) fn effective_mime(bytes: &[u8], declared: &str) -> String {
    let mime = declared
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();

    if bytes.starts_with(PDF_MAGIC) && (mime.is_empty() || mime == "application/octet-stream") {
        return "application/pdf".to_string();
    }

    mime
}

#[async_trait]
impl TextExtractor for DocumentTextExtractor {
    async fn extract_text(&self, bytes: &[u8], mime_type: &str) -> Result<String> {
        let mime = effective_mime(bytes, mime_type);
        debug!(mime = %mime, size = bytes.len(), "Extracting document text");

        match mime.as_str() {
            "application/pdf" => Self::extract_pdf(bytes).await,
            "text/plain" | "text/csv" => Ok(String::from_utf8_lossy(bytes).into_owned()),
            m if m.starts_with("image/") => match &self.ocr {
                Some(client) => client.transcribe_image(bytes, m).await,
                None => Err(ReconciliationError::UnsupportedMediaType(m.to_string())),
            },
            other => Err(ReconciliationError::UnsupportedMediaType(other.to_string())),
        }
    }
}
