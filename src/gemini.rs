//! Gemini API client
//!
//! Structured extraction (JSON response mode) and image transcription.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::ReconciliationError;
use crate::extraction::StructuredExtractor;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String, timeout: Duration) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url: BASE_URL.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a reply for `parts`, optionally forcing a JSON response
    async fn generate(
        &self,
        parts: Vec<Part>,
        system_prompt: &str,
        json_response: bool,
    ) -> crate::Result<String> {
        if self.api_key.is_empty() {
            return Err(ReconciliationError::Llm(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let request = GeminiRequest {
            contents: vec![Content { parts }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 8192,
                response_mime_type: json_response.then(|| "application/json".to_string()),
            },
            system_instruction: SystemInstruction {
                parts: vec![Part::text(system_prompt)],
            },
        };

        debug!(model = %self.model, "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                ReconciliationError::Llm(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(ReconciliationError::Llm(format!(
                "Gemini API returned {}",
                status
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            ReconciliationError::Llm(format!("Gemini parse error: {}", e))
        })?;

        let candidate = gemini_response.candidates.into_iter().next().ok_or_else(|| {
            ReconciliationError::Llm("No response from Gemini API".to_string())
        })?;

        if let Some(reason) = candidate.finish_reason.as_deref() {
            if reason != "STOP" {
                info!(finish_reason = reason, "Gemini response did not finish cleanly");
            }
        }

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ReconciliationError::Llm(
                "Empty response from Gemini".to_string(),
            ));
        }

        if let Some(usage) = gemini_response.usage_metadata {
            debug!(
                prompt_tokens = usage.prompt_token_count,
                reply_tokens = usage.candidates_token_count,
                "Gemini usage"
            );
        }

        Ok(text)
    }

    /// Transcribe the text visible in an image (OCR)
    pub async fn transcribe_image(&self, bytes: &[u8], mime_type: &str) -> crate::Result<String> {
        let parts = vec![
            Part::inline(mime_type, bytes),
            Part::text("Transcribe all text in this image exactly as it appears. Output plain text only."),
        ];

        self.generate(parts, OCR_SYSTEM_PROMPT, false)
            .await
            .map_err(|e| ReconciliationError::TextExtraction(e.to_string()))
    }
}

#[async_trait]
impl StructuredExtractor for GeminiClient {
    async fn extract_structured(&self, context: &str, instructions: &str) -> crate::Result<String> {
        let prompt = format!("{}\n\n---\n{}\n---", instructions, context);
        self.generate(vec![Part::text(&prompt)], EXTRACTION_SYSTEM_PROMPT, true)
            .await
    }
}

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are a meticulous data-entry assistant for an insurance agency back office.

Guidelines:
- Follow the requested JSON shape exactly
- Never invent values that are not present in the input
- Use null for fields that cannot be found
- Return ONLY valid JSON, with no commentary"#;

const OCR_SYSTEM_PROMPT: &str =
    "You are an OCR engine. Reproduce document text faithfully, preserving line order.";

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl Part {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            inline_data: None,
        }
    }

    fn inline(mime_type: &str, bytes: &[u8]) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: mime_type.to_string(),
                data: STANDARD.encode(bytes),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i32,
    #[serde(default)]
    candidates_token_count: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part::text("Extract transactions")],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 8192,
                response_mime_type: Some("application/json".to_string()),
            },
            system_instruction: SystemInstruction {
                parts: vec![Part::text("You are a data-entry assistant")],
            },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "Extract transactions");
        assert_eq!(
            json["generation_config"]["response_mime_type"],
            "application/json"
        );
        assert!(json["contents"][0]["parts"][0].get("inline_data").is_none());
    }

    #[test]
    fn test_inline_part_is_base64() {
        let part = Part::inline("image/png", b"abc");
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["inline_data"]["data"], "YWJj");
        assert_eq!(json["inline_data"]["mime_type"], "image/png");
        assert!(json.get("text").is_none());
    }

    #[test]
    fn test_response_deserialization() {
        let raw = r#"{
            "candidates": [{
                "content": {"parts": [{"text": "[]"}], "role": "model"},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 1}
        }"#;
        let response: GeminiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.candidates.len(), 1);
        assert_eq!(response.candidates[0].finish_reason.as_deref(), Some("STOP"));
        assert_eq!(response.usage_metadata.unwrap().prompt_token_count, 10);
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let client = GeminiClient::new(
            String::new(),
            "gemini-2.5-flash".to_string(),
            Duration::from_secs(5),
        )
        .unwrap();

        let result = client.extract_structured("text", "instructions").await;
        let error_msg = result.unwrap_err().to_string();
        assert!(error_msg.contains("GEMINI_API_KEY"));
    }
}
