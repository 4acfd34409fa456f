use policy_recon::{
    audit::AuditLog,
    config::AppConfig,
    extraction::{DocumentTextExtractor, StructuredExtractor},
    gemini::GeminiClient,
    matching::FuzzyMatcher,
    models::UploadedDocument,
    orchestrator::Orchestrator,
    parser::{ParserOptions, StatementParser},
    store::InMemoryBatchStore,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn load(path: &str) -> std::io::Result<UploadedDocument> {
    let bytes = std::fs::read(path)?;
    let mime = match Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    };

    let mut document = UploadedDocument::new(mime, bytes);
    document.file_name = Some(path.to_string());
    Ok(document)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize tracing on stderr so stdout stays valid JSON
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: reconcile <bank_statement> <policy_log>");
        std::process::exit(2);
    }

    let config = AppConfig::from_env()?;

    // Create components
    let gemini = Arc::new(GeminiClient::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
        config.collaborator_timeout(),
    )?);
    let structured: Arc<dyn StructuredExtractor> = gemini.clone();
    let parser = Arc::new(StatementParser::new(
        Arc::new(DocumentTextExtractor::new(Some(gemini))),
        structured.clone(),
        ParserOptions {
            max_prompt_chars: config.max_prompt_chars,
            timeout: config.collaborator_timeout(),
        },
    ));
    let fuzzy = Arc::new(FuzzyMatcher::new(structured, config.collaborator_timeout()));

    let orchestrator = Orchestrator::new(
        parser,
        fuzzy,
        Arc::new(InMemoryBatchStore::new()),
        Arc::new(AuditLog::new()),
    );

    info!(bank = %args[1], policy = %args[2], "Running reconciliation");

    let summary = orchestrator
        .run(Some(load(&args[1])?), Some(load(&args[2])?))
        .await?;
    let details = orchestrator.get_batch_details(summary.batch_id).await?;

    println!("{}", serde_json::to_string_pretty(&details)?);
    Ok(())
}
