use policy_recon::{
    api::{start_server, ApiState},
    audit::AuditLog,
    config::AppConfig,
    documents::DocumentProcessor,
    extraction::{DocumentTextExtractor, StructuredExtractor},
    gemini::GeminiClient,
    matching::FuzzyMatcher,
    orchestrator::Orchestrator,
    parser::{ParserOptions, StatementParser},
    store::build_store,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;
    if config.gemini_api_key.is_empty() {
        warn!("GEMINI_API_KEY not set; document extraction will fail until it is configured");
    }

    info!("Policy reconciliation API server");
    info!("Port: {}", config.port);
    info!("Model: {}", config.gemini_model);

    // Create components
    let gemini = Arc::new(GeminiClient::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
        config.collaborator_timeout(),
    )?);
    let structured: Arc<dyn StructuredExtractor> = gemini.clone();
    let text_extractor = Arc::new(DocumentTextExtractor::new(Some(gemini)));

    let options = ParserOptions {
        max_prompt_chars: config.max_prompt_chars,
        timeout: config.collaborator_timeout(),
    };

    let parser = Arc::new(StatementParser::new(
        text_extractor.clone(),
        structured.clone(),
        options.clone(),
    ));
    let fuzzy = Arc::new(FuzzyMatcher::new(
        structured.clone(),
        config.collaborator_timeout(),
    ));
    let persistence = build_store(&config);
    let audit_log = Arc::new(AuditLog::with_store(persistence.audit));

    let state = ApiState {
        orchestrator: Arc::new(Orchestrator::new(
            parser,
            fuzzy,
            persistence.batches,
            audit_log.clone(),
        )),
        documents: Arc::new(
            DocumentProcessor::new(text_extractor, structured, options)
                .with_redaction(config.redact_pii),
        ),
        audit_log,
    };

    info!("Orchestrator initialized");

    // Start API server
    start_server(state, config.port, config.max_upload_bytes).await?;

    Ok(())
}
