use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use parley_agent::background::EnrichmentFailure;
use parley_agent::tools::{RemoteTool, ToolError};
use parley_agent::{
    client_from_config, BackgroundEnrichment, LoggingEnricher, Orchestrator,
    OrchestratorSettings, ReasoningError, ToolRegistry,
};
use parley_core::config::{AppConfig, ConfigError, LoadOptions};
use parley_core::confirmation::ConfirmationError;
use parley_core::ConfirmationGate;
use parley_db::repositories::{
    InboundEventRepository, SqlCatalogRepository, SqlConversationLockRepository,
    SqlConversationRepository, SqlDeadLetterRepository, SqlInboundEventRepository,
    SqlMessageRepository, SqlSessionRepository,
};
use parley_db::{connect_with_settings, migrations, DbPool, SessionStore};
use parley_ingest::{
    engine_from_config, DeliveryError, IngestionPipeline, NoopOutboundChannel, OutboundChannel,
    PipelineRepositories, PipelineSettings, SignatureVerifier, WebhookOutboundChannel,
    WorkerPolicy, WorkerPool,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub inbound: Arc<dyn InboundEventRepository>,
    pub pipeline: Arc<IngestionPipeline>,
    pub workers: WorkerPool,
    pub verifier: Option<SignatureVerifier>,
    pub enrichment_failures: mpsc::UnboundedReceiver<EnrichmentFailure>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("reasoning client setup failed: {0}")]
    Reasoning(#[from] ReasoningError),
    #[error("tool setup failed: {0}")]
    Tool(#[from] ToolError),
    #[error("confirmation templates failed to load: {0}")]
    Confirmation(#[from] ConfirmationError),
    #[error("outbound channel setup failed: {0}")]
    Outbound(#[from] DeliveryError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let session_ttl = i64::try_from(config.session.ttl_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or_else(|| Duration::hours(24));
    let sessions = SessionStore::new(Arc::new(SqlSessionRepository::new(db_pool.clone())))
        .with_ttl(session_ttl);

    let mut tools = ToolRegistry::with_cart_tools();
    for remote in &config.tools.remote {
        tools.register(RemoteTool::new(remote.clone())?);
    }
    info!(
        event_name = "system.bootstrap.tools_registered",
        correlation_id = "bootstrap",
        remote_tools = config.tools.remote.len(),
        "tool registry ready"
    );

    let confirmation_ttl = i64::try_from(config.agent.confirmation_ttl_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or_else(|| Duration::minutes(15));
    let (enrichment, enrichment_failures) = BackgroundEnrichment::new(Arc::new(LoggingEnricher));

    let orchestrator = Orchestrator::new(
        sessions,
        Arc::new(SqlMessageRepository::new(db_pool.clone())),
        Arc::new(SqlCatalogRepository::new(db_pool.clone())),
        client_from_config(&config.llm)?,
        Arc::new(tools),
        ConfirmationGate::with_ttl(confirmation_ttl)?,
    )
    .with_settings(OrchestratorSettings::from_config(&config))
    .with_enrichment(enrichment);

    let outbound: Arc<dyn OutboundChannel> = match &config.outbound.webhook_url {
        Some(url) => Arc::new(WebhookOutboundChannel::new(
            url.clone(),
            StdDuration::from_secs(config.outbound.timeout_secs),
        )?),
        None => Arc::new(NoopOutboundChannel),
    };

    let inbound: Arc<dyn InboundEventRepository> =
        Arc::new(SqlInboundEventRepository::new(db_pool.clone()));
    let pipeline = Arc::new(
        IngestionPipeline::new(
            engine_from_config(&config),
            PipelineRepositories {
                inbound: Arc::clone(&inbound),
                locks: Arc::new(SqlConversationLockRepository::new(db_pool.clone())),
                conversations: Arc::new(SqlConversationRepository::new(db_pool.clone())),
                dead_letters: Arc::new(SqlDeadLetterRepository::new(db_pool.clone())),
            },
            Arc::new(orchestrator),
            outbound,
        )
        .with_settings(PipelineSettings::from_config(&config)),
    );

    let workers =
        WorkerPool::new(Arc::clone(&pipeline), WorkerPolicy::from_config(&config.ingestion));
    let verifier = config.ingestion.webhook_secret.clone().map(SignatureVerifier::new);

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        reasoning_provider = ?config.llm.provider,
        outbound = if config.outbound.webhook_url.is_some() { "webhook" } else { "noop" },
        signed_webhooks = verifier.is_some(),
        "application bootstrap complete"
    );

    Ok(Application { config, db_pool, inbound, pipeline, workers, verifier, enrichment_failures })
}
