pub mod config;
pub mod dead_letter;
pub mod doctor;
pub mod handoff;
pub mod migrate;
pub mod seed;

use std::future::Future;
use std::sync::Arc;

use chrono::Duration;
use parley_agent::llm::DisabledReasoningClient;
use parley_agent::{Orchestrator, ToolRegistry};
use parley_core::config::{AppConfig, LoadOptions};
use parley_core::ConfirmationGate;
use parley_db::repositories::{
    SqlCatalogRepository, SqlConversationLockRepository, SqlConversationRepository,
    SqlDeadLetterRepository, SqlInboundEventRepository, SqlMessageRepository,
    SqlSessionRepository,
};
use parley_db::{connect_with_settings, migrations, DbPool, SessionStore};
use parley_ingest::{
    engine_from_config, IngestionPipeline, NoopOutboundChannel, PipelineRepositories,
    PipelineSettings,
};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
}

/// `(error_class, message, exit_code)` carried out of an async command body.
pub(crate) type CommandFailure = (&'static str, String, u8);

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\
             \"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Loads config, connects, applies migrations and runs `body` on a
/// current-thread runtime. Exit codes: 2 config, 3 runtime, 4 database,
/// 5 migration; the body picks its own codes from 6 up.
pub(crate) fn with_database<F, Fut>(command: &str, body: F) -> CommandResult
where
    F: FnOnce(AppConfig, DbPool) -> Fut,
    Fut: Future<Output = Result<String, CommandFailure>>,
{
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                command,
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let outcome = body(config, pool.clone()).await;
        pool.close().await;
        outcome
    });

    match result {
        Ok(message) => CommandResult::success(command, message),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure(command, error_class, message, exit_code)
        }
    }
}

/// A pipeline for operator actions only. It never runs turns, so reasoning
/// stays disabled and replies go nowhere.
pub(crate) fn operator_pipeline(
    config: &AppConfig,
    pool: &DbPool,
) -> Result<IngestionPipeline, CommandFailure> {
    let session_ttl = i64::try_from(config.session.ttl_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or_else(|| Duration::hours(24));
    let sessions =
        SessionStore::new(Arc::new(SqlSessionRepository::new(pool.clone()))).with_ttl(session_ttl);
    let gate = ConfirmationGate::new()
        .map_err(|error| ("pipeline_init", error.to_string(), 6u8))?;

    let orchestrator = Orchestrator::new(
        sessions,
        Arc::new(SqlMessageRepository::new(pool.clone())),
        Arc::new(SqlCatalogRepository::new(pool.clone())),
        Arc::new(DisabledReasoningClient),
        Arc::new(ToolRegistry::with_cart_tools()),
        gate,
    );

    Ok(IngestionPipeline::new(
        engine_from_config(config),
        PipelineRepositories {
            inbound: Arc::new(SqlInboundEventRepository::new(pool.clone())),
            locks: Arc::new(SqlConversationLockRepository::new(pool.clone())),
            conversations: Arc::new(SqlConversationRepository::new(pool.clone())),
            dead_letters: Arc::new(SqlDeadLetterRepository::new(pool.clone())),
        },
        Arc::new(orchestrator),
        Arc::new(NoopOutboundChannel),
    )
    .with_settings(PipelineSettings::from_config(config)))
}
