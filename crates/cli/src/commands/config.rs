use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use parley_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// Effective configuration with the source of each value. Secrets are never
/// printed, only whether they are set.
pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let file_path = detect_config_path();
    let file_doc = load_config_file_doc(file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value) in entries(&config) {
        let source = field_source(key, &env_key(key), file_doc.as_ref(), file_path.as_deref());
        lines.push(format!("- {key} = {value} (source: {source})"));
    }
    lines.join("\n")
}

fn entries(config: &AppConfig) -> Vec<(&'static str, String)> {
    vec![
        ("database.url", config.database.url.clone()),
        ("database.max_connections", config.database.max_connections.to_string()),
        ("database.timeout_secs", config.database.timeout_secs.to_string()),
        ("llm.provider", format!("{:?}", config.llm.provider)),
        ("llm.model", config.llm.model.clone()),
        ("llm.base_url", config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string())),
        ("llm.api_key", presence(config.llm.api_key.is_some())),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string()),
        ("llm.max_tokens", config.llm.max_tokens.to_string()),
        ("server.bind_address", config.server.bind_address.clone()),
        ("server.port", config.server.port.to_string()),
        ("server.graceful_shutdown_secs", config.server.graceful_shutdown_secs.to_string()),
        ("ingestion.coalesce_window_ms", config.ingestion.coalesce_window_ms.to_string()),
        ("ingestion.max_batch_size", config.ingestion.max_batch_size.to_string()),
        ("ingestion.lock_ttl_secs", config.ingestion.lock_ttl_secs.to_string()),
        ("ingestion.worker_count", config.ingestion.worker_count.to_string()),
        ("ingestion.max_retries", config.ingestion.max_retries.to_string()),
        ("ingestion.webhook_secret", presence(config.ingestion.webhook_secret.is_some())),
        (
            "outbound.webhook_url",
            config.outbound.webhook_url.clone().unwrap_or_else(|| "<unset>".to_string()),
        ),
        ("agent.max_iterations", config.agent.max_iterations.to_string()),
        ("agent.failure_threshold", config.agent.failure_threshold.to_string()),
        ("session.ttl_secs", config.session.ttl_secs.to_string()),
        ("tools.remote", format!("{} configured", config.tools.remote.len())),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", format!("{:?}", config.logging.format)),
    ]
}

fn presence(is_set: bool) -> String {
    if is_set { "<redacted>" } else { "<unset>" }.to_string()
}

/// `ingestion.worker_count` -> `PARLEY_INGESTION_WORKER_COUNT`
fn env_key(key_path: &str) -> String {
    format!("PARLEY_{}", key_path.replace('.', "_").to_uppercase())
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("parley.toml"), PathBuf::from("config/parley.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    file_doc: Option<&Value>,
    file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if file_doc.is_some_and(|doc| contains_path(doc, key_path)) {
        let file_path = file_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string());
        return format!("file ({file_path})");
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}
