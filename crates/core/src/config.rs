use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::session::ConversationMode;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub ingestion: IngestionConfig,
    pub outbound: OutboundConfig,
    pub agent: AgentConfig,
    pub session: SessionConfig,
    pub tools: ToolsConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct IngestionConfig {
    pub coalesce_window_ms: u64,
    pub max_batch_size: usize,
    pub lock_ttl_secs: u64,
    pub requeue_delay_ms: u64,
    pub worker_count: usize,
    pub poll_interval_ms: u64,
    pub claim_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
    pub webhook_secret: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct OutboundConfig {
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub history_window: usize,
    pub history_max_age_hours: u64,
    pub confirmation_ttl_secs: u64,
    pub failure_threshold: u32,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub ttl_secs: u64,
}

#[derive(Clone, Debug, Default)]
pub struct ToolsConfig {
    pub remote: Vec<RemoteToolConfig>,
}

/// A tool executed by POSTing its input to an external endpoint.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RemoteToolConfig {
    pub name: String,
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default = "default_tool_modes")]
    pub modes: Vec<ConversationMode>,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_tool_modes() -> Vec<ConversationMode> {
    vec![ConversationMode::Ordering]
}

fn default_tool_timeout_secs() -> u64 {
    10
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Anthropic,
    /// No reasoning service; only deterministic paths answer.
    Disabled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub server_port: Option<u16>,
    pub worker_count: Option<usize>,
    pub webhook_secret: Option<String>,
    pub outbound_webhook_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://parley.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Disabled,
                api_key: None,
                base_url: None,
                model: "claude-sonnet-4-5".to_string(),
                timeout_secs: 30,
                max_tokens: 1024,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            ingestion: IngestionConfig {
                coalesce_window_ms: 7_500,
                max_batch_size: 5,
                lock_ttl_secs: 330,
                requeue_delay_ms: 2_000,
                worker_count: 4,
                poll_interval_ms: 500,
                claim_timeout_secs: 360,
                max_retries: 3,
                retry_base_delay_secs: 5,
                webhook_secret: None,
            },
            outbound: OutboundConfig { webhook_url: None, timeout_secs: 10 },
            agent: AgentConfig {
                max_iterations: 10,
                history_window: 20,
                history_max_age_hours: 24,
                confirmation_ttl_secs: 15 * 60,
                failure_threshold: 2,
            },
            session: SessionConfig { ttl_secs: 24 * 60 * 60 },
            tools: ToolsConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "disabled" | "none" => Ok(Self::Disabled),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected anthropic|disabled)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("parley.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_tokens) = llm.max_tokens {
                self.llm.max_tokens = max_tokens;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(ingestion) = patch.ingestion {
            if let Some(value) = ingestion.coalesce_window_ms {
                self.ingestion.coalesce_window_ms = value;
            }
            if let Some(value) = ingestion.max_batch_size {
                self.ingestion.max_batch_size = value;
            }
            if let Some(value) = ingestion.lock_ttl_secs {
                self.ingestion.lock_ttl_secs = value;
            }
            if let Some(value) = ingestion.requeue_delay_ms {
                self.ingestion.requeue_delay_ms = value;
            }
            if let Some(value) = ingestion.worker_count {
                self.ingestion.worker_count = value;
            }
            if let Some(value) = ingestion.poll_interval_ms {
                self.ingestion.poll_interval_ms = value;
            }
            if let Some(value) = ingestion.claim_timeout_secs {
                self.ingestion.claim_timeout_secs = value;
            }
            if let Some(value) = ingestion.max_retries {
                self.ingestion.max_retries = value;
            }
            if let Some(value) = ingestion.retry_base_delay_secs {
                self.ingestion.retry_base_delay_secs = value;
            }
            if let Some(webhook_secret_value) = ingestion.webhook_secret {
                self.ingestion.webhook_secret = Some(secret_value(webhook_secret_value));
            }
        }

        if let Some(outbound) = patch.outbound {
            if let Some(webhook_url) = outbound.webhook_url {
                self.outbound.webhook_url = Some(webhook_url);
            }
            if let Some(timeout_secs) = outbound.timeout_secs {
                self.outbound.timeout_secs = timeout_secs;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(value) = agent.max_iterations {
                self.agent.max_iterations = value;
            }
            if let Some(value) = agent.history_window {
                self.agent.history_window = value;
            }
            if let Some(value) = agent.history_max_age_hours {
                self.agent.history_max_age_hours = value;
            }
            if let Some(value) = agent.confirmation_ttl_secs {
                self.agent.confirmation_ttl_secs = value;
            }
            if let Some(value) = agent.failure_threshold {
                self.agent.failure_threshold = value;
            }
        }

        if let Some(session) = patch.session {
            if let Some(ttl_secs) = session.ttl_secs {
                self.session.ttl_secs = ttl_secs;
            }
        }

        if let Some(tools) = patch.tools {
            self.tools.remote = tools.remote;
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PARLEY_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("PARLEY_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("PARLEY_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("PARLEY_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PARLEY_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("PARLEY_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("PARLEY_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("PARLEY_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("PARLEY_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("PARLEY_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_LLM_MAX_TOKENS") {
            self.llm.max_tokens = parse_u32("PARLEY_LLM_MAX_TOKENS", &value)?;
        }

        if let Some(value) = read_env("PARLEY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PARLEY_SERVER_PORT") {
            self.server.port = parse_u16("PARLEY_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("PARLEY_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("PARLEY_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("PARLEY_INGESTION_COALESCE_WINDOW_MS") {
            self.ingestion.coalesce_window_ms =
                parse_u64("PARLEY_INGESTION_COALESCE_WINDOW_MS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_INGESTION_MAX_BATCH_SIZE") {
            self.ingestion.max_batch_size =
                parse_u32("PARLEY_INGESTION_MAX_BATCH_SIZE", &value)? as usize;
        }
        if let Some(value) = read_env("PARLEY_INGESTION_LOCK_TTL_SECS") {
            self.ingestion.lock_ttl_secs = parse_u64("PARLEY_INGESTION_LOCK_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_INGESTION_WORKER_COUNT") {
            self.ingestion.worker_count =
                parse_u32("PARLEY_INGESTION_WORKER_COUNT", &value)? as usize;
        }
        if let Some(value) = read_env("PARLEY_INGESTION_MAX_RETRIES") {
            self.ingestion.max_retries = parse_u32("PARLEY_INGESTION_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("PARLEY_INGESTION_WEBHOOK_SECRET") {
            self.ingestion.webhook_secret = Some(secret_value(value));
        }

        if let Some(value) = read_env("PARLEY_OUTBOUND_WEBHOOK_URL") {
            self.outbound.webhook_url = Some(value);
        }

        if let Some(value) = read_env("PARLEY_AGENT_MAX_ITERATIONS") {
            self.agent.max_iterations = parse_u32("PARLEY_AGENT_MAX_ITERATIONS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_AGENT_FAILURE_THRESHOLD") {
            self.agent.failure_threshold = parse_u32("PARLEY_AGENT_FAILURE_THRESHOLD", &value)?;
        }

        if let Some(value) = read_env("PARLEY_SESSION_TTL_SECS") {
            self.session.ttl_secs = parse_u64("PARLEY_SESSION_TTL_SECS", &value)?;
        }

        let log_level = read_env("PARLEY_LOGGING_LEVEL").or_else(|| read_env("PARLEY_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PARLEY_LOGGING_FORMAT").or_else(|| read_env("PARLEY_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(worker_count) = overrides.worker_count {
            self.ingestion.worker_count = worker_count;
        }
        if let Some(webhook_secret) = overrides.webhook_secret {
            self.ingestion.webhook_secret = Some(secret_value(webhook_secret));
        }
        if let Some(webhook_url) = overrides.outbound_webhook_url {
            self.outbound.webhook_url = Some(webhook_url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_ingestion(&self.ingestion)?;
        validate_outbound(&self.outbound)?;
        validate_agent(&self.agent, &self.session)?;
        validate_turn_budget(self)?;
        validate_tools(&self.tools)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("parley.toml"), PathBuf::from("config/parley.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.max_tokens == 0 {
        return Err(ConfigError::Validation(
            "llm.max_tokens must be greater than zero".to_string(),
        ));
    }

    if llm.provider == LlmProvider::Anthropic {
        let missing = llm
            .api_key
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing {
            return Err(ConfigError::Validation(
                "llm.api_key is required for the anthropic provider".to_string(),
            ));
        }
    }

    if let Some(base_url) = &llm.base_url {
        if !is_http_url(base_url) {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_ingestion(ingestion: &IngestionConfig) -> Result<(), ConfigError> {
    if ingestion.max_batch_size == 0 {
        return Err(ConfigError::Validation(
            "ingestion.max_batch_size must be greater than zero".to_string(),
        ));
    }

    if ingestion.worker_count == 0 || ingestion.worker_count > 64 {
        return Err(ConfigError::Validation(
            "ingestion.worker_count must be in range 1..=64".to_string(),
        ));
    }

    if ingestion.lock_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "ingestion.lock_ttl_secs must be greater than zero".to_string(),
        ));
    }

    if ingestion.lock_ttl_secs * 1_000 <= ingestion.coalesce_window_ms {
        return Err(ConfigError::Validation(
            "ingestion.lock_ttl_secs must outlast ingestion.coalesce_window_ms".to_string(),
        ));
    }

    if ingestion.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "ingestion.poll_interval_ms must be greater than zero".to_string(),
        ));
    }

    if ingestion.claim_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "ingestion.claim_timeout_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

/// A held lease or claim must outlive the longest turn: the coalescing wait
/// plus every reasoning step running to its timeout.
fn validate_turn_budget(config: &AppConfig) -> Result<(), ConfigError> {
    let turn_budget_ms = config.ingestion.coalesce_window_ms.saturating_add(
        u64::from(config.agent.max_iterations).saturating_mul(config.llm.timeout_secs * 1_000),
    );

    if config.ingestion.lock_ttl_secs.saturating_mul(1_000) <= turn_budget_ms {
        return Err(ConfigError::Validation(format!(
            "ingestion.lock_ttl_secs must exceed the worst-case turn of {turn_budget_ms}ms \
             (coalesce_window_ms + agent.max_iterations * llm.timeout_secs)"
        )));
    }

    if config.ingestion.claim_timeout_secs.saturating_mul(1_000) <= turn_budget_ms {
        return Err(ConfigError::Validation(format!(
            "ingestion.claim_timeout_secs must exceed the worst-case turn of {turn_budget_ms}ms \
             (coalesce_window_ms + agent.max_iterations * llm.timeout_secs)"
        )));
    }

    Ok(())
}

fn validate_outbound(outbound: &OutboundConfig) -> Result<(), ConfigError> {
    if let Some(url) = &outbound.webhook_url {
        if !is_http_url(url) {
            return Err(ConfigError::Validation(
                "outbound.webhook_url must start with http:// or https://".to_string(),
            ));
        }
    }

    if outbound.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "outbound.timeout_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig, session: &SessionConfig) -> Result<(), ConfigError> {
    if agent.max_iterations == 0 || agent.max_iterations > 50 {
        return Err(ConfigError::Validation(
            "agent.max_iterations must be in range 1..=50".to_string(),
        ));
    }

    if agent.history_window == 0 {
        return Err(ConfigError::Validation(
            "agent.history_window must be greater than zero".to_string(),
        ));
    }

    if agent.confirmation_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "agent.confirmation_ttl_secs must be greater than zero".to_string(),
        ));
    }

    if agent.failure_threshold == 0 {
        return Err(ConfigError::Validation(
            "agent.failure_threshold must be greater than zero".to_string(),
        ));
    }

    if session.ttl_secs < agent.confirmation_ttl_secs {
        return Err(ConfigError::Validation(
            "session.ttl_secs must be at least agent.confirmation_ttl_secs".to_string(),
        ));
    }

    Ok(())
}

fn validate_tools(tools: &ToolsConfig) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for tool in &tools.remote {
        if tool.name.trim().is_empty() {
            let message = "tools.remote[].name must not be empty".to_string();
            return Err(ConfigError::Validation(message));
        }
        if !seen.insert(tool.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "tools.remote contains duplicate tool `{}`",
                tool.name
            )));
        }
        if !is_http_url(&tool.url) {
            return Err(ConfigError::Validation(format!(
                "tools.remote `{}` url must start with http:// or https://",
                tool.name
            )));
        }
        if tool.modes.is_empty() {
            return Err(ConfigError::Validation(format!(
                "tools.remote `{}` must be enabled for at least one mode",
                tool.name
            )));
        }
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    ingestion: Option<IngestionPatch>,
    outbound: Option<OutboundPatch>,
    agent: Option<AgentPatch>,
    session: Option<SessionPatch>,
    tools: Option<ToolsPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct IngestionPatch {
    coalesce_window_ms: Option<u64>,
    max_batch_size: Option<usize>,
    lock_ttl_secs: Option<u64>,
    requeue_delay_ms: Option<u64>,
    worker_count: Option<usize>,
    poll_interval_ms: Option<u64>,
    claim_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_base_delay_secs: Option<u64>,
    webhook_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OutboundPatch {
    webhook_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    max_iterations: Option<u32>,
    history_window: Option<usize>,
    history_max_age_hours: Option<u64>,
    confirmation_ttl_secs: Option<u64>,
    failure_threshold: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionPatch {
    ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolsPatch {
    #[serde(default)]
    remote: Vec<RemoteToolConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
