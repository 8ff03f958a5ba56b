//! Layered configuration for modelsmith.
//!
//! Values are resolved in this order, later layers winning:
//! defaults → `modelsmith.toml` → environment (`MODELSMITH_*`,
//! `OPENAI_API_KEY`, plus anything loaded from `.env`) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! allowed_origins = ["http://localhost:3000"]
//!
//! [llm]
//! api_base = "https://api.openai.com/v1"
//! model = "gpt-4-turbo"
//! request_timeout_secs = 60
//! max_retries = 3
//!
//! [prompt]
//! token_budget = 6000
//! max_history_messages = 10
//!
//! [sandbox]
//! backend = "docker"
//! image = "python:3.12-slim"
//! timeout_ms = 10000
//! memory_mb = 512
//!
//! [sessions]
//! max_messages = 200
//! max_conversations = 10000
//! idle_ttl_secs = 86400
//!
//! [store]
//! db_path = ".modelsmith/models.db"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! directory = "logs"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "modelsmith.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub llm: LlmSection,
    pub prompt: PromptSection,
    pub sandbox: SandboxSection,
    pub sessions: SessionSection,
    pub store: StoreSection,
    pub logging: LoggingSection,
}

// ── Sections ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for local frontend development.
    pub dev_mode: bool,
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            dev_mode: false,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:8000".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub api_base: String,
    /// Never written back out by `config show`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Sampling temperature for code generation.
    pub temperature: f32,
    pub max_tokens: u32,
    /// Sampling temperature for plain chat turns.
    pub chat_temperature: f32,
    pub chat_max_tokens: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4-turbo".to_string(),
            request_timeout_secs: 60,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            temperature: 0.2,
            max_tokens: 2000,
            chat_temperature: 0.7,
            chat_max_tokens: 800,
        }
    }
}

impl LlmSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSection {
    pub token_budget: usize,
    pub max_history_messages: usize,
}

impl Default for PromptSection {
    fn default() -> Self {
        Self {
            token_budget: 6000,
            max_history_messages: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackendKind {
    /// Local interpreter in its own process group with rlimits.
    #[default]
    Process,
    /// Throwaway Docker container per execution.
    Docker,
}

impl std::fmt::Display for SandboxBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxBackendKind::Process => write!(f, "process"),
            SandboxBackendKind::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for SandboxBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(SandboxBackendKind::Process),
            "docker" => Ok(SandboxBackendKind::Docker),
            _ => anyhow::bail!(
                "Invalid sandbox backend '{}'. Valid values: process, docker",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub backend: SandboxBackendKind,
    /// Interpreter command for the process backend; the program arrives on stdin.
    pub interpreter: Vec<String>,
    pub image: String,
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: i64,
    pub max_output_bytes: usize,
    /// PATH handed to the otherwise empty child environment.
    pub path_env: String,
    /// Run process-backend children in their own user and network
    /// namespaces (Linux only).
    pub isolate_network: bool,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            backend: SandboxBackendKind::Process,
            interpreter: vec!["python3".to_string(), "-I".to_string(), "-".to_string()],
            image: "python:3.12-slim".to_string(),
            timeout_ms: 10_000,
            memory_mb: 1024,
            cpus: 1.0,
            pids_limit: 64,
            max_output_bytes: 256 * 1024,
            path_env: "/usr/local/bin:/usr/bin:/bin".to_string(),
            isolate_network: true,
        }
    }
}

impl SandboxSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub max_messages: usize,
    /// Upper bound on live conversations; the least recently used go first.
    pub max_conversations: usize,
    /// Conversations idle for longer than this are dropped. Zero disables.
    pub idle_ttl_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_messages: 200,
            max_conversations: 10_000,
            idle_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl SessionSection {
    pub fn idle_ttl(&self) -> Option<Duration> {
        (self.idle_ttl_secs > 0).then(|| Duration::from_secs(self.idle_ttl_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub db_path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".modelsmith/models.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    /// When set, logs are also written to a daily rolling file here.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            directory: None,
        }
    }
}

// ── Overrides from the command line ──────────────────────────────────

/// Values passed as CLI flags. `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub sandbox_backend: Option<SandboxBackendKind>,
    pub dev_mode: bool,
    pub verbose: bool,
}

// ── Loading ───────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse modelsmith.toml")
    }

    /// Load from `path` when it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Full layered resolution used by the binary.
    pub fn resolve(config_path: Option<&Path>, cli: &CliOverrides) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = match config_path {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(Path::new(CONFIG_FILE))?,
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.apply_cli(cli);
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MODELSMITH_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("MODELSMITH_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid MODELSMITH_PORT '{}'", port))?;
        }
        if let Some(origins) = lookup("MODELSMITH_ALLOWED_ORIGINS") {
            self.server.allowed_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(base) = lookup("MODELSMITH_LLM_API_BASE") {
            self.llm.api_base = base;
        }
        if let Some(model) = lookup("OPENAI_MODEL").or_else(|| lookup("MODELSMITH_LLM_MODEL")) {
            self.llm.model = model;
        }
        if let Some(backend) = lookup("MODELSMITH_SANDBOX_BACKEND") {
            self.sandbox.backend = backend.parse()?;
        }
        if let Some(image) = lookup("MODELSMITH_SANDBOX_IMAGE") {
            self.sandbox.image = image;
        }
        if let Some(db_path) = lookup("MODELSMITH_DB_PATH") {
            self.store.db_path = PathBuf::from(db_path);
        }
        if let Some(level) = lookup("MODELSMITH_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("MODELSMITH_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(ref host) = cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(ref db_path) = cli.db_path {
            self.store.db_path = db_path.clone();
        }
        if let Some(backend) = cli.sandbox_backend {
            self.sandbox.backend = backend;
        }
        if cli.dev_mode {
            self.server.dev_mode = true;
        }
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.llm.api_key.is_none() {
            warnings.push(
                "OPENAI_API_KEY is not set; generation requests will fail".to_string(),
            );
        }
        if self.llm.max_backoff_ms < self.llm.initial_backoff_ms {
            warnings.push(format!(
                "llm.max_backoff_ms ({}) is below llm.initial_backoff_ms ({})",
                self.llm.max_backoff_ms, self.llm.initial_backoff_ms
            ));
        }
        if self.prompt.max_history_messages == 0 {
            warnings.push("prompt.max_history_messages is 0; history is never sent".to_string());
        }
        if self.sandbox.timeout_ms == 0 {
            warnings.push("sandbox.timeout_ms is 0; every execution will time out".to_string());
        }
        if self.sandbox.interpreter.is_empty() {
            warnings.push("sandbox.interpreter is empty".to_string());
        }
        if self.sessions.max_messages == 0 {
            warnings.push("sessions.max_messages is 0; conversations keep nothing".to_string());
        }
        if self.sessions.max_conversations == 0 {
            warnings.push(
                "sessions.max_conversations is 0; every conversation is evicted at once".to_string(),
            );
        }
        if self.sandbox.backend == SandboxBackendKind::Process && !self.sandbox.isolate_network {
            warnings.push(
                "sandbox.isolate_network is off; the process backend relies on the interpreter guard alone"
                    .to_string(),
            );
        }

        warnings
    }

    /// TOML rendering for `config show`. The API key is never included.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.llm.model, "gpt-4-turbo");
        assert_eq!(config.prompt.max_history_messages, 10);
        assert_eq!(config.sandbox.backend, SandboxBackendKind::Process);
        assert_eq!(config.store.db_path, PathBuf::from(".modelsmith/models.db"));
    }

    #[test]
    fn test_parse_empty() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.sandbox.timeout_ms, 10_000);
    }

    #[test]
    fn test_parse_partial_sections_keep_defaults() {
        let config = AppConfig::parse(
            r#"
[sandbox]
backend = "docker"
memory_mb = 256

[llm]
max_retries = 5
"#,
        )
        .unwrap();
        assert_eq!(config.sandbox.backend, SandboxBackendKind::Docker);
        assert_eq!(config.sandbox.memory_mb, 256);
        assert_eq!(config.sandbox.image, "python:3.12-slim");
        assert_eq!(config.llm.max_retries, 5);
        assert_eq!(config.llm.initial_backoff_ms, 500);
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(AppConfig::parse("not valid toml {{{{").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[server]\nport = 9100\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = AppConfig::parse("[server]\nport = 9100\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("MODELSMITH_PORT", "9200"),
            ("OPENAI_API_KEY", "sk-test"),
            ("MODELSMITH_SANDBOX_BACKEND", "docker"),
            ("MODELSMITH_ALLOWED_ORIGINS", "http://a.test, http://b.test"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.sandbox.backend, SandboxBackendKind::Docker);
        assert_eq!(config.server.allowed_origins.len(), 2);
    }

    #[test]
    fn test_env_rejects_bad_port() {
        let mut config = AppConfig::default();
        let result = config.apply_env_from(|k| {
            (k == "MODELSMITH_PORT").then(|| "eighty".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = AppConfig::default();
        config
            .apply_env_from(|k| (k == "MODELSMITH_PORT").then(|| "9200".to_string()))
            .unwrap();
        config.apply_cli(&CliOverrides {
            port: Some(9300),
            verbose: true,
            ..Default::default()
        });
        assert_eq!(config.server.port, 9300);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validate_warns_without_api_key() {
        let config = AppConfig::default();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("OPENAI_API_KEY")));
    }

    #[test]
    fn test_validate_warns_about_unisolated_process_backend() {
        let config = AppConfig::parse("[sandbox]\nisolate_network = false\n").unwrap();
        assert!(config.validate().iter().any(|w| w.contains("isolate_network")));
        let defaults = AppConfig::default().validate();
        assert!(!defaults.iter().any(|w| w.contains("isolate_network")));
    }

    #[test]
    fn test_session_limits() {
        let config = AppConfig::parse("[sessions]\nmax_conversations = 5\nidle_ttl_secs = 0\n").unwrap();
        assert_eq!(config.sessions.max_conversations, 5);
        assert_eq!(config.sessions.max_messages, 200);
        assert!(config.sessions.idle_ttl().is_none());
        assert_eq!(
            AppConfig::default().sessions.idle_ttl(),
            Some(Duration::from_secs(86_400))
        );
    }

    #[test]
    fn test_to_toml_omits_api_key() {
        let mut config = AppConfig::default();
        config.llm.api_key = Some("sk-secret".to_string());
        let rendered = config.to_toml().unwrap();
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("gpt-4-turbo"));
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!(
            "Docker".parse::<SandboxBackendKind>().unwrap(),
            SandboxBackendKind::Docker
        );
        assert!("vm".parse::<SandboxBackendKind>().is_err());
    }
}
