use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Defaults mirrored from the reasoning/session/scheduler contracts: the
// numbers below are not arbitrary, they are the fallbacks every
// session/task/scheduler config is silent on.
pub const DEFAULT_MAX_HISTORY: usize = 200;
pub const DEFAULT_SESSION_TIMEOUT_MINUTES: u64 = 120;
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;
pub const DEFAULT_FALLBACK_CONTEXT_TOKENS: u64 = 124_000;
pub const DEFAULT_SCHEDULER_TICK_SECS: u64 = 2;
pub const DEFAULT_ADVANCE_SECONDS: i64 = 20;
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;
pub const DEFAULT_SESSION_SAVE_DELAY_SECS: u64 = 5;
pub const DEFAULT_SESSION_CLEANUP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 15;

/// Top-level config (`conduit.toml` + `CONDUIT_*` env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub session: SessionDefaults,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub data: DataConfig,
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            session: SessionDefaults::default(),
            reasoning: ReasoningConfig::default(),
            scheduler: SchedulerConfig::default(),
            providers: ProvidersConfig::default(),
            worker: WorkerConfig::default(),
            data: DataConfig::default(),
        }
    }
}

impl ConduitConfig {
    /// Load config from a TOML file with `CONDUIT_*` env var overrides.
    ///
    /// Checks, in order: an explicit path argument, then
    /// `~/.conduit/conduit.toml`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ConduitConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CONDUIT_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.conduit/conduit.toml", home)
}

/// HTTP-SSE + CLI adapter bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bounded channel capacity for the inbound message queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Typing-indicator re-send cadence while a turn is in flight.
    #[serde(default = "default_typing_interval_secs")]
    pub typing_interval_secs: u64,
    /// Reply is split on newline boundaries past this length.
    #[serde(default = "default_max_reply_chars")]
    pub max_reply_chars: usize,
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            queue_capacity: default_queue_capacity(),
            typing_interval_secs: default_typing_interval_secs(),
            max_reply_chars: default_max_reply_chars(),
            send_retries: default_send_retries(),
        }
    }
}

fn default_port() -> u16 {
    8099
}
fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_typing_interval_secs() -> u64 {
    4
}
fn default_max_reply_chars() -> usize {
    4000
}
fn default_send_retries() -> u32 {
    3
}

/// Global session defaults; a session's own `config` overrides these
/// field-by-field when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDefaults {
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "bool_true")]
    pub auto_summarize: bool,
    #[serde(default = "default_save_delay_secs")]
    pub save_delay_seconds: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_seconds: u64,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            timeout_minutes: default_timeout_minutes(),
            language: default_language(),
            auto_summarize: true,
            save_delay_seconds: default_save_delay_secs(),
            cleanup_interval_seconds: default_cleanup_interval_secs(),
        }
    }
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}
fn default_timeout_minutes() -> u64 {
    DEFAULT_SESSION_TIMEOUT_MINUTES
}
fn default_language() -> String {
    "zh".to_string()
}
fn default_save_delay_secs() -> u64 {
    DEFAULT_SESSION_SAVE_DELAY_SECS
}
fn default_cleanup_interval_secs() -> u64 {
    DEFAULT_SESSION_CLEANUP_INTERVAL_SECS
}
fn bool_true() -> bool {
    true
}

/// Reasoning engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_fallback_model")]
    pub fallback_model: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_fallback_context_tokens")]
    pub fallback_context_tokens: u64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            fallback_model: default_fallback_model(),
            max_iterations: default_max_iterations(),
            fallback_context_tokens: default_fallback_context_tokens(),
        }
    }
}

fn default_model() -> String {
    "primary".to_string()
}
fn default_fallback_model() -> Option<String> {
    None
}
fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}
fn default_fallback_context_tokens() -> u64 {
    DEFAULT_FALLBACK_CONTEXT_TOKENS
}

/// Scheduler tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_seconds: u64,
    #[serde(default = "default_advance_seconds")]
    pub advance_seconds: i64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_fail_quarantine")]
    pub fail_quarantine_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_secs(),
            advance_seconds: default_advance_seconds(),
            max_concurrent: default_max_concurrent(),
            fail_quarantine_threshold: default_fail_quarantine(),
        }
    }
}

fn default_tick_secs() -> u64 {
    DEFAULT_SCHEDULER_TICK_SECS
}
fn default_advance_seconds() -> i64 {
    DEFAULT_ADVANCE_SECONDS
}
fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_TASKS
}
fn default_fail_quarantine() -> u32 {
    5
}

/// Optional multi-process Master-Worker orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,
    #[serde(default = "default_bus_endpoint")]
    pub command_endpoint: String,
    #[serde(default = "default_pub_endpoint")]
    pub event_endpoint: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            heartbeat_timeout_seconds: default_heartbeat_timeout(),
            command_endpoint: default_bus_endpoint(),
            event_endpoint: default_pub_endpoint(),
        }
    }
}

fn default_min_workers() -> usize {
    1
}
fn default_max_workers() -> usize {
    4
}
fn default_heartbeat_timeout() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT_SECS
}
fn default_bus_endpoint() -> String {
    "ipc:///tmp/conduit-master-cmd.sock".to_string()
}
fn default_pub_endpoint() -> String {
    "ipc:///tmp/conduit-master-events.sock".to_string()
}

/// Filesystem layout for the JSON persistence files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub root: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.conduit/data", home)
}

impl DataConfig {
    pub fn sessions_file(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.root).join("sessions/sessions.json")
    }
    pub fn tasks_file(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.root).join("scheduler/tasks.json")
    }
    pub fn executions_file(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.root).join("scheduler/executions.json")
    }
    pub fn registry_file(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.root).join("orchestration/registry.json")
    }
    pub fn traces_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.root).join("traces")
    }
}

/// `Brain` provider configuration: a named list of LLM endpoints with
/// failover order, so the reasoning engine can fall back to a secondary
/// provider without restarting.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub anthropic: Option<AnthropicConfig>,
    pub openai: Option<OpenAiProviderConfig>,
    pub ollama: Option<OllamaConfig>,
    #[serde(default)]
    pub openai_compat: Vec<OpenAiCompatEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiCompatEntry {
    pub id: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub chat_path: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiProviderConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}
