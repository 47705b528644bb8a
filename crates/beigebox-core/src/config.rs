use std::collections::BTreeMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{BeigeBoxError, Result};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Top-level config (beigebox.toml + BEIGEBOX_* env overrides).
///
/// Loaded once at startup and treated as read-only afterwards. Hot-mutable
/// settings live in the runtime overlay instead (see `runtime.rs`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeigeBoxConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: PrimaryBackendConfig,
    #[serde(default)]
    pub backends: Vec<BackendEntry>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub decision_llm: DecisionLlmConfig,
    #[serde(default)]
    pub embedding_classifier: EmbeddingClassifierConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub wiretap: WiretapConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub model_advertising: ModelAdvertisingConfig,
    #[serde(default)]
    pub auto_summarization: AutoSummarizationConfig,
    #[serde(default)]
    pub system_context: SystemContextConfig,
    #[serde(default)]
    pub operator: OperatorConfig,
    #[serde(default)]
    pub harness: HarnessConfig,
    #[serde(default)]
    pub runtime_overlay: RuntimeOverlayConfig,
}

impl Default for BeigeBoxConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            backend: PrimaryBackendConfig::default(),
            backends: Vec::new(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            decision_llm: DecisionLlmConfig::default(),
            embedding_classifier: EmbeddingClassifierConfig::default(),
            routing: RoutingConfig::default(),
            wiretap: WiretapConfig::default(),
            tools: ToolsConfig::default(),
            hooks: HooksConfig::default(),
            model_advertising: ModelAdvertisingConfig::default(),
            auto_summarization: AutoSummarizationConfig::default(),
            system_context: SystemContextConfig::default(),
            operator: OperatorConfig::default(),
            harness: HarnessConfig::default(),
            runtime_overlay: RuntimeOverlayConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_bind(), port: default_port() }
    }
}

/// The primary (usually local) backend — also the endpoint the arbitrator,
/// summarizer, and agent loops talk to directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryBackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,
    #[serde(default)]
    pub default_model: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for PrimaryBackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            default_model: String::new(),
            timeout: default_timeout(),
        }
    }
}

/// One entry in the multi-backend dispatcher list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEntry {
    /// "local", "openai_compat", or "metered".
    pub provider: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    /// May contain `${ENV_VAR}` references, resolved at construction.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "default_vector_path")]
    pub vector_path: String,
    #[serde(default = "bool_true")]
    pub log_conversations: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            vector_path: default_vector_path(),
            log_conversations: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embed_model")]
    pub model: String,
    /// Defaults to the primary backend URL when empty.
    #[serde(default)]
    pub backend_url: String,
    #[serde(default = "default_embed_dimension")]
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embed_model(),
            backend_url: String::new(),
            dimension: default_embed_dimension(),
        }
    }
}

/// A named route resolving to a concrete model string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub model: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DecisionLlmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub model: String,
    /// Defaults to the primary backend URL when empty.
    #[serde(default)]
    pub backend_url: String,
    #[serde(default = "default_decision_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub routes: BTreeMap<String, RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingClassifierConfig {
    #[serde(default = "default_classifier_threshold")]
    pub threshold: f32,
    #[serde(default = "default_centroid_dir")]
    pub centroid_dir: String,
}

impl Default for EmbeddingClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: default_classifier_threshold(),
            centroid_dir: default_centroid_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { session_ttl_seconds: default_session_ttl() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WiretapConfig {
    #[serde(default = "default_wire_path")]
    pub path: String,
}

impl Default for WiretapConfig {
    fn default() -> Self {
        Self { path: default_wire_path() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub memory: MemoryToolConfig,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: String::new(),
            plugins: PluginsConfig::default(),
            web_search: WebSearchConfig::default(),
            memory: MemoryToolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_plugins_dir")]
    pub path: String,
    /// Plugin names disabled in config; absent = enabled.
    #[serde(default)]
    pub disabled: Vec<String>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_plugins_dir(),
            disabled: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_search_results")]
    pub max_results: usize,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            max_results: default_search_results(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryToolConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_memory_results")]
    pub max_results: usize,
    #[serde(default = "default_memory_min_score")]
    pub min_score: f32,
}

impl Default for MemoryToolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_results: default_memory_results(),
            min_score: default_memory_min_score(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Built-in hook names to run, in pipeline order.
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default = "default_injection_threshold")]
    pub prompt_injection_threshold: f32,
    /// "flag" annotates and lets the request through; "block" refuses it.
    #[serde(default = "default_injection_mode")]
    pub prompt_injection_mode: String,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            enabled: Vec::new(),
            prompt_injection_threshold: default_injection_threshold(),
            prompt_injection_mode: default_injection_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAdvertisingConfig {
    /// "hidden" (pass names through) or "advertise" (prefix them).
    #[serde(default = "default_advertising_mode")]
    pub mode: String,
    #[serde(default = "default_advertising_prefix")]
    pub prefix: String,
}

impl Default for ModelAdvertisingConfig {
    fn default() -> Self {
        Self {
            mode: default_advertising_mode(),
            prefix: default_advertising_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoSummarizationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_token_budget")]
    pub token_budget: i64,
    #[serde(default)]
    pub summary_model: String,
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
    #[serde(default = "default_summary_prefix")]
    pub summary_prefix: String,
}

impl Default for AutoSummarizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_budget: default_token_budget(),
            summary_model: String::new(),
            keep_last: default_keep_last(),
            summary_prefix: default_summary_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemContextConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_system_context_path")]
    pub path: String,
}

impl Default for SystemContextConfig {
    fn default() -> Self {
        Self { enabled: false, path: default_system_context_path() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_operator_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_operator_timeout")]
    pub timeout: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_iterations: default_operator_iterations(),
            timeout: default_operator_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default = "default_max_tasks")]
    pub max_tasks_per_round: usize,
    #[serde(default = "default_stagger_ms")]
    pub task_stagger_ms: u64,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_seconds: u64,
    #[serde(default = "default_total_timeout")]
    pub total_timeout_seconds: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_rounds: default_max_rounds(),
            max_tasks_per_round: default_max_tasks(),
            task_stagger_ms: default_stagger_ms(),
            task_timeout_seconds: default_task_timeout(),
            total_timeout_seconds: default_total_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeOverlayConfig {
    #[serde(default = "default_overlay_path")]
    pub path: String,
}

impl Default for RuntimeOverlayConfig {
    fn default() -> Self {
        Self { path: default_overlay_path() }
    }
}

fn bool_true() -> bool {
    true
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_backend_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_timeout() -> u64 {
    120
}
fn default_priority() -> u32 {
    99
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base() -> f64 {
    1.5
}
fn default_backoff_max() -> f64 {
    10.0
}
fn default_sqlite_path() -> String {
    "./data/beigebox.db".to_string()
}
fn default_vector_path() -> String {
    "./data/vectors.db".to_string()
}
fn default_embed_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_embed_dimension() -> usize {
    768
}
fn default_decision_timeout() -> u64 {
    5
}
fn default_classifier_threshold() -> f32 {
    0.04
}
fn default_centroid_dir() -> String {
    "./data/centroids".to_string()
}
fn default_session_ttl() -> u64 {
    1800
}
fn default_wire_path() -> String {
    "./data/wire.jsonl".to_string()
}
fn default_plugins_dir() -> String {
    "./plugins".to_string()
}
fn default_search_results() -> usize {
    5
}
fn default_memory_results() -> usize {
    3
}
fn default_memory_min_score() -> f32 {
    0.3
}
fn default_injection_threshold() -> f32 {
    2.0
}
fn default_injection_mode() -> String {
    "flag".to_string()
}
fn default_advertising_mode() -> String {
    "hidden".to_string()
}
fn default_advertising_prefix() -> String {
    "beigebox:".to_string()
}
fn default_token_budget() -> i64 {
    3000
}
fn default_keep_last() -> usize {
    4
}
fn default_summary_prefix() -> String {
    "Summary of earlier conversation: ".to_string()
}
fn default_system_context_path() -> String {
    "./system_context.md".to_string()
}
fn default_operator_iterations() -> usize {
    8
}
fn default_operator_timeout() -> u64 {
    60
}
fn default_max_rounds() -> usize {
    8
}
fn default_max_tasks() -> usize {
    6
}
fn default_stagger_ms() -> u64 {
    400
}
fn default_task_timeout() -> u64 {
    120
}
fn default_total_timeout() -> u64 {
    300
}
fn default_overlay_path() -> String {
    "./runtime_config.yaml".to_string()
}

impl BeigeBoxConfig {
    /// Load config from a TOML file with BEIGEBOX_* env var overrides.
    /// `${ENV_VAR}` references in string values are resolved once, here.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path.unwrap_or("./beigebox.toml");

        let raw: serde_json::Value = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("BEIGEBOX_").split("_"))
            .extract()
            .map_err(|e| BeigeBoxError::Config(e.to_string()))?;

        let resolved = resolve_env_refs(raw);
        serde_json::from_value(resolved).map_err(|e| BeigeBoxError::Config(e.to_string()))
    }

    /// The arbitrator backend URL, falling back to the primary backend.
    pub fn decision_backend_url(&self) -> &str {
        if self.decision_llm.backend_url.is_empty() {
            &self.backend.url
        } else {
            &self.decision_llm.backend_url
        }
    }

    /// The embedding backend URL, falling back to the primary backend.
    pub fn embedding_backend_url(&self) -> &str {
        if self.embedding.backend_url.is_empty() {
            &self.backend.url
        } else {
            &self.embedding.backend_url
        }
    }
}

/// Replace `${ENV_VAR}` patterns in every string value of the tree.
fn resolve_env_refs(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => Value::String(resolve_env_str(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(resolve_env_refs).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, resolve_env_refs(v))).collect())
        }
        other => other,
    }
}

fn resolve_env_str(s: &str) -> String {
    static ENV_REF: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"\$\{(\w+)\}").expect("static pattern"));
    ENV_REF
        .replace_all(s, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
