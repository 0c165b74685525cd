use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "finkb.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub arango: ArangoConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

fn default_true() -> bool {
    true
}

fn default_min_bundle_confidence() -> f64 {
    0.3
}

fn default_step_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Halt the run when the Quality Gate reports FAIL.
    #[serde(default = "default_true")]
    pub require_gate_pass: bool,
    #[serde(default = "default_min_bundle_confidence")]
    pub min_bundle_confidence: f64,
    /// Upper bound for subprocess steps (Gate, G, E, F).
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            require_gate_pass: true,
            min_bundle_confidence: default_min_bundle_confidence(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

fn default_arango_host() -> String {
    "localhost".to_string()
}

fn default_arango_port() -> u16 {
    8529
}

fn default_arango_user() -> String {
    "root".to_string()
}

fn default_arango_db() -> String {
    "fin_kb_method".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArangoConfig {
    #[serde(default = "default_arango_host")]
    pub host: String,
    #[serde(default = "default_arango_port")]
    pub port: u16,
    #[serde(default = "default_arango_user")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_arango_db")]
    pub database: String,
}

impl Default for ArangoConfig {
    fn default() -> Self {
        Self {
            host: default_arango_host(),
            port: default_arango_port(),
            username: default_arango_user(),
            password: String::new(),
            database: default_arango_db(),
        }
    }
}

impl ArangoConfig {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Overlay `ARANGO_*` environment variables on top of file values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ARANGO_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("ARANGO_PORT") {
            match v.parse() {
                Ok(p) => self.port = p,
                Err(_) => tracing::warn!(value = %v, "Ignoring non-numeric ARANGO_PORT"),
            }
        }
        if let Ok(v) = std::env::var("ARANGO_USER") {
            self.username = v;
        }
        if let Ok(v) = std::env::var("ARANGO_PASSWORD") {
            self.password = v;
        }
        if let Ok(v) = std::env::var("ARANGO_DB") {
            self.database = v;
        }
    }
}

fn default_gigachat_base_url() -> String {
    "https://gigachat.devices.sberbank.ru/api/v1".to_string()
}

fn default_gigachat_auth_url() -> String {
    "https://ngw.devices.sberbank.ru:9443/api/v2/oauth".to_string()
}

fn default_requesty_base_url() -> String {
    "https://router.requesty.ai".to_string()
}

fn default_requesty_model() -> String {
    "anthropic/claude-sonnet-4-5".to_string()
}

fn default_llm_max_tokens() -> u32 {
    4000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Prefer GigaChat over the Requesty router when credentials exist.
    #[serde(default)]
    pub use_gigachat: bool,
    #[serde(default = "default_gigachat_base_url")]
    pub gigachat_base_url: String,
    #[serde(default = "default_gigachat_auth_url")]
    pub gigachat_auth_url: String,
    #[serde(default = "default_requesty_base_url")]
    pub requesty_base_url: String,
    #[serde(default = "default_requesty_model")]
    pub requesty_model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            use_gigachat: false,
            gigachat_base_url: default_gigachat_base_url(),
            gigachat_auth_url: default_gigachat_auth_url(),
            requesty_base_url: default_requesty_base_url(),
            requesty_model: default_requesty_model(),
            max_tokens: default_llm_max_tokens(),
            temperature: None,
        }
    }
}

impl LlmConfig {
    pub fn gigachat_credentials(&self) -> Option<String> {
        std::env::var("GIGACHAT_CREDENTIALS").ok().filter(|v| !v.is_empty())
    }

    pub fn requesty_api_key(&self) -> Option<String> {
        std::env::var("REQUESTY_API_KEY").ok().filter(|v| !v.is_empty())
    }
}

impl Config {
    /// Load `finkb.toml` from the repo root, falling back to defaults, then
    /// overlay connection env vars.
    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(CONFIG_FILE);
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config::default()
        };
        config.arango.apply_env();
        Ok(config)
    }

    pub fn save(&self, base_dir: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(base_dir.join(CONFIG_FILE), content).context("Failed to write config file")?;
        Ok(())
    }
}
