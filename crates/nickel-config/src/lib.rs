use std::collections::BTreeMap;

use nickel_contracts::ToolId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_HISTORY_WINDOW: usize = 12;
pub const MAX_HISTORY_WINDOW: usize = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    #[serde(default)]
    pub llm: Llm,
    pub audit: Audit,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

/// Model endpoint settings. Endpoint, credentials and model id may be left
/// unset; the pipeline reports that when it is first called.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Llm {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default)]
    pub system_prompt_path: Option<String>,
}

impl Default for Llm {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            api_key_env: None,
            model: None,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            temperature: default_temperature(),
            history_window: default_history_window(),
            system_prompt_path: None,
        }
    }
}

impl Llm {
    /// Inline key wins over the environment variable named by `api_key_env`.
    pub fn resolved_api_key(&self) -> Option<String> {
        non_blank(self.api_key.clone()).or_else(|| {
            self.api_key_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok())
                .and_then(|v| non_blank(Some(v)))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
    #[serde(default)]
    pub immutable_mirror_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEndpoint {
    pub endpoint: String,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_temperature() -> f64 {
    0.2
}

fn default_history_window() -> usize {
    MIN_HISTORY_WINDOW
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if !(MIN_HISTORY_WINDOW..=MAX_HISTORY_WINDOW).contains(&cfg.llm.history_window) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "llm.history_window must be between {MIN_HISTORY_WINDOW} and {MAX_HISTORY_WINDOW}"
        )));
    }
    if cfg.llm.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "llm.timeout_ms must be >= 1".to_string(),
        ));
    }
    if !(0.0..=2.0).contains(&cfg.llm.temperature) {
        return Err(ConfigError::UnsupportedConfig(
            "llm.temperature must be between 0 and 2".to_string(),
        ));
    }
    if cfg.audit.jsonl_path.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "audit.jsonl_path must not be empty".to_string(),
        ));
    }
    for (tool, endpoint) in &cfg.tools {
        if ToolId::parse(tool).is_none() {
            return Err(ConfigError::UnsupportedConfig(format!(
                "tools.{tool} is not a known tool"
            )));
        }
        if endpoint.endpoint.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(format!(
                "tools.{tool}.endpoint must not be empty"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("nickel-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

llm:
  base_url: "http://localhost:11434/v1"
  api_key: "ollama"
  model: "qwen2.5:7b-instruct"
  history_window: 12

audit:
  jsonl_path: "./nickel-audit.jsonl"
"#
        .to_string()
    }

    #[test]
    fn loads_base_config_with_defaults() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.llm.max_retries, 2);
        assert_eq!(cfg.llm.retry_backoff_ms, 500);
        assert_eq!(cfg.llm.timeout_ms, 30_000);
        assert!(cfg.tools.is_empty());
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_even_when_memory() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_history_window_outside_bounds() {
        let path = write_temp_config(
            &base_yaml().replace("history_window: 12", "history_window: 40"),
        );
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_unknown_tool_endpoint() {
        let path = write_temp_config(&format!(
            "{}\ntools:\n  email.delete:\n    endpoint: \"http://localhost:9000\"\n",
            base_yaml()
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn accepts_known_tool_endpoint() {
        let path = write_temp_config(&format!(
            "{}\ntools:\n  email.send:\n    endpoint: \"http://localhost:9000/send\"\n",
            base_yaml()
        ));
        let cfg = load_and_validate(&path).expect("tool endpoint should be accepted");
        assert_eq!(
            cfg.tools.get("email.send").map(|t| t.endpoint.as_str()),
            Some("http://localhost:9000/send")
        );
    }

    #[test]
    fn api_key_falls_back_to_named_env_var() {
        let var = format!(
            "NICKEL_TEST_KEY_{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system time before unix epoch")
                .as_nanos()
        );
        std::env::set_var(&var, "from-env");
        let llm = Llm {
            api_key: Some("  ".to_string()),
            api_key_env: Some(var.clone()),
            ..Llm::default()
        };
        assert_eq!(llm.resolved_api_key().as_deref(), Some("from-env"));
        std::env::remove_var(&var);
    }

    #[test]
    fn shipped_example_config_is_valid() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/example-config.yaml");
        let cfg = load_and_validate(&path.to_string_lossy()).unwrap();
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.llm.api_key_env.as_deref(), Some("NICKEL_LLM_API_KEY"));
    }
}
