use serde::{Deserialize, Serialize};
use thiserror::Error;

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

pub const SUPPORTED_PROFILES: [&str; 2] = ["standard", "relaxed"];
pub const SUPPORTED_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub triggers: Triggers,
    #[serde(default)]
    pub sessions: Sessions,
    #[serde(default)]
    pub journal: Journal,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

/// Named preset plus optional per-constant overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triggers {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default)]
    pub after_every_n_responses: Option<u64>,
    #[serde(default)]
    pub periodic_check: Option<u64>,
    #[serde(default)]
    pub new_conversation_delay: Option<u64>,
    #[serde(default)]
    pub before_new_chat_threshold: Option<u64>,
    #[serde(default)]
    pub min_time_between_prompts_ms: Option<i64>,
}

impl Default for Triggers {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            after_every_n_responses: None,
            periodic_check: None,
            new_conversation_delay: None,
            before_new_chat_threshold: None,
            min_time_between_prompts_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sessions {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for Sessions {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Journal {
    #[serde(default)]
    pub jsonl_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_profile() -> String {
    "standard".to_string()
}

fn default_max_sessions() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    parse_and_validate(&config_text)
}

pub fn parse_and_validate(config_text: &str) -> Result<Config, ConfigError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

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

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if !SUPPORTED_PROFILES.contains(&cfg.triggers.profile.as_str()) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "triggers.profile={} is not implemented; supported: {}",
            cfg.triggers.profile,
            SUPPORTED_PROFILES.join(", ")
        )));
    }
    let counters = [
        ("after_every_n_responses", cfg.triggers.after_every_n_responses),
        ("periodic_check", cfg.triggers.periodic_check),
        ("new_conversation_delay", cfg.triggers.new_conversation_delay),
        ("before_new_chat_threshold", cfg.triggers.before_new_chat_threshold),
    ];
    for (name, value) in counters {
        if value == Some(0) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "triggers.{name} must be >= 1"
            )));
        }
    }
    if matches!(cfg.triggers.min_time_between_prompts_ms, Some(v) if v < 0) {
        return Err(ConfigError::UnsupportedConfig(
            "triggers.min_time_between_prompts_ms must be >= 0".to_string(),
        ));
    }
    if cfg.sessions.max_sessions == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "sessions.max_sessions must be >= 1".to_string(),
        ));
    }
    if cfg
        .journal
        .jsonl_path
        .as_ref()
        .map(|v| v.trim().is_empty())
        .unwrap_or(false)
    {
        return Err(ConfigError::UnsupportedConfig(
            "journal.jsonl_path must not be blank; omit it to disable the journal".to_string(),
        ));
    }
    if !SUPPORTED_LOG_LEVELS.contains(&cfg.logging.level.as_str()) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "logging.level={} is not supported; supported: {}",
            cfg.logging.level,
            SUPPORTED_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}
