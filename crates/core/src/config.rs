use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub nlu: NluSettings,
    pub dialogue: DialogueSettings,
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
    pub enabled: bool,
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub paraphrase: bool,
}

/// Pattern-scoring policy knobs. These are tunable policy, not contracts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NluSettings {
    /// Minimum pattern score for an outright intent match.
    pub acceptance_threshold: f64,
    /// Two top candidates closer than this are treated as ambiguous.
    pub near_tie_margin: f64,
    /// Minimum Jaro-Winkler similarity for fuzzy entity resolution.
    pub fuzzy_threshold: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueSettings {
    /// Turns kept in the per-session history ring.
    pub history_window: usize,
    /// Turns a pending confirmation survives before silent expiry.
    pub confirmation_turns: u32,
    /// Wall-clock lifetime of a pending confirmation, in seconds.
    pub confirmation_timeout_secs: i64,
    /// Idle seconds after which a session context is discarded.
    pub session_idle_secs: i64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Ollama,
    OpenAiCompat,
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
    pub llm_enabled: Option<bool>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
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
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for NluSettings {
    fn default() -> Self {
        Self { acceptance_threshold: 0.6, near_tie_margin: 0.05, fuzzy_threshold: 0.84 }
    }
}

impl Default for DialogueSettings {
    fn default() -> Self {
        Self {
            history_window: 10,
            confirmation_turns: 2,
            confirmation_timeout_secs: 120,
            session_idle_secs: 1800,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://opsbot.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                enabled: false,
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 15,
                paraphrase: false,
            },
            nlu: NluSettings::default(),
            dialogue: DialogueSettings::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" | "openai_compat" => Ok(Self::OpenAiCompat),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected ollama|openai_compat)"
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("opsbot.toml"));
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
            if let Some(enabled) = llm.enabled {
                self.llm.enabled = enabled;
            }
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(SecretString::from(api_key));
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
            if let Some(paraphrase) = llm.paraphrase {
                self.llm.paraphrase = paraphrase;
            }
        }

        if let Some(nlu) = patch.nlu {
            if let Some(acceptance_threshold) = nlu.acceptance_threshold {
                self.nlu.acceptance_threshold = acceptance_threshold;
            }
            if let Some(near_tie_margin) = nlu.near_tie_margin {
                self.nlu.near_tie_margin = near_tie_margin;
            }
            if let Some(fuzzy_threshold) = nlu.fuzzy_threshold {
                self.nlu.fuzzy_threshold = fuzzy_threshold;
            }
        }

        if let Some(dialogue) = patch.dialogue {
            if let Some(history_window) = dialogue.history_window {
                self.dialogue.history_window = history_window;
            }
            if let Some(confirmation_turns) = dialogue.confirmation_turns {
                self.dialogue.confirmation_turns = confirmation_turns;
            }
            if let Some(confirmation_timeout_secs) = dialogue.confirmation_timeout_secs {
                self.dialogue.confirmation_timeout_secs = confirmation_timeout_secs;
            }
            if let Some(session_idle_secs) = dialogue.session_idle_secs {
                self.dialogue.session_idle_secs = session_idle_secs;
            }
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
        if let Some(value) = read_env("OPSBOT_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("OPSBOT_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("OPSBOT_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("OPSBOT_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("OPSBOT_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("OPSBOT_LLM_ENABLED") {
            self.llm.enabled = parse_bool("OPSBOT_LLM_ENABLED", &value)?;
        }
        if let Some(value) = read_env("OPSBOT_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("OPSBOT_LLM_API_KEY") {
            self.llm.api_key = Some(SecretString::from(value));
        }
        if let Some(value) = read_env("OPSBOT_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("OPSBOT_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("OPSBOT_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("OPSBOT_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("OPSBOT_LLM_PARAPHRASE") {
            self.llm.paraphrase = parse_bool("OPSBOT_LLM_PARAPHRASE", &value)?;
        }

        if let Some(value) = read_env("OPSBOT_NLU_ACCEPTANCE_THRESHOLD") {
            self.nlu.acceptance_threshold = parse_f64("OPSBOT_NLU_ACCEPTANCE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("OPSBOT_NLU_NEAR_TIE_MARGIN") {
            self.nlu.near_tie_margin = parse_f64("OPSBOT_NLU_NEAR_TIE_MARGIN", &value)?;
        }
        if let Some(value) = read_env("OPSBOT_NLU_FUZZY_THRESHOLD") {
            self.nlu.fuzzy_threshold = parse_f64("OPSBOT_NLU_FUZZY_THRESHOLD", &value)?;
        }

        if let Some(value) = read_env("OPSBOT_DIALOGUE_HISTORY_WINDOW") {
            self.dialogue.history_window =
                parse_u32("OPSBOT_DIALOGUE_HISTORY_WINDOW", &value)? as usize;
        }
        if let Some(value) = read_env("OPSBOT_DIALOGUE_CONFIRMATION_TURNS") {
            self.dialogue.confirmation_turns =
                parse_u32("OPSBOT_DIALOGUE_CONFIRMATION_TURNS", &value)?;
        }
        if let Some(value) = read_env("OPSBOT_DIALOGUE_CONFIRMATION_TIMEOUT_SECS") {
            self.dialogue.confirmation_timeout_secs =
                parse_i64("OPSBOT_DIALOGUE_CONFIRMATION_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("OPSBOT_DIALOGUE_SESSION_IDLE_SECS") {
            self.dialogue.session_idle_secs =
                parse_i64("OPSBOT_DIALOGUE_SESSION_IDLE_SECS", &value)?;
        }

        let log_level = read_env("OPSBOT_LOGGING_LEVEL").or_else(|| read_env("OPSBOT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("OPSBOT_LOGGING_FORMAT").or_else(|| read_env("OPSBOT_LOG_FORMAT"));
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
        if let Some(llm_enabled) = overrides.llm_enabled {
            self.llm.enabled = llm_enabled;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = Some(llm_base_url);
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(SecretString::from(llm_api_key));
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.nlu.acceptance_threshold) {
            return Err(ConfigError::Validation(
                "nlu.acceptance_threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.nlu.near_tie_margin < 0.0 || self.nlu.near_tie_margin >= self.nlu.acceptance_threshold
        {
            return Err(ConfigError::Validation(
                "nlu.near_tie_margin must be non-negative and below the acceptance threshold"
                    .to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.nlu.fuzzy_threshold) {
            return Err(ConfigError::Validation(
                "nlu.fuzzy_threshold must be within [0, 1]".to_string(),
            ));
        }
        if self.dialogue.history_window == 0 {
            return Err(ConfigError::Validation(
                "dialogue.history_window must be at least 1".to_string(),
            ));
        }
        if self.dialogue.confirmation_turns == 0 {
            return Err(ConfigError::Validation(
                "dialogue.confirmation_turns must be at least 1".to_string(),
            ));
        }
        if self.llm.enabled && self.llm.provider == LlmProvider::OpenAiCompat {
            if self.llm.api_key.is_none() {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai_compat provider".to_string(),
                ));
            }
            if self.llm.base_url.is_none() {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for the openai_compat provider".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    nlu: Option<NluPatch>,
    dialogue: Option<DialoguePatch>,
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
    enabled: Option<bool>,
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    paraphrase: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct NluPatch {
    acceptance_threshold: Option<f64>,
    near_tie_margin: Option<f64>,
    fuzzy_threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct DialoguePatch {
    history_window: Option<usize>,
    confirmation_turns: Option<u32>,
    confirmation_timeout_secs: Option<i64>,
    session_idle_secs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    let default = PathBuf::from("opsbot.toml");
    default.exists().then_some(default)
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    toml::from_str(&raw)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnvOverride {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.nlu.acceptance_threshold, 0.6);
        assert_eq!(config.nlu.near_tie_margin, 0.05);
        assert_eq!(config.dialogue.history_window, 10);
    }

    #[test]
    fn toml_patch_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            "[nlu]\nacceptance_threshold = 0.7\n\n[dialogue]\nhistory_window = 4\n\n[llm]\nenabled = true\nmodel = \"mistral\"\n"
        )
        .expect("write config");

        let config = AppConfig::load(LoadOptions {
            config_path: Some(file.path().to_path_buf()),
            require_file: true,
            overrides: ConfigOverrides::default(),
        })
        .expect("load config");

        assert_eq!(config.nlu.acceptance_threshold, 0.7);
        assert_eq!(config.dialogue.history_window, 4);
        assert!(config.llm.enabled);
        assert_eq!(config.llm.model, "mistral");
    }

    #[test]
    fn env_overrides_beat_the_file_layer() {
        // Keys no other test asserts, so parallel loads stay unaffected.
        std::env::set_var("OPSBOT_NLU_FUZZY_THRESHOLD", "0.9");
        std::env::set_var("OPSBOT_DATABASE_TIMEOUT_SECS", "7");

        let loaded = AppConfig::load(LoadOptions::default());

        std::env::remove_var("OPSBOT_NLU_FUZZY_THRESHOLD");
        std::env::remove_var("OPSBOT_DATABASE_TIMEOUT_SECS");

        let config = loaded.expect("load config");
        assert_eq!(config.nlu.fuzzy_threshold, 0.9);
        assert_eq!(config.database.timeout_secs, 7);
    }

    #[test]
    fn unparseable_env_values_are_named_in_the_error() {
        let error = parse_f64("OPSBOT_NLU_FUZZY_THRESHOLD", "not-a-number")
            .expect_err("parse should fail");
        assert!(error.to_string().contains("OPSBOT_NLU_FUZZY_THRESHOLD"));
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let result = AppConfig::load(LoadOptions {
            config_path: Some(PathBuf::from("/definitely/not/here/opsbot.toml")),
            require_file: true,
            overrides: ConfigOverrides::default(),
        });
        assert!(matches!(result, Err(ConfigError::MissingConfigFile(_))));
    }

    #[test]
    fn near_tie_margin_above_threshold_is_rejected() {
        let mut config = AppConfig::default();
        config.nlu.near_tie_margin = 0.9;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn openai_compat_requires_api_key_when_enabled() {
        let mut config = AppConfig::default();
        config.llm.enabled = true;
        config.llm.provider = LlmProvider::OpenAiCompat;
        config.llm.api_key = None;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn programmatic_overrides_win_last() {
        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                llm_model: Some("phi3".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("load config");

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.llm.model, "phi3");
    }
}
