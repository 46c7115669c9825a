use opsbot_core::config::{AppConfig, LlmProvider, LoadOptions, LogFormat};
use secrecy::ExposeSecret;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let provider = match config.llm.provider {
        LlmProvider::Ollama => "ollama",
        LlmProvider::OpenAiCompat => "openai_compat",
    };
    let format = match config.logging.format {
        LogFormat::Compact => "compact",
        LogFormat::Pretty => "pretty",
        LogFormat::Json => "json",
    };
    let api_key = match &config.llm.api_key {
        Some(secret) => redact(secret.expose_secret()),
        None => "unset".to_string(),
    };

    let lines = vec![
        "effective config (source precedence: overrides > env > file > default):".to_string(),
        format!("  database.url                = {}", config.database.url),
        format!("  database.max_connections    = {}", config.database.max_connections),
        format!("  database.timeout_secs       = {}", config.database.timeout_secs),
        format!("  llm.enabled                 = {}", config.llm.enabled),
        format!("  llm.provider                = {provider}"),
        format!("  llm.model                   = {}", config.llm.model),
        format!("  llm.base_url                = {}", config.llm.base_url.as_deref().unwrap_or("unset")),
        format!("  llm.api_key                 = {api_key}"),
        format!("  llm.timeout_secs            = {}", config.llm.timeout_secs),
        format!("  llm.paraphrase              = {}", config.llm.paraphrase),
        format!("  nlu.acceptance_threshold    = {}", config.nlu.acceptance_threshold),
        format!("  nlu.near_tie_margin         = {}", config.nlu.near_tie_margin),
        format!("  nlu.fuzzy_threshold         = {}", config.nlu.fuzzy_threshold),
        format!("  dialogue.history_window     = {}", config.dialogue.history_window),
        format!("  dialogue.confirmation_turns = {}", config.dialogue.confirmation_turns),
        format!("  dialogue.confirmation_timeout_secs = {}", config.dialogue.confirmation_timeout_secs),
        format!("  dialogue.session_idle_secs  = {}", config.dialogue.session_idle_secs),
        format!("  logging.level               = {}", config.logging.level),
        format!("  logging.format              = {format}"),
    ];

    lines.join("\n")
}

fn redact(token: &str) -> String {
    if token.len() <= 4 {
        "****".to_string()
    } else {
        format!("****{}", &token[token.len() - 4..])
    }
}
