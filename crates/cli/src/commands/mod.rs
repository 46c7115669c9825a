pub mod chat;
pub mod config;
pub mod doctor;
pub mod intents;
pub mod migrate;

use serde::Serialize;
use serde_json::Value;

/// What a subcommand hands back to `run`: the process exit code and the
/// already-rendered output line.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

/// Machine-readable outcome for the non-interactive subcommands, so
/// `opsbot migrate` and friends can sit in provisioning scripts.
#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    details: Value,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with_details(command, message, Value::Null)
    }

    pub fn success_with_details(command: &str, message: impl Into<String>, details: Value) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            details,
        };
        Self { exit_code: 0, output: encode(&payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            details: Value::Null,
        };
        Self { exit_code, output: encode(&payload) }
    }
}

fn encode(payload: &CommandOutcome) -> String {
    serde_json::to_string(payload).unwrap_or_else(|_| {
        format!(
            "{{\"command\":\"{}\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"outcome could not be encoded\"}}",
            payload.command
        )
    })
}

#[cfg(test)]
mod tests {
    use super::CommandResult;

    #[test]
    fn success_outcome_omits_the_error_class() {
        let result = CommandResult::success("migrate", "done");
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("\"status\":\"ok\""));
        assert!(!result.output.contains("error_class"));
    }

    #[test]
    fn details_are_embedded_when_present() {
        let result = CommandResult::success_with_details(
            "migrate",
            "done",
            serde_json::json!({"known_migrations": 1}),
        );
        assert!(result.output.contains("\"known_migrations\":1"));
    }
}
