//! LLM fallback contract and the prompt/parse layer on top of it.
//!
//! Providers only implement raw text completion; everything that makes
//! the output trustworthy lives here. Replies must be strict JSON, guess
//! intents must come from the published catalog, and anything else is an
//! `AdapterError::Schema` that the runtime treats exactly like an
//! unavailable backend. Malformed LLM output is never data.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use opsbot_core::schema::IntentDescriptor;
use opsbot_core::IntentName;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("llm transport failure: {0}")]
    Transport(String),
    #[error("llm request timed out")]
    Timeout,
    #[error("llm reply violated the expected schema: {0}")]
    Schema(String),
}

/// Raw completion backend. Implementations carry their own endpoint,
/// model, and credentials; they do not interpret the prompt.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, AdapterError>;
}

/// Catalog-constrained intent guess.
#[derive(Clone, Debug, PartialEq)]
pub struct IntentGuess {
    pub intent: IntentName,
    pub confidence: f64,
}

/// A slot mention the model located in the user's own words. The raw text
/// goes back through the deterministic extractor; the model never
/// produces a resolved value directly.
#[derive(Clone, Debug, PartialEq)]
pub struct SlotGuess {
    pub mention: String,
}

#[derive(Debug, Deserialize)]
struct IntentReply {
    intent: String,
    confidence: f64,
}

#[derive(Deserialize)]
struct SlotReply {
    mention: Option<String>,
}

#[derive(Deserialize)]
struct ParaphraseReply {
    text: String,
}

/// Prompt construction, timeout enforcement, and strict reply parsing
/// for the three places the pipeline consults the model.
#[derive(Clone)]
pub struct LlmAssist {
    client: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl LlmAssist {
    pub fn new(client: Arc<dyn LlmClient>, timeout_secs: u64) -> Self {
        Self { client, timeout: Duration::from_secs(timeout_secs) }
    }

    /// Ask the model which catalog intent the utterance expresses. Names
    /// outside the catalog are schema violations, not new intents.
    pub async fn classify_intent(
        &self,
        utterance: &str,
        catalog: &[IntentDescriptor],
    ) -> Result<IntentGuess, AdapterError> {
        let menu = catalog
            .iter()
            .map(|descriptor| format!("- {}: {}", descriptor.name, descriptor.description))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "You map a user request onto exactly one intent from this catalog:\n{menu}\n\n\
             User request: {utterance:?}\n\n\
             Reply with only a JSON object: {{\"intent\": \"<name from the catalog>\", \
             \"confidence\": <0.0 to 1.0>}}. If nothing fits, use confidence 0.0."
        );

        let raw = self.complete_with_timeout(&prompt).await?;
        let reply: IntentReply = parse_json_reply(&raw)?;

        if !catalog.iter().any(|descriptor| descriptor.name == reply.intent) {
            return Err(AdapterError::Schema(format!(
                "intent `{}` is not in the catalog",
                reply.intent
            )));
        }
        if !(0.0..=1.0).contains(&reply.confidence) {
            return Err(AdapterError::Schema(format!(
                "confidence {} outside [0, 1]",
                reply.confidence
            )));
        }

        debug!(
            event_name = "llm.classify_intent",
            intent = %reply.intent,
            confidence = reply.confidence,
            "llm intent guess parsed"
        );
        Ok(IntentGuess { intent: IntentName::new(&reply.intent), confidence: reply.confidence })
    }

    /// Ask the model to point at the words that fill a slot. The reply is
    /// a verbatim substring hint; resolution stays deterministic.
    pub async fn extract_slot(
        &self,
        utterance: &str,
        slot_label: &str,
    ) -> Result<Option<SlotGuess>, AdapterError> {
        let prompt = format!(
            "From the user request below, quote the words that name the {slot_label}, \
             exactly as written. Do not normalize, expand, or invent anything.\n\n\
             User request: {utterance:?}\n\n\
             Reply with only a JSON object: {{\"mention\": \"<exact words>\"}} or \
             {{\"mention\": null}} if the request does not name one."
        );

        let raw = self.complete_with_timeout(&prompt).await?;
        let reply: SlotReply = parse_json_reply(&raw)?;

        match reply.mention {
            Some(mention) if !mention.trim().is_empty() => {
                // A mention the user never typed would let the model smuggle
                // in an identifier. Drop it.
                if !utterance.to_lowercase().contains(&mention.trim().to_lowercase()) {
                    warn!(
                        event_name = "llm.slot_mention_rejected",
                        mention = %mention,
                        "llm slot mention is not a substring of the utterance"
                    );
                    return Ok(None);
                }
                Ok(Some(SlotGuess { mention: mention.trim().to_string() }))
            }
            _ => Ok(None),
        }
    }

    /// Cosmetic rewording of an already-complete literal reply. Facts in
    /// the literal must survive; on any doubt the caller keeps the literal.
    pub async fn paraphrase(&self, literal: &str) -> Result<String, AdapterError> {
        let prompt = format!(
            "Reword the following operations-bot reply to sound natural. Keep every number, \
             name, and state word unchanged. Do not add information.\n\n\
             Reply: {literal:?}\n\n\
             Answer with only a JSON object: {{\"text\": \"<reworded reply>\"}}."
        );

        let raw = self.complete_with_timeout(&prompt).await?;
        let reply: ParaphraseReply = parse_json_reply(&raw)?;
        if reply.text.trim().is_empty() {
            return Err(AdapterError::Schema("paraphrase was empty".to_string()));
        }
        Ok(reply.text)
    }

    async fn complete_with_timeout(&self, prompt: &str) -> Result<String, AdapterError> {
        match tokio::time::timeout(self.timeout, self.client.complete(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout),
        }
    }
}

/// Parse a JSON object out of a completion, tolerating the code fences
/// and prose framing chat models like to add around it.
fn parse_json_reply<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, AdapterError> {
    let trimmed = raw.trim();
    let candidate = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(AdapterError::Schema(format!(
                "no JSON object in reply: {}",
                truncate(trimmed)
            )))
        }
    };
    serde_json::from_str(candidate)
        .map_err(|error| AdapterError::Schema(format!("{error}: {}", truncate(candidate))))
}

fn truncate(text: &str) -> String {
    if text.chars().count() > 120 {
        let head: String = text.chars().take(120).collect();
        format!("{head}…")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{parse_json_reply, AdapterError, IntentReply, LlmAssist, LlmClient};
    use opsbot_core::schema::IntentDescriptor;
    use opsbot_core::IntentName;

    struct CannedClient(String);

    #[async_trait]
    impl LlmClient for CannedClient {
        async fn complete(&self, _prompt: &str) -> Result<String, AdapterError> {
            Ok(self.0.clone())
        }
    }

    fn catalog() -> Vec<IntentDescriptor> {
        vec![
            IntentDescriptor { name: "vm_start".to_string(), description: "Start a VM".to_string() },
            IntentDescriptor { name: "vm_stop".to_string(), description: "Stop a VM".to_string() },
        ]
    }

    fn assist(reply: &str) -> LlmAssist {
        LlmAssist::new(Arc::new(CannedClient(reply.to_string())), 5)
    }

    #[tokio::test]
    async fn fenced_json_reply_parses() {
        let assist = assist("```json\n{\"intent\": \"vm_start\", \"confidence\": 0.9}\n```");
        let guess = assist.classify_intent("fire up the box", &catalog()).await.unwrap();
        assert_eq!(guess.intent, IntentName::new("vm_start"));
        assert!((guess.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn intent_outside_the_catalog_is_a_schema_error() {
        let assist = assist("{\"intent\": \"rm_rf_slash\", \"confidence\": 1.0}");
        let error = assist.classify_intent("anything", &catalog()).await.unwrap_err();
        assert!(matches!(error, AdapterError::Schema(_)));
    }

    #[tokio::test]
    async fn confidence_outside_unit_interval_is_a_schema_error() {
        let assist = assist("{\"intent\": \"vm_start\", \"confidence\": 3.0}");
        let error = assist.classify_intent("anything", &catalog()).await.unwrap_err();
        assert!(matches!(error, AdapterError::Schema(_)));
    }

    #[tokio::test]
    async fn prose_without_json_is_a_schema_error() {
        let error = parse_json_reply::<IntentReply>("I think the user wants to start a VM")
            .unwrap_err();
        assert!(matches!(error, AdapterError::Schema(_)));
    }

    #[tokio::test]
    async fn slot_mention_must_quote_the_utterance() {
        let fabricating = assist("{\"mention\": \"vm 9999\"}");
        let guess = fabricating.extract_slot("start the media server", "VM id").await.unwrap();
        assert!(guess.is_none());

        let quoting = assist("{\"mention\": \"media server\"}");
        let guess = quoting.extract_slot("start the media server", "VM id").await.unwrap();
        assert_eq!(guess.unwrap().mention, "media server");
    }

    #[tokio::test]
    async fn null_slot_mention_is_a_clean_miss() {
        let assist = assist("{\"mention\": null}");
        let guess = assist.extract_slot("start something", "VM id").await.unwrap();
        assert!(guess.is_none());
    }
}
