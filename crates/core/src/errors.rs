use thiserror::Error;

use crate::domain::entity::EntityType;
use crate::domain::intent::{IntentCandidate, IntentName};

/// Everything that can go wrong inside a turn. Each variant is raised at
/// the stage that detects the condition; all except `ContractViolation`
/// are recovered within the pipeline and converted into a conversational
/// response, so nothing here reaches the caller as an unhandled error.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PipelineError {
    #[error("utterance was empty or contained nothing to parse")]
    EmptyInput,
    #[error("no intent matched above the acceptance threshold")]
    NoIntentMatch,
    #[error("intent is ambiguous between {} and {}", candidates.0.name, candidates.1.name)]
    AmbiguousIntent { candidates: Box<(IntentCandidate, IntentCandidate)> },
    #[error("intent {intent} is missing required entities")]
    MissingEntities { intent: IntentName, missing: Vec<EntityType> },
    #[error("best match for {entity_type:?} was `{best}` at similarity {score:.2}, below the resolution floor")]
    LowConfidenceResolution { entity_type: EntityType, best: String, score: f64 },
    #[error("llm backend unavailable: {0}")]
    LlmUnavailable(String),
    #[error("handler execution failed: {0}")]
    HandlerExecution(String),
    #[error("pending confirmation expired")]
    ConfirmationTimeout,
    #[error("pipeline contract violation: {0}")]
    ContractViolation(String),
}

impl PipelineError {
    /// Whether the error is recovered into a conversational reply.
    /// `ContractViolation` indicates an internal defect and is the only
    /// variant allowed to fail loudly.
    pub fn is_conversational(&self) -> bool {
        !matches!(self, PipelineError::ContractViolation(_))
    }
}
