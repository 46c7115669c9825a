use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::{Entity, EntityType, EntityValue};
use super::intent::IntentName;
use super::utterance::{SessionId, UserId};

/// The validated unit handed to the dispatcher. Immutable; one `Command`
/// produces exactly one `HandlerResult`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command_id: Uuid,
    pub intent: IntentName,
    pub entities: Vec<Entity>,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub dispatched_at: DateTime<Utc>,
}

impl Command {
    pub fn new(
        intent: IntentName,
        entities: Vec<Entity>,
        user_id: UserId,
        session_id: SessionId,
    ) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            intent,
            entities,
            user_id,
            session_id,
            dispatched_at: Utc::now(),
        }
    }

    /// First resolved value of the given type, if any.
    pub fn value_of(&self, entity_type: EntityType) -> Option<&EntityValue> {
        self.entities
            .iter()
            .filter(|entity| entity.entity_type == entity_type)
            .find_map(|entity| entity.resolved.as_ref())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    HandlerError,
    InvalidArguments,
    NotFound,
    BackendUnavailable,
    Internal,
}

/// Normalized outcome returned by an external handler. Failed results flow
/// through the pipeline the same way successful ones do.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandlerResult {
    pub success: bool,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub error_kind: Option<ErrorKind>,
}

impl HandlerResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), data: None, error_kind: None }
    }

    pub fn ok_with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self { success: true, message: message.into(), data: Some(data), error_kind: None }
    }

    pub fn fail(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), data: None, error_kind: Some(kind) }
    }
}
