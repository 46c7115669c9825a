//! Slot-filling and confirm/cancel protocol for risky actions.
//!
//! The machine is deterministic: state is derived entirely from the
//! session's `PendingAction` slot. Destructiveness comes from the intent
//! schema, never from heuristics, and a confirmed action is dispatched
//! verbatim from the stored entities so the user can only ever confirm
//! exactly what was proposed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DialogueSettings;
use crate::domain::entity::{Entity, EntityType};
use crate::domain::intent::IntentName;
use crate::preprocess::TokenStream;

const AFFIRMATIVES: &[&str] =
    &["yes", "y", "yeah", "yep", "sure", "confirm", "confirmed", "affirmative", "ok", "okay", "proceed"];

const NEGATIVES: &[&str] =
    &["no", "n", "nope", "negative", "cancel", "abort", "nevermind", "not"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialogueState {
    Idle,
    AwaitingSlots,
    AwaitingConfirmation,
}

/// The action a session is waiting to complete. At most one exists per
/// session at any time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub intent: IntentName,
    pub entities: Vec<Entity>,
    pub destructive: bool,
    /// Required slot types still unresolved. Empty means the action is
    /// complete and only awaiting confirmation.
    pub missing: Vec<EntityType>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub turns_left: u32,
}

impl PendingAction {
    pub fn state(&self) -> DialogueState {
        if self.missing.is_empty() {
            DialogueState::AwaitingConfirmation
        } else {
            DialogueState::AwaitingSlots
        }
    }

    /// Expired by wall clock or by turn budget, whichever comes first.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.turns_left == 0 || now >= self.expires_at
    }

    /// One-line description used in confirmation prompts.
    pub fn summary(&self) -> String {
        let arguments = self
            .entities
            .iter()
            .filter_map(|entity| {
                entity
                    .resolved
                    .as_ref()
                    .map(|value| format!("{} {}", entity.entity_type.label(), value.display()))
            })
            .collect::<Vec<_>>()
            .join(", ");
        if arguments.is_empty() {
            self.intent.to_string()
        } else {
            format!("{} ({arguments})", self.intent)
        }
    }
}

/// How the user's reply relates to a live pending action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationReply {
    Affirmative,
    Negative,
    /// Neither; the utterance is treated as a fresh request.
    Other,
}

/// Closed word lists, checked before any intent identification while a
/// pending action is live.
pub fn classify_reply(stream: &TokenStream) -> ConfirmationReply {
    let negative = stream.tokens.iter().any(|token| NEGATIVES.contains(&token.normalized.as_str()));
    if negative {
        return ConfirmationReply::Negative;
    }
    let affirmative =
        stream.tokens.iter().any(|token| AFFIRMATIVES.contains(&token.normalized.as_str()));
    if affirmative {
        return ConfirmationReply::Affirmative;
    }
    ConfirmationReply::Other
}

#[derive(Clone, Copy, Debug)]
pub struct DialogueMachine {
    settings: DialogueSettings,
}

impl DialogueMachine {
    pub fn new(settings: DialogueSettings) -> Self {
        Self { settings }
    }

    /// A complete destructive action waiting for explicit user approval.
    pub fn propose_confirmation(
        &self,
        intent: IntentName,
        entities: Vec<Entity>,
        now: DateTime<Utc>,
    ) -> PendingAction {
        PendingAction {
            intent,
            entities,
            destructive: true,
            missing: Vec::new(),
            created_at: now,
            expires_at: now + Duration::seconds(self.settings.confirmation_timeout_secs),
            turns_left: self.settings.confirmation_turns,
        }
    }

    /// An action with unresolved required slots waiting for the user to
    /// supply the missing fields.
    pub fn propose_slot_fill(
        &self,
        intent: IntentName,
        entities: Vec<Entity>,
        missing: Vec<EntityType>,
        destructive: bool,
        now: DateTime<Utc>,
    ) -> PendingAction {
        PendingAction {
            intent,
            entities,
            destructive,
            missing,
            created_at: now,
            expires_at: now + Duration::seconds(self.settings.confirmation_timeout_secs),
            turns_left: self.settings.confirmation_turns,
        }
    }

    /// A turn passed without resolving the pending action.
    pub fn consume_turn(&self, pending: &mut PendingAction) {
        pending.turns_left = pending.turns_left.saturating_sub(1);
    }
}
