//! Per-session conversation state.
//!
//! One `ConversationContext` exists per session and is never shared across
//! sessions. It carries the bounded turn history, the most recent entity of
//! each type (for anaphora resolution), user aliases, and the pending
//! action slot. The whole structure serializes to an opaque JSON blob; the
//! session store contract moves those blobs in and out.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dialogue::PendingAction;
use crate::domain::entity::{Entity, EntityType, EntityValue};
use crate::domain::intent::IntentName;
use crate::domain::utterance::SessionId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub utterance: String,
    pub intent: Option<IntentName>,
    pub entities: Vec<Entity>,
    pub response: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct RecentEntry {
    entity: Entity,
    turn: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    history: VecDeque<TurnRecord>,
    history_window: usize,
    recent_entities: HashMap<EntityType, RecentEntry>,
    aliases: HashMap<String, EntityValue>,
    pending: Option<PendingAction>,
    turn_counter: u64,
    last_activity: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(history_window: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(history_window),
            history_window: history_window.max(1),
            recent_entities: HashMap::new(),
            aliases: HashMap::new(),
            pending: None,
            turn_counter: 0,
            last_activity: Utc::now(),
        }
    }

    /// Record a completed turn: append to the ring, refresh the
    /// recent-entity map, bump the turn counter.
    pub fn note_turn(&mut self, record: TurnRecord) {
        self.last_activity = record.at;
        self.turn_counter += 1;
        for entity in record.entities.iter().filter(|entity| entity.is_resolved()) {
            self.recent_entities.insert(
                entity.entity_type,
                RecentEntry { entity: entity.clone(), turn: self.turn_counter },
            );
        }
        self.history.push_back(record);
        while self.history.len() > self.history_window {
            self.history.pop_front();
        }
    }

    /// Insert a resolved entity at the current turn without recording a
    /// full turn. Used when slot-filling merges a late answer.
    pub fn remember_entity(&mut self, entity: Entity) {
        if entity.is_resolved() {
            self.recent_entities
                .insert(entity.entity_type, RecentEntry { entity, turn: self.turn_counter });
        }
    }

    /// Most recently mentioned entity of the given type, provided it falls
    /// inside the history window.
    pub fn resolve(&self, entity_type: EntityType) -> Option<&Entity> {
        let entry = self.recent_entities.get(&entity_type)?;
        if self.turn_counter.saturating_sub(entry.turn) >= self.history_window as u64 {
            return None;
        }
        Some(&entry.entity)
    }

    pub fn history(&self) -> impl Iterator<Item = &TurnRecord> {
        self.history.iter()
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_counter
    }

    pub fn pending(&self) -> Option<&PendingAction> {
        self.pending.as_ref()
    }

    pub fn pending_mut(&mut self) -> Option<&mut PendingAction> {
        self.pending.as_mut()
    }

    pub fn set_pending(&mut self, pending: PendingAction) {
        self.pending = Some(pending);
    }

    pub fn take_pending(&mut self) -> Option<PendingAction> {
        self.pending.take()
    }

    pub fn set_alias(&mut self, name: impl Into<String>, value: EntityValue) {
        self.aliases.insert(name.into(), value);
    }

    pub fn alias(&self, name: &str) -> Option<&EntityValue> {
        self.aliases.get(name)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Idle sessions lose their history and any pending action.
    /// Returns true if the context was cleared.
    /// Whether the session has been quiet past the idle threshold.
    pub fn is_idle(&self, now: DateTime<Utc>, idle_secs: i64) -> bool {
        now - self.last_activity >= Duration::seconds(idle_secs)
    }

    pub fn expire_if_idle(&mut self, now: DateTime<Utc>, idle_secs: i64) -> bool {
        if !self.is_idle(now, idle_secs) {
            return false;
        }
        self.history.clear();
        self.recent_entities.clear();
        self.pending = None;
        self.last_activity = now;
        true
    }

    /// Opaque snapshot for the session store.
    pub fn to_blob(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_blob(blob: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(blob)
    }
}

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session store backend failure: {0}")]
    Backend(String),
    #[error("stored context snapshot could not be decoded: {0}")]
    Decode(String),
}

/// Contract to an external session store. The blob is an opaque serialized
/// `ConversationContext` snapshot.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session_id: &SessionId, blob: &str) -> Result<(), SessionStoreError>;
    async fn load(&self, session_id: &SessionId) -> Result<Option<String>, SessionStoreError>;
    async fn delete(&self, session_id: &SessionId) -> Result<(), SessionStoreError>;
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{ConversationContext, TurnRecord};
    use crate::domain::entity::{Entity, EntitySource, EntityType, EntityValue};
    use crate::domain::intent::IntentName;

    fn vm_entity(id: u64) -> Entity {
        Entity {
            entity_type: EntityType::VmId,
            raw: id.to_string(),
            resolved: Some(EntityValue::VmId(id)),
            span: (0, 3),
            confidence: 1.0,
            source: EntitySource::Pattern,
        }
    }

    fn turn(utterance: &str, entities: Vec<Entity>) -> TurnRecord {
        TurnRecord {
            utterance: utterance.to_string(),
            intent: Some(IntentName::new("vm_status")),
            entities,
            response: "ok".to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn history_is_bounded_by_the_window() {
        let mut context = ConversationContext::new(3);
        for index in 0..10 {
            context.note_turn(turn(&format!("turn {index}"), vec![]));
        }
        assert_eq!(context.history().count(), 3);
        assert_eq!(context.history().next().map(|r| r.utterance.as_str()), Some("turn 7"));
    }

    #[test]
    fn resolve_returns_the_most_recent_entity_of_a_type() {
        let mut context = ConversationContext::new(10);
        context.note_turn(turn("status of vm 100", vec![vm_entity(100)]));
        context.note_turn(turn("status of vm 204", vec![vm_entity(204)]));
        assert_eq!(
            context.resolve(EntityType::VmId).and_then(|e| e.resolved.clone()),
            Some(EntityValue::VmId(204))
        );
    }

    #[test]
    fn resolve_forgets_entities_outside_the_window() {
        let mut context = ConversationContext::new(2);
        context.note_turn(turn("status of vm 100", vec![vm_entity(100)]));
        context.note_turn(turn("anything", vec![]));
        context.note_turn(turn("anything else", vec![]));
        assert!(context.resolve(EntityType::VmId).is_none());
    }

    #[test]
    fn snapshot_round_trip_preserves_resolution() {
        let mut context = ConversationContext::new(10);
        context.note_turn(turn("status of vm 100", vec![vm_entity(100)]));

        let blob = context.to_blob().expect("serialize");
        let restored = ConversationContext::from_blob(&blob).expect("deserialize");

        assert_eq!(
            restored.resolve(EntityType::VmId).and_then(|e| e.resolved.clone()),
            context.resolve(EntityType::VmId).and_then(|e| e.resolved.clone()),
        );
        assert_eq!(restored, context);
    }

    #[test]
    fn idle_expiry_clears_history_and_pending() {
        let mut context = ConversationContext::new(10);
        context.note_turn(turn("status of vm 100", vec![vm_entity(100)]));
        let later = Utc::now() + Duration::seconds(3600);

        assert!(context.expire_if_idle(later, 1800));
        assert_eq!(context.history().count(), 0);
        assert!(context.resolve(EntityType::VmId).is_none());
        assert!(context.pending().is_none());
    }

    #[test]
    fn fresh_activity_is_not_expired() {
        let mut context = ConversationContext::new(10);
        context.note_turn(turn("status of vm 100", vec![vm_entity(100)]));
        assert!(!context.expire_if_idle(Utc::now(), 1800));
        assert!(context.resolve(EntityType::VmId).is_some());
    }

    #[test]
    fn aliases_survive_snapshots() {
        let mut context = ConversationContext::new(10);
        context.set_alias("the media box", EntityValue::VmId(100));
        let blob = context.to_blob().expect("serialize");
        let restored = ConversationContext::from_blob(&blob).expect("deserialize");
        assert_eq!(restored.alias("the media box"), Some(&EntityValue::VmId(100)));
    }
}
