//! Session checkout and persistence.
//!
//! The manager keeps one live `ConversationContext` per session behind a
//! mutex so concurrent turns for the same session serialize, loads cold
//! sessions from the store, and applies the idle-expiry policy on every
//! checkout. A snapshot that fails to decode is logged and replaced with
//! a fresh context; we never refuse a turn over a corrupt blob.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use opsbot_core::config::DialogueSettings;
use opsbot_core::context::{ConversationContext, SessionStore, SessionStoreError};
use opsbot_core::SessionId;

/// Process-local store used by tests and the single-process chat CLI.
#[derive(Default)]
pub struct InMemorySessionStore {
    blobs: RwLock<HashMap<String, String>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save(&self, session_id: &SessionId, blob: &str) -> Result<(), SessionStoreError> {
        self.blobs.write().await.insert(session_id.0.clone(), blob.to_string());
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> Result<Option<String>, SessionStoreError> {
        Ok(self.blobs.read().await.get(&session_id.0).cloned())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<(), SessionStoreError> {
        self.blobs.write().await.remove(&session_id.0);
        Ok(())
    }
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    settings: DialogueSettings,
    live: Mutex<HashMap<String, Arc<Mutex<ConversationContext>>>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, settings: DialogueSettings) -> Self {
        Self { store, settings, live: Mutex::new(HashMap::new()) }
    }

    /// Fetch the live context for a session, loading it from the store on
    /// first touch. Idle expiry runs here so a returning user on a stale
    /// session starts clean. A store that cannot be read costs the session
    /// its history, not the user their turn.
    pub async fn checkout(&self, session_id: &SessionId) -> Arc<Mutex<ConversationContext>> {
        let mut live = self.live.lock().await;
        live.retain(|_, context| {
            context
                .try_lock()
                .map(|guard| !guard.is_idle(Utc::now(), self.settings.session_idle_secs))
                .unwrap_or(true)
        });
        if let Some(context) = live.get(&session_id.0) {
            let handle = Arc::clone(context);
            drop(live);
            handle.lock().await.expire_if_idle(Utc::now(), self.settings.session_idle_secs);
            return handle;
        }

        let mut context = match self.store.load(session_id).await {
            Ok(Some(blob)) => match ConversationContext::from_blob(&blob) {
                Ok(context) => context,
                Err(error) => {
                    warn!(
                        event_name = "session.snapshot_corrupt",
                        session_id = %session_id,
                        error = %error,
                        "discarding undecodable context snapshot"
                    );
                    ConversationContext::new(self.settings.history_window)
                }
            },
            Ok(None) => {
                info!(
                    event_name = "session.created",
                    session_id = %session_id,
                    "new conversation session"
                );
                ConversationContext::new(self.settings.history_window)
            }
            Err(error) => {
                warn!(
                    event_name = "session.load_failed",
                    session_id = %session_id,
                    error = %error,
                    "store unreadable, starting a fresh context"
                );
                ConversationContext::new(self.settings.history_window)
            }
        };
        context.expire_if_idle(Utc::now(), self.settings.session_idle_secs);

        let handle = Arc::new(Mutex::new(context));
        live.insert(session_id.0.clone(), Arc::clone(&handle));
        handle
    }

    #[cfg(test)]
    async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }

    /// Snapshot the context back to the store at the end of a turn.
    pub async fn persist(
        &self,
        session_id: &SessionId,
        context: &ConversationContext,
    ) -> Result<(), SessionStoreError> {
        let blob = context
            .to_blob()
            .map_err(|error| SessionStoreError::Decode(error.to_string()))?;
        self.store.save(session_id, &blob).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::{InMemorySessionStore, SessionManager};
    use opsbot_core::config::DialogueSettings;
    use opsbot_core::context::{SessionStore, SessionStoreError, TurnRecord};
    use opsbot_core::domain::entity::{Entity, EntitySource, EntityType, EntityValue};
    use opsbot_core::{IntentName, SessionId};

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(InMemorySessionStore::new()), DialogueSettings::default())
    }

    fn turn_with_vm(id: u64) -> TurnRecord {
        TurnRecord {
            utterance: format!("start vm {id}"),
            intent: Some(IntentName::new("vm_start")),
            entities: vec![Entity {
                entity_type: EntityType::VmId,
                raw: id.to_string(),
                resolved: Some(EntityValue::VmId(id)),
                span: (9, 12),
                confidence: 1.0,
                source: EntitySource::Pattern,
            }],
            response: "ok".to_string(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn checkout_returns_the_same_live_context() {
        let manager = manager();
        let session = SessionId("s1".to_string());

        let first = manager.checkout(&session).await;
        first.lock().await.note_turn(turn_with_vm(100));

        let second = manager.checkout(&session).await;
        assert_eq!(second.lock().await.turn_count(), 1);
    }

    #[tokio::test]
    async fn persisted_context_survives_a_cold_checkout() {
        let store = Arc::new(InMemorySessionStore::new());
        let session = SessionId("s1".to_string());

        let warm = SessionManager::new(Arc::clone(&store) as _, DialogueSettings::default());
        let context = warm.checkout(&session).await;
        {
            let mut guard = context.lock().await;
            guard.note_turn(turn_with_vm(204));
            warm.persist(&session, &guard).await.unwrap();
        }

        // A new manager simulates a process restart.
        let cold = SessionManager::new(store as _, DialogueSettings::default());
        let restored = cold.checkout(&session).await;
        let guard = restored.lock().await;
        assert_eq!(
            guard.resolve(EntityType::VmId).and_then(|e| e.resolved.clone()),
            Some(EntityValue::VmId(204))
        );
    }

    #[tokio::test]
    async fn corrupt_snapshot_yields_a_fresh_context() {
        let store = Arc::new(InMemorySessionStore::new());
        let session = SessionId("s1".to_string());
        store.save(&session, "not json at all").await.unwrap();

        let manager = SessionManager::new(store as _, DialogueSettings::default());
        let context = manager.checkout(&session).await;
        assert_eq!(context.lock().await.turn_count(), 0);
    }

    #[tokio::test]
    async fn unreadable_store_still_yields_a_usable_context() {
        struct BrokenStore;

        #[async_trait::async_trait]
        impl SessionStore for BrokenStore {
            async fn save(&self, _: &SessionId, _: &str) -> Result<(), SessionStoreError> {
                Err(SessionStoreError::Backend("disk full".to_string()))
            }
            async fn load(&self, _: &SessionId) -> Result<Option<String>, SessionStoreError> {
                Err(SessionStoreError::Backend("disk full".to_string()))
            }
            async fn delete(&self, _: &SessionId) -> Result<(), SessionStoreError> {
                Err(SessionStoreError::Backend("disk full".to_string()))
            }
        }

        let manager = SessionManager::new(Arc::new(BrokenStore), DialogueSettings::default());
        let context = manager.checkout(&SessionId("s1".to_string())).await;
        assert_eq!(context.lock().await.turn_count(), 0);
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_from_the_live_map() {
        let settings = DialogueSettings { session_idle_secs: 0, ..DialogueSettings::default() };
        let manager = SessionManager::new(Arc::new(InMemorySessionStore::new()), settings);

        let stale = manager.checkout(&SessionId("old".to_string())).await;
        drop(stale);
        manager.checkout(&SessionId("new".to_string())).await;

        // The sweep on the second checkout dropped the idle entry.
        assert_eq!(manager.live_count().await, 1);
    }

    #[tokio::test]
    async fn distinct_sessions_do_not_share_context() {
        let manager = manager();
        let first = manager.checkout(&SessionId("s1".to_string())).await;
        first.lock().await.note_turn(turn_with_vm(100));

        let second = manager.checkout(&SessionId("s2".to_string())).await;
        assert!(second.lock().await.resolve(EntityType::VmId).is_none());
    }
}
