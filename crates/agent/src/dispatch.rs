//! Command dispatch to registered intent handlers.
//!
//! The registry is checked against the intent catalog at construction:
//! a handler for an unknown intent and a catalog intent with no handler
//! are both startup errors, never runtime surprises. Dispatch re-checks
//! the command contract (every required slot resolved) before touching a
//! handler; a violation there is an internal defect and is the one path
//! that does not turn into a conversational reply.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info};

use opsbot_core::domain::command::{Command, ErrorKind, HandlerResult};
use opsbot_core::errors::PipelineError;
use opsbot_core::schema::IntentRegistry;
use opsbot_core::IntentName;

/// The seam to the actual infrastructure backend. One handler per intent.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn intent(&self) -> IntentName;
    async fn execute(&self, command: &Command) -> anyhow::Result<HandlerResult>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler registered for unknown intent `{0}`")]
    UnknownIntent(IntentName),
    #[error("catalog intent `{0}` has no handler")]
    UnhandledIntent(IntentName),
    #[error("duplicate handler for intent `{0}`")]
    DuplicateHandler(IntentName),
}

/// Complete intent-to-handler table, validated against the catalog.
pub struct HandlerRegistry {
    handlers: HashMap<IntentName, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new(
        catalog: &IntentRegistry,
        handlers: Vec<Arc<dyn CommandHandler>>,
    ) -> Result<Self, RegistryError> {
        let mut table: HashMap<IntentName, Arc<dyn CommandHandler>> =
            HashMap::with_capacity(handlers.len());
        for handler in handlers {
            let intent = handler.intent();
            if catalog.get(&intent).is_none() {
                return Err(RegistryError::UnknownIntent(intent));
            }
            if table.insert(intent.clone(), handler).is_some() {
                return Err(RegistryError::DuplicateHandler(intent));
            }
        }
        for schema in catalog.iter() {
            if !table.contains_key(&schema.name) {
                return Err(RegistryError::UnhandledIntent(schema.name.clone()));
            }
        }
        Ok(Self { handlers: table })
    }

    fn get(&self, intent: &IntentName) -> Option<&Arc<dyn CommandHandler>> {
        self.handlers.get(intent)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut intents: Vec<&IntentName> = self.handlers.keys().collect();
        intents.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        f.debug_struct("HandlerRegistry").field("intents", &intents).finish()
    }
}

pub struct Dispatcher {
    catalog: Arc<IntentRegistry>,
    registry: HandlerRegistry,
}

impl Dispatcher {
    pub fn new(catalog: Arc<IntentRegistry>, registry: HandlerRegistry) -> Self {
        Self { catalog, registry }
    }

    /// Execute a validated command. Handler failures come back as failed
    /// `HandlerResult`s; only a broken command contract is an `Err`.
    pub async fn dispatch(&self, command: &Command) -> Result<HandlerResult, PipelineError> {
        let schema = self.catalog.get(&command.intent).ok_or_else(|| {
            PipelineError::ContractViolation(format!(
                "command carries unknown intent `{}`",
                command.intent
            ))
        })?;

        for slot in &schema.required {
            if command.value_of(*slot).is_none() {
                error!(
                    event_name = "dispatch.contract_violation",
                    intent = %command.intent,
                    command_id = %command.command_id,
                    slot = slot.label(),
                    "required slot reached dispatch unresolved"
                );
                return Err(PipelineError::ContractViolation(format!(
                    "required {} unresolved in `{}` command",
                    slot.label(),
                    command.intent
                )));
            }
        }

        let handler = self.registry.get(&command.intent).ok_or_else(|| {
            // Unreachable given registry construction, kept as a contract check.
            PipelineError::ContractViolation(format!("no handler for `{}`", command.intent))
        })?;

        info!(
            event_name = "dispatch.execute",
            intent = %command.intent,
            command_id = %command.command_id,
            session_id = %command.session_id,
            "dispatching command"
        );

        match handler.execute(command).await {
            Ok(result) => Ok(result),
            Err(source) => {
                let error = PipelineError::HandlerExecution(source.to_string());
                error!(
                    event_name = "dispatch.handler_failed",
                    intent = %command.intent,
                    command_id = %command.command_id,
                    error = %error,
                    "handler returned an error"
                );
                Ok(HandlerResult::fail(ErrorKind::HandlerError, source.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{CommandHandler, Dispatcher, HandlerRegistry, RegistryError};
    use opsbot_core::domain::command::{Command, HandlerResult};
    use opsbot_core::domain::entity::{Entity, EntitySource, EntityType, EntityValue};
    use opsbot_core::domain::utterance::{SessionId, UserId};
    use opsbot_core::errors::PipelineError;
    use opsbot_core::schema::IntentRegistry;
    use opsbot_core::IntentName;

    struct StubHandler {
        intent: IntentName,
        fail: bool,
    }

    #[async_trait]
    impl CommandHandler for StubHandler {
        fn intent(&self) -> IntentName {
            self.intent.clone()
        }

        async fn execute(&self, _command: &Command) -> anyhow::Result<HandlerResult> {
            if self.fail {
                anyhow::bail!("backend exploded");
            }
            Ok(HandlerResult::ok("done"))
        }
    }

    fn full_handler_set(fail_intent: Option<&str>) -> Vec<Arc<dyn CommandHandler>> {
        let catalog = IntentRegistry::builtin();
        catalog
            .iter()
            .map(|schema| {
                Arc::new(StubHandler {
                    intent: schema.name.clone(),
                    fail: fail_intent == Some(schema.name.as_str()),
                }) as Arc<dyn CommandHandler>
            })
            .collect()
    }

    fn vm_command(resolved: bool) -> Command {
        Command::new(
            IntentName::new("vm_start"),
            vec![Entity {
                entity_type: EntityType::VmId,
                raw: "100".to_string(),
                resolved: resolved.then_some(EntityValue::VmId(100)),
                span: (0, 3),
                confidence: 1.0,
                source: EntitySource::Pattern,
            }],
            UserId("u1".to_string()),
            SessionId("s1".to_string()),
        )
    }

    #[test]
    fn registry_rejects_unknown_and_missing_handlers() {
        let catalog = IntentRegistry::builtin();

        let mut handlers = full_handler_set(None);
        handlers.push(Arc::new(StubHandler { intent: IntentName::new("nonsense"), fail: false }));
        assert!(matches!(
            HandlerRegistry::new(&catalog, handlers).unwrap_err(),
            RegistryError::UnknownIntent(_)
        ));

        let mut handlers = full_handler_set(None);
        handlers.pop();
        assert!(matches!(
            HandlerRegistry::new(&catalog, handlers).unwrap_err(),
            RegistryError::UnhandledIntent(_)
        ));
    }

    #[tokio::test]
    async fn handler_errors_become_failed_results() {
        let catalog = Arc::new(IntentRegistry::builtin());
        let registry =
            HandlerRegistry::new(&catalog, full_handler_set(Some("vm_start"))).unwrap();
        let dispatcher = Dispatcher::new(catalog, registry);

        let result = dispatcher.dispatch(&vm_command(true)).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("backend exploded"));
    }

    #[tokio::test]
    async fn unresolved_required_slot_is_a_contract_violation() {
        let catalog = Arc::new(IntentRegistry::builtin());
        let registry = HandlerRegistry::new(&catalog, full_handler_set(None)).unwrap();
        let dispatcher = Dispatcher::new(catalog, registry);

        let error = dispatcher.dispatch(&vm_command(false)).await.unwrap_err();
        assert!(matches!(error, PipelineError::ContractViolation(_)));
        assert!(!error.is_conversational());
    }
}
