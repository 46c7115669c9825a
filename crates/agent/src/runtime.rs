//! The conversational pipeline: one utterance in, one reply out.
//!
//! A turn walks a fixed order: preprocessing, the pending-action gate
//! (confirmations and slot filling preempt everything), pattern-based
//! intent identification with the LLM fallback behind it, entity
//! extraction, the confirmation gate for destructive intents, dispatch,
//! and response rendering. Every failure along the way except a broken
//! internal contract degrades into a conversational reply; the caller
//! only ever sees an `Err` for defects worth paging over.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use opsbot_core::config::{AppConfig, DialogueSettings, LlmProvider, NluSettings};
use opsbot_core::context::{ConversationContext, SessionStore, TurnRecord};
use opsbot_core::dialogue::{classify_reply, ConfirmationReply, DialogueMachine, DialogueState};
use opsbot_core::domain::command::{Command, HandlerResult};
use opsbot_core::domain::entity::{Entity, EntitySource};
use opsbot_core::domain::intent::{IntentCandidate, IntentSource};
use opsbot_core::entities::{EntityExtractor, NearMiss};
use opsbot_core::errors::PipelineError;
use opsbot_core::intent::{IntentDecision, IntentScorer};
use opsbot_core::preprocess::{Preprocessor, TokenStream};
use opsbot_core::response::ResponseGenerator;
use opsbot_core::schema::{IntentRegistry, ResourceInventory};
use opsbot_core::{IntentName, SessionId, UserId};

use crate::backend::DemoBackend;
use crate::dispatch::{Dispatcher, HandlerRegistry};
use crate::llm::{LlmAssist, LlmClient};
use crate::providers::{OllamaClient, OpenAiCompatClient};
use crate::session::{InMemorySessionStore, SessionManager};

/// What a turn amounted to, for callers that need more than the text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// A command was dispatched and its result rendered.
    Executed,
    /// A destructive action is parked awaiting yes/no.
    AwaitingConfirmation,
    /// Required slots are still missing; the user was prompted.
    AwaitingSlots,
    /// Two intents were too close to call; the user was asked which.
    Clarification,
    /// A pending action was called off.
    Cancelled,
    /// Nothing actionable; the user was asked to rephrase.
    Reprompt,
}

#[derive(Clone, Debug)]
pub struct TurnOutput {
    pub response: String,
    pub outcome: TurnOutcome,
    pub intent: Option<IntentName>,
    pub result: Option<HandlerResult>,
}

/// Internal per-turn accumulator; `entities` feeds the context record so
/// later turns can resolve anaphora against this one.
struct TurnStep {
    response: String,
    outcome: TurnOutcome,
    intent: Option<IntentName>,
    result: Option<HandlerResult>,
    entities: Vec<Entity>,
}

impl TurnStep {
    fn reply(response: String, outcome: TurnOutcome) -> Self {
        Self { response, outcome, intent: None, result: None, entities: Vec::new() }
    }
}

pub struct Pipeline {
    registry: Arc<IntentRegistry>,
    inventory: ResourceInventory,
    preprocessor: Preprocessor,
    scorer: IntentScorer,
    extractor: EntityExtractor,
    dialogue: DialogueMachine,
    responses: ResponseGenerator,
    dispatcher: Dispatcher,
    sessions: SessionManager,
    nlu: NluSettings,
    llm: Option<LlmAssist>,
    paraphrase: bool,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<IntentRegistry>,
        inventory: ResourceInventory,
        dispatcher: Dispatcher,
        sessions: SessionManager,
        nlu: NluSettings,
        dialogue: DialogueSettings,
        llm: Option<LlmAssist>,
        paraphrase: bool,
    ) -> Self {
        Self {
            registry,
            inventory,
            preprocessor: Preprocessor::new(),
            scorer: IntentScorer::new(nlu),
            extractor: EntityExtractor::new(nlu.fuzzy_threshold),
            dialogue: DialogueMachine::new(dialogue),
            responses: ResponseGenerator::new(),
            dispatcher,
            sessions,
            nlu,
            llm,
            paraphrase,
        }
    }

    /// Fully wired pipeline over the in-memory demo backend, with the LLM
    /// client taken from config. This is what the chat CLI runs.
    pub fn demo(config: &AppConfig) -> anyhow::Result<Self> {
        Self::demo_with_store(config, Arc::new(InMemorySessionStore::new()))
    }

    /// Same demo wiring with a caller-supplied session store, so sessions
    /// can survive process restarts.
    pub fn demo_with_store(
        config: &AppConfig,
        store: Arc<dyn SessionStore>,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(IntentRegistry::builtin());
        let backend = Arc::new(DemoBackend::new());
        let inventory = backend.inventory();
        let handlers = HandlerRegistry::new(&registry, backend.handlers(&registry))?;
        let dispatcher = Dispatcher::new(Arc::clone(&registry), handlers);
        let sessions = SessionManager::new(store, config.dialogue);

        let llm = if config.llm.enabled {
            let client: Arc<dyn LlmClient> = match config.llm.provider {
                LlmProvider::Ollama => {
                    let base_url = config
                        .llm
                        .base_url
                        .as_deref()
                        .unwrap_or("http://localhost:11434");
                    Arc::new(OllamaClient::new(
                        base_url,
                        &config.llm.model,
                        config.llm.timeout_secs,
                    )?)
                }
                LlmProvider::OpenAiCompat => {
                    let base_url = config
                        .llm
                        .base_url
                        .as_deref()
                        .ok_or_else(|| anyhow::anyhow!("openai_compat requires llm.base_url"))?;
                    let api_key = config
                        .llm
                        .api_key
                        .clone()
                        .ok_or_else(|| anyhow::anyhow!("openai_compat requires llm.api_key"))?;
                    Arc::new(OpenAiCompatClient::new(
                        base_url,
                        api_key,
                        &config.llm.model,
                        config.llm.timeout_secs,
                    )?)
                }
            };
            Some(LlmAssist::new(client, config.llm.timeout_secs))
        } else {
            None
        };

        Ok(Self::new(
            registry,
            inventory,
            dispatcher,
            sessions,
            config.nlu,
            config.dialogue,
            llm,
            config.llm.paraphrase,
        ))
    }

    /// Run one conversational turn for a session.
    pub async fn process(
        &self,
        text: &str,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<TurnOutput, PipelineError> {
        let handle = self.sessions.checkout(session_id).await;
        let mut context = handle.lock().await;
        let now = Utc::now();
        let stream = self.preprocessor.run(text);

        info!(
            event_name = "turn.received",
            session_id = %session_id,
            chars = text.len(),
            "processing utterance"
        );

        let step = self
            .drive_turn(text, &stream, session_id, user_id, &mut context, now)
            .await?;

        context.note_turn(TurnRecord {
            utterance: text.to_string(),
            intent: step.intent.clone(),
            entities: step.entities,
            response: step.response.clone(),
            at: now,
        });
        if let Err(error) = self.sessions.persist(session_id, &context).await {
            // The turn already happened; losing the snapshot only costs
            // cross-restart continuity.
            warn!(
                event_name = "turn.persist_failed",
                session_id = %session_id,
                error = %error,
                "session snapshot not persisted"
            );
        }

        Ok(TurnOutput {
            response: step.response,
            outcome: step.outcome,
            intent: step.intent,
            result: step.result,
        })
    }

    async fn drive_turn(
        &self,
        text: &str,
        stream: &TokenStream,
        session_id: &SessionId,
        user_id: &UserId,
        context: &mut ConversationContext,
        now: DateTime<Utc>,
    ) -> Result<TurnStep, PipelineError> {
        if stream.is_effectively_empty() {
            return Ok(self.recover(PipelineError::EmptyInput, &[]));
        }

        // An expired pending action is dropped with a notice, and the
        // utterance continues as a fresh request.
        let mut notice = None;
        if context.pending().is_some_and(|pending| pending.is_expired(now)) {
            context.take_pending();
            info!(
                event_name = "turn.pending_expired",
                session_id = %session_id,
                error = %PipelineError::ConfirmationTimeout,
                "dropped pending action"
            );
            notice = Some(self.responses.expired_notice());
        }

        let mut step = match context.pending().map(|pending| pending.state()) {
            Some(DialogueState::AwaitingConfirmation) => {
                self.confirmation_turn(text, stream, session_id, user_id, context, now).await?
            }
            Some(DialogueState::AwaitingSlots) => {
                self.slot_fill_turn(text, stream, session_id, user_id, context, now).await?
            }
            _ => self.fresh_turn(text, stream, session_id, user_id, context, now).await?,
        };

        if let Some(notice) = notice {
            step.response = format!("{notice} {}", step.response);
        }
        Ok(step)
    }

    /// The session is waiting for yes/no on a complete destructive action.
    async fn confirmation_turn(
        &self,
        text: &str,
        stream: &TokenStream,
        session_id: &SessionId,
        user_id: &UserId,
        context: &mut ConversationContext,
        now: DateTime<Utc>,
    ) -> Result<TurnStep, PipelineError> {
        match classify_reply(stream) {
            ConfirmationReply::Affirmative => {
                let pending = context.take_pending().ok_or_else(|| {
                    PipelineError::ContractViolation("confirmation turn without pending".into())
                })?;
                info!(
                    event_name = "turn.confirmed",
                    session_id = %session_id,
                    intent = %pending.intent,
                    "destructive action confirmed"
                );
                // Dispatch exactly what was proposed; this turn's words
                // contribute nothing to the command.
                self.execute(pending.intent, pending.entities, session_id, user_id).await
            }
            ConfirmationReply::Negative => {
                let pending = context.take_pending().ok_or_else(|| {
                    PipelineError::ContractViolation("confirmation turn without pending".into())
                })?;
                info!(
                    event_name = "turn.cancelled",
                    session_id = %session_id,
                    intent = %pending.intent,
                    "pending action cancelled"
                );
                Ok(TurnStep::reply(
                    self.responses.cancelled_notice(&pending),
                    TurnOutcome::Cancelled,
                ))
            }
            ConfirmationReply::Other => {
                // A recognizable new request implicitly abandons the old
                // one; anything else burns a turn and reprompts.
                if let Some(candidate) = self.identify(text, stream).await? {
                    let pending = context.take_pending().ok_or_else(|| {
                        PipelineError::ContractViolation("confirmation turn without pending".into())
                    })?;
                    let cancelled = self.responses.cancelled_notice(&pending);
                    let mut step = self
                        .accepted_intent(candidate, text, stream, session_id, user_id, context, now)
                        .await?;
                    step.response = format!("{cancelled} {}", step.response);
                    return Ok(step);
                }

                let Some(pending) = context.pending_mut() else {
                    return Err(PipelineError::ContractViolation(
                        "confirmation turn without pending".into(),
                    ));
                };
                self.dialogue.consume_turn(pending);
                let prompt = self.responses.confirmation_prompt(pending);
                Ok(TurnStep::reply(prompt, TurnOutcome::AwaitingConfirmation))
            }
        }
    }

    /// The session is waiting for the user to supply missing slots.
    async fn slot_fill_turn(
        &self,
        text: &str,
        stream: &TokenStream,
        session_id: &SessionId,
        user_id: &UserId,
        context: &mut ConversationContext,
        now: DateTime<Utc>,
    ) -> Result<TurnStep, PipelineError> {
        if classify_reply(stream) == ConfirmationReply::Negative {
            let pending = context.take_pending().ok_or_else(|| {
                PipelineError::ContractViolation("slot-fill turn without pending".into())
            })?;
            return Ok(TurnStep::reply(
                self.responses.cancelled_notice(&pending),
                TurnOutcome::Cancelled,
            ));
        }

        let (missing, intent) = match context.pending() {
            Some(pending) => (pending.missing.clone(), pending.intent.clone()),
            None => {
                return Err(PipelineError::ContractViolation(
                    "slot-fill turn without pending".into(),
                ))
            }
        };

        // A full new command preempts the parked one before its words are
        // mined for slot values: "start vm 101" while a stop waits on its
        // id must not fill the stop. Pattern matches only here; the LLM
        // never reinterprets a likely slot answer.
        if let IntentDecision::Accepted(candidate) = self.scorer.identify(&self.registry, stream) {
            if candidate.name != intent {
                let pending = context.take_pending().ok_or_else(|| {
                    PipelineError::ContractViolation("slot-fill turn without pending".into())
                })?;
                let cancelled = self.responses.cancelled_notice(&pending);
                let mut step = self
                    .accepted_intent(candidate, text, stream, session_id, user_id, context, now)
                    .await?;
                step.response = format!("{cancelled} {}", step.response);
                return Ok(step);
            }
        }

        let filled = self.extractor.extract_slots(&missing, stream, &self.inventory, context);

        if filled.entities.is_empty() {
            // The answer filled nothing. A clear new request wins over the
            // parked one; otherwise burn a turn and ask again.
            if let Some(candidate) = self.identify(text, stream).await? {
                if candidate.name != intent {
                    let pending = context.take_pending().ok_or_else(|| {
                        PipelineError::ContractViolation("slot-fill turn without pending".into())
                    })?;
                    let cancelled = self.responses.cancelled_notice(&pending);
                    let mut step = self
                        .accepted_intent(candidate, text, stream, session_id, user_id, context, now)
                        .await?;
                    step.response = format!("{cancelled} {}", step.response);
                    return Ok(step);
                }
            }

            let Some(pending) = context.pending_mut() else {
                return Err(PipelineError::ContractViolation(
                    "slot-fill turn without pending".into(),
                ));
            };
            self.dialogue.consume_turn(pending);
            let error = PipelineError::MissingEntities {
                intent: pending.intent.clone(),
                missing: pending.missing.clone(),
            };
            return Ok(self.recover(error, &filled.near_misses));
        }

        for entity in &filled.entities {
            context.remember_entity(entity.clone());
        }
        let Some(pending) = context.pending_mut() else {
            return Err(PipelineError::ContractViolation("slot-fill turn without pending".into()));
        };
        for entity in filled.entities {
            pending.missing.retain(|slot| *slot != entity.entity_type);
            pending.entities.push(entity);
        }

        if !pending.missing.is_empty() {
            self.dialogue.consume_turn(pending);
            let error = PipelineError::MissingEntities {
                intent: pending.intent.clone(),
                missing: pending.missing.clone(),
            };
            return Ok(self.recover(error, &filled.near_misses));
        }

        if pending.destructive {
            // Slots are complete; the action now parks at the yes/no gate.
            let prompt = self.responses.confirmation_prompt(pending);
            let entities = pending.entities.clone();
            let intent = pending.intent.clone();
            return Ok(TurnStep {
                response: prompt,
                outcome: TurnOutcome::AwaitingConfirmation,
                intent: Some(intent),
                result: None,
                entities,
            });
        }

        let pending = context.take_pending().ok_or_else(|| {
            PipelineError::ContractViolation("slot-fill turn without pending".into())
        })?;
        self.execute(pending.intent, pending.entities, session_id, user_id).await
    }

    /// No pending action: identify, extract, gate, dispatch.
    async fn fresh_turn(
        &self,
        text: &str,
        stream: &TokenStream,
        session_id: &SessionId,
        user_id: &UserId,
        context: &mut ConversationContext,
        now: DateTime<Utc>,
    ) -> Result<TurnStep, PipelineError> {
        let decision = self.scorer.identify(&self.registry, stream);

        let candidate = match decision {
            IntentDecision::Accepted(candidate) => candidate,
            IntentDecision::NearTie { best, runner_up } => {
                info!(
                    event_name = "turn.near_tie",
                    session_id = %session_id,
                    best = %best.name,
                    runner_up = %runner_up.name,
                    "asking user to disambiguate"
                );
                let error =
                    PipelineError::AmbiguousIntent { candidates: Box::new((best, runner_up)) };
                return Ok(self.recover(error, &[]));
            }
            IntentDecision::BelowThreshold { best } => {
                if let Some(best) = &best {
                    info!(
                        event_name = "turn.below_threshold",
                        session_id = %session_id,
                        best = %best.name,
                        confidence = best.confidence,
                        "no pattern cleared the threshold"
                    );
                }
                match self.llm_fallback(text).await {
                    Some(candidate) => candidate,
                    None => return Ok(self.recover(PipelineError::NoIntentMatch, &[])),
                }
            }
        };

        self.accepted_intent(candidate, text, stream, session_id, user_id, context, now).await
    }

    /// Everything after an intent is settled: slots, gates, dispatch.
    #[allow(clippy::too_many_arguments)]
    async fn accepted_intent(
        &self,
        candidate: IntentCandidate,
        text: &str,
        stream: &TokenStream,
        session_id: &SessionId,
        user_id: &UserId,
        context: &mut ConversationContext,
        now: DateTime<Utc>,
    ) -> Result<TurnStep, PipelineError> {
        let schema = self.registry.get(&candidate.name).ok_or_else(|| {
            PipelineError::ContractViolation(format!(
                "accepted intent `{}` missing from catalog",
                candidate.name
            ))
        })?;

        let mut extraction = self.extractor.extract(schema, stream, &self.inventory, context);

        // The model may point at slot mentions the structural pass missed,
        // but never at the slot a destructive action is aimed at. What it
        // points to is re-resolved deterministically.
        if !extraction.missing.is_empty() {
            if let Some(assist) = &self.llm {
                let guarded = schema.destructive.then(|| schema.target_slot()).flatten();
                let mut still_missing = Vec::new();
                for slot in std::mem::take(&mut extraction.missing) {
                    if Some(slot) == guarded {
                        still_missing.push(slot);
                        continue;
                    }
                    match assist.extract_slot(text, slot.label()).await {
                        Ok(Some(guess)) => {
                            let mention_stream = self.preprocessor.run(&guess.mention);
                            let mut resolved = self.extractor.extract_slots(
                                &[slot],
                                &mention_stream,
                                &self.inventory,
                                context,
                            );
                            match resolved.entities.pop() {
                                Some(mut entity) => {
                                    if entity.source == EntitySource::Pattern {
                                        entity.source = EntitySource::Llm;
                                    }
                                    extraction.entities.push(entity);
                                }
                                None => still_missing.push(slot),
                            }
                        }
                        Ok(None) => still_missing.push(slot),
                        Err(error) => {
                            warn!(
                                event_name = "turn.llm_slot_failed",
                                session_id = %session_id,
                                slot = slot.label(),
                                error = %error,
                                "slot assist unavailable"
                            );
                            still_missing.push(slot);
                        }
                    }
                }
                extraction.missing = still_missing;
            }
        }

        for entity in &extraction.entities {
            context.remember_entity(entity.clone());
        }

        if !extraction.missing.is_empty() {
            let pending = self.dialogue.propose_slot_fill(
                candidate.name.clone(),
                extraction.entities.clone(),
                extraction.missing.clone(),
                schema.destructive,
                now,
            );
            context.set_pending(pending);
            let error = PipelineError::MissingEntities {
                intent: candidate.name.clone(),
                missing: extraction.missing,
            };
            let mut step = self.recover(error, &extraction.near_misses);
            step.intent = Some(candidate.name);
            step.entities = extraction.entities;
            return Ok(step);
        }

        log_near_misses(session_id, &extraction.near_misses);

        if schema.destructive {
            let pending = self.dialogue.propose_confirmation(
                candidate.name.clone(),
                extraction.entities.clone(),
                now,
            );
            let prompt = self.responses.confirmation_prompt(&pending);
            context.set_pending(pending);
            return Ok(TurnStep {
                response: prompt,
                outcome: TurnOutcome::AwaitingConfirmation,
                intent: Some(candidate.name),
                result: None,
                entities: extraction.entities,
            });
        }

        self.execute(candidate.name, extraction.entities, session_id, user_id).await
    }

    async fn execute(
        &self,
        intent: IntentName,
        entities: Vec<Entity>,
        session_id: &SessionId,
        user_id: &UserId,
    ) -> Result<TurnStep, PipelineError> {
        let command =
            Command::new(intent.clone(), entities.clone(), user_id.clone(), session_id.clone());
        let result = self.dispatcher.dispatch(&command).await?;
        let literal = self.responses.render(&intent, &result);
        let response = self.maybe_paraphrase(literal).await;

        Ok(TurnStep {
            response,
            outcome: TurnOutcome::Executed,
            intent: Some(intent),
            result: Some(result),
            entities,
        })
    }

    /// Turn a recoverable error into the conversational reply it stands
    /// for. Every variant except `ContractViolation` passes through here;
    /// `near` carries the fuzzy suggestions slot prompts append.
    fn recover(&self, error: PipelineError, near: &[NearMiss]) -> TurnStep {
        match &error {
            PipelineError::EmptyInput => {
                TurnStep::reply(self.responses.reprompt_empty(), TurnOutcome::Reprompt)
            }
            // A rejected fuzzy match leaves its slot missing, so by itself
            // it earns the same rephrase ask as an unplaced utterance.
            PipelineError::NoIntentMatch
            | PipelineError::LlmUnavailable(_)
            | PipelineError::LowConfidenceResolution { .. } => {
                TurnStep::reply(self.responses.reprompt_unknown(), TurnOutcome::Reprompt)
            }
            PipelineError::AmbiguousIntent { candidates } => TurnStep::reply(
                self.responses.clarification(&candidates.0, &candidates.1),
                TurnOutcome::Clarification,
            ),
            PipelineError::MissingEntities { intent, missing } => TurnStep::reply(
                self.responses.slot_prompt(intent, missing, near),
                TurnOutcome::AwaitingSlots,
            ),
            PipelineError::ConfirmationTimeout => {
                TurnStep::reply(self.responses.expired_notice(), TurnOutcome::Reprompt)
            }
            // Internal failures never reach this mapping; answer with the
            // safe reprompt if one ever does.
            PipelineError::HandlerExecution(_) | PipelineError::ContractViolation(_) => {
                TurnStep::reply(self.responses.reprompt_unknown(), TurnOutcome::Reprompt)
            }
        }
    }

    /// Pattern identification shared by the gate paths, with the LLM
    /// fallback behind it. `None` means the utterance stays unplaced.
    async fn identify(
        &self,
        text: &str,
        stream: &TokenStream,
    ) -> Result<Option<IntentCandidate>, PipelineError> {
        match self.scorer.identify(&self.registry, stream) {
            IntentDecision::Accepted(candidate) => Ok(Some(candidate)),
            IntentDecision::NearTie { .. } => Ok(None),
            IntentDecision::BelowThreshold { .. } => Ok(self.llm_fallback(text).await),
        }
    }

    /// Ask the model which catalog intent fits. Any failure or low
    /// confidence collapses to "unknown"; the fallback can only ever add
    /// an intent the patterns missed, never block the turn.
    async fn llm_fallback(&self, text: &str) -> Option<IntentCandidate> {
        let assist = self.llm.as_ref()?;
        match assist.classify_intent(text, &self.registry.descriptors()).await {
            Ok(guess) if guess.confidence >= self.nlu.acceptance_threshold => {
                info!(
                    event_name = "turn.llm_fallback",
                    intent = %guess.intent,
                    confidence = guess.confidence,
                    "llm fallback accepted"
                );
                Some(IntentCandidate {
                    name: guess.intent,
                    confidence: guess.confidence,
                    source: IntentSource::Llm,
                    matched_pattern: None,
                    matched_slots: 0,
                })
            }
            Ok(guess) => {
                info!(
                    event_name = "turn.llm_fallback_low",
                    intent = %guess.intent,
                    confidence = guess.confidence,
                    "llm fallback below threshold"
                );
                None
            }
            Err(error) => {
                let error = PipelineError::LlmUnavailable(error.to_string());
                warn!(
                    event_name = "turn.llm_unavailable",
                    error = %error,
                    "llm fallback skipped"
                );
                None
            }
        }
    }

    /// Cosmetic rewording of a rendered reply; the literal always wins on
    /// any failure.
    async fn maybe_paraphrase(&self, literal: String) -> String {
        if !self.paraphrase {
            return literal;
        }
        let Some(assist) = &self.llm else {
            return literal;
        };
        match assist.paraphrase(&literal).await {
            Ok(text) => text,
            Err(error) => {
                warn!(
                    event_name = "turn.paraphrase_failed",
                    error = %error,
                    "keeping literal response"
                );
                literal
            }
        }
    }
}

fn log_near_misses(session_id: &SessionId, near_misses: &[NearMiss]) {
    for near in near_misses {
        let error = PipelineError::LowConfidenceResolution {
            entity_type: near.entity_type,
            best: near.candidate.clone(),
            score: near.score,
        };
        info!(
            event_name = "turn.near_miss",
            session_id = %session_id,
            error = %error,
            "fuzzy match below the resolution floor"
        );
    }
}
