//! Deterministic core of the opsbot NLU + dialogue pipeline.
//!
//! Everything in this crate is synchronous and side-effect free: text
//! preprocessing, pattern-based intent identification, entity extraction
//! with fuzzy resolution, per-session conversation context, the
//! confirmation state machine, and template response rendering. The LLM
//! fallback, command dispatch, and session persistence live in the agent
//! and db crates and plug in through the traits defined here.

pub mod config;
pub mod context;
pub mod dialogue;
pub mod domain;
pub mod entities;
pub mod errors;
pub mod intent;
pub mod preprocess;
pub mod response;
pub mod schema;

pub use config::{AppConfig, ConfigError, ConfigOverrides, DialogueSettings, LoadOptions, NluSettings};
pub use context::{ConversationContext, SessionStore, SessionStoreError, TurnRecord};
pub use dialogue::{classify_reply, ConfirmationReply, DialogueMachine, DialogueState, PendingAction};
pub use domain::command::{Command, ErrorKind, HandlerResult};
pub use domain::entity::{Entity, EntitySource, EntityType, EntityValue};
pub use domain::intent::{IntentCandidate, IntentName, IntentSource, PatternId};
pub use domain::utterance::{SessionId, UserId, Utterance};
pub use entities::{EntityExtractor, ExtractionOutcome, NearMiss};
pub use errors::PipelineError;
pub use intent::{IntentDecision, IntentScorer};
pub use preprocess::{Preprocessor, Token, TokenStream};
pub use response::ResponseGenerator;
pub use schema::{
    ContainerRef, IntentDescriptor, IntentRegistry, IntentSchema, MatchPattern,
    ResourceInventory, SchemaError, ServiceRef, VmRef,
};
