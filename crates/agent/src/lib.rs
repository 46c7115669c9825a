//! Async pipeline runtime around the deterministic NLU core.
//!
//! This crate wires the pure components from `opsbot-core` into a full
//! conversational turn: session checkout, confirmation gating, the LLM
//! fallback for utterances the pattern scorer cannot place, command
//! dispatch to registered handlers, and response rendering with an
//! optional paraphrase pass.
//!
//! # Key Types
//!
//! - `Pipeline` - one turn in, one reply out (see `runtime` module)
//! - `LlmClient` - pluggable completion backend (Ollama or any
//!   OpenAI-compatible endpoint)
//! - `CommandHandler` - the seam to the actual infrastructure backend
//! - `SessionManager` - checkout/persist of per-session context blobs
//!
//! # Safety Principle
//!
//! The LLM is strictly a translator. It can suggest an intent name from
//! the published catalog or point at a slot mention in the user's own
//! words; it never invents identifiers, never bypasses the confirmation
//! gate, and its absence degrades the pipeline to pattern-only matching
//! rather than failing the turn.

pub mod backend;
pub mod dispatch;
pub mod llm;
pub mod providers;
pub mod runtime;
pub mod session;

pub use backend::DemoBackend;
pub use dispatch::{CommandHandler, Dispatcher, HandlerRegistry, RegistryError};
pub use llm::{AdapterError, IntentGuess, LlmAssist, LlmClient, SlotGuess};
pub use providers::{OllamaClient, OpenAiCompatClient};
pub use runtime::{Pipeline, TurnOutcome, TurnOutput};
pub use session::{InMemorySessionStore, SessionManager};
