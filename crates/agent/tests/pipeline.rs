//! End-to-end conversation tests over the demo backend.

use std::sync::Arc;

use async_trait::async_trait;

use opsbot_agent::dispatch::{Dispatcher, HandlerRegistry};
use opsbot_agent::llm::{AdapterError, LlmAssist, LlmClient};
use opsbot_agent::runtime::{Pipeline, TurnOutcome, TurnOutput};
use opsbot_agent::session::{InMemorySessionStore, SessionManager};
use opsbot_agent::DemoBackend;
use opsbot_core::config::{AppConfig, DialogueSettings, NluSettings};
use opsbot_core::context::{SessionStore, SessionStoreError};
use opsbot_core::schema::IntentRegistry;
use opsbot_core::{IntentName, SessionId, UserId};

fn pipeline() -> Pipeline {
    Pipeline::demo(&AppConfig::default()).expect("demo pipeline wires up")
}

fn pipeline_with_llm(client: Arc<dyn LlmClient>, paraphrase: bool) -> Pipeline {
    let registry = Arc::new(IntentRegistry::builtin());
    let backend = Arc::new(DemoBackend::new());
    let inventory = backend.inventory();
    let handlers = HandlerRegistry::new(&registry, backend.handlers(&registry)).expect("handlers");
    let dispatcher = Dispatcher::new(Arc::clone(&registry), handlers);
    let sessions =
        SessionManager::new(Arc::new(InMemorySessionStore::new()), DialogueSettings::default());
    Pipeline::new(
        registry,
        inventory,
        dispatcher,
        sessions,
        NluSettings::default(),
        DialogueSettings::default(),
        Some(LlmAssist::new(client, 5)),
        paraphrase,
    )
}

async fn say(pipeline: &Pipeline, session: &str, text: &str) -> TurnOutput {
    pipeline
        .process(text, &SessionId(session.to_string()), &UserId("tester".to_string()))
        .await
        .expect("turn succeeds")
}

struct CannedClient(String);

#[async_trait]
impl LlmClient for CannedClient {
    async fn complete(&self, _prompt: &str) -> Result<String, AdapterError> {
        Ok(self.0.clone())
    }
}

struct FailingClient;

#[async_trait]
impl LlmClient for FailingClient {
    async fn complete(&self, _prompt: &str) -> Result<String, AdapterError> {
        Err(AdapterError::Transport("connection refused".to_string()))
    }
}

#[derive(Default)]
struct CountingClient {
    calls: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl LlmClient for CountingClient {
    async fn complete(&self, _prompt: &str) -> Result<String, AdapterError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(r#"{"mention": "the vm"}"#.to_string())
    }
}

#[tokio::test]
async fn plain_command_is_executed_and_rendered() {
    let pipeline = pipeline();
    let output = say(&pipeline, "s1", "start vm 101").await;

    assert_eq!(output.outcome, TurnOutcome::Executed);
    assert_eq!(output.intent, Some(IntentName::new("vm_start")));
    assert_eq!(output.response, "Started VM 101 (build-agent).");
    assert!(output.result.expect("handler result").success);
}

#[tokio::test]
async fn anaphora_resolves_against_the_previous_turn() {
    let pipeline = pipeline();

    let status = say(&pipeline, "s1", "status of vm 100").await;
    assert_eq!(status.response, "VM 100 (media-server) is running.");

    let stop = say(&pipeline, "s1", "stop it").await;
    assert_eq!(stop.outcome, TurnOutcome::Executed);
    assert_eq!(stop.response, "Stopped VM 100 (media-server).");
}

#[tokio::test]
async fn destructive_intent_is_gated_and_confirmed() {
    let pipeline = pipeline();

    let gate = say(&pipeline, "s1", "delete vm 100").await;
    assert_eq!(gate.outcome, TurnOutcome::AwaitingConfirmation);
    assert!(gate.response.contains("vm_delete (VM id 100)"));
    assert!(gate.response.contains("cannot be undone"));
    assert!(gate.result.is_none());

    let confirmed = say(&pipeline, "s1", "yes").await;
    assert_eq!(confirmed.outcome, TurnOutcome::Executed);
    assert_eq!(confirmed.response, "Deleted VM 100 (media-server). Its disks are gone.");

    let gone = say(&pipeline, "s1", "status of vm 100").await;
    assert_eq!(gone.response, "That didn't work: VM 100 does not exist");
}

#[tokio::test]
async fn llm_is_never_asked_for_a_destructive_target() {
    let client = Arc::new(CountingClient::default());
    let pipeline = pipeline_with_llm(Arc::clone(&client) as Arc<dyn LlmClient>, false);

    let turn = say(&pipeline, "s1", "delete the vm").await;
    assert_eq!(turn.outcome, TurnOutcome::AwaitingSlots);
    assert!(turn.response.contains("I still need the VM id"));
    assert_eq!(client.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn negative_reply_cancels_without_executing() {
    let pipeline = pipeline();

    say(&pipeline, "s1", "delete vm 204").await;
    let cancelled = say(&pipeline, "s1", "no, leave it").await;
    assert_eq!(cancelled.outcome, TurnOutcome::Cancelled);
    assert!(cancelled.response.contains("won't run vm_delete"));

    let still_there = say(&pipeline, "s1", "status of vm 204").await;
    assert!(still_there.result.expect("handler result").success);
}

#[tokio::test]
async fn a_new_request_implicitly_cancels_the_pending_action() {
    let pipeline = pipeline();

    say(&pipeline, "s1", "delete vm 204").await;
    let switched = say(&pipeline, "s1", "start vm 101").await;

    assert_eq!(switched.outcome, TurnOutcome::Executed);
    assert!(switched.response.contains("won't run vm_delete (VM id 204)"));
    assert!(switched.response.contains("Started VM 101 (build-agent)."));

    let still_there = say(&pipeline, "s1", "status of vm 204").await;
    assert!(still_there.result.expect("handler result").success);
}

#[tokio::test]
async fn unanswered_confirmation_expires_after_its_turn_budget() {
    let pipeline = pipeline();

    say(&pipeline, "s1", "delete vm 204").await;

    // Two unplaceable replies exhaust the default two-turn budget.
    let first = say(&pipeline, "s1", "erm the weather looks grim").await;
    assert_eq!(first.outcome, TurnOutcome::AwaitingConfirmation);
    let second = say(&pipeline, "s1", "truly grim weather").await;
    assert_eq!(second.outcome, TurnOutcome::AwaitingConfirmation);

    // A late "yes" lands on an expired action and must not delete.
    let late = say(&pipeline, "s1", "yes").await;
    assert!(late.response.contains("pending action expired"));
    assert_ne!(late.outcome, TurnOutcome::Executed);

    let still_there = say(&pipeline, "s1", "status of vm 204").await;
    assert!(still_there.result.expect("handler result").success);
}

#[tokio::test]
async fn missing_slot_prompts_and_fills_on_the_next_turn() {
    let pipeline = pipeline();

    let prompt = say(&pipeline, "s1", "start the vm").await;
    assert_eq!(prompt.outcome, TurnOutcome::AwaitingSlots);
    assert!(prompt.response.contains("VM id"));

    let filled = say(&pipeline, "s1", "vm 101").await;
    assert_eq!(filled.outcome, TurnOutcome::Executed);
    assert_eq!(filled.response, "Started VM 101 (build-agent).");
}

#[tokio::test]
async fn a_full_command_preempts_a_pending_slot_fill() {
    let pipeline = pipeline();

    let prompt = say(&pipeline, "s1", "stop the vm").await;
    assert_eq!(prompt.outcome, TurnOutcome::AwaitingSlots);

    let switched = say(&pipeline, "s1", "start vm 101").await;
    assert_eq!(switched.outcome, TurnOutcome::Executed);
    assert_eq!(switched.intent, Some(IntentName::new("vm_start")));
    assert!(switched.response.contains("won't run vm_stop"));
    assert!(switched.response.contains("Started VM 101 (build-agent)."));
}

#[tokio::test]
async fn ambiguous_utterance_asks_for_clarification() {
    let pipeline = pipeline();

    let output = say(&pipeline, "s1", "stop vm 100 container 200").await;
    assert_eq!(output.outcome, TurnOutcome::Clarification);
    assert!(output.response.contains("vm_stop"));
    assert!(output.response.contains("container_stop"));
}

#[tokio::test]
async fn gibberish_without_an_llm_reprompts() {
    let pipeline = pipeline();

    let output = say(&pipeline, "s1", "flibber the wugs sideways").await;
    assert_eq!(output.outcome, TurnOutcome::Reprompt);
    assert!(output.response.contains("rephrase"));
}

#[tokio::test]
async fn blank_and_stopword_only_input_reprompt() {
    let pipeline = pipeline();

    let blank = say(&pipeline, "s1", "   ").await;
    assert_eq!(blank.outcome, TurnOutcome::Reprompt);

    let filler = say(&pipeline, "s1", "hey please can you").await;
    assert_eq!(filler.outcome, TurnOutcome::Reprompt);
    assert!(filler.response.contains("didn't catch"));
}

#[tokio::test]
async fn misspelled_service_resolves_fuzzily() {
    let pipeline = pipeline();

    let output = say(&pipeline, "s1", "deploy nextclod on pve1").await;
    assert_eq!(output.outcome, TurnOutcome::Executed);
    assert!(output.response.starts_with("Deployed Nextcloud."));
}

#[tokio::test]
async fn a_node_from_an_earlier_turn_does_not_attach_to_a_new_deploy() {
    let pipeline = pipeline();

    let first = say(&pipeline, "s1", "deploy nextcloud on pve1").await;
    assert!(first.response.contains("coming up on pve1"));

    let second = say(&pipeline, "s1", "deploy gitea").await;
    assert_eq!(second.response, "Deployed Gitea. It is coming up now.");
}

#[tokio::test]
async fn weak_fuzzy_match_is_rejected_but_suggested() {
    let pipeline = pipeline();

    let output = say(&pipeline, "s1", "deploy nxcld").await;
    assert_eq!(output.outcome, TurnOutcome::AwaitingSlots);
    assert!(output.response.contains("service name"));
    assert!(output.response.contains("Did you mean \"nextcloud\"?"));

    let filled = say(&pipeline, "s1", "nextcloud").await;
    assert_eq!(filled.outcome, TurnOutcome::Executed);
    assert!(filled.response.starts_with("Deployed Nextcloud."));
}

#[tokio::test]
async fn llm_fallback_places_an_unmatched_utterance() {
    let client = Arc::new(CannedClient(
        "{\"intent\": \"system_status\", \"confidence\": 0.9}".to_string(),
    ));
    let pipeline = pipeline_with_llm(client, false);

    let output = say(&pipeline, "s1", "how are things looking today").await;
    assert_eq!(output.outcome, TurnOutcome::Executed);
    assert_eq!(output.intent, Some(IntentName::new("system_status")));
    assert!(output.response.contains("VMs running"));
}

#[tokio::test]
async fn unreachable_llm_degrades_to_a_reprompt() {
    let pipeline = pipeline_with_llm(Arc::new(FailingClient), false);

    let output = say(&pipeline, "s1", "flibber the wugs sideways").await;
    assert_eq!(output.outcome, TurnOutcome::Reprompt);

    // Pattern-matched turns never touch the model.
    let direct = say(&pipeline, "s1", "start vm 101").await;
    assert_eq!(direct.outcome, TurnOutcome::Executed);
}

#[tokio::test]
async fn failed_paraphrase_keeps_the_literal_rendering() {
    let pipeline = pipeline_with_llm(Arc::new(FailingClient), true);

    let output = say(&pipeline, "s1", "start vm 101").await;
    assert_eq!(output.outcome, TurnOutcome::Executed);
    assert_eq!(output.response, "Started VM 101 (build-agent).");
}

#[tokio::test]
async fn a_broken_session_store_does_not_block_turns() {
    struct BrokenStore;

    #[async_trait]
    impl SessionStore for BrokenStore {
        async fn save(&self, _: &SessionId, _: &str) -> Result<(), SessionStoreError> {
            Err(SessionStoreError::Backend("database is locked".to_string()))
        }
        async fn load(&self, _: &SessionId) -> Result<Option<String>, SessionStoreError> {
            Err(SessionStoreError::Backend("database is locked".to_string()))
        }
        async fn delete(&self, _: &SessionId) -> Result<(), SessionStoreError> {
            Err(SessionStoreError::Backend("database is locked".to_string()))
        }
    }

    let pipeline = Pipeline::demo_with_store(&AppConfig::default(), Arc::new(BrokenStore))
        .expect("demo pipeline wires up");
    let output = say(&pipeline, "s1", "start vm 101").await;
    assert_eq!(output.outcome, TurnOutcome::Executed);
    assert_eq!(output.response, "Started VM 101 (build-agent).");
}

#[tokio::test]
async fn sessions_are_isolated_from_each_other() {
    let pipeline = pipeline();

    say(&pipeline, "s1", "status of vm 100").await;
    let other = say(&pipeline, "s2", "stop it").await;

    // No prior mention of a VM in s2, so the slot goes unfilled.
    assert_eq!(other.outcome, TurnOutcome::AwaitingSlots);
}

#[tokio::test]
async fn quoted_names_pass_through_verbatim() {
    let pipeline = pipeline();

    let output = say(&pipeline, "s1", "deploy \"Jellyfin\"").await;
    // Jellyfin is already deployed in the demo seed.
    assert_eq!(output.outcome, TurnOutcome::Executed);
    assert!(!output.result.expect("handler result").success);
    assert!(output.response.contains("already deployed"));
}
