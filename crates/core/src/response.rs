//! Template-based response rendering.
//!
//! Templates are keyed by `(intent, success)` with a generic fallback, and
//! placeholders are filled from the handler result's data plus the command
//! entities. The optional LLM paraphrase in the agent crate is strictly
//! cosmetic; the literal rendering here is always a complete answer.

use tera::Tera;

use crate::dialogue::PendingAction;
use crate::domain::command::HandlerResult;
use crate::domain::entity::EntityType;
use crate::domain::intent::{IntentCandidate, IntentName};
use crate::entities::NearMiss;

const TEMPLATES: &[(&str, &str)] = &[
    ("generic.success", "{{ message }}"),
    ("generic.failure", "That didn't work: {{ message }}"),
    ("vm_status.success", "VM {{ vm_id }} ({{ name }}) is {{ state }}."),
    ("vm_start.success", "Started VM {{ vm_id }} ({{ name }})."),
    ("vm_stop.success", "Stopped VM {{ vm_id }} ({{ name }})."),
    ("vm_restart.success", "Restarted VM {{ vm_id }} ({{ name }})."),
    ("vm_delete.success", "Deleted VM {{ vm_id }} ({{ name }}). Its disks are gone."),
    ("container_start.success", "Started container {{ container_id }} ({{ name }})."),
    ("container_stop.success", "Stopped container {{ container_id }} ({{ name }})."),
    ("container_delete.success", "Deleted container {{ container_id }} ({{ name }})."),
    ("service_deploy.success", "Deployed {{ service }}. {{ detail }}"),
    ("service_remove.success", "Removed {{ service }}."),
];

#[derive(Debug)]
pub struct ResponseGenerator {
    tera: Tera,
}

impl Default for ResponseGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseGenerator {
    pub fn new() -> Self {
        let mut tera = Tera::default();
        tera.add_raw_templates(TEMPLATES.to_vec())
            .expect("built-in response templates are valid");
        Self { tera }
    }

    /// Render the handler result for an intent. A missing or failing
    /// specific template falls back to the generic one, which only needs
    /// the handler message.
    pub fn render(&self, intent: &IntentName, result: &HandlerResult) -> String {
        let status = if result.success { "success" } else { "failure" };
        let mut context = tera::Context::new();
        context.insert("message", &result.message);
        if let Some(serde_json::Value::Object(fields)) = &result.data {
            for (key, value) in fields {
                context.insert(key, value);
            }
        }

        let specific = format!("{}.{status}", intent.as_str());
        if let Ok(rendered) = self.tera.render(&specific, &context) {
            return rendered;
        }
        self.tera
            .render(&format!("generic.{status}"), &context)
            .unwrap_or_else(|_| result.message.clone())
    }

    pub fn reprompt_empty(&self) -> String {
        "I didn't catch anything actionable there. Could you repeat that?".to_string()
    }

    pub fn reprompt_unknown(&self) -> String {
        "I'm not sure what you want me to do. Could you rephrase that?".to_string()
    }

    pub fn clarification(&self, best: &IntentCandidate, runner_up: &IntentCandidate) -> String {
        format!("Did you mean `{}` or `{}`?", best.name, runner_up.name)
    }

    pub fn slot_prompt(
        &self,
        intent: &IntentName,
        missing: &[EntityType],
        near_misses: &[NearMiss],
    ) -> String {
        let fields =
            missing.iter().map(|slot| slot.label()).collect::<Vec<_>>().join(" and the ");
        let mut prompt = format!("To run `{intent}` I still need the {fields}.");
        if let Some(near) = near_misses.first() {
            prompt.push_str(&format!(" Did you mean \"{}\"?", near.candidate));
        }
        prompt
    }

    pub fn confirmation_prompt(&self, pending: &PendingAction) -> String {
        format!(
            "This will run {} and cannot be undone. Should I proceed? (yes/no)",
            pending.summary()
        )
    }

    pub fn cancelled_notice(&self, pending: &PendingAction) -> String {
        format!("Okay, I won't run {}.", pending.summary())
    }

    pub fn expired_notice(&self) -> String {
        "The earlier pending action expired, so I dropped it.".to_string()
    }
}
