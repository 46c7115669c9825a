//! Static intent schema and known-resource inventory.
//!
//! Both tables are read-only after initialization. The registry is the
//! single source of truth for which intents exist, which slots they need,
//! and whether they are destructive; nothing downstream infers any of that
//! heuristically.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::entity::EntityType;
use crate::domain::intent::{IntentName, PatternId};
use crate::preprocess::Token;

/// One match pattern for an intent: a keyword set, the keywords in their
/// expected order (for the phrase-order bonus), and the slot shapes the
/// pattern expects to see in the utterance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchPattern {
    pub id: PatternId,
    pub keywords: Vec<String>,
    pub slots: Vec<EntityType>,
    /// Damping for deliberately loose patterns (e.g. a bare verb that only
    /// makes sense together with an anaphoric reference).
    pub weight: f64,
}

impl MatchPattern {
    pub fn new(id: &str, keywords: &[&str], slots: &[EntityType]) -> Self {
        Self {
            id: PatternId(id.to_string()),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            slots: slots.to_vec(),
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentSchema {
    pub name: IntentName,
    pub description: String,
    pub patterns: Vec<MatchPattern>,
    pub required: Vec<EntityType>,
    pub optional: Vec<EntityType>,
    pub destructive: bool,
}

impl IntentSchema {
    /// The identifier slot a destructive handler acts on. By convention the
    /// first required slot.
    pub fn target_slot(&self) -> Option<EntityType> {
        self.required.first().copied()
    }
}

/// Catalog entry shared with the LLM fallback so it can only answer with
/// known intent names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentDescriptor {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("duplicate intent name `{0}` in registry")]
    DuplicateIntent(IntentName),
    #[error("intent `{0}` declares no match patterns")]
    EmptyPatterns(IntentName),
    #[error("intent `{0}` declares `{1:?}` as both required and optional")]
    OverlappingSlots(IntentName, EntityType),
}

/// Immutable table of every intent the pipeline can produce.
#[derive(Clone, Debug)]
pub struct IntentRegistry {
    intents: Vec<IntentSchema>,
    by_name: HashMap<IntentName, usize>,
}

impl IntentRegistry {
    pub fn new(intents: Vec<IntentSchema>) -> Result<Self, SchemaError> {
        let mut by_name = HashMap::with_capacity(intents.len());
        for (index, schema) in intents.iter().enumerate() {
            if schema.patterns.is_empty() {
                return Err(SchemaError::EmptyPatterns(schema.name.clone()));
            }
            for slot in &schema.required {
                if schema.optional.contains(slot) {
                    return Err(SchemaError::OverlappingSlots(schema.name.clone(), *slot));
                }
            }
            if by_name.insert(schema.name.clone(), index).is_some() {
                return Err(SchemaError::DuplicateIntent(schema.name.clone()));
            }
        }
        Ok(Self { intents, by_name })
    }

    /// The built-in infra chat-ops catalog.
    pub fn builtin() -> Self {
        Self::new(builtin_intents()).expect("builtin intent catalog is well-formed")
    }

    pub fn get(&self, name: &IntentName) -> Option<&IntentSchema> {
        self.by_name.get(name).map(|index| &self.intents[*index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &IntentSchema> {
        self.intents.iter()
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    pub fn descriptors(&self) -> Vec<IntentDescriptor> {
        self.intents
            .iter()
            .map(|schema| IntentDescriptor {
                name: schema.name.0.clone(),
                description: schema.description.clone(),
            })
            .collect()
    }
}

/// Whether a token looks like it could fill the given slot. Used for the
/// slot-presence term of pattern scoring, not for extraction itself.
pub fn slot_shape_matches(slot: EntityType, token: &Token, pattern: &MatchPattern) -> bool {
    match slot {
        EntityType::VmId | EntityType::ContainerId => {
            token.normalized.chars().all(|c| c.is_ascii_digit()) && !token.normalized.is_empty()
        }
        EntityType::Quantity => token.normalized.starts_with(|c: char| c.is_ascii_digit()),
        EntityType::QuotedName => token.quoted,
        EntityType::ServiceName | EntityType::NodeName => {
            !token.stopword
                && !token.normalized.chars().any(|c| c.is_ascii_digit())
                && !pattern.keywords.iter().any(|keyword| keyword == &token.normalized)
        }
    }
}

fn builtin_intents() -> Vec<IntentSchema> {
    use EntityType::*;

    vec![
        IntentSchema {
            name: IntentName::new("vm_start"),
            description: "Start a virtual machine".to_string(),
            patterns: vec![
                MatchPattern::new("vm_start.start", &["start", "vm"], &[VmId]),
                MatchPattern::new("vm_start.boot", &["boot", "vm"], &[VmId]),
                MatchPattern::new("vm_start.power_on", &["power", "vm"], &[VmId]),
                MatchPattern::new("vm_start.bare", &["start"], &[VmId]).with_weight(0.85),
            ],
            required: vec![VmId],
            optional: vec![NodeName],
            destructive: false,
        },
        IntentSchema {
            name: IntentName::new("vm_stop"),
            description: "Stop a running virtual machine".to_string(),
            patterns: vec![
                MatchPattern::new("vm_stop.stop", &["stop", "vm"], &[VmId]),
                MatchPattern::new("vm_stop.shutdown", &["shutdown", "vm"], &[VmId]),
                MatchPattern::new("vm_stop.bare", &["stop"], &[VmId]).with_weight(0.85),
            ],
            required: vec![VmId],
            optional: vec![],
            destructive: false,
        },
        IntentSchema {
            name: IntentName::new("vm_restart"),
            description: "Restart a virtual machine".to_string(),
            patterns: vec![
                MatchPattern::new("vm_restart.restart", &["restart", "vm"], &[VmId]),
                MatchPattern::new("vm_restart.reboot", &["reboot", "vm"], &[VmId]),
                MatchPattern::new("vm_restart.bare", &["restart"], &[VmId]).with_weight(0.85),
            ],
            required: vec![VmId],
            optional: vec![],
            destructive: false,
        },
        IntentSchema {
            name: IntentName::new("vm_status"),
            description: "Report the status of a virtual machine".to_string(),
            patterns: vec![
                MatchPattern::new("vm_status.status", &["status", "vm"], &[VmId]),
                MatchPattern::new("vm_status.check", &["check", "vm"], &[VmId]),
                MatchPattern::new("vm_status.running", &["running", "vm"], &[VmId]),
            ],
            required: vec![VmId],
            optional: vec![],
            destructive: false,
        },
        IntentSchema {
            name: IntentName::new("vm_delete"),
            description: "Delete a virtual machine and its disks".to_string(),
            patterns: vec![
                MatchPattern::new("vm_delete.delete", &["delete", "vm"], &[VmId]),
                MatchPattern::new("vm_delete.remove", &["remove", "vm"], &[VmId]),
                MatchPattern::new("vm_delete.destroy", &["destroy", "vm"], &[VmId]),
            ],
            required: vec![VmId],
            optional: vec![],
            destructive: true,
        },
        IntentSchema {
            name: IntentName::new("container_start"),
            description: "Start a container".to_string(),
            patterns: vec![
                MatchPattern::new("container_start.start", &["start", "container"], &[ContainerId]),
                MatchPattern::new("container_start.boot", &["boot", "container"], &[ContainerId]),
            ],
            required: vec![ContainerId],
            optional: vec![],
            destructive: false,
        },
        IntentSchema {
            name: IntentName::new("container_stop"),
            description: "Stop a container".to_string(),
            patterns: vec![
                MatchPattern::new("container_stop.stop", &["stop", "container"], &[ContainerId]),
                MatchPattern::new(
                    "container_stop.shutdown",
                    &["shutdown", "container"],
                    &[ContainerId],
                ),
            ],
            required: vec![ContainerId],
            optional: vec![],
            destructive: false,
        },
        IntentSchema {
            name: IntentName::new("container_delete"),
            description: "Delete a container".to_string(),
            patterns: vec![
                MatchPattern::new(
                    "container_delete.delete",
                    &["delete", "container"],
                    &[ContainerId],
                ),
                MatchPattern::new(
                    "container_delete.destroy",
                    &["destroy", "container"],
                    &[ContainerId],
                ),
            ],
            required: vec![ContainerId],
            optional: vec![],
            destructive: true,
        },
        IntentSchema {
            name: IntentName::new("service_deploy"),
            description: "Deploy a service from the catalog".to_string(),
            patterns: vec![
                MatchPattern::new("service_deploy.deploy", &["deploy"], &[ServiceName]),
                MatchPattern::new("service_deploy.install", &["install"], &[ServiceName]),
                MatchPattern::new(
                    "service_deploy.set_up",
                    &["set", "up", "service"],
                    &[ServiceName],
                ),
            ],
            required: vec![ServiceName],
            optional: vec![NodeName],
            destructive: false,
        },
        IntentSchema {
            name: IntentName::new("service_remove"),
            description: "Remove a deployed service".to_string(),
            patterns: vec![
                MatchPattern::new("service_remove.remove", &["remove", "service"], &[ServiceName]),
                MatchPattern::new("service_remove.uninstall", &["uninstall"], &[ServiceName]),
            ],
            required: vec![ServiceName],
            optional: vec![],
            destructive: true,
        },
        IntentSchema {
            name: IntentName::new("system_status"),
            description: "Summarize the health of the whole system".to_string(),
            patterns: vec![
                MatchPattern::new("system_status.status", &["system", "status"], &[]),
                MatchPattern::new("system_status.health", &["health"], &[]),
                MatchPattern::new("system_status.overview", &["overview"], &[]),
            ],
            required: vec![],
            optional: vec![],
            destructive: false,
        },
        IntentSchema {
            name: IntentName::new("help"),
            description: "List what the assistant can do".to_string(),
            patterns: vec![
                MatchPattern::new("help.help", &["help"], &[]),
                MatchPattern::new("help.what_can", &["what", "commands"], &[]),
            ],
            required: vec![],
            optional: vec![],
            destructive: false,
        },
    ]
}

/// Known resources used by fuzzy entity resolution. Loaded from the
/// infrastructure backend at startup; read-only per turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceInventory {
    pub vms: Vec<VmRef>,
    pub containers: Vec<ContainerRef>,
    pub services: Vec<ServiceRef>,
    pub nodes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VmRef {
    pub id: u64,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub id: u64,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub id: String,
    pub display_name: String,
    pub aliases: Vec<String>,
}

impl ResourceInventory {
    pub fn vm_by_id(&self, id: u64) -> Option<&VmRef> {
        self.vms.iter().find(|vm| vm.id == id)
    }

    pub fn container_by_id(&self, id: u64) -> Option<&ContainerRef> {
        self.containers.iter().find(|container| container.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_loads() {
        let registry = IntentRegistry::builtin();
        assert!(registry.len() >= 10);
        let delete = registry.get(&IntentName::new("vm_delete")).expect("vm_delete");
        assert!(delete.destructive);
        assert_eq!(delete.target_slot(), Some(EntityType::VmId));
        let start = registry.get(&IntentName::new("vm_start")).expect("vm_start");
        assert!(!start.destructive);
    }

    #[test]
    fn duplicate_intent_names_are_rejected() {
        let schema = IntentSchema {
            name: IntentName::new("dup"),
            description: String::new(),
            patterns: vec![MatchPattern::new("dup.p", &["dup"], &[])],
            required: vec![],
            optional: vec![],
            destructive: false,
        };
        let error = IntentRegistry::new(vec![schema.clone(), schema]).unwrap_err();
        assert_eq!(error, SchemaError::DuplicateIntent(IntentName::new("dup")));
    }

    #[test]
    fn overlapping_required_and_optional_slots_are_rejected() {
        let schema = IntentSchema {
            name: IntentName::new("bad"),
            description: String::new(),
            patterns: vec![MatchPattern::new("bad.p", &["bad"], &[])],
            required: vec![EntityType::VmId],
            optional: vec![EntityType::VmId],
            destructive: false,
        };
        let error = IntentRegistry::new(vec![schema]).unwrap_err();
        assert!(matches!(error, SchemaError::OverlappingSlots(_, EntityType::VmId)));
    }
}
