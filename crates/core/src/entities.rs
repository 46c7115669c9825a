//! Structured entity extraction and fuzzy resolution.
//!
//! Extraction runs in stages: structural slots first (numbers, quoted
//! strings, quantity expressions), then fuzzy resolution against the known
//! resource inventory, then anaphora via the conversation context. Matches
//! below the similarity floor are rejected, never guessed; the best
//! rejected candidate is kept as a near-miss so prompts can mention it.

use regex::Regex;

use crate::context::ConversationContext;
use crate::domain::entity::{Entity, EntitySource, EntityType, EntityValue};
use crate::preprocess::{Token, TokenStream};
use crate::schema::{IntentSchema, ResourceInventory};

/// Candidates scoring below the acceptance floor but above this are still
/// worth mentioning in a slot-filling prompt.
const NEAR_MISS_FLOOR: f64 = 0.6;

#[derive(Clone, Debug, PartialEq)]
pub struct NearMiss {
    pub entity_type: EntityType,
    pub candidate: String,
    pub score: f64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtractionOutcome {
    pub entities: Vec<Entity>,
    /// Required slot types that stayed unresolved after every stage.
    pub missing: Vec<EntityType>,
    pub near_misses: Vec<NearMiss>,
}

#[derive(Clone, Debug)]
pub struct EntityExtractor {
    fuzzy_threshold: f64,
    quantity_pattern: Regex,
}

impl EntityExtractor {
    pub fn new(fuzzy_threshold: f64) -> Self {
        let quantity_pattern = Regex::new(
            r"^(\d+(?:\.\d+)?)(gb|gib|mb|mib|tb|g|m|%|percent|cores?|cpus?|vcpus?)$",
        )
        .expect("quantity pattern is valid");
        Self { fuzzy_threshold, quantity_pattern }
    }

    /// Extract every declared slot of `schema` from the token stream.
    pub fn extract(
        &self,
        schema: &IntentSchema,
        stream: &TokenStream,
        inventory: &ResourceInventory,
        context: &ConversationContext,
    ) -> ExtractionOutcome {
        let mut outcome = self.extract_slots(&schema.required, stream, inventory, context);
        // Optional slots are taken only from the utterance itself. Pulling
        // them out of session context would attach a stale node or amount
        // from an unrelated earlier turn.
        for slot in &schema.optional {
            if let Some(entity) = self.extract_one(*slot, stream, inventory, &mut outcome) {
                outcome.entities.push(entity);
            }
        }
        outcome
    }

    /// Extract a specific set of required slot types; used both by `extract`
    /// and by slot-filling turns where only the missing fields are wanted.
    /// Slots absent from the utterance fall back to session context.
    pub fn extract_slots(
        &self,
        slots: &[EntityType],
        stream: &TokenStream,
        inventory: &ResourceInventory,
        context: &ConversationContext,
    ) -> ExtractionOutcome {
        let mut outcome = ExtractionOutcome::default();

        for slot in slots {
            if let Some(entity) = self.extract_one(*slot, stream, inventory, &mut outcome) {
                outcome.entities.push(entity);
                continue;
            }
            // Anaphora: fall back to the most recently mentioned entity of
            // the expected type within the session window.
            if let Some(prior) = context.resolve(*slot) {
                let mut entity = prior.clone();
                entity.source = EntitySource::Context;
                outcome.entities.push(entity);
                continue;
            }
            outcome.missing.push(*slot);
        }

        outcome
    }

    fn extract_one(
        &self,
        slot: EntityType,
        stream: &TokenStream,
        inventory: &ResourceInventory,
        outcome: &mut ExtractionOutcome,
    ) -> Option<Entity> {
        match slot {
            EntityType::VmId => self.extract_numeric_id(slot, stream, |id| EntityValue::VmId(id))
                .or_else(|| {
                    self.fuzzy_resolve(
                        slot,
                        stream,
                        inventory.vms.iter().map(|vm| (vm.name.as_str(), EntityValue::VmId(vm.id))),
                        outcome,
                    )
                }),
            EntityType::ContainerId => self
                .extract_numeric_id(slot, stream, |id| EntityValue::ContainerId(id))
                .or_else(|| {
                    self.fuzzy_resolve(
                        slot,
                        stream,
                        inventory
                            .containers
                            .iter()
                            .map(|ct| (ct.name.as_str(), EntityValue::ContainerId(ct.id))),
                        outcome,
                    )
                }),
            EntityType::ServiceName => self.extract_service(stream, inventory, outcome),
            EntityType::NodeName => self.fuzzy_resolve(
                slot,
                stream,
                inventory
                    .nodes
                    .iter()
                    .map(|node| (node.as_str(), EntityValue::NodeName(node.clone()))),
                outcome,
            ),
            EntityType::Quantity => self.extract_quantity(stream),
            EntityType::QuotedName => stream.tokens.iter().find(|token| token.quoted).map(|token| {
                Entity {
                    entity_type: EntityType::QuotedName,
                    raw: token.original.clone(),
                    resolved: Some(EntityValue::QuotedName(token.original.clone())),
                    span: token.span,
                    confidence: 1.0,
                    source: EntitySource::Pattern,
                }
            }),
        }
    }

    fn extract_numeric_id(
        &self,
        slot: EntityType,
        stream: &TokenStream,
        make: impl Fn(u64) -> EntityValue,
    ) -> Option<Entity> {
        stream
            .tokens
            .iter()
            .filter(|token| !token.quoted)
            .find(|token| {
                !token.normalized.is_empty()
                    && token.normalized.chars().all(|c| c.is_ascii_digit())
            })
            .and_then(|token| {
                let id = token.normalized.parse::<u64>().ok()?;
                Some(Entity {
                    entity_type: slot,
                    raw: token.original.clone(),
                    resolved: Some(make(id)),
                    span: token.span,
                    confidence: 1.0,
                    source: EntitySource::Pattern,
                })
            })
    }

    fn extract_service(
        &self,
        stream: &TokenStream,
        inventory: &ResourceInventory,
        outcome: &mut ExtractionOutcome,
    ) -> Option<Entity> {
        // Quoted literals win outright; they are exact names.
        if let Some(token) = stream.tokens.iter().find(|token| token.quoted) {
            if let Some(service) = inventory.services.iter().find(|service| {
                service.display_name.eq_ignore_ascii_case(&token.original)
                    || service.id.eq_ignore_ascii_case(&token.original)
            }) {
                return Some(Entity {
                    entity_type: EntityType::ServiceName,
                    raw: token.original.clone(),
                    resolved: Some(EntityValue::ServiceName(service.id.clone())),
                    span: token.span,
                    confidence: 1.0,
                    source: EntitySource::Pattern,
                });
            }
        }

        self.fuzzy_resolve(
            EntityType::ServiceName,
            stream,
            inventory.services.iter().flat_map(|service| {
                std::iter::once((service.id.as_str(), EntityValue::ServiceName(service.id.clone())))
                    .chain(std::iter::once((
                        service.display_name.as_str(),
                        EntityValue::ServiceName(service.id.clone()),
                    )))
                    .chain(service.aliases.iter().map(move |alias| {
                        (alias.as_str(), EntityValue::ServiceName(service.id.clone()))
                    }))
            }),
            outcome,
        )
    }

    /// Jaro-Winkler match of candidate tokens against a reference list.
    /// Below-threshold matches are rejected rather than guessed.
    fn fuzzy_resolve<'a>(
        &self,
        slot: EntityType,
        stream: &TokenStream,
        references: impl Iterator<Item = (&'a str, EntityValue)>,
        outcome: &mut ExtractionOutcome,
    ) -> Option<Entity> {
        let references: Vec<(&str, EntityValue)> = references.collect();
        if references.is_empty() {
            return None;
        }

        let mut best: Option<(f64, &Token, &str, EntityValue)> = None;
        for token in candidate_tokens(stream) {
            for (reference, value) in &references {
                let score = strsim::jaro_winkler(
                    &token.normalized.to_ascii_lowercase(),
                    &reference.to_ascii_lowercase(),
                );
                if best.as_ref().map_or(true, |(top, ..)| score > *top) {
                    best = Some((score, token, reference, value.clone()));
                }
            }
        }

        let (score, token, reference, value) = best?;
        if score < self.fuzzy_threshold {
            if score >= NEAR_MISS_FLOOR {
                outcome.near_misses.push(NearMiss {
                    entity_type: slot,
                    candidate: reference.to_string(),
                    score,
                });
            }
            return None;
        }

        Some(Entity {
            entity_type: slot,
            raw: token.original.clone(),
            resolved: Some(value),
            span: token.span,
            confidence: score,
            source: EntitySource::Pattern,
        })
    }

    fn extract_quantity(&self, stream: &TokenStream) -> Option<Entity> {
        // Fused form: "4gb", "2cores".
        for token in &stream.tokens {
            if let Some(captures) = self.quantity_pattern.captures(&token.normalized) {
                let value = captures[1].parse::<f64>().ok()?;
                return Some(Entity {
                    entity_type: EntityType::Quantity,
                    raw: token.original.clone(),
                    resolved: Some(EntityValue::Quantity {
                        value,
                        unit: captures[2].to_string(),
                    }),
                    span: token.span,
                    confidence: 1.0,
                    source: EntitySource::Pattern,
                });
            }
        }

        // Split form: "4 gb", "2 cores".
        for window in stream.tokens.windows(2) {
            let [number, unit] = window else { continue };
            if !number.normalized.chars().all(|c| c.is_ascii_digit() || c == '.') {
                continue;
            }
            if !is_quantity_unit(&unit.normalized) {
                continue;
            }
            let value = number.normalized.parse::<f64>().ok()?;
            return Some(Entity {
                entity_type: EntityType::Quantity,
                raw: format!("{} {}", number.original, unit.original),
                resolved: Some(EntityValue::Quantity {
                    value,
                    unit: unit.normalized.clone(),
                }),
                span: (number.span.0, unit.span.1),
                confidence: 1.0,
                source: EntitySource::Pattern,
            });
        }

        None
    }
}

fn candidate_tokens(stream: &TokenStream) -> impl Iterator<Item = &Token> {
    stream.tokens.iter().filter(|token| {
        !token.stopword
            && !token.normalized.is_empty()
            && !token.normalized.chars().all(|c| c.is_ascii_digit())
            && !is_anaphor(&token.normalized)
    })
}

fn is_anaphor(word: &str) -> bool {
    matches!(word, "it" | "that" | "this" | "one" | "them" | "those")
}

fn is_quantity_unit(token: &str) -> bool {
    matches!(
        token,
        "gb" | "gib"
            | "mb"
            | "mib"
            | "tb"
            | "core"
            | "cores"
            | "cpu"
            | "cpus"
            | "vcpu"
            | "vcpus"
            | "percent"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NluSettings;
    use crate::context::ConversationContext;
    use crate::domain::intent::IntentName;
    use crate::preprocess::Preprocessor;
    use crate::schema::{IntentRegistry, ServiceRef, VmRef};

    fn extractor() -> EntityExtractor {
        EntityExtractor::new(NluSettings::default().fuzzy_threshold)
    }

    fn inventory() -> ResourceInventory {
        ResourceInventory {
            vms: vec![
                VmRef { id: 100, name: "media-server".to_string() },
                VmRef { id: 101, name: "backup-host".to_string() },
            ],
            containers: vec![],
            services: vec![
                ServiceRef {
                    id: "jellyfin".to_string(),
                    display_name: "Jellyfin".to_string(),
                    aliases: vec!["media".to_string()],
                },
                ServiceRef {
                    id: "grafana".to_string(),
                    display_name: "Grafana".to_string(),
                    aliases: vec![],
                },
            ],
            nodes: vec!["node1".to_string(), "node2".to_string()],
        }
    }

    fn extract(text: &str, intent: &str) -> ExtractionOutcome {
        let registry = IntentRegistry::builtin();
        let schema = registry.get(&IntentName::new(intent)).expect("intent");
        let stream = Preprocessor::new().run(text);
        extractor().extract(schema, &stream, &inventory(), &ConversationContext::new(10))
    }

    #[test]
    fn numeric_vm_id_is_extracted_structurally() {
        let outcome = extract("start vm 100", "vm_start");
        assert!(outcome.missing.is_empty());
        let entity = &outcome.entities[0];
        assert_eq!(entity.entity_type, EntityType::VmId);
        assert_eq!(entity.resolved, Some(EntityValue::VmId(100)));
        assert_eq!(entity.source, EntitySource::Pattern);
    }

    #[test]
    fn vm_name_resolves_through_fuzzy_match() {
        let outcome = extract("stop the media-server vm", "vm_stop");
        assert!(outcome.missing.is_empty());
        assert_eq!(outcome.entities[0].resolved, Some(EntityValue::VmId(100)));
    }

    #[test]
    fn misspelled_service_still_resolves_above_threshold() {
        let outcome = extract("deploy jellyfn", "service_deploy");
        assert!(outcome.missing.is_empty());
        assert_eq!(
            outcome.entities[0].resolved,
            Some(EntityValue::ServiceName("jellyfin".to_string()))
        );
        assert!(outcome.entities[0].confidence < 1.0);
    }

    #[test]
    fn below_threshold_match_is_rejected_not_guessed() {
        let outcome = extract("deploy xyzzy", "service_deploy");
        assert_eq!(outcome.missing, vec![EntityType::ServiceName]);
        assert!(outcome.entities.is_empty());
    }

    #[test]
    fn missing_required_slot_is_reported() {
        let outcome = extract("start the vm", "vm_start");
        assert_eq!(outcome.missing, vec![EntityType::VmId]);
    }

    #[test]
    fn anaphora_resolves_from_context() {
        let registry = IntentRegistry::builtin();
        let schema = registry.get(&IntentName::new("vm_stop")).expect("intent");
        let mut context = ConversationContext::new(10);
        context.remember_entity(Entity {
            entity_type: EntityType::VmId,
            raw: "100".to_string(),
            resolved: Some(EntityValue::VmId(100)),
            span: (0, 3),
            confidence: 1.0,
            source: EntitySource::Pattern,
        });

        let stream = Preprocessor::new().run("stop it");
        let outcome = extractor().extract(schema, &stream, &inventory(), &context);
        assert!(outcome.missing.is_empty());
        assert_eq!(outcome.entities[0].resolved, Some(EntityValue::VmId(100)));
        assert_eq!(outcome.entities[0].source, EntitySource::Context);
    }

    #[test]
    fn optional_slots_never_fall_back_to_context() {
        let registry = IntentRegistry::builtin();
        let schema = registry.get(&IntentName::new("service_deploy")).expect("intent");
        let mut context = ConversationContext::new(10);
        context.remember_entity(Entity {
            entity_type: EntityType::NodeName,
            raw: "node1".to_string(),
            resolved: Some(EntityValue::NodeName("node1".to_string())),
            span: (0, 5),
            confidence: 1.0,
            source: EntitySource::Pattern,
        });

        let stream = Preprocessor::new().run("deploy grafana");
        let outcome = extractor().extract(schema, &stream, &inventory(), &context);
        assert!(outcome.missing.is_empty());
        assert!(outcome.entities.iter().all(|e| e.entity_type != EntityType::NodeName));
    }

    #[test]
    fn quantity_expressions_parse_in_both_forms() {
        let stream = Preprocessor::new().run("give it 4 gb");
        let outcome = extractor().extract_slots(
            &[EntityType::Quantity],
            &stream,
            &inventory(),
            &ConversationContext::new(10),
        );
        assert_eq!(
            outcome.entities[0].resolved,
            Some(EntityValue::Quantity { value: 4.0, unit: "gb".to_string() })
        );

        let fused = Preprocessor::new().run("give it 4gb");
        let outcome = extractor().extract_slots(
            &[EntityType::Quantity],
            &fused,
            &inventory(),
            &ConversationContext::new(10),
        );
        assert_eq!(
            outcome.entities[0].resolved,
            Some(EntityValue::Quantity { value: 4.0, unit: "gb".to_string() })
        );
    }

    #[test]
    fn quoted_service_name_is_taken_verbatim() {
        let outcome = extract("deploy \"Jellyfin\" on node1", "service_deploy");
        assert_eq!(
            outcome.entities[0].resolved,
            Some(EntityValue::ServiceName("jellyfin".to_string()))
        );
        assert_eq!(outcome.entities[0].confidence, 1.0);
    }
}
