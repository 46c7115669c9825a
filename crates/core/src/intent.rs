//! Pattern-based intent identification.
//!
//! Every registered pattern is scored against the token stream; the best
//! candidate above the acceptance threshold wins outright unless another
//! intent's candidate sits within the near-tie margin, in which case the
//! turn becomes a clarification. The LLM fallback for sub-threshold
//! utterances lives in the agent crate; this module is fully deterministic.

use std::collections::HashMap;

use crate::config::NluSettings;
use crate::domain::intent::{IntentCandidate, IntentSource};
use crate::preprocess::TokenStream;
use crate::schema::{slot_shape_matches, IntentRegistry, IntentSchema, MatchPattern};

const KEYWORD_WEIGHT: f64 = 0.6;
const SLOT_WEIGHT: f64 = 0.25;
const ORDER_WEIGHT: f64 = 0.15;

#[derive(Clone, Debug, PartialEq)]
pub enum IntentDecision {
    Accepted(IntentCandidate),
    /// Two intents scored within the near-tie margin and neither is more
    /// specific than the other. The caller should ask "did you mean X or Y?".
    NearTie { best: IntentCandidate, runner_up: IntentCandidate },
    /// Nothing cleared the threshold. `best` is kept for logging.
    BelowThreshold { best: Option<IntentCandidate> },
}

#[derive(Clone, Copy, Debug)]
pub struct IntentScorer {
    settings: NluSettings,
}

impl IntentScorer {
    pub fn new(settings: NluSettings) -> Self {
        Self { settings }
    }

    pub fn identify(&self, registry: &IntentRegistry, stream: &TokenStream) -> IntentDecision {
        let mut candidates: Vec<IntentCandidate> = registry
            .iter()
            .filter_map(|schema| self.best_candidate_for(schema, stream))
            .collect();

        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.matched_slots.cmp(&a.matched_slots))
        });

        let Some(best) = candidates.first().cloned() else {
            return IntentDecision::BelowThreshold { best: None };
        };

        if best.confidence < self.settings.acceptance_threshold {
            return IntentDecision::BelowThreshold { best: Some(best) };
        }

        if let Some(runner_up) = candidates.get(1).cloned() {
            let gap = best.confidence - runner_up.confidence;
            if gap < self.settings.near_tie_margin {
                // A strictly more specific candidate (more matched slots)
                // wins the residual tie; otherwise clarify with the user.
                if best.matched_slots > runner_up.matched_slots {
                    return IntentDecision::Accepted(best);
                }
                if runner_up.matched_slots > best.matched_slots
                    && runner_up.confidence >= self.settings.acceptance_threshold
                {
                    return IntentDecision::Accepted(runner_up);
                }
                return IntentDecision::NearTie { best, runner_up };
            }
        }

        IntentDecision::Accepted(best)
    }

    fn best_candidate_for(
        &self,
        schema: &IntentSchema,
        stream: &TokenStream,
    ) -> Option<IntentCandidate> {
        schema
            .patterns
            .iter()
            .map(|pattern| score_pattern(pattern, stream))
            .filter(|scored| scored.score > 0.0)
            .max_by(|a, b| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.matched_slots.cmp(&b.matched_slots))
            })
            .map(|scored| IntentCandidate {
                name: schema.name.clone(),
                confidence: scored.score.min(1.0),
                source: IntentSource::Pattern,
                matched_pattern: Some(scored.pattern_id),
                matched_slots: scored.matched_slots,
            })
    }
}

struct ScoredPattern {
    pattern_id: crate::domain::intent::PatternId,
    score: f64,
    matched_slots: usize,
}

fn score_pattern(pattern: &MatchPattern, stream: &TokenStream) -> ScoredPattern {
    // First occurrence index of each keyword, matching on normalized form
    // or stem so "restarting" still hits "restart".
    let mut first_positions: HashMap<&str, usize> = HashMap::new();
    for keyword in &pattern.keywords {
        for (index, token) in stream.tokens.iter().enumerate() {
            if token.normalized == *keyword || token.stem == *keyword {
                first_positions.entry(keyword.as_str()).or_insert(index);
                break;
            }
        }
    }

    let keyword_overlap = if pattern.keywords.is_empty() {
        0.0
    } else {
        first_positions.len() as f64 / pattern.keywords.len() as f64
    };

    let matched_slots = pattern
        .slots
        .iter()
        .filter(|slot| {
            stream.tokens.iter().any(|token| slot_shape_matches(**slot, token, pattern))
        })
        .count();
    let slot_fraction = if pattern.slots.is_empty() {
        1.0
    } else {
        matched_slots as f64 / pattern.slots.len() as f64
    };

    let order_bonus = if first_positions.len() == pattern.keywords.len()
        && keywords_in_order(pattern, &first_positions)
    {
        1.0
    } else {
        0.0
    };

    let score = pattern.weight
        * (KEYWORD_WEIGHT * keyword_overlap
            + SLOT_WEIGHT * slot_fraction
            + ORDER_WEIGHT * order_bonus);

    ScoredPattern { pattern_id: pattern.id.clone(), score, matched_slots }
}

fn keywords_in_order(pattern: &MatchPattern, positions: &HashMap<&str, usize>) -> bool {
    let mut last = None;
    for keyword in &pattern.keywords {
        let Some(position) = positions.get(keyword.as_str()) else {
            return false;
        };
        if let Some(previous) = last {
            if *position < previous {
                return false;
            }
        }
        last = Some(*position);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::{IntentDecision, IntentScorer};
    use crate::config::NluSettings;
    use crate::domain::entity::EntityType;
    use crate::domain::intent::{IntentName, IntentSource};
    use crate::preprocess::Preprocessor;
    use crate::schema::{IntentRegistry, IntentSchema, MatchPattern};

    fn scorer() -> IntentScorer {
        IntentScorer::new(NluSettings::default())
    }

    fn identify(text: &str) -> IntentDecision {
        let registry = IntentRegistry::builtin();
        scorer().identify(&registry, &Preprocessor::new().run(text))
    }

    #[test]
    fn clear_pattern_match_is_accepted() {
        let IntentDecision::Accepted(candidate) = identify("start vm 100") else {
            panic!("expected acceptance");
        };
        assert_eq!(candidate.name, IntentName::new("vm_start"));
        assert_eq!(candidate.source, IntentSource::Pattern);
        assert!(candidate.confidence >= 0.6);
        assert_eq!(candidate.matched_slots, 1);
    }

    #[test]
    fn destructive_intent_matches_like_any_other() {
        let IntentDecision::Accepted(candidate) = identify("delete vm 100") else {
            panic!("expected acceptance");
        };
        assert_eq!(candidate.name, IntentName::new("vm_delete"));
    }

    #[test]
    fn anaphoric_stop_clears_the_threshold() {
        let IntentDecision::Accepted(candidate) = identify("stop it") else {
            panic!("expected acceptance");
        };
        assert_eq!(candidate.name, IntentName::new("vm_stop"));
    }

    #[test]
    fn gibberish_falls_below_threshold() {
        assert!(matches!(
            identify("purple monkey dishwasher"),
            IntentDecision::BelowThreshold { .. }
        ));
    }

    #[test]
    fn idempotent_scoring() {
        let registry = IntentRegistry::builtin();
        let stream = Preprocessor::new().run("restart vm 204");
        let first = scorer().identify(&registry, &stream);
        let second = scorer().identify(&registry, &stream);
        assert_eq!(first, second);
    }

    #[test]
    fn near_tie_between_equally_specific_intents_asks_for_clarification() {
        let registry = IntentRegistry::new(vec![
            IntentSchema {
                name: IntentName::new("alpha"),
                description: String::new(),
                patterns: vec![MatchPattern::new("alpha.p", &["sync", "repo"], &[])],
                required: vec![],
                optional: vec![],
                destructive: false,
            },
            IntentSchema {
                name: IntentName::new("beta"),
                description: String::new(),
                patterns: vec![MatchPattern::new("beta.p", &["sync", "repo"], &[])],
                required: vec![],
                optional: vec![],
                destructive: false,
            },
        ])
        .expect("registry");

        let decision = scorer().identify(&registry, &Preprocessor::new().run("sync the repo"));
        assert!(matches!(decision, IntentDecision::NearTie { .. }));
    }

    #[test]
    fn residual_tie_breaks_toward_more_matched_slots() {
        let registry = IntentRegistry::new(vec![
            IntentSchema {
                name: IntentName::new("vague"),
                description: String::new(),
                patterns: vec![MatchPattern::new("vague.p", &["scale", "service"], &[])],
                required: vec![],
                optional: vec![],
                destructive: false,
            },
            IntentSchema {
                name: IntentName::new("specific"),
                description: String::new(),
                patterns: vec![MatchPattern::new(
                    "specific.p",
                    &["scale", "service"],
                    &[EntityType::Quantity],
                )],
                required: vec![EntityType::Quantity],
                optional: vec![],
                destructive: false,
            },
        ])
        .expect("registry");

        let decision =
            scorer().identify(&registry, &Preprocessor::new().run("scale the service to 3"));
        let IntentDecision::Accepted(candidate) = decision else {
            panic!("expected tie-break acceptance");
        };
        assert_eq!(candidate.name, IntentName::new("specific"));
    }
}
