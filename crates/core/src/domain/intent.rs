use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntentName(pub String);

impl IntentName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IntentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternId(pub String);

/// Where an intent candidate came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Pattern,
    Llm,
}

/// A scored candidate produced by the intent identifier. Exactly one
/// candidate is accepted per turn, or none.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentCandidate {
    pub name: IntentName,
    pub confidence: f64,
    pub source: IntentSource,
    pub matched_pattern: Option<PatternId>,
    pub matched_slots: usize,
}
