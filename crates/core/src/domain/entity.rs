use serde::{Deserialize, Serialize};

/// Declared slot types an intent can require or accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    VmId,
    ContainerId,
    ServiceName,
    NodeName,
    Quantity,
    QuotedName,
}

impl EntityType {
    pub fn label(&self) -> &'static str {
        match self {
            EntityType::VmId => "VM id",
            EntityType::ContainerId => "container id",
            EntityType::ServiceName => "service name",
            EntityType::NodeName => "node name",
            EntityType::Quantity => "amount",
            EntityType::QuotedName => "name",
        }
    }
}

/// A resolved slot value. The variant must match the declared `EntityType`;
/// mistyped values are rejected at the boundary instead of at first use.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EntityValue {
    VmId(u64),
    ContainerId(u64),
    ServiceName(String),
    NodeName(String),
    Quantity { value: f64, unit: String },
    QuotedName(String),
}

impl EntityValue {
    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityValue::VmId(_) => EntityType::VmId,
            EntityValue::ContainerId(_) => EntityType::ContainerId,
            EntityValue::ServiceName(_) => EntityType::ServiceName,
            EntityValue::NodeName(_) => EntityType::NodeName,
            EntityValue::Quantity { .. } => EntityType::Quantity,
            EntityValue::QuotedName(_) => EntityType::QuotedName,
        }
    }

    /// Plain-text rendering used in prompts and response templates.
    pub fn display(&self) -> String {
        match self {
            EntityValue::VmId(id) | EntityValue::ContainerId(id) => id.to_string(),
            EntityValue::ServiceName(name)
            | EntityValue::NodeName(name)
            | EntityValue::QuotedName(name) => name.clone(),
            EntityValue::Quantity { value, unit } => format!("{value} {unit}"),
        }
    }
}

/// How a slot value was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySource {
    Pattern,
    Llm,
    Context,
}

/// One extracted slot. Multiple entities of the same type may appear;
/// ordering is insertion order from extraction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: EntityType,
    pub raw: String,
    pub resolved: Option<EntityValue>,
    pub span: (usize, usize),
    pub confidence: f64,
    pub source: EntitySource,
}

impl Entity {
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }
}
