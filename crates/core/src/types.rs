use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque arm value handed back to callers. Persisted state refers to arms by
/// their position in the feature's variant list, never by value.
pub type VariantValue = serde_json::Value;

/// Feature name to assigned variant for one user session.
pub type Assignments = BTreeMap<String, VariantValue>;

/// Static definition of a feature under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDefinition {
    pub name: String,
    pub variants: Vec<VariantValue>,
    #[serde(default)]
    pub wip: bool,
}

impl FeatureDefinition {
    pub fn new(name: impl Into<String>, variants: Vec<VariantValue>) -> Self {
        Self {
            name: name.into(),
            variants,
            wip: false,
        }
    }

    pub fn with_wip(mut self, wip: bool) -> Self {
        self.wip = wip;
        self
    }
}

/// Per-arm view of the persisted bandit state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmStats {
    pub index: usize,
    pub variant: VariantValue,
    pub count: u64,
    pub value: f64,
    /// Absent until every arm has at least one observation.
    pub ucb_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub name: String,
    pub wip: bool,
    pub released: bool,
    pub untested: usize,
    pub total_count: u64,
    pub arms: Vec<ArmStats>,
}
