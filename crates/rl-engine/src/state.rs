//! Decoding of the persisted per-feature bandit state.

use pivot_core::error::{PivotError, PivotResult};
use std::collections::HashMap;

/// Observation count and running mean reward of one arm.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ArmState {
    pub count: u64,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureFlags {
    pub wip: bool,
    pub released: bool,
}

impl FeatureFlags {
    pub fn from_hash(config: &HashMap<String, String>) -> Self {
        Self {
            wip: truthy(config.get("wip")),
            released: truthy(config.get("released")),
        }
    }

    /// Only released, finished features hand out variants.
    pub fn is_eligible(&self) -> bool {
        !self.wip && self.released
    }
}

fn truthy(raw: Option<&String>) -> bool {
    match raw.map(|s| s.trim()) {
        None | Some("") => false,
        Some(s) if s.eq_ignore_ascii_case("false") => false,
        Some(s) if s.eq_ignore_ascii_case("true") => true,
        Some(s) => s.parse::<f64>().map(|n| n != 0.0).unwrap_or(true),
    }
}

pub fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

fn corrupt(key: &str, detail: String) -> PivotError {
    PivotError::CorruptState {
        key: key.to_string(),
        detail,
    }
}

/// Arm states indexed by arm position. Missing fields read as a fresh arm.
pub fn arm_states(
    arms: usize,
    counts_key: &str,
    counts: &HashMap<String, String>,
    values_key: &str,
    values: &HashMap<String, String>,
) -> PivotResult<Vec<ArmState>> {
    (0..arms)
        .map(|idx| {
            let field = idx.to_string();
            let count = match counts.get(&field) {
                Some(raw) => raw
                    .parse::<u64>()
                    .map_err(|e| corrupt(counts_key, format!("arm {idx} count {raw:?}: {e}")))?,
                None => 0,
            };
            let value = match values.get(&field) {
                Some(raw) => raw
                    .parse::<f64>()
                    .map_err(|e| corrupt(values_key, format!("arm {idx} value {raw:?}: {e}")))?,
                None => 0.0,
            };
            Ok(ArmState { count, value })
        })
        .collect()
}

/// Index popped from the untested set, checked against the arm count.
pub fn untested_index(key: &str, popped: Option<String>, arms: usize) -> PivotResult<Option<usize>> {
    let Some(raw) = popped else {
        return Ok(None);
    };
    match raw.parse::<usize>() {
        Ok(idx) if idx < arms => Ok(Some(idx)),
        Ok(idx) => Err(corrupt(key, format!("arm {idx} out of range for {arms} arms"))),
        Err(e) => Err(corrupt(key, format!("member {raw:?}: {e}"))),
    }
}
