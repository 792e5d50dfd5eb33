//! In-memory feature registry. Mirrors features this engine created or loaded;
//! the store stays the source of truth across engine instances.

use dashmap::DashMap;
use parking_lot::Mutex;
use pivot_core::error::{PivotError, PivotResult};
use pivot_core::types::{FeatureDefinition, VariantValue};
use std::collections::HashMap;
use std::sync::Arc;

/// Canonical text for a variant. Strings map to their contents, so a variant
/// that round-tripped through a cookie as `"2"` still resolves to `2`.
pub fn variant_label(variant: &VariantValue) -> String {
    match variant {
        VariantValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Bidirectional lookup between a variant value and its arm index.
#[derive(Debug, Clone)]
pub struct VariantTable {
    values: Vec<VariantValue>,
    by_label: HashMap<String, usize>,
}

impl VariantTable {
    /// Fails on duplicate variants, which would make two arms indistinguishable.
    pub fn new(values: Vec<VariantValue>) -> PivotResult<Self> {
        let mut by_label = HashMap::with_capacity(values.len());
        for (idx, value) in values.iter().enumerate() {
            let label = variant_label(value);
            if by_label.insert(label.clone(), idx).is_some() {
                return Err(PivotError::InvalidFeature(format!(
                    "duplicate variant {label}"
                )));
            }
        }
        Ok(Self { values, by_label })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, index: usize) -> Option<&VariantValue> {
        self.values.get(index)
    }

    pub fn index_of(&self, variant: &VariantValue) -> Option<usize> {
        self.by_label.get(&variant_label(variant)).copied()
    }

    pub fn values(&self) -> &[VariantValue] {
        &self.values
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredFeature {
    pub name: String,
    pub wip: bool,
    pub variants: VariantTable,
}

impl RegisteredFeature {
    pub fn from_definition(definition: &FeatureDefinition) -> PivotResult<Self> {
        if definition.name.is_empty() {
            return Err(PivotError::InvalidFeature("empty feature name".to_string()));
        }
        if definition.name.contains(':') {
            return Err(PivotError::InvalidFeature(format!(
                "feature name {:?} contains ':'",
                definition.name
            )));
        }
        if definition.variants.is_empty() {
            return Err(PivotError::InvalidFeature(format!(
                "feature {} has no variants",
                definition.name
            )));
        }
        Ok(Self {
            name: definition.name.clone(),
            wip: definition.wip,
            variants: VariantTable::new(definition.variants.clone())?,
        })
    }
}

/// Features in registration order. Lookups by name are lock-free.
#[derive(Debug, Default)]
pub struct FeatureRegistry {
    features: DashMap<String, Arc<RegisteredFeature>>,
    order: Mutex<Vec<String>>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a feature. A replaced feature keeps its position.
    pub fn register(&self, feature: RegisteredFeature) -> Arc<RegisteredFeature> {
        let feature = Arc::new(feature);
        let mut order = self.order.lock();
        if !self.features.contains_key(&feature.name) {
            order.push(feature.name.clone());
        }
        self.features.insert(feature.name.clone(), feature.clone());
        feature
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredFeature>> {
        self.features.get(name).map(|f| f.value().clone())
    }

    /// The earliest registered feature.
    pub fn first(&self) -> Option<Arc<RegisteredFeature>> {
        let order = self.order.lock();
        order.first().and_then(|name| self.get(name))
    }

    pub fn names(&self) -> Vec<String> {
        self.order.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feature(name: &str, variants: Vec<VariantValue>) -> RegisteredFeature {
        RegisteredFeature::from_definition(&FeatureDefinition::new(name, variants)).unwrap()
    }

    #[test]
    fn test_variant_table_lookup_both_ways() {
        let table = VariantTable::new(vec![json!(1), json!("blue"), json!({"size": 3})]).unwrap();
        assert_eq!(table.index_of(&json!("blue")), Some(1));
        assert_eq!(table.index_of(&json!({"size": 3})), Some(2));
        assert_eq!(table.value(0), Some(&json!(1)));
        assert_eq!(table.index_of(&json!("1")), Some(0));
        assert_eq!(table.index_of(&json!(4)), None);
    }

    #[test]
    fn test_duplicate_variants_rejected() {
        let err = VariantTable::new(vec![json!("a"), json!("b"), json!("a")]).unwrap_err();
        assert!(matches!(err, PivotError::InvalidFeature(_)));
    }

    #[test]
    fn test_definition_validation() {
        let empty = FeatureDefinition::new("checkout", vec![]);
        assert!(RegisteredFeature::from_definition(&empty).is_err());
        let bad_name = FeatureDefinition::new("a:b", vec![json!(1)]);
        assert!(RegisteredFeature::from_definition(&bad_name).is_err());
    }

    #[test]
    fn test_first_follows_registration_order() {
        let registry = FeatureRegistry::new();
        assert!(registry.first().is_none());

        registry.register(feature("banner", vec![json!(1), json!(2)]));
        registry.register(feature("checkout", vec![json!("a")]));
        registry.register(feature("banner", vec![json!(1), json!(2), json!(3)]));

        let first = registry.first().unwrap();
        assert_eq!(first.name, "banner");
        assert_eq!(first.variants.len(), 3);
        assert_eq!(registry.names(), vec!["banner", "checkout"]);
        assert_eq!(registry.len(), 2);
    }
}
