//! Store key layout. Every key lives under the application prefix:
//!
//! ```text
//! <prefix>:features                      set of feature names
//! <prefix>:features:<name>:config        hash  wip, released, name
//! <prefix>:features:<name>:untested      set   arm indices never handed out
//! <prefix>:features:<name>:counts        hash  arm index -> observations
//! <prefix>:features:<name>:values        hash  arm index -> running mean
//! <prefix>:features:<name>:arms          JSON list of variants
//! ```

fn join(parts: &[&str]) -> String {
    parts.join(":")
}

#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn registry(&self) -> String {
        join(&[&self.prefix, "features"])
    }

    pub fn feature(&self, name: &str) -> FeatureKeys {
        let base = join(&[&self.prefix, "features", name]);
        FeatureKeys {
            config: join(&[&base, "config"]),
            untested: join(&[&base, "untested"]),
            counts: join(&[&base, "counts"]),
            values: join(&[&base, "values"]),
            arms: join(&[&base, "arms"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureKeys {
    pub config: String,
    pub untested: String,
    pub counts: String,
    pub values: String,
    pub arms: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let keys = KeySpace::new("pivot:ucb1:app");
        assert_eq!(keys.registry(), "pivot:ucb1:app:features");
        let feature = keys.feature("checkout");
        assert_eq!(feature.config, "pivot:ucb1:app:features:checkout:config");
        assert_eq!(feature.untested, "pivot:ucb1:app:features:checkout:untested");
        assert_eq!(feature.arms, "pivot:ucb1:app:features:checkout:arms");
    }
}
