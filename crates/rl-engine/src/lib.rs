//! UCB1 multi-armed bandit engine: feature registry, persisted arm state,
//! assignment with untested-arm priority, and reward incorporation.

#![warn(clippy::unwrap_used)]

pub mod bandits;
pub mod keys;
pub mod registry;
pub mod reward;
pub mod state;
pub mod ucb1;

pub use bandits::BanditEngine;
pub use keys::{FeatureKeys, KeySpace};
pub use registry::{FeatureRegistry, RegisteredFeature, VariantTable};
pub use reward::{incremental_mean, ArmUpdate};
pub use state::ArmState;
pub use ucb1::Selection;
