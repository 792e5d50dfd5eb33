pub mod config;
pub mod error;
pub mod types;

pub use config::AppConfig;
pub use error::{PivotError, PivotResult, StoreError, StoreResult};
pub use types::{ArmStats, Assignments, FeatureDefinition, FeatureStats, VariantValue};
