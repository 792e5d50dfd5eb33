//! UCB1 bandit engine over a shared, externally persisted state store.
//!
//! Assignment hands every arm out once through the untested set, then scores
//! arms with UCB1. Rewards fold into per-arm running means. The only shared
//! mutable state is in the store; consistency comes from single-batch
//! atomicity and nothing is locked in process.
//!
//! An assignment's untested pop and a reward on the same arm run in separate
//! batches and are not serialized: a reward can land before, between or after
//! the pop and config read of a concurrent assignment, so that assignment may
//! score arms from counts that are already stale when it returns.

use crate::keys::KeySpace;
use crate::registry::{FeatureRegistry, RegisteredFeature, VariantTable};
use crate::reward::{incorporate, ArmUpdate, RewardTarget};
use crate::state::{self, FeatureFlags};
use crate::ucb1::{self, Selection};
use pivot_core::config::{AppConfig, RewardMode};
use pivot_core::error::{PivotError, PivotResult};
use pivot_core::types::{ArmStats, Assignments, FeatureDefinition, FeatureStats, VariantValue};
use pivot_store::{AtomicStore, Batch};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct BanditEngine {
    store: Arc<dyn AtomicStore>,
    keys: KeySpace,
    registry: FeatureRegistry,
    reward_mode: RewardMode,
}

impl BanditEngine {
    pub fn new(store: Arc<dyn AtomicStore>, config: &AppConfig) -> Self {
        Self::with_prefix(store, config.key_prefix()).with_reward_mode(config.engine.reward_mode)
    }

    pub fn with_prefix(store: Arc<dyn AtomicStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            keys: KeySpace::new(prefix),
            registry: FeatureRegistry::new(),
            reward_mode: RewardMode::default(),
        }
    }

    pub fn with_reward_mode(mut self, mode: RewardMode) -> Self {
        self.reward_mode = mode;
        self
    }

    pub fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn reward_mode(&self) -> RewardMode {
        self.reward_mode
    }

    /// Persist a feature's initial state in one batch and cache it locally.
    ///
    /// Re-creating a feature keeps accumulated counts, values and the
    /// released flag, but re-adds every index to the untested set.
    pub async fn create(&self, definition: &FeatureDefinition) -> PivotResult<()> {
        let feature = RegisteredFeature::from_definition(definition)?;
        let fk = self.keys.feature(&feature.name);

        let mut batch = Batch::new();
        batch
            .set_add(&self.keys.registry(), vec![feature.name.clone()])
            .set_add(
                &fk.untested,
                (0..feature.variants.len()).map(|i| i.to_string()).collect(),
            )
            .hash_set(&fk.config, "wip", state::flag(feature.wip))
            .hash_set(&fk.config, "name", feature.name.as_str())
            .hash_set_if_absent(&fk.config, "released", state::flag(false));
        for idx in 0..feature.variants.len() {
            let field = idx.to_string();
            batch
                .hash_set_if_absent(&fk.counts, &field, "0")
                .hash_set_if_absent(&fk.values, &field, "0.0");
        }
        batch.set(&fk.arms, serde_json::to_string(feature.variants.values())?);

        self.store.execute(batch).await?;

        info!(
            feature = %feature.name,
            arms = feature.variants.len(),
            wip = feature.wip,
            "Feature created"
        );
        self.registry.register(feature);
        Ok(())
    }

    /// Register a feature persisted by another engine instance, without writing.
    pub async fn load(&self, name: &str) -> PivotResult<Arc<RegisteredFeature>> {
        let fk = self.keys.feature(name);
        let mut batch = Batch::new();
        batch.get(&fk.arms).hash_get_all(&fk.config);

        let mut replies = self.store.execute(batch).await?;
        let arms = replies
            .next_text()?
            .ok_or_else(|| PivotError::UnknownFeature(name.to_string()))?;
        let flags = FeatureFlags::from_hash(&replies.next_hash()?);

        let values: Vec<VariantValue> = serde_json::from_str(&arms)?;
        let variants = VariantTable::new(values).map_err(|e| PivotError::CorruptState {
            key: fk.arms.clone(),
            detail: e.to_string(),
        })?;

        debug!(feature = name, arms = variants.len(), "Feature loaded from store");
        Ok(self.registry.register(RegisteredFeature {
            name: name.to_string(),
            wip: flags.wip,
            variants,
        }))
    }

    /// Feature names recorded in the store by any engine instance.
    pub async fn features(&self) -> PivotResult<Vec<String>> {
        let mut batch = Batch::new();
        batch.set_members(&self.keys.registry());
        let mut names = self.store.execute(batch).await?.next_members()?;
        names.sort();
        Ok(names)
    }

    async fn resolve(&self, name: &str) -> PivotResult<Arc<RegisteredFeature>> {
        match self.registry.get(name) {
            Some(feature) => Ok(feature),
            None => self.load(name).await,
        }
    }

    /// Toggle whether a feature hands out variants.
    pub async fn release(&self, name: &str, released: bool) -> PivotResult<()> {
        let feature = self.resolve(name).await?;
        let fk = self.keys.feature(&feature.name);
        let mut batch = Batch::new();
        batch.hash_set(&fk.config, "released", state::flag(released));
        self.store.execute(batch).await?;
        info!(feature = name, released, "Feature release flag set");
        Ok(())
    }

    pub async fn set_wip(&self, name: &str, wip: bool) -> PivotResult<()> {
        let feature = self.resolve(name).await?;
        let fk = self.keys.feature(&feature.name);
        let mut batch = Batch::new();
        batch.hash_set(&fk.config, "wip", state::flag(wip));
        self.store.execute(batch).await?;

        self.registry.register(RegisteredFeature {
            wip,
            ..(*feature).clone()
        });
        info!(feature = name, wip, "Feature wip flag set");
        Ok(())
    }

    /// Assign a variant of the first registered feature.
    ///
    /// Existing assignments are returned unchanged. An empty map means no
    /// feature is registered, or the feature is work-in-progress or unreleased.
    ///
    /// The untested pop shares a batch with the eligibility read, so an index
    /// popped while the feature is gated is consumed without being handed out.
    pub async fn assign(&self, user_id: &str, existing: Assignments) -> PivotResult<Assignments> {
        if !existing.is_empty() {
            metrics::counter!("pivot.assign.sticky").increment(1);
            return Ok(existing);
        }

        // Only one feature is ever under test at a time.
        let Some(feature) = self.registry.first() else {
            debug!(user_id, "No feature registered, nothing to assign");
            return Ok(Assignments::new());
        };
        let fk = self.keys.feature(&feature.name);

        let mut batch = Batch::new();
        batch
            .hash_get_all(&fk.config)
            .set_pop(&fk.untested)
            .hash_get_all(&fk.counts)
            .hash_get_all(&fk.values);
        let mut replies = self.store.execute(batch).await?;
        let config = replies.next_hash()?;
        let popped = replies.next_text()?;
        let counts = replies.next_hash()?;
        let values = replies.next_hash()?;

        let flags = FeatureFlags::from_hash(&config);
        if !flags.is_eligible() {
            metrics::counter!("pivot.assign.gated").increment(1);
            if let Some(lost) = &popped {
                warn!(
                    feature = %feature.name,
                    arm_index = %lost,
                    wip = flags.wip,
                    released = flags.released,
                    "Untested arm consumed while feature is not assignable"
                );
            }
            return Ok(Assignments::new());
        }

        let arms = feature.variants.len();
        let index = match state::untested_index(&fk.untested, popped, arms)? {
            Some(index) => {
                metrics::counter!("pivot.assign.untested").increment(1);
                debug!(feature = %feature.name, user_id, arm_index = index, "Assigned untested arm");
                index
            }
            None => {
                let arm_states = state::arm_states(arms, &fk.counts, &counts, &fk.values, &values)?;
                match choose_arm(&arm_states) {
                    Some(Selection::Scored { index, score }) => {
                        metrics::counter!("pivot.assign.ucb1").increment(1);
                        debug!(feature = %feature.name, user_id, arm_index = index, score, "Assigned by UCB1");
                        index
                    }
                    Some(Selection::Fallback { index }) => {
                        metrics::counter!("pivot.assign.fallback").increment(1);
                        debug!(feature = %feature.name, user_id, arm_index = index, "UCB1 score not finite, assigned at random");
                        index
                    }
                    None => return Ok(Assignments::new()),
                }
            }
        };

        let mut assignments = Assignments::new();
        if let Some(variant) = feature.variants.value(index) {
            assignments.insert(feature.name.clone(), variant.clone());
        }
        Ok(assignments)
    }

    /// Fold `reward` into every assigned arm.
    ///
    /// Features missing from the local registry are loaded from the store.
    /// All variants are resolved before anything is written, so an unknown
    /// feature or variant leaves the store untouched.
    pub async fn reward(&self, assignments: &Assignments, reward: f64) -> PivotResult<Vec<ArmUpdate>> {
        if !reward.is_finite() {
            return Err(PivotError::InvalidReward(reward));
        }

        let mut targets = Vec::with_capacity(assignments.len());
        for (name, variant) in assignments {
            let feature = self.resolve(name).await?;
            let arm = feature.variants.index_of(variant).ok_or_else(|| {
                PivotError::UnknownVariant {
                    feature: name.clone(),
                    variant: variant.to_string(),
                }
            })?;
            targets.push(RewardTarget {
                feature: name.clone(),
                arm,
            });
        }

        let updates =
            incorporate(self.store.as_ref(), &self.keys, self.reward_mode, &targets, reward).await?;
        metrics::counter!("pivot.reward.applied").increment(updates.len() as u64);
        Ok(updates)
    }

    /// Snapshot of a feature's persisted state for admin display.
    pub async fn stats(&self, name: &str) -> PivotResult<FeatureStats> {
        let feature = self.resolve(name).await?;
        let fk = self.keys.feature(&feature.name);

        let mut batch = Batch::new();
        batch
            .hash_get_all(&fk.config)
            .set_members(&fk.untested)
            .hash_get_all(&fk.counts)
            .hash_get_all(&fk.values);
        let mut replies = self.store.execute(batch).await?;
        let flags = FeatureFlags::from_hash(&replies.next_hash()?);
        let untested = replies.next_members()?.len();
        let counts = replies.next_hash()?;
        let values = replies.next_hash()?;

        let arm_states = state::arm_states(
            feature.variants.len(),
            &fk.counts,
            &counts,
            &fk.values,
            &values,
        )?;
        let scored = arm_states.iter().all(|a| a.count > 0);
        let scores = ucb1::scores(&arm_states);

        let arms = arm_states
            .iter()
            .zip(feature.variants.values())
            .enumerate()
            .map(|(index, (arm, variant))| ArmStats {
                index,
                variant: variant.clone(),
                count: arm.count,
                value: arm.value,
                ucb_score: scored.then(|| scores[index]),
            })
            .collect();

        Ok(FeatureStats {
            name: feature.name.clone(),
            wip: flags.wip,
            released: flags.released,
            untested,
            total_count: ucb1::total_count(&arm_states),
            arms,
        })
    }
}

fn choose_arm(arms: &[state::ArmState]) -> Option<Selection> {
    ucb1::select(arms, &mut rand::thread_rng())
}
