//! Folding reward observations into the persisted running means.
//!
//! Two strategies, chosen by [`RewardMode`]:
//!
//! * `Atomic` sends one batch of server-side increment-and-fold steps. The
//!   count and the mean of an arm always move together.
//! * `TwoPhase` increments counts and reads the old means in one batch, then
//!   writes the new means in a second batch. The batches are not atomic with
//!   respect to each other: two rewards on the same arm that interleave
//!   between their phases compute from the same stale mean and the later
//!   write wins, losing an observation from the mean (never from the count).
//!   If the second batch fails the counts stay ahead of the means.

use crate::keys::KeySpace;
use pivot_core::config::RewardMode;
use pivot_core::error::{PivotError, PivotResult, StoreError};
use pivot_store::{AtomicStore, Batch};
use serde::Serialize;
use tracing::{debug, error};

/// One (feature, arm) pair a reward applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardTarget {
    pub feature: String,
    pub arm: usize,
}

/// Arm state after a reward was folded in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArmUpdate {
    pub feature: String,
    pub arm: usize,
    pub count: u64,
    pub value: f64,
}

/// Read back by the first phase of a two-phase update.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingUpdate {
    pub target: RewardTarget,
    /// Count after this observation was added.
    pub count: u64,
    pub old_value: f64,
}

/// Running mean after folding `reward` in as observation number `count`.
pub fn incremental_mean(old_value: f64, count: u64, reward: f64) -> f64 {
    let n = count as f64;
    ((n - 1.0) / n) * old_value + (1.0 / n) * reward
}

fn to_count(key: &str, raw: i64) -> PivotResult<u64> {
    u64::try_from(raw).map_err(|_| PivotError::CorruptState {
        key: key.to_string(),
        detail: format!("negative count {raw}"),
    })
}

fn parse_value(key: &str, raw: Option<String>) -> PivotResult<f64> {
    match raw {
        None => Ok(0.0),
        Some(raw) => raw.parse::<f64>().map_err(|e| PivotError::CorruptState {
            key: key.to_string(),
            detail: format!("value {raw:?}: {e}"),
        }),
    }
}

pub async fn incorporate(
    store: &dyn AtomicStore,
    keys: &KeySpace,
    mode: RewardMode,
    targets: &[RewardTarget],
    reward: f64,
) -> PivotResult<Vec<ArmUpdate>> {
    if targets.is_empty() {
        return Ok(Vec::new());
    }
    match mode {
        RewardMode::Atomic => apply_atomic(store, keys, targets, reward).await,
        RewardMode::TwoPhase => {
            let pending = increment_counts(store, keys, targets).await?;
            let updates = fold(&pending, reward);
            write_values(store, keys, &updates).await?;
            Ok(updates)
        }
    }
}

async fn apply_atomic(
    store: &dyn AtomicStore,
    keys: &KeySpace,
    targets: &[RewardTarget],
    reward: f64,
) -> PivotResult<Vec<ArmUpdate>> {
    let mut batch = Batch::new();
    for target in targets {
        let fk = keys.feature(&target.feature);
        batch.hash_incr_mean(&fk.counts, &fk.values, &target.arm.to_string(), reward);
    }

    let mut replies = store.execute(batch).await?;
    targets
        .iter()
        .map(|target| {
            let (count, value) = replies.next_mean()?;
            let count = to_count(&keys.feature(&target.feature).counts, count)?;
            debug!(feature = %target.feature, arm = target.arm, count, value, "Reward folded");
            Ok(ArmUpdate {
                feature: target.feature.clone(),
                arm: target.arm,
                count,
                value,
            })
        })
        .collect()
}

/// Phase A: bump every count and read the mean it will be folded into.
pub(crate) async fn increment_counts(
    store: &dyn AtomicStore,
    keys: &KeySpace,
    targets: &[RewardTarget],
) -> PivotResult<Vec<PendingUpdate>> {
    let mut batch = Batch::new();
    for target in targets {
        let fk = keys.feature(&target.feature);
        let field = target.arm.to_string();
        batch
            .hash_incr_by(&fk.counts, &field, 1)
            .hash_get(&fk.values, &field);
    }

    let mut replies = store.execute(batch).await?;
    targets
        .iter()
        .map(|target| {
            let fk = keys.feature(&target.feature);
            let count = to_count(&fk.counts, replies.next_int()?)?;
            let old_value = parse_value(&fk.values, replies.next_text()?)?;
            Ok(PendingUpdate {
                target: target.clone(),
                count,
                old_value,
            })
        })
        .collect()
}

pub(crate) fn fold(pending: &[PendingUpdate], reward: f64) -> Vec<ArmUpdate> {
    pending
        .iter()
        .map(|p| ArmUpdate {
            feature: p.target.feature.clone(),
            arm: p.target.arm,
            count: p.count,
            value: incremental_mean(p.old_value, p.count, reward),
        })
        .collect()
}

/// Phase B: write the new means. Failure leaves the counts already bumped.
pub(crate) async fn write_values(
    store: &dyn AtomicStore,
    keys: &KeySpace,
    updates: &[ArmUpdate],
) -> PivotResult<()> {
    let mut batch = Batch::new();
    for update in updates {
        let fk = keys.feature(&update.feature);
        batch.hash_set(&fk.values, &update.arm.to_string(), update.value.to_string());
    }

    store.execute(batch).await.map(|_| ()).map_err(|source: StoreError| {
        let features: Vec<String> = updates.iter().map(|u| u.feature.clone()).collect();
        metrics::counter!("pivot.reward.partial").increment(1);
        error!(
            features = ?features,
            error = %source,
            "Reward counts committed but values not written"
        );
        PivotError::PartialReward { features, source }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pivot_store::MemoryStore;

    fn keys() -> KeySpace {
        KeySpace::new("t")
    }

    fn target(arm: usize) -> RewardTarget {
        RewardTarget {
            feature: "f".to_string(),
            arm,
        }
    }

    async fn seed(store: &MemoryStore, arm: usize, count: u64, value: f64) {
        let fk = keys().feature("f");
        let mut batch = Batch::new();
        batch
            .hash_set(&fk.counts, &arm.to_string(), count.to_string())
            .hash_set(&fk.values, &arm.to_string(), value.to_string());
        store.execute(batch).await.unwrap();
    }

    #[test]
    fn test_incremental_mean() {
        assert_eq!(incremental_mean(0.0, 1, 1.0), 1.0);
        assert!((incremental_mean(0.0, 2, 1.0) - 0.5).abs() < 1e-12);
        // prior count 3, prior mean 0.4, reward 0.8 -> (0.4 * 3 + 0.8) / 4
        assert!((incremental_mean(0.4, 4, 0.8) - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_modes_agree_without_contention() {
        for mode in [RewardMode::Atomic, RewardMode::TwoPhase] {
            let store = MemoryStore::new();
            seed(&store, 0, 3, 0.4).await;
            let updates = incorporate(&store, &keys(), mode, &[target(0)], 0.8)
                .await
                .unwrap();
            assert_eq!(updates.len(), 1);
            assert_eq!(updates[0].count, 4);
            assert!((updates[0].value - 0.5).abs() < 1e-12, "{mode:?}");

            let fk = keys().feature("f");
            let stored: f64 = store.hash(&fk.values)["0"].parse().unwrap();
            assert!((stored - 0.5).abs() < 1e-12);
        }
    }

    #[tokio::test]
    async fn test_two_phase_interleaving_loses_an_update() {
        let store = MemoryStore::new();
        seed(&store, 0, 0, 0.0).await;

        // Both rewards finish phase A before either writes its mean.
        let first = increment_counts(&store, &keys(), &[target(0)]).await.unwrap();
        let second = increment_counts(&store, &keys(), &[target(0)]).await.unwrap();
        assert_eq!(first[0].count, 1);
        assert_eq!(second[0].count, 2);
        assert_eq!(second[0].old_value, 0.0);

        write_values(&store, &keys(), &fold(&first, 1.0)).await.unwrap();
        write_values(&store, &keys(), &fold(&second, 1.0)).await.unwrap();

        let fk = keys().feature("f");
        assert_eq!(store.hash(&fk.counts)["0"], "2");
        let stored: f64 = store.hash(&fk.values)["0"].parse().unwrap();
        // Two rewards of 1.0 should average 1.0; the second write clobbered the first.
        assert!((stored - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_two_phase_write_failure_leaves_count_ahead() {
        let store = MemoryStore::new();
        seed(&store, 1, 1, 0.0).await;
        store.fail_after(1);

        let err = incorporate(&store, &keys(), RewardMode::TwoPhase, &[target(1)], 1.0)
            .await
            .unwrap_err();
        match err {
            PivotError::PartialReward { features, .. } => assert_eq!(features, vec!["f"]),
            other => panic!("expected partial reward, got {other:?}"),
        }

        let fk = keys().feature("f");
        assert_eq!(store.hash(&fk.counts)["1"], "2");
        assert_eq!(store.hash(&fk.values)["1"], "0");
    }

    #[tokio::test]
    async fn test_atomic_failure_changes_nothing() {
        let store = MemoryStore::new();
        seed(&store, 0, 1, 0.0).await;
        store.fail_next(1);

        let err = incorporate(&store, &keys(), RewardMode::Atomic, &[target(0)], 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, PivotError::Store(StoreError::Injected(_))));

        let fk = keys().feature("f");
        assert_eq!(store.hash(&fk.counts)["0"], "1");
    }
}
