//! UCB1 arm scoring.
//!
//! `score_i = v_i + sqrt(2 ln N / n_i)` with `N` the total observations of the
//! feature. The highest score wins, ties going to the lowest index. When the
//! best score is not finite (no observations yet, or an arm with zero count)
//! the choice falls back to a uniformly random arm.

use crate::state::ArmState;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selection {
    Scored { index: usize, score: f64 },
    Fallback { index: usize },
}

impl Selection {
    pub fn index(&self) -> usize {
        match self {
            Selection::Scored { index, .. } | Selection::Fallback { index } => *index,
        }
    }
}

pub fn total_count(arms: &[ArmState]) -> u64 {
    arms.iter().map(|a| a.count).sum()
}

pub fn exploration_bonus(total: u64, count: u64) -> f64 {
    (2.0 * (total as f64).ln() / count as f64).sqrt()
}

pub fn scores(arms: &[ArmState]) -> Vec<f64> {
    let total = total_count(arms);
    arms.iter()
        .map(|arm| arm.value + exploration_bonus(total, arm.count))
        .collect()
}

/// Pick an arm. `None` only when there are no arms.
pub fn select<R: Rng + ?Sized>(arms: &[ArmState], rng: &mut R) -> Option<Selection> {
    if arms.is_empty() {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    for (index, score) in scores(arms).into_iter().enumerate() {
        // NaN never compares greater, so it can't take the lead.
        if best.map_or(!score.is_nan(), |(_, top)| score > top) {
            best = Some((index, score));
        }
    }

    match best {
        Some((index, score)) if score.is_finite() => Some(Selection::Scored { index, score }),
        _ => Some(Selection::Fallback {
            index: rng.gen_range(0..arms.len()),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn arm(count: u64, value: f64) -> ArmState {
        ArmState { count, value }
    }

    #[test]
    fn test_fewest_trials_gets_largest_bonus() {
        let arms = [arm(10, 0.5), arm(2, 0.5), arm(30, 0.5)];
        let total = total_count(&arms);
        let bonuses: Vec<f64> = arms
            .iter()
            .map(|a| exploration_bonus(total, a.count))
            .collect();
        assert!(bonuses[1] > bonuses[0]);
        assert!(bonuses[0] > bonuses[2]);

        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(select(&arms, &mut rng).unwrap().index(), 1);
    }

    #[test]
    fn test_higher_mean_wins_at_equal_counts() {
        let arms = [arm(5, 0.2), arm(5, 0.7), arm(5, 0.4)];
        let mut rng = StdRng::seed_from_u64(7);
        match select(&arms, &mut rng).unwrap() {
            Selection::Scored { index, score } => {
                assert_eq!(index, 1);
                let expected = 0.7 + (2.0 * 15f64.ln() / 5.0).sqrt();
                assert!((score - expected).abs() < 1e-12);
            }
            other => panic!("expected scored selection, got {other:?}"),
        }
    }

    #[test]
    fn test_ties_go_to_lowest_index() {
        let arms = [arm(4, 0.5), arm(4, 0.5), arm(4, 0.5)];
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            select(&arms, &mut rng),
            Some(Selection::Scored {
                index: 0,
                score: 0.5 + (2.0 * 12f64.ln() / 4.0).sqrt()
            })
        );
    }

    #[test]
    fn test_single_observation_total_is_finite() {
        // ln(1) = 0, so only the means matter.
        let arms = [arm(1, 0.0)];
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            select(&arms, &mut rng),
            Some(Selection::Scored { index: 0, score: 0.0 })
        );
    }

    #[test]
    fn test_unobserved_arm_forces_fallback() {
        let arms = [arm(3, 0.9), arm(0, 0.0)];
        let mut rng = StdRng::seed_from_u64(3);
        assert!(matches!(
            select(&arms, &mut rng),
            Some(Selection::Fallback { .. })
        ));
    }

    #[test]
    fn test_zero_observations_fall_back_uniformly() {
        let arms = [arm(0, 0.0); 4];
        let mut rng = StdRng::seed_from_u64(42);
        let trials = 8000;
        let mut hits = [0usize; 4];
        for _ in 0..trials {
            match select(&arms, &mut rng).unwrap() {
                Selection::Fallback { index } => hits[index] += 1,
                other => panic!("expected fallback, got {other:?}"),
            }
        }
        let expected = trials as f64 / 4.0;
        for count in hits {
            let deviation = (count as f64 - expected).abs() / expected;
            assert!(deviation < 0.1, "non-uniform fallback: {hits:?}");
        }
    }

    #[test]
    fn test_no_arms() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(select(&[], &mut rng), None);
    }
}
