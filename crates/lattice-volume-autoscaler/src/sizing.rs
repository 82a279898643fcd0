//! Expansion sizing and usage arithmetic
//!
//! All byte math is done on integers so results are exact at any scale.

use lattice_common::quantity::GI;

/// Growth used when no `increaseMinimum` is configured
pub const FALLBACK_INCREASE_MINIMUM: u128 = GI;

/// Compute the size to request for a volume currently at `current` bytes.
///
/// The step is `increase_percent` of `current`, floored at
/// `increase_minimum` (1Gi when unset), and the result is capped at
/// `max_size`. A volume already at or beyond the cap keeps its size.
pub fn next_size(
    current: u128,
    increase_percent: u32,
    increase_minimum: Option<u128>,
    max_size: u128,
) -> u128 {
    if current >= max_size {
        return current;
    }
    let proportional = current.saturating_mul(u128::from(increase_percent)) / 100;
    let floor = increase_minimum.unwrap_or(FALLBACK_INCREASE_MINIMUM);
    let increase = proportional.max(floor);
    current.saturating_add(increase).min(max_size)
}

/// Usage as a whole percentage of capacity, rounded half up.
///
/// Returns `None` for a zero capacity.
pub fn usage_percent(used: u128, capacity: u128) -> Option<i32> {
    if capacity == 0 {
        return None;
    }
    let pct = (used.saturating_mul(100) + capacity / 2) / capacity;
    Some(i32::try_from(pct).unwrap_or(i32::MAX))
}

/// Convert a telemetry sample to a whole count; negatives clamp to zero
pub fn whole_sample(sample: f64) -> u128 {
    if sample <= 0.0 {
        0
    } else {
        sample.round() as u128
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::quantity::{format_quantity, MI};

    #[test]
    fn percentage_step_dominates_for_large_volumes() {
        // 10Gi at 90% with +20% and a 1Gi floor grows to 12Gi
        assert_eq!(next_size(10 * GI, 20, Some(GI), 100 * GI), 12 * GI);
        assert_eq!(format_quantity(next_size(10 * GI, 20, Some(GI), 100 * GI)), "12Gi");
    }

    #[test]
    fn minimum_step_dominates_for_small_volumes() {
        // 1Gi +10% is 102.4Mi, below the 1Gi floor
        assert_eq!(next_size(GI, 10, Some(GI), 100 * GI), 2 * GI);
    }

    #[test]
    fn explicit_minimum_overrides_small_percentage() {
        // 10Gi +10% is 1Gi, below the 5Gi floor
        let next = next_size(10 * GI, 10, Some(5 * GI), 100 * GI);
        assert_eq!(next, 15 * GI);
        assert_eq!(format_quantity(next), "15Gi");
    }

    #[test]
    fn large_step_is_capped_at_max() {
        // 10Gi +50% would be 15Gi
        let next = next_size(10 * GI, 50, None, 12 * GI);
        assert_eq!(next, 12 * GI);
        assert_eq!(format_quantity(next), "12Gi");
    }

    #[test]
    fn result_is_capped_at_max() {
        assert_eq!(next_size(95 * GI, 20, Some(GI), 100 * GI), 100 * GI);
    }

    #[test]
    fn unset_minimum_falls_back_to_one_gibibyte() {
        assert_eq!(next_size(2 * GI, 1, None, 100 * GI), 3 * GI);
    }

    #[test]
    fn never_shrinks_when_already_above_max() {
        assert_eq!(next_size(120 * GI, 20, Some(GI), 100 * GI), 120 * GI);
        assert_eq!(next_size(100 * GI, 20, Some(GI), 100 * GI), 100 * GI);
    }

    #[test]
    fn proportional_step_truncates_toward_zero() {
        // 1000 bytes * 33% = 330 bytes; the zero floor leaves it at that
        assert_eq!(next_size(1000, 33, Some(0), u128::MAX), 1330);
        assert_eq!(next_size(1001, 33, Some(0), u128::MAX), 1331);
    }

    #[test]
    fn sizing_is_monotone_and_bounded() {
        let sizes = [0, 1, MI, 512 * MI, GI, 7 * GI, 99 * GI, 100 * GI];
        let percents = [1, 10, 20, 50, 100, 300];
        let minimums = [None, Some(0), Some(MI), Some(5 * GI)];
        let max = 100 * GI;

        for &current in &sizes {
            for &pct in &percents {
                for &min in &minimums {
                    let next = next_size(current, pct, min, max);
                    assert!(next >= current, "{current} {pct} {min:?} shrank to {next}");
                    assert!(next <= max.max(current));
                    if current < max {
                        let step = (current * u128::from(pct) / 100).max(min.unwrap_or(GI));
                        assert!(next >= (current + step).min(max));
                    }
                }
            }
        }
    }

    #[test]
    fn usage_percent_rounds_half_up() {
        assert_eq!(usage_percent(9 * GI, 10 * GI), Some(90));
        assert_eq!(usage_percent(5 * GI, 10 * GI), Some(50));
        assert_eq!(usage_percent(1, 200), Some(1));
        assert_eq!(usage_percent(1, 201), Some(0));
        assert_eq!(usage_percent(0, 10), Some(0));
        assert_eq!(usage_percent(1, 0), None);
        // kubelet can briefly report used > capacity after a resize
        assert_eq!(usage_percent(11, 10), Some(110));
    }

    #[test]
    fn samples_round_to_whole_counts() {
        assert_eq!(whole_sample(1024.0), 1024);
        assert_eq!(whole_sample(1023.6), 1024);
        assert_eq!(whole_sample(-5.0), 0);
    }
}
