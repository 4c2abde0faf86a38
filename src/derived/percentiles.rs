//! Nearest-rank percentiles over per-listener values.
//!
//! No interpolation: each reported value is an element of the input.

use serde::{Deserialize, Serialize};

/// Percentile grid step used by the global distributions (0, 5, ..., 100).
pub const DEFAULT_PERCENTILE_STEP: u8 = 5;

/// A `(percentile, value)` pair, serialised as a two element array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentilePoint<T>(pub u8, pub T);

pub fn percentile_grid_points(step: u8) -> Vec<u8> {
    let step = step.clamp(1, 100);
    let mut points: Vec<u8> = (0..=100).step_by(step as usize).collect();
    if points.last() != Some(&100) {
        points.push(100);
    }
    points
}

/// Value at percentile `p` of an ascending `sorted` slice.
///
/// Rank is `ceil(p / 100 * n)`, clamped to `1..=n`, so P0 is the minimum
/// and P100 the maximum.
pub fn nearest_rank<T: Copy>(sorted: &[T], p: u8) -> Option<T> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = (p.min(100) as usize * n).div_ceil(100).clamp(1, n);
    Some(sorted[rank - 1])
}

/// Sorts `values` ascending and evaluates every point of the grid.
pub fn percentile_grid<T>(mut values: Vec<T>, step: u8) -> Vec<PercentilePoint<T>>
where
    T: Copy + PartialOrd,
{
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    percentile_grid_points(step)
        .into_iter()
        .filter_map(|p| nearest_rank(&values, p).map(|v| PercentilePoint(p, v)))
        .collect()
}

/// Percent of listeners strictly below `value`, estimated from a grid.
///
/// Returns the highest grid percentile whose value is still below `value`.
pub fn standing_in_grid<T>(grid: &[PercentilePoint<T>], value: T) -> u8
where
    T: Copy + PartialOrd,
{
    grid.iter()
        .filter(|point| point.1 < value)
        .map(|point| point.0)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn grid_points() {
        let points = percentile_grid_points(DEFAULT_PERCENTILE_STEP);
        assert_eq!(points.len(), 21);
        assert_eq!(points[0], 0);
        assert_eq!(points[20], 100);
        assert_eq!(percentile_grid_points(30), vec![0, 30, 60, 90, 100]);
    }

    #[test]
    fn nearest_rank_values() {
        let sorted = [15, 20, 35, 40, 50];
        assert_eq!(nearest_rank(&sorted, 0), Some(15));
        assert_eq!(nearest_rank(&sorted, 5), Some(15));
        assert_eq!(nearest_rank(&sorted, 30), Some(20));
        assert_eq!(nearest_rank(&sorted, 40), Some(20));
        assert_eq!(nearest_rank(&sorted, 50), Some(35));
        assert_eq!(nearest_rank(&sorted, 100), Some(50));
        assert_eq!(nearest_rank::<u32>(&[], 50), None);
    }

    #[test]
    fn grid_sorts_its_input() {
        let grid = percentile_grid(vec![3.0, 1.0, 2.0], 50);
        assert_eq!(
            grid,
            vec![
                PercentilePoint(0, 1.0),
                PercentilePoint(50, 2.0),
                PercentilePoint(100, 3.0)
            ]
        );
        assert!(percentile_grid::<u32>(Vec::new(), 5).is_empty());
    }

    #[test]
    fn standing_uses_values_strictly_below() {
        let grid = percentile_grid((1..=100).collect::<Vec<u32>>(), 5);
        assert_eq!(standing_in_grid(&grid, 1), 0);
        assert_eq!(standing_in_grid(&grid, 51), 50);
        assert_eq!(standing_in_grid(&grid, 1000), 100);
    }

    #[test]
    fn serialises_as_pairs() {
        let json = serde_json::to_string(&PercentilePoint(25, 7u32)).unwrap();
        assert_eq!(json, "[25,7]");
    }

    proptest! {
        #[test]
        fn percentiles_are_monotonic(values in proptest::collection::vec(0u32..10_000, 1..200)) {
            let grid = percentile_grid(values, DEFAULT_PERCENTILE_STEP);
            for pair in grid.windows(2) {
                prop_assert!(pair[0].0 < pair[1].0);
                prop_assert!(pair[0].1 <= pair[1].1);
            }
        }

        #[test]
        fn endpoints_are_min_and_max(values in proptest::collection::vec(-1e6f64..1e6, 1..100)) {
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let grid = percentile_grid(values, DEFAULT_PERCENTILE_STEP);
            prop_assert_eq!(grid.first().map(|p| p.1), Some(min));
            prop_assert_eq!(grid.last().map(|p| p.1), Some(max));
        }
    }
}
