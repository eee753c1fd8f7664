//! Descriptive statistics over winning-bid prices

use serde::{Deserialize, Serialize};

/// Summary of one outlet's winning prices
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceStats {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation (n - 1); 0 for a single value
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub q1: f64,
    pub q3: f64,
}

impl PriceStats {
    /// `None` for an empty slice. Values must be finite.
    pub fn compute(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        let stddev = if count > 1 {
            let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        Some(Self {
            count,
            mean,
            stddev,
            min: sorted[0],
            max: sorted[count - 1],
            q1: percentile(&sorted, 0.25),
            q3: percentile(&sorted, 0.75),
        })
    }
}

/// Linear-interpolation percentile (`p` in [0, 1]) of an ascending, non-empty slice
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_quartiles_on_exact_ranks() {
        let stats = PriceStats::compute(&[300.0, 100.0, 160.0, 120.0, 140.0]).unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.mean, 164.0);
        assert_eq!(stats.min, 100.0);
        assert_eq!(stats.max, 300.0);
        assert_eq!(stats.q1, 120.0);
        assert_eq!(stats.q3, 160.0);
    }

    #[test]
    fn test_interpolated_percentile() {
        assert_eq!(percentile(&[10.0, 20.0, 30.0, 40.0], 0.25), 17.5);
        assert_eq!(percentile(&[10.0, 20.0, 30.0, 40.0], 0.75), 32.5);
        assert_eq!(percentile(&[42.0], 0.75), 42.0);
    }

    #[test]
    fn test_sample_stddev() {
        let stats = PriceStats::compute(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((stats.stddev - 2.138_089_935).abs() < 1e-6);
        assert_eq!(PriceStats::compute(&[50.0]).unwrap().stddev, 0.0);
        assert!(PriceStats::compute(&[]).is_none());
    }

    proptest! {
        #[test]
        fn prop_quartiles_ordered(values in prop::collection::vec(1.0f64..10_000.0, 1..50)) {
            let stats = PriceStats::compute(&values).unwrap();
            prop_assert!(stats.min <= stats.q1);
            prop_assert!(stats.q1 <= stats.q3);
            prop_assert!(stats.q3 <= stats.max);
            prop_assert!(stats.stddev >= 0.0);
        }
    }
}
