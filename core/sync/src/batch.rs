//! Adaptive batch sizing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Batch sizing bounds and target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchConfig {
    pub min_size: usize,
    pub max_size: usize,
    /// Largest change applied after a single batch.
    pub max_step: usize,
    /// Desired wall time per batch.
    #[serde(with = "crate::duration_ms")]
    pub target: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 50,
            max_step: 5,
            target: Duration::from_millis(2000),
        }
    }
}

/// Chooses batch sizes so each batch takes roughly the target time.
#[derive(Debug, Clone)]
pub struct BatchSizer {
    config: BatchConfig,
    current: usize,
}

impl BatchSizer {
    /// Start with a size picked from the total item count.
    pub fn for_total(config: BatchConfig, total: usize) -> Self {
        let current = Self::initial_for(&config, total);
        Self { config, current }
    }

    /// Initial size tier for `total` items, clamped to the configured bounds.
    pub fn initial_for(config: &BatchConfig, total: usize) -> usize {
        let tier = match total {
            0..=10 => 5,
            11..=100 => 10,
            101..=500 => 20,
            _ => 30,
        };
        clamp(tier, config)
    }

    /// Size for the next batch.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Adapt after a batch of `len` items took `elapsed`.
    ///
    /// Returns the new size.
    pub fn adjust(&mut self, len: usize, elapsed: Duration) -> usize {
        if len == 0 {
            return self.current;
        }

        let ms_per_item = (elapsed.as_secs_f64() * 1000.0 / len as f64).max(f64::EPSILON);
        let ideal = (self.config.target.as_millis() as f64 / ms_per_item).floor();
        let ideal = if ideal.is_finite() && ideal < usize::MAX as f64 {
            ideal as usize
        } else {
            usize::MAX
        };
        let ideal = clamp(ideal, &self.config);

        let step = self.config.max_step.max(1);
        let next = if ideal > self.current {
            self.current + (ideal - self.current).min(step)
        } else {
            self.current - (self.current - ideal).min(step)
        };

        self.current = clamp(next, &self.config);
        self.current
    }
}

fn clamp(size: usize, config: &BatchConfig) -> usize {
    let min = config.min_size.max(1);
    let max = config.max_size.max(min);
    size.clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_initial_tiers() {
        let config = BatchConfig::default();
        assert_eq!(BatchSizer::initial_for(&config, 0), 5);
        assert_eq!(BatchSizer::initial_for(&config, 10), 5);
        assert_eq!(BatchSizer::initial_for(&config, 11), 10);
        assert_eq!(BatchSizer::initial_for(&config, 100), 10);
        assert_eq!(BatchSizer::initial_for(&config, 500), 20);
        assert_eq!(BatchSizer::initial_for(&config, 501), 30);
    }

    #[test]
    fn test_initial_tier_is_clamped() {
        let config = BatchConfig {
            max_size: 8,
            ..BatchConfig::default()
        };
        assert_eq!(BatchSizer::initial_for(&config, 1000), 8);
    }

    #[test]
    fn test_fast_batches_grow_by_step() {
        let mut sizer = BatchSizer::for_total(BatchConfig::default(), 50);
        assert_eq!(sizer.current(), 10);
        assert_eq!(sizer.adjust(10, Duration::from_millis(100)), 15);
        assert_eq!(sizer.adjust(15, Duration::from_millis(100)), 20);
    }

    #[test]
    fn test_slow_batches_shrink_by_step() {
        let mut sizer = BatchSizer::for_total(BatchConfig::default(), 1000);
        assert_eq!(sizer.current(), 30);
        // 1s per item means the ideal is 2
        assert_eq!(sizer.adjust(30, Duration::from_secs(30)), 25);
    }

    #[test]
    fn test_on_target_batch_holds() {
        let mut sizer = BatchSizer::for_total(BatchConfig::default(), 50);
        assert_eq!(sizer.adjust(10, Duration::from_millis(2000)), 10);
    }

    proptest! {
        #[test]
        fn batch_size_stays_in_bounds(
            min in 1usize..10,
            span in 0usize..60,
            step in 1usize..10,
            total in 0usize..2000,
            batches in proptest::collection::vec((0usize..100, 0u64..20_000), 1..30),
        ) {
            let config = BatchConfig {
                min_size: min,
                max_size: min + span,
                max_step: step,
                target: Duration::from_millis(2000),
            };
            let mut sizer = BatchSizer::for_total(config.clone(), total);
            prop_assert!(sizer.current() >= config.min_size);
            prop_assert!(sizer.current() <= config.max_size);

            for (len, ms) in batches {
                let before = sizer.current();
                let after = sizer.adjust(len, Duration::from_millis(ms));
                prop_assert!(after >= config.min_size);
                prop_assert!(after <= config.max_size);
                prop_assert!(after.abs_diff(before) <= config.max_step);
            }
        }
    }
}
