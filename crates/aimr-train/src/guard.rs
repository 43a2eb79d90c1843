//! Live-allocation growth detector.
//!
//! Observed once per training step. The first non-zero observation only
//! sets the baseline (setup allocations settle during the first step).
//! After that, a count above the highest count seen so far means something
//! allocated during a step was never released.

use crate::error::{TrainError, TrainResult};

/// Tracks the live tensor count between steps.
#[derive(Debug, Clone)]
pub struct MemoryGuard {
    high_water: usize,
}

impl Default for MemoryGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGuard {
    pub fn new() -> Self {
        Self {
            high_water: usize::MAX,
        }
    }

    /// Record `count`; errors with [`TrainError::ResourceLeak`] on growth.
    ///
    /// A count of zero means the runtime reports nothing and is ignored.
    pub fn observe(&mut self, count: usize) -> TrainResult<()> {
        if count == 0 {
            return Ok(());
        }
        if self.high_water == usize::MAX {
            self.high_water = count;
            return Ok(());
        }
        if count > self.high_water {
            return Err(TrainError::ResourceLeak {
                previous: self.high_water,
                current: count,
            });
        }
        Ok(())
    }

    /// Highest count seen, `None` before the first observation.
    pub fn baseline(&self) -> Option<usize> {
        (self.high_water != usize::MAX).then_some(self.high_water)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_trip(counts: &[usize]) -> Option<usize> {
        let mut guard = MemoryGuard::new();
        counts
            .iter()
            .position(|&c| guard.observe(c).is_err())
            .map(|i| i + 1)
    }

    #[test]
    fn test_growth_trips_on_fourth_observation() {
        assert_eq!(first_trip(&[5, 5, 5, 8]), Some(4));
    }

    #[test]
    fn test_decrease_then_recover_never_trips() {
        assert_eq!(first_trip(&[5, 4, 5, 5]), None);
    }

    #[test]
    fn test_first_observation_exempt() {
        let mut guard = MemoryGuard::new();
        assert!(guard.baseline().is_none());
        guard.observe(1_000_000).unwrap();
        assert_eq!(guard.baseline(), Some(1_000_000));
    }

    #[test]
    fn test_zero_counts_ignored() {
        assert_eq!(first_trip(&[0, 0, 3, 0, 3]), None);
        let mut guard = MemoryGuard::new();
        guard.observe(0).unwrap();
        assert_eq!(guard.baseline(), None);
    }

    #[test]
    fn test_leak_error_carries_counts() {
        let mut guard = MemoryGuard::new();
        guard.observe(10).unwrap();
        match guard.observe(11) {
            Err(TrainError::ResourceLeak { previous, current }) => {
                assert_eq!((previous, current), (10, 11));
            }
            other => panic!("expected leak, got {:?}", other),
        }
    }
}
