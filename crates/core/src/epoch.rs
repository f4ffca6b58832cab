//! Epoch arithmetic: inference epoch repair and settlement heights.
//!
//! The chain reports `epoch_id = 0` on expired inference records regardless of
//! the epoch they belong to. The true epoch is recovered from the record's start
//! height relative to the current epoch's effective start:
//!
//! ```text
//!   start >= effective          -> current epoch
//!   start <  effective          -> current - ceil((effective - start) / epoch_length)
//! ```
//!
//! Ceiling division matters: a record one block before the current epoch's
//! start belongs to the previous epoch, which floor division would miss.

use crate::constants::SETTLEMENT_HEIGHT_OFFSET;
use crate::error::{CoreError, Result};

/// The current epoch's position on the chain, used to place inference records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochWindow {
    epoch_id: u64,
    effective_height: u64,
    epoch_length: u64,
}

impl EpochWindow {
    /// Build a window; the epoch length must be positive.
    pub fn new(epoch_id: u64, effective_height: u64, epoch_length: u64) -> Result<Self> {
        if epoch_length == 0 {
            return Err(CoreError::InvalidEpochLength(epoch_length));
        }
        Ok(Self {
            epoch_id,
            effective_height,
            epoch_length,
        })
    }

    /// Current epoch id.
    pub fn epoch_id(&self) -> u64 {
        self.epoch_id
    }

    /// Current epoch's effective start height.
    pub fn effective_height(&self) -> u64 {
        self.effective_height
    }

    /// Epoch the given start height falls into.
    pub fn epoch_for_height(&self, start_block_height: u64) -> u64 {
        if start_block_height >= self.effective_height {
            return self.epoch_id;
        }
        let blocks_before = self.effective_height - start_block_height;
        let epochs_back = blocks_before.div_ceil(self.epoch_length);
        self.epoch_id.saturating_sub(epochs_back)
    }

    /// Corrected epoch for a record: only an upstream `0` is re-derived.
    pub fn repair(&self, reported_epoch_id: u64, start_block_height: u64) -> u64 {
        if reported_epoch_id == 0 {
            self.epoch_for_height(start_block_height)
        } else {
            reported_epoch_id
        }
    }

    /// Epochs whose inference records are retained: current and previous.
    pub fn target_epochs(&self) -> Vec<u64> {
        let mut epochs = vec![self.epoch_id];
        if self.epoch_id > 0 {
            epochs.push(self.epoch_id - 1);
        }
        epochs
    }

    /// Whether an epoch is in the retained set.
    pub fn is_target(&self, epoch_id: u64) -> bool {
        epoch_id == self.epoch_id || (self.epoch_id > 0 && epoch_id == self.epoch_id - 1)
    }
}

/// Canonical settlement height of an epoch, given the next epoch's effective height.
pub fn settlement_height(next_effective_height: u64) -> u64 {
    next_effective_height.saturating_sub(SETTLEMENT_HEIGHT_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> EpochWindow {
        EpochWindow::new(65, 1_000_000, 1_000).unwrap()
    }

    #[test]
    fn test_rejects_zero_length() {
        assert_eq!(
            EpochWindow::new(1, 10, 0),
            Err(CoreError::InvalidEpochLength(0))
        );
    }

    #[test]
    fn test_partial_epoch_deficit_rounds_up() {
        // 500 blocks before the start is still one full epoch back.
        assert_eq!(window().repair(0, 999_500), 64);
        assert_eq!(window().repair(0, 999_999), 64);
    }

    #[test]
    fn test_exact_and_multiple_epoch_deficits() {
        assert_eq!(window().repair(0, 999_000), 64);
        assert_eq!(window().repair(0, 998_999), 63);
        assert_eq!(window().repair(0, 997_000), 62);
    }

    #[test]
    fn test_at_or_after_start_is_current() {
        assert_eq!(window().repair(0, 1_000_000), 65);
        assert_eq!(window().repair(0, 1_000_731), 65);
    }

    #[test]
    fn test_nonzero_epoch_is_trusted() {
        assert_eq!(window().repair(61, 999_500), 61);
    }

    #[test]
    fn test_repair_is_idempotent() {
        let w = window();
        for start in [990_001, 999_000, 999_500, 1_000_000, 1_000_900] {
            let once = w.repair(0, start);
            assert_eq!(w.repair(once, start), once);
            assert_eq!(w.repair(0, start), once);
        }
    }

    #[test]
    fn test_deep_history_saturates() {
        let w = EpochWindow::new(2, 5_000, 1_000).unwrap();
        assert_eq!(w.repair(0, 1), 0);
    }

    #[test]
    fn test_target_epochs() {
        let w = window();
        assert_eq!(w.target_epochs(), vec![65, 64]);
        assert!(w.is_target(64));
        assert!(!w.is_target(63));

        let genesis = EpochWindow::new(0, 0, 10).unwrap();
        assert_eq!(genesis.target_epochs(), vec![0]);
    }

    #[test]
    fn test_settlement_height() {
        assert_eq!(settlement_height(1_025_330), 1_025_320);
        assert_eq!(settlement_height(3), 0);
    }
}
