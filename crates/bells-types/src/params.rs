#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::arith::{encode_compact, hex_u256, U256};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Testnet,
    Signet,
    Regtest,
}

/// One row of the legacy retarget clamp table. The first row whose
/// `above_height` is below the new block height applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyEra {
    pub above_height: u64,
    pub min_divisor: i64,
    pub max_multiplier: i64,
}

pub fn default_legacy_eras() -> Vec<LegacyEra> {
    vec![
        LegacyEra {
            above_height: 10_000,
            min_divisor: 4,
            max_multiplier: 4,
        },
        LegacyEra {
            above_height: 5_000,
            min_divisor: 8,
            max_multiplier: 4,
        },
        LegacyEra {
            above_height: 0,
            min_divisor: 16,
            max_multiplier: 4,
        },
    ]
}

/// Proof-of-work consensus parameters consumed by retargeting and headers sync.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    pub network: Network,
    /// Easiest allowed target.
    #[serde(with = "hex_u256")]
    pub pow_limit: U256,
    /// Chainwork a header chain must reach before it is worth downloading.
    #[serde(with = "hex_u256")]
    pub minimum_chain_work: U256,
    /// Number of blocks averaged by the window algorithm.
    pub pow_averaging_window: u32,
    /// Seconds per block used by all time based rules.
    pub pow_target_spacing: i64,
    /// Seconds per block used only to derive the legacy adjustment interval.
    pub legacy_target_spacing: i64,
    pub pow_target_timespan: i64,
    /// Percent.
    pub pow_max_adjust_up: i64,
    /// Percent.
    pub pow_max_adjust_down: i64,
    /// Last height retargeted with the legacy algorithm.
    pub new_pow_diff_height: u64,
    pub pow_allow_min_difficulty_blocks: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pow_allow_min_difficulty_blocks_after_height: Option<u64>,
    pub pow_no_retargeting: bool,
    #[serde(default = "default_legacy_eras")]
    pub legacy_eras: Vec<LegacyEra>,
}

impl ConsensusParams {
    pub fn pow_limit_compact(&self) -> u32 {
        encode_compact(&self.pow_limit)
    }

    pub fn difficulty_adjustment_interval(&self) -> i64 {
        if self.legacy_target_spacing <= 0 {
            return 1;
        }
        (self.pow_target_timespan / self.legacy_target_spacing).max(1)
    }

    pub fn averaging_window_timespan(&self) -> i64 {
        i64::from(self.pow_averaging_window) * self.pow_target_spacing
    }

    pub fn min_actual_timespan(&self) -> i64 {
        (self.averaging_window_timespan() * (100 - self.pow_max_adjust_up)) / 100
    }

    pub fn max_actual_timespan(&self) -> i64 {
        (self.averaging_window_timespan() * (100 + self.pow_max_adjust_down)) / 100
    }

    /// `(min, max)` legacy timespan clamp for a block at `height`.
    pub fn legacy_timespan_bounds(&self, height: u64) -> (i64, i64) {
        let timespan = self.pow_target_timespan;
        let era = self
            .legacy_eras
            .iter()
            .find(|era| height > era.above_height)
            .or_else(|| self.legacy_eras.last());
        match era {
            Some(era) => (
                timespan / era.min_divisor.max(1),
                timespan.saturating_mul(era.max_multiplier),
            ),
            None => (timespan / 4, timespan.saturating_mul(4)),
        }
    }

    /// Whether the "min difficulty after a long gap" rule applies to the
    /// block following `prev_height`.
    pub fn min_difficulty_after(&self, prev_height: u64) -> bool {
        matches!(
            self.pow_allow_min_difficulty_blocks_after_height,
            Some(h) if prev_height >= h
        )
    }
}
