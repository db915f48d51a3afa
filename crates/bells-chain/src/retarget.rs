#![forbid(unsafe_code)]

//! Next-target computation (legacy interval retarget and the averaging
//! window that replaced it) and the coarse transition bound check.

use bells_types::arith::{mul_div, round_compact};
use bells_types::{decode_compact, encode_compact, ConsensusParams, U256};
use tracing::trace;

use crate::pow::{PowError, Result};

/// Legacy testnet rule: a block this many spacings late may use pow_limit.
pub const LEGACY_MIN_DIFFICULTY_GAP_SPACINGS: i64 = 4;
/// Averaging window rule after `pow_allow_min_difficulty_blocks_after_height`.
pub const MIN_DIFFICULTY_GAP_SPACINGS: i64 = 6;
/// Dampening applied to the window timespan deviation.
pub const TIMESPAN_DAMPING: i64 = 4;

/// What the engine needs to know about one ancestor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetargetSample {
    pub height: u64,
    pub time: i64,
    pub bits: u32,
    pub median_time_past: i64,
}

fn sample_index(prior: &[RetargetSample], height: u64) -> Option<usize> {
    let first = prior.first()?.height;
    let idx = usize::try_from(height.checked_sub(first)?).ok()?;
    match prior.get(idx) {
        Some(s) if s.height == height => Some(idx),
        _ => None,
    }
}

/// Compact target required for the block after `prior.last()`.
///
/// `prior` is a contiguous run of ancestors ordered oldest first. It must
/// reach back far enough for the active algorithm: one adjustment interval
/// for legacy heights, `pow_averaging_window + 1` entries afterwards. An
/// empty slice means the next block is genesis.
pub fn next_work_required(
    prior: &[RetargetSample],
    new_time: i64,
    params: &ConsensusParams,
) -> Result<u32> {
    let Some(last) = prior.last() else {
        return Ok(params.pow_limit_compact());
    };
    if last.height <= params.new_pow_diff_height {
        next_work_required_legacy(prior, last, new_time, params)
    } else {
        next_work_required_averaged(prior, last, new_time, params)
    }
}

fn next_work_required_legacy(
    prior: &[RetargetSample],
    last: &RetargetSample,
    new_time: i64,
    params: &ConsensusParams,
) -> Result<u32> {
    let interval = params.difficulty_adjustment_interval() as u64;
    let limit = params.pow_limit_compact();

    if (last.height + 1) % interval != 0 {
        if !params.pow_allow_min_difficulty_blocks {
            return Ok(last.bits);
        }
        if new_time > last.time + params.pow_target_spacing * LEGACY_MIN_DIFFICULTY_GAP_SPACINGS {
            return Ok(limit);
        }
        // Last block that was not a min-difficulty exception.
        let mut i = prior.len() - 1;
        while prior[i].height != 0 && prior[i].height % interval != 0 && prior[i].bits == limit {
            if i == 0 {
                return Err(PowError::InsufficientHistory {
                    height: prior[i].height - 1,
                });
            }
            i -= 1;
        }
        return Ok(prior[i].bits);
    }

    // The first retarget after genesis only has interval - 1 blocks behind it.
    let back = if last.height + 1 == interval {
        interval - 1
    } else {
        interval
    };
    let first_height = last.height.saturating_sub(back);
    let first = sample_index(prior, first_height)
        .map(|i| prior[i])
        .ok_or(PowError::InsufficientHistory {
            height: first_height,
        })?;

    Ok(calculate_next_work_required(last, first.time, params))
}

fn next_work_required_averaged(
    prior: &[RetargetSample],
    last: &RetargetSample,
    new_time: i64,
    params: &ConsensusParams,
) -> Result<u32> {
    if params.pow_no_retargeting {
        return Ok(last.bits);
    }
    let limit = params.pow_limit_compact();

    if params.min_difficulty_after(last.height)
        && new_time > last.time + params.pow_target_spacing * MIN_DIFFICULTY_GAP_SPACINGS
    {
        return Ok(limit);
    }

    let window = u64::from(params.pow_averaging_window);
    let Some(first_height) = last.height.checked_sub(window) else {
        // Not enough blocks to fill the window yet.
        return Ok(limit);
    };
    let first_idx = sample_index(prior, first_height).ok_or(PowError::InsufficientHistory {
        height: first_height,
    })?;

    let total = prior[first_idx + 1..].iter().fold(U256::zero(), |acc, s| {
        acc.checked_add(decode_compact(s.bits).target)
            .unwrap_or(U256::MAX)
    });
    let avg = total / U256::from(window);

    Ok(calculate_next_work_required_averaged(
        avg,
        last.median_time_past,
        prior[first_idx].median_time_past,
        params,
    ))
}

/// Legacy retarget: scale `last.bits` by the observed interval timespan,
/// clamped by the era table for the new height.
pub fn calculate_next_work_required(
    last: &RetargetSample,
    first_block_time: i64,
    params: &ConsensusParams,
) -> u32 {
    let height = last.height + 1;
    let timespan = params.pow_target_timespan;
    let actual = last.time.saturating_sub(first_block_time);
    let (min, max) = params.legacy_timespan_bounds(height);

    let mut modulated = actual;
    if modulated < min {
        modulated = min;
    } else if modulated > max {
        modulated = max;
    }
    if modulated != actual {
        trace!(height, actual, modulated, "legacy timespan clamped");
    }

    let target = decode_compact(last.bits).target;
    let mut next = mul_div(target, modulated.max(0) as u64, timespan.max(1) as u64);
    if next > params.pow_limit {
        next = params.pow_limit;
    }
    encode_compact(&next)
}

/// Averaging window retarget from the window's mean target and the MTP of
/// its first (oldest, outside the sum) and last entries.
pub fn calculate_next_work_required_averaged(
    avg_target: U256,
    last_mtp: i64,
    first_mtp: i64,
    params: &ConsensusParams,
) -> u32 {
    let window_timespan = params.averaging_window_timespan();
    if window_timespan <= 0 {
        return params.pow_limit_compact();
    }

    let span = last_mtp.saturating_sub(first_mtp);
    let mut actual = window_timespan + (span - window_timespan) / TIMESPAN_DAMPING;
    let (min, max) = (params.min_actual_timespan(), params.max_actual_timespan());
    if actual < min {
        trace!(span, actual, min, "window timespan clamped up");
        actual = min;
    }
    if actual > max {
        trace!(span, actual, max, "window timespan clamped down");
        actual = max;
    }

    let mut next = (avg_target / U256::from(window_timespan as u64))
        .checked_mul(U256::from(actual.max(0) as u64))
        .unwrap_or(U256::MAX);
    if next > params.pow_limit {
        next = params.pow_limit;
    }
    encode_compact(&next)
}

/// Whether `new_bits` may follow `old_bits` at `height` under the legacy
/// +-4x interval bounds. Off-boundary the bits must not change.
pub fn permitted_difficulty_transition(
    params: &ConsensusParams,
    height: u64,
    old_bits: u32,
    new_bits: u32,
) -> bool {
    if params.pow_allow_min_difficulty_blocks {
        return true;
    }

    let interval = params.difficulty_adjustment_interval() as u64;
    if height % interval != 0 {
        return old_bits == new_bits;
    }

    let timespan = params.pow_target_timespan.max(1) as u64;
    let smallest_timespan = timespan / 4;
    let largest_timespan = timespan.saturating_mul(4);

    let old = decode_compact(old_bits).target;
    let observed = decode_compact(new_bits).target;

    let mut largest = mul_div(old, largest_timespan, timespan);
    if largest > params.pow_limit {
        largest = params.pow_limit;
    }
    if round_compact(&largest) < observed {
        return false;
    }

    let mut smallest = mul_div(old, smallest_timespan, timespan);
    if smallest > params.pow_limit {
        smallest = params.pow_limit;
    }
    if round_compact(&smallest) > observed {
        return false;
    }
    true
}
