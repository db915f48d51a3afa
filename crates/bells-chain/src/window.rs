#![forbid(unsafe_code)]

use std::collections::VecDeque;

use bells_types::{decode_compact, ConsensusParams, U256};
use tracing::debug;

use crate::retarget::{
    calculate_next_work_required_averaged, permitted_difficulty_transition,
    MIN_DIFFICULTY_GAP_SPACINGS,
};

/// Timestamps feeding one median-time-past value.
pub const MTP_SPAN: usize = 11;

/// Accepted distance, in target units, between the observed target and the
/// one recomputed from the window.
pub const WINDOW_TARGET_SLACK: u64 = 4;

/// `(bits, time)` of one ancestor, used to seed a checker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderSample {
    pub bits: u32,
    pub time: i64,
}

/// Difficulty check for headers that are not in the chain index yet.
///
/// Keeps the last `pow_averaging_window` targets, the last
/// `pow_averaging_window + 1` median times and the last [`MTP_SPAN`] raw
/// timestamps of the candidate chain.
#[derive(Clone, Debug)]
pub struct WindowRetargetChecker {
    params: ConsensusParams,
    recent_bits: VecDeque<u32>,
    recent_mtp: VecDeque<i64>,
    recent_times: VecDeque<i64>,
}

impl WindowRetargetChecker {
    pub fn new(params: ConsensusParams) -> Self {
        let window = params.pow_averaging_window as usize;
        Self {
            params,
            recent_bits: VecDeque::with_capacity(window),
            recent_mtp: VecDeque::with_capacity(window + 1),
            recent_times: VecDeque::with_capacity(MTP_SPAN),
        }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    fn window(&self) -> usize {
        self.params.pow_averaging_window as usize
    }

    pub fn clear(&mut self) {
        self.recent_bits.clear();
        self.recent_mtp.clear();
        self.recent_times.clear();
    }

    /// Reset and replay `history`, oldest first.
    pub fn seed_from_history(&mut self, history: &[HeaderSample]) {
        self.clear();
        for s in history {
            let mtp = self.compute_mtp_for_new_time(s.time);
            self.push_sample(s.bits, mtp);
        }
    }

    /// Record `time` and return the median of the last [`MTP_SPAN`]
    /// timestamps including it. Even counts take the upper middle.
    pub fn compute_mtp_for_new_time(&mut self, time: i64) -> i64 {
        if self.recent_times.len() == MTP_SPAN {
            self.recent_times.pop_front();
        }
        self.recent_times.push_back(time);

        let mut sorted: Vec<i64> = self.recent_times.iter().copied().collect();
        sorted.sort_unstable();
        sorted[sorted.len() / 2]
    }

    pub fn push_sample(&mut self, bits: u32, mtp: i64) {
        let window = self.window();
        if self.recent_bits.len() == window {
            self.recent_bits.pop_front();
        }
        self.recent_bits.push_back(bits);

        if self.recent_mtp.len() == window + 1 {
            self.recent_mtp.pop_front();
        }
        self.recent_mtp.push_back(mtp);
    }

    /// Record an accepted header.
    pub fn accept(&mut self, bits: u32, time: i64) {
        let mtp = self.compute_mtp_for_new_time(time);
        self.push_sample(bits, mtp);
    }

    pub fn is_warmed_up(&self) -> bool {
        let window = self.window();
        self.recent_bits.len() >= window && self.recent_mtp.len() > window
    }

    /// Compact target the averaging window asks for next.
    pub fn expected_bits(&self) -> Option<u32> {
        if !self.is_warmed_up() {
            return None;
        }
        let total = self.recent_bits.iter().fold(U256::zero(), |acc, b| {
            acc.checked_add(decode_compact(*b).target)
                .unwrap_or(U256::MAX)
        });
        let avg = total / U256::from(self.window() as u64);
        let first_mtp = *self.recent_mtp.front()?;
        let last_mtp = *self.recent_mtp.back()?;
        Some(calculate_next_work_required_averaged(
            avg,
            last_mtp,
            first_mtp,
            &self.params,
        ))
    }

    /// Whether `next_bits` is an acceptable successor of `prev_bits` at
    /// `next_height`.
    pub fn permitted(
        &self,
        prev_bits: u32,
        next_bits: u32,
        next_time: i64,
        prev_time: i64,
        next_height: u64,
    ) -> bool {
        if !self.is_warmed_up() {
            return true;
        }

        // Peers may still follow the legacy rule right after the switch.
        let grace_end = self
            .params
            .new_pow_diff_height
            .saturating_add(self.window() as u64);
        if next_height <= grace_end {
            return true;
        }

        if self
            .params
            .min_difficulty_after(next_height.saturating_sub(1))
            && next_time > prev_time + self.params.pow_target_spacing * MIN_DIFFICULTY_GAP_SPACINGS
        {
            return next_bits == self.params.pow_limit_compact();
        }

        let Some(expected_bits) = self.expected_bits() else {
            return true;
        };
        let expected = decode_compact(expected_bits).target;
        let observed = decode_compact(next_bits).target;
        let slack = U256::from(WINDOW_TARGET_SLACK);
        let low = expected.checked_sub(slack).unwrap_or_else(U256::zero);
        let high = expected.checked_add(slack).unwrap_or(U256::MAX);

        if observed >= low && observed <= high {
            return true;
        }
        if permitted_difficulty_transition(&self.params, next_height, prev_bits, next_bits) {
            return true;
        }

        debug!(
            next_height,
            next_bits = format_args!("{:#010x}", next_bits),
            expected_bits = format_args!("{:#010x}", expected_bits),
            window = ?self.recent_bits,
            "window difficulty check failed"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::params_for;
    use bells_types::Network;

    const X: u32 = 0x1c03_fc00;

    fn mk_params(switch: u64) -> ConsensusParams {
        ConsensusParams {
            new_pow_diff_height: switch,
            ..params_for(Network::Testnet)
        }
    }

    fn mk_history(n: usize, bits: u32, step: i64) -> Vec<HeaderSample> {
        (0..n)
            .map(|i| HeaderSample {
                bits,
                time: 1_600_000_000 + i as i64 * step,
            })
            .collect()
    }

    #[test]
    fn mtp_matches_chain_definition() {
        let mut w = WindowRetargetChecker::new(mk_params(0));
        assert_eq!(w.compute_mtp_for_new_time(5), 5);
        // Even count takes the upper middle.
        assert_eq!(w.compute_mtp_for_new_time(1), 5);
        assert_eq!(w.compute_mtp_for_new_time(3), 3);

        let mut w = WindowRetargetChecker::new(mk_params(0));
        let mut last = 0;
        for t in 0..20 {
            last = w.compute_mtp_for_new_time(t * 10);
        }
        // Last 11 are 90..=190.
        assert_eq!(last, 140);
    }

    #[test]
    fn warms_up_after_window_plus_one() {
        let mut w = WindowRetargetChecker::new(mk_params(0));
        w.seed_from_history(&mk_history(17, X, 60));
        assert!(!w.is_warmed_up());
        assert_eq!(w.expected_bits(), None);
        assert!(w.permitted(X, 0x1e0f_ffff, 0, 0, 1_000));

        w.accept(X, 1_600_000_000 + 17 * 60);
        assert!(w.is_warmed_up());
    }

    #[test]
    fn steady_window_expects_same_bits() {
        let mut w = WindowRetargetChecker::new(mk_params(0));
        w.seed_from_history(&mk_history(30, X, 60));
        assert_eq!(w.expected_bits(), Some(X));
        assert!(w.permitted(X, X, 0, 0, 1_000));
        // Far easier, and not a legacy boundary.
        assert!(!w.permitted(X, 0x1d03_fc00, 0, 0, 1_001));
    }

    #[test]
    fn seeding_resets_previous_state() {
        let mut w = WindowRetargetChecker::new(mk_params(0));
        w.seed_from_history(&mk_history(30, 0x1d00_ffff, 600));
        w.seed_from_history(&mk_history(30, X, 60));
        assert_eq!(w.expected_bits(), Some(X));
    }

    #[test]
    fn grace_window_after_switch() {
        let mut w = WindowRetargetChecker::new(mk_params(500));
        w.seed_from_history(&mk_history(30, X, 60));
        assert!(w.permitted(X, 0x1d03_fc00, 0, 0, 517));
        assert!(!w.permitted(X, 0x1d03_fc00, 0, 0, 518));
    }

    #[test]
    fn slack_band_around_expected() {
        // Tiny targets so the slack is visible: 1020 exactly.
        let tiny = 0x0203_fc00;
        let mut w = WindowRetargetChecker::new(mk_params(0));
        w.seed_from_history(&mk_history(30, tiny, 60));
        assert_eq!(w.expected_bits(), Some(tiny));

        assert!(w.permitted(tiny, 0x0203_ff00, 0, 0, 1_001)); // 1023
        assert!(w.permitted(tiny, 0x0203_f800, 0, 0, 1_001)); // 1016
        assert!(!w.permitted(tiny, 0x0204_0100, 0, 0, 1_001)); // 1025
    }

    #[test]
    fn legacy_fallback_at_boundary() {
        let mut w = WindowRetargetChecker::new(mk_params(0));
        w.seed_from_history(&mk_history(30, X, 60));
        // Twice as easy is outside the band but inside the legacy bounds at
        // an interval boundary.
        assert!(w.permitted(X, 0x1c07_f800, 0, 0, 960));
        assert!(!w.permitted(X, 0x1c07_f800, 0, 0, 961));
    }

    #[test]
    fn min_difficulty_gap_requires_pow_limit() {
        let p = ConsensusParams {
            pow_allow_min_difficulty_blocks_after_height: Some(100),
            ..mk_params(0)
        };
        let limit = p.pow_limit_compact();
        let mut w = WindowRetargetChecker::new(p);
        w.seed_from_history(&mk_history(30, X, 60));

        assert!(w.permitted(X, limit, 1_000 + 361, 1_000, 200));
        assert!(!w.permitted(X, X, 1_000 + 361, 1_000, 200));
        // Gap not large enough: normal window rules.
        assert!(w.permitted(X, X, 1_000 + 360, 1_000, 200));
        // Rule not active yet below the configured height.
        assert!(w.permitted(X, X, 1_000 + 361, 1_000, 100));
    }

    #[test]
    fn deques_stay_bounded() {
        let mut w = WindowRetargetChecker::new(mk_params(0));
        for i in 0..100 {
            w.accept(X, i * 60);
        }
        assert_eq!(w.recent_bits.len(), 17);
        assert_eq!(w.recent_mtp.len(), 18);
        assert_eq!(w.recent_times.len(), MTP_SPAN);
    }
}
