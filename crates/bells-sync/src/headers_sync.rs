#![forbid(unsafe_code)]

//! Two pass headers download from a single untrusted peer.
//!
//! PRESYNC walks the peer's chain once, checking difficulty transitions and
//! keeping one keyed commitment bit per period, until the chain has enough
//! work. REDOWNLOAD fetches the same chain again, checks every stored bit,
//! and releases headers once enough of them have been verified behind.
//! Memory stays bounded by `max_commitments` bits plus the redownload buffer.

use std::collections::VecDeque;

use bells_chain::window::MTP_SPAN;
use bells_chain::{block_proof, header_id, ChainStart, WindowRetargetChecker};
use bells_crypto::{commitment_bit, COMMITMENT_KEY_LEN};
use bells_types::{BlockHeader, CompressedHeader, ConsensusParams, Hash256, U256};
use rand::{Rng, RngCore};
use thiserror::Error;
use tracing::{debug, info};

use crate::HeadersSyncConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    Presync,
    Redownload,
    Final,
}

/// Why a session ended early. Callers only see `success == false`; the
/// reason is kept for logs and tests.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SyncAbort {
    #[error("non-continuous headers at height {height}")]
    NonContinuousChain { height: u64 },

    #[error("invalid difficulty transition at height {height}")]
    InvalidDifficultyTransition { height: u64 },

    #[error("commitment overrun at height {height}")]
    CommitmentOverrun { height: u64 },

    #[error("commitment mismatch at height {height}")]
    CommitmentMismatch { height: u64 },

    #[error("incomplete headers message at height {height}")]
    IncompleteMessage { height: u64 },
}

pub type Result<T> = std::result::Result<T, SyncAbort>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessingResult {
    pub success: bool,
    pub request_more: bool,
    /// Verified headers, oldest first. Only meaningful when `success`.
    pub headers: Vec<BlockHeader>,
}

pub struct HeadersSyncState {
    config: HeadersSyncConfig,
    chain_start: ChainStart,
    minimum_required_work: U256,
    commit_offset: u64,
    commitment_key: [u8; COMMITMENT_KEY_LEN],
    max_commitments: u64,
    phase: SyncPhase,
    abort: Option<SyncAbort>,
    window: WindowRetargetChecker,

    header_commitments: VecDeque<bool>,
    current_chain_work: U256,
    current_height: u64,
    last_header_received: BlockHeader,
    last_header_id: Hash256,

    redownloaded_headers: VecDeque<CompressedHeader>,
    redownload_buffer_last_height: u64,
    redownload_buffer_last_hash: Hash256,
    redownload_buffer_first_prev_hash: Hash256,
    redownload_last_bits: u32,
    redownload_last_time: i64,
    redownload_chain_work: U256,
    process_all_remaining_headers: bool,
}

impl HeadersSyncState {
    /// Ancestors a [`ChainStart`] should carry so the difficulty window is
    /// warm from the first header.
    pub fn chain_start_history_len(params: &ConsensusParams) -> usize {
        params.pow_averaging_window as usize + 1 + MTP_SPAN
    }

    /// Start a session above `chain_start`. `now` is the local clock in
    /// seconds; `rng` picks the commitment offset and key.
    pub fn new<R: RngCore>(
        chain_start: ChainStart,
        minimum_required_work: U256,
        params: ConsensusParams,
        config: HeadersSyncConfig,
        now: i64,
        rng: &mut R,
    ) -> Self {
        let period = config.commitment_period.max(1);
        let commit_offset = rng.gen_range(0..period);
        let mut commitment_key = [0u8; COMMITMENT_KEY_LEN];
        rng.fill_bytes(&mut commitment_key);

        // At most 6 blocks per second fit under the MTP rule, from the start
        // MTP up to the furthest acceptable future timestamp.
        let seconds = now
            .saturating_sub(chain_start.median_time_past)
            .saturating_add(config.max_future_block_time)
            .max(0) as u64;
        let max_commitments = seconds.saturating_mul(6) / period;

        let mut window = WindowRetargetChecker::new(params);
        window.seed_from_history(&chain_start.history);

        info!(
            height = chain_start.height.0,
            max_commitments,
            min_work = %minimum_required_work,
            "initial headers sync started"
        );

        Self {
            config: HeadersSyncConfig {
                commitment_period: period,
                ..config
            },
            minimum_required_work,
            commit_offset,
            commitment_key,
            max_commitments,
            phase: SyncPhase::Presync,
            abort: None,
            window,
            header_commitments: VecDeque::new(),
            current_chain_work: chain_start.chain_work,
            current_height: chain_start.height.0,
            last_header_received: chain_start.header.clone(),
            last_header_id: chain_start.id,
            redownloaded_headers: VecDeque::new(),
            redownload_buffer_last_height: 0,
            redownload_buffer_last_hash: Hash256::zero(),
            redownload_buffer_first_prev_hash: Hash256::zero(),
            redownload_last_bits: 0,
            redownload_last_time: 0,
            redownload_chain_work: U256::zero(),
            process_all_remaining_headers: false,
            chain_start,
        }
    }

    pub fn state(&self) -> SyncPhase {
        self.phase
    }

    pub fn abort_reason(&self) -> Option<SyncAbort> {
        self.abort
    }

    pub fn presync_height(&self) -> u64 {
        self.current_height
    }

    pub fn presync_chain_work(&self) -> U256 {
        self.current_chain_work
    }

    pub fn redownload_height(&self) -> u64 {
        self.redownload_buffer_last_height
    }

    pub fn redownload_chain_work(&self) -> U256 {
        self.redownload_chain_work
    }

    pub fn max_commitments(&self) -> u64 {
        self.max_commitments
    }

    pub fn commitment_offset(&self) -> u64 {
        self.commit_offset
    }

    pub fn commitments_len(&self) -> usize {
        self.header_commitments.len()
    }

    pub fn redownload_buffer_len(&self) -> usize {
        self.redownloaded_headers.len()
    }

    /// Entries held across all session buffers, chain start snapshot included.
    pub fn retained_len(&self) -> usize {
        self.header_commitments.len()
            + self.redownloaded_headers.len()
            + self.chain_start.history.len()
            + self.chain_start.locator.len()
    }

    /// Session keyed commitment bit for a header id.
    pub fn commitment(&self, id: &Hash256) -> bool {
        commitment_bit(&self.commitment_key, id)
    }

    fn is_commitment_height(&self, height: u64) -> bool {
        height % self.config.commitment_period == self.commit_offset
    }

    /// Feed one headers message. `full_headers_message` tells whether the
    /// peer filled the message and may have more.
    ///
    /// Empty input or a finished session is refused without changing state.
    /// Any failure, and any success that needs no more headers, finishes the
    /// session.
    pub fn process_next_headers(
        &mut self,
        headers: &[BlockHeader],
        full_headers_message: bool,
    ) -> ProcessingResult {
        let mut ret = ProcessingResult::default();
        if headers.is_empty() {
            debug!(phase = ?self.phase, "empty headers batch ignored");
            return ret;
        }

        match self.phase {
            SyncPhase::Final => {
                debug!("headers batch for finished sync ignored");
                return ret;
            }
            SyncPhase::Presync => match self.validate_and_store_headers_commitments(headers) {
                Ok(()) => {
                    ret.success = true;
                    if full_headers_message || self.phase == SyncPhase::Redownload {
                        ret.request_more = true;
                    } else {
                        // The peer's chain ended short of the work threshold.
                        self.record_abort(SyncAbort::IncompleteMessage {
                            height: self.current_height,
                        });
                    }
                }
                Err(e) => self.record_abort(e),
            },
            SyncPhase::Redownload => {
                match self.validate_and_store_redownloaded_headers(headers) {
                    Ok(ready) => {
                        ret.success = true;
                        ret.headers = ready;
                        if self.redownloaded_headers.is_empty()
                            && self.process_all_remaining_headers
                        {
                            info!(
                                height = self.redownload_buffer_last_height,
                                "initial headers sync complete"
                            );
                        } else if full_headers_message {
                            ret.request_more = true;
                        } else {
                            // High work chain, but the peer stopped serving it.
                            self.record_abort(SyncAbort::IncompleteMessage {
                                height: self.redownload_buffer_last_height,
                            });
                        }
                    }
                    Err(e) => self.record_abort(e),
                }
            }
        }

        if !(ret.success && ret.request_more) {
            self.finalize();
        }
        ret
    }

    /// Locator for the next `getheaders`: where this session left off,
    /// followed by the chain start's locator.
    pub fn next_headers_request_locator(&self) -> Vec<Hash256> {
        let resume = match self.phase {
            SyncPhase::Final => return Vec::new(),
            SyncPhase::Presync => self.last_header_id,
            SyncPhase::Redownload => self.redownload_buffer_last_hash,
        };
        let mut locator = Vec::with_capacity(self.chain_start.locator.len() + 1);
        locator.push(resume);
        locator.extend_from_slice(&self.chain_start.locator);
        locator
    }

    fn record_abort(&mut self, reason: SyncAbort) {
        debug!(phase = ?self.phase, %reason, "initial headers sync aborted");
        self.abort = Some(reason);
    }

    fn finalize(&mut self) {
        self.header_commitments = VecDeque::new();
        self.last_header_received = BlockHeader::default();
        self.last_header_id = Hash256::zero();
        self.redownloaded_headers = VecDeque::new();
        self.redownload_buffer_last_hash = Hash256::zero();
        self.redownload_buffer_first_prev_hash = Hash256::zero();
        self.process_all_remaining_headers = false;
        self.current_height = 0;
        self.window.clear();
        self.chain_start.history = Vec::new();
        self.chain_start.locator = Vec::new();
        self.phase = SyncPhase::Final;
    }

    fn validate_and_store_headers_commitments(&mut self, headers: &[BlockHeader]) -> Result<()> {
        for h in headers {
            self.validate_and_process_single_header(h)?;
        }

        if self.current_chain_work >= self.minimum_required_work {
            self.redownloaded_headers.clear();
            self.redownload_buffer_last_height = self.chain_start.height.0;
            self.redownload_buffer_first_prev_hash = self.chain_start.id;
            self.redownload_buffer_last_hash = self.chain_start.id;
            self.redownload_last_bits = self.chain_start.header.bits;
            self.redownload_last_time = self.chain_start.header.block_time();
            self.redownload_chain_work = self.chain_start.chain_work;
            // Same window as presync started from.
            self.window.seed_from_history(&self.chain_start.history);
            self.phase = SyncPhase::Redownload;
            info!(
                height = self.current_height,
                redownload_from = self.redownload_buffer_last_height,
                "initial headers sync reached sufficient work"
            );
        }
        Ok(())
    }

    fn validate_and_process_single_header(&mut self, header: &BlockHeader) -> Result<()> {
        let next_height = self.current_height + 1;

        if header.prev_hash != self.last_header_id {
            return Err(SyncAbort::NonContinuousChain {
                height: next_height,
            });
        }

        // Compressing work into few blocks would let a weak attacker reach
        // the threshold cheaply, so transitions are bounded here too.
        if !self.window.permitted(
            self.last_header_received.bits,
            header.bits,
            header.block_time(),
            self.last_header_received.block_time(),
            next_height,
        ) {
            return Err(SyncAbort::InvalidDifficultyTransition {
                height: next_height,
            });
        }

        let id = header_id(header);
        if self.is_commitment_height(next_height) {
            if self.header_commitments.len() as u64 >= self.max_commitments {
                return Err(SyncAbort::CommitmentOverrun {
                    height: next_height,
                });
            }
            self.header_commitments.push_back(self.commitment(&id));
        }

        self.current_chain_work = self
            .current_chain_work
            .checked_add(block_proof(header.bits))
            .unwrap_or(U256::MAX);
        self.last_header_received = header.clone();
        self.last_header_id = id;
        self.current_height = next_height;
        self.window.accept(header.bits, header.block_time());
        Ok(())
    }

    fn validate_and_store_redownloaded_headers(
        &mut self,
        headers: &[BlockHeader],
    ) -> Result<Vec<BlockHeader>> {
        let mut ready = Vec::new();
        for h in headers {
            self.validate_and_store_redownloaded_header(h)?;
            self.pop_headers_ready_for_acceptance(&mut ready);
        }
        Ok(ready)
    }

    fn validate_and_store_redownloaded_header(&mut self, header: &BlockHeader) -> Result<()> {
        let next_height = self.redownload_buffer_last_height + 1;

        if header.prev_hash != self.redownload_buffer_last_hash {
            return Err(SyncAbort::NonContinuousChain {
                height: next_height,
            });
        }

        if !self.window.permitted(
            self.redownload_last_bits,
            header.bits,
            header.block_time(),
            self.redownload_last_time,
            next_height,
        ) {
            return Err(SyncAbort::InvalidDifficultyTransition {
                height: next_height,
            });
        }

        self.redownload_chain_work = self
            .redownload_chain_work
            .checked_add(block_proof(header.bits))
            .unwrap_or(U256::MAX);
        if self.redownload_chain_work >= self.minimum_required_work {
            self.process_all_remaining_headers = true;
        }

        let id = header_id(header);
        // Past the target the peer may have extended its chain; those
        // headers were never committed to.
        if !self.process_all_remaining_headers && self.is_commitment_height(next_height) {
            let expected = self
                .header_commitments
                .pop_front()
                .ok_or(SyncAbort::CommitmentOverrun {
                    height: next_height,
                })?;
            if self.commitment(&id) != expected {
                return Err(SyncAbort::CommitmentMismatch {
                    height: next_height,
                });
            }
        }

        self.redownloaded_headers.push_back(header.compress());
        self.redownload_buffer_last_height = next_height;
        self.redownload_buffer_last_hash = id;
        self.redownload_last_bits = header.bits;
        self.redownload_last_time = header.block_time();
        self.window.accept(header.bits, header.block_time());
        Ok(())
    }

    fn pop_headers_ready_for_acceptance(&mut self, out: &mut Vec<BlockHeader>) {
        while self.redownloaded_headers.len() > self.config.redownload_buffer_size
            || (!self.redownloaded_headers.is_empty() && self.process_all_remaining_headers)
        {
            let Some(compressed) = self.redownloaded_headers.pop_front() else {
                break;
            };
            let full = compressed.into_full(self.redownload_buffer_first_prev_hash);
            self.redownload_buffer_first_prev_hash = header_id(&full);
            out.push(full);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bells_chain::params_for;
    use bells_types::{Height, Network};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn mk_start(mtp: i64) -> ChainStart {
        let header = BlockHeader {
            version: 1,
            time: mtp as u32,
            bits: 0x200f_0f0f,
            ..BlockHeader::default()
        };
        ChainStart {
            id: header_id(&header),
            chain_work: block_proof(header.bits),
            history: vec![bells_chain::HeaderSample {
                bits: header.bits,
                time: header.block_time(),
            }],
            locator: vec![header_id(&header)],
            header,
            height: Height(0),
            median_time_past: mtp,
        }
    }

    fn mk_session(now: i64, config: HeadersSyncConfig) -> HeadersSyncState {
        let mut rng = StdRng::seed_from_u64(1);
        HeadersSyncState::new(
            mk_start(1_000_000),
            U256::from(1_000u64),
            params_for(Network::Regtest),
            config,
            now,
            &mut rng,
        )
    }

    #[test]
    fn max_commitments_bound() {
        let s = mk_session(1_000_000, HeadersSyncConfig::default());
        // 6 * 7200 / 600
        assert_eq!(s.max_commitments(), 72);

        let s = mk_session(1_000_000 + 600, HeadersSyncConfig::default());
        assert_eq!(s.max_commitments(), 78);

        // A start far in the future of the local clock allows nothing.
        let s = mk_session(0, HeadersSyncConfig::default());
        assert_eq!(s.max_commitments(), 0);
    }

    #[test]
    fn offset_is_within_period() {
        for seed in 0..50u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let cfg = HeadersSyncConfig {
                commitment_period: 7,
                ..HeadersSyncConfig::default()
            };
            let s = HeadersSyncState::new(
                mk_start(1_000_000),
                U256::one(),
                params_for(Network::Regtest),
                cfg,
                1_000_000,
                &mut rng,
            );
            assert!(s.commitment_offset() < 7);
        }
    }

    #[test]
    fn sessions_with_same_seed_commit_identically() {
        let a = mk_session(1_000_000, HeadersSyncConfig::default());
        let b = mk_session(1_000_000, HeadersSyncConfig::default());
        let ids: Vec<Hash256> = (0u8..32).map(|i| Hash256([i; 32])).collect();
        for id in &ids {
            assert_eq!(a.commitment(id), b.commitment(id));
        }
        assert_eq!(a.commitment_offset(), b.commitment_offset());
    }

    #[test]
    fn zero_period_is_treated_as_one() {
        let s = mk_session(
            1_000_000,
            HeadersSyncConfig {
                commitment_period: 0,
                ..HeadersSyncConfig::default()
            },
        );
        assert_eq!(s.commitment_offset(), 0);
        assert!(s.is_commitment_height(17));
    }
}
