#![forbid(unsafe_code)]

use std::collections::HashMap;

use bells_types::{BlockHeader, ConsensusParams, Hash256, Height, U256};
use thiserror::Error;

use crate::pow::{block_proof, check_header_pow, PowError};
use crate::retarget::{next_work_required, RetargetSample};
use crate::window::{HeaderSample, MTP_SPAN};
use crate::header_id;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("genesis already inserted")]
    GenesisExists,

    #[error("genesis header must have a zero prev_hash")]
    GenesisHasParent,

    #[error("header {id:?} already indexed")]
    AlreadyKnown { id: Hash256 },

    #[error("parent {parent:?} not indexed")]
    UnknownParent { parent: Hash256 },

    #[error("header {id:?} not indexed")]
    UnknownHeader { id: Hash256 },

    #[error("bits {got:#010x} at height {height:?}, expected {expected:#010x}")]
    BadDifficulty {
        height: Height,
        expected: u32,
        got: u32,
    },

    #[error("time {time} at height {height:?} not after median time past {mtp}")]
    TimeTooOld { height: Height, time: i64, mtp: i64 },

    #[error("pow error: {0}")]
    Pow(#[from] PowError),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Header plus the values derived from its ancestry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainIndexEntry {
    pub id: Hash256,
    pub header: BlockHeader,
    pub height: Height,
    pub chain_work: U256,
    pub median_time_past: i64,
    parent: Option<usize>,
}

impl ChainIndexEntry {
    pub fn retarget_sample(&self) -> RetargetSample {
        RetargetSample {
            height: self.height.0,
            time: self.header.block_time(),
            bits: self.header.bits,
            median_time_past: self.median_time_past,
        }
    }

    pub fn header_sample(&self) -> HeaderSample {
        HeaderSample {
            bits: self.header.bits,
            time: self.header.block_time(),
        }
    }
}

/// Read-only snapshot of a chain entry handed to a headers sync session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainStart {
    pub id: Hash256,
    pub header: BlockHeader,
    pub height: Height,
    pub chain_work: U256,
    pub median_time_past: i64,
    /// Ancestor `(bits, time)` ending at this entry, oldest first.
    pub history: Vec<HeaderSample>,
    /// Block locator starting at this entry.
    pub locator: Vec<Hash256>,
}

/// In-memory header tree. Entries are never removed; parents are indices
/// into the arena.
#[derive(Clone, Debug, Default)]
pub struct ChainIndex {
    entries: Vec<ChainIndexEntry>,
    by_id: HashMap<Hash256, usize>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert_genesis(&mut self, header: BlockHeader) -> Result<Hash256> {
        if !self.entries.is_empty() {
            return Err(IndexError::GenesisExists);
        }
        if !header.prev_hash.is_zero() {
            return Err(IndexError::GenesisHasParent);
        }
        let id = header_id(&header);
        let entry = ChainIndexEntry {
            id,
            chain_work: block_proof(header.bits),
            median_time_past: header.block_time(),
            height: Height(0),
            header,
            parent: None,
        };
        self.by_id.insert(id, 0);
        self.entries.push(entry);
        Ok(id)
    }

    /// Link `header` under its parent. No consensus checks.
    pub fn insert_header(&mut self, header: BlockHeader) -> Result<Hash256> {
        let id = header_id(&header);
        if self.by_id.contains_key(&id) {
            return Err(IndexError::AlreadyKnown { id });
        }
        let parent_idx = *self
            .by_id
            .get(&header.prev_hash)
            .ok_or(IndexError::UnknownParent {
                parent: header.prev_hash,
            })?;
        let parent = &self.entries[parent_idx];

        let mut times: Vec<i64> = Vec::with_capacity(MTP_SPAN);
        times.push(header.block_time());
        times.extend(
            self.walk(parent_idx)
                .take(MTP_SPAN - 1)
                .map(|e| e.header.block_time()),
        );
        times.sort_unstable();

        let entry = ChainIndexEntry {
            id,
            height: parent.height.next(),
            chain_work: parent
                .chain_work
                .checked_add(block_proof(header.bits))
                .unwrap_or(U256::MAX),
            median_time_past: times[times.len() / 2],
            header,
            parent: Some(parent_idx),
        };
        let idx = self.entries.len();
        self.by_id.insert(id, idx);
        self.entries.push(entry);
        Ok(id)
    }

    /// Insert after checking time, difficulty and proof of work against the
    /// parent's ancestry.
    pub fn accept_header(&mut self, header: BlockHeader, params: &ConsensusParams) -> Result<Hash256> {
        let parent = self
            .get(&header.prev_hash)
            .ok_or(IndexError::UnknownParent {
                parent: header.prev_hash,
            })?;
        let height = parent.height.next();
        if header.block_time() <= parent.median_time_past {
            return Err(IndexError::TimeTooOld {
                height,
                time: header.block_time(),
                mtp: parent.median_time_past,
            });
        }
        let expected = self.next_work_required_for(&header.prev_hash, header.block_time(), params)?;
        if header.bits != expected {
            return Err(IndexError::BadDifficulty {
                height,
                expected,
                got: header.bits,
            });
        }
        check_header_pow(&header, params)?;
        self.insert_header(header)
    }

    pub fn get(&self, id: &Hash256) -> Option<&ChainIndexEntry> {
        self.by_id.get(id).map(|i| &self.entries[*i])
    }

    pub fn genesis(&self) -> Option<&ChainIndexEntry> {
        self.entries.first()
    }

    /// Entry with the most chain work; ties keep the earliest inserted.
    pub fn tip(&self) -> Option<&ChainIndexEntry> {
        self.entries
            .iter()
            .reduce(|best, e| if e.chain_work > best.chain_work { e } else { best })
    }

    pub fn parent(&self, entry: &ChainIndexEntry) -> Option<&ChainIndexEntry> {
        entry.parent.map(|i| &self.entries[i])
    }

    fn walk(&self, start: usize) -> impl Iterator<Item = &ChainIndexEntry> + '_ {
        let mut next = Some(start);
        std::iter::from_fn(move || {
            let e = &self.entries[next?];
            next = e.parent;
            Some(e)
        })
    }

    /// `id` followed by its ancestors, newest first.
    pub fn ancestors(&self, id: &Hash256) -> impl Iterator<Item = &ChainIndexEntry> + '_ {
        let start = self.by_id.get(id).copied();
        let mut inner = start.map(|s| self.walk(s));
        std::iter::from_fn(move || inner.as_mut()?.next())
    }

    pub fn ancestor(&self, id: &Hash256, height: Height) -> Option<&ChainIndexEntry> {
        let entry = self.get(id)?;
        if height > entry.height {
            return None;
        }
        self.ancestors(id).find(|e| e.height == height)
    }

    pub fn median_time_past(&self, id: &Hash256) -> Option<i64> {
        self.get(id).map(|e| e.median_time_past)
    }

    /// Hashes stepping back 1 at a time for ten entries, then doubling,
    /// always ending at genesis.
    pub fn locator(&self, id: &Hash256) -> Vec<Hash256> {
        let mut out = Vec::with_capacity(32);
        let mut step = 1u64;
        let mut cur = self.get(id);
        while let Some(e) = cur {
            out.push(e.id);
            if e.height.0 == 0 {
                break;
            }
            let h = Height(e.height.0.saturating_sub(step));
            cur = self.ancestors(&e.id).find(|a| a.height == h);
            if out.len() > 10 {
                step = step.saturating_mul(2);
            }
        }
        out
    }

    /// Up to `count` entries ending at `id`, oldest first.
    pub fn retarget_samples(&self, id: &Hash256, count: usize) -> Vec<RetargetSample> {
        let mut out: Vec<RetargetSample> = self
            .ancestors(id)
            .take(count)
            .map(ChainIndexEntry::retarget_sample)
            .collect();
        out.reverse();
        out
    }

    /// Required bits for a child of `prev` stamped `new_time`.
    pub fn next_work_required_for(
        &self,
        prev: &Hash256,
        new_time: i64,
        params: &ConsensusParams,
    ) -> Result<u32> {
        if self.get(prev).is_none() {
            return Err(IndexError::UnknownHeader { id: *prev });
        }
        let legacy = params.difficulty_adjustment_interval() as usize + 1;
        let window = params.pow_averaging_window as usize + 1;
        let samples = self.retarget_samples(prev, legacy.max(window));
        Ok(next_work_required(&samples, new_time, params)?)
    }

    /// Snapshot of `id` with `history_len` ancestors for window seeding.
    pub fn chain_start(&self, id: &Hash256, history_len: usize) -> Option<ChainStart> {
        let e = self.get(id)?;
        let mut history: Vec<HeaderSample> = self
            .ancestors(id)
            .take(history_len)
            .map(ChainIndexEntry::header_sample)
            .collect();
        history.reverse();
        Some(ChainStart {
            id: e.id,
            header: e.header.clone(),
            height: e.height,
            chain_work: e.chain_work,
            median_time_past: e.median_time_past,
            history,
            locator: self.locator(id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::params_for;
    use bells_types::Network;

    fn mk_header(prev: Hash256, time: u32, bits: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_hash: prev,
            merkle_root: Hash256::zero(),
            time,
            bits,
            nonce,
        }
    }

    fn mk_chain(n: u32) -> (ChainIndex, Vec<Hash256>) {
        let mut idx = ChainIndex::new();
        let g = idx
            .insert_genesis(mk_header(Hash256::zero(), 1_000, 0x207f_ffff, 0))
            .unwrap();
        let mut ids = vec![g];
        for i in 1..=n {
            let prev = *ids.last().unwrap();
            let id = idx
                .insert_header(mk_header(prev, 1_000 + i * 60, 0x207f_ffff, i))
                .unwrap();
            ids.push(id);
        }
        (idx, ids)
    }

    #[test]
    fn heights_and_chain_work_accumulate() {
        let (idx, ids) = mk_chain(5);
        let tip = idx.get(&ids[5]).unwrap();
        assert_eq!(tip.height, Height(5));
        assert_eq!(tip.chain_work, U256::from(12u64));
        assert_eq!(idx.tip().unwrap().id, ids[5]);
        assert_eq!(idx.parent(tip).unwrap().id, ids[4]);
        assert_eq!(idx.len(), 6);
    }

    #[test]
    fn reject_bad_links() {
        let (mut idx, ids) = mk_chain(1);
        assert_eq!(
            idx.insert_genesis(mk_header(Hash256::zero(), 1, 0x207f_ffff, 9)),
            Err(IndexError::GenesisExists)
        );
        let orphan = mk_header(Hash256([9u8; 32]), 5_000, 0x207f_ffff, 0);
        assert!(matches!(
            idx.insert_header(orphan),
            Err(IndexError::UnknownParent { .. })
        ));
        let dup = idx.get(&ids[1]).unwrap().header.clone();
        assert!(matches!(
            idx.insert_header(dup),
            Err(IndexError::AlreadyKnown { .. })
        ));
    }

    #[test]
    fn median_time_past_uses_last_eleven() {
        let (idx, ids) = mk_chain(20);
        // Genesis alone.
        assert_eq!(idx.median_time_past(&ids[0]), Some(1_000));
        // Heights 0..=3 at even count takes the upper middle: height 2.
        assert_eq!(idx.median_time_past(&ids[3]), Some(1_120));
        // Heights 10..=20, median is height 15.
        assert_eq!(idx.median_time_past(&ids[20]), Some(1_900));
    }

    #[test]
    fn ancestor_lookup() {
        let (idx, ids) = mk_chain(12);
        assert_eq!(idx.ancestor(&ids[12], Height(4)).unwrap().id, ids[4]);
        assert!(idx.ancestor(&ids[4], Height(5)).is_none());
        assert_eq!(idx.ancestors(&ids[3]).count(), 4);
        assert_eq!(idx.ancestors(&Hash256([1u8; 32])).count(), 0);
    }

    #[test]
    fn locator_steps_then_doubles() {
        let (idx, ids) = mk_chain(100);
        let loc = idx.locator(&ids[100]);
        let heights: Vec<u64> = loc
            .iter()
            .map(|id| idx.get(id).unwrap().height.0)
            .collect();
        assert_eq!(
            heights,
            vec![100, 99, 98, 97, 96, 95, 94, 93, 92, 91, 90, 89, 87, 83, 75, 59, 27, 0]
        );
        assert_eq!(idx.locator(&ids[0]), vec![ids[0]]);
    }

    #[test]
    fn chain_start_snapshot() {
        let (idx, ids) = mk_chain(40);
        let start = idx.chain_start(&ids[40], 29).unwrap();
        assert_eq!(start.height, Height(40));
        assert_eq!(start.history.len(), 29);
        assert_eq!(start.history.last().unwrap().time, 1_000 + 40 * 60);
        assert_eq!(start.history[0].time, 1_000 + 12 * 60);
        assert_eq!(start.locator[0], ids[40]);

        let short = idx.chain_start(&ids[3], 29).unwrap();
        assert_eq!(short.history.len(), 4);
    }

    #[test]
    fn accept_header_enforces_retarget() {
        let p = ConsensusParams {
            pow_allow_min_difficulty_blocks: false,
            pow_no_retargeting: false,
            ..params_for(Network::Regtest)
        };
        let limit = p.pow_limit_compact();
        let mut idx = ChainIndex::new();
        let mut prev = idx
            .insert_genesis(mk_header(Hash256::zero(), 1_000, limit, 0))
            .unwrap();

        let mut time = 1_000u32;
        for _ in 0..25 {
            time += 60;
            let bits = idx.next_work_required_for(&prev, i64::from(time), &p).unwrap();
            let mut h = mk_header(prev, time, bits, 0);
            while check_header_pow(&h, &p).is_err() {
                h.nonce += 1;
            }
            prev = idx.accept_header(h, &p).unwrap();
        }
        assert_eq!(idx.get(&prev).unwrap().height, Height(25));

        let bad = mk_header(prev, time + 60, 0x1d00_ffff, 0);
        assert!(matches!(
            idx.accept_header(bad, &p),
            Err(IndexError::BadDifficulty { .. })
        ));

        let stale = mk_header(prev, 1_000, limit, 0);
        assert!(matches!(
            idx.accept_header(stale, &p),
            Err(IndexError::TimeTooOld { .. })
        ));
    }
}
