#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod arith;
pub mod params;

pub use arith::{decode_compact, encode_compact, CompactTarget, U256};
pub use params::{ConsensusParams, LegacyEra, Network};

pub const HASH256_LEN: usize = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash256(pub [u8; HASH256_LEN]);

impl Hash256 {
    pub fn zero() -> Self {
        Self([0u8; HASH256_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Height(pub u64);

impl Height {
    pub fn next(self) -> Self {
        Height(self.0.saturating_add(1))
    }
}

const VERSION_AUXPOW: i32 = 1 << 8;
const VERSION_START_BIT: u32 = 16;
const VERSION_CHAIN_START: i32 = 1 << 16;
const VERSION_AUXPOW_TOP_MASK: i32 = (1 << 28) + (1 << 29) + (1 << 30);
const MASK_AUXPOW_CHAIN_ID_SHIFTED: i32 = 0x001f << VERSION_START_BIT;

/// Chain id carried in the version field of merge-mined headers.
pub const AUXPOW_CHAIN_ID: i32 = 16;
const VERSION_AUXPOW_CHAIN_ID_SHIFTED: i32 = AUXPOW_CHAIN_ID << VERSION_START_BIT;

/// Block header as relayed by peers. Identity is the hash of its canonical
/// encoding, see `bells_crypto::hash_header`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn block_time(&self) -> i64 {
        i64::from(self.time)
    }

    /// Version without the auxpow flag and chain id.
    pub fn base_version(&self) -> i32 {
        (self.version & !VERSION_AUXPOW) & !VERSION_AUXPOW_CHAIN_ID_SHIFTED
    }

    pub fn chain_id(&self) -> i32 {
        if self.version & VERSION_AUXPOW != 0 {
            (self.version & MASK_AUXPOW_CHAIN_ID_SHIFTED) >> VERSION_START_BIT
        } else {
            0
        }
    }

    pub fn is_auxpow(&self) -> bool {
        self.version & VERSION_AUXPOW != 0
    }

    pub fn is_legacy(&self) -> bool {
        self.version == 1
    }

    pub fn is_valid_base_version(base_version: i32) -> bool {
        (base_version & !VERSION_AUXPOW_TOP_MASK) < VERSION_CHAIN_START
    }

    pub fn compress(&self) -> CompressedHeader {
        CompressedHeader {
            version: self.version,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }
}

/// Header with `prev_hash` stripped. Buffers of linked headers only need to
/// remember the parent hash of the first entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressedHeader {
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl CompressedHeader {
    pub fn into_full(self, prev_hash: Hash256) -> BlockHeader {
        BlockHeader {
            version: self.version,
            prev_hash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }
}

pub mod canonical {
    use super::{BlockHeader, Hash256, HASH256_LEN};

    /// version(4) + prev(32) + merkle(32) + time(4) + bits(4) + nonce(4)
    pub const BLOCK_HEADER_LEN: usize = 80;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum CanonicalError {
        UnexpectedEof { at: usize, needed: usize, remaining: usize },
        TrailingBytes { at: usize, remaining: usize },
    }

    impl core::fmt::Display for CanonicalError {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            match self {
                CanonicalError::UnexpectedEof { at, needed, remaining } => write!(
                    f,
                    "unexpected eof at {} (needed {}, remaining {})",
                    at, needed, remaining
                ),
                CanonicalError::TrailingBytes { at, remaining } => {
                    write!(f, "{} trailing bytes at {}", remaining, at)
                }
            }
        }
    }

    impl std::error::Error for CanonicalError {}

    type Result<T> = core::result::Result<T, CanonicalError>;

    struct Cursor<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Cursor<'a> {
        fn new(buf: &'a [u8]) -> Self {
            Self { buf, pos: 0 }
        }

        fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.pos)
        }

        fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let rem = self.remaining();
            if rem < n {
                return Err(CanonicalError::UnexpectedEof {
                    at: self.pos,
                    needed: n,
                    remaining: rem,
                });
            }
            let out = &self.buf[self.pos..self.pos + n];
            self.pos += n;
            Ok(out)
        }

        fn take_u32_le(&mut self) -> Result<u32> {
            let b = self.take(4)?;
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }

        fn take_i32_le(&mut self) -> Result<i32> {
            let b = self.take(4)?;
            Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }

        fn take_hash256(&mut self) -> Result<Hash256> {
            let b = self.take(HASH256_LEN)?;
            let mut out = [0u8; HASH256_LEN];
            out.copy_from_slice(b);
            Ok(Hash256(out))
        }

        fn finish(&self) -> Result<()> {
            let rem = self.remaining();
            if rem != 0 {
                return Err(CanonicalError::TrailingBytes {
                    at: self.pos,
                    remaining: rem,
                });
            }
            Ok(())
        }
    }

    pub fn encode_block_header(h: &BlockHeader) -> [u8; BLOCK_HEADER_LEN] {
        let mut out = [0u8; BLOCK_HEADER_LEN];
        out[0..4].copy_from_slice(&h.version.to_le_bytes());
        out[4..36].copy_from_slice(&h.prev_hash.0);
        out[36..68].copy_from_slice(&h.merkle_root.0);
        out[68..72].copy_from_slice(&h.time.to_le_bytes());
        out[72..76].copy_from_slice(&h.bits.to_le_bytes());
        out[76..80].copy_from_slice(&h.nonce.to_le_bytes());
        out
    }

    pub fn decode_block_header(bytes: &[u8]) -> Result<BlockHeader> {
        let mut c = Cursor::new(bytes);
        let version = c.take_i32_le()?;
        let prev_hash = c.take_hash256()?;
        let merkle_root = c.take_hash256()?;
        let time = c.take_u32_le()?;
        let bits = c.take_u32_le()?;
        let nonce = c.take_u32_le()?;
        c.finish()?;
        Ok(BlockHeader {
            version,
            prev_hash,
            merkle_root,
            time,
            bits,
            nonce,
        })
    }

}
