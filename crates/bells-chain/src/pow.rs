#![forbid(unsafe_code)]

use bells_types::arith::u256_from_hash_le;
use bells_crypto::{pow_hash, PowHashError};
use bells_types::{decode_compact, BlockHeader, ConsensusParams, Hash256, U256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PowError {
    #[error("compact target {bits:#010x} is negative, zero or overflows")]
    InvalidTarget { bits: u32 },

    #[error("compact target {bits:#010x} is easier than pow_limit")]
    TargetAboveLimit { bits: u32 },

    #[error("pow hash {hash:?} does not meet target {bits:#010x}")]
    HashAboveTarget { hash: Hash256, bits: u32 },

    #[error(transparent)]
    Hash(#[from] PowHashError),

    #[error("header {index} in batch fails proof of work: {source}")]
    BatchHeader {
        index: usize,
        #[source]
        source: Box<PowError>,
    },

    #[error("retarget needs history back to height {height}")]
    InsufficientHistory { height: u64 },
}

pub type Result<T> = std::result::Result<T, PowError>;

/// Expected number of hashes to find a block at `bits`:
/// `2^256 / (target + 1)`, computed as `!target / (target + 1) + 1`.
pub fn block_proof(bits: u32) -> U256 {
    let t = decode_compact(bits);
    if !t.is_valid() {
        return U256::zero();
    }
    // `!target / (target + 1)` never overflows; target + 1 can only wrap
    // for U256::MAX, which no 23 bit mantissa reaches.
    match t.target.checked_add(U256::one()) {
        Some(d) => (!t.target / d) + U256::one(),
        None => U256::one(),
    }
}

/// Checks an already computed PoW hash (scrypt, see `bells_crypto::pow_hash`)
/// against `bits`. Block identity plays no part here.
pub fn check_proof_of_work(hash: &Hash256, bits: u32, params: &ConsensusParams) -> Result<()> {
    let t = decode_compact(bits);
    if !t.is_valid() {
        return Err(PowError::InvalidTarget { bits });
    }
    if t.target > params.pow_limit {
        return Err(PowError::TargetAboveLimit { bits });
    }
    if u256_from_hash_le(&hash.0) > t.target {
        return Err(PowError::HashAboveTarget { hash: *hash, bits });
    }
    Ok(())
}

pub fn check_header_pow(header: &BlockHeader, params: &ConsensusParams) -> Result<()> {
    check_proof_of_work(&pow_hash(header)?, header.bits, params)
}

/// Context free proof-of-work check over a batch of peer headers.
pub fn check_headers_pow(headers: &[BlockHeader], params: &ConsensusParams) -> Result<()> {
    for (index, h) in headers.iter().enumerate() {
        check_header_pow(h, params).map_err(|e| PowError::BatchHeader {
            index,
            source: Box::new(e),
        })?;
    }
    Ok(())
}
