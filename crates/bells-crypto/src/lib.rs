#![forbid(unsafe_code)]

use blake3::Hasher;
use bells_types::{canonical, BlockHeader, Hash256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PowHashError {
    #[error("invalid scrypt parameters")]
    Params,
    #[error("scrypt output length rejected")]
    OutputLen,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain(pub [u8; 16]);

impl Domain {
    pub const fn new(tag: [u8; 16]) -> Self {
        Self(tag)
    }
}

pub const DOMAIN_COMMITMENT: Domain = Domain::new(*b"BELLS:CMT:V0\0\0\0\0");

pub const COMMITMENT_KEY_LEN: usize = 32;

pub fn hash_domain(domain: Domain, bytes: &[u8]) -> Hash256 {
    let mut hasher = Hasher::new();
    hasher.update(&domain.0);
    hasher.update(bytes);
    let out = hasher.finalize();
    Hash256(*out.as_bytes())
}

/// Double SHA-256, bytes in internal (little-endian number) order.
pub fn sha256d(bytes: &[u8]) -> Hash256 {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    Hash256(out)
}

/// Block identity: double SHA-256 of the 80-byte encoding. Peers link
/// headers through this value.
pub fn hash_header(header: &BlockHeader) -> Hash256 {
    sha256d(&canonical::encode_block_header(header))
}

/// scrypt(N=1024, r=1, p=1) over the encoded header, used as both password
/// and salt. Compared against the target, never used as identity.
pub fn pow_hash(header: &BlockHeader) -> Result<Hash256, PowHashError> {
    let enc = canonical::encode_block_header(header);
    let params = scrypt::Params::new(10, 1, 1, 32).map_err(|_| PowHashError::Params)?;
    let mut out = [0u8; 32];
    scrypt::scrypt(&enc, &enc, &params, &mut out).map_err(|_| PowHashError::OutputLen)?;
    Ok(Hash256(out))
}

/// One bit derived from a block id under a per-session secret key.
pub fn commitment_bit(key: &[u8; COMMITMENT_KEY_LEN], id: &Hash256) -> bool {
    let mut hasher = Hasher::new_keyed(key);
    hasher.update(&DOMAIN_COMMITMENT.0);
    hasher.update(&id.0);
    hasher.finalize().as_bytes()[0] & 1 == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    fn header(nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_hash: Hash256::zero(),
            merkle_root: Hash256::zero(),
            time: 1_700_000_000,
            bits: 0x207f_ffff,
            nonce,
        }
    }

    #[test]
    fn hash_is_deterministic_for_header() {
        assert_eq!(hash_header(&header(42)), hash_header(&header(42)));
        assert_ne!(hash_header(&header(42)), hash_header(&header(43)));
    }

    /// Parse a hash written the way block explorers print it.
    fn display_hash(s: &str) -> Hash256 {
        let mut bytes: [u8; 32] = hex::decode(s).unwrap().try_into().unwrap();
        bytes.reverse();
        Hash256(bytes)
    }

    fn bitcoin_genesis() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: Hash256::zero(),
            merkle_root: display_hash(
                "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            ),
            time: 1_231_006_505,
            bits: 0x1d00_ffff,
            nonce: 2_083_236_893,
        }
    }

    #[test]
    fn header_id_matches_network_genesis() {
        assert_eq!(
            hash_header(&bitcoin_genesis()),
            display_hash("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f")
        );
    }

    #[test]
    fn pow_hash_is_scrypt_not_identity() {
        let h = bitcoin_genesis();
        let pow = pow_hash(&h).unwrap();
        assert_eq!(pow, pow_hash(&h).unwrap());
        assert_ne!(pow, hash_header(&h));
        assert_ne!(pow_hash(&header(1)).unwrap(), pow_hash(&header(2)).unwrap());
    }

    #[test]
    fn domain_separates_hashes() {
        let enc = canonical::encode_block_header(&header(1));
        assert_ne!(
            hash_domain(DOMAIN_COMMITMENT, &enc),
            hash_domain(Domain::new(*b"BELLS:OTHER:V0\0\0"), &enc)
        );
    }

    #[test]
    fn commitment_bits_depend_on_key() {
        let mut rng = StdRng::seed_from_u64(7);
        let ids: Vec<Hash256> = (0..64).map(|n| hash_header(&header(n))).collect();

        let mut a = [0u8; COMMITMENT_KEY_LEN];
        let mut b = [0u8; COMMITMENT_KEY_LEN];
        rng.fill_bytes(&mut a);
        rng.fill_bytes(&mut b);

        let bits_a: Vec<bool> = ids.iter().map(|id| commitment_bit(&a, id)).collect();
        let bits_a2: Vec<bool> = ids.iter().map(|id| commitment_bit(&a, id)).collect();
        let bits_b: Vec<bool> = ids.iter().map(|id| commitment_bit(&b, id)).collect();

        assert_eq!(bits_a, bits_a2);
        assert_ne!(bits_a, bits_b);
        assert!(bits_a.iter().any(|b| *b) && bits_a.iter().any(|b| !*b));
    }
}
