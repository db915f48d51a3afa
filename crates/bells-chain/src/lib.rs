#![forbid(unsafe_code)]

use bells_crypto::hash_header;
use bells_types::{BlockHeader, Hash256};

pub mod index;
pub mod params;
pub mod pow;
pub mod retarget;
pub mod window;

pub use index::{ChainIndex, ChainIndexEntry, ChainStart, IndexError};
pub use params::{params_for, ParamsError};
pub use pow::{block_proof, check_header_pow, check_headers_pow, check_proof_of_work, PowError};
pub use retarget::{next_work_required, permitted_difficulty_transition, RetargetSample};
pub use window::{HeaderSample, WindowRetargetChecker};

/// Double SHA-256 block id, the value peers put in `prev_hash`.
pub fn header_id(header: &BlockHeader) -> Hash256 {
    hash_header(header)
}
