#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod headers_sync;

pub use headers_sync::{HeadersSyncState, ProcessingResult, SyncAbort, SyncPhase};

/// Store one commitment bit per this many headers.
pub const HEADER_COMMITMENT_PERIOD: u64 = 600;

/// Redownloaded headers held back before release (~20.6 commitments).
pub const REDOWNLOAD_BUFFER_SIZE: usize = 12_330;

/// Seconds a header timestamp may run ahead of local time.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadersSyncConfig {
    pub commitment_period: u64,
    pub redownload_buffer_size: usize,
    pub max_future_block_time: i64,
}

impl Default for HeadersSyncConfig {
    fn default() -> Self {
        Self {
            commitment_period: HEADER_COMMITMENT_PERIOD,
            redownload_buffer_size: REDOWNLOAD_BUFFER_SIZE,
            max_future_block_time: MAX_FUTURE_BLOCK_TIME,
        }
    }
}
