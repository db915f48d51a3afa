#![forbid(unsafe_code)]

use std::path::Path;

use bells_types::params::default_legacy_eras;
use bells_types::{ConsensusParams, Network, U256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml decode error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("toml encode error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("consensus params invalid: {0}")]
    Invalid(&'static str),
}

pub type Result<T> = std::result::Result<T, ParamsError>;

pub fn validate_params(p: &ConsensusParams) -> Result<()> {
    if p.pow_limit.is_zero() {
        return Err(ParamsError::Invalid("pow_limit must be > 0"));
    }
    if p.pow_averaging_window == 0 {
        return Err(ParamsError::Invalid("pow_averaging_window must be > 0"));
    }
    // The averaging sum of `window` targets must fit in 256 bits.
    if U256::MAX / p.pow_limit < U256::from(p.pow_averaging_window) {
        return Err(ParamsError::Invalid(
            "pow_limit * pow_averaging_window overflows 256 bits",
        ));
    }
    if p.pow_target_spacing <= 0 || p.legacy_target_spacing <= 0 {
        return Err(ParamsError::Invalid("target spacings must be > 0"));
    }
    if p.pow_target_timespan < p.legacy_target_spacing {
        return Err(ParamsError::Invalid(
            "pow_target_timespan must cover at least one block",
        ));
    }
    if !(0..100).contains(&p.pow_max_adjust_up) {
        return Err(ParamsError::Invalid("pow_max_adjust_up must be in [0, 100)"));
    }
    if p.pow_max_adjust_down < 0 {
        return Err(ParamsError::Invalid("pow_max_adjust_down must be >= 0"));
    }
    if p.legacy_eras.is_empty() {
        return Err(ParamsError::Invalid("legacy_eras must be non-empty"));
    }
    if p
        .legacy_eras
        .iter()
        .any(|e| e.min_divisor <= 0 || e.max_multiplier <= 0)
    {
        return Err(ParamsError::Invalid(
            "legacy_eras divisors and multipliers must be > 0",
        ));
    }
    Ok(())
}

pub fn save_params_to_path<P: AsRef<Path>>(path: P, params: &ConsensusParams) -> Result<()> {
    validate_params(params)?;
    let s = toml::to_string(params)?;
    std::fs::write(path, s)?;
    Ok(())
}

pub fn load_params_from_path<P: AsRef<Path>>(path: P) -> Result<ConsensusParams> {
    let s = std::fs::read_to_string(path)?;
    let params: ConsensusParams = toml::from_str(&s)?;
    validate_params(&params)?;
    Ok(params)
}

/// Built-in parameters for each network.
pub fn params_for(network: Network) -> ConsensusParams {
    let main = ConsensusParams {
        network: Network::Main,
        pow_limit: U256::MAX >> 20,
        minimum_chain_work: U256::from(0x0010_0010u64),
        pow_averaging_window: 17,
        pow_target_spacing: 60,
        legacy_target_spacing: 60,
        pow_target_timespan: 4 * 60 * 60,
        pow_max_adjust_up: 16,
        pow_max_adjust_down: 32,
        new_pow_diff_height: 144_000,
        pow_allow_min_difficulty_blocks: false,
        pow_allow_min_difficulty_blocks_after_height: None,
        pow_no_retargeting: false,
        legacy_eras: default_legacy_eras(),
    };

    match network {
        Network::Main => main,
        Network::Testnet => ConsensusParams {
            network: Network::Testnet,
            pow_limit: U256::MAX >> 8,
            new_pow_diff_height: 20,
            ..main
        },
        Network::Signet => ConsensusParams {
            network: Network::Signet,
            pow_limit: U256::from(0x0377_aeu64) << 216,
            minimum_chain_work: U256::zero(),
            legacy_target_spacing: 10 * 60,
            pow_target_timespan: 14 * 24 * 60 * 60,
            new_pow_diff_height: 999_999_999,
            ..main
        },
        Network::Regtest => ConsensusParams {
            network: Network::Regtest,
            // 0x0f0f..0f, the largest limit a 17 block window can sum.
            pow_limit: U256::MAX / U256::from(17u64),
            minimum_chain_work: U256::zero(),
            pow_max_adjust_up: 0,
            pow_max_adjust_down: 0,
            new_pow_diff_height: 0,
            pow_allow_min_difficulty_blocks: true,
            pow_no_retargeting: true,
            ..main
        },
    }
}
