#![forbid(unsafe_code)]

//! 256-bit target arithmetic and the compact ("nBits") encoding.

use uint::construct_uint;

construct_uint! {
    /// Unsigned 256-bit integer, 4 x 64-bit little-endian words.
    pub struct U256(4);
}

construct_uint! {
    /// Scratch width for products of a target and a timespan.
    struct U512(8);
}

/// Decoded compact target together with the flags the encoding can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompactTarget {
    pub target: U256,
    pub negative: bool,
    pub overflow: bool,
}

impl CompactTarget {
    /// Usable as a proof-of-work target at all.
    pub fn is_valid(&self) -> bool {
        !self.negative && !self.overflow && !self.target.is_zero()
    }
}

/// Expand a compact target: 1 byte size, 1 sign bit, 23 bit mantissa.
pub fn decode_compact(bits: u32) -> CompactTarget {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let target = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        let shift = 8 * (size as usize - 3);
        if shift >= 256 {
            U256::zero()
        } else {
            U256::from(word) << shift
        }
    };
    let negative = word != 0 && (bits & 0x0080_0000) != 0;
    let overflow =
        word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));
    CompactTarget {
        target,
        negative,
        overflow,
    }
}

/// Lossy inverse of [`decode_compact`]: keeps the top three significant bytes.
pub fn encode_compact(value: &U256) -> u32 {
    let mut size = (value.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        (value.low_u64() << (8 * (3 - size))) as u32
    } else {
        (*value >> (8 * (size - 3))).low_u64() as u32
    };
    // The 0x00800000 bit is the sign; move it out of the mantissa.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | ((size as u32) << 24)
}

/// Round a target through the compact encoding.
pub fn round_compact(value: &U256) -> U256 {
    decode_compact(encode_compact(value)).target
}

/// `value * mul / div` computed at 512 bits, saturating at `U256::MAX`.
pub fn mul_div(value: U256, mul: u64, div: u64) -> U256 {
    if div == 0 {
        return U256::MAX;
    }
    let wide = widen(value) * U512::from(mul) / U512::from(div);
    narrow(wide).unwrap_or(U256::MAX)
}

/// Hash bytes read as a little-endian number.
pub fn u256_from_hash_le(bytes: &[u8; 32]) -> U256 {
    U256::from_little_endian(bytes)
}

fn widen(value: U256) -> U512 {
    let mut words = [0u64; 8];
    words[..4].copy_from_slice(&value.0);
    U512(words)
}

fn narrow(value: U512) -> Option<U256> {
    if value.0[4..].iter().any(|w| *w != 0) {
        return None;
    }
    let mut words = [0u64; 4];
    words.copy_from_slice(&value.0[..4]);
    Some(U256(words))
}

/// Serde adapter: 256-bit values as `0x`-prefixed hex strings in config files.
pub mod hex_u256 {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    use super::U256;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        let w = value.0;
        serializer.serialize_str(&format!(
            "0x{:016x}{:016x}{:016x}{:016x}",
            w[3], w[2], w[1], w[0]
        ))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(D::Error::custom)
    }

    pub fn parse(s: &str) -> Result<U256, String> {
        let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
        let invalid = || format!("invalid 256-bit hex value: {:?}", s);
        if digits.is_empty() || digits.len() > 64 || !digits.is_ascii() {
            return Err(invalid());
        }
        let padded = format!("{:0>64}", digits);
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&padded[2 * i..2 * i + 2], 16).map_err(|_| invalid())?;
        }
        Ok(U256::from_big_endian(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_known_compacts() {
        let t = decode_compact(0x1d00_ffff);
        assert_eq!(t.target, U256::from(0xffffu64) << 208);
        assert!(!t.negative && !t.overflow);

        // Small sizes shift the mantissa down.
        assert_eq!(decode_compact(0x0112_3456).target, U256::from(0x12u64));
        assert_eq!(decode_compact(0x0200_8000).target, U256::from(0x80u64));
        assert_eq!(decode_compact(0x0000_0000).target, U256::zero());
    }

    #[test]
    fn decode_flags() {
        let neg = decode_compact(0x04923456);
        assert!(neg.negative);
        assert!(!neg.is_valid());

        let over = decode_compact(0xff12_3456);
        assert!(over.overflow);

        let edge = decode_compact(0x2200_00ff);
        assert!(!edge.overflow);
        let edge = decode_compact(0x2200_0100);
        assert!(edge.overflow);
    }

    #[test]
    fn encode_normalizes_sign_bit() {
        // 0x80 alone would set the sign bit at size 1, so it moves to size 2.
        assert_eq!(encode_compact(&U256::from(0x80u64)), 0x0200_8000);
        assert_eq!(encode_compact(&(U256::from(0xffffu64) << 208)), 0x1d00_ffff);
        assert_eq!(encode_compact(&U256::zero()), 0);
    }

    #[test]
    fn encode_truncates_to_three_bytes() {
        let v = (U256::from(0x0003_fcu64) << 208) + U256::from(1u64);
        assert_eq!(encode_compact(&v), 0x1c03_fc00);
        assert_eq!(round_compact(&v), U256::from(0x3fcu64) << 208);
    }

    #[test]
    fn mul_div_does_not_wrap() {
        let big = U256::MAX >> 4;
        let out = mul_div(big, 4, 4);
        assert_eq!(out, big);
        assert_eq!(mul_div(U256::MAX, 2, 1), U256::MAX);
        assert_eq!(mul_div(U256::from(10u64), 3, 0), U256::MAX);
    }

    #[test]
    fn hex_parse() {
        let v = hex_u256::parse("0x00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff").unwrap();
        assert_eq!(v, U256::MAX >> 20);
        assert!(hex_u256::parse("zz").is_err());
        assert!(hex_u256::parse("").is_err());
    }
}
