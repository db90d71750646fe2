//! Fixed-width identifiers, amounts and chain-wide constants.

use primitive_types::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{ChainError, Result};

/// Byte-array newtype that reads and writes as lowercase hex (a leading
/// `0x` is accepted on input), both in `Display` and through serde.
macro_rules! hex_newtype {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self> {
                let raw = hex::decode(s.strip_prefix("0x").unwrap_or(s))
                    .map_err(|e| ChainError::Parse(format!("{}: {}", stringify!($name), e)))?;
                let bytes: [u8; $len] = raw.try_into().map_err(|raw: Vec<u8>| {
                    ChainError::Parse(format!(concat!("invalid ", stringify!($name), " length: {}"), raw.len()))
                })?;
                Ok(Self(bytes))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self([0u8; $len])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = ChainError;

            fn from_str(s: &str) -> Result<Self> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_newtype!(
    /// First 20 bytes of SHA3-512 over the owner's public key.
    Address,
    20
);

hex_newtype!(
    /// SHA3-512 digest.
    Hash,
    64
);

impl Hash {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

/// Amounts are carried in the smallest denomination.
pub type Amount = u128;

// ============================================================
// NETWORK CONSTANTS
// ============================================================

pub const DECIMALS: u32 = 18;
pub const ONE_TOKEN: Amount = 10u128.pow(DECIMALS);
pub const TOTAL_SUPPLY: Amount = 500_000_000u128 * ONE_TOKEN;

/// target seconds between blocks
pub const BLOCK_TIME_SECS: u64 = 3;
pub const MAX_VALIDATORS: usize = 21;
pub const MIN_VALIDATOR_STAKE: Amount = 100_000 * ONE_TOKEN;
pub const MIN_DELEGATION: Amount = 10 * ONE_TOKEN;
/// ~1 hour at 3s blocks
pub const EPOCH_LENGTH: u64 = 1200;
/// ~7 days at 3s blocks
pub const UNBONDING_PERIOD: u64 = 201_600;

pub const BLOCK_GAS_LIMIT: u64 = 10_000_000;
pub const DEFAULT_GAS_LIMIT: u64 = 21_000;
pub const GWEI: Amount = 1_000_000_000;
pub const DEFAULT_GAS_PRICE: Amount = GWEI;

pub const MAX_COMMISSION_BP: u16 = 10_000;
pub const BASIS_POINTS: u128 = 10_000;

/// Whole tokens to base units.
pub fn to_base_units(tokens: u128) -> Amount {
    tokens.saturating_mul(ONE_TOKEN)
}

/// Base units rendered as a decimal token string, trailing zeros trimmed.
pub fn format_amount(units: Amount) -> String {
    let whole = units / ONE_TOKEN;
    let frac = units % ONE_TOKEN;
    if frac == 0 {
        return whole.to_string();
    }
    let frac_str = format!("{:018}", frac);
    format!("{}.{}", whole, frac_str.trim_end_matches('0'))
}

/// Parse a decimal token string ("12.5") into base units.
pub fn parse_amount(s: &str) -> Result<Amount> {
    let s = s.trim();
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if frac.len() > DECIMALS as usize {
        return Err(ChainError::Parse(format!("too many decimal places: {}", frac.len())));
    }
    let digits = |part: &str| -> Result<u128> {
        part.parse().map_err(|e| ChainError::Parse(format!("amount {:?}: {}", s, e)))
    };
    let whole = if whole.is_empty() { 0 } else { digits(whole)? };
    let frac_units = if frac.is_empty() { 0 } else { digits(&format!("{:0<18}", frac))? };
    whole
        .checked_mul(ONE_TOKEN)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| ChainError::Parse(format!("amount overflow: {}", s)))
}

/// `floor(a * b / c)` with a 256-bit intermediate. `None` when `c` is zero
/// or the quotient does not fit.
pub fn mul_div(a: Amount, b: Amount, c: Amount) -> Option<Amount> {
    if c == 0 {
        return None;
    }
    let quotient = U256::from(a) * U256::from(b) / U256::from(c);
    if quotient.bits() > 128 {
        return None;
    }
    Some(quotient.as_u128())
}

/// `amount * bp / 10000`, floored.
pub fn apply_basis_points(amount: Amount, bp: u16) -> Amount {
    mul_div(amount, bp as u128, BASIS_POINTS).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    #[test]
    fn address_hex_roundtrip_with_prefix() {
        let addr = Address::from_bytes([0xab; 20]);
        let parsed = Address::from_str(&format!("0x{}", addr)).unwrap();
        assert_eq!(parsed, addr);
        assert!(matches!(Address::from_hex("abcd"), Err(ChainError::Parse(_))));
        assert!(matches!(Address::from_hex("zz"), Err(ChainError::Parse(_))));

        let h = crypto::sha3_512(b"x");
        assert_eq!(h.to_string().parse::<Hash>().unwrap(), h);
        assert!(addr.to_hex().parse::<Hash>().is_err());
        assert!(Hash::zero().is_zero() && !h.is_zero());
    }

    #[test]
    fn address_from_pubkey_deterministic() {
        let kp = crypto::KeyPair::generate();
        let addr1 = crypto::address_from_pubkey_bytes(kp.public_key());
        let addr2 = crypto::address_from_pubkey_bytes(kp.public_key());
        assert_eq!(addr1, addr2);
        assert_eq!(addr1.to_hex().len(), 40);
    }

    #[test]
    fn amount_formatting() {
        assert_eq!(format_amount(to_base_units(10)), "10");
        assert_eq!(format_amount(ONE_TOKEN / 10), "0.1");
        assert_eq!(parse_amount("12.5").unwrap(), 12 * ONE_TOKEN + ONE_TOKEN / 2);
        assert_eq!(parse_amount("3").unwrap(), 3 * ONE_TOKEN);
        assert!(parse_amount("1.0000000000000000001").is_err());
        assert!(matches!(parse_amount("1.x"), Err(ChainError::Parse(_))));
        assert!(matches!(parse_amount("400000000000000000000000"), Err(ChainError::Parse(_))));
    }

    #[test]
    fn mul_div_handles_wide_products() {
        assert_eq!(mul_div(10, 3, 4), Some(7));
        assert_eq!(mul_div(1, 1, 0), None);
        // 5e26 * 2e18 overflows u128 but the quotient fits
        let big = 500_000_000 * ONE_TOKEN;
        assert_eq!(mul_div(2 * ONE_TOKEN, big, big), Some(2 * ONE_TOKEN));
        assert_eq!(mul_div(u128::MAX, u128::MAX, u128::MAX), Some(u128::MAX));
        assert_eq!(mul_div(u128::MAX, 2, 1), None);
        assert_eq!(mul_div(u128::MAX, 3, 2), None);
        assert_eq!(mul_div(u128::MAX, u128::MAX - 1, u128::MAX), Some(u128::MAX - 1));
        assert_eq!(mul_div(7, 0, 3), Some(0));
        assert_eq!(apply_basis_points(1_000_000, 100), 10_000);
    }

    #[test]
    fn hash_serde_as_hex() {
        let h = Hash::from_bytes([7u8; 64]);
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h.to_hex()));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }
}
