//! Key layout for the ledger and block archive.
//!
//! Keys are ASCII so that the ordered key-value collaborator sorts entries
//! of one kind by address (or by height for zero-padded heights).

use crate::types::{Address, Hash};

pub const ACCOUNT_PREFIX: &[u8] = b"account:";
pub const VALIDATOR_PREFIX: &[u8] = b"validator:";
pub const DELEGATION_PREFIX: &[u8] = b"delegation:";
pub const UNBONDING_PREFIX: &[u8] = b"unbonding:";
pub const SLASH_PREFIX: &[u8] = b"slash:";
/// Delegations indexed by validator; not part of the state root.
pub const BONDED_PREFIX: &[u8] = b"bonded:";

pub const ACTIVE_SET_KEY: &[u8] = b"dpos:active_set";
pub const EPOCH_KEY: &[u8] = b"dpos:epoch";

pub const BLOCK_HASH_PREFIX: &[u8] = b"block:hash:";
pub const BLOCK_NUMBER_PREFIX: &[u8] = b"block:number:";
pub const TX_PREFIX: &[u8] = b"tx:";
pub const RECEIPT_PREFIX: &[u8] = b"receipt:";
pub const LATEST_BLOCK_NUMBER_KEY: &[u8] = b"latest_block_number";

/// Prefixes summarised by the state root.
pub const STATE_ROOT_PREFIXES: [&[u8]; 4] =
    [ACCOUNT_PREFIX, VALIDATOR_PREFIX, DELEGATION_PREFIX, UNBONDING_PREFIX];

fn prefixed(prefix: &[u8], suffix: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix.as_bytes());
    key
}

pub fn account_key(addr: &Address) -> Vec<u8> {
    prefixed(ACCOUNT_PREFIX, &addr.to_hex())
}

pub fn validator_key(addr: &Address) -> Vec<u8> {
    prefixed(VALIDATOR_PREFIX, &addr.to_hex())
}

pub fn delegation_key(delegator: &Address, validator: &Address) -> Vec<u8> {
    prefixed(DELEGATION_PREFIX, &format!("{}:{}", delegator.to_hex(), validator.to_hex()))
}

/// Prefix of every delegation made by `delegator`.
pub fn delegator_prefix(delegator: &Address) -> Vec<u8> {
    prefixed(DELEGATION_PREFIX, &format!("{}:", delegator.to_hex()))
}

pub fn bonded_key(validator: &Address, delegator: &Address) -> Vec<u8> {
    prefixed(BONDED_PREFIX, &format!("{}:{}", validator.to_hex(), delegator.to_hex()))
}

/// Prefix of every delegation bonded to `validator`.
pub fn bonded_prefix(validator: &Address) -> Vec<u8> {
    prefixed(BONDED_PREFIX, &format!("{}:", validator.to_hex()))
}

pub fn unbonding_key(delegator: &Address) -> Vec<u8> {
    prefixed(UNBONDING_PREFIX, &delegator.to_hex())
}

/// Zero-padded height keeps slashing events in height order.
pub fn slash_key(height: u64, seq: u32) -> Vec<u8> {
    prefixed(SLASH_PREFIX, &format!("{:020}:{:010}", height, seq))
}

pub fn slash_height_prefix(height: u64) -> Vec<u8> {
    prefixed(SLASH_PREFIX, &format!("{:020}:", height))
}

pub fn block_hash_key(hash: &Hash) -> Vec<u8> {
    prefixed(BLOCK_HASH_PREFIX, &hash.to_hex())
}

pub fn block_number_key(number: u64) -> Vec<u8> {
    prefixed(BLOCK_NUMBER_PREFIX, &number.to_string())
}

pub fn tx_key(hash: &Hash) -> Vec<u8> {
    prefixed(TX_PREFIX, &hash.to_hex())
}

pub fn receipt_key(hash: &Hash) -> Vec<u8> {
    prefixed(RECEIPT_PREFIX, &hash.to_hex())
}
