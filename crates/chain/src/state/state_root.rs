//! Sorted merkle root over ledger entries.
//!
//! Leaves are `H(key || value)` in ascending key order. Inner nodes are
//! `H(left || right)`; an odd node at the end of a level is paired with itself.
//! An empty ledger has the zero hash as its root.

use crate::crypto::{sha3_512, sha3_512_pair};
use crate::types::Hash;

pub fn leaf_hash(key: &[u8], value: &[u8]) -> Hash {
    let mut buf = Vec::with_capacity(key.len() + value.len() + 1);
    buf.extend_from_slice(key);
    buf.push(0u8);
    buf.extend_from_slice(value);
    sha3_512(&buf)
}

pub fn merkle_root(mut level: Vec<Hash>) -> Hash {
    if level.is_empty() {
        return Hash::zero();
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => sha3_512_pair(left, right),
                [single] => sha3_512_pair(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }
    level[0]
}

/// Root over already-sorted `(key, value)` entries.
pub fn compute_state_root<'a, I>(entries: I) -> Hash
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let leaves = entries.into_iter().map(|(k, v)| leaf_hash(k, v)).collect();
    merkle_root(leaves)
}
