//! Epoch rotation
//!
//! The active validator set is recomputed every `interval` blocks from the
//! registered validators' voting power. Ranking is a pure function of the
//! validator records so every node derives the same ordered set.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::state::Validator;
use crate::types::{Address, Amount};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EpochConfig {
    /// blocks per epoch
    pub interval: u64,
    /// active set cap
    pub max_validators: usize,
}

impl EpochConfig {
    pub fn new(interval: u64, max_validators: usize) -> Self {
        Self { interval, max_validators }
    }
}

/// Bookkeeping for the running epoch, persisted under `dpos:epoch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EpochInfo {
    pub epoch_number: u64,
    pub start_height: u64,
    /// size of the active set selected at `start_height`
    pub active_validators: usize,
    /// its combined voting power
    pub total_stake: Amount,
}

impl EpochInfo {
    pub fn rotate(&mut self, number: u64, height: u64, active_validators: usize, total_stake: Amount) {
        *self = Self { epoch_number: number, start_height: height, active_validators, total_stake };
    }
}

/// Rotation happens on every multiple of the interval except genesis.
pub fn should_rotate(height: u64, config: &EpochConfig) -> bool {
    config.interval > 0 && height > 0 && height % config.interval == 0
}

/// Highest voting power first; equal power falls back to ascending address.
fn rank_order(a: &Validator, b: &Validator) -> Ordering {
    b.voting_power
        .cmp(&a.voting_power)
        .then_with(|| a.address.cmp(&b.address))
}

/// Ordered active set: eligible validators ranked by voting power, truncated
/// to `max_validators`. Input order does not affect the result.
pub fn rank_validators(validators: &[Validator], min_stake: Amount, max_validators: usize) -> Vec<Address> {
    let mut eligible: Vec<&Validator> = validators
        .iter()
        .filter(|v| v.can_produce_blocks(min_stake))
        .collect();
    eligible.sort_by(|a, b| rank_order(a, b));
    eligible
        .into_iter()
        .take(max_validators)
        .map(|v| v.address)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(b: u8, power: Amount) -> Validator {
        Validator::new(Address::from_bytes([b; 20]), vec![b; 32], power, 0)
    }

    #[test]
    fn rotation_heights() {
        let cfg = EpochConfig::new(10, 3);
        assert!(!should_rotate(0, &cfg));
        assert!(!should_rotate(9, &cfg));
        assert!(should_rotate(10, &cfg));
        assert!(should_rotate(20, &cfg));
        assert!(!should_rotate(20, &EpochConfig::new(0, 3)));
    }

    #[test]
    fn ranking_is_deterministic_and_tie_broken_by_address() {
        let a = vec![val(3, 50), val(1, 100), val(2, 100), val(4, 5)];
        let mut b = a.clone();
        b.reverse();

        let ra = rank_validators(&a, 10, 21);
        let rb = rank_validators(&b, 10, 21);
        assert_eq!(ra, rb);
        assert_eq!(
            ra,
            vec![Address::from_bytes([1; 20]), Address::from_bytes([2; 20]), Address::from_bytes([3; 20])]
        );
    }

    #[test]
    fn ranking_truncates_and_skips_jailed() {
        let mut vals = vec![val(1, 100), val(2, 90), val(3, 80)];
        vals[0].jail(chrono::Utc::now());
        let ranked = rank_validators(&vals, 10, 1);
        assert_eq!(ranked, vec![Address::from_bytes([2; 20])]);
    }
}
