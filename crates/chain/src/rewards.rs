//! Block rewards, commission and delegator shares.
//!
//! Each block mints `block_reward(height)` and hands it, together with the
//! block's fees, to the producer. The producer keeps its commission; the
//! rest is split over the delegations bonded to it in proportion to
//! `delegation.amount / voting_power`, floored per delegator. The share
//! backed by the validator's own self-stake and the rounding dust are not
//! minted, so the supply grows by exactly what lands in reward buckets.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ChainConfig;
use crate::dpos::DposEngine;
use crate::error::{ChainError, Result};
use crate::state::StateOverlay;
use crate::types::{apply_basis_points, mul_div, Address, Amount, BASIS_POINTS};

const SECONDS_PER_YEAR: u64 = 365 * 24 * 60 * 60;

/// What one block's reward did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardDistribution {
    pub validator: Address,
    pub height: u64,
    pub block_reward: Amount,
    pub fees: Amount,
    pub commission: Amount,
    /// (delegator, share) in ascending delegator order
    pub delegator_rewards: Vec<(Address, Amount)>,
    /// self-stake share plus rounding dust, never credited
    pub undistributed: Amount,
}

impl RewardDistribution {
    pub fn total(&self) -> Amount {
        self.block_reward.saturating_add(self.fees)
    }

    pub fn distributed(&self) -> Amount {
        self.commission + self.delegator_rewards.iter().map(|(_, r)| *r).sum::<Amount>()
    }
}

#[derive(Debug, Clone)]
pub struct RewardCalculator {
    engine: Arc<DposEngine>,
    base_reward: Amount,
    min_reward: Amount,
    halving_interval: u64,
    blocks_per_year: u64,
}

impl RewardCalculator {
    pub fn new(engine: Arc<DposEngine>, config: &ChainConfig) -> Self {
        let block_time = config.consensus.block_time_secs.max(1);
        let blocks_per_year = SECONDS_PER_YEAR / block_time;
        let halving_interval = match config.rewards.halving_interval {
            0 => blocks_per_year * 4,
            n => n,
        };
        Self {
            engine,
            base_reward: config.rewards.base_reward,
            min_reward: config.rewards.min_reward,
            halving_interval,
            blocks_per_year,
        }
    }

    pub fn halving_interval(&self) -> u64 {
        self.halving_interval
    }

    /// Base reward halved once per elapsed interval, never below the floor.
    pub fn block_reward(&self, height: u64) -> Amount {
        let halvings = height / self.halving_interval;
        let reward = u32::try_from(halvings)
            .ok()
            .and_then(|h| self.base_reward.checked_shr(h))
            .unwrap_or(0);
        reward.max(self.min_reward)
    }

    /// Credit the block reward plus `fees` for a block produced by
    /// `validator`.
    pub fn distribute(
        &self,
        overlay: &mut StateOverlay<'_>,
        validator_addr: &Address,
        height: u64,
        fees: Amount,
    ) -> Result<RewardDistribution> {
        let mut validator = overlay.get_validator(validator_addr)?;
        let block_reward = self.block_reward(height);
        let total = block_reward.checked_add(fees).ok_or(ChainError::Overflow)?;

        let commission = apply_basis_points(total, validator.commission);
        let remainder = total - commission;
        validator.total_rewards = validator.total_rewards.checked_add(commission).ok_or(ChainError::Overflow)?;

        let mut delegator_rewards = Vec::new();
        if validator.voting_power > 0 {
            for mut delegation in overlay.delegations_of(validator_addr)? {
                let share = mul_div(remainder, delegation.amount, validator.voting_power).ok_or(ChainError::Overflow)?;
                if share == 0 {
                    continue;
                }
                delegation.rewards = delegation.rewards.checked_add(share).ok_or(ChainError::Overflow)?;
                delegator_rewards.push((delegation.delegator, share));
                overlay.set_delegation(delegation);
            }
        }
        overlay.set_validator(validator);

        let shared: Amount = delegator_rewards.iter().map(|(_, r)| *r).sum();
        let distribution = RewardDistribution {
            validator: *validator_addr,
            height,
            block_reward,
            fees,
            commission,
            delegator_rewards,
            undistributed: remainder.saturating_sub(shared),
        };
        debug!(
            validator = %validator_addr,
            height,
            total,
            commission,
            delegators = distribution.delegator_rewards.len(),
            "block reward distributed"
        );
        Ok(distribution)
    }

    /// Pay out a delegation's accumulated rewards to the delegator's balance.
    pub fn claim_rewards(&self, delegator: &Address, validator: &Address) -> Result<Amount> {
        let mut txn = self.engine.begin();
        let claimed = claim_in(&mut txn, delegator, validator)?;
        txn.commit()?;
        Ok(claimed)
    }

    /// Pay out the validator's commission bucket to its owner's balance.
    pub fn withdraw_commission(&self, validator: &Address) -> Result<Amount> {
        let mut txn = self.engine.begin();
        let mut v = txn.get_validator(validator)?;
        if v.total_rewards == 0 {
            return Err(ChainError::NoRewards);
        }
        let amount = v.total_rewards;
        let mut owner = txn.get_or_create_account(validator)?;
        owner.add_balance(amount)?;
        v.total_rewards = 0;
        txn.set_account(owner);
        txn.set_validator(v);
        txn.commit()?;
        Ok(amount)
    }

    pub fn get_delegator_rewards(&self, delegator: &Address, validator: &Address) -> Result<Amount> {
        self.engine
            .get_delegation(delegator, validator)
            .map(|d| d.rewards)
            .ok_or(ChainError::DelegationNotFound { delegator: *delegator, validator: *validator })
    }

    /// Yearly minting at the current base reward over the active voting
    /// power, in basis points.
    pub fn calculate_apy(&self) -> u64 {
        let staked = self.engine.total_voting_power();
        if staked == 0 {
            return 0;
        }
        let annual = self.block_reward(0).saturating_mul(self.blocks_per_year as u128);
        mul_div(annual, BASIS_POINTS, staked)
            .and_then(|bp| u64::try_from(bp).ok())
            .unwrap_or(u64::MAX)
    }
}

fn claim_in(overlay: &mut StateOverlay<'_>, delegator: &Address, validator: &Address) -> Result<Amount> {
    let mut delegation = overlay.get_delegation(delegator, validator)?;
    if delegation.rewards == 0 {
        return Err(ChainError::NoRewards);
    }
    let amount = delegation.rewards;
    let mut account = overlay.get_or_create_account(delegator)?;
    account.add_balance(amount)?;
    delegation.rewards = 0;
    overlay.set_account(account);
    overlay.set_delegation(delegation);
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::state::{Account, StateStore, Validator};
    use crate::types::ONE_TOKEN;
    use apex_storage::MemoryKv;

    fn setup() -> (Arc<DposEngine>, RewardCalculator, Address) {
        let config = ChainConfig::default();
        let store = Arc::new(StateStore::new(Arc::new(MemoryKv::new())));
        let engine = Arc::new(DposEngine::open(store, &config).unwrap());
        let kp = KeyPair::generate();
        let stake = 100_000 * ONE_TOKEN;
        engine.store().set_account(&Account::with_balance(kp.address(), stake)).unwrap();
        engine
            .register_validator(Validator::new(kp.address(), kp.public_key().to_vec(), stake, 1000), 0)
            .unwrap();
        let calc = RewardCalculator::new(engine.clone(), &config);
        (engine, calc, kp.address())
    }

    #[test]
    fn halving_schedule_with_floor() {
        let (_, calc, _) = setup();
        let interval = calc.halving_interval();
        assert_eq!(interval, 4 * (SECONDS_PER_YEAR / 3));
        assert_eq!(calc.block_reward(0), 2 * ONE_TOKEN);
        assert_eq!(calc.block_reward(interval - 1), 2 * ONE_TOKEN);
        assert_eq!(calc.block_reward(interval), ONE_TOKEN);
        assert_eq!(calc.block_reward(2 * interval), ONE_TOKEN / 2);
        assert_eq!(calc.block_reward(10 * interval), ONE_TOKEN / 10);
        assert_eq!(calc.block_reward(u64::MAX), ONE_TOKEN / 10);
    }

    #[test]
    fn commission_and_delegator_shares() {
        let (engine, calc, val) = setup();
        let d1 = Address::from_bytes([1; 20]);
        let d2 = Address::from_bytes([2; 20]);
        for (d, amount) in [(d1, 60_000 * ONE_TOKEN), (d2, 40_000 * ONE_TOKEN)] {
            engine.store().set_account(&Account::with_balance(d, amount)).unwrap();
            engine.delegate(&d, &val, amount, 1).unwrap();
        }

        let mut txn = engine.begin();
        let dist = calc.distribute(&mut txn, &val, 2, 0).unwrap();
        txn.commit().unwrap();

        // total 2 tokens, 10% commission, 1.8 tokens over 200k voting power
        assert_eq!(dist.commission, ONE_TOKEN / 5);
        let remainder = 2 * ONE_TOKEN - ONE_TOKEN / 5;
        assert_eq!(dist.delegator_rewards, vec![(d1, remainder * 3 / 10), (d2, remainder / 5)]);
        assert_eq!(dist.undistributed, remainder / 2);
        assert_eq!(dist.distributed() + dist.undistributed, dist.total());
        assert_eq!(engine.get_validator(&val).unwrap().total_rewards, ONE_TOKEN / 5);
        assert_eq!(calc.get_delegator_rewards(&d1, &val).unwrap(), remainder * 3 / 10);
    }

    #[test]
    fn claim_and_withdraw_move_rewards_to_balance() {
        let (engine, calc, val) = setup();
        let d = Address::from_bytes([1; 20]);
        engine.store().set_account(&Account::with_balance(d, 100 * ONE_TOKEN)).unwrap();
        engine.delegate(&d, &val, 100 * ONE_TOKEN, 1).unwrap();

        let mut txn = engine.begin();
        calc.distribute(&mut txn, &val, 2, ONE_TOKEN).unwrap();
        txn.commit().unwrap();

        let pending = calc.get_delegator_rewards(&d, &val).unwrap();
        assert!(pending > 0);
        assert_eq!(calc.claim_rewards(&d, &val).unwrap(), pending);
        assert_eq!(engine.store().get_account(&d).unwrap().balance, pending);
        assert!(matches!(calc.claim_rewards(&d, &val), Err(ChainError::NoRewards)));

        let commission = calc.withdraw_commission(&val).unwrap();
        assert_eq!(commission, 3 * ONE_TOKEN / 10);
        assert_eq!(engine.store().get_account(&val).unwrap().balance, commission);
        assert!(matches!(calc.withdraw_commission(&val), Err(ChainError::NoRewards)));
    }

    #[test]
    fn apy_over_active_stake() {
        let (engine, calc, _) = setup();
        engine.select_validators().unwrap();
        // 2 tokens * 10_512_000 blocks / 100k tokens = 210.24 = 2_102_400 bp
        assert_eq!(calc.calculate_apy(), 2_102_400);
    }
}
