//! Ledger records stored under the account/validator/delegation/unbonding keys

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ChainError, Result};
use crate::types::{Address, Amount};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: Amount,
    pub nonce: u64,
    /// Amount staked (self-stake plus outgoing delegations)
    pub staked: Amount,
    /// Unbonding amount, released by the unbonding queue
    pub locked: Amount,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self { address, balance: 0, nonce: 0, staked: 0, locked: 0 }
    }

    pub fn with_balance(address: Address, balance: Amount) -> Self {
        Self { balance, ..Self::new(address) }
    }

    pub fn total_balance(&self) -> Amount {
        self.balance.saturating_add(self.staked).saturating_add(self.locked)
    }

    pub fn add_balance(&mut self, amount: Amount) -> Result<()> {
        self.balance = self.balance.checked_add(amount).ok_or(ChainError::Overflow)?;
        Ok(())
    }

    pub fn sub_balance(&mut self, amount: Amount) -> Result<()> {
        if self.balance < amount {
            return Err(ChainError::InsufficientBalance { need: amount, have: self.balance });
        }
        self.balance -= amount;
        Ok(())
    }

    pub fn add_stake(&mut self, amount: Amount) -> Result<()> {
        self.staked = self.staked.checked_add(amount).ok_or(ChainError::Overflow)?;
        Ok(())
    }

    pub fn sub_stake(&mut self, amount: Amount) -> Result<()> {
        if self.staked < amount {
            return Err(ChainError::InsufficientStake { need: amount, have: self.staked });
        }
        self.staked -= amount;
        Ok(())
    }

    /// staked -> locked
    pub fn lock_stake(&mut self, amount: Amount) -> Result<()> {
        self.sub_stake(amount)?;
        self.locked = self.locked.checked_add(amount).ok_or(ChainError::Overflow)?;
        Ok(())
    }

    /// locked -> balance
    pub fn release_locked(&mut self, amount: Amount) -> Result<()> {
        if self.locked < amount {
            return Err(ChainError::InsufficientStake { need: amount, have: self.locked });
        }
        self.locked -= amount;
        self.balance = self.balance.checked_add(amount).ok_or(ChainError::Overflow)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidatorStatus {
    Active,
    Inactive,
    Jailed,
    Unbonding,
}

impl ValidatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorStatus::Active => "active",
            ValidatorStatus::Inactive => "inactive",
            ValidatorStatus::Jailed => "jailed",
            ValidatorStatus::Unbonding => "unbonding",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub public_key: Vec<u8>,
    /// self_stake + sum of delegations
    pub voting_power: Amount,
    pub self_stake: Amount,
    /// basis points, 0..=10000
    pub commission: u16,
    pub status: ValidatorStatus,
    pub jailed: bool,
    pub jailed_at: Option<DateTime<Utc>>,
    /// consecutive misses; reset by a produced block or unjail
    pub missed_blocks: u64,
    /// lifetime misses
    pub total_missed_blocks: u64,
    pub produced_blocks: u64,
    /// accumulated commission
    pub total_rewards: Amount,
    pub moniker: String,
    pub website: String,
    pub details: String,
    pub created_at_height: u64,
}

impl Validator {
    pub fn new(address: Address, public_key: Vec<u8>, self_stake: Amount, commission: u16) -> Self {
        Self {
            address,
            public_key,
            voting_power: self_stake,
            self_stake,
            commission,
            status: ValidatorStatus::Active,
            jailed: false,
            jailed_at: None,
            missed_blocks: 0,
            total_missed_blocks: 0,
            produced_blocks: 0,
            total_rewards: 0,
            moniker: String::new(),
            website: String::new(),
            details: String::new(),
            created_at_height: 0,
        }
    }

    pub fn add_voting_power(&mut self, amount: Amount) -> Result<()> {
        self.voting_power = self.voting_power.checked_add(amount).ok_or(ChainError::Overflow)?;
        Ok(())
    }

    pub fn sub_voting_power(&mut self, amount: Amount) {
        self.voting_power = self.voting_power.saturating_sub(amount);
    }

    /// Active, not jailed and above the minimum voting power.
    pub fn can_produce_blocks(&self, min_stake: Amount) -> bool {
        self.status == ValidatorStatus::Active && !self.jailed && self.voting_power >= min_stake
    }

    pub fn jail(&mut self, at: DateTime<Utc>) {
        self.jailed = true;
        self.jailed_at = Some(at);
        self.status = ValidatorStatus::Jailed;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub delegator: Address,
    pub validator: Address,
    pub amount: Amount,
    /// accumulated, unclaimed rewards
    pub rewards: Amount,
    pub created_at_height: u64,
}

impl Delegation {
    pub fn new(delegator: Address, validator: Address, amount: Amount, height: u64) -> Self {
        Self { delegator, validator, amount, rewards: 0, created_at_height: height }
    }

    /// Delegations disappear once nothing is bonded and nothing is owed.
    pub fn is_empty(&self) -> bool {
        self.amount == 0 && self.rewards == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbondingDelegation {
    pub delegator: Address,
    /// validator the stake was bonded to; the account itself for plain unstake
    pub validator: Address,
    pub amount: Amount,
    pub creation_height: u64,
    pub completion_height: u64,
}

impl UnbondingDelegation {
    pub fn new(delegator: Address, validator: Address, amount: Amount, height: u64, period: u64) -> Self {
        Self {
            delegator,
            validator,
            amount,
            creation_height: height,
            completion_height: height.saturating_add(period),
        }
    }

    pub fn is_mature(&self, current_height: u64) -> bool {
        current_height >= self.completion_height
    }

    pub fn remaining_blocks(&self, current_height: u64) -> u64 {
        self.completion_height.saturating_sub(current_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_lock_and_release() {
        let mut acc = Account::with_balance(Address::from_bytes([1; 20]), 100);
        acc.sub_balance(40).unwrap();
        acc.add_stake(40).unwrap();
        acc.lock_stake(15).unwrap();
        assert_eq!((acc.balance, acc.staked, acc.locked), (60, 25, 15));
        assert_eq!(acc.total_balance(), 100);

        acc.release_locked(15).unwrap();
        assert_eq!((acc.balance, acc.locked), (75, 0));
        assert!(acc.lock_stake(26).is_err());
    }

    #[test]
    fn validator_eligibility() {
        let mut v = Validator::new(Address::from_bytes([2; 20]), vec![0; 32], 1_000, 500);
        assert!(v.can_produce_blocks(1_000));
        assert!(!v.can_produce_blocks(1_001));
        v.jail(Utc::now());
        assert!(!v.can_produce_blocks(1));
        assert_eq!(v.status, ValidatorStatus::Jailed);
    }

    #[test]
    fn unbonding_maturity() {
        let e = UnbondingDelegation::new(Address::default(), Address::default(), 5, 10, 100);
        assert_eq!(e.completion_height, 110);
        assert!(!e.is_mature(109));
        assert!(e.is_mature(110));
        assert_eq!(e.remaining_blocks(50), 60);
    }
}
