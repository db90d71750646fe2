//! User-facing staking operations over the DPoS engine.
//!
//! The per-delegator unbonding queue in the ledger is the only record of
//! unbonding funds. Unstaking (here or through an `Undelegate` transaction)
//! moves stake to `locked` and appends an entry; once its completion height
//! is reached the entry is removed and the amount returns to the balance.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ChainConfig;
use crate::dpos::DposEngine;
use crate::error::{ChainError, Result};
use crate::executor;
use crate::state::{StateOverlay, UnbondingDelegation};
use crate::types::{mul_div, Address, Amount, BASIS_POINTS};

/// Result of one unbonding pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbondingReport {
    /// entries released by this pass
    pub completed: Vec<UnbondingDelegation>,
    /// entries still waiting
    pub pending: Vec<UnbondingDelegation>,
}

impl UnbondingReport {
    pub fn released(&self) -> Amount {
        self.completed.iter().map(|e| e.amount).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingInfo {
    pub delegator: Address,
    pub validator: Address,
    pub staked_amount: Amount,
    pub rewards: Amount,
    pub unbonding_count: usize,
    pub unbonding_amount: Amount,
    pub created_at_height: u64,
}

/// Release every matured entry in the overlay: locked -> balance.
pub fn release_matured(overlay: &mut StateOverlay<'_>, height: u64) -> Result<UnbondingReport> {
    let mut report = UnbondingReport::default();
    for delegator in overlay.unbonding_delegators()? {
        let entries = overlay.get_unbonding(&delegator)?;
        let (matured, waiting): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| e.is_mature(height));
        if matured.is_empty() {
            report.pending.extend(waiting);
            continue;
        }

        let amount: Amount = matured.iter().map(|e| e.amount).sum();
        let mut account = overlay.get_account(&delegator)?;
        account.release_locked(amount)?;
        overlay.set_account(account);
        overlay.set_unbonding(delegator, waiting.clone());

        debug!(delegator = %delegator, amount, entries = matured.len(), height, "unbonding released");
        report.completed.extend(matured);
        report.pending.extend(waiting);
    }
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct StakingManager {
    engine: Arc<DposEngine>,
    min_delegation: Amount,
}

impl StakingManager {
    pub fn new(engine: Arc<DposEngine>, config: &ChainConfig) -> Self {
        Self { engine, min_delegation: config.staking.min_delegation }
    }

    pub fn min_delegation(&self) -> Amount {
        self.min_delegation
    }

    pub fn stake(&self, delegator: &Address, validator: &Address, amount: Amount, height: u64) -> Result<()> {
        if amount < self.min_delegation {
            return Err(ChainError::BelowMinimumStake { amount, minimum: self.min_delegation });
        }
        self.engine.delegate(delegator, validator, amount, height)?;
        info!(delegator = %delegator, validator = %validator, amount, "stake delegated");
        Ok(())
    }

    /// Undelegate and queue the amount until `height + unbonding_period`.
    pub fn unstake(
        &self,
        delegator: &Address,
        validator: &Address,
        amount: Amount,
        height: u64,
    ) -> Result<UnbondingDelegation> {
        let entry = self.engine.undelegate(delegator, validator, amount, height)?;
        info!(
            delegator = %delegator,
            validator = %validator,
            amount,
            completion = entry.completion_height,
            "unbonding started"
        );
        Ok(entry)
    }

    /// Release what has matured by `height`. Each entry completes once.
    pub fn process_unbonding(&self, height: u64) -> Result<UnbondingReport> {
        let mut txn = self.engine.begin();
        let report = release_matured(&mut txn, height)?;
        if !report.completed.is_empty() {
            txn.commit()?;
        }
        Ok(report)
    }

    pub fn get_unbonding_delegations(&self, delegator: &Address) -> Result<Vec<UnbondingDelegation>> {
        self.engine.store().get_unbonding(delegator)
    }

    /// Move bonded stake from `src` to `dst` without an unbonding delay.
    pub fn redelegate(
        &self,
        delegator: &Address,
        src: &Address,
        dst: &Address,
        amount: Amount,
        height: u64,
    ) -> Result<()> {
        if amount < self.min_delegation {
            return Err(ChainError::BelowMinimumStake { amount, minimum: self.min_delegation });
        }
        let mut txn = self.engine.begin();
        executor::redelegate(&mut txn, delegator, src, dst, amount, height)?;
        txn.commit()?;
        Ok(())
    }

    pub fn get_staking_info(&self, delegator: &Address, validator: &Address) -> Result<StakingInfo> {
        let delegation = self
            .engine
            .get_delegation(delegator, validator)
            .ok_or(ChainError::DelegationNotFound { delegator: *delegator, validator: *validator })?;
        let unbonding = self.get_unbonding_delegations(delegator)?;
        Ok(StakingInfo {
            delegator: *delegator,
            validator: *validator,
            staked_amount: delegation.amount,
            rewards: delegation.rewards,
            unbonding_count: unbonding.len(),
            unbonding_amount: unbonding.iter().map(|e| e.amount).sum(),
            created_at_height: delegation.created_at_height,
        })
    }

    /// Simple-interest estimate: `amount * apy_bp / 10000 * days / 365`.
    pub fn calculate_staking_returns(&self, amount: Amount, days: u64, apy_bp: u64) -> Amount {
        let yearly = mul_div(amount, apy_bp as u128, BASIS_POINTS).unwrap_or(Amount::MAX);
        mul_div(yearly, days as u128, 365).unwrap_or(Amount::MAX)
    }
}
