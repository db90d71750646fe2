//! State transition function.
//!
//! Every handler reads what it needs from the overlay, checks all
//! preconditions and only then writes. A failed transaction leaves the
//! overlay exactly as it found it.
//!
//! The staking transitions (`register_validator`, `delegate`, `undelegate`,
//! `redelegate`) are shared with the DPoS engine and the staking manager so
//! that transactions and direct API calls go through the same code.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::ChainConfig;
use crate::error::{ChainError, Result};
use crate::state::{Account, Delegation, StateOverlay, UnbondingDelegation, Validator, ValidatorStatus};
use crate::tx::{CreateValidatorData, EditValidatorData, StakeData, Transaction, TxType};
use crate::types::{Address, Amount, MAX_COMMISSION_BP};

/// Height and timestamp of the block a transaction executes in.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
    pub height: u64,
    pub timestamp: DateTime<Utc>,
}

impl BlockContext {
    pub fn new(height: u64, timestamp: DateTime<Utc>) -> Self {
        Self { height, timestamp }
    }
}

/// Effects of one executed transaction that the block pipeline needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOutcome {
    pub gas_used: u64,
    /// fee collected for the block producer
    pub fee: Amount,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    pub gas_used: u64,
    pub fees: Amount,
    pub executed: usize,
}

#[derive(Debug, Clone)]
pub struct Executor {
    min_validator_stake: Amount,
    unbonding_period: u64,
}

impl Executor {
    pub fn new(config: &ChainConfig) -> Self {
        Self {
            min_validator_stake: config.consensus.min_validator_stake,
            unbonding_period: config.consensus.unbonding_period,
        }
    }

    pub fn unbonding_period(&self) -> u64 {
        self.unbonding_period
    }

    /// Apply one transaction to the overlay.
    pub fn execute_transaction(
        &self,
        overlay: &mut StateOverlay<'_>,
        tx: &Transaction,
        ctx: &BlockContext,
    ) -> Result<TxOutcome> {
        let sender = overlay.get_account(&tx.from)?;
        if sender.nonce != tx.nonce {
            return Err(ChainError::InvalidNonce {
                address: tx.from,
                expected: sender.nonce,
                got: tx.nonce,
            });
        }

        let fee = match tx.tx_type {
            TxType::Transfer => self.transfer(overlay, sender, tx)?,
            TxType::Stake => {
                self.stake(overlay, sender, tx)?;
                0
            }
            TxType::Unstake => {
                self.unstake(overlay, sender, tx, ctx)?;
                0
            }
            TxType::Delegate => {
                let data: StakeData = tx.decode_data()?;
                delegate(overlay, &tx.from, &data.validator, data.amount, ctx.height)?;
                bump_nonce(overlay, &tx.from)?;
                0
            }
            TxType::Undelegate => {
                let data: StakeData = tx.decode_data()?;
                undelegate(overlay, &tx.from, &data.validator, data.amount, ctx.height, self.unbonding_period)?;
                bump_nonce(overlay, &tx.from)?;
                0
            }
            TxType::CreateValidator => {
                let data: CreateValidatorData = tx.decode_data()?;
                let mut validator = Validator::new(tx.from, tx.public_key.clone(), data.self_stake, data.commission);
                validator.moniker = data.moniker;
                validator.website = data.website;
                validator.details = data.details;
                register_validator(overlay, validator, self.min_validator_stake, ctx.height)?;
                bump_nonce(overlay, &tx.from)?;
                0
            }
            TxType::EditValidator => {
                let data: EditValidatorData = tx.decode_data()?;
                edit_validator(overlay, &tx.from, data)?;
                bump_nonce(overlay, &tx.from)?;
                0
            }
            TxType::Vote => {
                return Err(ChainError::UnsupportedOperation("vote transactions".into()));
            }
        };

        debug!(tx = %tx.hash, kind = tx.tx_type.as_str(), height = ctx.height, "tx executed");
        Ok(TxOutcome { gas_used: tx.gas_limit, fee })
    }

    /// Apply every transaction in order. The first failure fails the block;
    /// the caller drops the overlay so nothing reaches the store.
    pub fn execute_block(
        &self,
        overlay: &mut StateOverlay<'_>,
        txs: &[Transaction],
        ctx: &BlockContext,
    ) -> Result<BlockOutcome> {
        let mut outcome = BlockOutcome::default();
        for tx in txs {
            let tx_outcome = self.execute_transaction(overlay, tx, ctx)?;
            outcome.gas_used = outcome.gas_used.saturating_add(tx_outcome.gas_used);
            outcome.fees = outcome.fees.checked_add(tx_outcome.fee).ok_or(ChainError::Overflow)?;
            outcome.executed += 1;
        }
        Ok(outcome)
    }

    fn transfer(&self, overlay: &mut StateOverlay<'_>, mut sender: Account, tx: &Transaction) -> Result<Amount> {
        let fee = tx.fee()?;
        sender.sub_balance(tx.cost()?)?;
        sender.nonce += 1;

        if tx.to == tx.from {
            sender.add_balance(tx.value)?;
            overlay.set_account(sender);
        } else {
            let mut recipient = overlay.get_or_create_account(&tx.to)?;
            recipient.add_balance(tx.value)?;
            overlay.set_account(sender);
            overlay.set_account(recipient);
        }
        Ok(fee)
    }

    fn stake(&self, overlay: &mut StateOverlay<'_>, mut sender: Account, tx: &Transaction) -> Result<()> {
        let data: StakeData = tx.decode_data()?;
        require_positive(data.amount)?;
        sender.sub_balance(data.amount)?;
        sender.add_stake(data.amount)?;
        sender.nonce += 1;
        overlay.set_account(sender);
        Ok(())
    }

    /// Only stake not bonded to a validator (own self-stake or outgoing
    /// delegations) can be unstaked directly.
    fn unstake(
        &self,
        overlay: &mut StateOverlay<'_>,
        mut sender: Account,
        tx: &Transaction,
        ctx: &BlockContext,
    ) -> Result<()> {
        let data: StakeData = tx.decode_data()?;
        require_positive(data.amount)?;

        let free = unbonded_stake(overlay, &sender)?;
        if free < data.amount {
            return Err(ChainError::InsufficientStake { need: data.amount, have: free });
        }

        sender.lock_stake(data.amount)?;
        sender.nonce += 1;
        let entry = UnbondingDelegation::new(tx.from, tx.from, data.amount, ctx.height, self.unbonding_period);
        overlay.set_account(sender);
        overlay.push_unbonding(entry)?;
        Ok(())
    }
}

fn require_positive(amount: Amount) -> Result<()> {
    if amount == 0 {
        return Err(ChainError::InvalidTransaction("amount must be positive".into()));
    }
    Ok(())
}

fn bump_nonce(overlay: &mut StateOverlay<'_>, addr: &Address) -> Result<()> {
    let mut account = overlay.get_account(addr)?;
    account.nonce += 1;
    overlay.set_account(account);
    Ok(())
}

/// Staked amount held by `account` that backs neither a validator's
/// self-stake nor a delegation.
pub fn unbonded_stake(overlay: &StateOverlay<'_>, account: &Account) -> Result<Amount> {
    let mut bonded: Amount = overlay
        .delegations_by(&account.address)?
        .iter()
        .map(|d| d.amount)
        .sum();
    if let Some(v) = overlay.find_validator(&account.address)? {
        bonded = bonded.saturating_add(v.self_stake);
    }
    Ok(account.staked.saturating_sub(bonded))
}

/// Create a validator keyed by its owner address. Moves the self-stake from
/// the owner's balance into staked.
pub fn register_validator(
    overlay: &mut StateOverlay<'_>,
    mut validator: Validator,
    min_stake: Amount,
    height: u64,
) -> Result<()> {
    if overlay.find_validator(&validator.address)?.is_some() {
        return Err(ChainError::ValidatorExists(validator.address));
    }
    if validator.commission > MAX_COMMISSION_BP {
        return Err(ChainError::InvalidCommission(validator.commission));
    }
    if validator.self_stake < min_stake {
        return Err(ChainError::BelowMinimumStake { amount: validator.self_stake, minimum: min_stake });
    }

    let mut owner = overlay.get_account(&validator.address)?;
    owner.sub_balance(validator.self_stake)?;
    owner.add_stake(validator.self_stake)?;

    validator.voting_power = validator.self_stake;
    validator.status = ValidatorStatus::Active;
    validator.created_at_height = height;

    debug!(validator = %validator.address, self_stake = validator.self_stake, "validator registered");
    overlay.set_account(owner);
    overlay.set_validator(validator);
    Ok(())
}

/// Owner-only update of commission and descriptive fields.
pub fn edit_validator(overlay: &mut StateOverlay<'_>, owner: &Address, edit: EditValidatorData) -> Result<Validator> {
    let mut validator = overlay.get_validator(owner)?;
    if let Some(commission) = edit.commission {
        if commission > MAX_COMMISSION_BP {
            return Err(ChainError::InvalidCommission(commission));
        }
        validator.commission = commission;
    }
    if let Some(moniker) = edit.moniker {
        validator.moniker = moniker;
    }
    if let Some(website) = edit.website {
        validator.website = website;
    }
    if let Some(details) = edit.details {
        validator.details = details;
    }
    overlay.set_validator(validator.clone());
    Ok(validator)
}

/// balance -> staked on the delegator, plus voting power on the validator.
pub fn delegate(
    overlay: &mut StateOverlay<'_>,
    delegator: &Address,
    validator_addr: &Address,
    amount: Amount,
    height: u64,
) -> Result<Delegation> {
    require_positive(amount)?;
    let mut validator = overlay.get_validator(validator_addr)?;
    let mut account = overlay.get_account(delegator)?;
    let mut delegation = overlay
        .find_delegation(delegator, validator_addr)?
        .unwrap_or_else(|| Delegation::new(*delegator, *validator_addr, 0, height));

    account.sub_balance(amount)?;
    account.add_stake(amount)?;
    delegation.amount = delegation.amount.checked_add(amount).ok_or(ChainError::Overflow)?;
    validator.add_voting_power(amount)?;

    overlay.set_account(account);
    overlay.set_validator(validator);
    overlay.set_delegation(delegation.clone());
    Ok(delegation)
}

/// Reduce a delegation and queue the amount for release after the
/// unbonding period. staked -> locked on the delegator.
pub fn undelegate(
    overlay: &mut StateOverlay<'_>,
    delegator: &Address,
    validator_addr: &Address,
    amount: Amount,
    height: u64,
    unbonding_period: u64,
) -> Result<UnbondingDelegation> {
    require_positive(amount)?;
    let mut delegation = overlay.get_delegation(delegator, validator_addr)?;
    if delegation.amount < amount {
        return Err(ChainError::InsufficientDelegation { need: amount, have: delegation.amount });
    }
    let mut validator = overlay.get_validator(validator_addr)?;
    let mut account = overlay.get_account(delegator)?;
    if account.staked < amount {
        return Err(ChainError::InsufficientStake { need: amount, have: account.staked });
    }

    delegation.amount -= amount;
    validator.sub_voting_power(amount);
    account.lock_stake(amount)?;
    let entry = UnbondingDelegation::new(*delegator, *validator_addr, amount, height, unbonding_period);

    overlay.set_account(account);
    overlay.set_validator(validator);
    overlay.set_delegation(delegation);
    overlay.push_unbonding(entry.clone())?;
    Ok(entry)
}

/// Move bonded stake between validators without an unbonding delay.
pub fn redelegate(
    overlay: &mut StateOverlay<'_>,
    delegator: &Address,
    src: &Address,
    dst: &Address,
    amount: Amount,
    height: u64,
) -> Result<()> {
    require_positive(amount)?;
    if src == dst {
        return Err(ChainError::InvalidTransaction("redelegation to the same validator".into()));
    }
    let mut from = overlay.get_delegation(delegator, src)?;
    if from.amount < amount {
        return Err(ChainError::InsufficientDelegation { need: amount, have: from.amount });
    }
    let mut src_validator = overlay.get_validator(src)?;
    let mut dst_validator = overlay.get_validator(dst)?;
    let mut to = overlay
        .find_delegation(delegator, dst)?
        .unwrap_or_else(|| Delegation::new(*delegator, *dst, 0, height));

    from.amount -= amount;
    src_validator.sub_voting_power(amount);
    to.amount = to.amount.checked_add(amount).ok_or(ChainError::Overflow)?;
    dst_validator.add_voting_power(amount)?;

    overlay.set_delegation(from);
    overlay.set_delegation(to);
    overlay.set_validator(src_validator);
    overlay.set_validator(dst_validator);
    Ok(())
}
