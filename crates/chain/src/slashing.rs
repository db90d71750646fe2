//! Penalties for validator misbehaviour.
//!
//! A slash takes the reason's share (in basis points) of the validator's
//! self-stake and of every delegation bonded to it, each floored on its
//! own. Voting power drops by the sum, so it keeps matching self-stake plus
//! delegations. The slashed stake is burned from the owners' and
//! delegators' `staked` balances.
//!
//! Every slash is recorded as a `SlashingEvent` under
//! `slash:<height>:<seq>` and never rewritten.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SlashingConfig;
use crate::dpos::{DposEngine, StateTxn};
use crate::error::Result;
use crate::state::keys;
use crate::types::{apply_basis_points, Address, Amount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlashingReason {
    DoubleSign,
    Downtime,
    InvalidBlock,
}

impl SlashingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlashingReason::DoubleSign => "double_sign",
            SlashingReason::Downtime => "downtime",
            SlashingReason::InvalidBlock => "invalid_block",
        }
    }

    /// Downtime only jails once the missed-block threshold is reached.
    pub fn jails(&self) -> bool {
        matches!(self, SlashingReason::DoubleSign | SlashingReason::InvalidBlock)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashingEvent {
    pub validator: Address,
    pub reason: SlashingReason,
    /// total stake removed
    pub amount: Amount,
    pub self_stake_penalty: Amount,
    pub delegation_penalty: Amount,
    pub height: u64,
    pub timestamp: DateTime<Utc>,
    pub jailed: bool,
}

#[derive(Debug, Clone)]
pub struct Slasher {
    engine: Arc<DposEngine>,
    config: SlashingConfig,
}

impl Slasher {
    pub fn new(engine: Arc<DposEngine>, config: SlashingConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &SlashingConfig {
        &self.config
    }

    pub fn penalty_bp(&self, reason: SlashingReason) -> u16 {
        match reason {
            SlashingReason::DoubleSign => self.config.double_sign_bp,
            SlashingReason::Downtime => self.config.downtime_bp,
            SlashingReason::InvalidBlock => self.config.invalid_block_bp,
        }
    }

    pub fn slash_validator(
        &self,
        validator: &Address,
        reason: SlashingReason,
        height: u64,
        at: DateTime<Utc>,
    ) -> Result<SlashingEvent> {
        let mut txn = self.engine.begin();
        let event = self.slash_in(&mut txn, validator, reason, height, at)?;
        txn.commit()?;
        Ok(event)
    }

    /// Apply a slash inside an open transaction.
    pub fn slash_in(
        &self,
        txn: &mut StateTxn<'_>,
        validator_addr: &Address,
        reason: SlashingReason,
        height: u64,
        at: DateTime<Utc>,
    ) -> Result<SlashingEvent> {
        self.apply(txn, validator_addr, reason, reason.jails(), height, at)
    }

    fn apply(
        &self,
        txn: &mut StateTxn<'_>,
        validator_addr: &Address,
        reason: SlashingReason,
        jailed: bool,
        height: u64,
        at: DateTime<Utc>,
    ) -> Result<SlashingEvent> {
        let bp = self.penalty_bp(reason);
        let mut validator = txn.get_validator(validator_addr)?;

        let self_stake_penalty = apply_basis_points(validator.self_stake, bp);
        if self_stake_penalty > 0 {
            let mut owner = txn.get_account(validator_addr)?;
            owner.sub_stake(self_stake_penalty)?;
            txn.set_account(owner);
        }

        let mut delegation_penalty: Amount = 0;
        for mut delegation in txn.delegations_of(validator_addr)? {
            let penalty = apply_basis_points(delegation.amount, bp);
            if penalty == 0 {
                continue;
            }
            let mut account = txn.get_account(&delegation.delegator)?;
            account.sub_stake(penalty)?;
            txn.set_account(account);
            delegation.amount -= penalty;
            txn.set_delegation(delegation);
            delegation_penalty += penalty;
        }

        let amount = self_stake_penalty + delegation_penalty;
        validator.self_stake -= self_stake_penalty;
        validator.sub_voting_power(amount);
        if jailed {
            validator.jail(at);
        }
        txn.set_validator(validator);

        let event = SlashingEvent {
            validator: *validator_addr,
            reason,
            amount,
            self_stake_penalty,
            delegation_penalty,
            height,
            timestamp: at,
            jailed,
        };
        self.record_in(txn, &event)?;
        info!(
            validator = %validator_addr,
            reason = reason.as_str(),
            amount,
            height,
            jailed,
            "validator slashed"
        );
        Ok(event)
    }

    fn record_in(&self, txn: &mut StateTxn<'_>, event: &SlashingEvent) -> Result<()> {
        let seq = txn.count_raw_prefix(&keys::slash_height_prefix(event.height))? as u32;
        txn.put_raw(keys::slash_key(event.height, seq), bincode::serialize(event)?);
        Ok(())
    }

    /// Two signatures at the same height by one validator.
    pub fn detect_double_sign(
        &self,
        validator: &Address,
        height_a: u64,
        height_b: u64,
        at: DateTime<Utc>,
    ) -> Result<Option<SlashingEvent>> {
        if height_a != height_b {
            return Ok(None);
        }
        warn!(validator = %validator, height = height_a, "double sign detected");
        self.slash_validator(validator, SlashingReason::DoubleSign, height_a, at).map(Some)
    }

    /// Jail with the downtime penalty once the miss counter reaches the
    /// threshold. Already jailed validators are left alone.
    pub fn check_downtime(&self, validator: &Address, height: u64, at: DateTime<Utc>) -> Result<Option<SlashingEvent>> {
        let mut txn = self.engine.begin();
        let event = self.downtime_in(&mut txn, validator, height, at)?;
        if event.is_some() {
            txn.commit()?;
        }
        Ok(event)
    }

    pub fn record_missed_block(
        &self,
        validator: &Address,
        height: u64,
        at: DateTime<Utc>,
    ) -> Result<Option<SlashingEvent>> {
        let mut txn = self.engine.begin();
        txn.increment_missed_blocks(validator)?;
        let event = self.downtime_in(&mut txn, validator, height, at)?;
        txn.commit()?;
        Ok(event)
    }

    fn downtime_in(
        &self,
        txn: &mut StateTxn<'_>,
        validator_addr: &Address,
        height: u64,
        at: DateTime<Utc>,
    ) -> Result<Option<SlashingEvent>> {
        let validator = txn.get_validator(validator_addr)?;
        if validator.jailed || validator.missed_blocks < self.config.downtime_threshold {
            return Ok(None);
        }
        self.apply(txn, validator_addr, SlashingReason::Downtime, true, height, at).map(Some)
    }

    /// Every recorded event in height order.
    pub fn get_slashing_events(&self) -> Result<Vec<SlashingEvent>> {
        let mut events = Vec::new();
        for (_, value) in self.engine.store().kv().iterate(keys::SLASH_PREFIX)? {
            events.push(bincode::deserialize(&value)?);
        }
        Ok(events)
    }

    pub fn get_validator_slashing_history(&self, validator: &Address) -> Result<Vec<SlashingEvent>> {
        Ok(self
            .get_slashing_events()?
            .into_iter()
            .filter(|e| &e.validator == validator)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use crate::error::ChainError;
    use crate::state::{Account, StateStore, Validator};
    use crate::types::ONE_TOKEN;
    use apex_storage::MemoryKv;

    fn setup(tokens: u128) -> (Arc<DposEngine>, Slasher, Address) {
        let config = ChainConfig::default();
        let store = Arc::new(StateStore::new(Arc::new(MemoryKv::new())));
        let engine = Arc::new(DposEngine::open(store, &config).unwrap());
        let addr = Address::from_bytes([5; 20]);
        let stake = tokens * ONE_TOKEN;
        engine.store().set_account(&Account::with_balance(addr, stake)).unwrap();
        engine.register_validator(Validator::new(addr, vec![5; 32], stake, 0), 0).unwrap();
        engine.select_validators().unwrap();
        let slasher = Slasher::new(engine.clone(), config.slashing);
        (engine, slasher, addr)
    }

    #[test]
    fn downtime_slash_is_exactly_one_percent() {
        let (engine, slasher, addr) = setup(1_000_000);
        let event = slasher.slash_validator(&addr, SlashingReason::Downtime, 7, Utc::now()).unwrap();

        assert_eq!(event.amount, 10_000 * ONE_TOKEN);
        assert!(!event.jailed);
        let v = engine.get_validator(&addr).unwrap();
        assert_eq!(v.voting_power, 990_000 * ONE_TOKEN);
        assert_eq!(v.self_stake, 990_000 * ONE_TOKEN);
        assert_eq!(engine.store().get_account(&addr).unwrap().staked, 990_000 * ONE_TOKEN);
        assert!(engine.is_active_validator(&addr));
    }

    #[test]
    fn double_sign_penalises_delegators_and_jails() {
        let (engine, slasher, addr) = setup(100_000);
        let d = Address::from_bytes([1; 20]);
        engine.store().set_account(&Account::with_balance(d, 1_000 * ONE_TOKEN)).unwrap();
        engine.delegate(&d, &addr, 1_000 * ONE_TOKEN, 1).unwrap();

        assert!(slasher.detect_double_sign(&addr, 3, 4, Utc::now()).unwrap().is_none());
        let event = slasher.detect_double_sign(&addr, 5, 5, Utc::now()).unwrap().unwrap();
        assert_eq!(event.self_stake_penalty, 5_000 * ONE_TOKEN);
        assert_eq!(event.delegation_penalty, 50 * ONE_TOKEN);
        assert!(event.jailed);

        let v = engine.get_validator(&addr).unwrap();
        assert!(v.jailed);
        assert_eq!(v.voting_power, v.self_stake + 950 * ONE_TOKEN);
        assert_eq!(engine.get_delegation(&d, &addr).unwrap().amount, 950 * ONE_TOKEN);
        assert_eq!(engine.store().get_account(&d).unwrap().staked, 950 * ONE_TOKEN);
        assert!(engine.get_active_set().is_empty());
    }

    #[test]
    fn downtime_threshold_jails_once() {
        let (engine, slasher, addr) = setup(100_000);
        let threshold = slasher.config().downtime_threshold;
        for h in 1..threshold {
            assert!(slasher.record_missed_block(&addr, h, Utc::now()).unwrap().is_none());
        }
        let event = slasher.record_missed_block(&addr, threshold, Utc::now()).unwrap().unwrap();
        assert_eq!(event.reason, SlashingReason::Downtime);
        assert!(event.jailed);
        assert!(engine.get_validator(&addr).unwrap().jailed);
        assert!(slasher.check_downtime(&addr, threshold + 1, Utc::now()).unwrap().is_none());

        let history = slasher.get_validator_slashing_history(&addr).unwrap();
        assert_eq!(history, vec![event]);
    }

    #[test]
    fn events_are_kept_in_height_order() {
        let (_, slasher, addr) = setup(100_000);
        slasher.slash_validator(&addr, SlashingReason::Downtime, 20, Utc::now()).unwrap();
        slasher.slash_validator(&addr, SlashingReason::Downtime, 3, Utc::now()).unwrap();
        slasher.slash_validator(&addr, SlashingReason::InvalidBlock, 3, Utc::now()).unwrap();

        let events = slasher.get_slashing_events().unwrap();
        let order: Vec<(u64, SlashingReason)> = events.iter().map(|e| (e.height, e.reason)).collect();
        assert_eq!(
            order,
            vec![
                (3, SlashingReason::Downtime),
                (3, SlashingReason::InvalidBlock),
                (20, SlashingReason::Downtime),
            ]
        );
    }

    #[test]
    fn unknown_validator_is_not_found() {
        let (_, slasher, _) = setup(100_000);
        let err = slasher
            .slash_validator(&Address::from_bytes([9; 20]), SlashingReason::Downtime, 1, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ChainError::ValidatorNotFound(_)));
    }
}
