//! Delegated proof of stake engine.
//!
//! `DposEngine` keeps an in-memory registry of validators, delegations, the
//! active set and the current epoch, mirrored from the ledger store. All
//! mutations go through a [`StateTxn`]: it holds the engine's mutation lock
//! for its whole lifetime, buffers writes in a [`StateOverlay`], and on
//! commit writes one batch to the store before refreshing the registry.
//!
//! ## Lock order
//!
//! `mutation` (held by a `StateTxn`) is always taken before `registry`.
//! Readers only take `registry` and never block on a running transaction
//! except for the short registry refresh at commit time.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use apex_storage::WriteBatch;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use crate::block::Block;
use crate::config::{ChainConfig, ConsensusConfig};
use crate::epoch::{rank_validators, should_rotate, EpochConfig, EpochInfo};
use crate::error::{ChainError, Result};
use crate::executor;
use crate::state::keys::{ACTIVE_SET_KEY, EPOCH_KEY};
use crate::state::{Delegation, StateChanges, StateOverlay, StateStore, UnbondingDelegation, Validator, ValidatorStatus};
use crate::tx::EditValidatorData;
use crate::types::{Address, Amount};

#[derive(Debug, Default)]
struct Registry {
    validators: BTreeMap<Address, Validator>,
    delegations: BTreeMap<(Address, Address), Delegation>,
    active_set: Vec<Address>,
    epoch: EpochInfo,
}

impl Registry {
    fn apply(&mut self, changes: &StateChanges) {
        for (addr, v) in &changes.validators {
            self.validators.insert(*addr, v.clone());
        }
        for (key, entry) in &changes.delegations {
            match entry {
                Some(d) => {
                    self.delegations.insert(*key, d.clone());
                }
                None => {
                    self.delegations.remove(key);
                }
            }
        }
    }
}

pub struct DposEngine {
    store: Arc<StateStore>,
    consensus: ConsensusConfig,
    epoch_config: EpochConfig,
    jail_duration: Duration,
    registry: RwLock<Registry>,
    mutation: Mutex<()>,
}

impl std::fmt::Debug for DposEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reg = self.registry.read();
        f.debug_struct("DposEngine")
            .field("validators", &reg.validators.len())
            .field("active_set", &reg.active_set.len())
            .field("epoch", &reg.epoch.epoch_number)
            .finish()
    }
}

impl DposEngine {
    /// Load the registry from the store. A store without a persisted active
    /// set gets one selected from the stored validators.
    pub fn open(store: Arc<StateStore>, config: &ChainConfig) -> Result<Self> {
        let mut registry = Registry::default();
        for v in store.get_all_validators()? {
            registry.validators.insert(v.address, v);
        }
        for d in store.get_all_delegations()? {
            registry.delegations.insert((d.delegator, d.validator), d);
        }
        let ranked: Vec<Validator> = registry.validators.values().cloned().collect();
        registry.active_set = match store.load_active_set()? {
            Some(set) => set,
            None => rank_validators(&ranked, config.consensus.min_validator_stake, config.consensus.max_validators),
        };
        registry.epoch = store.load_epoch()?.unwrap_or_default();

        debug!(
            validators = registry.validators.len(),
            active = registry.active_set.len(),
            epoch = registry.epoch.epoch_number,
            "dpos registry loaded"
        );

        Ok(Self {
            store,
            consensus: config.consensus.clone(),
            epoch_config: config.epoch(),
            jail_duration: Duration::seconds(config.slashing.jail_duration_secs),
            registry: RwLock::new(registry),
            mutation: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn consensus(&self) -> &ConsensusConfig {
        &self.consensus
    }

    /// Start a transaction. Blocks while another one is running.
    pub fn begin(&self) -> StateTxn<'_> {
        let guard = self.mutation.lock();
        StateTxn {
            engine: self,
            overlay: self.store.overlay(),
            active_set: None,
            epoch: None,
            _guard: guard,
        }
    }

    // ============================================================
    // MUTATIONS
    // ============================================================

    pub fn register_validator(&self, validator: Validator, height: u64) -> Result<()> {
        let mut txn = self.begin();
        txn.register_validator(validator, height)?;
        txn.commit()?;
        Ok(())
    }

    pub fn delegate(&self, delegator: &Address, validator: &Address, amount: Amount, height: u64) -> Result<Delegation> {
        let mut txn = self.begin();
        let delegation = txn.delegate(delegator, validator, amount, height)?;
        txn.commit()?;
        Ok(delegation)
    }

    pub fn undelegate(
        &self,
        delegator: &Address,
        validator: &Address,
        amount: Amount,
        height: u64,
    ) -> Result<UnbondingDelegation> {
        let mut txn = self.begin();
        let entry = txn.undelegate(delegator, validator, amount, height)?;
        txn.commit()?;
        Ok(entry)
    }

    /// Recompute and install the active set.
    pub fn select_validators(&self) -> Result<Vec<Address>> {
        let mut txn = self.begin();
        let set = txn.select_validators()?;
        txn.commit()?;
        Ok(set)
    }

    /// Rotate the epoch when `height` is a boundary. Returns whether it did.
    pub fn update_epoch(&self, height: u64) -> Result<bool> {
        let mut txn = self.begin();
        let rotated = txn.update_epoch(height)?;
        if rotated {
            txn.commit()?;
        }
        Ok(rotated)
    }

    pub fn edit_validator(&self, owner: &Address, edit: EditValidatorData) -> Result<Validator> {
        let mut txn = self.begin();
        let v = executor::edit_validator(&mut txn, owner, edit)?;
        txn.commit()?;
        Ok(v)
    }

    pub fn jail_validator(&self, addr: &Address, at: DateTime<Utc>) -> Result<()> {
        let mut txn = self.begin();
        txn.jail(addr, at)?;
        txn.commit()?;
        Ok(())
    }

    /// Lift a jail once the cooldown has passed. The validator rejoins the
    /// active set at the next selection.
    pub fn unjail_validator(&self, addr: &Address, now: DateTime<Utc>) -> Result<()> {
        let mut txn = self.begin();
        let mut v = txn.get_validator(addr)?;
        if !v.jailed {
            return Err(ChainError::NotJailed(*addr));
        }
        if let Some(jailed_at) = v.jailed_at {
            let until = jailed_at + self.jail_duration;
            if now < until {
                return Err(ChainError::StillJailed { address: *addr, until: until.to_rfc3339() });
            }
        }
        v.jailed = false;
        v.jailed_at = None;
        v.status = ValidatorStatus::Active;
        v.missed_blocks = 0;
        txn.set_validator(v);
        txn.commit()?;
        info!(validator = %addr, "validator unjailed");
        Ok(())
    }

    pub fn increment_missed_blocks(&self, addr: &Address) -> Result<u64> {
        let mut txn = self.begin();
        let missed = txn.increment_missed_blocks(addr)?;
        txn.commit()?;
        Ok(missed)
    }

    pub fn increment_produced_blocks(&self, addr: &Address) -> Result<u64> {
        let mut txn = self.begin();
        let produced = txn.increment_produced_blocks(addr)?;
        txn.commit()?;
        Ok(produced)
    }

    // ============================================================
    // SCHEDULING
    // ============================================================

    /// `active[height mod len]`
    pub fn get_block_producer(&self, height: u64) -> Result<Address> {
        let reg = self.registry.read();
        producer_at(&reg.active_set, height)
    }

    /// Consensus checks for a block produced at `block.height()`.
    pub fn validate_block(&self, block: &Block, now: DateTime<Utc>) -> Result<()> {
        let height = block.height();
        let expected = self.get_block_producer(height)?;
        let producer = block.header.producer;
        if producer != expected {
            return Err(ChainError::WrongProducer { height, expected, got: producer });
        }
        if !self.is_active_validator(&producer) {
            return Err(ChainError::InactiveValidator(producer));
        }
        let oldest = now - Duration::seconds(self.consensus.max_block_age_secs);
        if block.header.timestamp < oldest {
            return Err(ChainError::StaleBlock(format!(
                "block {} timestamp {} older than {}",
                height,
                block.header.timestamp.to_rfc3339(),
                oldest.to_rfc3339()
            )));
        }
        Ok(())
    }

    // ============================================================
    // QUERIES
    // ============================================================

    pub fn get_validator(&self, addr: &Address) -> Option<Validator> {
        self.registry.read().validators.get(addr).cloned()
    }

    /// All validators, ordered by address.
    pub fn get_validators(&self) -> Vec<Validator> {
        self.registry.read().validators.values().cloned().collect()
    }

    /// Active validators in schedule order.
    pub fn get_active_validators(&self) -> Vec<Validator> {
        let reg = self.registry.read();
        reg.active_set.iter().filter_map(|a| reg.validators.get(a).cloned()).collect()
    }

    pub fn get_active_set(&self) -> Vec<Address> {
        self.registry.read().active_set.clone()
    }

    pub fn is_active_validator(&self, addr: &Address) -> bool {
        let reg = self.registry.read();
        reg.active_set.contains(addr)
            && reg.validators.get(addr).map_or(false, |v| v.status == ValidatorStatus::Active && !v.jailed)
    }

    pub fn get_delegation(&self, delegator: &Address, validator: &Address) -> Option<Delegation> {
        self.registry.read().delegations.get(&(*delegator, *validator)).cloned()
    }

    /// Delegations to `validator`, ordered by delegator.
    pub fn get_delegations_of(&self, validator: &Address) -> Vec<Delegation> {
        let mut out: Vec<Delegation> = self
            .registry
            .read()
            .delegations
            .values()
            .filter(|d| &d.validator == validator)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.delegator.cmp(&b.delegator));
        out
    }

    /// Delegations made by `delegator`, ordered by validator.
    pub fn get_delegations_by(&self, delegator: &Address) -> Vec<Delegation> {
        self.registry
            .read()
            .delegations
            .range((*delegator, Address::default())..)
            .take_while(|((d, _), _)| d == delegator)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Voting power summed over the active set.
    pub fn total_voting_power(&self) -> Amount {
        let reg = self.registry.read();
        reg.active_set
            .iter()
            .filter_map(|a| reg.validators.get(a))
            .map(|v| v.voting_power)
            .sum()
    }

    pub fn current_epoch(&self) -> EpochInfo {
        self.registry.read().epoch.clone()
    }

    /// Lifetime share of produced blocks in percent; 100 before any block
    /// was due.
    pub fn uptime(&self, addr: &Address) -> Result<f64> {
        let v = self.get_validator(addr).ok_or(ChainError::ValidatorNotFound(*addr))?;
        let total = v.produced_blocks + v.total_missed_blocks;
        if total == 0 {
            return Ok(100.0);
        }
        Ok(v.produced_blocks as f64 / total as f64 * 100.0)
    }
}

fn producer_at(active_set: &[Address], height: u64) -> Result<Address> {
    if active_set.is_empty() {
        return Err(ChainError::NoActiveValidators);
    }
    Ok(active_set[(height % active_set.len() as u64) as usize])
}

/// One critical section over the ledger and the registry.
///
/// Dereferences to the underlying [`StateOverlay`], so executor and reward
/// code can run against it directly. Dropping without `commit` discards
/// every write.
pub struct StateTxn<'a> {
    engine: &'a DposEngine,
    overlay: StateOverlay<'a>,
    active_set: Option<Vec<Address>>,
    epoch: Option<EpochInfo>,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> Deref for StateTxn<'a> {
    type Target = StateOverlay<'a>;

    fn deref(&self) -> &Self::Target {
        &self.overlay
    }
}

impl<'a> DerefMut for StateTxn<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.overlay
    }
}

impl<'a> StateTxn<'a> {
    /// Active set as seen by this transaction.
    pub fn active_set(&self) -> Vec<Address> {
        match &self.active_set {
            Some(set) => set.clone(),
            None => self.engine.registry.read().active_set.clone(),
        }
    }

    pub fn current_epoch(&self) -> EpochInfo {
        match &self.epoch {
            Some(e) => e.clone(),
            None => self.engine.registry.read().epoch.clone(),
        }
    }

    pub fn block_producer(&self, height: u64) -> Result<Address> {
        producer_at(&self.active_set(), height)
    }

    pub fn register_validator(&mut self, validator: Validator, height: u64) -> Result<()> {
        let min_stake = self.engine.consensus.min_validator_stake;
        executor::register_validator(&mut self.overlay, validator, min_stake, height)
    }

    pub fn delegate(&mut self, delegator: &Address, validator: &Address, amount: Amount, height: u64) -> Result<Delegation> {
        executor::delegate(&mut self.overlay, delegator, validator, amount, height)
    }

    pub fn undelegate(
        &mut self,
        delegator: &Address,
        validator: &Address,
        amount: Amount,
        height: u64,
    ) -> Result<UnbondingDelegation> {
        let period = self.engine.consensus.unbonding_period;
        executor::undelegate(&mut self.overlay, delegator, validator, amount, height, period)
    }

    /// Rank every validator visible to this transaction and stage the result
    /// as the new active set.
    pub fn select_validators(&mut self) -> Result<Vec<Address>> {
        let validators = self.overlay.all_validators()?;
        let set = rank_validators(
            &validators,
            self.engine.consensus.min_validator_stake,
            self.engine.epoch_config.max_validators,
        );
        self.active_set = Some(set.clone());
        Ok(set)
    }

    pub fn update_epoch(&mut self, height: u64) -> Result<bool> {
        if !should_rotate(height, &self.engine.epoch_config) {
            return Ok(false);
        }
        let set = self.select_validators()?;
        let mut total_stake: Amount = 0;
        for addr in &set {
            total_stake = total_stake.saturating_add(self.overlay.get_validator(addr)?.voting_power);
        }
        let mut epoch = self.current_epoch();
        let next = epoch.epoch_number + 1;
        epoch.rotate(next, height, set.len(), total_stake);
        info!(epoch = next, height, active = set.len(), "epoch rotated");
        self.epoch = Some(epoch);
        Ok(true)
    }

    /// Stage epoch bookkeeping directly (genesis).
    pub fn set_epoch(&mut self, epoch: EpochInfo) {
        self.epoch = Some(epoch);
    }

    pub fn jail(&mut self, addr: &Address, at: DateTime<Utc>) -> Result<()> {
        let mut v = self.overlay.get_validator(addr)?;
        v.jail(at);
        self.overlay.set_validator(v);
        info!(validator = %addr, "validator jailed");
        Ok(())
    }

    pub fn increment_missed_blocks(&mut self, addr: &Address) -> Result<u64> {
        let mut v = self.overlay.get_validator(addr)?;
        v.missed_blocks += 1;
        v.total_missed_blocks += 1;
        let missed = v.missed_blocks;
        self.overlay.set_validator(v);
        Ok(missed)
    }

    /// Counts a produced block and resets the consecutive miss counter.
    pub fn increment_produced_blocks(&mut self, addr: &Address) -> Result<u64> {
        let mut v = self.overlay.get_validator(addr)?;
        v.produced_blocks += 1;
        v.missed_blocks = 0;
        let produced = v.produced_blocks;
        self.overlay.set_validator(v);
        Ok(produced)
    }

    pub fn commit(self) -> Result<StateChanges> {
        self.commit_with(WriteBatch::new())
    }

    /// Write the ledger changes plus `extra` in one batch, then refresh the
    /// registry. Jailed validators leave the active set here.
    pub fn commit_with(mut self, extra: WriteBatch) -> Result<StateChanges> {
        let current = self.active_set();
        let jailed: Vec<Address> = self
            .overlay
            .changes()
            .validators
            .values()
            .filter(|v| v.jailed)
            .map(|v| v.address)
            .collect();
        if jailed.iter().any(|a| current.contains(a)) {
            let filtered: Vec<Address> = current.into_iter().filter(|a| !jailed.contains(a)).collect();
            self.active_set = Some(filtered);
        }
        if let Some(set) = &self.active_set {
            self.overlay.put_raw(ACTIVE_SET_KEY.to_vec(), bincode::serialize(set)?);
        }
        if let Some(epoch) = &self.epoch {
            self.overlay.put_raw(EPOCH_KEY.to_vec(), bincode::serialize(epoch)?);
        }

        let StateTxn { engine, overlay, active_set, epoch, _guard } = self;
        let changes = overlay.into_changes();

        let mut registry = engine.registry.write();
        engine.store.commit_with(&changes, extra)?;
        registry.apply(&changes);
        if let Some(set) = active_set {
            registry.active_set = set;
        }
        if let Some(epoch) = epoch {
            registry.epoch = epoch;
        }
        Ok(changes)
    }
}
