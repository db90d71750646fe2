//! Transient write buffer over the ledger store.
//!
//! Every multi-step mutation (a transaction, a whole block, a staking
//! request) runs against a `StateOverlay`. Reads fall through to the store,
//! writes stay in memory until the overlay is turned into `StateChanges` and
//! committed as one batch. Dropping an overlay discards its writes.

use std::collections::BTreeMap;

use apex_storage::WriteBatch;

use super::keys;
use super::model::{Account, Delegation, UnbondingDelegation, Validator};
use super::state_root::compute_state_root;
use super::StateStore;
use crate::error::{ChainError, Result};
use crate::types::{Address, Hash};

/// Buffered effects of one overlay, ready to be committed.
#[derive(Debug, Clone, Default)]
pub struct StateChanges {
    pub accounts: BTreeMap<Address, Account>,
    pub validators: BTreeMap<Address, Validator>,
    /// `None` marks a deleted delegation
    pub delegations: BTreeMap<(Address, Address), Option<Delegation>>,
    /// empty vector removes the delegator's queue
    pub unbonding: BTreeMap<Address, Vec<UnbondingDelegation>>,
    pub raw: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl StateChanges {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.validators.is_empty()
            && self.delegations.is_empty()
            && self.unbonding.is_empty()
            && self.raw.is_empty()
    }

    /// Encoded key/value writes; `None` values are deletions.
    pub fn encoded(&self) -> Result<BTreeMap<Vec<u8>, Option<Vec<u8>>>> {
        let mut out = BTreeMap::new();
        for (addr, acc) in &self.accounts {
            out.insert(keys::account_key(addr), Some(bincode::serialize(acc)?));
        }
        for (addr, val) in &self.validators {
            out.insert(keys::validator_key(addr), Some(bincode::serialize(val)?));
        }
        for ((delegator, validator), del) in &self.delegations {
            let value = match del {
                Some(d) => Some(bincode::serialize(d)?),
                None => None,
            };
            out.insert(keys::bonded_key(validator, delegator), value.clone());
            out.insert(keys::delegation_key(delegator, validator), value);
        }
        for (delegator, entries) in &self.unbonding {
            let value = if entries.is_empty() { None } else { Some(bincode::serialize(entries)?) };
            out.insert(keys::unbonding_key(delegator), value);
        }
        for (key, value) in &self.raw {
            out.insert(key.clone(), value.clone());
        }
        Ok(out)
    }

    pub fn to_batch(&self) -> Result<WriteBatch> {
        let mut batch = WriteBatch::new();
        for (key, value) in self.encoded()? {
            match value {
                Some(v) => batch.put(key, v),
                None => batch.delete(key),
            }
        }
        Ok(batch)
    }
}

pub struct StateOverlay<'a> {
    store: &'a StateStore,
    changes: StateChanges,
}

impl<'a> StateOverlay<'a> {
    pub fn new(store: &'a StateStore) -> Self {
        Self { store, changes: StateChanges::default() }
    }

    pub fn store(&self) -> &'a StateStore {
        self.store
    }

    pub fn changes(&self) -> &StateChanges {
        &self.changes
    }

    pub fn into_changes(self) -> StateChanges {
        self.changes
    }

    /// Copy of the buffered writes, to be handed back to [`rollback`].
    ///
    /// [`rollback`]: StateOverlay::rollback
    pub fn checkpoint(&self) -> StateChanges {
        self.changes.clone()
    }

    pub fn rollback(&mut self, checkpoint: StateChanges) {
        self.changes = checkpoint;
    }

    /* --- accounts --- */

    pub fn find_account(&self, addr: &Address) -> Result<Option<Account>> {
        if let Some(acc) = self.changes.accounts.get(addr) {
            return Ok(Some(acc.clone()));
        }
        self.store.find_account(addr)
    }

    pub fn get_account(&self, addr: &Address) -> Result<Account> {
        self.find_account(addr)?.ok_or(ChainError::AccountNotFound(*addr))
    }

    /// Missing accounts are created lazily with zero balances.
    pub fn get_or_create_account(&self, addr: &Address) -> Result<Account> {
        Ok(self.find_account(addr)?.unwrap_or_else(|| Account::new(*addr)))
    }

    pub fn set_account(&mut self, account: Account) {
        self.changes.accounts.insert(account.address, account);
    }

    /* --- validators --- */

    pub fn find_validator(&self, addr: &Address) -> Result<Option<Validator>> {
        if let Some(v) = self.changes.validators.get(addr) {
            return Ok(Some(v.clone()));
        }
        self.store.find_validator(addr)
    }

    pub fn get_validator(&self, addr: &Address) -> Result<Validator> {
        self.find_validator(addr)?.ok_or(ChainError::ValidatorNotFound(*addr))
    }

    pub fn set_validator(&mut self, validator: Validator) {
        self.changes.validators.insert(validator.address, validator);
    }

    /// All validators, ordered by address.
    pub fn all_validators(&self) -> Result<Vec<Validator>> {
        let mut merged: BTreeMap<Address, Validator> = self
            .store
            .get_all_validators()?
            .into_iter()
            .map(|v| (v.address, v))
            .collect();
        for (addr, v) in &self.changes.validators {
            merged.insert(*addr, v.clone());
        }
        Ok(merged.into_values().collect())
    }

    /* --- delegations --- */

    pub fn find_delegation(&self, delegator: &Address, validator: &Address) -> Result<Option<Delegation>> {
        if let Some(entry) = self.changes.delegations.get(&(*delegator, *validator)) {
            return Ok(entry.clone());
        }
        self.store.find_delegation(delegator, validator)
    }

    pub fn get_delegation(&self, delegator: &Address, validator: &Address) -> Result<Delegation> {
        self.find_delegation(delegator, validator)?.ok_or(ChainError::DelegationNotFound {
            delegator: *delegator,
            validator: *validator,
        })
    }

    /// Stores the delegation, or removes it once it is empty.
    pub fn set_delegation(&mut self, delegation: Delegation) {
        let key = (delegation.delegator, delegation.validator);
        if delegation.is_empty() {
            self.changes.delegations.insert(key, None);
        } else {
            self.changes.delegations.insert(key, Some(delegation));
        }
    }

    /// Delegations bonded to `validator`, ordered by delegator address.
    pub fn delegations_of(&self, validator: &Address) -> Result<Vec<Delegation>> {
        let mut merged: BTreeMap<Address, Delegation> = self
            .store
            .get_delegations_of(validator)?
            .into_iter()
            .map(|d| (d.delegator, d))
            .collect();
        for ((delegator, val), entry) in &self.changes.delegations {
            if val != validator {
                continue;
            }
            match entry {
                Some(d) => {
                    merged.insert(*delegator, d.clone());
                }
                None => {
                    merged.remove(delegator);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Delegations made by `delegator`, ordered by validator address.
    pub fn delegations_by(&self, delegator: &Address) -> Result<Vec<Delegation>> {
        let mut merged: BTreeMap<Address, Delegation> = self
            .store
            .get_delegations_by(delegator)?
            .into_iter()
            .map(|d| (d.validator, d))
            .collect();
        for ((del, validator), entry) in &self.changes.delegations {
            if del != delegator {
                continue;
            }
            match entry {
                Some(d) => {
                    merged.insert(*validator, d.clone());
                }
                None => {
                    merged.remove(validator);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    /* --- unbonding queue --- */

    pub fn get_unbonding(&self, delegator: &Address) -> Result<Vec<UnbondingDelegation>> {
        if let Some(entries) = self.changes.unbonding.get(delegator) {
            return Ok(entries.clone());
        }
        self.store.get_unbonding(delegator)
    }

    pub fn set_unbonding(&mut self, delegator: Address, entries: Vec<UnbondingDelegation>) {
        self.changes.unbonding.insert(delegator, entries);
    }

    pub fn push_unbonding(&mut self, entry: UnbondingDelegation) -> Result<()> {
        let mut entries = self.get_unbonding(&entry.delegator)?;
        let delegator = entry.delegator;
        entries.push(entry);
        self.set_unbonding(delegator, entries);
        Ok(())
    }

    /// Delegators with a non-empty unbonding queue, ordered by address.
    pub fn unbonding_delegators(&self) -> Result<Vec<Address>> {
        let mut set: BTreeMap<Address, bool> = self
            .store
            .get_all_unbonding()?
            .into_iter()
            .map(|e| (e.delegator, true))
            .collect();
        for (delegator, entries) in &self.changes.unbonding {
            set.insert(*delegator, !entries.is_empty());
        }
        Ok(set.into_iter().filter(|(_, live)| *live).map(|(a, _)| a).collect())
    }

    /* --- raw entries --- */

    pub fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.changes.raw.get(key) {
            return Ok(v.clone());
        }
        Ok(self.store.kv().get(key)?)
    }

    pub fn put_raw(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.changes.raw.insert(key, Some(value));
    }

    /// Number of stored and buffered raw entries under `prefix`.
    pub fn count_raw_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let mut keys: std::collections::BTreeSet<Vec<u8>> =
            self.store.kv().iterate(prefix)?.into_iter().map(|(k, _)| k).collect();
        for (key, value) in &self.changes.raw {
            if !key.starts_with(prefix) {
                continue;
            }
            if value.is_some() {
                keys.insert(key.clone());
            } else {
                keys.remove(key);
            }
        }
        Ok(keys.len())
    }

    /// State root of the store with this overlay's writes applied.
    pub fn state_root(&self) -> Result<Hash> {
        let mut entries: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for prefix in keys::STATE_ROOT_PREFIXES {
            for (k, v) in self.store.kv().iterate(prefix)? {
                entries.insert(k, v);
            }
        }
        for (key, value) in self.changes.encoded()? {
            if !keys::STATE_ROOT_PREFIXES.iter().any(|p| key.starts_with(p)) {
                continue;
            }
            match value {
                Some(v) => {
                    entries.insert(key, v);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(compute_state_root(entries.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))))
    }
}
