//! Ledger Store: typed access to accounts, validators, delegations and the
//! unbonding queue on top of the ordered key-value collaborator.
//!
//! Single `set_*` calls are durable once they return. Related writes go
//! through a [`StateOverlay`] and [`StateStore::commit`], which writes one
//! atomic batch.

use std::sync::Arc;

use apex_storage::{KvStore, WriteBatch};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

pub mod keys;
pub mod model;
pub mod overlay;
pub mod state_root;

pub use model::{Account, Delegation, UnbondingDelegation, Validator, ValidatorStatus};
pub use overlay::{StateChanges, StateOverlay};

use crate::epoch::EpochInfo;
use crate::error::{ChainError, Result};
use crate::types::{Address, Hash};

#[derive(Debug, Clone)]
pub struct StateStore {
    kv: Arc<dyn KvStore>,
}

impl StateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn overlay(&self) -> StateOverlay<'_> {
        StateOverlay::new(self)
    }

    fn read<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.kv.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write<T: Serialize>(&self, key: &[u8], value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.kv.put(key, &bytes)?;
        Ok(())
    }

    fn read_prefix<T: DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<T>> {
        self.kv
            .iterate(prefix)?
            .into_iter()
            .map(|(_, v)| bincode::deserialize(&v).map_err(ChainError::from))
            .collect()
    }

    // ============================================================
    // ACCOUNTS
    // ============================================================

    pub fn find_account(&self, addr: &Address) -> Result<Option<Account>> {
        self.read(&keys::account_key(addr))
    }

    pub fn get_account(&self, addr: &Address) -> Result<Account> {
        self.find_account(addr)?.ok_or(ChainError::AccountNotFound(*addr))
    }

    pub fn set_account(&self, account: &Account) -> Result<()> {
        self.write(&keys::account_key(&account.address), account)
    }

    pub fn get_all_accounts(&self) -> Result<Vec<Account>> {
        self.read_prefix(keys::ACCOUNT_PREFIX)
    }

    // ============================================================
    // VALIDATORS
    // ============================================================

    pub fn find_validator(&self, addr: &Address) -> Result<Option<Validator>> {
        self.read(&keys::validator_key(addr))
    }

    pub fn get_validator(&self, addr: &Address) -> Result<Validator> {
        self.find_validator(addr)?.ok_or(ChainError::ValidatorNotFound(*addr))
    }

    pub fn set_validator(&self, validator: &Validator) -> Result<()> {
        self.write(&keys::validator_key(&validator.address), validator)
    }

    /// Every registered validator. Callers must not rely on any order.
    pub fn get_all_validators(&self) -> Result<Vec<Validator>> {
        self.read_prefix(keys::VALIDATOR_PREFIX)
    }

    // ============================================================
    // DELEGATIONS
    // ============================================================

    pub fn find_delegation(&self, delegator: &Address, validator: &Address) -> Result<Option<Delegation>> {
        self.read(&keys::delegation_key(delegator, validator))
    }

    pub fn get_delegation(&self, delegator: &Address, validator: &Address) -> Result<Delegation> {
        self.find_delegation(delegator, validator)?.ok_or(ChainError::DelegationNotFound {
            delegator: *delegator,
            validator: *validator,
        })
    }

    pub fn set_delegation(&self, delegation: &Delegation) -> Result<()> {
        let bytes = bincode::serialize(delegation)?;
        let mut batch = WriteBatch::new();
        batch.put(keys::bonded_key(&delegation.validator, &delegation.delegator), bytes.clone());
        batch.put(keys::delegation_key(&delegation.delegator, &delegation.validator), bytes);
        self.kv.write_batch(batch)?;
        Ok(())
    }

    pub fn delete_delegation(&self, delegator: &Address, validator: &Address) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(keys::bonded_key(validator, delegator));
        batch.delete(keys::delegation_key(delegator, validator));
        self.kv.write_batch(batch)?;
        Ok(())
    }

    pub fn get_all_delegations(&self) -> Result<Vec<Delegation>> {
        self.read_prefix(keys::DELEGATION_PREFIX)
    }

    /// Delegations made by `delegator`, ordered by validator address.
    pub fn get_delegations_by(&self, delegator: &Address) -> Result<Vec<Delegation>> {
        self.read_prefix(&keys::delegator_prefix(delegator))
    }

    /// Delegations bonded to `validator`, ordered by delegator address.
    pub fn get_delegations_of(&self, validator: &Address) -> Result<Vec<Delegation>> {
        self.read_prefix(&keys::bonded_prefix(validator))
    }

    // ============================================================
    // UNBONDING QUEUE
    // ============================================================

    pub fn get_unbonding(&self, delegator: &Address) -> Result<Vec<UnbondingDelegation>> {
        Ok(self.read(&keys::unbonding_key(delegator))?.unwrap_or_default())
    }

    pub fn get_all_unbonding(&self) -> Result<Vec<UnbondingDelegation>> {
        let queues: Vec<Vec<UnbondingDelegation>> = self.read_prefix(keys::UNBONDING_PREFIX)?;
        Ok(queues.into_iter().flatten().collect())
    }

    // ============================================================
    // DPOS METADATA
    // ============================================================

    pub fn load_active_set(&self) -> Result<Option<Vec<Address>>> {
        self.read(keys::ACTIVE_SET_KEY)
    }

    pub fn load_epoch(&self) -> Result<Option<EpochInfo>> {
        self.read(keys::EPOCH_KEY)
    }

    // ============================================================
    // ROOT + COMMIT
    // ============================================================

    pub fn state_root(&self) -> Result<Hash> {
        self.overlay().state_root()
    }

    /// Write all buffered changes in one atomic batch.
    pub fn commit(&self, changes: &StateChanges) -> Result<()> {
        self.commit_with(changes, WriteBatch::new())
    }

    /// Like [`StateStore::commit`], with extra non-ledger writes (block
    /// archive entries) landing in the same batch.
    pub fn commit_with(&self, changes: &StateChanges, extra: WriteBatch) -> Result<()> {
        if changes.is_empty() && extra.is_empty() {
            return Ok(());
        }
        let mut batch = changes.to_batch()?;
        batch.extend(extra);
        let ops = batch.len();
        self.kv.write_batch(batch)?;
        debug!(ops, "state changes committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apex_storage::MemoryKv;

    fn store() -> StateStore {
        StateStore::new(Arc::new(MemoryKv::new()))
    }

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 20])
    }

    #[test]
    fn account_set_get_and_not_found() {
        let s = store();
        assert!(matches!(s.get_account(&addr(1)), Err(ChainError::AccountNotFound(_))));
        s.set_account(&Account::with_balance(addr(1), 500)).unwrap();
        assert_eq!(s.get_account(&addr(1)).unwrap().balance, 500);
    }

    #[test]
    fn overlay_is_invisible_until_commit() {
        let s = store();
        s.set_account(&Account::with_balance(addr(1), 10)).unwrap();

        let mut ov = s.overlay();
        let mut acc = ov.get_account(&addr(1)).unwrap();
        acc.balance = 99;
        ov.set_account(acc);
        assert_eq!(ov.get_account(&addr(1)).unwrap().balance, 99);
        assert_eq!(s.get_account(&addr(1)).unwrap().balance, 10);

        let changes = ov.into_changes();
        s.commit(&changes).unwrap();
        assert_eq!(s.get_account(&addr(1)).unwrap().balance, 99);
    }

    #[test]
    fn rollback_discards_writes_after_checkpoint() {
        let s = store();
        let mut ov = s.overlay();
        ov.set_account(Account::with_balance(addr(1), 1));
        let cp = ov.checkpoint();
        ov.set_account(Account::with_balance(addr(1), 2));
        ov.set_account(Account::with_balance(addr(2), 3));
        ov.rollback(cp);

        assert_eq!(ov.get_account(&addr(1)).unwrap().balance, 1);
        assert!(ov.find_account(&addr(2)).unwrap().is_none());
    }

    #[test]
    fn empty_delegation_is_deleted_on_commit() {
        let s = store();
        s.set_delegation(&Delegation::new(addr(1), addr(9), 100, 0)).unwrap();

        let mut ov = s.overlay();
        let mut d = ov.get_delegation(&addr(1), &addr(9)).unwrap();
        d.amount = 0;
        ov.set_delegation(d);
        assert!(ov.delegations_of(&addr(9)).unwrap().is_empty());
        s.commit(&ov.into_changes()).unwrap();

        assert!(s.find_delegation(&addr(1), &addr(9)).unwrap().is_none());
        assert!(s.kv().iterate(keys::BONDED_PREFIX).unwrap().is_empty());
    }

    #[test]
    fn delegations_of_reads_only_the_validator_index() {
        let s = store();
        let mut ov = s.overlay();
        for i in 0..50u8 {
            ov.set_delegation(Delegation::new(addr(i), addr(200), 1, 0));
        }
        ov.set_delegation(Delegation::new(addr(7), addr(9), 3, 0));
        ov.set_delegation(Delegation::new(addr(4), addr(9), 2, 0));
        s.commit(&ov.into_changes()).unwrap();

        let index = s.kv().iterate(&keys::bonded_prefix(&addr(9))).unwrap();
        assert_eq!(index.len(), 2);
        let of: Vec<Address> = s.get_delegations_of(&addr(9)).unwrap().iter().map(|d| d.delegator).collect();
        assert_eq!(of, vec![addr(4), addr(7)]);
        assert_eq!(s.get_delegations_of(&addr(200)).unwrap().len(), 50);

        s.delete_delegation(&addr(7), &addr(9)).unwrap();
        assert_eq!(s.overlay().delegations_of(&addr(9)).unwrap().len(), 1);
        assert!(s.kv().get(&keys::bonded_key(&addr(9), &addr(7))).unwrap().is_none());
    }

    #[test]
    fn delegations_of_sorted_by_delegator() {
        let s = store();
        s.set_delegation(&Delegation::new(addr(3), addr(9), 1, 0)).unwrap();
        s.set_delegation(&Delegation::new(addr(1), addr(9), 1, 0)).unwrap();
        s.set_delegation(&Delegation::new(addr(2), addr(8), 1, 0)).unwrap();

        let mut ov = s.overlay();
        ov.set_delegation(Delegation::new(addr(2), addr(9), 5, 1));
        let order: Vec<Address> = ov.delegations_of(&addr(9)).unwrap().iter().map(|d| d.delegator).collect();
        assert_eq!(order, vec![addr(1), addr(2), addr(3)]);
    }

    #[test]
    fn state_root_tracks_changes() {
        let a = store();
        let b = store();
        assert_eq!(a.state_root().unwrap(), Hash::zero());

        a.set_account(&Account::with_balance(addr(1), 10)).unwrap();
        a.set_account(&Account::with_balance(addr(2), 20)).unwrap();
        // insertion order must not matter
        b.set_account(&Account::with_balance(addr(2), 20)).unwrap();
        b.set_account(&Account::with_balance(addr(1), 10)).unwrap();
        let root = a.state_root().unwrap();
        assert_eq!(root, b.state_root().unwrap());

        let mut ov = a.overlay();
        ov.set_account(Account::with_balance(addr(1), 11));
        let predicted = ov.state_root().unwrap();
        assert_ne!(predicted, root);
        a.commit(&ov.into_changes()).unwrap();
        assert_eq!(a.state_root().unwrap(), predicted);
    }

    #[test]
    fn unbonding_queue_roundtrip() {
        let s = store();
        let mut ov = s.overlay();
        ov.push_unbonding(UnbondingDelegation::new(addr(1), addr(9), 5, 10, 100)).unwrap();
        ov.push_unbonding(UnbondingDelegation::new(addr(1), addr(9), 7, 11, 100)).unwrap();
        assert_eq!(ov.unbonding_delegators().unwrap(), vec![addr(1)]);
        s.commit(&ov.into_changes()).unwrap();

        assert_eq!(s.get_unbonding(&addr(1)).unwrap().len(), 2);
        assert_eq!(s.get_all_unbonding().unwrap().len(), 2);

        let mut ov = s.overlay();
        ov.set_unbonding(addr(1), Vec::new());
        assert!(ov.unbonding_delegators().unwrap().is_empty());
        s.commit(&ov.into_changes()).unwrap();
        assert!(s.get_unbonding(&addr(1)).unwrap().is_empty());
    }
}
