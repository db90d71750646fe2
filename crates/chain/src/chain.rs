//! Blockchain orchestrator.
//!
//! `Chain` wires the ledger store, block archive, DPoS engine, executor,
//! reward calculator, slasher, staking manager and mempool together, and
//! runs the block pipeline:
//!
//! ```text
//! execute txs -> distribute reward -> release unbonding -> producer counters
//!     -> epoch rotation -> state root -> (sign) -> one atomic commit
//! ```
//!
//! The same pipeline runs for locally produced blocks and for blocks
//! received from peers, so both sides compute the same state root.
//!
//! ## Locking
//!
//! `tip` is held for writing for the whole pipeline, which serialises block
//! producers and importers. It is always taken before the engine's mutation
//! lock.

use std::path::Path;
use std::sync::Arc;

use apex_storage::{KvStore, LmdbKv, MemoryKv};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::{Block, TxReceipt};
use crate::blockstore::BlockStore;
use crate::config::{ChainConfig, GenesisConfig};
use crate::crypto::{address_from_pubkey_bytes, KeyPair};
use crate::dpos::{DposEngine, StateTxn};
use crate::epoch::EpochInfo;
use crate::error::{ChainError, Result};
use crate::executor::{BlockContext, Executor};
use crate::mempool::Mempool;
use crate::rewards::{RewardCalculator, RewardDistribution};
use crate::slashing::{Slasher, SlashingEvent};
use crate::staking::{self, StakingManager};
use crate::state::{Account, StateStore, Validator};
use crate::tx::Transaction;
use crate::types::{Address, Amount, Hash};

/// Summary of the last block applied to the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub height: u64,
    pub hash: Hash,
    pub producer: Address,
    pub tx_count: usize,
    pub gas_used: u64,
    pub fees: Amount,
    pub reward: RewardDistribution,
    /// unbonding entries released by this block
    pub unbonded: usize,
    pub epoch_rotated: bool,
}

#[derive(Debug, Default)]
struct ChainTip {
    block: Option<Block>,
    stats: Option<BlockStats>,
}

/// Outcome of the shared part of the block pipeline.
struct Finished {
    reward: RewardDistribution,
    unbonded: usize,
    epoch_rotated: bool,
}

pub struct Chain {
    pub config: ChainConfig,
    pub state: Arc<StateStore>,
    pub blocks: BlockStore,
    pub dpos: Arc<DposEngine>,
    pub executor: Executor,
    pub rewards: RewardCalculator,
    pub slasher: Slasher,
    pub staking: StakingManager,
    pub mempool: Arc<Mempool>,
    tip: RwLock<ChainTip>,
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("chain_id", &self.config.chain_id)
            .field("height", &self.get_height())
            .field("dpos", &self.dpos)
            .field("mempool", &self.mempool)
            .finish()
    }
}

/// Storage and encoding failures abort block assembly; anything else only
/// disqualifies the transaction.
fn is_fatal(err: &ChainError) -> bool {
    matches!(err, ChainError::Storage(_) | ChainError::Encoding(_) | ChainError::Json(_))
}

impl Chain {
    /// Build a chain over `kv`, restoring the tip from the block archive.
    pub fn new(kv: Arc<dyn KvStore>, config: ChainConfig) -> Result<Self> {
        config.validate().map_err(|e| ChainError::Config(e.to_string()))?;

        let state = Arc::new(StateStore::new(kv.clone()));
        let blocks = BlockStore::new(kv);
        let dpos = Arc::new(DposEngine::open(state.clone(), &config)?);
        let tip = blocks.get_latest_block()?;

        if let Some(block) = &tip {
            info!(height = block.height(), hash = %block.hash, "chain restored");
        }

        Ok(Self {
            executor: Executor::new(&config),
            rewards: RewardCalculator::new(dpos.clone(), &config),
            slasher: Slasher::new(dpos.clone(), config.slashing.clone()),
            staking: StakingManager::new(dpos.clone(), &config),
            mempool: Arc::new(Mempool::new(config.mempool.max_size)),
            tip: RwLock::new(ChainTip { block: tip, stats: None }),
            config,
            state,
            blocks,
            dpos,
        })
    }

    /// LMDB-backed chain at `path`.
    pub fn open(path: impl AsRef<Path>, config: ChainConfig) -> Result<Self> {
        let kv = match config.storage.map_size {
            Some(size) => LmdbKv::open_with_map_size(path, size)?,
            None => LmdbKv::open(path)?,
        };
        Self::new(Arc::new(kv), config)
    }

    pub fn in_memory(config: ChainConfig) -> Result<Self> {
        Self::new(Arc::new(MemoryKv::new()), config)
    }

    /// Storage chosen by `config.storage.path`.
    pub fn from_config(config: ChainConfig) -> Result<Self> {
        match config.storage.path.clone() {
            Some(path) => Self::open(path, config),
            None => Self::in_memory(config),
        }
    }

    // ============================================================
    // GENESIS
    // ============================================================

    /// Credit the genesis accounts, register the genesis validators through
    /// the normal registration path, select the first active set and store
    /// block 0.
    pub fn init_genesis(&self, genesis: &GenesisConfig) -> Result<Block> {
        let mut tip = self.tip.write();
        if tip.block.is_some() {
            return Err(ChainError::GenesisExists);
        }

        let mut txn = self.dpos.begin();
        for entry in &genesis.accounts {
            let mut account = txn.get_or_create_account(&entry.address)?;
            account.add_balance(entry.balance)?;
            txn.set_account(account);
        }

        for gv in &genesis.validators {
            if gv.public_key.len() != 32 {
                return Err(ChainError::Crypto(format!(
                    "genesis validator key must be 32 bytes, got {}",
                    gv.public_key.len()
                )));
            }
            let address = address_from_pubkey_bytes(&gv.public_key);
            let mut owner = txn.get_or_create_account(&address)?;
            owner.add_balance(gv.self_stake)?;
            txn.set_account(owner);

            let mut validator = Validator::new(address, gv.public_key.clone(), gv.self_stake, gv.commission);
            validator.moniker = gv.moniker.clone();
            txn.register_validator(validator, 0)?;
        }

        let active = txn.select_validators()?;
        let mut total_stake: Amount = 0;
        for addr in &active {
            total_stake = total_stake.saturating_add(txn.get_validator(addr)?.voting_power);
        }
        let mut epoch = EpochInfo::default();
        epoch.rotate(0, 0, active.len(), total_stake);
        txn.set_epoch(epoch);

        let timestamp = genesis.timestamp.unwrap_or_else(Utc::now);
        let block = Block::genesis(timestamp, txn.state_root()?, self.config.consensus.block_gas_limit)?;
        let archive = self.blocks.block_batch(&block)?;
        txn.commit_with(archive)?;

        info!(
            hash = %block.hash,
            accounts = genesis.accounts.len(),
            validators = active.len(),
            "genesis initialized"
        );
        tip.block = Some(block.clone());
        Ok(block)
    }

    // ============================================================
    // TRANSACTIONS
    // ============================================================

    /// Queue a transaction for inclusion. Nonces already used by the
    /// sender are refused here rather than at block time.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash> {
        if let Some(account) = self.state.find_account(&tx.from)? {
            if tx.nonce < account.nonce {
                return Err(ChainError::InvalidNonce { address: tx.from, expected: account.nonce, got: tx.nonce });
            }
        }
        self.mempool.add_transaction(tx)
    }

    // ============================================================
    // BLOCK PRODUCTION
    // ============================================================

    /// Produce, commit and store the next block. `signer` must be the
    /// scheduled producer of `tip + 1`.
    pub fn produce_block(&self, signer: &KeyPair) -> Result<Block> {
        let mut tip = self.tip.write();
        let parent = tip.block.as_ref().ok_or(ChainError::NoGenesis)?;
        let height = parent.height() + 1;

        let mut txn = self.dpos.begin();
        let expected = txn.block_producer(height)?;
        let producer = signer.address();
        if producer != expected {
            return Err(ChainError::WrongProducer { height, expected, got: producer });
        }

        let timestamp = Utc::now().max(parent.header.timestamp);
        let mut block = Block::new(
            height,
            parent.hash,
            producer,
            signer.public_key().to_vec(),
            timestamp,
            self.config.consensus.block_gas_limit,
        );
        let ctx = BlockContext::new(height, timestamp);

        let (fees, stale) = self.fill_block(&mut txn, &mut block, &ctx)?;
        let finished = self.finish_block(&mut txn, &producer, height, fees)?;

        block.finalize(txn.state_root()?)?;
        block.sign(signer)?;
        let archive = self.blocks.block_batch(&block)?;
        txn.commit_with(archive)?;

        let mut drop_list = block.tx_hashes();
        drop_list.extend(stale);
        self.mempool.remove_transactions(&drop_list);

        let stats = self.stats_for(&block, fees, finished);
        info!(
            height,
            hash = %block.hash,
            txs = stats.tx_count,
            gas_used = stats.gas_used,
            fees,
            "block produced"
        );
        tip.block = Some(block.clone());
        tip.stats = Some(stats);
        Ok(block)
    }

    /// Pull mempool candidates into `block`, highest gas price first.
    ///
    /// A candidate is applied when it fits the remaining gas and executes
    /// cleanly; a failed one is rolled back and stays in the mempool.
    /// Candidates with a future nonce are retried on the next pass, which
    /// runs as long as the previous one included something. Returns the
    /// collected fees and the hashes of candidates whose nonce is already
    /// used.
    fn fill_block(&self, txn: &mut StateTxn<'_>, block: &mut Block, ctx: &BlockContext) -> Result<(Amount, Vec<Hash>)> {
        let mut pending = self.mempool.get_sorted_transactions();
        let mut fees: Amount = 0;
        let mut stale = Vec::new();

        loop {
            let mut deferred = Vec::new();
            let mut progressed = false;

            for tx in pending {
                if !block.has_room_for(tx.gas_limit) {
                    continue;
                }

                let nonce = txn.find_account(&tx.from)?.map_or(0, |a| a.nonce);
                if tx.nonce < nonce {
                    stale.push(tx.hash);
                    continue;
                }
                if tx.nonce > nonce {
                    deferred.push(tx);
                    continue;
                }

                let checkpoint = txn.checkpoint();
                match self.executor.execute_transaction(txn, &tx, ctx) {
                    Ok(outcome) => {
                        let included = block.add_transaction(tx);
                        debug_assert!(included, "gas room checked before execution");
                        fees = fees.checked_add(outcome.fee).ok_or(ChainError::Overflow)?;
                        progressed = true;
                    }
                    Err(e) if is_fatal(&e) => return Err(e),
                    Err(e) => {
                        txn.rollback(checkpoint);
                        warn!(tx = %tx.hash, error = %e, "tx skipped");
                    }
                }
            }

            if !progressed || deferred.is_empty() {
                break;
            }
            pending = deferred;
        }
        Ok((fees, stale))
    }

    /// Post-execution steps shared by production and import.
    fn finish_block(&self, txn: &mut StateTxn<'_>, producer: &Address, height: u64, fees: Amount) -> Result<Finished> {
        let reward = self.rewards.distribute(txn, producer, height, fees)?;
        let released = staking::release_matured(txn, height)?;
        txn.increment_produced_blocks(producer)?;
        let epoch_rotated = txn.update_epoch(height)?;
        Ok(Finished { reward, unbonded: released.completed.len(), epoch_rotated })
    }

    fn stats_for(&self, block: &Block, fees: Amount, finished: Finished) -> BlockStats {
        BlockStats {
            height: block.height(),
            hash: block.hash,
            producer: block.header.producer,
            tx_count: block.transaction_count(),
            gas_used: block.header.gas_used,
            fees,
            reward: finished.reward,
            unbonded: finished.unbonded,
            epoch_rotated: finished.epoch_rotated,
        }
    }

    // ============================================================
    // BLOCK IMPORT
    // ============================================================

    /// Full validation of a candidate next block against the current tip.
    pub fn validate_block(&self, block: &Block) -> Result<()> {
        let tip = self.tip.read();
        self.check_block(tip.block.as_ref(), block, Utc::now())
    }

    fn check_block(&self, parent: Option<&Block>, block: &Block, now: DateTime<Utc>) -> Result<()> {
        let parent = parent.ok_or(ChainError::NoGenesis)?;
        block.validate(now, self.config.consensus.max_future_drift_secs)?;

        let expected = parent.height() + 1;
        if block.height() != expected {
            return Err(ChainError::InvalidHeight { expected, got: block.height() });
        }
        if block.header.previous_hash != parent.hash {
            return Err(ChainError::InvalidPreviousHash(block.height()));
        }
        if block.header.timestamp < parent.header.timestamp {
            return Err(ChainError::InvalidBlock(format!(
                "timestamp {} before parent timestamp {}",
                block.header.timestamp.to_rfc3339(),
                parent.header.timestamp.to_rfc3339()
            )));
        }
        self.dpos.validate_block(block, now)
    }

    /// Validate, execute and store a block produced elsewhere. Any failure
    /// leaves state untouched.
    pub fn add_block(&self, block: Block) -> Result<()> {
        let mut tip = self.tip.write();
        self.check_block(tip.block.as_ref(), &block, Utc::now())?;

        let height = block.height();
        let producer = block.header.producer;
        let ctx = BlockContext::new(height, block.header.timestamp);

        let mut txn = self.dpos.begin();
        let outcome = self.executor.execute_block(&mut txn, &block.transactions, &ctx)?;
        let finished = self.finish_block(&mut txn, &producer, height, outcome.fees)?;

        let computed = txn.state_root()?;
        if computed != block.header.state_root {
            return Err(ChainError::StateRootMismatch { height, expected: block.header.state_root, computed });
        }
        let archive = self.blocks.block_batch(&block)?;
        txn.commit_with(archive)?;

        self.mempool.remove_transactions(&block.tx_hashes());
        let pruned = self.prune_mempool()?;
        if pruned > 0 {
            debug!(pruned, "stale txs pruned after import");
        }

        let stats = self.stats_for(&block, outcome.fees, finished);
        info!(height, hash = %block.hash, txs = stats.tx_count, producer = %producer, "block imported");
        tip.block = Some(block);
        tip.stats = Some(stats);
        Ok(())
    }

    /// Drop pending transactions whose nonce the ledger has moved past.
    fn prune_mempool(&self) -> Result<usize> {
        let mut stale = Vec::new();
        for tx in self.mempool.get_sorted_transactions() {
            let nonce = self.state.find_account(&tx.from)?.map_or(0, |a| a.nonce);
            if tx.nonce < nonce {
                stale.push(tx.hash);
            }
        }
        Ok(self.mempool.remove_transactions(&stale))
    }

    // ============================================================
    // MISBEHAVIOUR
    // ============================================================

    /// Count a missed slot for `validator`; slashes and jails once the
    /// downtime threshold is reached.
    pub fn report_missed_block(&self, validator: &Address) -> Result<Option<SlashingEvent>> {
        let height = self.get_height();
        self.slasher.record_missed_block(validator, height, Utc::now())
    }

    pub fn slash_double_sign(&self, validator: &Address, height_a: u64, height_b: u64) -> Result<Option<SlashingEvent>> {
        self.slasher.detect_double_sign(validator, height_a, height_b, Utc::now())
    }

    pub fn claim_rewards(&self, delegator: &Address, validator: &Address) -> Result<Amount> {
        self.rewards.claim_rewards(delegator, validator)
    }

    // ============================================================
    // QUERIES
    // ============================================================

    pub fn get_latest_block(&self) -> Option<Block> {
        self.tip.read().block.clone()
    }

    /// Height of the tip; 0 before genesis.
    pub fn get_height(&self) -> u64 {
        self.tip.read().block.as_ref().map_or(0, |b| b.height())
    }

    pub fn last_block_stats(&self) -> Option<BlockStats> {
        self.tip.read().stats.clone()
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Block> {
        self.blocks.get_block(hash)
    }

    pub fn get_block_by_number(&self, number: u64) -> Result<Block> {
        self.blocks.get_block_by_number(number)
    }

    pub fn get_blocks_range(&self, start: u64, end: u64) -> Result<Vec<Block>> {
        self.blocks.get_block_range(start, end)
    }

    pub fn get_account(&self, address: &Address) -> Result<Account> {
        self.state.get_account(address)
    }

    pub fn get_transaction(&self, hash: &Hash) -> Result<Transaction> {
        self.blocks.get_transaction(hash)
    }

    pub fn get_receipt(&self, hash: &Hash) -> Result<TxReceipt> {
        self.blocks.get_receipt(hash)
    }

    pub fn state_root(&self) -> Result<Hash> {
        self.state.state_root()
    }

    /// Every token that exists: account balances, staked and locked funds,
    /// and rewards not yet paid out.
    pub fn total_supply(&self) -> Result<Amount> {
        let mut supply: Amount = 0;
        for account in self.state.get_all_accounts()? {
            supply = supply.checked_add(account.total_balance()).ok_or(ChainError::Overflow)?;
        }
        for validator in self.state.get_all_validators()? {
            supply = supply.checked_add(validator.total_rewards).ok_or(ChainError::Overflow)?;
        }
        for delegation in self.state.get_all_delegations()? {
            supply = supply.checked_add(delegation.rewards).ok_or(ChainError::Overflow)?;
        }
        Ok(supply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GenesisAccount, GenesisValidator};
    use crate::types::ONE_TOKEN;

    fn genesis_for(validator: &KeyPair, user: Address) -> GenesisConfig {
        GenesisConfig {
            timestamp: None,
            accounts: vec![GenesisAccount { address: user, balance: 1_000 * ONE_TOKEN }],
            validators: vec![GenesisValidator {
                public_key: validator.public_key().to_vec(),
                self_stake: 100_000 * ONE_TOKEN,
                commission: 1_000,
                moniker: "v0".into(),
            }],
        }
    }

    #[test]
    fn genesis_once_only() {
        let chain = Chain::in_memory(ChainConfig::default()).unwrap();
        let kp = KeyPair::generate();
        let user = Address::from_bytes([1; 20]);
        let genesis = chain.init_genesis(&genesis_for(&kp, user)).unwrap();

        assert_eq!(genesis.height(), 0);
        assert_eq!(genesis.header.state_root, chain.state_root().unwrap());
        assert_eq!(chain.dpos.get_active_set(), vec![kp.address()]);
        assert_eq!(chain.get_account(&kp.address()).unwrap().staked, 100_000 * ONE_TOKEN);
        assert_eq!(chain.total_supply().unwrap(), 101_000 * ONE_TOKEN);
        assert!(matches!(chain.init_genesis(&genesis_for(&kp, user)), Err(ChainError::GenesisExists)));
    }

    #[test]
    fn produce_requires_genesis_and_schedule() {
        let chain = Chain::in_memory(ChainConfig::default()).unwrap();
        let kp = KeyPair::generate();
        assert!(matches!(chain.produce_block(&kp), Err(ChainError::NoGenesis)));

        chain.init_genesis(&genesis_for(&kp, Address::from_bytes([1; 20]))).unwrap();
        let outsider = KeyPair::generate();
        assert!(matches!(chain.produce_block(&outsider), Err(ChainError::WrongProducer { height: 1, .. })));
        assert_eq!(chain.produce_block(&kp).unwrap().height(), 1);
    }

    #[test]
    fn failing_tx_stays_pending_and_leaves_no_trace() {
        let chain = Chain::in_memory(ChainConfig::default()).unwrap();
        let kp = KeyPair::generate();
        let user = KeyPair::generate();
        chain.init_genesis(&genesis_for(&kp, user.address())).unwrap();

        // more than the user owns
        let big = Transaction::transfer(user.address(), kp.address(), 5_000 * ONE_TOKEN, 0)
            .signed(&user)
            .unwrap();
        chain.submit_transaction(big.clone()).unwrap();
        let block = chain.produce_block(&kp).unwrap();

        assert_eq!(block.transaction_count(), 0);
        assert!(chain.mempool.has(&big.hash));
        assert_eq!(chain.get_account(&user.address()).unwrap().nonce, 0);
    }

    #[test]
    fn future_nonce_included_after_predecessor() {
        let chain = Chain::in_memory(ChainConfig::default()).unwrap();
        let kp = KeyPair::generate();
        let user = KeyPair::generate();
        chain.init_genesis(&genesis_for(&kp, user.address())).unwrap();

        let to = Address::from_bytes([2; 20]);
        // the later nonce pays more, so it is tried first
        let second = Transaction::transfer(user.address(), to, ONE_TOKEN, 1)
            .with_gas(21_000, 10)
            .signed(&user)
            .unwrap();
        let first = Transaction::transfer(user.address(), to, ONE_TOKEN, 0)
            .with_gas(21_000, 1)
            .signed(&user)
            .unwrap();
        chain.submit_transaction(second).unwrap();
        chain.submit_transaction(first).unwrap();

        let block = chain.produce_block(&kp).unwrap();
        let nonces: Vec<u64> = block.transactions.iter().map(|t| t.nonce).collect();
        assert_eq!(nonces, vec![0, 1]);
        assert!(chain.mempool.is_empty());
        assert_eq!(chain.get_account(&to).unwrap().balance, 2 * ONE_TOKEN);
    }

    #[test]
    fn full_block_leaves_remaining_txs_for_the_next() {
        let mut config = ChainConfig::default();
        config.consensus.block_gas_limit = 50_000;
        let chain = Chain::in_memory(config).unwrap();
        let kp = KeyPair::generate();
        let user = KeyPair::generate();
        chain.init_genesis(&genesis_for(&kp, user.address())).unwrap();

        let to = Address::from_bytes([3; 20]);
        for nonce in 0..3 {
            let tx = Transaction::transfer(user.address(), to, ONE_TOKEN, nonce).signed(&user).unwrap();
            chain.submit_transaction(tx).unwrap();
        }

        let first = chain.produce_block(&kp).unwrap();
        assert_eq!(first.transaction_count(), 2);
        assert_eq!(first.header.gas_used, 42_000);
        assert_eq!(chain.mempool.size(), 1);

        let second = chain.produce_block(&kp).unwrap();
        assert_eq!(second.transactions[0].nonce, 2);
        assert!(chain.mempool.is_empty());
        assert_eq!(chain.get_account(&to).unwrap().balance, 3 * ONE_TOKEN);
    }

    #[test]
    fn stale_nonce_refused_at_submission() {
        let chain = Chain::in_memory(ChainConfig::default()).unwrap();
        let kp = KeyPair::generate();
        let user = KeyPair::generate();
        chain.init_genesis(&genesis_for(&kp, user.address())).unwrap();

        let tx = Transaction::transfer(user.address(), kp.address(), ONE_TOKEN, 0).signed(&user).unwrap();
        chain.submit_transaction(tx.clone()).unwrap();
        chain.produce_block(&kp).unwrap();

        assert!(matches!(chain.submit_transaction(tx), Err(ChainError::InvalidNonce { expected: 1, .. })));
    }
}
