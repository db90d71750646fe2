//! # Ledger scenarios through the orchestrator
//!
//! End-to-end checks of the block pipeline:
//! - transfer, fee and commission accounting
//! - supply conservation across blocks
//! - nonce replay protection
//! - delegation, undelegation and unbonding release
//! - epoch rotation picking up new validators
//! - block import on a second node and state root checks

use apex_chain::block::Block;
use apex_chain::config::{ChainConfig, GenesisAccount, GenesisConfig, GenesisValidator};
use apex_chain::crypto::KeyPair;
use apex_chain::executor::BlockContext;
use apex_chain::tx::{CreateValidatorData, Transaction};
use apex_chain::types::{apply_basis_points, Address, Hash, ONE_TOKEN};
use apex_chain::{Chain, ChainError};
use chrono::{DateTime, Utc};

// ════════════════════════════════════════════════════════════════════════════
// HELPERS
// ════════════════════════════════════════════════════════════════════════════

fn addr(byte: u8) -> Address {
    Address::from_bytes([byte; 20])
}

fn genesis(validators: &[&KeyPair], accounts: &[(Address, u128)], at: DateTime<Utc>) -> GenesisConfig {
    GenesisConfig {
        timestamp: Some(at),
        accounts: accounts
            .iter()
            .map(|(address, tokens)| GenesisAccount { address: *address, balance: tokens * ONE_TOKEN })
            .collect(),
        validators: validators
            .iter()
            .map(|kp| GenesisValidator {
                public_key: kp.public_key().to_vec(),
                self_stake: 100_000 * ONE_TOKEN,
                commission: 1_000,
                moniker: String::new(),
            })
            .collect(),
    }
}

fn chain_with(config: ChainConfig, genesis: &GenesisConfig) -> Chain {
    let chain = Chain::in_memory(config).unwrap();
    chain.init_genesis(genesis).unwrap();
    chain
}

/// Key of whoever is scheduled for the next height.
fn next_producer<'a>(chain: &Chain, keys: &[&'a KeyPair]) -> &'a KeyPair {
    let expected = chain.dpos.get_block_producer(chain.get_height() + 1).unwrap();
    keys.iter().find(|k| k.address() == expected).copied().unwrap()
}

// ════════════════════════════════════════════════════════════════════════════
// 1. TRANSFER AND COMMISSION
// ════════════════════════════════════════════════════════════════════════════

#[test]
fn transfer_block_charges_fee_and_credits_commission() {
    let v = KeyPair::generate();
    let user = KeyPair::generate();
    let recipient = addr(0x0b);
    let chain = chain_with(ChainConfig::default(), &genesis(&[&v], &[(user.address(), 1_000)], Utc::now()));

    let tx = Transaction::transfer(user.address(), recipient, 10 * ONE_TOKEN, 0).signed(&user).unwrap();
    chain.submit_transaction(tx.clone()).unwrap();
    let block = chain.produce_block(&v).unwrap();

    assert_eq!(block.height(), 1);
    assert_eq!(block.transactions, vec![tx.clone()]);
    let fee = tx.gas_limit as u128 * tx.gas_price;
    assert_eq!(chain.get_account(&user.address()).unwrap().balance, 1_000 * ONE_TOKEN - 10 * ONE_TOKEN - fee);
    assert_eq!(chain.get_account(&user.address()).unwrap().nonce, 1);
    assert_eq!(chain.get_account(&recipient).unwrap().balance, 10 * ONE_TOKEN);

    let reward = chain.rewards.block_reward(1) + fee;
    let validator = chain.dpos.get_validator(&v.address()).unwrap();
    assert_eq!(validator.total_rewards, apply_basis_points(reward, 1_000));
    assert_eq!(validator.total_rewards, reward / 10);
    assert_eq!(validator.produced_blocks, 1);

    let receipt = chain.get_receipt(&tx.hash).unwrap();
    assert_eq!((receipt.block_hash, receipt.status), (block.hash, 1));
    assert_eq!(chain.get_transaction(&tx.hash).unwrap(), tx);
    assert!(chain.mempool.is_empty());
}

#[test]
fn block_links_to_parent_and_commits_state_root() {
    let v = KeyPair::generate();
    let chain = chain_with(ChainConfig::default(), &genesis(&[&v], &[], Utc::now()));
    let genesis_block = chain.get_latest_block().unwrap();

    let b1 = chain.produce_block(&v).unwrap();
    let b2 = chain.produce_block(&v).unwrap();
    assert_eq!(b1.header.previous_hash, genesis_block.hash);
    assert_eq!(b2.header.previous_hash, b1.hash);
    assert_eq!(b2.header.state_root, chain.state_root().unwrap());
    assert_ne!(b1.header.state_root, genesis_block.header.state_root);
    assert_eq!(chain.get_block_by_number(1).unwrap(), b1);
    assert_eq!(chain.get_block_by_hash(&b2.hash).unwrap(), b2);
    assert!(b2.verify_signature());
}

// ════════════════════════════════════════════════════════════════════════════
// 2. SUPPLY
// ════════════════════════════════════════════════════════════════════════════

#[test]
fn supply_grows_only_by_credited_rewards() {
    let v = KeyPair::generate();
    let user = KeyPair::generate();
    let chain = chain_with(ChainConfig::default(), &genesis(&[&v], &[(user.address(), 50_000)], Utc::now()));
    assert_eq!(chain.total_supply().unwrap(), 150_000 * ONE_TOKEN);

    let delegate = Transaction::delegate(user.address(), v.address(), 20_000 * ONE_TOKEN, 0)
        .unwrap()
        .signed(&user)
        .unwrap();
    let transfer = Transaction::transfer(user.address(), addr(0x0c), ONE_TOKEN, 1).signed(&user).unwrap();
    chain.submit_transaction(delegate).unwrap();
    chain.submit_transaction(transfer).unwrap();

    for _ in 0..3 {
        let before = chain.total_supply().unwrap();
        chain.produce_block(&v).unwrap();
        let stats = chain.last_block_stats().unwrap();
        let after = chain.total_supply().unwrap();
        assert_eq!(after, before + stats.reward.block_reward - stats.reward.undistributed);
        assert_eq!(stats.reward.distributed() + stats.reward.undistributed, stats.reward.total());
    }

    // delegator earned a share once bonded
    assert!(chain.rewards.get_delegator_rewards(&user.address(), &v.address()).unwrap() > 0);
    let claimed = chain.claim_rewards(&user.address(), &v.address()).unwrap();
    assert!(claimed > 0);
    assert!(matches!(chain.claim_rewards(&user.address(), &v.address()), Err(ChainError::NoRewards)));
}

// ════════════════════════════════════════════════════════════════════════════
// 3. NONCES
// ════════════════════════════════════════════════════════════════════════════

#[test]
fn replayed_transaction_fails() {
    let v = KeyPair::generate();
    let user = KeyPair::generate();
    let chain = chain_with(ChainConfig::default(), &genesis(&[&v], &[(user.address(), 100)], Utc::now()));

    let tx = Transaction::transfer(user.address(), addr(0x0d), ONE_TOKEN, 0).signed(&user).unwrap();
    chain.submit_transaction(tx.clone()).unwrap();
    chain.produce_block(&v).unwrap();
    assert_eq!(chain.get_account(&user.address()).unwrap().nonce, 1);

    assert!(matches!(
        chain.submit_transaction(tx.clone()),
        Err(ChainError::InvalidNonce { expected: 1, got: 0, .. })
    ));

    // straight through the executor as well
    let mut txn = chain.dpos.begin();
    let ctx = BlockContext::new(2, Utc::now());
    assert!(matches!(
        chain.executor.execute_transaction(&mut txn, &tx, &ctx),
        Err(ChainError::InvalidNonce { .. })
    ));
}

// ════════════════════════════════════════════════════════════════════════════
// 4. DELEGATION AND UNBONDING
// ════════════════════════════════════════════════════════════════════════════

#[test]
fn delegate_then_undelegate_through_blocks() {
    let mut config = ChainConfig::default();
    config.consensus.unbonding_period = 3;
    let v = KeyPair::generate();
    let d = KeyPair::generate();
    let chain = chain_with(config, &genesis(&[&v], &[(d.address(), 10_000)], Utc::now()));

    let tx = Transaction::delegate(d.address(), v.address(), 5_000 * ONE_TOKEN, 0).unwrap().signed(&d).unwrap();
    chain.submit_transaction(tx).unwrap();
    chain.produce_block(&v).unwrap();
    assert_eq!(chain.dpos.get_validator(&v.address()).unwrap().voting_power, 105_000 * ONE_TOKEN);
    assert_eq!(chain.get_account(&d.address()).unwrap().staked, 5_000 * ONE_TOKEN);

    let tx = Transaction::undelegate(d.address(), v.address(), 5_000 * ONE_TOKEN, 1).unwrap().signed(&d).unwrap();
    chain.submit_transaction(tx).unwrap();
    chain.produce_block(&v).unwrap();
    assert_eq!(chain.dpos.get_validator(&v.address()).unwrap().voting_power, 100_000 * ONE_TOKEN);
    let account = chain.get_account(&d.address()).unwrap();
    assert_eq!((account.staked, account.locked), (0, 5_000 * ONE_TOKEN));

    let queue = chain.staking.get_unbonding_delegations(&d.address()).unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].completion_height, 2 + 3);

    chain.produce_block(&v).unwrap();
    chain.produce_block(&v).unwrap();
    assert_eq!(chain.get_account(&d.address()).unwrap().locked, 5_000 * ONE_TOKEN);

    chain.produce_block(&v).unwrap();
    assert_eq!(chain.last_block_stats().unwrap().unbonded, 1);
    let account = chain.get_account(&d.address()).unwrap();
    assert_eq!((account.balance, account.locked), (10_000 * ONE_TOKEN, 0));
    assert!(chain.staking.get_unbonding_delegations(&d.address()).unwrap().is_empty());
}

#[test]
fn unstake_limited_to_unbonded_stake() {
    let v = KeyPair::generate();
    let user = KeyPair::generate();
    let chain = chain_with(ChainConfig::default(), &genesis(&[&v], &[(user.address(), 1_000)], Utc::now()));

    let stake = Transaction::stake(user.address(), 300 * ONE_TOKEN, 0).unwrap().signed(&user).unwrap();
    chain.submit_transaction(stake).unwrap();
    chain.produce_block(&v).unwrap();

    // the validator's self-stake is bonded and cannot leave through Unstake
    let bonded = Transaction::unstake(v.address(), ONE_TOKEN, 0).unwrap().signed(&v).unwrap();
    chain.submit_transaction(bonded.clone()).unwrap();
    let unstake = Transaction::unstake(user.address(), 100 * ONE_TOKEN, 1).unwrap().signed(&user).unwrap();
    chain.submit_transaction(unstake.clone()).unwrap();
    let block = chain.produce_block(&v).unwrap();

    assert_eq!(block.tx_hashes(), vec![unstake.hash]);
    assert!(chain.mempool.has(&bonded.hash));
    let account = chain.get_account(&user.address()).unwrap();
    assert_eq!((account.staked, account.locked), (200 * ONE_TOKEN, 100 * ONE_TOKEN));
}

// ════════════════════════════════════════════════════════════════════════════
// 5. EPOCHS
// ════════════════════════════════════════════════════════════════════════════

#[test]
fn new_validator_joins_at_epoch_boundary() {
    let mut config = ChainConfig::default();
    config.consensus.epoch_length = 4;
    let v = KeyPair::generate();
    let newcomer = KeyPair::generate();
    let chain = chain_with(config, &genesis(&[&v], &[(newcomer.address(), 300_000)], Utc::now()));

    let data = CreateValidatorData {
        commission: 500,
        self_stake: 200_000 * ONE_TOKEN,
        moniker: "newcomer".into(),
        ..Default::default()
    };
    let tx = Transaction::create_validator(newcomer.address(), &data, 0).unwrap().signed(&newcomer).unwrap();
    chain.submit_transaction(tx).unwrap();
    chain.produce_block(&v).unwrap();

    assert!(chain.dpos.get_validator(&newcomer.address()).is_some());
    assert_eq!(chain.dpos.get_active_set(), vec![v.address()]);

    for _ in 2..=4 {
        chain.produce_block(&v).unwrap();
    }
    assert!(chain.last_block_stats().unwrap().epoch_rotated);
    assert_eq!(chain.dpos.current_epoch().epoch_number, 1);
    assert_eq!(chain.dpos.current_epoch().start_height, 4);
    // ranked by voting power
    assert_eq!(chain.dpos.get_active_set(), vec![newcomer.address(), v.address()]);

    let keys = [&v, &newcomer];
    for _ in 0..4 {
        let height = chain.get_height() + 1;
        let signer = next_producer(&chain, &keys);
        let block = chain.produce_block(signer).unwrap();
        assert_eq!(block.header.producer, chain.dpos.get_active_set()[(height % 2) as usize]);
    }
}

// ════════════════════════════════════════════════════════════════════════════
// 6. BLOCK IMPORT
// ════════════════════════════════════════════════════════════════════════════

#[test]
fn second_node_replays_to_same_state() {
    let v = KeyPair::generate();
    let user = KeyPair::generate();
    let g = genesis(&[&v], &[(user.address(), 1_000)], Utc::now());
    let producer = chain_with(ChainConfig::default(), &g);
    let follower = chain_with(ChainConfig::default(), &g);
    assert_eq!(producer.get_latest_block(), follower.get_latest_block());

    for nonce in 0..3 {
        let tx = Transaction::transfer(user.address(), addr(0x0e), ONE_TOKEN, nonce).signed(&user).unwrap();
        producer.submit_transaction(tx.clone()).unwrap();
        // the follower saw it via gossip
        follower.submit_transaction(tx).unwrap();
        let block = producer.produce_block(&v).unwrap();
        follower.add_block(block).unwrap();
    }

    assert_eq!(follower.get_height(), 3);
    assert_eq!(follower.state_root().unwrap(), producer.state_root().unwrap());
    assert_eq!(
        follower.get_account(&user.address()).unwrap(),
        producer.get_account(&user.address()).unwrap()
    );
    assert!(follower.mempool.is_empty());
}

#[test]
fn import_rejects_bad_blocks_without_side_effects() {
    let v = KeyPair::generate();
    let g = genesis(&[&v], &[], Utc::now());
    let producer = chain_with(ChainConfig::default(), &g);
    let follower = chain_with(ChainConfig::default(), &g);
    let b1 = producer.produce_block(&v).unwrap();
    follower.add_block(b1.clone()).unwrap();
    let root = follower.state_root().unwrap();

    // same height twice
    assert!(matches!(follower.add_block(b1.clone()), Err(ChainError::InvalidHeight { expected: 2, got: 1 })));

    // wrong state root, correctly signed
    let mut forged = Block::new(2, b1.hash, v.address(), v.public_key().to_vec(), Utc::now(), b1.header.gas_limit);
    forged.finalize(Hash::zero()).unwrap();
    forged.sign(&v).unwrap();
    assert!(matches!(follower.add_block(forged), Err(ChainError::StateRootMismatch { height: 2, .. })));

    // unscheduled producer
    let outsider = KeyPair::generate();
    let mut foreign = Block::new(2, b1.hash, outsider.address(), outsider.public_key().to_vec(), Utc::now(), 1_000);
    foreign.finalize(Hash::zero()).unwrap();
    foreign.sign(&outsider).unwrap();
    assert!(matches!(follower.validate_block(&foreign), Err(ChainError::WrongProducer { .. })));

    // broken parent link
    let mut orphan = Block::new(2, Hash::zero(), v.address(), v.public_key().to_vec(), Utc::now(), 1_000);
    orphan.finalize(Hash::zero()).unwrap();
    orphan.sign(&v).unwrap();
    assert!(matches!(follower.add_block(orphan), Err(ChainError::InvalidPreviousHash(2))));

    assert_eq!(follower.get_height(), 1);
    assert_eq!(follower.state_root().unwrap(), root);
    assert_eq!(follower.dpos.get_validator(&v.address()).unwrap().produced_blocks, 1);
}
