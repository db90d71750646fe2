//! # Apex Chain Core Library
//!
//! Single-node ledger engine for a delegated proof of stake chain.
//! ## Module Overview
//!
//! | Module | Purpose | Key types |
//! |--------|---------|-----------|
//! | `types` | Core types and network constants | Address, Hash, Amount |
//! | `crypto` | Ed25519 keys, SHA3-512, addresses | KeyPair |
//! | `error` | Error categories of the engine | ChainError |
//! | `config` | Node configuration and genesis | ChainConfig, GenesisConfig |
//! | `state` | Ledger store, write overlay, state root | StateStore, StateOverlay |
//! | `tx` | Transaction kinds, hashing, signing | Transaction, TxType |
//! | `block` | Block structure, signing, receipts | Block, TxReceipt |
//! | `executor` | Deterministic transaction semantics | Executor |
//! | `epoch` | Epoch bookkeeping and validator ranking | EpochInfo |
//! | `dpos` | Validator registry, schedule, transactions | DposEngine, StateTxn |
//! | `rewards` | Block reward, commission, delegator shares | RewardCalculator |
//! | `slashing` | Penalties and jailing | Slasher, SlashingEvent |
//! | `staking` | Delegation lifecycle, unbonding queue | StakingManager |
//! | `mempool` | Gas-price ordered pending pool | Mempool |
//! | `blockstore` | Block, transaction and receipt archive | BlockStore |
//! | `chain` | Orchestrator: genesis, production, import | Chain |
//! | `rpc` | Typed query surface and JSON dispatcher | RpcHandler |
//! | `network` | Peer envelopes and routing | Message, ProtocolHandler |
//!
//! ## Block pipeline
//!
//! ```text
//! execute txs (mempool order, gas bounded)
//!   -> distribute reward + fees to producer and delegators
//!   -> release matured unbonding
//!   -> producer counters
//!   -> epoch rotation (every EPOCH_LENGTH blocks)
//!   -> state root -> sign -> single atomic commit (state + block archive)
//! ```
//!
//! ## Economic invariants
//!
//! - `validator.voting_power == self_stake + Σ delegations to it`
//! - `account.staked == own self-stake + Σ outgoing delegations + unbonded stake`
//! - supply only grows by credited rewards and only shrinks by slashing or
//!   fees that are not distributed
//!
//! ## Consensus-critical components
//!
//! - Validator ranking in `epoch.rs`
//! - Producer schedule `active[height mod len]` in `dpos.rs`
//! - Reward arithmetic in `rewards.rs` and `types::mul_div`
//! - State root over ledger prefixes in `state/state_root.rs`

pub mod types;
pub mod crypto;
pub mod error;
pub mod config;
pub mod state;
pub mod tx;
pub mod block;
pub mod executor;
pub mod epoch;
pub mod dpos;
pub mod rewards;
pub mod slashing;
pub mod staking;
pub mod mempool;
pub mod blockstore;
pub mod chain;
pub mod rpc;
pub mod network;

pub use crate::block::{Block, BlockHeader, TxReceipt};
pub use crate::chain::{BlockStats, Chain};
pub use crate::config::{ChainConfig, GenesisConfig};
pub use crate::crypto::KeyPair;
pub use crate::dpos::{DposEngine, StateTxn};
pub use crate::error::{ChainError, Result};
pub use crate::mempool::Mempool;
pub use crate::state::{Account, Delegation, StateStore, UnbondingDelegation, Validator, ValidatorStatus};
pub use crate::tx::{Transaction, TxType};
pub use crate::types::{Address, Amount, Hash};
