use apex_storage::StorageError;
use thiserror::Error;

use crate::types::{Address, Amount, Hash};

pub type Result<T> = std::result::Result<T, ChainError>;

/// Errors surfaced by the ledger engine.
///
/// Validation and consensus errors reject the offending transaction or block
/// without touching state. Storage errors abort the operation in progress.
#[derive(Debug, Error)]
pub enum ChainError {
    // ════════════════════════════════════════════════════════════════════════
    // VALIDATION
    // ════════════════════════════════════════════════════════════════════════
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("invalid nonce for {address}: expected {expected}, got {got}")]
    InvalidNonce {
        address: Address,
        expected: u64,
        got: u64,
    },

    #[error("insufficient balance: need {need}, have {have}")]
    InsufficientBalance { need: Amount, have: Amount },

    #[error("insufficient staked amount: need {need}, have {have}")]
    InsufficientStake { need: Amount, have: Amount },

    #[error("insufficient delegated amount: need {need}, have {have}")]
    InsufficientDelegation { need: Amount, have: Amount },

    #[error("stake {amount} below minimum {minimum}")]
    BelowMinimumStake { amount: Amount, minimum: Amount },

    #[error("commission {0} bp exceeds 10000")]
    InvalidCommission(u16),

    #[error("validator already exists: {0}")]
    ValidatorExists(Address),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("no rewards to claim")]
    NoRewards,

    #[error("arithmetic overflow")]
    Overflow,

    // ════════════════════════════════════════════════════════════════════════
    // CONSENSUS
    // ════════════════════════════════════════════════════════════════════════
    #[error("no active validators")]
    NoActiveValidators,

    #[error("wrong block producer at height {height}: expected {expected}, got {got}")]
    WrongProducer {
        height: u64,
        expected: Address,
        got: Address,
    },

    #[error("validator {0} is not active")]
    InactiveValidator(Address),

    #[error("stale block: timestamp {0} is too old")]
    StaleBlock(String),

    #[error("invalid block height: expected {expected}, got {got}")]
    InvalidHeight { expected: u64, got: u64 },

    #[error("invalid previous hash at height {0}")]
    InvalidPreviousHash(u64),

    #[error("state root mismatch at height {height}: expected {expected}, computed {computed}")]
    StateRootMismatch {
        height: u64,
        expected: Hash,
        computed: Hash,
    },

    #[error("validator {address} still jailed until {until}")]
    StillJailed { address: Address, until: String },

    #[error("validator {0} is not jailed")]
    NotJailed(Address),

    #[error("genesis already initialized")]
    GenesisExists,

    #[error("chain has no genesis block")]
    NoGenesis,

    // ════════════════════════════════════════════════════════════════════════
    // NOT FOUND
    // ════════════════════════════════════════════════════════════════════════
    #[error("account not found: {0}")]
    AccountNotFound(Address),

    #[error("validator not found: {0}")]
    ValidatorNotFound(Address),

    #[error("delegation not found: {delegator} -> {validator}")]
    DelegationNotFound {
        delegator: Address,
        validator: Address,
    },

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("transaction not found: {0}")]
    TransactionNotFound(Hash),

    // ════════════════════════════════════════════════════════════════════════
    // MEMPOOL
    // ════════════════════════════════════════════════════════════════════════
    #[error("transaction already known: {0}")]
    AlreadyKnown(Hash),

    #[error("mempool full: gas price {0} does not beat the current minimum")]
    MempoolFull(Amount),

    // ════════════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE
    // ════════════════════════════════════════════════════════════════════════
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// malformed key or signature bytes
    #[error("crypto error: {0}")]
    Crypto(String),

    /// malformed hex identifier or decimal amount
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ChainError {
    /// Consensus-rule violations; peers sending these are a networking concern.
    pub fn is_consensus(&self) -> bool {
        matches!(
            self,
            ChainError::NoActiveValidators
                | ChainError::WrongProducer { .. }
                | ChainError::InactiveValidator(_)
                | ChainError::StaleBlock(_)
                | ChainError::InvalidHeight { .. }
                | ChainError::InvalidPreviousHash(_)
                | ChainError::StateRootMismatch { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ChainError::AccountNotFound(_)
                | ChainError::ValidatorNotFound(_)
                | ChainError::DelegationNotFound { .. }
                | ChainError::BlockNotFound(_)
                | ChainError::TransactionNotFound(_)
        )
    }
}

/// Only the crypto helpers report through `anyhow`.
impl From<anyhow::Error> for ChainError {
    fn from(e: anyhow::Error) -> Self {
        ChainError::Crypto(e.to_string())
    }
}
