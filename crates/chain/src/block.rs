//! Block structure
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{address_from_pubkey_bytes, sha3_512, verify_signature, KeyPair};
use crate::error::{ChainError, Result};
use crate::tx::Transaction;
use crate::types::{Address, Amount, Hash};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub previous_hash: Hash,
    pub timestamp: DateTime<Utc>,
    pub tx_root: Hash,
    pub state_root: Hash,
    pub producer: Address,
    /// Public key for signature verification
    pub producer_pubkey: Vec<u8>,
    pub signature: Vec<u8>,
    pub gas_used: u64,
    pub gas_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: Hash,
    pub block_hash: Hash,
    pub block_height: u64,
    pub from: Address,
    pub to: Address,
    pub gas_used: u64,
    /// 1 = success; failing transactions never make it into a block
    pub status: u8,
}

impl TxReceipt {
    pub fn success(tx: &Transaction, block: &Block) -> Self {
        Self {
            tx_hash: tx.hash,
            block_hash: block.hash,
            block_height: block.height(),
            from: tx.from,
            to: tx.to,
            gas_used: tx.gas_limit,
            status: 1,
        }
    }
}

impl Block {
    pub fn new(
        height: u64,
        previous_hash: Hash,
        producer: Address,
        producer_pubkey: Vec<u8>,
        timestamp: DateTime<Utc>,
        gas_limit: u64,
    ) -> Self {
        Block {
            header: BlockHeader {
                height,
                previous_hash,
                timestamp,
                tx_root: Hash::zero(),
                state_root: Hash::zero(),
                producer,
                producer_pubkey,
                signature: Vec::new(),
                gas_used: 0,
                gas_limit,
            },
            transactions: Vec::new(),
            hash: Hash::zero(),
        }
    }

    /// Height 0: no producer, no signature.
    pub fn genesis(timestamp: DateTime<Utc>, state_root: Hash, gas_limit: u64) -> Result<Self> {
        let mut block = Block::new(0, Hash::zero(), Address::default(), Vec::new(), timestamp, gas_limit);
        block.finalize(state_root)?;
        Ok(block)
    }

    /// Whether `gas` more units still fit under the block gas limit.
    pub fn has_room_for(&self, gas: u64) -> bool {
        self.header.gas_used.checked_add(gas).map_or(false, |g| g <= self.header.gas_limit)
    }

    /// Append if the transaction's gas limit still fits the block.
    pub fn add_transaction(&mut self, tx: Transaction) -> bool {
        if !self.has_room_for(tx.gas_limit) {
            return false;
        }
        self.header.gas_used += tx.gas_limit;
        self.transactions.push(tx);
        true
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Compute tx_root: SHA3-512 of concatenated tx hashes, zero hash when empty
    pub fn compute_tx_root(txs: &[Transaction]) -> Hash {
        if txs.is_empty() {
            return Hash::zero();
        }
        let mut accum = Vec::with_capacity(txs.len() * 64);
        for tx in txs {
            accum.extend_from_slice(tx.hash.as_bytes());
        }
        sha3_512(&accum)
    }

    /// Hash of every header field except the signature.
    pub fn compute_hash(header: &BlockHeader) -> Result<Hash> {
        let header_bytes = serde_json::to_vec(&(
            &header.height,
            &header.previous_hash,
            &header.timestamp,
            &header.tx_root,
            &header.state_root,
            &header.producer,
            hex::encode(&header.producer_pubkey),
            &header.gas_used,
            &header.gas_limit,
        ))?;
        Ok(sha3_512(&header_bytes))
    }

    /// Set roots and the block hash.
    pub fn finalize(&mut self, state_root: Hash) -> Result<()> {
        self.header.tx_root = Self::compute_tx_root(&self.transactions);
        self.header.state_root = state_root;
        self.hash = Self::compute_hash(&self.header)?;
        Ok(())
    }

    /// Sign the block hash with the producer key. Call after `finalize`.
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<()> {
        self.header.signature = keypair.sign(self.hash.as_bytes())?;
        Ok(())
    }

    pub fn verify_signature(&self) -> bool {
        if self.header.producer_pubkey.is_empty() || self.header.signature.is_empty() {
            return false;
        }
        verify_signature(&self.header.producer_pubkey, self.hash.as_bytes(), &self.header.signature)
            .unwrap_or(false)
    }

    pub fn tx_hashes(&self) -> Vec<Hash> {
        self.transactions.iter().map(|tx| tx.hash).collect()
    }

    pub fn total_value(&self) -> Amount {
        self.transactions.iter().fold(0u128, |acc, tx| acc.saturating_add(tx.value))
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Structural checks that need no chain state.
    pub fn validate(&self, now: DateTime<Utc>, max_future_drift_secs: i64) -> Result<()> {
        if self.header.timestamp > now + Duration::seconds(max_future_drift_secs) {
            return Err(ChainError::InvalidBlock(format!(
                "timestamp {} too far in the future",
                self.header.timestamp
            )));
        }
        if self.header.gas_used > self.header.gas_limit {
            return Err(ChainError::InvalidBlock(format!(
                "gas used {} exceeds gas limit {}",
                self.header.gas_used, self.header.gas_limit
            )));
        }
        let declared_gas = self
            .transactions
            .iter()
            .try_fold(0u64, |acc, tx| acc.checked_add(tx.gas_limit))
            .ok_or(ChainError::Overflow)?;
        if declared_gas != self.header.gas_used {
            return Err(ChainError::InvalidBlock("gas used does not match transactions".into()));
        }
        for tx in &self.transactions {
            tx.validate()?;
        }
        if Self::compute_tx_root(&self.transactions) != self.header.tx_root {
            return Err(ChainError::InvalidBlock("tx root mismatch".into()));
        }
        if Self::compute_hash(&self.header)? != self.hash {
            return Err(ChainError::InvalidBlock("block hash mismatch".into()));
        }
        if self.header.signature.is_empty() {
            return Err(ChainError::InvalidBlock("missing signature".into()));
        }
        if address_from_pubkey_bytes(&self.header.producer_pubkey) != self.header.producer {
            return Err(ChainError::InvalidBlock("producer key does not match producer".into()));
        }
        if !self.verify_signature() {
            return Err(ChainError::InvalidBlock("invalid producer signature".into()));
        }
        Ok(())
    }
}
