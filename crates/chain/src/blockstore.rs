//! Block archive over the key-value collaborator.
//!
//! Layout:
//! - `block:hash:<hex>` -> bincode block
//! - `block:number:<n>` -> raw 64-byte block hash
//! - `tx:<hex>` / `receipt:<hex>` -> bincode transaction / receipt
//! - `latest_block_number` -> 8-byte big endian height

use std::sync::Arc;

use apex_storage::{KvStore, WriteBatch};
use serde::de::DeserializeOwned;

use crate::block::{Block, TxReceipt};
use crate::error::{ChainError, Result};
use crate::state::keys;
use crate::tx::Transaction;
use crate::types::Hash;

#[derive(Debug, Clone)]
pub struct BlockStore {
    kv: Arc<dyn KvStore>,
}

impl BlockStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn read<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.kv.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every write needed to archive `block`, for committing alongside the
    /// block's state changes.
    pub fn block_batch(&self, block: &Block) -> Result<WriteBatch> {
        let mut batch = WriteBatch::new();
        batch.put(keys::block_hash_key(&block.hash), bincode::serialize(block)?);
        batch.put(keys::block_number_key(block.height()), block.hash.as_bytes().to_vec());
        for tx in &block.transactions {
            batch.put(keys::tx_key(&tx.hash), bincode::serialize(tx)?);
            let receipt = TxReceipt::success(tx, block);
            batch.put(keys::receipt_key(&tx.hash), bincode::serialize(&receipt)?);
        }
        let latest = self.get_latest_block_number()?;
        if latest.map_or(true, |n| block.height() >= n) {
            batch.put(keys::LATEST_BLOCK_NUMBER_KEY, block.height().to_be_bytes().to_vec());
        }
        Ok(batch)
    }

    pub fn put_block(&self, block: &Block) -> Result<()> {
        let batch = self.block_batch(block)?;
        self.kv.write_batch(batch)?;
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Block> {
        self.read(&keys::block_hash_key(hash))?
            .ok_or_else(|| ChainError::BlockNotFound(hash.to_hex()))
    }

    pub fn has_block(&self, hash: &Hash) -> Result<bool> {
        Ok(self.kv.has(&keys::block_hash_key(hash))?)
    }

    pub fn get_block_hash(&self, number: u64) -> Result<Option<Hash>> {
        let Some(bytes) = self.kv.get(&keys::block_number_key(number))? else {
            return Ok(None);
        };
        let raw: [u8; 64] = bytes.as_slice().try_into().map_err(|_| {
            ChainError::Storage(apex_storage::StorageError::Corrupted {
                key: format!("block:number:{}", number),
                reason: format!("expected 64-byte hash, found {} bytes", bytes.len()),
            })
        })?;
        Ok(Some(Hash::from_bytes(raw)))
    }

    pub fn get_block_by_number(&self, number: u64) -> Result<Block> {
        match self.get_block_hash(number)? {
            Some(hash) => self.get_block(&hash),
            None => Err(ChainError::BlockNotFound(format!("#{}", number))),
        }
    }

    pub fn get_latest_block_number(&self) -> Result<Option<u64>> {
        let Some(bytes) = self.kv.get(keys::LATEST_BLOCK_NUMBER_KEY)? else {
            return Ok(None);
        };
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            ChainError::Storage(apex_storage::StorageError::Corrupted {
                key: "latest_block_number".into(),
                reason: format!("expected 8 bytes, found {}", bytes.len()),
            })
        })?;
        Ok(Some(u64::from_be_bytes(raw)))
    }

    pub fn get_latest_block(&self) -> Result<Option<Block>> {
        match self.get_latest_block_number()? {
            Some(n) => self.get_block_by_number(n).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_transaction(&self, hash: &Hash) -> Result<Transaction> {
        self.read(&keys::tx_key(hash))?.ok_or(ChainError::TransactionNotFound(*hash))
    }

    pub fn get_receipt(&self, hash: &Hash) -> Result<TxReceipt> {
        self.read(&keys::receipt_key(hash))?.ok_or(ChainError::TransactionNotFound(*hash))
    }

    /// Blocks `start..=end` that exist, stopping at the first gap.
    pub fn get_block_range(&self, start: u64, end: u64) -> Result<Vec<Block>> {
        if start > end {
            return Err(ChainError::InvalidBlock(format!("empty range {}..={}", start, end)));
        }
        let mut blocks = Vec::new();
        for number in start..=end {
            match self.get_block_by_number(number) {
                Ok(block) => blocks.push(block),
                Err(ChainError::BlockNotFound(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(blocks)
    }
}
