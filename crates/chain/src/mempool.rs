use crate::error::{ChainError, Result};
use crate::tx::Transaction;
use crate::types::{Address, Amount, Hash};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

#[derive(Clone, Debug)]
struct Entry {
    hash: Hash,
    gas_price: Amount,
    /// arrival order; earlier wins ties
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.gas_price == other.gas_price && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.gas_price.cmp(&other.gas_price) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

#[derive(Default)]
struct Pool {
    txs: HashMap<Hash, Transaction>,
    heap: BinaryHeap<Entry>,
    /// (sender, nonce) -> hash
    nonces: HashMap<(Address, u64), Hash>,
    next_seq: u64,
    rejected: usize,
}

impl Pool {
    fn remove(&mut self, hash: &Hash) -> Option<Transaction> {
        let tx = self.txs.remove(hash)?;
        self.nonces.remove(&(tx.from, tx.nonce));
        self.heap.retain(|e| &e.hash != hash);
        Some(tx)
    }

    fn lowest(&self) -> Option<Entry> {
        self.heap.iter().min().cloned()
    }
}

/// Pending transactions ordered by gas price.
///
/// Index and heap live behind one lock so they never disagree. The pool is
/// bounded: when full, an incoming transaction must pay strictly more than
/// the cheapest pending one, which it then replaces.
pub struct Mempool {
    pool: RwLock<Pool>,
    max_size: usize,
}

impl std::fmt::Debug for Mempool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mempool")
            .field("size", &self.size())
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl Mempool {
    pub fn new(max_size: usize) -> Self {
        Self { pool: RwLock::new(Pool::default()), max_size: max_size.max(1) }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn add_transaction(&self, tx: Transaction) -> Result<Hash> {
        let mut pool = self.pool.write();

        if pool.txs.contains_key(&tx.hash) {
            pool.rejected += 1;
            return Err(ChainError::AlreadyKnown(tx.hash));
        }
        if let Err(e) = tx.validate() {
            pool.rejected += 1;
            return Err(e);
        }
        if pool.nonces.contains_key(&(tx.from, tx.nonce)) {
            pool.rejected += 1;
            return Err(ChainError::InvalidTransaction(format!(
                "sender {} already has a pending tx with nonce {}",
                tx.from, tx.nonce
            )));
        }

        if pool.txs.len() >= self.max_size {
            match pool.lowest() {
                Some(lowest) if tx.gas_price > lowest.gas_price => {
                    pool.remove(&lowest.hash);
                    debug!(evicted = %lowest.hash, gas_price = lowest.gas_price, "mempool eviction");
                }
                _ => {
                    pool.rejected += 1;
                    return Err(ChainError::MempoolFull(tx.gas_price));
                }
            }
        }

        let hash = tx.hash;
        let seq = pool.next_seq;
        pool.next_seq += 1;
        pool.heap.push(Entry { hash, gas_price: tx.gas_price, seq });
        pool.nonces.insert((tx.from, tx.nonce), hash);
        pool.txs.insert(hash, tx);
        debug!(tx = %hash, size = pool.txs.len(), "tx added to mempool");
        Ok(hash)
    }

    pub fn remove_transaction(&self, hash: &Hash) -> Option<Transaction> {
        self.pool.write().remove(hash)
    }

    pub fn remove_transactions(&self, hashes: &[Hash]) -> usize {
        let mut pool = self.pool.write();
        let removed = hashes.iter().filter(|h| pool.remove(h).is_some()).count();
        if removed > 0 {
            debug!(removed, size = pool.txs.len(), "txs removed from mempool");
        }
        removed
    }

    pub fn get_transaction(&self, hash: &Hash) -> Option<Transaction> {
        self.pool.read().txs.get(hash).cloned()
    }

    /// Up to `limit` transactions in heap order. Only the first is
    /// guaranteed to carry the highest gas price; nothing is removed.
    pub fn get_transactions(&self, limit: usize) -> Vec<Transaction> {
        let pool = self.pool.read();
        pool.heap
            .iter()
            .take(limit)
            .filter_map(|e| pool.txs.get(&e.hash).cloned())
            .collect()
    }

    /// Every pending transaction, highest gas price first, ties by arrival.
    pub fn get_sorted_transactions(&self) -> Vec<Transaction> {
        let pool = self.pool.read();
        let mut entries: Vec<&Entry> = pool.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .filter_map(|e| pool.txs.get(&e.hash).cloned())
            .collect()
    }

    /// Pending transactions of one sender, by nonce.
    pub fn pending_for(&self, sender: &Address) -> Vec<Transaction> {
        let pool = self.pool.read();
        let mut txs: Vec<Transaction> = pool.txs.values().filter(|t| &t.from == sender).cloned().collect();
        txs.sort_by_key(|t| t.nonce);
        txs
    }

    pub fn has(&self, hash: &Hash) -> bool {
        self.pool.read().txs.contains_key(hash)
    }

    pub fn size(&self) -> usize {
        self.pool.read().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn rejected_count(&self) -> usize {
        self.pool.read().rejected
    }

    pub fn clear(&self) {
        let mut pool = self.pool.write();
        pool.txs.clear();
        pool.heap.clear();
        pool.nonces.clear();
    }
}
