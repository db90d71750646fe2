use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::store::{BatchOp, KvStore, WriteBatch};

/// In-memory [`KvStore`]. Batches are applied under one write lock.
#[derive(Debug, Default)]
pub struct MemoryKv {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.inner.read().contains_key(key))
    }

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.inner.read();
        let out = map
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(out)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut map = self.inner.write();
        for op in batch.ops() {
            match op {
                BatchOp::Put { key, value } => {
                    map.insert(key.clone(), value.clone());
                }
                BatchOp::Delete { key } => {
                    map.remove(key);
                }
            }
        }
        debug!(ops = batch.len(), "memory kv batch applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_put_get_delete() {
        let kv = MemoryKv::new();
        kv.put(b"account:aa", b"1").unwrap();
        assert_eq!(kv.get(b"account:aa").unwrap(), Some(b"1".to_vec()));
        assert!(kv.has(b"account:aa").unwrap());

        kv.delete(b"account:aa").unwrap();
        assert_eq!(kv.get(b"account:aa").unwrap(), None);
        assert!(!kv.has(b"account:aa").unwrap());
    }

    #[test]
    fn test_memory_iterate_prefix_sorted() {
        let kv = MemoryKv::new();
        kv.put(b"validator:02", b"b").unwrap();
        kv.put(b"account:01", b"x").unwrap();
        kv.put(b"validator:01", b"a").unwrap();
        kv.put(b"validatorz", b"z").unwrap();

        let entries = kv.iterate(b"validator:").unwrap();
        let keys: Vec<&[u8]> = entries.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"validator:01".as_slice(), b"validator:02".as_slice()]);
    }

    #[test]
    fn test_memory_batch_last_write_wins() {
        let kv = MemoryKv::new();
        kv.put(b"gone", b"1").unwrap();

        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"1".to_vec());
        batch.put(b"k".to_vec(), b"2".to_vec());
        batch.delete(b"gone".to_vec());
        kv.write_batch(batch).unwrap();

        assert_eq!(kv.get(b"k").unwrap(), Some(b"2".to_vec()));
        assert!(!kv.has(b"gone").unwrap());
        assert_eq!(kv.len(), 1);
    }
}
