use std::fmt;
use std::path::{Path, PathBuf};

use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use tracing::debug;

use crate::error::Result;
use crate::store::{BatchOp, KvStore, WriteBatch};

const DB_NAME: &str = "apex_kv";
const DEFAULT_MAP_SIZE: usize = 1_000_000_000;

/// LMDB-backed [`KvStore`]. All keys live in one named database so that
/// prefix scans follow LMDB's lexicographic key order.
pub struct LmdbKv {
    env: Environment,
    db: Database,
    path: PathBuf,
}

impl fmt::Debug for LmdbKv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LmdbKv").field("path", &self.path).finish()
    }
}

impl LmdbKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_map_size(path, DEFAULT_MAP_SIZE)
    }

    pub fn open_with_map_size(path: impl AsRef<Path>, map_size: usize) -> Result<Self> {
        let p = path.as_ref();
        std::fs::create_dir_all(p)?;

        let env = Environment::new()
            .set_max_dbs(1)
            .set_map_size(map_size)
            .open(p)?;
        let db = env.create_db(Some(DB_NAME), DatabaseFlags::empty())?;

        debug!(path = %p.display(), map_size, "lmdb kv opened");
        Ok(Self { env, db, path: p.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KvStore for LmdbKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let rtxn = self.env.begin_ro_txn()?;
        match rtxn.get(self.db, &key) {
            Ok(v) => Ok(Some(v.to_vec())),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut wtxn = self.env.begin_rw_txn()?;
        wtxn.put(self.db, &key, &value, WriteFlags::empty())?;
        wtxn.commit()?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut wtxn = self.env.begin_rw_txn()?;
        match wtxn.del(self.db, &key, None) {
            Ok(()) | Err(lmdb::Error::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        wtxn.commit()?;
        Ok(())
    }

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut out = Vec::new();
        {
            let mut cursor = rtxn.open_ro_cursor(self.db)?;
            // seek to the first key >= prefix; matches are contiguous from there
            for (key, val) in cursor.iter_from(prefix) {
                if !key.starts_with(prefix) {
                    break;
                }
                out.push((key.to_vec(), val.to_vec()));
            }
        }
        Ok(out)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut wtxn = self.env.begin_rw_txn()?;
        for op in batch.ops() {
            match op {
                BatchOp::Put { key, value } => {
                    wtxn.put(self.db, key, value, WriteFlags::empty())?;
                }
                BatchOp::Delete { key } => match wtxn.del(self.db, key, None) {
                    Ok(()) | Err(lmdb::Error::NotFound) => {}
                    Err(e) => return Err(e.into()),
                },
            }
        }
        wtxn.commit()?;
        debug!(ops = batch.len(), "lmdb kv batch committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lmdb_put_get_has_delete() {
        let dir = TempDir::new().unwrap();
        let kv = LmdbKv::open(dir.path()).unwrap();

        kv.put(b"account:01", b"hello").unwrap();
        assert_eq!(kv.get(b"account:01").unwrap(), Some(b"hello".to_vec()));
        assert!(kv.has(b"account:01").unwrap());

        kv.delete(b"account:01").unwrap();
        assert!(!kv.has(b"account:01").unwrap());
        // deleting a missing key is not an error
        kv.delete(b"account:01").unwrap();
    }

    #[test]
    fn test_lmdb_batch_and_prefix_scan() {
        let dir = TempDir::new().unwrap();
        let kv = LmdbKv::open(dir.path()).unwrap();

        let mut batch = WriteBatch::new();
        batch.put(b"delegation:02:aa".to_vec(), b"2".to_vec());
        batch.put(b"delegation:01:aa".to_vec(), b"1".to_vec());
        batch.put(b"validator:aa".to_vec(), b"v".to_vec());
        batch.put(b"account:ff".to_vec(), b"a".to_vec());
        kv.write_batch(batch).unwrap();

        let entries = kv.iterate(b"delegation:").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, b"delegation:01:aa".to_vec());
        assert_eq!(entries[1].1, b"2".to_vec());

        assert!(kv.iterate(b"receipt:").unwrap().is_empty());
    }

    #[test]
    fn test_lmdb_prefix_scan_skips_earlier_keys() {
        let dir = TempDir::new().unwrap();
        let kv = LmdbKv::open(dir.path()).unwrap();

        let mut batch = WriteBatch::new();
        for height in 0u64..500 {
            batch.put(format!("block:{:08}", height).into_bytes(), vec![1; 64]);
        }
        batch.put(b"validator:02".to_vec(), b"b".to_vec());
        batch.put(b"validator:01".to_vec(), b"a".to_vec());
        batch.put(b"validatorx".to_vec(), b"x".to_vec());
        kv.write_batch(batch).unwrap();

        let validators = kv.iterate(b"validator:").unwrap();
        let keys: Vec<&[u8]> = validators.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"validator:01"[..], &b"validator:02"[..]]);
        assert_eq!(kv.iterate(b"block:").unwrap().len(), 500);

        // absent prefixes before, between and after the stored keys
        assert!(kv.iterate(b"account:").unwrap().is_empty());
        assert!(kv.iterate(b"delegation:").unwrap().is_empty());
        assert!(kv.iterate(b"zzz:").unwrap().is_empty());
    }

    #[test]
    fn test_lmdb_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        {
            let kv = LmdbKv::open(dir.path()).unwrap();
            kv.put(b"latest_block_number", &7u64.to_be_bytes()).unwrap();
        }
        let kv = LmdbKv::open(dir.path()).unwrap();
        assert_eq!(kv.get(b"latest_block_number").unwrap(), Some(7u64.to_be_bytes().to_vec()));
    }
}
