//! apex-storage
//!
//! Ordered key-value collaborator used by the apex ledger. Keys are byte
//! strings (the ledger uses structured ASCII keys such as `account:<hex>`),
//! values are opaque bytes.
//!
//! Two backends implement [`KvStore`]:
//! - [`MemoryKv`]: `BTreeMap` behind a lock, used by tests and ephemeral nodes.
//! - [`LmdbKv`]: a single named LMDB database, used by persistent nodes.

pub mod error;
pub mod store;
pub mod memory;
pub mod lmdb_store;

pub use crate::error::{Result, StorageError};
pub use crate::store::{BatchOp, KvStore, WriteBatch};
pub use crate::memory::MemoryKv;
pub use crate::lmdb_store::LmdbKv;
