//! A page-based storage manager with large objects and multilevel grid file indexes,
//! protected by a write-ahead log.

mod action;
mod bins;
mod db;
mod error;
mod file_lock;
mod id;
mod lock;
mod log;
mod lot;
mod mlgf;
mod pager;
mod recovery;
mod segment;
mod wal;
mod xact;

#[cfg(test)]
mod testing;

pub use db::{IndexId, LockRequest, Setting, Storage, Transaction};
pub use error::{Error, Result};
pub use id::{ObjectId, PageId, ShortPageId, TxId, VolNo};
pub use lock::{LockDuration, LockMode, LockResource};
pub use mlgf::{Extreme, KeyDesc, MAX_KEYS};
