//! Process-local cache state.
//!
//! Each process tracks the datasets it holds in cache through two records
//! in the control directory: the cache index (one per process) and one
//! filemap per dataset. Both are plain key/value trees rewritten atomically
//! after every mutation that changes on-disk state, so a crashed run can be
//! reconstructed exactly from what is found on disk.

pub mod cindex;
pub mod filemap;
pub mod layout;

pub use cindex::{CacheIndex, CacheIndexEntry};
pub use filemap::Filemap;
