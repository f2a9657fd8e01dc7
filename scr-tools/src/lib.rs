//! File system, checksum and locking helpers for the scr workspace.

pub mod fs;
pub mod lock;
