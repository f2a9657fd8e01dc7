//! Naming of dataset directories and the files inside them.

use std::path::{Path, PathBuf};

use scr_api_types::DATASET_DIR_REGEX;

/// Hidden subdirectory of a dataset cache directory holding filemaps and
/// redundancy shards.
pub const HIDDEN_DIR: &str = ".scr";

/// Cache directory name for a dataset.
pub fn dataset_dir_name(id: u64) -> String {
    format!("scr.dataset.{}", id)
}

/// Parse a dataset id back out of a cache directory name.
pub fn dataset_id_from_dir(name: &str) -> Option<u64> {
    DATASET_DIR_REGEX
        .captures(name)
        .and_then(|caps| caps[1].parse().ok())
}

/// The hidden subdirectory of a dataset directory.
pub fn hidden_dir<P: AsRef<Path>>(dataset_dir: P) -> PathBuf {
    dataset_dir.as_ref().join(HIDDEN_DIR)
}

/// Per-node subdirectory used when a store has a global view, so nodes do
/// not collide inside one shared dataset directory.
pub fn node_dir_name(hostid: u64) -> String {
    format!("node.{}", hostid)
}

/// Filemap of one owning process.
pub fn filemap_name(rank: usize) -> String {
    format!("filemap_{}", rank)
}

/// XOR parity shard of one redundancy set member.
pub fn xor_file_name(group_id: u64, member: usize, ranks: usize) -> String {
    format!("xor.{}_{}_of_{}.scr", group_id, member + 1, ranks)
}

/// Reed-Solomon parity shard of one redundancy set member.
pub fn rs_file_name(group_id: u64, member: usize, ranks: usize) -> String {
    format!("rs.{}_{}_of_{}.scr", group_id, member + 1, ranks)
}

/// Partner copy of a peer rank's file.
pub fn partner_file_name(world_rank: usize, basename: &str) -> String {
    format!("partner.{}.{}", world_rank, basename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_name_roundtrip() {
        assert_eq!(dataset_dir_name(12), "scr.dataset.12");
        assert_eq!(dataset_id_from_dir("scr.dataset.12"), Some(12));
        assert_eq!(dataset_id_from_dir("scr.dataset.x"), None);
        assert_eq!(dataset_id_from_dir("other"), None);
    }

    #[test]
    fn shard_names() {
        assert_eq!(xor_file_name(3, 1, 4), "xor.3_2_of_4.scr");
        assert_eq!(rs_file_name(0, 0, 8), "rs.0_1_of_8.scr");
        assert_eq!(partner_file_name(7, "rank_7.ckpt"), "partner.7.rank_7.ckpt");
    }
}
