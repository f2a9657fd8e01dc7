//! Basic data types shared across the scr workspace.
//!
//! Everything here is plain data: serde structs and enums persisted in the
//! canonical key/value text encoding, plus the name patterns used to
//! recognize files that scr writes on disk.

use lazy_static::lazy_static;
use regex::Regex;

mod dataset;
pub use dataset::{Dataset, DatasetFlags};

mod meta;
pub use meta::{FileKind, FileMeta, StatSnapshot};

mod halt;
pub use halt::HaltState;

use serde::{Deserialize, Serialize};

lazy_static! {
    /// Cache directory of a dataset: `scr.dataset.<id>`.
    pub static ref DATASET_DIR_REGEX: Regex =
        Regex::new(r"^scr\.dataset\.([0-9]+)$").unwrap();

    /// XOR parity shard: `xor.<group>_<member>_of_<ranks>.scr`.
    pub static ref XOR_FILE_REGEX: Regex =
        Regex::new(r"^xor\.([0-9]+)_([0-9]+)_of_([0-9]+)\.scr$").unwrap();

    /// Reed-Solomon parity shard: `rs.<group>_<member>_of_<ranks>.scr`.
    pub static ref RS_FILE_REGEX: Regex =
        Regex::new(r"^rs\.([0-9]+)_([0-9]+)_of_([0-9]+)\.scr$").unwrap();

    /// Partner copy of a peer's file: `partner.<world rank>.<basename>`.
    pub static ref PARTNER_FILE_REGEX: Regex =
        Regex::new(r"^partner\.([0-9]+)\.(.+)$").unwrap();

    /// Per-process filemap inside the hidden subdir: `filemap_<rank>`.
    pub static ref FILEMAP_FILE_REGEX: Regex =
        Regex::new(r"^filemap_([0-9]+)$").unwrap();

    /// Group and store descriptor names.
    pub static ref DESCRIPTOR_NAME_REGEX: Regex =
        Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").unwrap();
}

/// Where the bytes of a dataset currently live, as recorded in the per-job
/// flush file for the scavenger tooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Location {
    Cache,
    Flushing,
    Pfs,
}

serde_plain::derive_display_from_serialize!(Location);
serde_plain::derive_fromstr_from_deserialize!(Location);

/// Redundancy scheme applied across a process group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CopyType {
    Single,
    Partner,
    Xor,
    Rs,
}

serde_plain::derive_display_from_serialize!(CopyType);
serde_plain::derive_fromstr_from_deserialize!(CopyType);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_type_strings() {
        assert_eq!("XOR".parse::<CopyType>().unwrap(), CopyType::Xor);
        assert_eq!(CopyType::Partner.to_string(), "PARTNER");
        assert!("xor".parse::<CopyType>().is_err());
    }

    #[test]
    fn name_patterns() {
        let caps = DATASET_DIR_REGEX.captures("scr.dataset.17").unwrap();
        assert_eq!(&caps[1], "17");
        assert!(!DATASET_DIR_REGEX.is_match("scr.dataset."));

        let caps = XOR_FILE_REGEX.captures("xor.3_2_of_4.scr").unwrap();
        assert_eq!(&caps[2], "2");

        let caps = PARTNER_FILE_REGEX.captures("partner.5.rank_5.ckpt").unwrap();
        assert_eq!(&caps[1], "5");
        assert_eq!(&caps[2], "rank_5.ckpt");
    }
}
