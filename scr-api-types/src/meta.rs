use serde::{Deserialize, Serialize};

/// Role of a file within a dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    /// Written by the application through `route_file`.
    User,
    /// Parity shard or partner copy created by the redundancy engine.
    Redundancy,
}

impl Default for FileKind {
    fn default() -> Self {
        FileKind::User
    }
}

/// POSIX attributes captured when a file is registered, used to restore
/// ownership on flush and to notice tampering on fetch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatSnapshot {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Seconds and nanoseconds of the last modification.
    pub mtime: (i64, i64),
    /// Seconds and nanoseconds of the last status change.
    pub ctime: (i64, i64),
}

/// Metadata tracked for a single file owned by one process in one dataset.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileMeta {
    /// Absolute path the process actually wrote (cache, or prefix under bypass).
    pub path: String,
    /// Absolute origin path under the prefix directory, for user files.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub orig_path: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub crc32: Option<u32>,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub kind: FileKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stat: Option<StatSnapshot>,
}

impl FileMeta {
    pub fn new(path: impl Into<String>) -> Self {
        FileMeta {
            path: path.into(),
            orig_path: None,
            size: 0,
            crc32: None,
            complete: false,
            kind: FileKind::User,
            stat: None,
        }
    }

    pub fn new_redundancy(path: impl Into<String>) -> Self {
        FileMeta {
            kind: FileKind::Redundancy,
            ..FileMeta::new(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_defaults() {
        let meta = FileMeta::new("/cache/scr.dataset.1/rank_0.ckpt");
        assert_eq!(meta.kind, FileKind::User);
        assert!(!meta.complete);
        assert!(meta.crc32.is_none());

        let text = serde_json::to_string(&meta).unwrap();
        let back: FileMeta = serde_json::from_str(&text).unwrap();
        assert_eq!(back.path, meta.path);
        assert_eq!(back.kind, FileKind::User);
    }
}
