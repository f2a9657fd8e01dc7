//! File system helper utilities.
//!
//! Raw reads and writes against local storage go through a bounded retry so
//! that a transient failure of a flaky cache device surfaces as a single
//! fail-with-cause error to the caller.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, format_err, Context, Error};
use nix::sys::stat::FileStat;
use nix::sys::time::TimeSpec;

/// Attempts made for a raw read or write before giving up.
const IO_ATTEMPTS: usize = 3;

/// Delay between attempts.
const IO_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Default copy buffer size (1 MiB), tunable per call site.
pub const FILE_BUF_SIZE: usize = 1024 * 1024;

/// Create a directory and all of its parents.
pub fn create_path<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    std::fs::create_dir_all(path)
        .map_err(|err| format_err!("unable to create directory {:?} - {}", path, err))
}

/// Atomically replace the contents of a file.
///
/// Data is written to a temporary sibling first and moved into place with
/// rename, so readers never observe a partial file. Temporary names are
/// unique per writer, so concurrent replacements of one path cannot feed
/// each other half-written data.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8], fsync: bool) -> Result<(), Error> {
    static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

    let path = path.as_ref();
    let tmp_path = {
        let mut os = path.as_os_str().to_owned();
        os.push(&format!(
            ".tmp.{}.{}",
            std::process::id(),
            SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        ));
        PathBuf::from(os)
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(&tmp_path)
        .map_err(|err| format_err!("unable to open {:?} for writing - {}", tmp_path, err))?;

    let result = write_retry(&mut file, data).and_then(|_| {
        if fsync {
            file.sync_all()
                .map_err(|err| format_err!("fsync of {:?} failed - {}", tmp_path, err))?;
        }
        std::fs::rename(&tmp_path, path)
            .map_err(|err| format_err!("rename {:?} to {:?} failed - {}", tmp_path, path, err))
    });

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

/// Read an entire file, retrying transient failures a bounded number of times.
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, Error> {
    let path = path.as_ref();
    let mut last_err = None;
    for attempt in 0..IO_ATTEMPTS {
        if attempt > 0 {
            std::thread::sleep(IO_RETRY_DELAY);
        }
        match std::fs::read(path) {
            Ok(data) => return Ok(data),
            Err(err) => {
                if err.kind() == ErrorKind::NotFound {
                    return Err(format_err!("unable to read {:?} - {}", path, err));
                }
                log::warn!("read of {:?} failed (attempt {}) - {}", path, attempt + 1, err);
                last_err = Some(err);
            }
        }
    }
    Err(format_err!(
        "unable to read {:?} after {} attempts - {}",
        path,
        IO_ATTEMPTS,
        last_err.unwrap()
    ))
}

fn write_retry(file: &mut File, data: &[u8]) -> Result<(), Error> {
    let mut last_err = None;
    for attempt in 0..IO_ATTEMPTS {
        if attempt > 0 {
            std::thread::sleep(IO_RETRY_DELAY);
            file.seek(SeekFrom::Start(0))?;
            file.set_len(0)?;
        }
        match file.write_all(data) {
            Ok(()) => return Ok(()),
            Err(err) => {
                log::warn!("write failed (attempt {}) - {}", attempt + 1, err);
                last_err = Some(err);
            }
        }
    }
    Err(format_err!(
        "write failed after {} attempts - {}",
        IO_ATTEMPTS,
        last_err.unwrap()
    ))
}

/// Return the size of a file in bytes.
pub fn file_size<P: AsRef<Path>>(path: P) -> Result<u64, Error> {
    let path = path.as_ref();
    let metadata = std::fs::metadata(path)
        .map_err(|err| format_err!("unable to stat {:?} - {}", path, err))?;
    Ok(metadata.len())
}

/// Check whether a file exists and is readable by this process.
pub fn is_readable<P: AsRef<Path>>(path: P) -> bool {
    File::open(path.as_ref()).is_ok()
}

/// Stat a file through nix, exposing the full POSIX record.
pub fn stat_file<P: AsRef<Path>>(path: P) -> Result<FileStat, Error> {
    let path = path.as_ref();
    nix::sys::stat::stat(path).map_err(|err| format_err!("unable to stat {:?} - {}", path, err))
}

/// Lexically simplify a path, folding out `.` and `..` components.
pub fn simplify_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.as_ref().components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !result.pop() {
                    result.push(Component::ParentDir);
                }
            }
            other => result.push(other),
        }
    }
    result
}

/// Check whether `child` lies within `parent` after lexical simplification.
pub fn path_within<P: AsRef<Path>, Q: AsRef<Path>>(child: P, parent: Q) -> bool {
    simplify_path(child).starts_with(simplify_path(parent))
}

/// Compute the CRC32 of a file's contents.
pub fn crc32_file<P: AsRef<Path>>(path: P) -> Result<u32, Error> {
    let path = path.as_ref();
    let mut file =
        File::open(path).map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; FILE_BUF_SIZE];
    loop {
        let count = file
            .read(&mut buf)
            .map_err(|err| format_err!("read of {:?} failed - {}", path, err))?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }
    Ok(hasher.finalize())
}

/// Copy `src` to `dst`, returning the byte count and, if requested, the CRC32
/// of the copied data. The destination is replaced, never appended.
pub fn copy_file<P: AsRef<Path>, Q: AsRef<Path>>(
    src: P,
    dst: Q,
    buf_size: usize,
    with_crc: bool,
) -> Result<(u64, Option<u32>), Error> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    let mut reader =
        File::open(src).map_err(|err| format_err!("unable to open {:?} - {}", src, err))?;
    let mut writer = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(dst)
        .map_err(|err| format_err!("unable to open {:?} for writing - {}", dst, err))?;

    let mut hasher = with_crc.then(crc32fast::Hasher::new);
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut total = 0u64;
    loop {
        let count = reader
            .read(&mut buf)
            .map_err(|err| format_err!("read of {:?} failed - {}", src, err))?;
        if count == 0 {
            break;
        }
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buf[..count]);
        }
        write_retry(&mut writer, &buf[..count])
            .context(format!("copy to {:?} failed", dst))?;
        total += count as u64;
    }
    writer
        .sync_all()
        .map_err(|err| format_err!("fsync of {:?} failed - {}", dst, err))?;

    Ok((total, hasher.map(|h| h.finalize())))
}

/// Restore mode, ownership and modification time on a flushed or fetched file.
///
/// Ownership changes are skipped for other users unless running as root;
/// a failed chown is not an error for an unprivileged process.
pub fn apply_metadata<P: AsRef<Path>>(
    path: P,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: (i64, i64),
) -> Result<(), Error> {
    let path = path.as_ref();

    let mode = nix::sys::stat::Mode::from_bits_truncate(mode);
    nix::sys::stat::fchmodat(
        None,
        path,
        mode,
        nix::sys::stat::FchmodatFlags::FollowSymlink,
    )
    .map_err(|err| format_err!("chmod of {:?} failed - {}", path, err))?;

    let uid = nix::unistd::Uid::from_raw(uid);
    let gid = nix::unistd::Gid::from_raw(gid);
    if let Err(err) = nix::unistd::chown(path, Some(uid), Some(gid)) {
        log::debug!("chown of {:?} to {}:{} failed - {}", path, uid, gid, err);
    }

    let times = TimeSpec::new(mtime.0, mtime.1);
    nix::sys::stat::utimensat(
        None,
        path,
        &times,
        &times,
        nix::sys::stat::UtimensatFlags::FollowSymlink,
    )
    .map_err(|err| format_err!("utimensat of {:?} failed - {}", path, err))?;

    Ok(())
}

/// Remove a file, treating a missing file as success.
pub fn remove_file_quiet<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => bail!("unable to remove {:?} - {}", path, err),
    }
}

/// Remove a directory tree, treating a missing directory as success.
pub fn remove_dir_all_quiet<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => bail!("unable to remove directory {:?} - {}", path, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplify() {
        assert_eq!(
            simplify_path("/a/b/../c/./d"),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(simplify_path("a/./b"), PathBuf::from("a/b"));
        assert_eq!(simplify_path("../x"), PathBuf::from("../x"));
        assert!(path_within("/pfs/run1/ckpt/file", "/pfs/run1"));
        assert!(!path_within("/pfs/run1/../run2/file", "/pfs/run1"));
    }

    #[test]
    fn replace_and_read() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data");
        replace_file(&path, b"first", false)?;
        replace_file(&path, b"second", true)?;
        assert_eq!(read_file(&path)?, b"second");
        Ok(())
    }

    #[test]
    fn copy_with_crc() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        replace_file(&src, b"0123456789", false)?;

        let (bytes, crc) = copy_file(&src, &dst, 4, true)?;
        assert_eq!(bytes, 10);
        assert_eq!(crc, Some(crc32_file(&dst)?));
        assert_eq!(read_file(&dst)?, b"0123456789");
        Ok(())
    }

    #[test]
    fn zero_byte_copy() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("empty");
        let dst = dir.path().join("empty.out");
        replace_file(&src, b"", false)?;
        let (bytes, crc) = copy_file(&src, &dst, FILE_BUF_SIZE, true)?;
        assert_eq!(bytes, 0);
        assert_eq!(crc, Some(crc32fast::hash(b"")));
        Ok(())
    }
}
