//! Advisory whole-file locks over fcntl record locks.
//!
//! Used for the files in the prefix directory that several jobs or external
//! scripts may touch concurrently (durable index, halt file). Control
//! directory files are process-local and never locked.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};

const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// A file held under an advisory fcntl lock.
///
/// The lock covers the whole file and is released on drop. Acquisition is
/// non-blocking with a bounded wait so a dead peer cannot wedge the job.
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

fn flock_op(ltype: i32) -> libc::flock {
    libc::flock {
        l_type: ltype as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    }
}

impl LockedFile {
    /// Open (creating if necessary) and lock a file, waiting up to `timeout`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        timeout: Duration,
        exclusive: bool,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| format_err!("unable to open lock file {:?} - {}", path, err))?;

        let ltype = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK };
        let op = flock_op(ltype);

        let deadline = Instant::now() + timeout;
        loop {
            match nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&op)) {
                Ok(_) => break,
                Err(nix::errno::Errno::EACCES) | Err(nix::errno::Errno::EAGAIN) => {
                    if Instant::now() >= deadline {
                        bail!("timeout while locking {:?}", path);
                    }
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(err) => bail!("unable to lock {:?} - {}", path, err),
            }
        }

        Ok(LockedFile {
            file,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the full contents of the locked file.
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>, Error> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        self.file
            .read_to_end(&mut data)
            .map_err(|err| format_err!("read of {:?} failed - {}", self.path, err))?;
        Ok(data)
    }

    /// Replace the contents of the locked file in place.
    ///
    /// The rewrite happens under the held lock, so readers holding the lock
    /// themselves never observe a torn record.
    pub fn rewrite(&mut self, data: &[u8]) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)?;
        self.file
            .write_all(data)
            .map_err(|err| format_err!("write of {:?} failed - {}", self.path, err))?;
        self.file
            .sync_all()
            .map_err(|err| format_err!("fsync of {:?} failed - {}", self.path, err))?;
        Ok(())
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let op = flock_op(libc::F_UNLCK);
        if let Err(err) =
            nix::fcntl::fcntl(self.file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&op))
        {
            log::warn!("unable to unlock {:?} - {}", self.path, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_read_rewrite() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("halt.scr");

        let mut locked = LockedFile::open(&path, Duration::from_secs(1), true)?;
        assert_eq!(locked.read_to_vec()?, b"");
        locked.rewrite(b"reason=TIME_LIMIT")?;
        locked.rewrite(b"x")?;
        assert_eq!(locked.read_to_vec()?, b"x");
        drop(locked);

        let mut again = LockedFile::open(&path, Duration::from_secs(1), false)?;
        assert_eq!(again.read_to_vec()?, b"x");
        Ok(())
    }
}
