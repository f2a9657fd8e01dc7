//! File transfer engine.
//!
//! The flush and fetch paths hand a manifest of (source, destination)
//! pairs to a mover and poll the returned handle. The library itself never
//! spawns threads; the threaded mover owns its workers, so an async flush
//! is just a handle the caller tests from time to time.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{unbounded, Receiver, TryRecvError};
use serde::{Deserialize, Serialize};

use scr_api_types::StatSnapshot;

/// Transfer implementation selected by a store descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XferKind {
    /// Copy inline in the calling thread.
    Sync,
    /// Copy on a worker pool owned by the mover.
    Pthread,
}

impl FromStr for XferKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(XferKind::Sync),
            "pthread" => Ok(XferKind::Pthread),
            other => bail!("unknown transfer type '{}'", other),
        }
    }
}

impl std::fmt::Display for XferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            XferKind::Sync => "sync",
            XferKind::Pthread => "pthread",
        })
    }
}

/// One file to move.
#[derive(Clone, Debug)]
pub struct TransferItem {
    pub src: PathBuf,
    pub dst: PathBuf,
    /// Expected size; the transfer fails if the copied byte count differs.
    pub size: Option<u64>,
    /// Expected CRC32; verified when `compute_crc` is set.
    pub crc32: Option<u32>,
    pub compute_crc: bool,
    /// Ownership and timestamps to restore on the destination.
    pub meta: Option<StatSnapshot>,
}

impl TransferItem {
    pub fn new(src: PathBuf, dst: PathBuf) -> Self {
        TransferItem {
            src,
            dst,
            size: None,
            crc32: None,
            compute_crc: false,
            meta: None,
        }
    }
}

/// Outcome of one completed transfer.
#[derive(Clone, Debug)]
pub struct TransferResult {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub bytes: u64,
    pub crc32: Option<u32>,
}

fn transfer_one(item: &TransferItem, buf_size: usize) -> Result<TransferResult, Error> {
    let (bytes, crc32) =
        scr_tools::fs::copy_file(&item.src, &item.dst, buf_size, item.compute_crc)?;

    if let Some(expected) = item.size {
        if bytes != expected {
            bail!(
                "short copy of {:?}: {} of {} bytes",
                item.src,
                bytes,
                expected
            );
        }
    }
    if let (Some(expected), Some(actual)) = (item.crc32, crc32) {
        if expected != actual {
            bail!(
                "CRC32 mismatch copying {:?}: expected {:08x} got {:08x}",
                item.src,
                expected,
                actual
            );
        }
    }
    if let Some(meta) = &item.meta {
        scr_tools::fs::apply_metadata(&item.dst, meta.mode, meta.uid, meta.gid, meta.mtime)?;
    }

    Ok(TransferResult {
        src: item.src.clone(),
        dst: item.dst.clone(),
        bytes,
        crc32,
    })
}

enum HandleInner {
    Done(Option<Result<Vec<TransferResult>, Error>>),
    Threaded {
        results: Receiver<Result<TransferResult, Error>>,
        workers: Vec<JoinHandle<()>>,
        expected: usize,
        collected: Vec<TransferResult>,
        first_error: Option<Error>,
        cancel: Arc<AtomicBool>,
    },
}

/// Handle to an issued transfer; drives completion through `test`/`wait`.
pub struct MoverHandle {
    inner: HandleInner,
}

impl MoverHandle {
    /// Check for completion without blocking.
    pub fn test(&mut self) -> bool {
        match &mut self.inner {
            HandleInner::Done(_) => true,
            HandleInner::Threaded {
                results,
                expected,
                collected,
                first_error,
                ..
            } => loop {
                match results.try_recv() {
                    Ok(Ok(result)) => collected.push(result),
                    Ok(Err(err)) => {
                        if first_error.is_none() {
                            *first_error = Some(err);
                        } else {
                            log::warn!("additional transfer failure - {}", err);
                        }
                    }
                    Err(TryRecvError::Empty) => {
                        break collected.len() + first_error.iter().count() >= *expected;
                    }
                    Err(TryRecvError::Disconnected) => break true,
                }
            },
        }
    }

    /// Block until the transfer finishes and return the per-file results.
    pub fn wait(self) -> Result<Vec<TransferResult>, Error> {
        match self.inner {
            HandleInner::Done(result) => result.expect("mover handle already consumed"),
            HandleInner::Threaded {
                results,
                workers,
                expected,
                mut collected,
                mut first_error,
                ..
            } => {
                while collected.len() + first_error.iter().count() < expected {
                    match results.recv() {
                        Ok(Ok(result)) => collected.push(result),
                        Ok(Err(err)) => {
                            if first_error.is_none() {
                                first_error = Some(err);
                            } else {
                                log::warn!("additional transfer failure - {}", err);
                            }
                        }
                        Err(_) => break,
                    }
                }
                for worker in workers {
                    let _ = worker.join();
                }
                match first_error {
                    Some(err) => Err(err),
                    None if collected.len() == expected => Ok(collected),
                    None => Err(format_err!(
                        "transfer finished with {} of {} files",
                        collected.len(),
                        expected
                    )),
                }
            }
        }
    }

    /// Abandon an in-flight transfer; blocks until the workers acknowledge.
    pub fn cancel(self) -> Result<(), Error> {
        if let HandleInner::Threaded { cancel, .. } = &self.inner {
            cancel.store(true, Ordering::SeqCst);
            // errors from the abandoned tail are expected
            let _ = self.wait();
        }
        Ok(())
    }
}

/// A file mover with a transfer type.
pub trait Mover: Send + Sync {
    fn kind(&self) -> XferKind;

    fn start(&self, items: Vec<TransferItem>, buf_size: usize) -> Result<MoverHandle, Error>;
}

/// Copies files inline before returning the handle.
pub struct SyncMover;

impl Mover for SyncMover {
    fn kind(&self) -> XferKind {
        XferKind::Sync
    }

    fn start(&self, items: Vec<TransferItem>, buf_size: usize) -> Result<MoverHandle, Error> {
        let mut results = Vec::with_capacity(items.len());
        for item in &items {
            match transfer_one(item, buf_size) {
                Ok(result) => results.push(result),
                Err(err) => {
                    return Ok(MoverHandle {
                        inner: HandleInner::Done(Some(Err(err))),
                    })
                }
            }
        }
        Ok(MoverHandle {
            inner: HandleInner::Done(Some(Ok(results))),
        })
    }
}

/// Copies files on a small worker pool.
pub struct ThreadMover {
    pub threads: usize,
}

impl Default for ThreadMover {
    fn default() -> Self {
        ThreadMover { threads: 4 }
    }
}

impl Mover for ThreadMover {
    fn kind(&self) -> XferKind {
        XferKind::Pthread
    }

    fn start(&self, items: Vec<TransferItem>, buf_size: usize) -> Result<MoverHandle, Error> {
        let expected = items.len();
        let threads = self.threads.clamp(1, expected.max(1));
        let cancel = Arc::new(AtomicBool::new(false));

        let (input_tx, input_rx) = unbounded::<TransferItem>();
        let (result_tx, result_rx) = unbounded();

        for item in items {
            input_tx
                .send(item)
                .map_err(|_| format_err!("transfer queue closed"))?;
        }
        drop(input_tx);

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let input_rx = input_rx.clone();
            let result_tx = result_tx.clone();
            let cancel = Arc::clone(&cancel);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("scr-mover ({})", i))
                    .spawn(move || {
                        while let Ok(item) = input_rx.recv() {
                            if cancel.load(Ordering::SeqCst) {
                                let _ = result_tx.send(Err(format_err!(
                                    "transfer of {:?} cancelled",
                                    item.src
                                )));
                                continue;
                            }
                            let _ = result_tx.send(transfer_one(&item, buf_size));
                        }
                    })
                    .map_err(|err| format_err!("unable to spawn mover thread - {}", err))?,
            );
        }
        drop(result_tx);

        Ok(MoverHandle {
            inner: HandleInner::Threaded {
                results: result_rx,
                workers,
                expected,
                collected: Vec::new(),
                first_error: None,
                cancel,
            },
        })
    }
}

/// Mover instance for a transfer type tag.
pub fn mover_for(kind: XferKind) -> Box<dyn Mover> {
    match kind {
        XferKind::Sync => Box::new(SyncMover),
        XferKind::Pthread => Box::new(ThreadMover::default()),
    }
}
