//! The redundancy engine.
//!
//! After every process has written its files for a dataset, `apply`
//! encodes shards across the redundancy set so the dataset survives the
//! loss of up to the scheme's tolerance of members per set. `recover` runs
//! the reverse direction on restart: members that lost their cache solicit
//! shards from surviving peers and rebuild byte-identical files.
//!
//! Shard files start with a length-prefixed key/value tree header naming
//! the dataset, the scheme parameters, the set membership and every
//! member's file list, followed by raw parity bytes.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use scr_api_types::{CopyType, Dataset, FileMeta};
use scr_cache::Filemap;
use scr_comm::allreduce_and;

use crate::reddesc::{RedDesc, RedDescInfo};

pub mod erasure;
mod partner;
mod rs;
mod single;
mod xor;

/// One member's contribution to a dataset, as recorded in shard headers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MemberFiles {
    pub world_rank: usize,
    /// User file metadata in the member's own path order.
    pub files: Vec<FileMeta>,
}

impl MemberFiles {
    /// Collect the user files of a filemap.
    pub fn from_filemap(world_rank: usize, map: &Filemap) -> MemberFiles {
        MemberFiles {
            world_rank,
            files: map
                .files()
                .filter(|meta| meta.kind == scr_api_types::FileKind::User)
                .cloned()
                .collect(),
        }
    }

    /// Total bytes across the member's files.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|meta| meta.size).sum()
    }
}

/// Header written at the front of every shard file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ShardHeader {
    pub dataset: Dataset,
    pub desc: RedDescInfo,
    pub chunk_size: u64,
    /// Set rank to world rank.
    pub group: Vec<usize>,
    /// Files of the member that wrote this shard.
    pub current: MemberFiles,
    /// Files of the left neighbor (XOR, PARTNER).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub partner: Option<MemberFiles>,
    /// Files of every member by set rank (RS).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub members: Option<BTreeMap<usize, MemberFiles>>,
}

/// Write a length-prefixed header at the current file position.
pub fn write_header<T: Serialize>(file: &mut File, header: &T) -> Result<u64, Error> {
    let data = serde_json::to_vec(header)?;
    file.write_all(&(data.len() as u64).to_le_bytes())?;
    file.write_all(&data)?;
    Ok(8 + data.len() as u64)
}

/// Read a length-prefixed header from the current file position.
pub fn read_header<T: DeserializeOwned>(file: &mut File) -> Result<T, Error> {
    let mut len = [0u8; 8];
    file.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len) as usize;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data)?;
    Ok(serde_json::from_slice(&data)?)
}

/// The concatenation of one member's files, zero-padded past the end.
///
/// The encoding schemes address member data as one logical byte range;
/// reads beyond the real length return zeros and writes beyond it are
/// dropped, which makes the chunk math independent of individual file
/// sizes.
pub struct LogicalFiles {
    files: Vec<(File, u64)>,
}

impl LogicalFiles {
    pub fn open_read(entries: &[(PathBuf, u64)]) -> Result<Self, Error> {
        let mut files = Vec::with_capacity(entries.len());
        for (path, size) in entries {
            let file = File::open(path)
                .map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
            files.push((file, *size));
        }
        Ok(LogicalFiles { files })
    }

    /// Open (creating and truncating) the files for rebuild.
    pub fn open_write(entries: &[(PathBuf, u64)]) -> Result<Self, Error> {
        let mut files = Vec::with_capacity(entries.len());
        for (path, size) in entries {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|err| format_err!("unable to open {:?} for writing - {}", path, err))?;
            files.push((file, *size));
        }
        Ok(LogicalFiles { files })
    }

    /// Read `buf.len()` bytes at the logical `offset`, zero-filling past
    /// the end of the real data.
    pub fn read_pad(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        buf.fill(0);
        let mut pos = 0u64;
        let mut remaining: &mut [u8] = buf;
        let mut cursor = offset;

        for (file, size) in &mut self.files {
            if remaining.is_empty() {
                break;
            }
            let end = pos + *size;
            if cursor < end {
                let in_file = cursor - pos;
                let count = ((*size - in_file) as usize).min(remaining.len());
                file.seek(SeekFrom::Start(in_file))?;
                file.read_exact(&mut remaining[..count])?;
                remaining = &mut remaining[count..];
                cursor += count as u64;
            }
            pos = end;
        }
        Ok(())
    }

    /// Write `buf` at the logical `offset`, dropping bytes past the end of
    /// the recorded sizes (they are padding).
    pub fn write_pad(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        let mut pos = 0u64;
        let mut remaining: &[u8] = buf;
        let mut cursor = offset;

        for (file, size) in &mut self.files {
            if remaining.is_empty() {
                break;
            }
            let end = pos + *size;
            if cursor < end {
                let in_file = cursor - pos;
                let count = ((*size - in_file) as usize).min(remaining.len());
                file.seek(SeekFrom::Start(in_file))?;
                file.write_all(&remaining[..count])?;
                remaining = &remaining[count..];
                cursor += count as u64;
            }
            pos = end;
        }
        Ok(())
    }

    pub fn sync_all(&mut self) -> Result<(), Error> {
        for (file, _) in &self.files {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Per-process context the schemes operate in.
pub struct RedundancyCtx {
    pub world_rank: usize,
    /// Cache directory of the dataset on this process.
    pub dataset_dir: PathBuf,
    /// Hidden subdirectory holding filemaps and shards.
    pub hidden_dir: PathBuf,
    /// Where this process persists its filemap.
    pub filemap_path: PathBuf,
    /// Buffer size for pipelined exchanges.
    pub buf_size: usize,
    /// Compute and verify CRC32 while copying shards.
    pub crc_on_copy: bool,
}

impl RedundancyCtx {
    /// Target path for a rebuilt peer file: same basename in our dataset
    /// directory.
    pub fn local_path_for(&self, recorded: &str) -> PathBuf {
        let name = Path::new(recorded)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| recorded.into());
        self.dataset_dir.join(name)
    }
}

/// Check that every file in the map is present with its recorded size,
/// optionally verifying CRCs. A map without a dataset descriptor counts as
/// lost.
pub fn check_files(map: &Filemap, verify_crc: bool) -> bool {
    if map.dataset().is_none() {
        return false;
    }
    for meta in map.files() {
        if !meta.complete {
            return false;
        }
        match scr_tools::fs::file_size(&meta.path) {
            Ok(size) if size == meta.size => {}
            _ => return false,
        }
        if !scr_tools::fs::is_readable(&meta.path) {
            return false;
        }
        if verify_crc {
            if let Some(expected) = meta.crc32 {
                match scr_tools::fs::crc32_file(&meta.path) {
                    Ok(actual) if actual == expected => {}
                    _ => return false,
                }
            }
        }
    }
    true
}

/// Apply the descriptor's scheme to the dataset. Collective over the
/// redundancy set; returns the reconciled success of the whole set.
pub fn apply(ctx: &RedundancyCtx, desc: &RedDesc, map: &mut Filemap) -> Result<bool, Error> {
    let local = match desc.copy_type {
        CopyType::Single => single::apply(ctx, desc, map),
        CopyType::Partner => partner::apply(ctx, desc, map),
        CopyType::Xor => xor::apply(ctx, desc, map),
        CopyType::Rs => rs::apply(ctx, desc, map),
    };

    if let Err(err) = &local {
        log::error!(
            "redundancy apply ({}) failed on rank {} - {}",
            desc.copy_type,
            ctx.world_rank,
            err
        );
    }

    Ok(allreduce_and(desc.comm.as_ref(), local.is_ok())?)
}

/// Attempt to rebuild the dataset after member loss. Collective over the
/// redundancy set; returns the reconciled success of the whole set.
pub fn recover(ctx: &RedundancyCtx, desc: &RedDesc, map: &mut Filemap) -> Result<bool, Error> {
    let local = match desc.copy_type {
        CopyType::Single => single::recover(ctx, desc, map),
        CopyType::Partner => partner::recover(ctx, desc, map),
        CopyType::Xor => xor::recover(ctx, desc, map),
        CopyType::Rs => rs::recover(ctx, desc, map),
    };

    match &local {
        Ok(true) => {}
        Ok(false) => log::warn!(
            "redundancy recover ({}) cannot rebuild set {}",
            desc.copy_type,
            desc.group_id
        ),
        Err(err) => log::error!(
            "redundancy recover ({}) failed on rank {} - {}",
            desc.copy_type,
            ctx.world_rank,
            err
        ),
    }

    Ok(allreduce_and(
        desc.comm.as_ref(),
        matches!(local, Ok(true)),
    )?)
}

/// Stream a file to a peer in buffer-size chunks.
pub(crate) fn send_file(
    comm: &dyn scr_comm::Comm,
    dest: usize,
    path: &Path,
    size: u64,
    buf_size: usize,
) -> Result<(), Error> {
    let mut file =
        File::open(path).map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
    let mut remaining = size;
    let mut buf = vec![0u8; buf_size.max(1)];
    while remaining > 0 {
        let count = (remaining as usize).min(buf.len());
        file.read_exact(&mut buf[..count])
            .map_err(|err| format_err!("read of {:?} failed - {}", path, err))?;
        comm.send(dest, buf[..count].to_vec())?;
        remaining -= count as u64;
    }
    Ok(())
}

/// Receive a file streamed by `send_file`, optionally computing its CRC32.
pub(crate) fn recv_file(
    comm: &dyn scr_comm::Comm,
    src: usize,
    path: &Path,
    size: u64,
    with_crc: bool,
) -> Result<Option<u32>, Error> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|err| format_err!("unable to open {:?} for writing - {}", path, err))?;
    let mut hasher = with_crc.then(crc32fast::Hasher::new);
    let mut received = 0u64;
    while received < size {
        let chunk = comm.recv(src)?;
        if chunk.is_empty() || received + chunk.len() as u64 > size {
            bail!("unexpected chunk while receiving {:?}", path);
        }
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&chunk);
        }
        file.write_all(&chunk)
            .map_err(|err| format_err!("write of {:?} failed - {}", path, err))?;
        received += chunk.len() as u64;
    }
    file.sync_all()?;
    Ok(hasher.map(|h| h.finalize()))
}

/// Chunk size for a scheme splitting member data into `parts` pieces.
///
/// Rounded up so `parts * chunk_size` covers the largest member, and at
/// least one byte so zero-byte datasets still form valid chunks.
pub fn chunk_size(max_bytes: u64, parts: usize) -> u64 {
    let parts = parts.max(1) as u64;
    let mut size = max_bytes / parts;
    if size * parts < max_bytes {
        size += 1;
    }
    size.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scr_comm::Comm;

    #[test]
    fn chunk_size_boundaries() {
        assert_eq!(chunk_size(0, 3), 1);
        assert_eq!(chunk_size(1, 3), 1);
        assert_eq!(chunk_size(3, 3), 1);
        assert_eq!(chunk_size(4, 3), 2);
        assert_eq!(chunk_size(300, 3), 100);
        assert_eq!(chunk_size(301, 3), 101);
    }

    #[test]
    fn logical_files_pad() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        scr_tools::fs::replace_file(&a, b"abcd", false)?;
        scr_tools::fs::replace_file(&b, b"XY", false)?;

        let mut logical =
            LogicalFiles::open_read(&[(a.clone(), 4), (b.clone(), 2)])?;

        let mut buf = [0u8; 8];
        logical.read_pad(0, &mut buf)?;
        assert_eq!(&buf, b"abcdXY\0\0");

        let mut buf = [0u8; 3];
        logical.read_pad(3, &mut buf)?;
        assert_eq!(&buf, b"dXY");

        let mut buf = [0u8; 4];
        logical.read_pad(6, &mut buf)?;
        assert_eq!(&buf, b"\0\0\0\0");

        // writes past the recorded sizes are dropped
        let mut logical = LogicalFiles::open_write(&[(a.clone(), 4), (b.clone(), 2)])?;
        logical.write_pad(0, b"123456789")?;
        logical.sync_all()?;
        assert_eq!(scr_tools::fs::read_file(&a)?, b"1234");
        assert_eq!(scr_tools::fs::read_file(&b)?, b"56");
        Ok(())
    }

    use scr_api_types::{Dataset, DatasetFlags};
    use scr_comm::thread::ThreadComm;

    use crate::reddesc::RedDesc;

    fn test_dataset() -> Dataset {
        Dataset {
            id: 1,
            name: "ckpt.1".to_string(),
            flags: DatasetFlags::CHECKPOINT,
            created: 0,
            user: None,
            jobid: None,
            jobname: None,
            cluster: None,
            files: 0,
            size: 0,
            complete: true,
            ckpt: Some(1),
        }
    }

    fn test_desc(comm: ThreadComm, copy_type: CopyType, failures: usize) -> RedDesc {
        let size = comm.size();
        RedDesc {
            enabled: true,
            index: 0,
            interval: 1,
            output: false,
            bypass: false,
            store_index: 0,
            group_index: 0,
            base: PathBuf::new(),
            copy_type,
            set_size: size,
            set_failures: failures,
            comm: Box::new(comm),
            group_id: 0,
            groups: 1,
            group_map: (0..size).collect(),
        }
    }

    fn test_ctx(root: &Path, rank: usize) -> RedundancyCtx {
        let dataset_dir = root.join(format!("rank{}", rank));
        let hidden_dir = dataset_dir.join(".scr");
        scr_tools::fs::create_path(&hidden_dir).unwrap();
        RedundancyCtx {
            world_rank: rank,
            dataset_dir: dataset_dir.clone(),
            hidden_dir: hidden_dir.clone(),
            filemap_path: hidden_dir.join(format!("filemap_{}", rank)),
            buf_size: 8, // tiny windows force the pipelines to iterate
            crc_on_copy: true,
        }
    }

    fn member_map(ctx: &RedundancyCtx, data: &[u8]) -> Filemap {
        let path = ctx.dataset_dir.join(format!("data_{}.bin", ctx.world_rank));
        scr_tools::fs::replace_file(&path, data, false).unwrap();
        let mut meta = FileMeta::new(path.to_string_lossy().into_owned());
        meta.size = data.len() as u64;
        meta.crc32 = Some(crc32fast::hash(data));
        meta.complete = true;

        let mut map = Filemap::new();
        map.set_dataset(test_dataset());
        map.add_file(meta);
        map
    }

    /// With two members the rotated XOR parity degenerates to a copy of
    /// the partner's padded data, which makes the shard bytes checkable
    /// directly.
    #[test]
    fn xor_parity_bytes_for_pair() {
        let root = tempfile::tempdir().unwrap();
        let root = std::sync::Arc::new(root.path().to_path_buf());

        let mut handles = Vec::new();
        for (rank, comm) in ThreadComm::world(2).into_iter().enumerate() {
            let root = std::sync::Arc::clone(&root);
            handles.push(std::thread::spawn(move || {
                let desc = test_desc(comm, CopyType::Xor, 1);
                let ctx = test_ctx(&root, rank);
                let data = if rank == 0 {
                    b"abcdefghij".to_vec()
                } else {
                    b"0123".to_vec()
                };
                let mut map = member_map(&ctx, &data);
                assert!(apply(&ctx, &desc, &mut map).unwrap());

                // shard carries the partner's data, padded to the max size
                let shard = ctx.hidden_dir.join(format!("xor.0_{}_of_2.scr", rank + 1));
                let mut file = File::open(&shard).unwrap();
                let _header: ShardHeader = read_header(&mut file).unwrap();
                let mut parity = Vec::new();
                file.read_to_end(&mut parity).unwrap();

                let mut expected = if rank == 0 {
                    b"0123".to_vec()
                } else {
                    b"abcdefghij".to_vec()
                };
                expected.resize(10, 0);
                assert_eq!(parity, expected);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    /// Any k of the k+1 shard sets reconstruct the lost member's bytes.
    #[test]
    fn xor_rebuild_restores_bytes() {
        let root = tempfile::tempdir().unwrap();
        let root = std::sync::Arc::new(root.path().to_path_buf());

        let payloads: [&[u8]; 3] = [b"first member data", b"second", b""];

        let mut handles = Vec::new();
        for (rank, comm) in ThreadComm::world(3).into_iter().enumerate() {
            let root = std::sync::Arc::clone(&root);
            handles.push(std::thread::spawn(move || {
                let desc = test_desc(comm, CopyType::Xor, 1);
                let ctx = test_ctx(&root, rank);
                let mut map = member_map(&ctx, payloads[rank]);
                assert!(apply(&ctx, &desc, &mut map).unwrap());

                // member 1 loses everything it had
                desc.comm.barrier().unwrap();
                if rank == 1 {
                    scr_tools::fs::remove_dir_all_quiet(&ctx.dataset_dir).unwrap();
                    scr_tools::fs::create_path(&ctx.hidden_dir).unwrap();
                    map = Filemap::new();
                }
                desc.comm.barrier().unwrap();

                assert!(recover(&ctx, &desc, &mut map).unwrap());

                let path = ctx.dataset_dir.join(format!("data_{}.bin", rank));
                let data = scr_tools::fs::read_file(&path).unwrap();
                assert_eq!(data, payloads[rank]);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    /// Double loss under RS(4,2): both members rebuild byte-identical
    /// files from the surviving stripes.
    #[test]
    fn rs_rebuild_restores_bytes() {
        let root = tempfile::tempdir().unwrap();
        let root = std::sync::Arc::new(root.path().to_path_buf());

        let mut handles = Vec::new();
        for (rank, comm) in ThreadComm::world(4).into_iter().enumerate() {
            let root = std::sync::Arc::clone(&root);
            handles.push(std::thread::spawn(move || {
                let desc = test_desc(comm, CopyType::Rs, 2);
                let ctx = test_ctx(&root, rank);
                let payload = vec![0x40u8 + rank as u8; 50 + rank * 13];
                let mut map = member_map(&ctx, &payload);
                assert!(apply(&ctx, &desc, &mut map).unwrap());

                desc.comm.barrier().unwrap();
                if rank == 0 || rank == 3 {
                    scr_tools::fs::remove_dir_all_quiet(&ctx.dataset_dir).unwrap();
                    scr_tools::fs::create_path(&ctx.hidden_dir).unwrap();
                    map = Filemap::new();
                }
                desc.comm.barrier().unwrap();

                assert!(recover(&ctx, &desc, &mut map).unwrap());

                let path = ctx.dataset_dir.join(format!("data_{}.bin", rank));
                let data = scr_tools::fs::read_file(&path).unwrap();
                assert_eq!(data, payload);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn header_roundtrip() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("shard");

        let header = MemberFiles {
            world_rank: 3,
            files: vec![FileMeta::new("/cache/scr.dataset.1/x")],
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = write_header(&mut file, &header)?;
        file.write_all(b"parity")?;

        file.seek(SeekFrom::Start(0))?;
        let back: MemberFiles = read_header(&mut file)?;
        assert_eq!(back.world_rank, 3);
        assert_eq!(file.stream_position()?, len);
        Ok(())
    }
}
