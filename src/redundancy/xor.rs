//! XOR (k,1): rotated parity chunks.
//!
//! Each member's files are treated as one logical byte range, padded to
//! the largest member and split into k-1 chunks. A reduce-scatter pipeline
//! around the set ring leaves every member holding one parity chunk, so
//! any single member per set can be rebuilt from the k-1 survivors.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{bail, format_err, Error};

use scr_api_types::{FileKind, FileMeta};
use scr_cache::{layout, Filemap};
use scr_comm::allreduce_max;

use crate::reddesc::RedDesc;

use super::{
    check_files, chunk_size, read_header, write_header, LogicalFiles, MemberFiles,
    RedundancyCtx, ShardHeader,
};

fn shard_path(ctx: &RedundancyCtx, desc: &RedDesc) -> PathBuf {
    ctx.hidden_dir.join(layout::xor_file_name(
        desc.group_id,
        desc.comm.rank(),
        desc.comm.size(),
    ))
}

fn read_entries(files: &[FileMeta]) -> Vec<(PathBuf, u64)> {
    files
        .iter()
        .map(|meta| (PathBuf::from(&meta.path), meta.size))
        .collect()
}

pub(super) fn apply(ctx: &RedundancyCtx, desc: &RedDesc, map: &mut Filemap) -> Result<(), Error> {
    let comm = desc.comm.as_ref();
    let k = comm.size();
    if k < 2 {
        return Ok(());
    }
    let me = comm.rank();
    let lhs = desc.lhs();
    let rhs = desc.rhs();

    let mine = MemberFiles::from_filemap(ctx.world_rank, map);
    let received = comm.sendrecv(rhs, &serde_json::to_vec(&mine)?, lhs)?;
    let partner: MemberFiles = serde_json::from_slice(&received)?;

    let max_bytes = allreduce_max(comm, mine.total_bytes())?;
    let chunk = chunk_size(max_bytes, k - 1);

    let dataset = map
        .dataset()
        .cloned()
        .ok_or_else(|| format_err!("filemap carries no dataset"))?;
    let header = ShardHeader {
        dataset,
        desc: desc.info(),
        chunk_size: chunk,
        group: desc.group_map.clone(),
        current: mine.clone(),
        partner: Some(partner),
        members: None,
    };

    // record the shard in the filemap before creating it, so a crash in
    // between leaves a map that matches the directory contents
    let path = shard_path(ctx, desc);
    let mut shard_meta = FileMeta::new_redundancy(path.to_string_lossy().into_owned());
    map.add_file(shard_meta.clone());
    map.write_to(&ctx.filemap_path)?;

    let mut logical = LogicalFiles::open_read(&read_entries(&mine.files))?;
    let mut shard = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|err| format_err!("unable to open {:?} for writing - {}", path, err))?;
    write_header(&mut shard, &header)?;

    // reduce-scatter: after k-1 forwarding steps every member holds the
    // parity of one rotated chunk
    let mut send_buf = vec![0u8; ctx.buf_size.max(1)];
    let mut recv_buf = vec![0u8; ctx.buf_size.max(1)];
    let mut nread = 0u64;
    while nread < chunk {
        let count = ((chunk - nread) as usize).min(send_buf.len());

        for chunk_id in (0..k).rev() {
            if chunk_id > 0 {
                let mut rel = (me + chunk_id) % k;
                if rel > me {
                    rel -= 1;
                }
                let offset = chunk * rel as u64 + nread;
                logical.read_pad(offset, &mut send_buf[..count])?;
            } else {
                send_buf[..count].fill(0);
            }

            if chunk_id < k - 1 {
                for (s, r) in send_buf[..count].iter_mut().zip(&recv_buf[..count]) {
                    *s ^= r;
                }
            }

            if chunk_id > 0 {
                let received = comm.sendrecv(rhs, &send_buf[..count], lhs)?;
                if received.len() != count {
                    bail!("short XOR pipeline message");
                }
                recv_buf[..count].copy_from_slice(&received);
            } else {
                shard.write_all(&send_buf[..count])?;
            }
        }

        nread += count as u64;
    }
    shard.sync_all()?;
    drop(shard);

    shard_meta.size = scr_tools::fs::file_size(&path)?;
    if ctx.crc_on_copy {
        shard_meta.crc32 = Some(scr_tools::fs::crc32_file(&path)?);
    }
    shard_meta.complete = true;
    map.set_meta(shard_meta);
    map.write_to(&ctx.filemap_path)
}

pub(super) fn recover(
    ctx: &RedundancyCtx,
    desc: &RedDesc,
    map: &mut Filemap,
) -> Result<bool, Error> {
    let comm = desc.comm.as_ref();
    let k = comm.size();
    if k < 2 {
        return Ok(check_files(map, true));
    }
    let me = comm.rank();
    let lhs = desc.lhs();
    let rhs = desc.rhs();

    let my_ok = check_files(map, false);
    let flags = comm.allgather(&[my_ok as u8])?;
    let failed: Vec<usize> = (0..k).filter(|i| flags[*i] != [1u8]).collect();

    match failed.len() {
        0 => return Ok(check_files(map, true)),
        1 => {}
        // XOR holds one parity chunk per set
        _ => return Ok(false),
    }
    let root = failed[0];

    let path = shard_path(ctx, desc);
    let mut logical;
    let mut shard;
    let chunk;
    let current;

    if me != root {
        shard = std::fs::File::open(&path)
            .map_err(|err| format_err!("missing XOR shard {:?} - {}", path, err))?;
        let header: ShardHeader = read_header(&mut shard)?;
        chunk = header.chunk_size;
        current = header.current.clone();

        // the failed member's file list lives in our header when it is our
        // left neighbor; our own list feeds its rebuilt header when it is
        // our right neighbor
        if root == lhs {
            comm.send(root, serde_json::to_vec(&header)?)?;
        }
        if root == rhs {
            comm.send(root, serde_json::to_vec(&header.current)?)?;
        }

        logical = LogicalFiles::open_read(&read_entries(&current.files))?;
    } else {
        map.clear();

        let peer_header: ShardHeader = serde_json::from_slice(&comm.recv(rhs)?)?;
        let partner: MemberFiles = serde_json::from_slice(&comm.recv(lhs)?)?;
        chunk = peer_header.chunk_size;

        let recorded = peer_header
            .partner
            .ok_or_else(|| format_err!("XOR header without partner files"))?;

        // remap the recorded files into our own dataset directory
        let mut files = Vec::with_capacity(recorded.files.len());
        for meta in &recorded.files {
            let mut rebuilt = meta.clone();
            rebuilt.path = ctx
                .local_path_for(&meta.path)
                .to_string_lossy()
                .into_owned();
            rebuilt.kind = FileKind::User;
            files.push(rebuilt);
        }
        current = MemberFiles {
            world_rank: ctx.world_rank,
            files,
        };

        let header = ShardHeader {
            dataset: peer_header.dataset.clone(),
            desc: desc.info(),
            chunk_size: chunk,
            group: desc.group_map.clone(),
            current: current.clone(),
            partner: Some(partner),
            members: None,
        };

        map.set_dataset(peer_header.dataset);
        for meta in &current.files {
            let mut meta = meta.clone();
            meta.complete = true;
            map.add_file(meta);
        }
        let mut shard_meta = FileMeta::new_redundancy(path.to_string_lossy().into_owned());
        shard_meta.complete = false;
        map.add_file(shard_meta);
        map.write_to(&ctx.filemap_path)?;

        logical = LogicalFiles::open_write(&read_entries(&current.files))?;
        let mut out = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| format_err!("unable to open {:?} for writing - {}", path, err))?;
        write_header(&mut out, &header)?;
        shard = out;
    }

    // pipelined XOR reduce with the failed member as the sink
    let mut send_buf = vec![0u8; ctx.buf_size.max(1)];
    let mut recv_buf = vec![0u8; ctx.buf_size.max(1)];
    let mut data_offset = 0u64;
    for chunk_id in 0..k {
        let mut nread = 0u64;
        while nread < chunk {
            let count = ((chunk - nread) as usize).min(send_buf.len());

            if me != root {
                if chunk_id != me {
                    logical.read_pad(data_offset, &mut send_buf[..count])?;
                    data_offset += count as u64;
                } else {
                    shard.read_exact(&mut send_buf[..count])?;
                }
                if lhs != root {
                    let received = comm.recv(lhs)?;
                    if received.len() != count {
                        bail!("short XOR rebuild message");
                    }
                    for (s, r) in send_buf[..count].iter_mut().zip(&received) {
                        *s ^= r;
                    }
                }
                comm.send(rhs, send_buf[..count].to_vec())?;
            } else {
                let received = comm.recv(lhs)?;
                if received.len() != count {
                    bail!("short XOR rebuild message");
                }
                recv_buf[..count].copy_from_slice(&received);
                if chunk_id != me {
                    logical.write_pad(data_offset, &recv_buf[..count])?;
                    data_offset += count as u64;
                } else {
                    shard.write_all(&recv_buf[..count])?;
                }
            }

            nread += count as u64;
        }
    }

    if me == root {
        logical.sync_all()?;
        shard.sync_all()?;

        // finalize the shard entry and verify what we rebuilt
        let mut shard_meta = FileMeta::new_redundancy(path.to_string_lossy().into_owned());
        shard_meta.size = scr_tools::fs::file_size(&path)?;
        if ctx.crc_on_copy {
            shard_meta.crc32 = Some(scr_tools::fs::crc32_file(&path)?);
        }
        shard_meta.complete = true;
        map.set_meta(shard_meta);
        map.write_to(&ctx.filemap_path)?;
    }

    Ok(check_files(map, true))
}
