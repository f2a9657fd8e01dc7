//! Reed-Solomon (k,m): rotated parity chunks over GF(2^8).
//!
//! Generalizes the XOR rotation: each member's logical data is split into
//! k-m chunks and every member stores m parity chunks. Symbols are striped
//! diagonally so each member contributes exactly one symbol per stripe,
//! which makes any m member losses per set recoverable with the erasure
//! coder. Arithmetic is delegated to the [`super::erasure`] interface.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{bail, format_err, Error};

use scr_api_types::{FileKind, FileMeta};
use scr_cache::{layout, Filemap};

use crate::reddesc::RedDesc;

use super::erasure::{ErasureCoder, Gf256Coder};
use super::{
    check_files, chunk_size, read_header, write_header, LogicalFiles, MemberFiles,
    RedundancyCtx, ShardHeader,
};

fn shard_path(ctx: &RedundancyCtx, desc: &RedDesc) -> PathBuf {
    ctx.hidden_dir.join(layout::rs_file_name(
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

/// Symbol index of `member` within `stripe` for a set of `k`.
///
/// Indices below `k - m` address the member's data chunks; the rest are
/// parity rows. Every member holds exactly one symbol per stripe.
fn symbol_index(stripe: usize, member: usize, k: usize) -> usize {
    (stripe + k - member) % k
}

/// Members owning data symbols of `stripe`, ascending; their position in
/// this list is the codeword column used by the coder.
fn data_owners(stripe: usize, k: usize, d: usize) -> Vec<usize> {
    (0..k)
        .filter(|member| symbol_index(stripe, *member, k) < d)
        .collect()
}

pub(super) fn apply(ctx: &RedundancyCtx, desc: &RedDesc, map: &mut Filemap) -> Result<(), Error> {
    let comm = desc.comm.as_ref();
    let k = comm.size();
    let m = desc.set_failures;
    if k < 2 || m == 0 {
        return Ok(());
    }
    let d = k - m;
    let me = comm.rank();
    let coder = Gf256Coder;

    let mine = MemberFiles::from_filemap(ctx.world_rank, map);

    // everyone learns everyone's file list; recover hands the whole map to
    // a rebuilt member in one message
    let mut members = std::collections::BTreeMap::new();
    for (rank, part) in comm.allgather(&serde_json::to_vec(&mine)?)?.into_iter().enumerate() {
        let files: MemberFiles = serde_json::from_slice(&part)?;
        members.insert(rank, files);
    }

    let max_bytes = members.values().map(|m| m.total_bytes()).max().unwrap_or(0);
    let chunk = chunk_size(max_bytes, d);

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
        partner: None,
        members: Some(members),
    };

    let path = shard_path(ctx, desc);
    let mut shard_meta = FileMeta::new_redundancy(path.to_string_lossy().into_owned());
    map.add_file(shard_meta.clone());
    map.write_to(&ctx.filemap_path)?;

    let mut logical = LogicalFiles::open_read(&read_entries(&mine.files))?;
    let mut shard = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|err| format_err!("unable to open {:?} for writing - {}", path, err))?;
    write_header(&mut shard, &header)?;
    let data_start = shard.stream_position()?;

    let buf_size = ctx.buf_size.max(1);
    let mut off = 0u64;
    while off < chunk {
        let count = ((chunk - off) as usize).min(buf_size);

        // my data slices for this window
        let mut data_slices = Vec::with_capacity(d);
        for i in 0..d {
            let mut slice = vec![0u8; count];
            logical.read_pad(i as u64 * chunk + off, &mut slice)?;
            data_slices.push(slice);
        }

        // ship each slice to the parity holders of its stripe, one
        // combined message per target in stripe order
        for target in 0..k {
            if target == me {
                continue;
            }
            let mut payload = Vec::new();
            for stripe in 0..k {
                let my_i = symbol_index(stripe, me, k);
                if my_i >= d || symbol_index(stripe, target, k) < d {
                    continue;
                }
                payload.extend_from_slice(&data_slices[my_i]);
            }
            if !payload.is_empty() {
                comm.send(target, payload)?;
            }
        }

        // collect the data slices of the stripes we hold parity for
        let mut stripe_slices: Vec<Vec<Option<Vec<u8>>>> = vec![vec![None; k]; k];
        for src in 0..k {
            if src == me {
                continue;
            }
            let mut expected = Vec::new();
            for stripe in 0..k {
                if symbol_index(stripe, src, k) < d && symbol_index(stripe, me, k) >= d {
                    expected.push(stripe);
                }
            }
            if expected.is_empty() {
                continue;
            }
            let payload = comm.recv(src)?;
            if payload.len() != expected.len() * count {
                bail!("short RS encode message from set rank {}", src);
            }
            for (n, stripe) in expected.iter().enumerate() {
                stripe_slices[*stripe][src] =
                    Some(payload[n * count..(n + 1) * count].to_vec());
            }
        }

        // compute and store my parity rows
        for p in 0..m {
            let i = d + p;
            let stripe = (i + me) % k;
            let owners = data_owners(stripe, k, d);
            let slices: Vec<&[u8]> = owners
                .iter()
                .map(|owner| {
                    stripe_slices[stripe][*owner]
                        .as_deref()
                        .expect("missing stripe slice")
                })
                .collect();
            let mut out = vec![0u8; count];
            coder.encode_row(&slices, p, &mut out);
            shard.seek(SeekFrom::Start(data_start + p as u64 * chunk + off))?;
            shard.write_all(&out)?;
        }

        off += count as u64;
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
    let m = desc.set_failures;
    if k < 2 || m == 0 {
        return Ok(check_files(map, true));
    }
    let d = k - m;
    let me = comm.rank();
    let coder = Gf256Coder;

    let my_ok = check_files(map, false);
    let flags = comm.allgather(&[my_ok as u8])?;
    let failed: Vec<usize> = (0..k).filter(|i| flags[*i] != [1u8]).collect();
    let survivors: Vec<usize> = (0..k).filter(|i| flags[*i] == [1u8]).collect();

    if failed.is_empty() {
        return Ok(check_files(map, true));
    }
    if failed.len() > m {
        return Ok(false);
    }
    let informer = survivors[0];

    let path = shard_path(ctx, desc);
    let mut logical;
    let mut shard: File;
    let chunk;

    if !failed.contains(&me) {
        shard = File::open(&path)
            .map_err(|err| format_err!("missing RS shard {:?} - {}", path, err))?;
        let header: ShardHeader = read_header(&mut shard)?;
        chunk = header.chunk_size;

        if me == informer {
            let payload = serde_json::to_vec(&header)?;
            for f in &failed {
                comm.send(*f, payload.clone())?;
            }
        }

        logical = LogicalFiles::open_read(&read_entries(&header.current.files))?;
    } else {
        map.clear();

        let mut header: ShardHeader = serde_json::from_slice(&comm.recv(informer)?)?;
        chunk = header.chunk_size;
        let members = header
            .members
            .as_mut()
            .ok_or_else(|| format_err!("RS header without member map"))?;
        let recorded = members
            .get(&me)
            .ok_or_else(|| format_err!("RS header misses set rank {}", me))?
            .clone();

        let mut files = Vec::with_capacity(recorded.files.len());
        for meta in &recorded.files {
            let mut rebuilt = meta.clone();
            rebuilt.path = ctx
                .local_path_for(&meta.path)
                .to_string_lossy()
                .into_owned();
            rebuilt.kind = FileKind::User;
            rebuilt.complete = true;
            files.push(rebuilt);
        }
        let current = MemberFiles {
            world_rank: ctx.world_rank,
            files,
        };
        members.insert(me, current.clone());
        header.current = current.clone();
        header.desc = desc.info();

        map.set_dataset(header.dataset.clone());
        for meta in &current.files {
            map.add_file(meta.clone());
        }
        let mut shard_meta = FileMeta::new_redundancy(path.to_string_lossy().into_owned());
        shard_meta.complete = false;
        map.add_file(shard_meta);
        map.write_to(&ctx.filemap_path)?;

        logical = LogicalFiles::open_write(&read_entries(&current.files))?;
        shard = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| format_err!("unable to open {:?} for writing - {}", path, err))?;
        write_header(&mut shard, &header)?;
    }
    let data_start = shard.stream_position()?;

    let buf_size = ctx.buf_size.max(1);
    let mut off = 0u64;
    while off < chunk {
        let count = ((chunk - off) as usize).min(buf_size);

        if !failed.contains(&me) {
            // one symbol slice per stripe, concatenated in stripe order
            let mut payload = Vec::with_capacity(k * count);
            for stripe in 0..k {
                let my_i = symbol_index(stripe, me, k);
                let mut slice = vec![0u8; count];
                if my_i < d {
                    logical.read_pad(my_i as u64 * chunk + off, &mut slice)?;
                } else {
                    let p = (my_i - d) as u64;
                    shard.seek(SeekFrom::Start(data_start + p * chunk + off))?;
                    shard.read_exact(&mut slice)?;
                }
                payload.extend_from_slice(&slice);
            }
            for f in &failed {
                comm.send(*f, payload.clone())?;
            }
        } else {
            let mut received = Vec::with_capacity(survivors.len());
            for src in &survivors {
                let payload = comm.recv(*src)?;
                if payload.len() != k * count {
                    bail!("short RS rebuild message from set rank {}", src);
                }
                received.push(payload);
            }

            for stripe in 0..k {
                let owners = data_owners(stripe, k, d);

                let mut present = Vec::with_capacity(survivors.len());
                for (n, src) in survivors.iter().enumerate() {
                    let src_i = symbol_index(stripe, *src, k);
                    let codeword = if src_i < d {
                        owners.iter().position(|o| o == src).unwrap()
                    } else {
                        d + (src_i - d)
                    };
                    present.push((codeword, &received[n][stripe * count..(stripe + 1) * count]));
                }

                let my_i = symbol_index(stripe, me, k);
                let my_codeword = if my_i < d {
                    owners.iter().position(|o| *o == me).unwrap()
                } else {
                    d + (my_i - d)
                };
                let rebuilt = coder.reconstruct(d, &present, &[my_codeword])?;

                if my_i < d {
                    logical.write_pad(my_i as u64 * chunk + off, &rebuilt[0])?;
                } else {
                    let p = (my_i - d) as u64;
                    shard.seek(SeekFrom::Start(data_start + p * chunk + off))?;
                    shard.write_all(&rebuilt[0])?;
                }
            }
        }

        off += count as u64;
    }

    if failed.contains(&me) {
        logical.sync_all()?;
        shard.sync_all()?;

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
