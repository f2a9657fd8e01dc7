//! PARTNER: full copies on the right neighbor.
//!
//! Each member streams its files to the next member of the set (with
//! wrap), which stores them under `partner.<world rank>.<basename>` in its
//! hidden directory next to a header recording the peer's file list. The
//! set survives the loss of any member whose neighbor survives; two
//! adjacent losses are unrecoverable.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};

use scr_api_types::{FileKind, FileMeta};
use scr_cache::{layout, Filemap};

use crate::reddesc::RedDesc;

use super::{check_files, recv_file, send_file, MemberFiles, RedundancyCtx, ShardHeader};

/// Header file recording which peer files this member holds copies of.
fn header_name(world_rank: usize) -> String {
    format!("partner.{}.hdr.scr", world_rank)
}

fn file_basename(path: &str) -> Result<&str, Error> {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format_err!("file path {:?} has no basename", path))
}

fn copy_path(ctx: &RedundancyCtx, world_rank: usize, meta: &FileMeta) -> Result<PathBuf, Error> {
    let name = file_basename(&meta.path)?;
    Ok(ctx
        .hidden_dir
        .join(layout::partner_file_name(world_rank, name)))
}

/// Store copies of `peer`'s files (already streamed into place) plus the
/// header in the filemap.
fn register_copies(
    ctx: &RedundancyCtx,
    map: &mut Filemap,
    header_path: &Path,
    copies: Vec<FileMeta>,
) -> Result<(), Error> {
    let mut header_meta =
        FileMeta::new_redundancy(header_path.to_string_lossy().into_owned());
    header_meta.size = scr_tools::fs::file_size(header_path)?;
    header_meta.complete = true;
    map.add_file(header_meta);

    for copy in copies {
        map.add_file(copy);
    }
    map.write_to(&ctx.filemap_path)
}

pub(super) fn apply(ctx: &RedundancyCtx, desc: &RedDesc, map: &mut Filemap) -> Result<(), Error> {
    let comm = desc.comm.as_ref();
    if comm.size() < 2 {
        return Ok(());
    }
    let lhs = desc.lhs();
    let rhs = desc.rhs();

    let mine = MemberFiles::from_filemap(ctx.world_rank, map);
    let payload = serde_json::to_vec(&mine)?;
    let received = comm.sendrecv(rhs, &payload, lhs)?;
    let partner: MemberFiles = serde_json::from_slice(&received)?;

    // stream my files right; buffered sends cannot deadlock the exchange
    for meta in &mine.files {
        send_file(comm, rhs, Path::new(&meta.path), meta.size, ctx.buf_size)?;
    }

    // receive the left neighbor's files as local copies
    let mut copies = Vec::with_capacity(partner.files.len());
    for meta in &partner.files {
        let dst = copy_path(ctx, partner.world_rank, meta)?;
        let crc = recv_file(comm, lhs, &dst, meta.size, ctx.crc_on_copy)?;
        if let (Some(expected), Some(actual)) = (meta.crc32, crc) {
            if expected != actual {
                bail!(
                    "CRC32 mismatch receiving partner copy of {:?}: expected {:08x} got {:08x}",
                    meta.path,
                    expected,
                    actual
                );
            }
        }
        let mut copy = FileMeta::new_redundancy(dst.to_string_lossy().into_owned());
        copy.size = meta.size;
        copy.crc32 = meta.crc32.or(crc);
        copy.complete = true;
        copies.push(copy);
    }

    // persist what we hold for the neighbor so recover can rebuild it
    let dataset = map
        .dataset()
        .cloned()
        .ok_or_else(|| format_err!("filemap carries no dataset"))?;
    let header = ShardHeader {
        dataset,
        desc: desc.info(),
        chunk_size: 0,
        group: desc.group_map.clone(),
        current: mine,
        partner: Some(partner.clone()),
        members: None,
    };
    let header_path = ctx.hidden_dir.join(header_name(partner.world_rank));
    scr_tools::fs::replace_file(&header_path, &serde_json::to_vec_pretty(&header)?, true)?;

    register_copies(ctx, map, &header_path, copies)
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

    let my_ok = check_files(map, false);
    let flags = comm.allgather(&[my_ok as u8])?;
    let need: Vec<bool> = flags.iter().map(|f| f != &[1u8]).collect();

    if !need.iter().any(|n| *n) {
        return Ok(check_files(map, true));
    }

    // a member and the neighbor holding its copies must not both be lost
    for f in 0..k {
        if need[f] && need[(f + 1) % k] {
            return Ok(false);
        }
    }

    for f in 0..k {
        if !need[f] {
            continue;
        }
        let f_lhs = (f + k - 1) % k;
        let f_rhs = (f + 1) % k;
        let me = comm.rank();

        if me == f_rhs {
            // I hold the copies; send the header, then the file contents
            let header_path = ctx
                .hidden_dir
                .join(header_name(desc.group_map[f]));
            let data = scr_tools::fs::read_file(&header_path)?;
            let header: ShardHeader = serde_json::from_slice(&data)?;
            comm.send(f, data)?;

            let peer = header
                .partner
                .as_ref()
                .ok_or_else(|| format_err!("partner header without peer files"))?;
            for meta in &peer.files {
                let src = copy_path(ctx, peer.world_rank, meta)?;
                send_file(comm, f, &src, meta.size, ctx.buf_size)?;
            }
        }

        if me == f_lhs {
            // feed my user files so the peer can rebuild its copies of me
            let mine = MemberFiles::from_filemap(ctx.world_rank, map);
            comm.send(f, serde_json::to_vec(&mine)?)?;
            for meta in &mine.files {
                send_file(comm, f, Path::new(&meta.path), meta.size, ctx.buf_size)?;
            }
        }

        if me == f {
            map.clear();

            // my own files, from the right neighbor's copies
            let header: ShardHeader = serde_json::from_slice(&comm.recv(f_rhs)?)?;
            let mine = header
                .partner
                .clone()
                .ok_or_else(|| format_err!("partner header without peer files"))?;
            map.set_dataset(header.dataset.clone());
            for meta in &mine.files {
                let dst = ctx.local_path_for(&meta.path);
                let crc = recv_file(comm, f_rhs, &dst, meta.size, meta.crc32.is_some())?;
                if let (Some(expected), Some(actual)) = (meta.crc32, crc) {
                    if expected != actual {
                        bail!("CRC32 mismatch rebuilding {:?}", dst);
                    }
                }
                let mut rebuilt = meta.clone();
                rebuilt.path = dst.to_string_lossy().into_owned();
                rebuilt.kind = FileKind::User;
                rebuilt.complete = true;
                map.add_file(rebuilt);
            }

            // rebuild my copies of the left neighbor
            let peer: MemberFiles = serde_json::from_slice(&comm.recv(f_lhs)?)?;
            let mut copies = Vec::with_capacity(peer.files.len());
            for meta in &peer.files {
                let dst = copy_path(ctx, peer.world_rank, meta)?;
                let crc = recv_file(comm, f_lhs, &dst, meta.size, ctx.crc_on_copy)?;
                let mut copy = FileMeta::new_redundancy(dst.to_string_lossy().into_owned());
                copy.size = meta.size;
                copy.crc32 = meta.crc32.or(crc);
                copy.complete = true;
                copies.push(copy);
            }

            let rebuilt_header = ShardHeader {
                dataset: header.dataset,
                desc: desc.info(),
                chunk_size: 0,
                group: desc.group_map.clone(),
                current: MemberFiles::from_filemap(ctx.world_rank, map),
                partner: Some(peer.clone()),
                members: None,
            };
            let header_path = ctx.hidden_dir.join(header_name(peer.world_rank));
            scr_tools::fs::replace_file(
                &header_path,
                &serde_json::to_vec_pretty(&rebuilt_header)?,
                true,
            )?;
            register_copies(ctx, map, &header_path, copies)?;
        }
    }

    Ok(check_files(map, true))
}
