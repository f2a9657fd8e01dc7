//! SINGLE: no encoding.
//!
//! Each process keeps its own files only; loss of a member is
//! unrecoverable at this level and falls through to fetch.

use anyhow::Error;

use scr_cache::Filemap;

use crate::reddesc::RedDesc;

use super::{check_files, RedundancyCtx};

pub(super) fn apply(
    _ctx: &RedundancyCtx,
    _desc: &RedDesc,
    _map: &mut Filemap,
) -> Result<(), Error> {
    Ok(())
}

pub(super) fn recover(
    _ctx: &RedundancyCtx,
    _desc: &RedDesc,
    map: &mut Filemap,
) -> Result<bool, Error> {
    Ok(check_files(map, true))
}
