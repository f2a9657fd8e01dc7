//! Bypass mode: files are written straight into the prefix directory,
//! cache stays logically empty, and shared files are allowed.

mod common;

use common::{run_ranks, JobDirs};
use scr::prefix::PrefixIndex;
use scr::summary::Summary;
use scr::{DatasetFlags, Scr};
use scr_comm::Comm;
use std::sync::Arc;

#[test]
fn bypass_routes_into_prefix_and_finalizes_index() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(2, move |rank, comm| {
            let config = dirs
                .config(rank, rank)
                .set("SCR_CACHE_BYPASS", "1")
                .set("SCR_COPY_TYPE", "SINGLE")
                .set("SCR_FLUSH", "1");
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            scr.start_output(Some("ckpt.direct"), DatasetFlags::CHECKPOINT)
                .unwrap();

            let user_path = dirs.prefix().join(format!("direct/rank_{}.dat", rank));
            let routed = scr.route_file(&user_path).unwrap();
            // bypass resolves to the origin itself
            assert_eq!(routed, user_path);
            scr_tools::fs::replace_file(&routed, format!("direct {}", rank).as_bytes(), false)
                .unwrap();

            scr.complete_output(true).unwrap();
            scr.finalize().unwrap();
        });
    }

    // no copy happened; the data is exactly where it was written
    for rank in 0..2 {
        let path = dirs.prefix().join(format!("direct/rank_{}.dat", rank));
        assert_eq!(
            scr_tools::fs::read_file(&path).unwrap(),
            format!("direct {}", rank).into_bytes()
        );
    }

    // the index and summary describe the dataset like any flushed one
    let index = PrefixIndex::load(&dirs.prefix()).unwrap();
    let entry = index.get_by_name("ckpt.direct").expect("indexed");
    assert!(entry.complete);

    let summary =
        Summary::read_from(scr::prefix::dataset_dir(&dirs.prefix(), entry.id)).unwrap();
    assert!(summary.complete);
    assert_eq!(summary.files.len(), 2);
    assert_eq!(summary.total_bytes(), 16);
}

#[test]
fn bypass_allows_shared_files() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(2, move |rank, comm| {
            let config = dirs
                .config(rank, rank)
                .set("SCR_CACHE_BYPASS", "1")
                .set("SCR_COPY_TYPE", "SINGLE")
                .set("SCR_FLUSH", "1");
            // keep an endpoint to synchronize the shared write below
            let fence = comm.clone();
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            scr.start_output(Some("ckpt.shared"), DatasetFlags::CHECKPOINT)
                .unwrap();

            // both ranks claim the same shared output file
            let shared = dirs.prefix().join("shared/all.dat");
            let routed = scr.route_file(&shared).unwrap();
            if rank == 0 {
                scr_tools::fs::replace_file(&routed, b"written once", false).unwrap();
            }
            // the write must land before any rank stats the file
            fence.barrier().unwrap();

            scr.complete_output(true).unwrap();
            scr.finalize().unwrap();
        });
    }

    // ownership assignment kept exactly one claimant
    let index = PrefixIndex::load(&dirs.prefix()).unwrap();
    let entry = index.get_by_name("ckpt.shared").expect("indexed");
    let summary =
        Summary::read_from(scr::prefix::dataset_dir(&dirs.prefix(), entry.id)).unwrap();
    let listed: usize = summary.files.values().map(|files| files.len()).sum();
    assert_eq!(listed, 1);
}
