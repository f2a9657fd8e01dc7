//! Index maintenance operations: current, drop and delete.

mod common;

use common::{run_ranks, write_routed, JobDirs};
use scr::prefix::PrefixIndex;
use scr::{DatasetFlags, Scr};
use std::sync::Arc;

#[test]
fn current_drop_and_delete() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(1, move |rank, comm| {
            let config = dirs
                .config(rank, rank)
                .set("SCR_COPY_TYPE", "SINGLE")
                .set("SCR_FLUSH", "1")
                .set("SCR_CACHE_SIZE", "2");
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            for step in 1..=2u32 {
                scr.start_output(Some(&format!("ckpt.{}", step)), DatasetFlags::CHECKPOINT)
                    .unwrap();
                let user_path = dirs.prefix().join(format!("data/step{}.dat", step));
                write_routed(&mut scr, &user_path, format!("step {}", step).as_bytes());
                scr.complete_output(true).unwrap();
            }

            // point restarts at the older checkpoint
            scr.current("ckpt.1").unwrap();
            // naming an unknown dataset is a plain error
            assert!(scr.current("no.such").is_err());

            // drop removes only the index entry
            scr.drop_dataset("ckpt.2").unwrap();

            // delete removes data everywhere
            scr.delete("ckpt.1").unwrap();

            scr.finalize().unwrap();
        });
    }

    let index = PrefixIndex::load(&dirs.prefix()).unwrap();
    assert!(index.get_by_name("ckpt.2").is_none());
    assert!(index.get_by_name("ckpt.1").is_none());
    assert!(index.current.is_none());

    // dropped data is left in place, deleted data is gone
    assert!(dirs.prefix().join("data/step2.dat").exists());
    assert!(!dirs.prefix().join("data/step1.dat").exists());
}

#[test]
fn current_drops_newer_entries_when_configured() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(1, move |rank, comm| {
            let config = dirs
                .config(rank, rank)
                .set("SCR_COPY_TYPE", "SINGLE")
                .set("SCR_FLUSH", "1")
                .set("SCR_DROP_AFTER_CURRENT", "1");
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            for step in 1..=3u32 {
                scr.start_output(Some(&format!("ckpt.{}", step)), DatasetFlags::CHECKPOINT)
                    .unwrap();
                let user_path = dirs.prefix().join(format!("d/step{}.dat", step));
                write_routed(&mut scr, &user_path, b"x");
                scr.complete_output(true).unwrap();
            }

            // rolling back to step 1 forgets the two newer checkpoints
            scr.current("ckpt.1").unwrap();
            scr.finalize().unwrap();
        });
    }

    let index = PrefixIndex::load(&dirs.prefix()).unwrap();
    assert_eq!(index.current.as_deref(), Some("ckpt.1"));
    assert!(index.get_by_name("ckpt.1").is_some());
    assert!(index.get_by_name("ckpt.2").is_none());
    assert!(index.get_by_name("ckpt.3").is_none());
}
