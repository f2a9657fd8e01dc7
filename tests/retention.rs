//! Retention window in the prefix directory: five checkpoints with a
//! window of two leave exactly the newest two pure checkpoints indexed.

mod common;

use common::{run_ranks, write_routed, JobDirs};
use scr::prefix::PrefixIndex;
use scr::{DatasetFlags, Scr};
use std::sync::Arc;

#[test]
fn window_of_two_keeps_newest_two() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(8, move |rank, comm| {
            let config = dirs
                .config(rank, rank)
                .set("SCR_COPY_TYPE", "SINGLE")
                .set("SCR_FLUSH", "1")
                .set("SCR_PREFIX_SIZE", "2");
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            for step in 1..=5u32 {
                scr.start_output(Some(&format!("ckpt.{}", step)), DatasetFlags::CHECKPOINT)
                    .unwrap();
                let user_path = dirs
                    .prefix()
                    .join(format!("steps/{}/rank_{}.dat", step, rank));
                write_routed(&mut scr, &user_path, format!("{}:{}", step, rank).as_bytes());
                scr.complete_output(true).unwrap();
            }
            scr.finalize().unwrap();
        });
    }

    let index = PrefixIndex::load(&dirs.prefix()).unwrap();
    let names: Vec<&str> = index
        .datasets
        .values()
        .map(|entry| entry.name.as_str())
        .collect();
    assert_eq!(names, vec!["ckpt.4", "ckpt.5"]);

    // evicted data left the prefix tree, kept data is intact
    assert!(!dirs.prefix().join("steps/1/rank_0.dat").exists());
    assert!(!dirs.prefix().join("steps/3/rank_7.dat").exists());
    assert!(dirs.prefix().join("steps/4/rank_2.dat").exists());
    assert!(dirs.prefix().join("steps/5/rank_6.dat").exists());
}

#[test]
fn halt_counter_requests_exit() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    // an external actor allots a single remaining checkpoint
    let halt_path = scr::prefix::halt_path(&dirs.prefix());
    scr_tools::fs::create_path(halt_path.parent().unwrap()).unwrap();
    scr_tools::fs::replace_file(&halt_path, b"{\"checkpoints-left\": 1}", false).unwrap();

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(2, move |rank, comm| {
            let config = dirs
                .config(rank, rank)
                .set("SCR_COPY_TYPE", "PARTNER")
                .set("SCR_SET_SIZE", "2")
                .set("SCR_HALT_EXIT", "0");
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            assert!(!scr.should_exit().unwrap());

            scr.start_checkpoint().unwrap();
            let user_path = dirs.prefix().join(format!("h/rank_{}.dat", rank));
            write_routed(&mut scr, &user_path, b"x");
            scr.complete_output(true).unwrap();

            // the counter hit zero; the job should wind down
            assert!(scr.should_exit().unwrap());
            scr.finalize().unwrap();
        });
    }
}
