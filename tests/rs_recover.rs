//! Four ranks protect a checkpoint with Reed-Solomon tolerating two
//! failures; two ranks lose their nodes and both are rebuilt.

mod common;

use common::{run_ranks, write_routed, JobDirs};
use scr::{DatasetFlags, Scr};
use std::sync::Arc;

fn config_for(dirs: &JobDirs, rank: usize) -> scr::Config {
    dirs.config(rank, rank)
        .set("SCR_COPY_TYPE", "RS")
        .set("SCR_SET_SIZE", "4")
        .set("SCR_SET_FAILURES", "2")
}

#[test]
fn rs_rebuild_after_double_node_loss() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(4, move |rank, comm| {
            let config = config_for(&dirs, rank);
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            scr.start_output(Some("ckpt.1"), DatasetFlags::CHECKPOINT)
                .unwrap();
            let user_path = dirs.prefix().join(format!("run/state_{}.dat", rank));
            // uneven sizes exercise the padding
            let data = vec![rank as u8 + 1; 1000 + rank * 321];
            write_routed(&mut scr, &user_path, &data);
            scr.complete_output(true).unwrap();
            scr.finalize().unwrap();
        });
    }

    dirs.wipe_rank(1);
    dirs.wipe_rank(3);

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(4, move |rank, comm| {
            let config = config_for(&dirs, rank);
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            assert_eq!(scr.have_restart().unwrap().as_deref(), Some("ckpt.1"));
            scr.start_restart().unwrap();

            let routed = scr
                .route_file(dirs.prefix().join(format!("run/state_{}.dat", rank)))
                .unwrap();
            let data = scr_tools::fs::read_file(&routed).unwrap();
            assert_eq!(data, vec![rank as u8 + 1; 1000 + rank * 321]);

            scr.complete_restart(true).unwrap();
            scr.finalize().unwrap();
        });
    }
}

#[test]
fn rs_triple_loss_is_unrecoverable() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(4, move |rank, comm| {
            let config = config_for(&dirs, rank);
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();
            scr.start_output(Some("ckpt.1"), DatasetFlags::CHECKPOINT)
                .unwrap();
            let user_path = dirs.prefix().join(format!("run/state_{}.dat", rank));
            write_routed(&mut scr, &user_path, b"payload");
            scr.complete_output(true).unwrap();
            scr.finalize().unwrap();
        });
    }

    dirs.wipe_rank(0);
    dirs.wipe_rank(1);
    dirs.wipe_rank(2);

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(4, move |rank, comm| {
            let config = config_for(&dirs, rank);
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();
            // three of four members lost with m=2: nothing to restart from
            assert_eq!(scr.have_restart().unwrap(), None);
            scr.finalize().unwrap();
        });
    }
}
