//! Two ranks protect a checkpoint with PARTNER copies; rank 0 loses its
//! node and is rebuilt from the copies held by rank 1.

mod common;

use common::{run_ranks, write_routed, JobDirs};
use scr::{DatasetFlags, Scr};
use std::sync::Arc;

fn config_for(dirs: &JobDirs, rank: usize) -> scr::Config {
    dirs.config(rank, rank)
        .set("SCR_COPY_TYPE", "PARTNER")
        .set("SCR_SET_SIZE", "2")
}

#[test]
fn partner_rebuild_after_node_loss() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(2, move |rank, comm| {
            let config = config_for(&dirs, rank);
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            scr.start_output(Some("ckpt.1"), DatasetFlags::CHECKPOINT)
                .unwrap();
            let name = if rank == 0 { "a" } else { "b" };
            let user_path = dirs.prefix().join("out").join(name);
            write_routed(&mut scr, &user_path, format!("file {} payload", name).as_bytes());
            scr.complete_output(true).unwrap();
            scr.finalize().unwrap();
        });
    }

    dirs.wipe_rank(0);

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(2, move |rank, comm| {
            let config = config_for(&dirs, rank);
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            assert_eq!(scr.have_restart().unwrap().as_deref(), Some("ckpt.1"));
            scr.start_restart().unwrap();

            let name = if rank == 0 { "a" } else { "b" };
            let routed = scr.route_file(dirs.prefix().join("out").join(name)).unwrap();
            let data = scr_tools::fs::read_file(&routed).unwrap();
            assert_eq!(data, format!("file {} payload", name).into_bytes());

            scr.complete_restart(true).unwrap();
            scr.finalize().unwrap();
        });
    }
}
