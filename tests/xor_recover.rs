//! Four ranks protect a checkpoint with XOR, one rank loses its node, and
//! a restarted job rebuilds the lost files from the surviving shards.

mod common;

use common::{run_ranks, write_routed, JobDirs};
use scr::{DatasetFlags, Scr};
use std::sync::Arc;

#[test]
fn xor_rebuild_after_single_node_loss() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    // first run: write and protect a checkpoint
    {
        let dirs = Arc::clone(&dirs);
        run_ranks(4, move |rank, comm| {
            let config = dirs
                .config(rank, rank)
                .set("SCR_COPY_TYPE", "XOR")
                .set("SCR_SET_SIZE", "4");
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            scr.start_output(Some("ckpt.1"), DatasetFlags::CHECKPOINT)
                .unwrap();
            let user_path = dirs.prefix().join(format!("ckpt/rank_{}.txt", rank));
            let routed = write_routed(&mut scr, &user_path, format!("hello from rank {}", rank).as_bytes());
            assert_ne!(routed, user_path, "non-bypass routes into cache");
            scr.complete_output(true).unwrap();

            scr.finalize().unwrap();
        });
    }

    // node 2 dies
    dirs.wipe_rank(2);

    // second run: scalable restart rebuilds rank 2 from the shards
    {
        let dirs = Arc::clone(&dirs);
        run_ranks(4, move |rank, comm| {
            let config = dirs
                .config(rank, rank)
                .set("SCR_COPY_TYPE", "XOR")
                .set("SCR_SET_SIZE", "4");
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            let name = scr.have_restart().unwrap();
            assert_eq!(name.as_deref(), Some("ckpt.1"));

            let name = scr.start_restart().unwrap();
            assert_eq!(name, "ckpt.1");

            let user_path = dirs.prefix().join(format!("ckpt/rank_{}.txt", rank));
            let routed = scr.route_file(&user_path).unwrap();
            let data = scr_tools::fs::read_file(&routed).unwrap();
            assert_eq!(data, format!("hello from rank {}", rank).into_bytes());

            scr.complete_restart(true).unwrap();
            scr.finalize().unwrap();
        });
    }
}
