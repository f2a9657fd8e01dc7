//! Checkpoint-decision heuristics and boundary behaviors.

mod common;

use common::{run_ranks, write_routed, JobDirs};
use scr::{DatasetFlags, Scr};
use std::path::Path;
use std::sync::Arc;

#[test]
fn interval_heuristic_gates_checkpoints() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(2, move |rank, comm| {
            let config = dirs
                .config(rank, rank)
                .set("SCR_COPY_TYPE", "PARTNER")
                .set("SCR_SET_SIZE", "2")
                .set("SCR_CHECKPOINT_INTERVAL", "3");
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            // every third call says yes
            let flags: Vec<bool> = (0..6).map(|_| scr.need_checkpoint().unwrap()).collect();
            assert_eq!(flags, vec![false, false, true, false, false, true]);

            scr.finalize().unwrap();
        });
    }
}

#[test]
fn unconfigured_heuristics_always_say_yes() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(1, move |rank, comm| {
            let config = dirs.config(rank, rank).set("SCR_COPY_TYPE", "SINGLE");
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();
            assert!(scr.need_checkpoint().unwrap());
            assert!(scr.need_checkpoint().unwrap());
            scr.finalize().unwrap();
        });
    }
}

#[test]
fn zero_byte_files_survive_xor_rebuild() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    let config_for = |dirs: &JobDirs, rank: usize| {
        dirs.config(rank, rank)
            .set("SCR_COPY_TYPE", "XOR")
            .set("SCR_SET_SIZE", "4")
    };

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(4, move |rank, comm| {
            let config = config_for(&dirs, rank);
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            scr.start_output(Some("ckpt.empty"), DatasetFlags::CHECKPOINT)
                .unwrap();
            // rank 1 writes nothing at all into its file
            let data = if rank == 1 {
                Vec::new()
            } else {
                vec![rank as u8; 64]
            };
            let user_path = dirs.prefix().join(format!("z/rank_{}.dat", rank));
            write_routed(&mut scr, &user_path, &data);
            scr.complete_output(true).unwrap();
            scr.finalize().unwrap();
        });
    }

    dirs.wipe_rank(1);

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(4, move |rank, comm| {
            let config = config_for(&dirs, rank);
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            assert_eq!(scr.have_restart().unwrap().as_deref(), Some("ckpt.empty"));
            scr.start_restart().unwrap();
            let routed = scr
                .route_file(dirs.prefix().join(format!("z/rank_{}.dat", rank)))
                .unwrap();
            let data = scr_tools::fs::read_file(&routed).unwrap();
            if rank == 1 {
                assert!(data.is_empty());
            } else {
                assert_eq!(data, vec![rank as u8; 64]);
            }
            scr.complete_restart(true).unwrap();
            scr.finalize().unwrap();
        });
    }
}

#[test]
fn route_file_rejects_empty_and_passes_through_idle() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = Arc::new(JobDirs::new(tmp.path()));

    {
        let dirs = Arc::clone(&dirs);
        run_ranks(1, move |rank, comm| {
            let config = dirs.config(rank, rank).set("SCR_COPY_TYPE", "SINGLE");
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            // outside a phase the route is the identity
            let routed = scr.route_file("/some/where/file.dat").unwrap();
            assert_eq!(routed, Path::new("/some/where/file.dat"));

            assert!(scr.route_file("").is_err());

            scr.finalize().unwrap();
        });
    }
}
