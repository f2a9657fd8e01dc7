//! End-to-end walkthrough: four ranks run as threads, write a protected
//! checkpoint, lose one rank's node-local cache, and restart from the
//! surviving shards.
//!
//!     cargo run --example checkpoint-restart

use std::path::PathBuf;
use std::sync::Arc;

use scr::{Config, DatasetFlags, Scr};
use scr_comm::thread::ThreadComm;

const RANKS: usize = 4;

fn config_for(root: &PathBuf, rank: usize) -> Config {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());

    let mut config = Config::new()
        .set("SCR_PREFIX", &root.join("prefix").to_string_lossy())
        .set(
            "SCR_CNTL_BASE",
            &root.join(format!("cntl{}", rank)).to_string_lossy(),
        )
        .set(
            "SCR_CACHE_BASE",
            &root.join(format!("cache{}", rank)).to_string_lossy(),
        )
        .set("SCR_CACHE_BYPASS", "0")
        .set("SCR_COPY_TYPE", "XOR")
        .set("SCR_SET_SIZE", "4")
        .set("SCR_FLUSH", "0")
        .set("SCR_FETCH", "0");
    // one virtual node per rank, so the XOR set spans "nodes"
    config
        .apply(&format!("GROUPS={} NODE=node{}", hostname, rank))
        .unwrap();
    config
}

fn run<F>(f: F)
where
    F: Fn(usize, ThreadComm) + Send + Sync + Clone + 'static,
{
    let mut handles = Vec::new();
    for (rank, comm) in ThreadComm::world(RANKS).into_iter().enumerate() {
        let f = f.clone();
        handles.push(std::thread::spawn(move || f(rank, comm)));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

fn main() {
    env_logger::init();

    let tmp = tempfile::tempdir().unwrap();
    let root = Arc::new(tmp.path().to_path_buf());

    // first job: write one checkpoint
    {
        let root = Arc::clone(&root);
        run(move |rank, comm| {
            let config = config_for(&root, rank);
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            scr.start_output(Some("timestep.100"), DatasetFlags::CHECKPOINT)
                .unwrap();
            let user_path = root.join(format!("prefix/run/rank_{}.ckpt", rank));
            let routed = scr.route_file(&user_path).unwrap();
            scr_tools::fs::replace_file(
                &routed,
                format!("state of rank {} at step 100", rank).as_bytes(),
                false,
            )
            .unwrap();
            scr.complete_output(true).unwrap();
            scr.finalize().unwrap();
        });
    }

    // node 2 "fails"
    println!("wiping rank 2's node-local storage");
    std::fs::remove_dir_all(root.join("cntl2")).unwrap();
    std::fs::remove_dir_all(root.join("cache2")).unwrap();

    // second job: rebuild and restart
    {
        let root = Arc::clone(&root);
        run(move |rank, comm| {
            let config = config_for(&root, rank);
            let mut scr = Scr::init(&config, Box::new(comm)).unwrap();

            let name = scr
                .have_restart()
                .unwrap()
                .expect("checkpoint rebuilt from surviving shards");
            scr.start_restart().unwrap();

            let routed = scr
                .route_file(root.join(format!("prefix/run/rank_{}.ckpt", rank)))
                .unwrap();
            let data = scr_tools::fs::read_file(&routed).unwrap();
            println!(
                "rank {} restarted from '{}': {}",
                rank,
                name,
                String::from_utf8_lossy(&data)
            );

            scr.complete_restart(true).unwrap();
            scr.finalize().unwrap();
        });
    }
}
