//! Harness for multi-rank scenarios: ranks run as threads over the
//! in-process transport, each with its own control and cache base
//! directory (one virtual node per rank unless stated otherwise) and a
//! shared prefix directory.

// not every scenario uses every helper
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use scr::Config;
use scr_comm::thread::ThreadComm;

pub struct JobDirs {
    pub root: PathBuf,
}

impl JobDirs {
    pub fn new(root: &Path) -> JobDirs {
        JobDirs {
            root: root.to_path_buf(),
        }
    }

    pub fn prefix(&self) -> PathBuf {
        self.root.join("prefix")
    }

    pub fn cntl_base(&self, rank: usize) -> PathBuf {
        self.root.join(format!("cntl{}", rank))
    }

    pub fn cache_base(&self, rank: usize) -> PathBuf {
        self.root.join(format!("cache{}", rank))
    }

    /// Base configuration for one rank, placing it on virtual node
    /// `node`. Flushing, fetching and rebuild are enabled by the caller as
    /// needed.
    pub fn config(&self, rank: usize, node: usize) -> Config {
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        let mut config = Config::new()
            .set("SCR_PREFIX", &self.prefix().to_string_lossy())
            .set("SCR_CNTL_BASE", &self.cntl_base(rank).to_string_lossy())
            .set("SCR_CACHE_BASE", &self.cache_base(rank).to_string_lossy())
            .set("SCR_CACHE_BYPASS", "0")
            .set("SCR_FLUSH", "0")
            .set("SCR_FETCH", "0");
        config
            .apply(&format!("GROUPS={} NODE=node{}", hostname, node))
            .unwrap();
        config
    }

    /// Wipe one rank's control and cache trees, as if its node died.
    pub fn wipe_rank(&self, rank: usize) {
        let _ = std::fs::remove_dir_all(self.cntl_base(rank));
        let _ = std::fs::remove_dir_all(self.cache_base(rank));
    }
}

/// Run `f` once per rank on its own thread; panics propagate.
pub fn run_ranks<F>(n: usize, f: F)
where
    F: Fn(usize, ThreadComm) + Send + Sync + Clone + 'static,
{
    let _ = env_logger::builder().is_test(true).try_init();

    let comms = ThreadComm::world(n);
    let mut handles = Vec::new();
    for (rank, comm) in comms.into_iter().enumerate() {
        let f = f.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("rank {}", rank))
                .spawn(move || f(rank, comm))
                .unwrap(),
        );
    }
    for handle in handles {
        if let Err(panic) = handle.join() {
            std::panic::resume_unwind(panic);
        }
    }
}

/// Write a file through `route_file` during an output phase.
pub fn write_routed(scr: &mut scr::Scr, user_path: &Path, data: &[u8]) -> PathBuf {
    let routed = scr.route_file(user_path).unwrap();
    scr_tools::fs::replace_file(&routed, data, false).unwrap();
    routed
}
