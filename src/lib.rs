//! Scalable multi-level checkpoint/restart.
//!
//! Applications composed of many cooperating processes periodically write
//! their state through this library. Datasets are staged into fast
//! node-local cache storage, protected by a redundancy scheme so the job
//! survives node loss without a parallel-file-system round trip, and
//! copied to the durable prefix directory either synchronously or in the
//! background.
//!
//! All public operations on [`Scr`] are collective: every process of the
//! job must call them in the same order with matching arguments. The
//! transport is abstract (see [`scr_comm::Comm`]); ranks may be OS
//! processes bridged by a launcher or threads using the in-process
//! transport.

pub mod api;
pub mod config;
pub mod env;
pub mod events;
pub mod fetch;
pub mod flush;
pub mod groupdesc;
pub mod halt;
pub mod mover;
pub mod prefix;
pub mod rebuild;
pub mod reddesc;
pub mod redundancy;
pub mod storedesc;
pub mod summary;

pub use api::Scr;
pub use config::{Config, Params};
pub use scr_api_types::{CopyType, Dataset, DatasetFlags};

/// Library version string reported by `version()`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the library version.
pub fn version() -> &'static str {
    VERSION
}
