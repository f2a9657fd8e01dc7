//! Event and transfer records.
//!
//! Observable milestones (checkpoint start/end, flush, fetch, rebuild,
//! halt) are emitted as structured records on dedicated log targets so an
//! operator can split them from debug chatter and route them to whatever
//! sink the embedding configures. Timestamps are epoch seconds; durations
//! and byte counts are attached when known.

use std::fmt::Write as _;

use crate::env;

pub const EVENT_TARGET: &str = "scr::event";
pub const TRANSFER_TARGET: &str = "scr::transfer";

/// A milestone record under construction.
pub struct Event<'a> {
    kind: &'a str,
    fields: String,
}

impl<'a> Event<'a> {
    pub fn new(kind: &'a str) -> Event<'a> {
        Event {
            kind,
            fields: String::new(),
        }
    }

    pub fn dataset(mut self, id: u64, name: &str) -> Self {
        let _ = write!(self.fields, " dataset={} name={}", id, name);
        self
    }

    pub fn ckpt(mut self, id: u64) -> Self {
        let _ = write!(self.fields, " ckpt={}", id);
        self
    }

    pub fn note(mut self, key: &str, value: &str) -> Self {
        let _ = write!(self.fields, " {}={}", key, value);
        self
    }

    pub fn secs(mut self, secs: f64) -> Self {
        let _ = write!(self.fields, " secs={:.6}", secs);
        self
    }

    pub fn bytes(mut self, bytes: u64) -> Self {
        let _ = write!(self.fields, " bytes={}", bytes);
        self
    }

    pub fn files(mut self, files: u64) -> Self {
        let _ = write!(self.fields, " files={}", files);
        self
    }

    /// Emit as an event record.
    pub fn emit(self) {
        log::info!(
            target: EVENT_TARGET,
            "time={} event={}{}",
            env::now_secs(),
            self.kind,
            self.fields
        );
    }

    /// Emit as a transfer record (writes, flushes, fetches).
    pub fn emit_transfer(self) {
        log::info!(
            target: TRANSFER_TARGET,
            "time={} xfer={}{}",
            env::now_secs(),
            self.kind,
            self.fields
        );
    }
}

/// Bandwidth in MB/s for a transfer record; zero when the clock read is
/// degenerate.
pub fn bandwidth_mb(bytes: u64, secs: f64) -> f64 {
    if secs > 0.0 {
        bytes as f64 / (1024.0 * 1024.0 * secs)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_accumulate() {
        let event = Event::new("CHECKPOINT_END")
            .dataset(3, "ckpt.3")
            .ckpt(2)
            .secs(1.5)
            .bytes(4096)
            .files(4);
        assert_eq!(
            event.fields,
            " dataset=3 name=ckpt.3 ckpt=2 secs=1.500000 bytes=4096 files=4"
        );
    }

    #[test]
    fn bandwidth_degenerate_clock() {
        assert_eq!(bandwidth_mb(1 << 20, 0.0), 0.0);
        assert!((bandwidth_mb(1 << 20, 1.0) - 1.0).abs() < 1e-9);
    }
}
