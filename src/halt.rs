//! Halt file handling.
//!
//! External scripts ask a running job to exit by editing the halt file in
//! the prefix directory. Rank 0 re-reads it at well-defined points with
//! decrement-and-rewrite semantics under the advisory lock, and the
//! decision is broadcast so all ranks exit together.

use std::path::Path;
use std::time::Duration;

use anyhow::{format_err, Error};

use scr_api_types::HaltState;
use scr_tools::lock::LockedFile;

use crate::env;

/// Reason recorded when finalize completes normally; ignored as a halt
/// condition so an intentional restart is not refused.
pub const FINALIZE_CALLED: &str = "SCR_FINALIZE_CALLED";

const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Lock the halt file, merge in outside edits, decrement the checkpoint
/// counter and write the result back. Rank 0 only; `state` is updated to
/// the merged record.
pub fn sync_and_decrement(
    path: &Path,
    state: &mut HaltState,
    decrement: i64,
) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        scr_tools::fs::create_path(parent)?;
    }
    let mut locked = LockedFile::open(path, LOCK_TIMEOUT, true)?;

    let data = locked.read_to_vec()?;
    let mut merged: HaltState = if data.is_empty() {
        HaltState::default()
    } else {
        serde_json::from_slice(&data)
            .map_err(|err| format_err!("unable to parse halt file {:?} - {}", path, err))?
    };

    // pending in-memory values fill holes the file does not cover
    if merged.exit_reason.is_none() {
        merged.exit_reason = state.exit_reason.take();
    }
    if merged.checkpoints_left.is_none() {
        merged.checkpoints_left = state.checkpoints_left;
    }
    if merged.exit_before.is_none() {
        merged.exit_before = state.exit_before;
    }
    if merged.exit_after.is_none() {
        merged.exit_after = state.exit_after;
    }
    if merged.halt_seconds.is_none() {
        merged.halt_seconds = state.halt_seconds;
    }

    merged.decrement_checkpoints(decrement);

    locked.rewrite(&serde_json::to_vec_pretty(&merged)?)?;
    *state = merged;
    Ok(())
}

/// Evaluate the halt conditions against the current time.
///
/// Returns the reason string of the first active condition, or `None`
/// when the job may keep running.
pub fn active_condition(state: &HaltState, end_time: Option<i64>) -> Option<&'static str> {
    let now = env::now_secs();
    let halt_seconds = state.halt_seconds.unwrap_or(0);

    if halt_seconds > 0 {
        if let Some(remaining) = env::seconds_remaining(end_time) {
            if remaining >= 0 && remaining <= halt_seconds {
                return Some("TIME_LIMIT");
            }
        }
    }

    if let Some(reason) = &state.exit_reason {
        if !reason.is_empty() && reason != FINALIZE_CALLED {
            return Some("EXIT_REASON");
        }
    }

    if state.checkpoints_left == Some(0) {
        return Some("NO_CHECKPOINTS_LEFT");
    }

    if let Some(exit_before) = state.exit_before {
        if now >= exit_before - halt_seconds {
            return Some("EXIT_BEFORE_TIME");
        }
    }

    if let Some(exit_after) = state.exit_after {
        if now >= exit_after {
            return Some("EXIT_AFTER_TIME");
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrement_through_file() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("halt.scr");

        let mut state = HaltState {
            checkpoints_left: Some(2),
            ..HaltState::default()
        };
        sync_and_decrement(&path, &mut state, 1)?;
        assert_eq!(state.checkpoints_left, Some(1));

        // a fresh reader picks the decremented value off disk
        let mut other = HaltState::default();
        sync_and_decrement(&path, &mut other, 1)?;
        assert_eq!(other.checkpoints_left, Some(0));
        assert!(active_condition(&other, None).is_some());
        Ok(())
    }

    #[test]
    fn conditions() {
        let state = HaltState::default();
        assert_eq!(active_condition(&state, None), None);

        let state = HaltState {
            exit_reason: Some("POKED".to_string()),
            ..HaltState::default()
        };
        assert_eq!(active_condition(&state, None), Some("EXIT_REASON"));

        // a clean finalize from a prior run is not a halt condition
        let state = HaltState {
            exit_reason: Some(FINALIZE_CALLED.to_string()),
            ..HaltState::default()
        };
        assert_eq!(active_condition(&state, None), None);

        let state = HaltState {
            exit_after: Some(env::now_secs() - 10),
            ..HaltState::default()
        };
        assert_eq!(active_condition(&state, None), Some("EXIT_AFTER_TIME"));

        let state = HaltState {
            halt_seconds: Some(600),
            ..HaltState::default()
        };
        let end = Some(env::now_secs() + 60);
        assert_eq!(active_condition(&state, end), Some("TIME_LIMIT"));
    }
}
