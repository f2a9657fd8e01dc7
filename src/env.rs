//! Job environment detection: user, job id, hostname, remaining time.

use anyhow::{format_err, Error};

/// Name of the user owning this process.
pub fn username() -> Result<String, Error> {
    let uid = nix::unistd::Uid::effective();
    let user = nix::unistd::User::from_uid(uid)
        .map_err(|err| format_err!("user lookup for uid {} failed - {}", uid, err))?
        .ok_or_else(|| format_err!("no passwd entry for uid {}", uid))?;
    Ok(user.name)
}

/// Job id from the environment, falling back through the common resource
/// manager variables. Returns a fixed placeholder when nothing is set so a
/// plain interactive run still gets a usable control directory.
pub fn jobid() -> String {
    for key in ["SCR_JOB_ID", "SLURM_JOB_ID", "LSB_JOBID", "PBS_JOBID"] {
        if let Ok(value) = std::env::var(key) {
            if !value.is_empty() {
                return value;
            }
        }
    }
    "defjobid".to_string()
}

/// Job name, if the scheduler provides one.
pub fn jobname() -> Option<String> {
    for key in ["SCR_JOB_NAME", "SLURM_JOB_NAME", "LSB_JOBNAME"] {
        if let Ok(value) = std::env::var(key) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

/// Cluster name, if configured.
pub fn cluster() -> Option<String> {
    std::env::var("SCR_CLUSTER_NAME").ok().filter(|v| !v.is_empty())
}

/// Hostname of the node this process runs on.
pub fn hostname() -> Result<String, Error> {
    let name = nix::unistd::gethostname()
        .map_err(|err| format_err!("gethostname failed - {}", err))?;
    Ok(name.to_string_lossy().into_owned())
}

/// Current time as seconds since the epoch.
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current time in microseconds since the epoch, used for dataset
/// creation stamps.
pub fn now_usecs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Seconds remaining in the allocation, if an end time is known.
///
/// The launcher exports the allocation end as an epoch value; without it
/// the halt-seconds condition is inert.
pub fn seconds_remaining(end_time: Option<i64>) -> Option<i64> {
    end_time.map(|end| end - now_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobid_placeholder() {
        // no scheduler variables in the test environment
        for key in ["SCR_JOB_ID", "SLURM_JOB_ID", "LSB_JOBID", "PBS_JOBID"] {
            std::env::remove_var(key);
        }
        assert_eq!(jobid(), "defjobid");
    }

    #[test]
    fn remaining_time() {
        assert_eq!(seconds_remaining(None), None);
        let remaining = seconds_remaining(Some(now_secs() + 100)).unwrap();
        assert!((99..=100).contains(&remaining));
    }
}
