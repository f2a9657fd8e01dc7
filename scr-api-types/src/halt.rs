use serde::{Deserialize, Serialize};

/// Contents of the halt file in the prefix directory.
///
/// External scripts edit this record to ask a running job to exit; rank 0
/// re-reads it at well-defined points and decrements the checkpoint counter.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HaltState {
    /// Remaining checkpoints before the job should exit; counts down.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub checkpoints_left: Option<i64>,
    /// Exit before this epoch time (allowing for `halt_seconds` of slack).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exit_before: Option<i64>,
    /// Exit once this epoch time has passed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exit_after: Option<i64>,
    /// Exit when fewer than this many seconds remain in the allocation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub halt_seconds: Option<i64>,
    /// Reason recorded by whoever requested the halt.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exit_reason: Option<String>,
}

impl HaltState {
    /// Decrement the remaining-checkpoints counter, stopping at zero.
    pub fn decrement_checkpoints(&mut self, count: i64) {
        if let Some(left) = self.checkpoints_left {
            let next = left - count;
            self.checkpoints_left = Some(if next > 0 { next } else { 0 });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrement_saturates() {
        let mut halt = HaltState::default();
        halt.decrement_checkpoints(1);
        assert_eq!(halt.checkpoints_left, None);

        halt.checkpoints_left = Some(2);
        halt.decrement_checkpoints(1);
        assert_eq!(halt.checkpoints_left, Some(1));
        halt.decrement_checkpoints(5);
        assert_eq!(halt.checkpoints_left, Some(0));
    }
}
