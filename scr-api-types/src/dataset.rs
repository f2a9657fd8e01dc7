use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Purpose flags of a dataset as passed to `start_output`.
    pub struct DatasetFlags: u32 {
        const CHECKPOINT = 0x1;
        const OUTPUT     = 0x2;
    }
}

impl Default for DatasetFlags {
    fn default() -> Self {
        DatasetFlags::empty()
    }
}

impl Serialize for DatasetFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for DatasetFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        DatasetFlags::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid dataset flags {:#x}", bits)))
    }
}

/// Descriptor of one collective output phase.
///
/// The id is unique and monotonic across the job; checkpoints additionally
/// carry their own monotonic checkpoint id. Totals and the complete flag are
/// filled in at `complete_output` once every rank has reported.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Dataset {
    pub id: u64,
    pub name: String,
    pub flags: DatasetFlags,
    /// Creation time in microseconds since the epoch.
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub jobid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub jobname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub files: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ckpt: Option<u64>,
}

impl Dataset {
    pub fn is_ckpt(&self) -> bool {
        self.flags.contains(DatasetFlags::CHECKPOINT)
    }

    pub fn is_output(&self) -> bool {
        self.flags.contains(DatasetFlags::OUTPUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_roundtrip() {
        let flags = DatasetFlags::CHECKPOINT | DatasetFlags::OUTPUT;
        let text = serde_json::to_string(&flags).unwrap();
        assert_eq!(text, "3");
        let back: DatasetFlags = serde_json::from_str(&text).unwrap();
        assert_eq!(back, flags);

        assert!(serde_json::from_str::<DatasetFlags>("8").is_err());
    }

    #[test]
    fn dataset_roundtrip() {
        let dataset = Dataset {
            id: 4,
            name: "timestep.4".to_string(),
            flags: DatasetFlags::CHECKPOINT,
            created: 1_700_000_000_000_000,
            user: Some("user1".to_string()),
            jobid: Some("1234".to_string()),
            jobname: None,
            cluster: None,
            files: 16,
            size: 1 << 20,
            complete: true,
            ckpt: Some(2),
        };
        let text = serde_json::to_string(&dataset).unwrap();
        let back: Dataset = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, 4);
        assert_eq!(back.ckpt, Some(2));
        assert!(back.is_ckpt());
        assert!(!back.is_output());
    }
}
