use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::ObjectId;
use crate::defaults::{
    DEFAULT_MONITOR_INTERVAL, DEFAULT_NONPAGED_DATA_SIZE, DEFAULT_NUMBER_OF_STRIPES,
};

/// Object class. Only RAID groups and virtual drives issue metadata
/// sub-requests whose master packets the quiesce scan has to count.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ObjectClass {
    #[default]
    RaidGroup,
    VirtualDrive,
    Other,
}

impl ObjectClass {
    pub fn issues_metadata_requests(self) -> bool {
        matches!(self, ObjectClass::RaidGroup | ObjectClass::VirtualDrive)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageObjectConf {
    pub object_id: ObjectId,
    pub generation: u64,
    pub class: ObjectClass,
    pub number_of_stripes: u64,
    /// Class data bytes in the non-paged record.
    pub nonpaged_data_size: usize,
    /// Non-paged control files live in `workdir/<object id>`.
    pub workdir: Utf8PathBuf,
    pub no_sync: bool,
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
    /// Quiesce requests come from the user and do not arm unquiesce.
    pub user_initiated_quiesce: bool,
}

impl Default for StorageObjectConf {
    fn default() -> Self {
        StorageObjectConf {
            object_id: ObjectId(0x108),
            generation: 1,
            class: ObjectClass::default(),
            number_of_stripes: DEFAULT_NUMBER_OF_STRIPES,
            nonpaged_data_size: DEFAULT_NONPAGED_DATA_SIZE,
            workdir: Utf8PathBuf::from("./"),
            no_sync: false,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            user_initiated_quiesce: false,
        }
    }
}

impl StorageObjectConf {
    pub fn from_json_file(path: &Utf8Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse {path}"))
    }

    pub fn object_dir(&self) -> Utf8PathBuf {
        self.workdir.join(format!("{:08x}", self.object_id.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let conf: StorageObjectConf = serde_json::from_str(
            r#"{"object_id": 42, "class": "virtual_drive", "monitor_interval": "250ms"}"#,
        )
        .unwrap();
        assert_eq!(conf.object_id, ObjectId(42));
        assert_eq!(conf.class, ObjectClass::VirtualDrive);
        assert_eq!(conf.monitor_interval, Duration::from_millis(250));
        assert_eq!(conf.number_of_stripes, DEFAULT_NUMBER_OF_STRIPES);
        assert_eq!(conf.object_dir(), Utf8PathBuf::from("./0000002a"));
    }

    #[test]
    fn class_parsing() {
        assert_eq!("other".parse::<ObjectClass>().unwrap(), ObjectClass::Other);
        assert!(!ObjectClass::Other.issues_metadata_requests());
        assert!(ObjectClass::RaidGroup.issues_metadata_requests());
    }

    #[test]
    fn reads_json_file() -> anyhow::Result<()> {
        let dir = camino_tempfile::tempdir()?;
        let path = dir.path().join("object.json");
        std::fs::write(&path, r#"{"generation": 7, "no_sync": true}"#)?;
        let conf = StorageObjectConf::from_json_file(&path)?;
        assert_eq!(conf.generation, 7);
        assert!(conf.no_sync);
        assert!(StorageObjectConf::from_json_file(&dir.path().join("missing.json")).is_err());
        Ok(())
    }
}
