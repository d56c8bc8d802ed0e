/// Runner job payloads, volume metadata records and retention policy
///
/// The payload handed to the runner is fully validated here, at
/// construction time; stage 2 never re-interprets label strings.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::config::Config;
use crate::utils::constants::{
    LABEL_REMOVE_ALL_BUT_N_FULL, LABEL_REMOVE_ALL_INC_OF_BUT_N_FULL, LABEL_REMOVE_OLDER_THAN,
};

/// Backup payload: per volume, its consuming containers and the
/// retention overrides read from the volume's labels.
pub type BackupJob = BTreeMap<String, BackupVolumeJob>;

/// Restore payload: per volume, its consuming containers. Restore is
/// unconditional, so there is nothing else to carry.
pub type RestoreJob = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupVolumeJob {
    pub containers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_older_than: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_all_but_n_full: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_all_inc_of_but_n_full: Option<u32>,
}

impl BackupVolumeJob {
    /// Build a job entry from a volume's label map.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Result<Self> {
        Ok(Self {
            containers: Vec::new(),
            remove_older_than: labels.get(LABEL_REMOVE_OLDER_THAN).cloned(),
            remove_all_but_n_full: parse_count(labels, LABEL_REMOVE_ALL_BUT_N_FULL)?,
            remove_all_inc_of_but_n_full: parse_count(labels, LABEL_REMOVE_ALL_INC_OF_BUT_N_FULL)?,
        })
    }
}

fn parse_count(labels: &BTreeMap<String, String>, key: &str) -> Result<Option<u32>> {
    labels
        .get(key)
        .map(|raw| {
            raw.parse()
                .with_context(|| format!("label {key} must be a number, got '{raw}'"))
        })
        .transpose()
}

/// The single active retention mode for a volume.
///
/// A volume-level override takes precedence field by field over the
/// global configuration; among the merged fields the most specific
/// mode wins: increment-count, then full-count, then age.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retention {
    AllIncOfButNFull(u32),
    AllButNFull(u32),
    OlderThan(String),
}

impl Retention {
    pub fn engine_args(&self) -> Vec<String> {
        match self {
            Self::AllIncOfButNFull(n) => {
                vec!["remove-all-inc-of-but-n-full".to_string(), n.to_string()]
            }
            Self::AllButNFull(n) => vec!["remove-all-but-n-full".to_string(), n.to_string()],
            Self::OlderThan(age) => vec!["remove-older-than".to_string(), age.clone()],
        }
    }
}

pub fn retention_for(job: &BackupVolumeJob, config: &Config) -> Option<Retention> {
    let inc = job
        .remove_all_inc_of_but_n_full
        .or(config.remove_all_inc_of_but_n_full);
    let full = job.remove_all_but_n_full.or(config.remove_all_but_n_full);
    let age = job
        .remove_older_than
        .clone()
        .or_else(|| config.remove_older_than.clone());

    if let Some(n) = inc {
        return Some(Retention::AllIncOfButNFull(n));
    }
    if let Some(n) = full {
        return Some(Retention::AllButNFull(n));
    }
    age.map(Retention::OlderThan)
}

/// Persisted snapshot of a volume: only Name and Labels, anything more
/// is unnecessary and could cause trouble on recreate. Field names
/// match the runtime API so the record can be fed back into volume
/// creation as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Labels", default)]
    pub labels: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn empty_config() -> Config {
        Config::from_vars(&HashMap::new()).unwrap()
    }

    fn config_with(pairs: &[(&str, &str)]) -> Config {
        Config::from_vars(
            &pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_overrides_from_labels() {
        let labels: BTreeMap<String, String> = [
            (LABEL_REMOVE_ALL_BUT_N_FULL.to_string(), "4".to_string()),
            ("com.example.other".to_string(), "x".to_string()),
        ]
        .into();
        let job = BackupVolumeJob::from_labels(&labels).unwrap();
        assert_eq!(job.remove_all_but_n_full, Some(4));
        assert!(job.remove_older_than.is_none());

        let bad: BTreeMap<String, String> =
            [(LABEL_REMOVE_ALL_BUT_N_FULL.to_string(), "four".to_string())].into();
        assert!(BackupVolumeJob::from_labels(&bad).is_err());
    }

    #[test]
    fn test_no_retention_configured() {
        assert_eq!(
            retention_for(&BackupVolumeJob::default(), &empty_config()),
            None
        );
    }

    #[test]
    fn test_retention_priority_order() {
        let job = BackupVolumeJob {
            remove_older_than: Some("2M".to_string()),
            remove_all_but_n_full: Some(3),
            remove_all_inc_of_but_n_full: Some(5),
            ..Default::default()
        };
        assert_eq!(
            retention_for(&job, &empty_config()),
            Some(Retention::AllIncOfButNFull(5))
        );

        let job = BackupVolumeJob {
            remove_older_than: Some("2M".to_string()),
            remove_all_but_n_full: Some(3),
            ..Default::default()
        };
        assert_eq!(
            retention_for(&job, &empty_config()),
            Some(Retention::AllButNFull(3))
        );

        let job = BackupVolumeJob {
            remove_older_than: Some("2M".to_string()),
            ..Default::default()
        };
        assert_eq!(
            retention_for(&job, &empty_config()),
            Some(Retention::OlderThan("2M".to_string()))
        );
    }

    #[test]
    fn test_volume_override_beats_global_config() {
        let config = config_with(&[("REMOVE_OLDER_THAN", "6M")]);
        let job = BackupVolumeJob {
            remove_all_but_n_full: Some(2),
            ..Default::default()
        };
        // The volume's full-count mode outranks the global age mode.
        assert_eq!(
            retention_for(&job, &config),
            Some(Retention::AllButNFull(2))
        );

        // And with no override the global mode applies.
        assert_eq!(
            retention_for(&BackupVolumeJob::default(), &config),
            Some(Retention::OlderThan("6M".to_string()))
        );
    }

    #[test]
    fn test_retention_engine_args() {
        assert_eq!(
            Retention::AllIncOfButNFull(2).engine_args(),
            vec!["remove-all-inc-of-but-n-full", "2"]
        );
        assert_eq!(
            Retention::OlderThan("1Y".to_string()).engine_args(),
            vec!["remove-older-than", "1Y"]
        );
    }

    #[test]
    fn test_job_payload_round_trip() {
        let mut job = BackupJob::new();
        job.insert(
            "db_data".to_string(),
            BackupVolumeJob {
                containers: vec!["aaa".to_string(), "bbb".to_string()],
                remove_all_but_n_full: Some(3),
                ..Default::default()
            },
        );
        let encoded = serde_json::to_string(&job).unwrap();
        // Unset overrides stay off the wire entirely.
        assert!(!encoded.contains("remove_older_than"));
        let decoded: BackupJob = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_volume_record_uses_runtime_field_names() {
        let record = VolumeRecord {
            name: "db_data".to_string(),
            labels: [("a".to_string(), "1".to_string())].into(),
        };
        let encoded = serde_json::to_string(&record).unwrap();
        assert!(encoded.contains("\"Name\""));
        assert!(encoded.contains("\"Labels\""));
        let decoded: VolumeRecord = serde_json::from_str("{\"Name\":\"v\"}").unwrap();
        assert!(decoded.labels.is_empty());
    }
}
