/// Environment-driven configuration
///
/// Everything is read from the environment once at startup, the
/// docker-native way. Any variable can instead be provided as
/// `<NAME>_FILE` pointing at a file with the value (the usual secrets
/// convention), and an empty value counts as unset.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::utils::constants::{DEFAULT_IGNORE_REGEX, DEFAULT_TARGET_DIR, SOURCE_MOUNT_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3StorageClass {
    Standard,
    StandardIa,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region_code: Option<String>,
    pub endpoint_url: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub storage_class: S3StorageClass,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Standard five-field cron expression; unset disables the scheduler.
    pub backup_cron: Option<String>,
    /// Volumes matching this (from the start of the name) are skipped.
    pub ignore_regex: Option<Regex>,
    /// Passed to the engine so incremental chains get re-anchored.
    pub full_if_older_than: Option<String>,
    pub passphrase: Option<String>,

    /// Global retention. At most one of the three may be set; a volume
    /// label overrides them per volume.
    pub remove_older_than: Option<String>,
    pub remove_all_but_n_full: Option<u32>,
    pub remove_all_inc_of_but_n_full: Option<u32>,

    /// Backup target and metadata directory for the local backend.
    pub target_dir: PathBuf,
    pub s3: Option<S3Config>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(&std::env::vars().collect())
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let ignore_regex = match lookup(vars, "IGNORE_REGEX")? {
            Present(None) => None,
            Present(Some(pattern)) => {
                Some(Regex::new(&pattern).context("invalid IGNORE_REGEX pattern")?)
            }
            Absent => Some(
                Regex::new(DEFAULT_IGNORE_REGEX).context("invalid built-in ignore pattern")?,
            ),
        };
        let full_if_older_than = match lookup(vars, "FULL_IF_OLDER_THAN")? {
            Present(value) => value,
            Absent => Some("1M".to_string()),
        };

        let remove_older_than = value(vars, "REMOVE_OLDER_THAN")?;
        let remove_all_but_n_full = parsed(vars, "REMOVE_ALL_BUT_N_FULL")?;
        let remove_all_inc_of_but_n_full = parsed(vars, "REMOVE_ALL_INC_OF_BUT_N_FULL")?;
        let active_modes = [
            remove_older_than.is_some(),
            remove_all_but_n_full.is_some(),
            remove_all_inc_of_but_n_full.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if active_modes > 1 {
            bail!("only one of the REMOVE_* retention options can be specified");
        }

        let s3 = match value(vars, "S3_BUCKET_NAME")? {
            None => None,
            Some(bucket) => {
                let region_code = value(vars, "S3_REGION_CODE")?;
                let endpoint_url = value(vars, "S3_ENDPOINT_URL")?;
                if region_code.is_some() == endpoint_url.is_some() {
                    bail!("specify either S3_ENDPOINT_URL or S3_REGION_CODE (but not both)");
                }
                let access_key_id = value(vars, "AWS_ACCESS_KEY_ID")?
                    .context("storing to an S3 bucket requires AWS_ACCESS_KEY_ID")?;
                let secret_access_key = value(vars, "AWS_SECRET_ACCESS_KEY")?
                    .context("storing to an S3 bucket requires AWS_SECRET_ACCESS_KEY")?;
                let storage_class = match value(vars, "S3_STORAGE_CLASS")?.as_deref() {
                    None | Some("STANDARD") => S3StorageClass::Standard,
                    Some("STANDARD_IA") => S3StorageClass::StandardIa,
                    Some(other) => bail!("unsupported S3_STORAGE_CLASS '{other}'"),
                };
                Some(S3Config {
                    bucket,
                    region_code,
                    endpoint_url,
                    access_key_id,
                    secret_access_key,
                    storage_class,
                })
            }
        };

        Ok(Self {
            backup_cron: value(vars, "BACKUP_CRON")?,
            ignore_regex,
            full_if_older_than,
            passphrase: value(vars, "PASSPHRASE")?,
            remove_older_than,
            remove_all_but_n_full,
            remove_all_inc_of_but_n_full,
            target_dir: value(vars, "TARGET_DIR")?
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TARGET_DIR)),
            s3,
        })
    }

    /// Flags appended to every engine invocation.
    pub fn engine_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(s3) = &self.s3 {
            if let Some(region) = &s3.region_code {
                flags.push("--s3-region-name".to_string());
                flags.push(region.clone());
            } else if let Some(endpoint) = &s3.endpoint_url {
                flags.push("--s3-endpoint-url".to_string());
                flags.push(endpoint.clone());
            }
            if s3.storage_class == S3StorageClass::StandardIa {
                flags.push("--s3-use-ia".to_string());
            }
        }
        if self.passphrase.is_none() {
            flags.push("--no-encryption".to_string());
        }
        flags
    }

    /// Environment for the engine subprocess. Secrets are passed
    /// explicitly because their values may come from `_FILE` variables
    /// the engine cannot resolve itself; nothing else leaks through.
    pub fn engine_env(&self) -> Vec<(String, String)> {
        let mut env = vec![(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_default(),
        )];
        if let Some(passphrase) = &self.passphrase {
            env.push(("PASSPHRASE".to_string(), passphrase.clone()));
        }
        if let Some(s3) = &self.s3 {
            env.push(("AWS_ACCESS_KEY_ID".to_string(), s3.access_key_id.clone()));
            env.push((
                "AWS_SECRET_ACCESS_KEY".to_string(),
                s3.secret_access_key.clone(),
            ));
        }
        env
    }

    /// Engine target URL for one volume.
    pub fn engine_target(&self, volume: &str) -> String {
        match &self.s3 {
            // Engine-specific pseudo-URL, not a real S3 URL.
            Some(s3) => format!("s3:///{}/{}", s3.bucket, volume),
            None => format!("file://{}/{}", self.target_dir.display(), volume),
        }
    }

    /// Where a volume's data appears inside the runner.
    pub fn source_dir(volume: &str) -> PathBuf {
        PathBuf::from(SOURCE_MOUNT_PREFIX).join(volume)
    }
}

use self::Lookup::{Absent, Present};

enum Lookup {
    /// The variable (or its `_FILE` twin) exists; None means empty.
    Present(Option<String>),
    Absent,
}

fn lookup(vars: &HashMap<String, String>, key: &str) -> Result<Lookup> {
    if let Some(raw) = vars.get(key) {
        let trimmed = raw.trim();
        return Ok(Present((!trimmed.is_empty()).then(|| trimmed.to_string())));
    }
    let file_key = format!("{key}_FILE");
    if let Some(path) = vars.get(&file_key) {
        if !path.trim().is_empty() {
            let contents = std::fs::read_to_string(path.trim())
                .with_context(|| format!("failed to read {file_key} ({path})"))?;
            let contents = contents.trim_end_matches('\n').to_string();
            return Ok(Present((!contents.is_empty()).then_some(contents)));
        }
    }
    Ok(Absent)
}

fn value(vars: &HashMap<String, String>, key: &str) -> Result<Option<String>> {
    match lookup(vars, key)? {
        Present(value) => Ok(value),
        Absent => Ok(None),
    }
}

fn parsed(vars: &HashMap<String, String>, key: &str) -> Result<Option<u32>> {
    value(vars, key)?
        .map(|raw| {
            raw.parse()
                .with_context(|| format!("{key} must be a number, got '{raw}'"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(&vars(&[])).unwrap();
        assert_eq!(config.ignore_regex.unwrap().as_str(), DEFAULT_IGNORE_REGEX);
        assert_eq!(config.full_if_older_than.as_deref(), Some("1M"));
        assert_eq!(config.target_dir, PathBuf::from("/target"));
        assert!(config.s3.is_none());
        assert!(config.backup_cron.is_none());
    }

    #[test]
    fn test_empty_value_disables_default() {
        let config = Config::from_vars(&vars(&[("IGNORE_REGEX", ""), ("FULL_IF_OLDER_THAN", "")]))
            .unwrap();
        assert!(config.ignore_regex.is_none());
        assert!(config.full_if_older_than.is_none());
    }

    #[test]
    fn test_retention_modes_are_exclusive() {
        let result = Config::from_vars(&vars(&[
            ("REMOVE_OLDER_THAN", "2M"),
            ("REMOVE_ALL_BUT_N_FULL", "3"),
        ]));
        assert!(result.is_err());

        let config = Config::from_vars(&vars(&[("REMOVE_ALL_BUT_N_FULL", "3")])).unwrap();
        assert_eq!(config.remove_all_but_n_full, Some(3));
    }

    #[test]
    fn test_file_variable_indirection() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hunter2").unwrap();
        let config = Config::from_vars(&vars(&[(
            "PASSPHRASE_FILE",
            file.path().to_str().unwrap(),
        )]))
        .unwrap();
        assert_eq!(config.passphrase.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_plain_variable_wins_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "from-file").unwrap();
        let config = Config::from_vars(&vars(&[
            ("PASSPHRASE", "direct"),
            ("PASSPHRASE_FILE", file.path().to_str().unwrap()),
        ]))
        .unwrap();
        assert_eq!(config.passphrase.as_deref(), Some("direct"));
    }

    #[test]
    fn test_s3_requires_credentials_and_location() {
        assert!(Config::from_vars(&vars(&[("S3_BUCKET_NAME", "backups")])).is_err());
        assert!(Config::from_vars(&vars(&[
            ("S3_BUCKET_NAME", "backups"),
            ("S3_REGION_CODE", "eu-central-1"),
            ("S3_ENDPOINT_URL", "https://minio.local"),
            ("AWS_ACCESS_KEY_ID", "id"),
            ("AWS_SECRET_ACCESS_KEY", "key"),
        ]))
        .is_err());

        let config = Config::from_vars(&vars(&[
            ("S3_BUCKET_NAME", "backups"),
            ("S3_REGION_CODE", "eu-central-1"),
            ("AWS_ACCESS_KEY_ID", "id"),
            ("AWS_SECRET_ACCESS_KEY", "key"),
            ("S3_STORAGE_CLASS", "STANDARD_IA"),
        ]))
        .unwrap();
        let s3 = config.s3.unwrap();
        assert_eq!(s3.bucket, "backups");
        assert_eq!(s3.storage_class, S3StorageClass::StandardIa);
    }

    #[test]
    fn test_engine_flags() {
        let config = Config::from_vars(&vars(&[])).unwrap();
        assert_eq!(config.engine_flags(), vec!["--no-encryption"]);
        assert_eq!(config.engine_target("db_data"), "file:///target/db_data");

        let config = Config::from_vars(&vars(&[
            ("S3_BUCKET_NAME", "backups"),
            ("S3_ENDPOINT_URL", "https://minio.local"),
            ("AWS_ACCESS_KEY_ID", "id"),
            ("AWS_SECRET_ACCESS_KEY", "key"),
            ("S3_STORAGE_CLASS", "STANDARD_IA"),
            ("PASSPHRASE", "secret"),
        ]))
        .unwrap();
        assert_eq!(
            config.engine_flags(),
            vec!["--s3-endpoint-url", "https://minio.local", "--s3-use-ia"]
        );
        assert_eq!(config.engine_target("db_data"), "s3:///backups/db_data");
        let env = config.engine_env();
        assert!(env.iter().any(|(k, v)| k == "PASSPHRASE" && v == "secret"));
    }
}
