/// Metadata store: durable volume-name -> JSON record mapping
///
/// Backed either by the local target directory or by an S3 bucket; the
/// backend is chosen once from configuration and fixed for the
/// process's lifetime. Records are `<volume>.metadata` files or keys.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::StorageClass;

use crate::core::config::{Config, S3Config, S3StorageClass};
use crate::utils::constants::METADATA_SUFFIX;

#[derive(Clone)]
pub enum MetadataStore {
    Local(LocalStore),
    S3(S3Store),
}

impl MetadataStore {
    pub async fn from_config(config: &Config) -> Result<Self> {
        Ok(match &config.s3 {
            Some(s3) => Self::S3(S3Store::new(s3).await),
            None => Self::Local(LocalStore {
                dir: config.target_dir.clone(),
            }),
        })
    }

    /// Persist a record, overwriting any previous one.
    pub async fn write(&self, volume: &str, data: &str) -> Result<()> {
        match self {
            Self::Local(store) => store.write(volume, data).await,
            Self::S3(store) => store.write(volume, data).await,
        }
    }

    /// Read back the exact stored text. A missing record is None, not
    /// an error; both the write identity check and restore discovery
    /// depend on the distinction.
    pub async fn read(&self, volume: &str) -> Result<Option<String>> {
        match self {
            Self::Local(store) => store.read(volume).await,
            Self::S3(store) => store.read(volume).await,
        }
    }

    /// All volume names that have a record.
    pub async fn list(&self) -> Result<Vec<String>> {
        match self {
            Self::Local(store) => store.list().await,
            Self::S3(store) => store.list().await,
        }
    }
}

#[derive(Clone)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    fn path(&self, volume: &str) -> PathBuf {
        self.dir.join(format!("{volume}{METADATA_SUFFIX}"))
    }

    async fn write(&self, volume: &str, data: &str) -> Result<()> {
        let path = self.path(volume);
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    async fn read(&self, volume: &str) -> Result<Option<String>> {
        let path = self.path(volume);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to list {}", self.dir.display()))?;
        let mut volumes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(volume) = name.to_str().and_then(|n| n.strip_suffix(METADATA_SUFFIX)) {
                volumes.push(volume.to_string());
            }
        }
        volumes.sort();
        Ok(volumes)
    }
}

#[derive(Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    storage_class: S3StorageClass,
}

impl S3Store {
    async fn new(config: &S3Config) -> Self {
        // Credentials are passed explicitly: they may have been read
        // from _FILE variables the SDK's environment provider never
        // sees.
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "volback-config",
        );
        let mut loader = aws_config::ConfigLoader::default().credentials_provider(credentials);
        loader = match (&config.region_code, &config.endpoint_url) {
            (Some(region), _) => loader.region(Region::new(region.clone())),
            (None, Some(endpoint)) => loader
                .region(Region::new("us-east-1"))
                .endpoint_url(endpoint.clone()),
            (None, None) => loader,
        };
        Self {
            client: aws_sdk_s3::Client::new(&loader.load().await),
            bucket: config.bucket.clone(),
            storage_class: config.storage_class,
        }
    }

    fn key(volume: &str) -> String {
        format!("{volume}{METADATA_SUFFIX}")
    }

    async fn write(&self, volume: &str, data: &str) -> Result<()> {
        // Don't overwrite unless the value changed: rewriting a
        // storage-class-bound object restarts its minimum-lifetime
        // billing period.
        if self.read(volume).await?.as_deref() == Some(data) {
            return Ok(());
        }
        let storage_class = match self.storage_class {
            S3StorageClass::Standard => StorageClass::Standard,
            S3StorageClass::StandardIa => StorageClass::StandardIa,
        };
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(Self::key(volume))
            .storage_class(storage_class)
            .body(ByteStream::from(data.as_bytes().to_vec()))
            .send()
            .await
            .with_context(|| format!("failed to write metadata for volume {volume}"))?;
        Ok(())
    }

    async fn read(&self, volume: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(Self::key(volume))
            .send()
            .await;
        match result {
            Ok(object) => {
                let bytes = object
                    .body
                    .collect()
                    .await
                    .with_context(|| format!("failed to read metadata for volume {volume}"))?
                    .into_bytes();
                Ok(Some(String::from_utf8(bytes.to_vec()).with_context(
                    || format!("metadata for volume {volume} is not valid UTF-8"),
                )?))
            }
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read metadata for volume {volume}")),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .delimiter("/")
            .send()
            .await
            .context("failed to list metadata bucket")?;
        // A truncated listing would silently lose volumes on restore;
        // fail loudly instead of paging past what we expect.
        if response.is_truncated() == Some(true) {
            bail!("metadata bucket listing was truncated");
        }
        let mut volumes: Vec<String> = response
            .contents()
            .iter()
            .filter_map(|object| object.key())
            .filter_map(|key| key.strip_suffix(METADATA_SUFFIX))
            .map(|volume| volume.to_string())
            .collect();
        volumes.sort();
        Ok(volumes)
    }
}

impl MetadataStore {
    /// Backend name for log messages.
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::S3(_) => "s3",
        }
    }
}
