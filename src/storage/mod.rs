//! Storage abstraction layer
//!
//! Provides one persistor contract over the local filesystem, S3 and GCS,
//! plus a migration wrapper that reads through to an old backend while
//! writing to a new one.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;

use crate::config::{BackendKind, StorageSection};
use crate::stream::ObjectStream;
use crate::Result;

pub mod clients;
pub mod fs;
pub mod gcs;
pub mod migration;
pub mod s3;

/// Options for `send_file` / `send_stream`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Expected hex MD5 of the uploaded bytes
    pub source_md5: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_length: Option<u64>,
    /// Create only: fail with `Error::Write` if the key already holds an object
    pub if_none_match: bool,
}

/// Options for `get_object_stream`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// First byte, inclusive
    pub start: Option<u64>,
    /// Last byte, inclusive
    pub end: Option<u64>,
    pub auto_gunzip: bool,
}

impl GetOptions {
    pub fn range(start: u64, end: u64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            auto_gunzip: false,
        }
    }

    /// Read from `start` to the end of the object.
    pub fn from_offset(start: u64) -> Self {
        Self {
            start: Some(start),
            ..Self::default()
        }
    }

    /// `(start, end)` when both bounds are present.
    pub fn byte_range(&self) -> Option<(u64, u64)> {
        self.start.zip(self.end)
    }

    pub fn is_ranged(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    /// HTTP `Range` header value; a missing start reads from byte 0 and a
    /// missing end reads to the end of the object.
    pub fn range_header(&self) -> Option<String> {
        match (self.start, self.end) {
            (None, None) => None,
            (start, Some(end)) => Some(format!("bytes={}-{}", start.unwrap_or(0), end)),
            (Some(start), None) => Some(format!("bytes={}-", start)),
        }
    }
}

/// Key and size of one object in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub key: String,
    pub size: u64,
}

/// Persistor contract shared by every backend
///
/// Locations are pre-provisioned containers (a folder or a bucket); keys
/// use `/` as separator. Missing objects surface as `Error::NotFound`,
/// other failures as `Error::Read` or `Error::Write` depending on the path.
#[async_trait]
pub trait Persistor: Send + Sync {
    /// Upload a local file
    async fn send_file(
        &self,
        location: &str,
        key: &str,
        local_path: &Path,
        opts: SendOptions,
    ) -> Result<()>;

    /// Upload an arbitrary byte stream
    async fn send_stream(
        &self,
        location: &str,
        key: &str,
        stream: ObjectStream,
        opts: SendOptions,
    ) -> Result<()>;

    /// Open a stream over the object's bytes; fails before returning if the object is missing
    async fn get_object_stream(
        &self,
        location: &str,
        key: &str,
        opts: GetOptions,
    ) -> Result<ObjectStream>;

    async fn get_object_size(&self, location: &str, key: &str) -> Result<u64>;

    /// Hex MD5 of the stored bytes
    async fn get_object_md5_hash(&self, location: &str, key: &str) -> Result<String>;

    /// Direct-access URL, `None` when the backend has no such thing
    async fn get_redirect_url(&self, location: &str, key: &str) -> Result<Option<String>>;

    async fn copy_object(&self, location: &str, source_key: &str, dest_key: &str) -> Result<()>;

    /// Delete one object; a missing object is not an error
    async fn delete_object(&self, location: &str, key: &str) -> Result<()>;

    /// Delete every object below `key`
    async fn delete_directory(&self, location: &str, key: &str) -> Result<()>;

    /// Total bytes stored below `key`
    async fn directory_size(&self, location: &str, key: &str) -> Result<u64>;

    /// Never fails with `NotFound`
    async fn check_if_object_exists(&self, location: &str, key: &str) -> Result<bool>;

    async fn list_directory_keys(&self, location: &str, key: &str) -> Result<Vec<String>>;

    async fn list_directory_stats(&self, location: &str, key: &str) -> Result<Vec<ObjectStat>>;
}

/// Empty upload buffer sized from the caller's length hint, never past `cap`.
pub(crate) fn upload_buffer(content_length: Option<u64>, cap: u64) -> BytesMut {
    let hint = content_length.unwrap_or(0).min(cap);
    BytesMut::with_capacity(usize::try_from(hint).unwrap_or(0))
}

/// `key` with exactly one trailing `/`, for prefix listings.
pub(crate) fn directory_prefix(key: &str) -> String {
    format!("{}/", key.trim_end_matches('/'))
}

/// The concrete persistor chosen at start-up.
pub enum Backend {
    Filesystem(fs::FsPersistor),
    S3(s3::S3Persistor),
    Gcs(gcs::GcsPersistor),
    Migration(migration::MigrationPersistor),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Filesystem(_) => "filesystem",
            Backend::S3(_) => "s3",
            Backend::Gcs(_) => "gcs",
            Backend::Migration(_) => "migration",
        }
    }

    fn inner(&self) -> &dyn Persistor {
        match self {
            Backend::Filesystem(p) => p,
            Backend::S3(p) => p,
            Backend::Gcs(p) => p,
            Backend::Migration(p) => p,
        }
    }
}

#[async_trait]
impl Persistor for Backend {
    async fn send_file(
        &self,
        location: &str,
        key: &str,
        local_path: &Path,
        opts: SendOptions,
    ) -> Result<()> {
        self.inner().send_file(location, key, local_path, opts).await
    }

    async fn send_stream(
        &self,
        location: &str,
        key: &str,
        stream: ObjectStream,
        opts: SendOptions,
    ) -> Result<()> {
        self.inner().send_stream(location, key, stream, opts).await
    }

    async fn get_object_stream(
        &self,
        location: &str,
        key: &str,
        opts: GetOptions,
    ) -> Result<ObjectStream> {
        self.inner().get_object_stream(location, key, opts).await
    }

    async fn get_object_size(&self, location: &str, key: &str) -> Result<u64> {
        self.inner().get_object_size(location, key).await
    }

    async fn get_object_md5_hash(&self, location: &str, key: &str) -> Result<String> {
        self.inner().get_object_md5_hash(location, key).await
    }

    async fn get_redirect_url(&self, location: &str, key: &str) -> Result<Option<String>> {
        self.inner().get_redirect_url(location, key).await
    }

    async fn copy_object(&self, location: &str, source_key: &str, dest_key: &str) -> Result<()> {
        self.inner().copy_object(location, source_key, dest_key).await
    }

    async fn delete_object(&self, location: &str, key: &str) -> Result<()> {
        self.inner().delete_object(location, key).await
    }

    async fn delete_directory(&self, location: &str, key: &str) -> Result<()> {
        self.inner().delete_directory(location, key).await
    }

    async fn directory_size(&self, location: &str, key: &str) -> Result<u64> {
        self.inner().directory_size(location, key).await
    }

    async fn check_if_object_exists(&self, location: &str, key: &str) -> Result<bool> {
        self.inner().check_if_object_exists(location, key).await
    }

    async fn list_directory_keys(&self, location: &str, key: &str) -> Result<Vec<String>> {
        self.inner().list_directory_keys(location, key).await
    }

    async fn list_directory_stats(&self, location: &str, key: &str) -> Result<Vec<ObjectStat>> {
        self.inner().list_directory_stats(location, key).await
    }
}

/// Create the configured persistor
///
/// With a migration section, `storage.backend` becomes the primary and
/// `migration.fallback_backend` the fallback.
pub async fn create_persistor(config: &StorageSection) -> anyhow::Result<Backend> {
    config.validate()?;

    let primary = create_single(config, config.backend).await?;

    let Some(migration) = &config.migration else {
        tracing::info!(backend = primary.name(), "persistor initialised");
        return Ok(primary);
    };

    let fallback = create_single(config, migration.fallback_backend).await?;
    tracing::info!(
        primary = primary.name(),
        fallback = fallback.name(),
        copy_on_miss = migration.copy_on_miss,
        "migration persistor initialised"
    );

    let settings = migration::MigrationSettings {
        buckets: migration.buckets.clone(),
        copy_on_miss: migration.copy_on_miss,
    };
    Ok(Backend::Migration(migration::MigrationPersistor::new(
        Arc::new(primary),
        Arc::new(fallback),
        settings,
    )))
}

async fn create_single(config: &StorageSection, kind: BackendKind) -> anyhow::Result<Backend> {
    let backend = match kind {
        BackendKind::Filesystem => {
            let section = config.filesystem.clone().unwrap_or_default();
            Backend::Filesystem(fs::FsPersistor::new(fs::FsSettings::from(&section))?)
        }
        BackendKind::S3 => {
            let section = config.s3.clone().unwrap_or_default();
            Backend::S3(s3::S3Persistor::new(section))
        }
        BackendKind::Gcs => {
            let section = config.gcs.clone().unwrap_or_default();
            Backend::Gcs(gcs::GcsPersistor::new(section)?)
        }
    };
    Ok(backend)
}
