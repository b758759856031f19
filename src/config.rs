use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

const DEFAULT_PART_SIZE: u64 = 100 * 1024 * 1024; // 100 MiB
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024; // S3 minimum for all but the last part
const DEFAULT_SIGNED_URL_EXPIRY_SECS: u64 = 60;
const DEFAULT_DELETE_CONCURRENCY: usize = 50;

/// Top-level configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    pub fn load() -> Result<Self> {
        let config_path =
            env::var("PERSISTOR_CONFIG").unwrap_or_else(|_| "persistor.toml".to_string());

        let mut builder = config::Config::builder();

        if Path::new(&config_path).exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(&config_path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PERSISTOR")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build()?;
        let mut config: Self = settings.try_deserialize()?;

        if config.logging.level.trim().is_empty() {
            config.logging.level = "info".to_string();
        }

        config.validate().context("invalid storage configuration")?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.storage.validate()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageSection {
    pub backend: BackendKind,
    pub filesystem: Option<FilesystemSection>,
    pub s3: Option<S3Section>,
    pub gcs: Option<GcsSection>,
    pub migration: Option<MigrationSection>,
}

impl StorageSection {
    pub fn validate(&self) -> Result<()> {
        self.validate_backend(self.backend)?;

        if let Some(migration) = &self.migration {
            if migration.fallback_backend == self.backend {
                bail!(
                    "storage.migration.fallback_backend must differ from storage.backend ({:?})",
                    self.backend
                );
            }
            self.validate_backend(migration.fallback_backend)?;
        }

        Ok(())
    }

    fn validate_backend(&self, kind: BackendKind) -> Result<()> {
        match kind {
            BackendKind::Filesystem => {
                let fs = self.filesystem.clone().unwrap_or_default();
                if fs.upload_folder.trim().is_empty() {
                    bail!("storage.filesystem.upload_folder must be specified");
                }
            }
            BackendKind::S3 => {
                let s3 = self
                    .s3
                    .as_ref()
                    .context("storage.s3 configuration required when backend is 's3'")?;
                if s3.key.is_some() != s3.secret.is_some() {
                    bail!("storage.s3.key and storage.s3.secret must be set together");
                }
                if s3.part_size < MIN_PART_SIZE {
                    bail!(
                        "storage.s3.part_size must be at least {} bytes",
                        MIN_PART_SIZE
                    );
                }
            }
            BackendKind::Gcs => {
                let gcs = self
                    .gcs
                    .as_ref()
                    .context("storage.gcs configuration required when backend is 'gcs'")?;
                if gcs.delete_concurrency == 0 {
                    bail!("storage.gcs.delete_concurrency must be greater than zero");
                }
                if gcs.hmac_access_id.is_some() != gcs.hmac_secret.is_some() {
                    bail!("storage.gcs.hmac_access_id and storage.gcs.hmac_secret must be set together");
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Filesystem,
    S3,
    Gcs,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesystemSection {
    /// Temp root for uploads awaiting verification
    pub upload_folder: String,
    /// Keep `/` in keys as real directories instead of flattening to `_`
    pub use_subdirectories: bool,
}

impl Default for FilesystemSection {
    fn default() -> Self {
        Self {
            upload_folder: env::temp_dir().join("persistor-uploads").display().to_string(),
            use_subdirectories: false,
        }
    }
}

/// Credentials that replace the defaults for one bucket.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BucketCredentials {
    pub auth_key: String,
    pub auth_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3Section {
    pub key: Option<String>,
    pub secret: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub path_style: bool,
    pub max_retries: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub operation_timeout_ms: Option<u64>,
    pub part_size: u64,
    pub disable_multipart_upload: bool,
    pub signed_url_expiry_secs: u64,
    pub bucket_creds: HashMap<String, BucketCredentials>,
    pub storage_class: HashMap<String, String>,
}

impl Default for S3Section {
    fn default() -> Self {
        Self {
            key: None,
            secret: None,
            region: None,
            endpoint: None,
            path_style: false,
            max_retries: None,
            connect_timeout_ms: None,
            operation_timeout_ms: None,
            part_size: DEFAULT_PART_SIZE,
            disable_multipart_upload: false,
            signed_url_expiry_secs: DEFAULT_SIGNED_URL_EXPIRY_SECS,
            bucket_creds: HashMap::new(),
            storage_class: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GcsBucketCredentials {
    pub access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcsSection {
    pub api_endpoint: String,
    /// Static OAuth bearer token; takes precedence over the metadata server
    pub access_token: Option<String>,
    pub use_metadata_server: bool,
    pub hmac_access_id: Option<String>,
    pub hmac_secret: Option<String>,
    pub unsigned_urls: bool,
    pub signed_url_expiry_secs: u64,
    pub delete_concurrency: usize,
    pub request_timeout_ms: Option<u64>,
    pub bucket_creds: HashMap<String, GcsBucketCredentials>,
}

impl Default for GcsSection {
    fn default() -> Self {
        Self {
            api_endpoint: "https://storage.googleapis.com".to_string(),
            access_token: None,
            use_metadata_server: false,
            hmac_access_id: None,
            hmac_secret: None,
            unsigned_urls: false,
            signed_url_expiry_secs: DEFAULT_SIGNED_URL_EXPIRY_SECS,
            delete_concurrency: DEFAULT_DELETE_CONCURRENCY,
            request_timeout_ms: None,
            bucket_creds: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MigrationSection {
    pub fallback_backend: BackendKind,
    /// Primary location -> fallback location
    pub buckets: HashMap<String, String>,
    pub copy_on_miss: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}
