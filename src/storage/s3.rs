//! S3 storage backend
//!
//! [`S3Persistor`] holds the persistor semantics (integrity, pagination,
//! error mapping) and talks to S3 through the narrow [`S3Api`] transport.
//! [`AwsS3Client`] implements that transport with `aws-sdk-s3`; one client
//! is built per bucket and cached for the life of the persistor.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier, StorageClass,
};
use aws_sdk_s3::Client;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::S3Section;
use crate::error::{BackendError, BackendErrorKind, Error, ErrorContext, ErrorKind};
use crate::stream::{self, MeteredStream, ObjectStream};
use crate::Result;

use super::clients::ClientCache;
use super::{directory_prefix, upload_buffer, GetOptions, ObjectStat, Persistor, SendOptions};

/// S3 caps DeleteObjects at 1000 keys per call.
const MAX_DELETE_BATCH: usize = 1000;

/// Customer-provided encryption key (SSE-C), sent with every request that
/// reads or writes the object it protects.
#[derive(Clone, PartialEq, Eq)]
pub struct SseCustomerKey {
    key: String,
    key_md5: String,
}

impl SseCustomerKey {
    pub const ALGORITHM: &'static str = "AES256";

    /// `raw_key` is the 256-bit key itself, not an encoding of it.
    pub fn new(raw_key: &[u8]) -> Self {
        Self {
            key: BASE64.encode(raw_key),
            key_md5: BASE64.encode(md5::compute(raw_key).0),
        }
    }

    /// Base64 key, as sent in `x-amz-server-side-encryption-customer-key`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Base64 MD5 of the raw key.
    pub fn key_md5(&self) -> &str {
        &self.key_md5
    }
}

// keeps the key out of logs and error contexts
impl fmt::Debug for SseCustomerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseCustomerKey")
            .field("key_md5", &self.key_md5)
            .finish_non_exhaustive()
    }
}

/// `(algorithm, key, key_md5)` request fields for an optional SSE-C key.
fn sse_fields(key: Option<&SseCustomerKey>) -> (Option<String>, Option<String>, Option<String>) {
    match key {
        Some(key) => (
            Some(SseCustomerKey::ALGORITHM.to_string()),
            Some(key.key.clone()),
            Some(key.key_md5.clone()),
        ),
        None => (None, None, None),
    }
}

/// S3-only request options, for the `*_with` methods of [`S3Persistor`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Options {
    /// SSE-C key of the object being read or written
    pub sse_customer_key: Option<SseCustomerKey>,
    /// SSE-C key of the source object of a copy
    pub copy_source_sse_customer_key: Option<SseCustomerKey>,
}

/// Object body plus the headers the persistor cares about.
pub struct S3Object {
    pub body: ObjectStream,
    pub content_encoding: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Head {
    pub content_length: u64,
    pub e_tag: Option<String>,
    pub storage_class: Option<String>,
}

/// One page of a ListObjectsV2 response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub contents: Vec<ObjectStat>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// Metadata sent with single-part and multipart uploads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadMetadata {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub storage_class: Option<String>,
    /// Sent as `If-None-Match: *` so an existing key is never overwritten
    pub if_none_match: bool,
    pub sse_customer_key: Option<SseCustomerKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: Option<String>,
}

/// The S3 operations the persistor needs.
#[async_trait]
pub trait S3Api: Send + Sync {
    /// Once `cancel` fires the request, or the body still being read, is abandoned.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<String>,
        sse: Option<&SseCustomerKey>,
        cancel: &CancellationToken,
    ) -> std::result::Result<S3Object, BackendError>;

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
        sse: Option<&SseCustomerKey>,
    ) -> std::result::Result<S3Head, BackendError>;

    /// `content_md5` is the base64 digest S3 checks the body against.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_md5: Option<String>,
        metadata: &UploadMetadata,
    ) -> std::result::Result<(), BackendError>;

    /// Returns the upload id.
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: &UploadMetadata,
    ) -> std::result::Result<String, BackendError>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
        metadata: &UploadMetadata,
    ) -> std::result::Result<UploadedPart, BackendError>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
        metadata: &UploadMetadata,
    ) -> std::result::Result<(), BackendError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> std::result::Result<(), BackendError>;

    async fn copy_object(
        &self,
        bucket: &str,
        source_key: &str,
        dest_key: &str,
        options: &S3Options,
    ) -> std::result::Result<(), BackendError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> std::result::Result<(), BackendError>;

    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> std::result::Result<(), BackendError>;

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> std::result::Result<ListPage, BackendError>;

    async fn presign_get_object(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> std::result::Result<String, BackendError>;
}

/// Access key pair used for a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Builds an [`S3Api`] for a credential set; `None` means the default provider chain.
#[async_trait]
pub trait S3Connector: Send + Sync {
    async fn connect(
        &self,
        credentials: Option<StaticCredentials>,
    ) -> std::result::Result<Arc<dyn S3Api>, BackendError>;
}

/// Connector producing `aws-sdk-s3` clients from the S3 section.
pub struct AwsConnector {
    settings: S3Section,
}

impl AwsConnector {
    pub fn new(settings: S3Section) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl S3Connector for AwsConnector {
    async fn connect(
        &self,
        credentials: Option<StaticCredentials>,
    ) -> std::result::Result<Arc<dyn S3Api>, BackendError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &self.settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(credentials) = credentials {
            loader = loader.credentials_provider(Credentials::new(
                credentials.access_key_id,
                credentials.secret_access_key,
                None,
                None,
                "persistor",
            ));
        }
        if let Some(max_retries) = self.settings.max_retries {
            loader = loader.retry_config(RetryConfig::standard().with_max_attempts(max_retries + 1));
        }

        let mut timeouts = TimeoutConfig::builder();
        if let Some(ms) = self.settings.connect_timeout_ms {
            timeouts = timeouts.connect_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.settings.operation_timeout_ms {
            timeouts = timeouts.operation_timeout(Duration::from_millis(ms));
        }
        loader = loader.timeout_config(timeouts.build());

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &self.settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        // path-style access is needed by most S3-compatible servers
        builder = builder.force_path_style(self.settings.path_style);

        Ok(Arc::new(AwsS3Client {
            client: Client::from_conf(builder.build()),
        }))
    }
}

/// [`S3Api`] over the AWS SDK.
pub struct AwsS3Client {
    client: Client,
}

fn classify<E>(err: SdkError<E, HttpResponse>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|response| response.status().as_u16());
    let kind = match (err.code(), status) {
        (Some("NoSuchKey" | "NotFound"), _) | (_, Some(404)) => BackendErrorKind::NotFound,
        (Some("AccessDenied"), _) | (_, Some(403)) => BackendErrorKind::AccessDenied,
        _ => BackendErrorKind::Other,
    };
    BackendError::new(kind, err)
}

#[async_trait]
impl S3Api for AwsS3Client {
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<String>,
        sse: Option<&SseCustomerKey>,
        cancel: &CancellationToken,
    ) -> std::result::Result<S3Object, BackendError> {
        let (algorithm, sse_key, sse_key_md5) = sse_fields(sse);
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_range(range)
            .set_sse_customer_algorithm(algorithm)
            .set_sse_customer_key(sse_key)
            .set_sse_customer_key_md5(sse_key_md5)
            .send();

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::other("S3 request cancelled")),
            output = request => output.map_err(classify)?,
        };

        let content_encoding = output.content_encoding().map(str::to_owned);
        let body = ReaderStream::new(output.body.into_async_read())
            .take_until(cancel.clone().cancelled_owned())
            .boxed();
        Ok(S3Object {
            body,
            content_encoding,
        })
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
        sse: Option<&SseCustomerKey>,
    ) -> std::result::Result<S3Head, BackendError> {
        let (algorithm, sse_key, sse_key_md5) = sse_fields(sse);
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .set_sse_customer_algorithm(algorithm)
            .set_sse_customer_key(sse_key)
            .set_sse_customer_key_md5(sse_key_md5)
            .send()
            .await
            .map_err(classify)?;

        Ok(S3Head {
            content_length: output.content_length().unwrap_or(0).max(0) as u64,
            e_tag: output.e_tag().map(str::to_owned),
            storage_class: output.storage_class().map(|class| class.as_str().to_owned()),
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_md5: Option<String>,
        metadata: &UploadMetadata,
    ) -> std::result::Result<(), BackendError> {
        let content_length = body.len() as i64;
        let (algorithm, sse_key, sse_key_md5) = sse_fields(metadata.sse_customer_key.as_ref());
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(content_length)
            .body(ByteStream::from(body))
            .set_content_md5(content_md5)
            .set_content_type(metadata.content_type.clone())
            .set_content_encoding(metadata.content_encoding.clone())
            .set_storage_class(metadata.storage_class.as_deref().map(StorageClass::from))
            .set_if_none_match(metadata.if_none_match.then(|| "*".to_string()))
            .set_sse_customer_algorithm(algorithm)
            .set_sse_customer_key(sse_key)
            .set_sse_customer_key_md5(sse_key_md5)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: &UploadMetadata,
    ) -> std::result::Result<String, BackendError> {
        let (algorithm, sse_key, sse_key_md5) = sse_fields(metadata.sse_customer_key.as_ref());
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_content_type(metadata.content_type.clone())
            .set_content_encoding(metadata.content_encoding.clone())
            .set_storage_class(metadata.storage_class.as_deref().map(StorageClass::from))
            .set_sse_customer_algorithm(algorithm)
            .set_sse_customer_key(sse_key)
            .set_sse_customer_key_md5(sse_key_md5)
            .send()
            .await
            .map_err(classify)?;

        output
            .upload_id()
            .map(str::to_owned)
            .ok_or_else(|| BackendError::other("S3 did not return an upload id"))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
        metadata: &UploadMetadata,
    ) -> std::result::Result<UploadedPart, BackendError> {
        let (algorithm, sse_key, sse_key_md5) = sse_fields(metadata.sse_customer_key.as_ref());
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .set_sse_customer_algorithm(algorithm)
            .set_sse_customer_key(sse_key)
            .set_sse_customer_key_md5(sse_key_md5)
            .send()
            .await
            .map_err(classify)?;

        Ok(UploadedPart {
            part_number,
            e_tag: output.e_tag().map(str::to_owned),
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
        metadata: &UploadMetadata,
    ) -> std::result::Result<(), BackendError> {
        let parts = parts
            .into_iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .set_e_tag(part.e_tag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .set_if_none_match(metadata.if_none_match.then(|| "*".to_string()))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> std::result::Result<(), BackendError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn copy_object(
        &self,
        bucket: &str,
        source_key: &str,
        dest_key: &str,
        options: &S3Options,
    ) -> std::result::Result<(), BackendError> {
        let (src_algorithm, src_key, src_key_md5) =
            sse_fields(options.copy_source_sse_customer_key.as_ref());
        let (algorithm, sse_key, sse_key_md5) = sse_fields(options.sse_customer_key.as_ref());
        self.client
            .copy_object()
            .bucket(bucket)
            .key(dest_key)
            .copy_source(format!("{}/{}", bucket, source_key))
            .set_copy_source_sse_customer_algorithm(src_algorithm)
            .set_copy_source_sse_customer_key(src_key)
            .set_copy_source_sse_customer_key_md5(src_key_md5)
            .set_sse_customer_algorithm(algorithm)
            .set_sse_customer_key(sse_key)
            .set_sse_customer_key_md5(sse_key_md5)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> std::result::Result<(), BackendError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> std::result::Result<(), BackendError> {
        let objects = keys
            .into_iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(BackendError::other)?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(BackendError::other)?;

        let output = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(classify)?;

        if let Some(failed) = output.errors().first() {
            return Err(BackendError::other(format!(
                "failed to delete {} ({}) and {} other object(s)",
                failed.key().unwrap_or_default(),
                failed.code().unwrap_or("unknown error"),
                output.errors().len() - 1
            )));
        }
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> std::result::Result<ListPage, BackendError> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(classify)?;

        let contents = output
            .contents()
            .iter()
            .filter_map(|object| {
                object.key().map(|key| ObjectStat {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                })
            })
            .collect();

        Ok(ListPage {
            contents,
            is_truncated: output.is_truncated().unwrap_or(false),
            next_continuation_token: output.next_continuation_token().map(str::to_owned),
        })
    }

    async fn presign_get_object(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> std::result::Result<String, BackendError> {
        let config = PresigningConfig::expires_in(expires_in).map_err(BackendError::other)?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(classify)?;
        Ok(request.uri().to_string())
    }
}

/// S3 persistor
pub struct S3Persistor {
    settings: S3Section,
    connector: Arc<dyn S3Connector>,
    clients: ClientCache<String, dyn S3Api>,
}

impl S3Persistor {
    pub fn new(settings: S3Section) -> Self {
        let connector = Arc::new(AwsConnector::new(settings.clone()));
        Self::with_connector(settings, connector)
    }

    pub fn with_connector(settings: S3Section, connector: Arc<dyn S3Connector>) -> Self {
        Self {
            settings,
            connector,
            clients: ClientCache::new(),
        }
    }

    /// Per-bucket override first, then the configured key pair.
    fn credentials_for(&self, bucket: &str) -> Option<StaticCredentials> {
        if let Some(creds) = self.settings.bucket_creds.get(bucket) {
            return Some(StaticCredentials {
                access_key_id: creds.auth_key.clone(),
                secret_access_key: creds.auth_secret.clone(),
            });
        }
        match (&self.settings.key, &self.settings.secret) {
            (Some(key), Some(secret)) => Some(StaticCredentials {
                access_key_id: key.clone(),
                secret_access_key: secret.clone(),
            }),
            _ => None,
        }
    }

    async fn client_for_bucket(
        &self,
        bucket: &str,
        kind: ErrorKind,
    ) -> Result<Arc<dyn S3Api>> {
        let credentials = self.credentials_for(bucket);
        self.clients
            .get_or_try_init(bucket.to_string(), || self.connector.connect(credentials))
            .await
            .map_err(|err| {
                Error::new(kind, "failed to create S3 client", ErrorContext::location(bucket))
                    .caused_by(err)
            })
    }

    async fn head(&self, bucket: &str, key: &str, sse: Option<&SseCustomerKey>) -> Result<S3Head> {
        let client = self.client_for_bucket(bucket, ErrorKind::Read).await?;
        client
            .head_object(bucket, key, sse)
            .await
            .map_err(|err| err.into_read_error("error getting size of s3 object", ErrorContext::new(bucket, key)))
    }

    /// Every object below `prefix`, across all pages.
    async fn list_all(&self, bucket: &str, key: &str, kind: ErrorKind) -> Result<Vec<ObjectStat>> {
        let client = self.client_for_bucket(bucket, kind).await?;
        let prefix = directory_prefix(key);
        let mut stats = Vec::new();
        let mut token = None;
        loop {
            let page = client
                .list_objects(bucket, &prefix, token.take())
                .await
                .map_err(|err| {
                    Error::new(kind, "failed to list objects in S3", ErrorContext::new(bucket, key))
                        .caused_by(err)
                })?;
            stats.extend(page.contents);
            match page.next_continuation_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }
        Ok(stats)
    }

    async fn upload_multipart<S>(
        &self,
        client: &dyn S3Api,
        bucket: &str,
        key: &str,
        metadata: &UploadMetadata,
        mut buffer: BytesMut,
        source: &mut S,
    ) -> Result<()>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
    {
        let context = ErrorContext::new(bucket, key).with_info("if_none_match", metadata.if_none_match);
        let part_size = self.settings.part_size as usize;

        let upload_id = client
            .create_multipart_upload(bucket, key, metadata)
            .await
            .map_err(|err| err.into_write_error("upload to S3 failed", context.clone()))?;

        let uploaded = async {
            let mut parts = Vec::new();
            let mut ended = false;
            loop {
                if !ended {
                    ended = fill_buffer(source, &mut buffer, Some(part_size))
                        .await
                        .map_err(|err| Error::wrap(ErrorKind::Write, "upload to S3 failed", err, context.clone()))?;
                }
                if buffer.is_empty() {
                    break;
                }
                let take = buffer.len().min(part_size);
                let body = buffer.split_to(take).freeze();
                let part_number = parts.len() as i32 + 1;
                let part = client
                    .upload_part(bucket, key, &upload_id, part_number, body, metadata)
                    .await
                    .map_err(|err| err.into_write_error("upload to S3 failed", context.clone()))?;
                parts.push(part);
                if ended && buffer.is_empty() {
                    break;
                }
            }
            tracing::debug!(bucket, key, parts = parts.len(), "completing multipart upload");
            client
                .complete_multipart_upload(bucket, key, &upload_id, parts, metadata)
                .await
                .map_err(|err| err.into_write_error("upload to S3 failed", context.clone()))
        }
        .await;

        if uploaded.is_err() {
            if let Err(err) = client.abort_multipart_upload(bucket, key, &upload_id).await {
                tracing::warn!(bucket, key, upload_id = %upload_id, error = %err, "failed to abort multipart upload");
            }
        }
        uploaded
    }
}

impl S3Persistor {
    /// `send_stream` with SSE-C.
    #[instrument(skip(self, stream, opts, options))]
    pub async fn send_stream_with(
        &self,
        location: &str,
        key: &str,
        stream: ObjectStream,
        opts: SendOptions,
        options: &S3Options,
    ) -> Result<()> {
        let context = ErrorContext::new(location, key).with_info("if_none_match", opts.if_none_match);
        let client = self.client_for_bucket(location, ErrorKind::Write).await?;
        let metadata = UploadMetadata {
            content_type: opts.content_type.clone(),
            content_encoding: opts.content_encoding.clone(),
            storage_class: self.settings.storage_class.get(location).cloned(),
            if_none_match: opts.if_none_match,
            sse_customer_key: options.sse_customer_key.clone(),
        };

        let (mut metered, handle) = MeteredStream::new(stream, "s3.egress");
        let mut buffer = upload_buffer(opts.content_length, self.settings.part_size);
        let limit = (!self.settings.disable_multipart_upload).then_some(self.settings.part_size as usize);
        let ended = fill_buffer(&mut metered, &mut buffer, limit)
            .await
            .map_err(|err| Error::wrap(ErrorKind::Write, "upload to S3 failed", err, context.clone()))?;

        if !ended {
            if opts.source_md5.is_some() {
                return Err(Error::write(
                    "sourceMd5 option is not supported, S3 provides its own integrity protection",
                    context,
                ));
            }
            return self
                .upload_multipart(client.as_ref(), location, key, &metadata, buffer, &mut metered)
                .await;
        }

        let actual = handle.get().map(|digest| digest.md5).unwrap_or_default();
        let expected = opts.source_md5.unwrap_or_else(|| actual.clone());
        if expected != actual {
            return Err(Error::write(
                "md5 hash mismatch",
                context.with_info("expected", expected).with_info("actual", actual),
            ));
        }
        let content_md5 = stream::hex_to_base64(&expected);

        client
            .put_object(location, key, buffer.freeze(), content_md5, &metadata)
            .await
            .map_err(|err| err.into_write_error("upload to S3 failed", context))
    }

    /// `get_object_stream` with SSE-C.
    #[instrument(skip(self, options))]
    pub async fn get_object_stream_with(
        &self,
        location: &str,
        key: &str,
        opts: GetOptions,
        options: &S3Options,
    ) -> Result<ObjectStream> {
        let mut context = ErrorContext::new(location, key);
        let range = opts.range_header();
        if let Some(range) = &range {
            context = context.with_info("range", range);
        }

        let client = self.client_for_bucket(location, ErrorKind::Read).await?;
        let cancel = CancellationToken::new();
        let object = client
            .get_object(location, key, range, options.sse_customer_key.as_ref(), &cancel)
            .await
            .map_err(|err| err.into_read_error("error reading file from S3", context))?;

        let (metered, _) = MeteredStream::new(object.body, "s3.ingress");
        let body = stream::abort_on_drop(metered.boxed(), cancel);
        if opts.auto_gunzip && object.content_encoding.as_deref() == Some("gzip") {
            return Ok(stream::gunzip(body));
        }
        Ok(body)
    }

    pub async fn get_object_size_with(&self, location: &str, key: &str, options: &S3Options) -> Result<u64> {
        let head = self.head(location, key, options.sse_customer_key.as_ref()).await?;
        Ok(head.content_length)
    }

    /// Storage class reported by S3; `None` means the bucket default.
    pub async fn get_object_storage_class(
        &self,
        location: &str,
        key: &str,
        options: &S3Options,
    ) -> Result<Option<String>> {
        let head = self.head(location, key, options.sse_customer_key.as_ref()).await?;
        Ok(head.storage_class)
    }

    pub async fn get_object_md5_hash_with(
        &self,
        location: &str,
        key: &str,
        options: &S3Options,
    ) -> Result<String> {
        let head = self.head(location, key, options.sse_customer_key.as_ref()).await?;
        let etag: String = head
            .e_tag
            .unwrap_or_default()
            .chars()
            .filter(|c| *c != '"' && *c != ' ')
            .collect();
        if stream::is_md5_hex(&etag) {
            return Ok(etag);
        }

        // multipart and SSE-KMS etags are not plain md5s
        tracing::debug!(bucket = location, key, "etag is not an md5 hash, downloading object");
        let body = self
            .get_object_stream_with(location, key, GetOptions::default(), options)
            .await?;
        stream::calculate_stream_md5(body).await.map_err(|err| {
            Error::wrap(
                ErrorKind::Read,
                "error getting hash of s3 object",
                err,
                ErrorContext::new(location, key),
            )
        })
    }

    /// `copy_object` with SSE-C for the source and the destination.
    pub async fn copy_object_with(
        &self,
        location: &str,
        source_key: &str,
        dest_key: &str,
        options: &S3Options,
    ) -> Result<()> {
        let client = self.client_for_bucket(location, ErrorKind::Write).await?;
        client
            .copy_object(location, source_key, dest_key, options)
            .await
            .map_err(|err| {
                err.into_write_error(
                    "failed to copy file in S3",
                    ErrorContext::new(location, source_key).with_info("dest_key", dest_key),
                )
            })
    }

    pub async fn check_if_object_exists_with(
        &self,
        location: &str,
        key: &str,
        options: &S3Options,
    ) -> Result<bool> {
        match self.head(location, key, options.sse_customer_key.as_ref()).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

/// Read from `source` into `buffer` until the stream ends (returns `true`)
/// or the buffer grows past `limit` (returns `false`).
async fn fill_buffer<S>(source: &mut S, buffer: &mut BytesMut, limit: Option<usize>) -> std::io::Result<bool>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    loop {
        if limit.is_some_and(|limit| buffer.len() > limit) {
            return Ok(false);
        }
        match source.next().await {
            Some(chunk) => buffer.extend_from_slice(&chunk?),
            None => return Ok(true),
        }
    }
}

#[async_trait]
impl Persistor for S3Persistor {
    async fn send_file(
        &self,
        location: &str,
        key: &str,
        local_path: &Path,
        opts: SendOptions,
    ) -> Result<()> {
        let file = tokio::fs::File::open(local_path).await.map_err(|err| {
            Error::wrap(
                ErrorKind::Write,
                "failed to open file for upload",
                err,
                ErrorContext::new(location, key).with_info("source", local_path.display()),
            )
        })?;
        self.send_stream(location, key, ReaderStream::new(file).boxed(), opts)
            .await
    }

    async fn send_stream(
        &self,
        location: &str,
        key: &str,
        stream: ObjectStream,
        opts: SendOptions,
    ) -> Result<()> {
        self.send_stream_with(location, key, stream, opts, &S3Options::default())
            .await
    }

    async fn get_object_stream(
        &self,
        location: &str,
        key: &str,
        opts: GetOptions,
    ) -> Result<ObjectStream> {
        self.get_object_stream_with(location, key, opts, &S3Options::default())
            .await
    }

    async fn get_object_size(&self, location: &str, key: &str) -> Result<u64> {
        self.get_object_size_with(location, key, &S3Options::default())
            .await
    }

    async fn get_object_md5_hash(&self, location: &str, key: &str) -> Result<String> {
        self.get_object_md5_hash_with(location, key, &S3Options::default())
            .await
    }

    async fn get_redirect_url(&self, location: &str, key: &str) -> Result<Option<String>> {
        let client = self.client_for_bucket(location, ErrorKind::Read).await?;
        let expires_in = Duration::from_secs(self.settings.signed_url_expiry_secs);
        let url = client
            .presign_get_object(location, key, expires_in)
            .await
            .map_err(|err| {
                Error::new(
                    ErrorKind::Read,
                    "error generating signed url for S3 file",
                    ErrorContext::new(location, key),
                )
                .caused_by(err)
            })?;
        Ok(Some(url))
    }

    async fn copy_object(&self, location: &str, source_key: &str, dest_key: &str) -> Result<()> {
        self.copy_object_with(location, source_key, dest_key, &S3Options::default())
            .await
    }

    async fn delete_object(&self, location: &str, key: &str) -> Result<()> {
        let client = self.client_for_bucket(location, ErrorKind::Write).await?;
        match client.delete_object(location, key).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind == BackendErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::new(
                ErrorKind::Write,
                "failed to delete file in S3",
                ErrorContext::new(location, key),
            )
            .caused_by(err)),
        }
    }

    #[instrument(skip(self))]
    async fn delete_directory(&self, location: &str, key: &str) -> Result<()> {
        let context = ErrorContext::new(location, key);
        if key.trim_matches('/').is_empty() {
            return Err(Error::write("refusing to delete a whole location", context));
        }

        let client = self.client_for_bucket(location, ErrorKind::Write).await?;
        let prefix = directory_prefix(key);
        let mut token = None;
        let mut deleted = 0usize;
        loop {
            let page = client
                .list_objects(location, &prefix, token.take())
                .await
                .map_err(|err| {
                    Error::new(ErrorKind::Write, "failed to list objects in S3", context.clone())
                        .caused_by(err)
                })?;

            let keys: Vec<String> = page.contents.into_iter().map(|stat| stat.key).collect();
            for batch in keys.chunks(MAX_DELETE_BATCH) {
                client
                    .delete_objects(location, batch.to_vec())
                    .await
                    .map_err(|err| {
                        Error::new(ErrorKind::Write, "failed to delete objects in S3", context.clone())
                            .caused_by(err)
                    })?;
                deleted += batch.len();
            }

            match page.next_continuation_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }
        tracing::debug!(bucket = location, key, deleted, "deleted directory");
        Ok(())
    }

    async fn directory_size(&self, location: &str, key: &str) -> Result<u64> {
        let stats = self.list_all(location, key, ErrorKind::Read).await?;
        Ok(stats.iter().map(|stat| stat.size).sum())
    }

    async fn check_if_object_exists(&self, location: &str, key: &str) -> Result<bool> {
        self.check_if_object_exists_with(location, key, &S3Options::default())
            .await
    }

    async fn list_directory_keys(&self, location: &str, key: &str) -> Result<Vec<String>> {
        let stats = self.list_all(location, key, ErrorKind::Read).await?;
        Ok(stats.into_iter().map(|stat| stat.key).collect())
    }

    async fn list_directory_stats(&self, location: &str, key: &str) -> Result<Vec<ObjectStat>> {
        self.list_all(location, key, ErrorKind::Read).await
    }
}
