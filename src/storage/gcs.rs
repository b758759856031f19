//! Google Cloud Storage backend
//!
//! Talks to the GCS JSON API over `reqwest`. As with S3, the persistor
//! logic sits on top of a small [`GcsApi`] transport so it can be tested
//! against an in-memory bucket.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use hmac::{Hmac, Mac};
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, RANGE};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::GcsSection;
use crate::error::{BackendError, BackendErrorKind, Error, ErrorContext, ErrorKind};
use crate::stream::{self, MeteredStream, ObjectStream};
use crate::Result;

use super::clients::ClientCache;
use super::{directory_prefix, upload_buffer, GetOptions, ObjectStat, Persistor, SendOptions};

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh metadata-server tokens this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const SIGNING_ALGORITHM: &str = "GOOG4-HMAC-SHA256";

/// Most an upload buffer reserves up front from a caller's length hint.
const MAX_UPLOAD_PREALLOCATION: u64 = 8 * 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;

pub struct GcsObject {
    pub body: ObjectStream,
    pub content_encoding: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcsObjectMeta {
    pub size: u64,
    /// Base64 MD5; absent for composite objects
    pub md5_hash: Option<String>,
    pub content_encoding: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcsListPage {
    pub items: Vec<ObjectStat>,
    pub next_page_token: Option<String>,
}

/// Object metadata sent along with an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcsUpload {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Base64 MD5 the server must verify
    pub md5_hash: Option<String>,
    /// Sent as `ifGenerationMatch=0` so an existing object is never replaced
    pub if_none_match: bool,
}

/// The GCS operations the persistor needs.
#[async_trait]
pub trait GcsApi: Send + Sync {
    /// `range` is an HTTP `Range` value. Once `cancel` fires the request,
    /// or the body still being read, is abandoned.
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        range: Option<String>,
        cancel: &CancellationToken,
    ) -> std::result::Result<GcsObject, BackendError>;

    async fn metadata(&self, bucket: &str, key: &str) -> std::result::Result<GcsObjectMeta, BackendError>;

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        upload: &GcsUpload,
    ) -> std::result::Result<(), BackendError>;

    async fn copy(&self, bucket: &str, source_key: &str, dest_key: &str) -> std::result::Result<(), BackendError>;

    async fn delete(&self, bucket: &str, key: &str) -> std::result::Result<(), BackendError>;

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        page_token: Option<String>,
    ) -> std::result::Result<GcsListPage, BackendError>;
}

/// Where bearer tokens come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// Unauthenticated, e.g. against a local emulator
    Anonymous,
    Static(String),
    MetadataServer,
}

/// Builds a [`GcsApi`] for a token source.
pub trait GcsConnector: Send + Sync {
    fn connect(&self, token: TokenSource) -> std::result::Result<Arc<dyn GcsApi>, BackendError>;
}

/// Connector producing [`GcsHttpClient`]s that share one connection pool.
pub struct HttpConnector {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpConnector {
    pub fn new(settings: &GcsSection) -> std::result::Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(ms) = settings.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        Ok(Self {
            http: builder.build()?,
            endpoint: settings.api_endpoint.clone(),
        })
    }
}

impl GcsConnector for HttpConnector {
    fn connect(&self, token: TokenSource) -> std::result::Result<Arc<dyn GcsApi>, BackendError> {
        let endpoint = Url::parse(&self.endpoint).map_err(BackendError::other)?;
        Ok(Arc::new(GcsHttpClient {
            http: self.http.clone(),
            endpoint,
            token,
            cached_token: Mutex::new(None),
        }))
    }
}

/// [`GcsApi`] over the JSON API.
pub struct GcsHttpClient {
    http: reqwest::Client,
    endpoint: Url,
    token: TokenSource,
    cached_token: Mutex<Option<(String, Instant)>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    md5_hash: Option<String>,
    #[serde(default)]
    content_encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResource<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_encoding: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    md5_hash: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

fn parse_size(size: Option<&str>) -> u64 {
    size.and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// Turn a non-2xx response into a classified error.
async fn check(response: Response) -> std::result::Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let kind = match status {
        StatusCode::NOT_FOUND => BackendErrorKind::NotFound,
        StatusCode::FORBIDDEN => BackendErrorKind::AccessDenied,
        _ => BackendErrorKind::Other,
    };
    Err(BackendError::new(
        kind,
        format!("GCS request failed with status {}: {}", status, body.trim()),
    ))
}

impl GcsHttpClient {
    /// `endpoint` with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> std::result::Result<Url, BackendError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::other("GCS endpoint cannot be a base URL"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, bucket: &str, key: &str) -> std::result::Result<Url, BackendError> {
        self.url(&["storage", "v1", "b", bucket, "o", key])
    }

    async fn bearer_token(&self) -> std::result::Result<Option<String>, BackendError> {
        match &self.token {
            TokenSource::Anonymous => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::MetadataServer => {
                let mut cached = self.cached_token.lock().await;
                if let Some((token, expires_at)) = cached.as_ref() {
                    if Instant::now() + TOKEN_EXPIRY_MARGIN < *expires_at {
                        return Ok(Some(token.clone()));
                    }
                }
                let response = self
                    .http
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(BackendError::other)?;
                let token: MetadataToken = check(response)
                    .await?
                    .json()
                    .await
                    .map_err(BackendError::other)?;
                tracing::debug!(expires_in = token.expires_in, "refreshed GCS access token");
                let expires_at = Instant::now() + Duration::from_secs(token.expires_in);
                *cached = Some((token.access_token.clone(), expires_at));
                Ok(Some(token.access_token))
            }
        }
    }

    async fn send(&self, request: RequestBuilder) -> std::result::Result<Response, BackendError> {
        let request = match self.bearer_token().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(BackendError::other)?;
        check(response).await
    }
}

#[async_trait]
impl GcsApi for GcsHttpClient {
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        range: Option<String>,
        cancel: &CancellationToken,
    ) -> std::result::Result<GcsObject, BackendError> {
        let mut url = self.object_url(bucket, key)?;
        url.query_pairs_mut().append_pair("alt", "media");

        // ask for stored bytes, not decompressive transcoding
        let mut request = self.http.get(url).header(ACCEPT_ENCODING, "gzip");
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::other("GCS request cancelled")),
            response = self.send(request) => response?,
        };
        let content_encoding = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .take_until(cancel.clone().cancelled_owned())
            .boxed();
        Ok(GcsObject {
            body,
            content_encoding,
        })
    }

    async fn metadata(&self, bucket: &str, key: &str) -> std::result::Result<GcsObjectMeta, BackendError> {
        let url = self.object_url(bucket, key)?;
        let resource: ObjectResource = self
            .send(self.http.get(url))
            .await?
            .json()
            .await
            .map_err(BackendError::other)?;
        Ok(GcsObjectMeta {
            size: parse_size(resource.size.as_deref()),
            md5_hash: resource.md5_hash,
            content_encoding: resource.content_encoding,
        })
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        upload: &GcsUpload,
    ) -> std::result::Result<(), BackendError> {
        let mut url = self.url(&["upload", "storage", "v1", "b", bucket, "o"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("uploadType", "multipart");
            if upload.if_none_match {
                query.append_pair("ifGenerationMatch", "0");
            }
        }

        let resource = UploadResource {
            name: key,
            content_type: upload.content_type.as_deref(),
            content_encoding: upload.content_encoding.as_deref(),
            md5_hash: upload.md5_hash.as_deref(),
        };
        let resource = serde_json::to_vec(&resource).map_err(BackendError::other)?;
        let boundary = uuid::Uuid::new_v4().simple().to_string();
        let content_type = upload
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");

        let mut payload = BytesMut::with_capacity(body.len() + resource.len() + 256);
        payload.put_slice(format!("--{}\r\n", boundary).as_bytes());
        payload.put_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        payload.put_slice(&resource);
        payload.put_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
        payload.put_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
        payload.put_slice(&body);
        payload.put_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        let request = self
            .http
            .post(url)
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(payload.freeze());
        self.send(request).await?;
        Ok(())
    }

    async fn copy(&self, bucket: &str, source_key: &str, dest_key: &str) -> std::result::Result<(), BackendError> {
        let url = self.url(&[
            "storage", "v1", "b", bucket, "o", source_key, "copyTo", "b", bucket, "o", dest_key,
        ])?;
        self.send(self.http.post(url).json(&serde_json::json!({})))
            .await?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> std::result::Result<(), BackendError> {
        let url = self.object_url(bucket, key)?;
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        page_token: Option<String>,
    ) -> std::result::Result<GcsListPage, BackendError> {
        let mut url = self.url(&["storage", "v1", "b", bucket, "o"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("prefix", prefix);
            if let Some(token) = &page_token {
                query.append_pair("pageToken", token);
            }
        }

        let list: ObjectList = self
            .send(self.http.get(url))
            .await?
            .json()
            .await
            .map_err(BackendError::other)?;
        Ok(GcsListPage {
            items: list
                .items
                .into_iter()
                .map(|item| ObjectStat {
                    size: parse_size(item.size.as_deref()),
                    key: item.name,
                })
                .collect(),
            next_page_token: list.next_page_token,
        })
    }
}

/// RFC 3986 encoding; `/` is kept when `keep_slash` is set.
fn uri_encode(value: &str, keep_slash: bool) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            b'/' if keep_slash => encoded.push('/'),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> std::result::Result<Vec<u8>, BackendError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|err| BackendError::other(err.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Credentials and validity for a V4 signed URL.
pub struct UrlSigner<'a> {
    pub access_id: &'a str,
    pub secret: &'a str,
    pub expires_in: Duration,
}

impl UrlSigner<'_> {
    /// Query-string signed GET URL for `bucket/key`, valid from `now`.
    pub fn sign(
        &self,
        endpoint: &Url,
        bucket: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<String, BackendError> {
        let host = match endpoint.port() {
            Some(port) => format!("{}:{}", endpoint.host_str().unwrap_or_default(), port),
            None => endpoint.host_str().unwrap_or_default().to_string(),
        };
        let datetime = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{}/auto/storage/goog4_request", date);
        let path = format!("/{}/{}", uri_encode(bucket, false), uri_encode(key, true));

        let params = [
            ("X-Goog-Algorithm", SIGNING_ALGORITHM.to_string()),
            ("X-Goog-Credential", format!("{}/{}", self.access_id, scope)),
            ("X-Goog-Date", datetime.clone()),
            ("X-Goog-Expires", self.expires_in.as_secs().to_string()),
            ("X-Goog-SignedHeaders", "host".to_string()),
        ];
        let query = params
            .iter()
            .map(|(name, value)| format!("{}={}", name, uri_encode(value, false)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            path, query, host
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            SIGNING_ALGORITHM,
            datetime,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let mut signing_key = hmac_sha256(format!("GOOG4{}", self.secret).as_bytes(), date.as_bytes())?;
        for part in ["auto", "storage", "goog4_request"] {
            signing_key = hmac_sha256(&signing_key, part.as_bytes())?;
        }
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

        Ok(format!(
            "{}://{}{}?{}&X-Goog-Signature={}",
            endpoint.scheme(),
            host,
            path,
            query,
            signature
        ))
    }
}

/// GCS persistor
pub struct GcsPersistor {
    settings: GcsSection,
    connector: Arc<dyn GcsConnector>,
    clients: ClientCache<String, dyn GcsApi>,
}

impl GcsPersistor {
    /// No request is made until the first operation.
    pub fn new(settings: GcsSection) -> std::result::Result<Self, reqwest::Error> {
        let connector = Arc::new(HttpConnector::new(&settings)?);
        Ok(Self::with_connector(settings, connector))
    }

    pub fn with_connector(settings: GcsSection, connector: Arc<dyn GcsConnector>) -> Self {
        Self {
            settings,
            connector,
            clients: ClientCache::new(),
        }
    }

    fn token_for(&self, bucket: &str) -> TokenSource {
        if let Some(creds) = self.settings.bucket_creds.get(bucket) {
            return TokenSource::Static(creds.access_token.clone());
        }
        match &self.settings.access_token {
            Some(token) => TokenSource::Static(token.clone()),
            None if self.settings.use_metadata_server => TokenSource::MetadataServer,
            None => TokenSource::Anonymous,
        }
    }

    async fn client_for_bucket(&self, bucket: &str, kind: ErrorKind) -> Result<Arc<dyn GcsApi>> {
        let token = self.token_for(bucket);
        self.clients
            .get_or_try_init(bucket.to_string(), || async move { self.connector.connect(token) })
            .await
            .map_err(|err| {
                Error::new(kind, "failed to create GCS client", ErrorContext::location(bucket))
                    .caused_by(err)
            })
    }

    async fn metadata(&self, bucket: &str, key: &str, message: &str) -> Result<GcsObjectMeta> {
        let client = self.client_for_bucket(bucket, ErrorKind::Read).await?;
        client
            .metadata(bucket, key)
            .await
            .map_err(|err| err.into_read_error(message, ErrorContext::new(bucket, key)))
    }

    async fn list_all(&self, bucket: &str, key: &str, kind: ErrorKind) -> Result<Vec<ObjectStat>> {
        let client = self.client_for_bucket(bucket, kind).await?;
        let prefix = directory_prefix(key);
        let mut stats = Vec::new();
        let mut token = None;
        loop {
            let page = client
                .list(bucket, &prefix, token.take())
                .await
                .map_err(|err| {
                    Error::new(kind, "failed to list objects in GCS", ErrorContext::new(bucket, key))
                        .caused_by(err)
                })?;
            stats.extend(page.items);
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(stats)
    }

    fn unsigned_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/download/storage/v1/b/{}/o/{}?alt=media",
            self.settings.api_endpoint.trim_end_matches('/'),
            uri_encode(bucket, false),
            uri_encode(key, false)
        )
    }
}

#[async_trait]
impl Persistor for GcsPersistor {
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

    #[instrument(skip(self, stream, opts))]
    async fn send_stream(
        &self,
        location: &str,
        key: &str,
        stream: ObjectStream,
        opts: SendOptions,
    ) -> Result<()> {
        let context = ErrorContext::new(location, key).with_info("if_none_match", opts.if_none_match);
        let client = self.client_for_bucket(location, ErrorKind::Write).await?;

        let (mut metered, handle) = MeteredStream::new(stream, "gcs.egress");
        let mut buffer = upload_buffer(opts.content_length, MAX_UPLOAD_PREALLOCATION);
        while let Some(chunk) = metered.next().await {
            let chunk = chunk.map_err(|err| {
                Error::wrap(ErrorKind::Write, "upload to GCS failed", err, context.clone())
            })?;
            buffer.extend_from_slice(&chunk);
        }
        let actual = handle.get().map(|digest| digest.md5).unwrap_or_default();

        let mut upload = GcsUpload {
            content_type: opts.content_type.clone(),
            content_encoding: opts.content_encoding.clone(),
            md5_hash: None,
            if_none_match: opts.if_none_match,
        };
        if let Some(expected) = &opts.source_md5 {
            if *expected != actual {
                return Err(Error::write(
                    "md5 hash mismatch",
                    context.with_info("expected", expected).with_info("actual", actual),
                ));
            }
            // the server rejects the upload if its own digest differs
            upload.md5_hash = stream::hex_to_base64(expected);
        }

        client
            .upload(location, key, buffer.freeze(), &upload)
            .await
            .map_err(|err| err.into_write_error("upload to GCS failed", context.clone()))?;

        if opts.source_md5.is_some() {
            return Ok(());
        }

        // a missing object here is a failed write, not a NotFound
        let stored = client.metadata(location, key).await.map_err(|err| {
            Error::new(ErrorKind::Write, "error verifying GCS upload", context.clone()).caused_by(err)
        })?;
        let stored_md5 = stored.md5_hash.as_deref().and_then(stream::base64_to_hex);
        match stored_md5 {
            Some(stored_md5) if stored_md5 != actual => {
                if let Err(err) = client.delete(location, key).await {
                    tracing::warn!(bucket = location, key, error = %err, "failed to delete corrupt upload");
                }
                Err(Error::write(
                    "md5 hash mismatch",
                    context.with_info("expected", actual).with_info("actual", stored_md5),
                ))
            }
            Some(_) => Ok(()),
            None => {
                tracing::debug!(bucket = location, key, "GCS returned no md5, skipping verification");
                Ok(())
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_object_stream(
        &self,
        location: &str,
        key: &str,
        opts: GetOptions,
    ) -> Result<ObjectStream> {
        let mut context = ErrorContext::new(location, key);
        let range = opts.range_header();
        if let Some(range) = &range {
            context = context.with_info("range", range);
        }

        let client = self.client_for_bucket(location, ErrorKind::Read).await?;
        let cancel = CancellationToken::new();
        let object = client
            .download(location, key, range, &cancel)
            .await
            .map_err(|err| err.into_read_error("error reading file from GCS", context))?;

        let (metered, _) = MeteredStream::new(object.body, "gcs.ingress");
        let body = stream::abort_on_drop(metered.boxed(), cancel);
        if opts.auto_gunzip && object.content_encoding.as_deref() == Some("gzip") {
            return Ok(stream::gunzip(body));
        }
        Ok(body)
    }

    async fn get_object_size(&self, location: &str, key: &str) -> Result<u64> {
        Ok(self
            .metadata(location, key, "error getting size of GCS object")
            .await?
            .size)
    }

    async fn get_object_md5_hash(&self, location: &str, key: &str) -> Result<String> {
        let meta = self
            .metadata(location, key, "error getting hash of GCS object")
            .await?;
        if let Some(md5) = meta.md5_hash.as_deref().and_then(stream::base64_to_hex) {
            return Ok(md5);
        }

        tracing::debug!(bucket = location, key, "object has no md5 hash, downloading object");
        let body = self
            .get_object_stream(location, key, GetOptions::default())
            .await?;
        stream::calculate_stream_md5(body).await.map_err(|err| {
            Error::wrap(
                ErrorKind::Read,
                "error getting hash of GCS object",
                err,
                ErrorContext::new(location, key),
            )
        })
    }

    async fn get_redirect_url(&self, location: &str, key: &str) -> Result<Option<String>> {
        if self.settings.unsigned_urls {
            return Ok(Some(self.unsigned_url(location, key)));
        }

        let (Some(access_id), Some(secret)) = (
            self.settings.hmac_access_id.as_deref(),
            self.settings.hmac_secret.as_deref(),
        ) else {
            tracing::debug!(bucket = location, key, "no GCS signing credentials configured");
            return Ok(None);
        };

        let context = ErrorContext::new(location, key);
        let endpoint = Url::parse(&self.settings.api_endpoint).map_err(|err| {
            Error::new(ErrorKind::Read, "error generating signed url for GCS file", context.clone())
                .caused_by(err)
        })?;
        let signer = UrlSigner {
            access_id,
            secret,
            expires_in: Duration::from_secs(self.settings.signed_url_expiry_secs),
        };
        let url = signer
            .sign(&endpoint, location, key, Utc::now())
            .map_err(|err| {
                Error::new(ErrorKind::Read, "error generating signed url for GCS file", context)
                    .caused_by(err)
            })?;
        Ok(Some(url))
    }

    async fn copy_object(&self, location: &str, source_key: &str, dest_key: &str) -> Result<()> {
        let client = self.client_for_bucket(location, ErrorKind::Write).await?;
        client
            .copy(location, source_key, dest_key)
            .await
            .map_err(|err| {
                err.into_write_error(
                    "failed to copy file in GCS",
                    ErrorContext::new(location, source_key).with_info("dest_key", dest_key),
                )
            })
    }

    async fn delete_object(&self, location: &str, key: &str) -> Result<()> {
        let client = self.client_for_bucket(location, ErrorKind::Write).await?;
        match client.delete(location, key).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind == BackendErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::new(
                ErrorKind::Write,
                "failed to delete file in GCS",
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
        let concurrency = self.settings.delete_concurrency.max(1);
        let mut token = None;
        let mut deleted = 0usize;
        loop {
            let page = client
                .list(location, &prefix, token.take())
                .await
                .map_err(|err| {
                    Error::new(ErrorKind::Write, "failed to list objects in GCS", context.clone())
                        .caused_by(err)
                })?;

            let count = page.items.len();
            let failure = futures::stream::iter(page.items)
                .map(|object| {
                    let client = Arc::clone(&client);
                    async move {
                        match client.delete(location, &object.key).await {
                            Err(err) if err.kind != BackendErrorKind::NotFound => Err(err),
                            _ => Ok(()),
                        }
                    }
                })
                .buffer_unordered(concurrency)
                .filter_map(|result| futures::future::ready(result.err()))
                .next()
                .await;
            if let Some(err) = failure {
                return Err(Error::new(ErrorKind::Write, "failed to delete objects in GCS", context)
                    .caused_by(err));
            }
            deleted += count;

            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
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
        match self.metadata(location, key, "error checking if GCS object exists").await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list_directory_keys(&self, location: &str, key: &str) -> Result<Vec<String>> {
        let stats = self.list_all(location, key, ErrorKind::Read).await?;
        Ok(stats.into_iter().map(|stat| stat.key).collect())
    }

    async fn list_directory_stats(&self, location: &str, key: &str) -> Result<Vec<ObjectStat>> {
        self.list_all(location, key, ErrorKind::Read).await
    }
}
