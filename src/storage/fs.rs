//! Local filesystem storage backend
//!
//! A location is a root folder. Keys are flattened into file names
//! (`a/b/c` becomes `a_b_c`) unless subdirectory mode is on, in which case
//! the hierarchy is kept on disk. Uploads land in a temp folder first and
//! are only copied to their public path once the hash has been verified.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::FilesystemSection;
use crate::error::{Error, ErrorContext, ErrorKind};
use crate::stream::{self, MeteredStream, ObjectStream, StreamDigest};
use crate::Result;

use super::{GetOptions, ObjectStat, Persistor, SendOptions};

#[derive(Debug, Clone)]
pub struct FsSettings {
    pub upload_folder: PathBuf,
    pub use_subdirectories: bool,
}

impl From<&FilesystemSection> for FsSettings {
    fn from(section: &FilesystemSection) -> Self {
        Self {
            upload_folder: PathBuf::from(&section.upload_folder),
            use_subdirectories: section.use_subdirectories,
        }
    }
}

/// Local filesystem persistor
pub struct FsPersistor {
    settings: FsSettings,
}

impl FsPersistor {
    pub fn new(settings: FsSettings) -> std::io::Result<Self> {
        std::fs::create_dir_all(&settings.upload_folder)?;
        Ok(Self { settings })
    }

    /// File name (or relative path) used for `key`.
    fn filter_name(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        if self.settings.use_subdirectories {
            key.to_string()
        } else {
            key.replace('/', "_")
        }
    }

    fn object_path(&self, location: &str, key: &str) -> PathBuf {
        Path::new(location).join(self.filter_name(key))
    }

    async fn ensure_parent(&self, path: &Path) -> std::io::Result<()> {
        if !self.settings.use_subdirectories {
            return Ok(());
        }
        match path.parent() {
            Some(parent) => fs::create_dir_all(parent).await,
            None => Ok(()),
        }
    }

    /// Stored objects below `key`, as `(stored key, path, size)`.
    async fn matching_files(
        &self,
        location: &str,
        key: &str,
    ) -> std::io::Result<Vec<(String, PathBuf, u64)>> {
        let root = PathBuf::from(location);
        let filtered = self.filter_name(key);
        let use_subdirectories = self.settings.use_subdirectories;

        tokio::task::spawn_blocking(move || {
            let (walk_root, max_depth) = if use_subdirectories {
                (root.join(filtered.trim_end_matches('/')), usize::MAX)
            } else {
                (root.clone(), 1)
            };
            if !walk_root.exists() {
                return Ok(Vec::new());
            }

            let flat_prefix = format!("{}_", filtered.trim_end_matches('_'));
            let mut found = Vec::new();
            for entry in WalkDir::new(&walk_root).min_depth(1).max_depth(max_depth) {
                let entry = entry.map_err(std::io::Error::from)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let stored_key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !use_subdirectories && !stored_key.starts_with(&flat_prefix) {
                    continue;
                }
                let size = entry.metadata().map_err(std::io::Error::from)?.len();
                found.push((stored_key, entry.path().to_path_buf(), size));
            }
            found.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(found)
        })
        .await
        .map_err(std::io::Error::other)?
    }

    async fn write_to_temp(&self, temp_path: &Path, source: ObjectStream) -> std::io::Result<StreamDigest> {
        let (mut metered, handle) = MeteredStream::new(source, "fs.egress");
        let mut file = fs::File::create(temp_path).await?;
        while let Some(chunk) = metered.next().await {
            file.write_all(&chunk?).await?;
        }
        file.sync_all().await?;
        handle
            .get()
            .ok_or_else(|| std::io::Error::other("upload stream ended without a digest"))
    }

    /// Copy `source` to `target`; with `create_new` an existing target is
    /// left alone and reported as `AlreadyExists`.
    async fn place(&self, source: &Path, target: &Path, create_new: bool) -> std::io::Result<()> {
        self.ensure_parent(target).await?;
        if !create_new {
            return fs::copy(source, target).await.map(|_| ());
        }
        let mut out = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(target)
            .await?;
        let mut input = fs::File::open(source).await?;
        tokio::io::copy(&mut input, &mut out).await?;
        out.sync_all().await
    }

    async fn remove_quietly(path: &Path) {
        if let Err(err) = fs::remove_file(path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "failed to clean up file");
            }
        }
    }

    async fn open_range(&self, path: &Path, opts: GetOptions) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        let mut file = fs::File::open(path).await?;
        let start = opts.start.unwrap_or(0);
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        // an end of u64::MAX has no exclusive bound and reads to the end
        match opts.end.and_then(|end| end.checked_add(1)) {
            Some(limit) => Ok(Box::new(file.take(limit.saturating_sub(start)))),
            None => Ok(Box::new(file)),
        }
    }
}

#[async_trait]
impl Persistor for FsPersistor {
    async fn send_file(
        &self,
        location: &str,
        key: &str,
        local_path: &Path,
        opts: SendOptions,
    ) -> Result<()> {
        let target = self.object_path(location, key);
        let context = ErrorContext::new(location, key)
            .with_info("source", local_path.display());

        if let Err(err) = self.place(local_path, &target, opts.if_none_match).await {
            if err.kind() != std::io::ErrorKind::AlreadyExists {
                Self::remove_quietly(&target).await;
            }
            return Err(Error::wrap(
                ErrorKind::Write,
                "failed to copy the specified file",
                err,
                context,
            ));
        }

        if let Some(expected) = opts.source_md5 {
            let actual = self.get_object_md5_hash(location, key).await?;
            if actual != expected {
                Self::remove_quietly(&target).await;
                return Err(Error::write(
                    "md5 hash mismatch",
                    context.with_info("expected", expected).with_info("actual", actual),
                ));
            }
        }

        Ok(())
    }

    async fn send_stream(
        &self,
        location: &str,
        key: &str,
        stream: ObjectStream,
        opts: SendOptions,
    ) -> Result<()> {
        let target = self.object_path(location, key);
        let temp_path = self.settings.upload_folder.join(Uuid::new_v4().to_string());
        let context = ErrorContext::new(location, key);

        let digest = match self.write_to_temp(&temp_path, stream).await {
            Ok(digest) => digest,
            Err(err) => {
                Self::remove_quietly(&temp_path).await;
                return Err(Error::wrap(
                    ErrorKind::Write,
                    "failed to write stream to temp file",
                    err,
                    context,
                ));
            }
        };

        if let Some(expected) = opts.source_md5.as_deref() {
            if digest.md5 != expected {
                Self::remove_quietly(&temp_path).await;
                return Err(Error::write(
                    "md5 hash mismatch",
                    context
                        .with_info("expected", expected)
                        .with_info("actual", &digest.md5),
                ));
            }
        }

        let placed = self.place(&temp_path, &target, opts.if_none_match).await;
        Self::remove_quietly(&temp_path).await;

        if let Err(err) = placed {
            if err.kind() != std::io::ErrorKind::AlreadyExists {
                Self::remove_quietly(&target).await;
            }
            return Err(Error::wrap(
                ErrorKind::Write,
                "failed to copy temp file into place",
                err,
                context.with_info("if_none_match", opts.if_none_match),
            ));
        }

        tracing::debug!(location, key, bytes = digest.bytes, "stored object");
        Ok(())
    }

    async fn get_object_stream(
        &self,
        location: &str,
        key: &str,
        opts: GetOptions,
    ) -> Result<ObjectStream> {
        let path = self.object_path(location, key);
        let mut context = ErrorContext::new(location, key);
        if let Some((start, end)) = opts.byte_range() {
            context = context.with_info("range", format!("{}-{}", start, end));
            if end < start {
                return Err(Error::read("invalid byte range", context));
            }
        }

        let reader = self
            .open_range(&path, opts)
            .await
            .map_err(|err| Error::wrap(ErrorKind::Read, "failed to open file for streaming", err, context))?;

        let (metered, _) = MeteredStream::new(ReaderStream::new(reader).boxed(), "fs.ingress");
        Ok(metered.boxed())
    }

    async fn get_object_size(&self, location: &str, key: &str) -> Result<u64> {
        let path = self.object_path(location, key);
        let metadata = fs::metadata(&path).await.map_err(|err| {
            Error::wrap(
                ErrorKind::Read,
                "failed to stat file",
                err,
                ErrorContext::new(location, key),
            )
        })?;
        Ok(metadata.len())
    }

    async fn get_object_md5_hash(&self, location: &str, key: &str) -> Result<String> {
        let stream = self
            .get_object_stream(location, key, GetOptions::default())
            .await?;
        stream::calculate_stream_md5(stream).await.map_err(|err| {
            Error::wrap(
                ErrorKind::Read,
                "failed to compute md5 hash of file",
                err,
                ErrorContext::new(location, key),
            )
        })
    }

    async fn get_redirect_url(&self, _location: &str, _key: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn copy_object(&self, location: &str, source_key: &str, dest_key: &str) -> Result<()> {
        let source = self.object_path(location, source_key);
        let dest = self.object_path(location, dest_key);

        let copied = async {
            self.ensure_parent(&dest).await?;
            fs::copy(&source, &dest).await
        }
        .await;

        copied.map(|_| ()).map_err(|err| {
            Error::wrap(
                ErrorKind::Write,
                "failed to copy file",
                err,
                ErrorContext::new(location, source_key).with_info("dest_key", dest_key),
            )
        })
    }

    async fn delete_object(&self, location: &str, key: &str) -> Result<()> {
        let path = self.object_path(location, key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::wrap(
                ErrorKind::Write,
                "failed to delete file",
                err,
                ErrorContext::new(location, key),
            )),
        }
    }

    async fn delete_directory(&self, location: &str, key: &str) -> Result<()> {
        let context = ErrorContext::new(location, key);
        if self.filter_name(key).trim_matches(|c| c == '/' || c == '_').is_empty() {
            return Err(Error::write("refusing to delete a whole location", context));
        }

        if self.settings.use_subdirectories {
            let dir = self.object_path(location, key.trim_end_matches('/'));
            return match fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(Error::new(ErrorKind::Write, "failed to delete directory", context)
                    .caused_by(err)),
            };
        }

        let files = self
            .matching_files(location, key)
            .await
            .map_err(|err| Error::new(ErrorKind::Write, "failed to list directory", context.clone()).caused_by(err))?;
        for (_, path, _) in files {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(Error::new(ErrorKind::Write, "failed to delete directory", context)
                        .caused_by(err))
                }
            }
        }
        Ok(())
    }

    async fn directory_size(&self, location: &str, key: &str) -> Result<u64> {
        let stats = self.list_directory_stats(location, key).await?;
        Ok(stats.iter().map(|stat| stat.size).sum())
    }

    async fn check_if_object_exists(&self, location: &str, key: &str) -> Result<bool> {
        match self.get_object_size(location, key).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list_directory_keys(&self, location: &str, key: &str) -> Result<Vec<String>> {
        let stats = self.list_directory_stats(location, key).await?;
        Ok(stats.into_iter().map(|stat| stat.key).collect())
    }

    async fn list_directory_stats(&self, location: &str, key: &str) -> Result<Vec<ObjectStat>> {
        let files = self.matching_files(location, key).await.map_err(|err| {
            Error::new(ErrorKind::Read, "failed to list directory", ErrorContext::new(location, key))
                .caused_by(err)
        })?;
        Ok(files
            .into_iter()
            .map(|(key, _, size)| ObjectStat { key, size })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{from_bytes, md5_hex};
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        location: String,
        uploads: PathBuf,
        persistor: FsPersistor,
    }

    fn fixture(use_subdirectories: bool) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let location = temp_dir.path().join("objects");
        std::fs::create_dir_all(&location).unwrap();
        let uploads = temp_dir.path().join("uploads");
        let persistor = FsPersistor::new(FsSettings {
            upload_folder: uploads.clone(),
            use_subdirectories,
        })
        .unwrap();
        Fixture {
            location: location.display().to_string(),
            uploads,
            persistor,
            _temp_dir: temp_dir,
        }
    }

    async fn read_all(stream: ObjectStream) -> Vec<u8> {
        let chunks: Vec<_> = stream.collect().await;
        chunks
            .into_iter()
            .map(|chunk| chunk.unwrap())
            .fold(Vec::new(), |mut acc, chunk: Bytes| {
                acc.extend_from_slice(&chunk);
                acc
            })
    }

    #[tokio::test]
    async fn test_round_trip_with_hash() {
        let f = fixture(false);
        let data = b"some document content";
        let opts = SendOptions {
            source_md5: Some(md5_hex(data)),
            ..Default::default()
        };

        f.persistor
            .send_stream(&f.location, "project/file", from_bytes(Bytes::from_static(data)), opts)
            .await
            .unwrap();

        // keys are flattened
        assert!(Path::new(&f.location).join("project_file").exists());

        let stream = f
            .persistor
            .get_object_stream(&f.location, "project/file", GetOptions::default())
            .await
            .unwrap();
        assert_eq!(read_all(stream).await, data);
        assert_eq!(
            f.persistor.get_object_md5_hash(&f.location, "project/file").await.unwrap(),
            md5_hex(data)
        );
        assert_eq!(
            f.persistor.get_object_size(&f.location, "project/file").await.unwrap(),
            data.len() as u64
        );

        // temp file is gone
        assert_eq!(std::fs::read_dir(&f.uploads).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_hash_mismatch_leaves_nothing_behind() {
        let f = fixture(false);
        let opts = SendOptions {
            source_md5: Some("ffffffffffffffffffffffffffffffff".to_string()),
            ..Default::default()
        };

        let err = f
            .persistor
            .send_stream(&f.location, "project/file", from_bytes("payload"), opts)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Write);
        assert_eq!(err.message(), "md5 hash mismatch");
        assert!(!f.persistor.check_if_object_exists(&f.location, "project/file").await.unwrap());
        assert_eq!(std::fs::read_dir(&f.uploads).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_source_stream_is_write_error() {
        let f = fixture(false);
        let source = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("client went away")),
        ])
        .boxed();

        let err = f
            .persistor
            .send_stream(&f.location, "key", source, SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Write);
        assert!(!f.persistor.check_if_object_exists(&f.location, "key").await.unwrap());
        assert_eq!(std::fs::read_dir(&f.uploads).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let f = fixture(false);

        let err = f
            .persistor
            .get_object_stream(&f.location, "nope", GetOptions::default())
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());
        assert_eq!(err.context().location.as_deref(), Some(f.location.as_str()));
        assert_eq!(err.context().key.as_deref(), Some("nope"));
        assert!(err.cause().is_some());

        let err = f.persistor.get_object_size(&f.location, "nope").await.unwrap_err();
        assert!(err.is_not_found());
        let err = f.persistor.get_object_md5_hash(&f.location, "nope").await.unwrap_err();
        assert!(err.is_not_found());
        let err = f.persistor.copy_object(&f.location, "nope", "dest").await.unwrap_err();
        assert!(err.is_not_found());

        assert!(!f.persistor.check_if_object_exists(&f.location, "nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_byte_range_is_inclusive() {
        let f = fixture(false);
        f.persistor
            .send_stream(&f.location, "k", from_bytes("0123456789"), SendOptions::default())
            .await
            .unwrap();

        let stream = f
            .persistor
            .get_object_stream(&f.location, "k", GetOptions::range(2, 5))
            .await
            .unwrap();
        assert_eq!(read_all(stream).await, b"2345");

        let err = f
            .persistor
            .get_object_stream(&f.location, "k", GetOptions::range(5, 2))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Read);
    }

    #[tokio::test]
    async fn test_open_ended_ranges() {
        let f = fixture(false);
        f.persistor
            .send_stream(&f.location, "k", from_bytes("0123456789"), SendOptions::default())
            .await
            .unwrap();

        let to_end = GetOptions {
            start: Some(2),
            end: Some(u64::MAX),
            auto_gunzip: false,
        };
        let stream = f.persistor.get_object_stream(&f.location, "k", to_end).await.unwrap();
        assert_eq!(read_all(stream).await, b"23456789");

        let stream = f
            .persistor
            .get_object_stream(&f.location, "k", GetOptions::from_offset(7))
            .await
            .unwrap();
        assert_eq!(read_all(stream).await, b"789");
    }

    #[tokio::test]
    async fn test_if_none_match_keeps_existing_object() {
        let f = fixture(true);
        let create_only = SendOptions {
            if_none_match: true,
            ..Default::default()
        };
        f.persistor
            .send_stream(&f.location, "doc/k", from_bytes("first"), create_only.clone())
            .await
            .unwrap();

        let err = f
            .persistor
            .send_stream(&f.location, "doc/k", from_bytes("second"), create_only)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Write);

        let stream = f
            .persistor
            .get_object_stream(&f.location, "doc/k", GetOptions::default())
            .await
            .unwrap();
        assert_eq!(read_all(stream).await, b"first");
        let leftovers = std::fs::read_dir(&f.uploads).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_delete_object_is_idempotent() {
        let f = fixture(false);
        f.persistor
            .send_stream(&f.location, "k", from_bytes("x"), SendOptions::default())
            .await
            .unwrap();
        f.persistor.delete_object(&f.location, "k").await.unwrap();
        f.persistor.delete_object(&f.location, "k").await.unwrap();
        assert!(!f.persistor.check_if_object_exists(&f.location, "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_flat_directory_operations() {
        let f = fixture(false);
        for (key, body) in [("proj/a", "1"), ("proj/b", "22"), ("proj/c/d", "333"), ("other/a", "4444")] {
            f.persistor
                .send_stream(&f.location, key, from_bytes(body), SendOptions::default())
                .await
                .unwrap();
        }

        let keys = f.persistor.list_directory_keys(&f.location, "proj").await.unwrap();
        assert_eq!(keys, vec!["proj_a", "proj_b", "proj_c_d"]);
        assert_eq!(f.persistor.directory_size(&f.location, "proj").await.unwrap(), 6);

        f.persistor.delete_directory(&f.location, "proj").await.unwrap();
        assert!(f.persistor.list_directory_keys(&f.location, "proj").await.unwrap().is_empty());
        assert!(f.persistor.check_if_object_exists(&f.location, "other/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_subdirectory_mode() {
        let f = fixture(true);
        for key in ["proj/a", "proj/nested/b"] {
            f.persistor
                .send_stream(&f.location, key, from_bytes("abc"), SendOptions::default())
                .await
                .unwrap();
        }
        assert!(Path::new(&f.location).join("proj").join("nested").join("b").exists());

        let stats = f.persistor.list_directory_stats(&f.location, "proj").await.unwrap();
        assert_eq!(
            stats,
            vec![
                ObjectStat { key: "proj/a".into(), size: 3 },
                ObjectStat { key: "proj/nested/b".into(), size: 3 },
            ]
        );

        f.persistor.copy_object(&f.location, "proj/a", "copy/a").await.unwrap();
        assert!(f.persistor.check_if_object_exists(&f.location, "copy/a").await.unwrap());

        f.persistor.delete_directory(&f.location, "proj").await.unwrap();
        assert_eq!(f.persistor.directory_size(&f.location, "proj").await.unwrap(), 0);
        // deleting again is fine
        f.persistor.delete_directory(&f.location, "proj").await.unwrap();
    }

    #[tokio::test]
    async fn test_refuses_to_delete_location() {
        let f = fixture(false);
        let err = f.persistor.delete_directory(&f.location, "").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Write);
    }

    #[tokio::test]
    async fn test_send_file_copies_directly() {
        let f = fixture(false);
        let source = f.uploads.join("../source.txt");
        std::fs::write(&source, b"file body").unwrap();

        f.persistor
            .send_file(
                &f.location,
                "doc/1",
                &source,
                SendOptions {
                    source_md5: Some(md5_hex(b"file body")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(f.persistor.get_object_size(&f.location, "doc/1").await.unwrap(), 9);

        let err = f
            .persistor
            .send_file(&f.location, "doc/2", Path::new("/does/not/exist"), SendOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        assert!(f.persistor.get_redirect_url(&f.location, "doc/1").await.unwrap().is_none());
    }
}
