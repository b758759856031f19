//! Migration persistor
//!
//! Wraps a new (primary) and an old (fallback) persistor during a live
//! backend switch. Reads try the primary first and fall back only when it
//! reports `NotFound`; writes go to the primary alone; deletes are applied
//! to both so stale copies do not outlive the migration.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::stream::{self, ObjectStream};
use crate::Result;

use super::{GetOptions, ObjectStat, Persistor, SendOptions};

/// Location mapping and copy policy.
#[derive(Debug, Clone, Default)]
pub struct MigrationSettings {
    /// Primary location -> fallback location; unmapped locations keep their name
    pub buckets: HashMap<String, String>,
    /// Write objects found only in the fallback back to the primary
    pub copy_on_miss: bool,
}

pub struct MigrationPersistor {
    primary: Arc<dyn Persistor>,
    fallback: Arc<dyn Persistor>,
    settings: MigrationSettings,
}

/// Run `$method` on the primary; on `NotFound`, run it again on the fallback
/// with the translated location.
macro_rules! with_fallback {
    ($self:ident, $location:expr, $method:ident($($arg:expr),*)) => {
        match $self.primary.$method($location, $($arg),*).await {
            Err(err) if err.is_not_found() => {
                let fallback_location = $self.fallback_location($location);
                tracing::debug!(
                    op = stringify!($method),
                    location = $location,
                    fallback_location = %fallback_location,
                    "object missing from primary, trying fallback"
                );
                $self.fallback.$method(&fallback_location, $($arg),*).await
            }
            result => result,
        }
    };
}

impl MigrationPersistor {
    pub fn new(
        primary: Arc<dyn Persistor>,
        fallback: Arc<dyn Persistor>,
        settings: MigrationSettings,
    ) -> Self {
        Self {
            primary,
            fallback,
            settings,
        }
    }

    fn fallback_location(&self, location: &str) -> String {
        self.settings
            .buckets
            .get(location)
            .cloned()
            .unwrap_or_else(|| location.to_string())
    }

    /// Copy a fallback stream into the primary in the background and hand
    /// the caller an independent branch of it.
    fn copy_to_primary(&self, location: &str, key: &str, body: ObjectStream) -> ObjectStream {
        let (client_branch, copy_branch) = stream::tee(body);
        let primary = Arc::clone(&self.primary);
        let location = location.to_string();
        let key = key.to_string();

        tokio::spawn(async move {
            match primary
                .send_stream(&location, &key, copy_branch, SendOptions::default())
                .await
            {
                Ok(()) => tracing::info!(location = %location, key = %key, "copied object from fallback to primary"),
                Err(err) => tracing::warn!(
                    location = %location,
                    key = %key,
                    error = %err,
                    "failed to copy object from fallback to primary"
                ),
            }
        });

        client_branch
    }
}

/// `first` followed by every entry of `second` whose key is not in `first`.
fn union_by_key<T>(first: Vec<T>, second: Vec<T>, key: impl Fn(&T) -> &str) -> Vec<T> {
    let seen: HashSet<String> = first.iter().map(|item| key(item).to_string()).collect();
    let mut merged = first;
    merged.extend(second.into_iter().filter(|item| !seen.contains(key(item))));
    merged
}

/// The primary error wins; a fallback error hidden behind it is logged.
fn merge_deletes(location: &str, key: &str, primary: Result<()>, fallback: Result<()>) -> Result<()> {
    if let (Err(_), Err(err)) = (&primary, &fallback) {
        tracing::warn!(location, key, error = %err, "fallback delete failed");
    }
    primary.and(fallback)
}

#[async_trait]
impl Persistor for MigrationPersistor {
    async fn send_file(
        &self,
        location: &str,
        key: &str,
        local_path: &Path,
        opts: SendOptions,
    ) -> Result<()> {
        self.primary.send_file(location, key, local_path, opts).await
    }

    async fn send_stream(
        &self,
        location: &str,
        key: &str,
        stream: ObjectStream,
        opts: SendOptions,
    ) -> Result<()> {
        self.primary.send_stream(location, key, stream, opts).await
    }

    #[instrument(skip(self))]
    async fn get_object_stream(
        &self,
        location: &str,
        key: &str,
        opts: GetOptions,
    ) -> Result<ObjectStream> {
        match self.primary.get_object_stream(location, key, opts).await {
            Err(err) if err.is_not_found() => {}
            result => return result,
        }

        let fallback_location = self.fallback_location(location);
        let body = self
            .fallback
            .get_object_stream(&fallback_location, key, opts)
            .await?;

        if !self.settings.copy_on_miss {
            return Ok(body);
        }
        // a partial or decoded body is not the stored object
        if opts.is_ranged() || opts.auto_gunzip {
            tracing::debug!(location, key, "skipping copy on miss for a transformed read");
            return Ok(body);
        }
        Ok(self.copy_to_primary(location, key, body))
    }

    async fn get_object_size(&self, location: &str, key: &str) -> Result<u64> {
        with_fallback!(self, location, get_object_size(key))
    }

    async fn get_object_md5_hash(&self, location: &str, key: &str) -> Result<String> {
        with_fallback!(self, location, get_object_md5_hash(key))
    }

    async fn get_redirect_url(&self, location: &str, key: &str) -> Result<Option<String>> {
        if self.primary.check_if_object_exists(location, key).await? {
            return self.primary.get_redirect_url(location, key).await;
        }
        let fallback_location = self.fallback_location(location);
        self.fallback.get_redirect_url(&fallback_location, key).await
    }

    /// A source missing from the primary is streamed from the fallback
    /// straight into the primary at `dest_key`.
    async fn copy_object(&self, location: &str, source_key: &str, dest_key: &str) -> Result<()> {
        match self.primary.copy_object(location, source_key, dest_key).await {
            Err(err) if err.is_not_found() => {}
            result => return result,
        }

        let fallback_location = self.fallback_location(location);
        let body = self
            .fallback
            .get_object_stream(&fallback_location, source_key, GetOptions::default())
            .await?;
        self.primary
            .send_stream(location, dest_key, body, SendOptions::default())
            .await
    }

    async fn delete_object(&self, location: &str, key: &str) -> Result<()> {
        let fallback_location = self.fallback_location(location);
        let (primary, fallback) = tokio::join!(
            self.primary.delete_object(location, key),
            self.fallback.delete_object(&fallback_location, key)
        );
        merge_deletes(location, key, primary, fallback)
    }

    async fn delete_directory(&self, location: &str, key: &str) -> Result<()> {
        let fallback_location = self.fallback_location(location);
        let (primary, fallback) = tokio::join!(
            self.primary.delete_directory(location, key),
            self.fallback.delete_directory(&fallback_location, key)
        );
        merge_deletes(location, key, primary, fallback)
    }

    async fn directory_size(&self, location: &str, key: &str) -> Result<u64> {
        with_fallback!(self, location, directory_size(key))
    }

    async fn check_if_object_exists(&self, location: &str, key: &str) -> Result<bool> {
        if self.primary.check_if_object_exists(location, key).await? {
            return Ok(true);
        }
        let fallback_location = self.fallback_location(location);
        self.fallback
            .check_if_object_exists(&fallback_location, key)
            .await
    }

    async fn list_directory_keys(&self, location: &str, key: &str) -> Result<Vec<String>> {
        let primary = self.primary.list_directory_keys(location, key).await?;
        let fallback_location = self.fallback_location(location);
        let fallback = self
            .fallback
            .list_directory_keys(&fallback_location, key)
            .await?;
        Ok(union_by_key(primary, fallback, |key| key.as_str()))
    }

    async fn list_directory_stats(&self, location: &str, key: &str) -> Result<Vec<ObjectStat>> {
        let primary = self.primary.list_directory_stats(location, key).await?;
        let fallback_location = self.fallback_location(location);
        let fallback = self
            .fallback
            .list_directory_stats(&fallback_location, key)
            .await?;
        Ok(union_by_key(primary, fallback, |stat| stat.key.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorContext, ErrorKind};
    use crate::stream::from_bytes;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory persistor recording `op:location:key` for every call.
    #[derive(Default)]
    struct StubPersistor {
        objects: Mutex<BTreeMap<(String, String), Bytes>>,
        calls: Mutex<Vec<String>>,
        fail_with: Mutex<Option<ErrorKind>>,
    }

    impl StubPersistor {
        fn with_object(location: &str, key: &str, body: &'static str) -> Arc<Self> {
            let stub = Self::default();
            stub.put(location, key, Bytes::from_static(body.as_bytes()));
            Arc::new(stub)
        }

        fn empty() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn failing(kind: ErrorKind) -> Arc<Self> {
            let stub = Self::default();
            *stub.fail_with.lock().unwrap() = Some(kind);
            Arc::new(stub)
        }

        fn put(&self, location: &str, key: &str, body: Bytes) {
            self.objects
                .lock()
                .unwrap()
                .insert((location.to_string(), key.to_string()), body);
        }

        fn get(&self, location: &str, key: &str) -> Option<Bytes> {
            self.objects
                .lock()
                .unwrap()
                .get(&(location.to_string(), key.to_string()))
                .cloned()
        }

        fn record(&self, op: &str, location: &str, key: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}:{}", op, location, key));
            match *self.fail_with.lock().unwrap() {
                Some(kind) => Err(Error::new(kind, "stub failure", ErrorContext::new(location, key))),
                None => Ok(()),
            }
        }

        fn calls(&self, op: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|call| call.starts_with(&format!("{}:", op)))
                .cloned()
                .collect()
        }

        fn lookup(&self, location: &str, key: &str) -> Result<Bytes> {
            self.get(location, key)
                .ok_or_else(|| Error::not_found("no such object", ErrorContext::new(location, key)))
        }

        fn under(&self, location: &str, key: &str) -> Vec<ObjectStat> {
            let prefix = super::super::directory_prefix(key);
            self.objects
                .lock()
                .unwrap()
                .iter()
                .filter(|((loc, k), _)| loc == location && k.starts_with(&prefix))
                .map(|((_, k), body)| ObjectStat {
                    key: k.clone(),
                    size: body.len() as u64,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Persistor for StubPersistor {
        async fn send_file(&self, location: &str, key: &str, _path: &Path, _opts: SendOptions) -> Result<()> {
            self.record("send_file", location, key)
        }

        async fn send_stream(
            &self,
            location: &str,
            key: &str,
            stream: ObjectStream,
            _opts: SendOptions,
        ) -> Result<()> {
            self.record("send_stream", location, key)?;
            let chunks: Vec<_> = stream.collect().await;
            let mut body = Vec::new();
            for chunk in chunks {
                let chunk = chunk.map_err(|err| Error::wrap(ErrorKind::Write, "read failed", err, ErrorContext::new(location, key)))?;
                body.extend_from_slice(&chunk);
            }
            self.put(location, key, Bytes::from(body));
            Ok(())
        }

        async fn get_object_stream(&self, location: &str, key: &str, _opts: GetOptions) -> Result<ObjectStream> {
            self.record("get_object_stream", location, key)?;
            Ok(from_bytes(self.lookup(location, key)?))
        }

        async fn get_object_size(&self, location: &str, key: &str) -> Result<u64> {
            self.record("get_object_size", location, key)?;
            Ok(self.lookup(location, key)?.len() as u64)
        }

        async fn get_object_md5_hash(&self, location: &str, key: &str) -> Result<String> {
            self.record("get_object_md5_hash", location, key)?;
            Ok(stream::md5_hex(&self.lookup(location, key)?))
        }

        async fn get_redirect_url(&self, location: &str, key: &str) -> Result<Option<String>> {
            self.record("get_redirect_url", location, key)?;
            Ok(Some(format!("stub://{}/{}", location, key)))
        }

        async fn copy_object(&self, location: &str, source_key: &str, dest_key: &str) -> Result<()> {
            self.record("copy_object", location, source_key)?;
            let body = self.lookup(location, source_key)?;
            self.put(location, dest_key, body);
            Ok(())
        }

        async fn delete_object(&self, location: &str, key: &str) -> Result<()> {
            self.record("delete_object", location, key)?;
            self.objects
                .lock()
                .unwrap()
                .remove(&(location.to_string(), key.to_string()));
            Ok(())
        }

        async fn delete_directory(&self, location: &str, key: &str) -> Result<()> {
            self.record("delete_directory", location, key)?;
            for stat in self.under(location, key) {
                self.objects
                    .lock()
                    .unwrap()
                    .remove(&(location.to_string(), stat.key));
            }
            Ok(())
        }

        async fn directory_size(&self, location: &str, key: &str) -> Result<u64> {
            self.record("directory_size", location, key)?;
            Ok(self.under(location, key).iter().map(|stat| stat.size).sum())
        }

        async fn check_if_object_exists(&self, location: &str, key: &str) -> Result<bool> {
            self.record("check_if_object_exists", location, key)?;
            Ok(self.get(location, key).is_some())
        }

        async fn list_directory_keys(&self, location: &str, key: &str) -> Result<Vec<String>> {
            self.record("list_directory_keys", location, key)?;
            Ok(self.under(location, key).into_iter().map(|stat| stat.key).collect())
        }

        async fn list_directory_stats(&self, location: &str, key: &str) -> Result<Vec<ObjectStat>> {
            self.record("list_directory_stats", location, key)?;
            Ok(self.under(location, key))
        }
    }

    const BUCKET: &str = "womBucket";
    const FALLBACK_BUCKET: &str = "bucKangaroo";
    const KEY: &str = "monKey";

    fn migration(primary: &Arc<StubPersistor>, fallback: &Arc<StubPersistor>, copy_on_miss: bool) -> MigrationPersistor {
        let settings = MigrationSettings {
            buckets: HashMap::from([(BUCKET.to_string(), FALLBACK_BUCKET.to_string())]),
            copy_on_miss,
        };
        MigrationPersistor::new(primary.clone(), fallback.clone(), settings)
    }

    async fn read_all(stream: ObjectStream) -> Vec<u8> {
        let chunks: Vec<_> = stream.collect().await;
        chunks.into_iter().flat_map(|c| c.unwrap().to_vec()).collect()
    }

    /// Wait for the background copy to land in `stub`.
    async fn wait_for_object(stub: &StubPersistor, location: &str, key: &str) -> Option<Bytes> {
        for _ in 0..100 {
            if let Some(body) = stub.get(location, key) {
                return Some(body);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_primary_hit_never_consults_fallback() {
        let primary = StubPersistor::with_object(BUCKET, KEY, "primary");
        let fallback = StubPersistor::with_object(FALLBACK_BUCKET, KEY, "fallback");
        let persistor = migration(&primary, &fallback, true);

        let body = persistor.get_object_stream(BUCKET, KEY, GetOptions::default()).await.unwrap();
        assert_eq!(read_all(body).await, b"primary");
        assert!(fallback.calls("get_object_stream").is_empty());
        assert!(primary.calls("send_stream").is_empty());
    }

    #[tokio::test]
    async fn test_fallback_hit_uses_translated_location() {
        let primary = StubPersistor::empty();
        let fallback = StubPersistor::with_object(FALLBACK_BUCKET, KEY, "fallback");
        let persistor = migration(&primary, &fallback, false);

        let body = persistor.get_object_stream(BUCKET, KEY, GetOptions::default()).await.unwrap();
        assert_eq!(read_all(body).await, b"fallback");
        assert_eq!(
            fallback.calls("get_object_stream"),
            vec![format!("get_object_stream:{}:{}", FALLBACK_BUCKET, KEY)]
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(primary.calls("send_stream").is_empty());
    }

    #[tokio::test]
    async fn test_copy_on_miss_writes_back_to_primary() {
        let primary = StubPersistor::empty();
        let fallback = StubPersistor::with_object(FALLBACK_BUCKET, KEY, "migrate me");
        let persistor = migration(&primary, &fallback, true);

        let body = persistor.get_object_stream(BUCKET, KEY, GetOptions::default()).await.unwrap();
        assert_eq!(read_all(body).await, b"migrate me");

        let copied = wait_for_object(&primary, BUCKET, KEY).await;
        assert_eq!(copied.as_deref(), Some(&b"migrate me"[..]));
        assert_eq!(fallback.calls("get_object_stream").len(), 1);
        assert_eq!(
            primary.calls("send_stream"),
            vec![format!("send_stream:{}:{}", BUCKET, KEY)]
        );
    }

    #[tokio::test]
    async fn test_copy_on_miss_skips_ranged_reads() {
        let primary = StubPersistor::empty();
        let fallback = StubPersistor::with_object(FALLBACK_BUCKET, KEY, "migrate me");
        let persistor = migration(&primary, &fallback, true);

        let body = persistor.get_object_stream(BUCKET, KEY, GetOptions::range(0, 3)).await.unwrap();
        read_all(body).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(primary.calls("send_stream").is_empty());
    }

    #[tokio::test]
    async fn test_both_missing_is_not_found() {
        let persistor = migration(&StubPersistor::empty(), &StubPersistor::empty(), true);
        let err = persistor.get_object_stream(BUCKET, KEY, GetOptions::default()).await.err().unwrap();
        assert!(err.is_not_found());
        assert!(persistor.get_object_size(BUCKET, KEY).await.unwrap_err().is_not_found());
        assert!(persistor.get_object_md5_hash(BUCKET, KEY).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_primary_failure_short_circuits() {
        let primary = StubPersistor::failing(ErrorKind::Read);
        let fallback = StubPersistor::with_object(FALLBACK_BUCKET, KEY, "fallback");
        let persistor = migration(&primary, &fallback, true);

        let err = persistor.get_object_stream(BUCKET, KEY, GetOptions::default()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Read);
        assert_eq!(err.message(), "stub failure");
        let err = persistor.get_object_size(BUCKET, KEY).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Read);
        assert!(fallback.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_failure_propagates() {
        let primary = StubPersistor::empty();
        let fallback = StubPersistor::failing(ErrorKind::Read);
        let persistor = migration(&primary, &fallback, false);

        let err = persistor.get_object_stream(BUCKET, KEY, GetOptions::default()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Read);
        assert_eq!(fallback.calls("get_object_stream").len(), 1);
    }

    #[tokio::test]
    async fn test_writes_target_primary_only() {
        let primary = StubPersistor::empty();
        let fallback = StubPersistor::empty();
        let persistor = migration(&primary, &fallback, true);

        persistor
            .send_stream(BUCKET, KEY, from_bytes("new"), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(primary.get(BUCKET, KEY).as_deref(), Some(&b"new"[..]));
        assert!(fallback.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_object_hits_both() {
        let primary = StubPersistor::with_object(BUCKET, KEY, "p");
        let fallback = StubPersistor::with_object(FALLBACK_BUCKET, KEY, "f");
        let persistor = migration(&primary, &fallback, false);

        persistor.delete_object(BUCKET, KEY).await.unwrap();
        assert!(primary.get(BUCKET, KEY).is_none());
        assert!(fallback.get(FALLBACK_BUCKET, KEY).is_none());
    }

    #[tokio::test]
    async fn test_delete_errors_are_reported() {
        let primary = StubPersistor::failing(ErrorKind::Write);
        let fallback = StubPersistor::empty();
        let err = migration(&primary, &fallback, false)
            .delete_object(BUCKET, KEY)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Write);
        assert_eq!(fallback.calls("delete_object").len(), 1);

        let primary = StubPersistor::empty();
        let fallback = StubPersistor::failing(ErrorKind::Write);
        let err = migration(&primary, &fallback, false)
            .delete_object(BUCKET, KEY)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Write);
        assert_eq!(primary.calls("delete_object").len(), 1);
    }

    #[tokio::test]
    async fn test_copy_object_on_primary() {
        let primary = StubPersistor::with_object(BUCKET, KEY, "p");
        let fallback = StubPersistor::empty();
        let persistor = migration(&primary, &fallback, false);

        persistor.copy_object(BUCKET, KEY, "dest").await.unwrap();
        assert_eq!(primary.get(BUCKET, "dest").as_deref(), Some(&b"p"[..]));
        assert!(fallback.calls("get_object_stream").is_empty());
    }

    #[tokio::test]
    async fn test_copy_object_from_fallback() {
        let primary = StubPersistor::empty();
        let fallback = StubPersistor::with_object(FALLBACK_BUCKET, KEY, "old copy");
        let persistor = migration(&primary, &fallback, false);

        persistor.copy_object(BUCKET, KEY, "dest").await.unwrap();
        assert_eq!(primary.get(BUCKET, "dest").as_deref(), Some(&b"old copy"[..]));
        assert!(primary.get(BUCKET, KEY).is_none());
        assert!(fallback.calls("copy_object").is_empty());
    }

    #[tokio::test]
    async fn test_copy_object_missing_everywhere() {
        let persistor = migration(&StubPersistor::empty(), &StubPersistor::empty(), false);
        let err = persistor.copy_object(BUCKET, KEY, "dest").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_exists_checks_fallback() {
        let primary = StubPersistor::empty();
        let fallback = StubPersistor::with_object(FALLBACK_BUCKET, KEY, "f");
        let persistor = migration(&primary, &fallback, false);

        assert!(persistor.check_if_object_exists(BUCKET, KEY).await.unwrap());
        assert!(!persistor.check_if_object_exists(BUCKET, "other").await.unwrap());
    }

    #[tokio::test]
    async fn test_redirect_url_prefers_primary() {
        let primary = StubPersistor::with_object(BUCKET, KEY, "p");
        let fallback = StubPersistor::empty();
        let persistor = migration(&primary, &fallback, false);
        assert_eq!(
            persistor.get_redirect_url(BUCKET, KEY).await.unwrap().as_deref(),
            Some("stub://womBucket/monKey")
        );
        assert_eq!(
            persistor.get_redirect_url(BUCKET, "other").await.unwrap().as_deref(),
            Some("stub://bucKangaroo/other")
        );
    }

    #[tokio::test]
    async fn test_listings_are_merged() {
        let primary = StubPersistor::empty();
        primary.put(BUCKET, "dir/a", Bytes::from_static(b"new-a"));
        primary.put(BUCKET, "dir/b", Bytes::from_static(b"b"));
        let fallback = StubPersistor::empty();
        fallback.put(FALLBACK_BUCKET, "dir/a", Bytes::from_static(b"a"));
        fallback.put(FALLBACK_BUCKET, "dir/c", Bytes::from_static(b"cc"));
        let persistor = migration(&primary, &fallback, false);

        let keys = persistor.list_directory_keys(BUCKET, "dir").await.unwrap();
        assert_eq!(keys, vec!["dir/a", "dir/b", "dir/c"]);

        let stats = persistor.list_directory_stats(BUCKET, "dir").await.unwrap();
        let a = stats.iter().find(|stat| stat.key == "dir/a").unwrap();
        assert_eq!(a.size, 5);
        assert_eq!(stats.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_directory_hits_both() {
        let primary = StubPersistor::empty();
        primary.put(BUCKET, "dir/a", Bytes::from_static(b"a"));
        let fallback = StubPersistor::empty();
        fallback.put(FALLBACK_BUCKET, "dir/b", Bytes::from_static(b"b"));
        let persistor = migration(&primary, &fallback, false);

        persistor.delete_directory(BUCKET, "dir").await.unwrap();
        assert!(primary.get(BUCKET, "dir/a").is_none());
        assert!(fallback.get(FALLBACK_BUCKET, "dir/b").is_none());
    }

    #[tokio::test]
    async fn test_unmapped_location_keeps_name() {
        let primary = StubPersistor::empty();
        let fallback = StubPersistor::with_object("plain", KEY, "f");
        let persistor = migration(&primary, &fallback, false);
        assert_eq!(persistor.get_object_size("plain", KEY).await.unwrap(), 1);
    }
}
