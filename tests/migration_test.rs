//! Migration between two real filesystem persistors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use persistor::storage::fs::{FsPersistor, FsSettings};
use persistor::storage::migration::{MigrationPersistor, MigrationSettings};
use persistor::storage::{GetOptions, Persistor, SendOptions};
use persistor::stream::{from_bytes, ObjectStream};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    old: Arc<FsPersistor>,
    new: Arc<FsPersistor>,
    old_location: String,
    new_location: String,
    migration: MigrationPersistor,
}

fn fixture(copy_on_miss: bool) -> Fixture {
    let dir = TempDir::new().unwrap();
    let old_location = dir.path().join("old-bucket").display().to_string();
    let new_location = dir.path().join("new-bucket").display().to_string();
    std::fs::create_dir_all(&old_location).unwrap();
    std::fs::create_dir_all(&new_location).unwrap();

    let settings = |name: &str| FsSettings {
        upload_folder: dir.path().join(name),
        use_subdirectories: true,
    };
    let old = Arc::new(FsPersistor::new(settings("old-uploads")).unwrap());
    let new = Arc::new(FsPersistor::new(settings("new-uploads")).unwrap());

    let migration = MigrationPersistor::new(
        new.clone(),
        old.clone(),
        MigrationSettings {
            buckets: HashMap::from([(new_location.clone(), old_location.clone())]),
            copy_on_miss,
        },
    );

    Fixture {
        _dir: dir,
        old,
        new,
        old_location,
        new_location,
        migration,
    }
}

async fn read_all(stream: ObjectStream) -> Vec<u8> {
    let chunks: Vec<_> = stream.collect().await;
    chunks.into_iter().flat_map(|chunk| chunk.unwrap().to_vec()).collect()
}

#[tokio::test]
async fn test_lazy_migration_on_read() {
    let f = fixture(true);
    f.old
        .send_stream(&f.old_location, "project/file", from_bytes("legacy"), SendOptions::default())
        .await
        .unwrap();

    let body = f
        .migration
        .get_object_stream(&f.new_location, "project/file", GetOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(body).await, b"legacy");

    let mut migrated = false;
    for _ in 0..100 {
        if f.new.check_if_object_exists(&f.new_location, "project/file").await.unwrap() {
            migrated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(migrated, "object should be copied into the new backend");
    assert_eq!(
        f.new.get_object_md5_hash(&f.new_location, "project/file").await.unwrap(),
        f.old.get_object_md5_hash(&f.old_location, "project/file").await.unwrap()
    );
}

#[tokio::test]
async fn test_writes_and_deletes() {
    let f = fixture(false);
    f.old
        .send_stream(&f.old_location, "k", from_bytes("old"), SendOptions::default())
        .await
        .unwrap();

    f.migration
        .send_stream(&f.new_location, "k", from_bytes("new"), SendOptions::default())
        .await
        .unwrap();
    let body = f
        .migration
        .get_object_stream(&f.new_location, "k", GetOptions::default())
        .await
        .unwrap();
    assert_eq!(read_all(body).await, b"new");

    f.migration.delete_object(&f.new_location, "k").await.unwrap();
    assert!(!f.new.check_if_object_exists(&f.new_location, "k").await.unwrap());
    assert!(!f.old.check_if_object_exists(&f.old_location, "k").await.unwrap());
}

#[tokio::test]
async fn test_miss_everywhere() {
    let f = fixture(true);
    let err = f
        .migration
        .get_object_stream(&f.new_location, "ghost", GetOptions::default())
        .await
        .err()
        .unwrap();
    assert!(err.is_not_found());
    assert!(!f.migration.check_if_object_exists(&f.new_location, "ghost").await.unwrap());
}
