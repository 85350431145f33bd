use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dav_storage_core::{
    DavStorage, EntryKind, MkColResult, ResumableDav, SaveOutcome, StorageConfig, StorageError,
};
use dav_storage_local::{FileLockTable, LocalBackend};
use futures::stream::{self, StreamExt, TryStreamExt};
use tempfile::TempDir;

fn open_storage(temp: &TempDir, config: StorageConfig) -> DavStorage {
    DavStorage::new(
        Arc::new(LocalBackend::new()),
        Arc::new(FileLockTable::new(temp.path().join("locks"))),
        Arc::new(config),
    )
}

fn setup() -> (DavStorage, TempDir) {
    let temp = TempDir::new().unwrap();
    let config = StorageConfig::new(temp.path().join("files"))
        .with_base_url("https://files.example.com/media");
    (open_storage(&temp, config), temp)
}

fn saved(name: &str) -> SaveOutcome {
    SaveOutcome::Saved {
        name: name.to_string(),
    }
}

#[tokio::test]
async fn test_save_collision_picks_alternative_name() {
    let (storage, _temp) = setup();

    let first = storage.save("report.txt", b"hello world!").await.unwrap();
    assert_eq!(first, saved("report.txt"));

    let second = storage.save("report.txt", b"second version").await.unwrap();
    assert_eq!(second, saved("report_1.txt"));

    let third = storage.save("report.txt", b"third version").await.unwrap();
    assert_eq!(third, saved("report_2.txt"));

    assert_eq!(
        storage.safe_read("report.txt").await.unwrap().unwrap(),
        b"hello world!"
    );
    assert_eq!(
        storage.safe_read("report_1.txt").await.unwrap().unwrap(),
        b"second version"
    );
    assert!(!storage.is_locked("report.txt").await.unwrap());
}

#[tokio::test]
async fn test_save_creates_missing_parents() {
    let (storage, _temp) = setup();

    let outcome = storage.save("a/b/c.txt", b"nested").await.unwrap();
    assert_eq!(outcome, saved("a/b/c.txt"));

    let (dirs, files) = storage.list_dir("a").await.unwrap();
    assert_eq!(dirs, vec!["b".to_string()]);
    assert!(files.is_empty());

    let (dirs, files) = storage.list_dir("a/b").await.unwrap();
    assert!(dirs.is_empty());
    assert_eq!(files, vec!["c.txt".to_string()]);
}

#[tokio::test]
async fn test_save_under_a_file_is_fatal() {
    let (storage, _temp) = setup();
    storage.save("plain", b"x").await.unwrap();

    let err = storage.save("plain/child.txt", b"y").await.unwrap_err();
    assert!(matches!(err, StorageError::NotADirectory(_)), "{:?}", err);

    // The gate was released: a retry fails the same way instead of reporting contention
    let err = storage.save("plain/child.txt", b"y").await.unwrap_err();
    assert!(matches!(err, StorageError::NotADirectory(_)));
}

#[tokio::test]
async fn test_save_stream_writes_every_chunk() {
    let (storage, _temp) = setup();
    let chunks = vec![
        Ok(Bytes::from_static(b"alpha ")),
        Ok(Bytes::from_static(b"beta ")),
        Ok(Bytes::from_static(b"gamma")),
    ];

    let outcome = storage
        .save_stream("stream.txt", stream::iter(chunks).boxed())
        .await
        .unwrap();
    assert_eq!(outcome, saved("stream.txt"));
    assert_eq!(
        storage.safe_read("stream.txt").await.unwrap().unwrap(),
        b"alpha beta gamma"
    );
}

#[tokio::test]
async fn test_failed_save_stream_leaves_nothing_behind() {
    let (storage, _temp) = setup();
    let chunks = vec![
        Ok(Bytes::from_static(b"partial")),
        Err(StorageError::Io("source went away".to_string())),
    ];

    let err = storage
        .save_stream("broken.txt", stream::iter(chunks).boxed())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Io(_)));
    assert!(!storage.exists("broken.txt").await.unwrap());

    // Nothing is left locked
    let outcome = storage.save("broken.txt", b"complete").await.unwrap();
    assert_eq!(outcome, saved("broken.txt"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_save_keeps_backslash_in_file_name() {
    let (storage, _temp) = setup();

    let outcome = storage.save("a\\b.txt", b"x").await.unwrap();
    assert_eq!(outcome, saved("a/b.txt"));

    assert!(storage.path("a\\b.txt").unwrap().is_file());
    assert!(!storage.exists("a").await.unwrap());
    assert!(!storage.exists("a/b.txt").await.unwrap());
}

#[tokio::test]
async fn test_save_reports_holder_when_in_use() {
    let (storage, _temp) = setup();
    storage.lock("busy.txt", "alice").await.unwrap();

    let outcome = storage.save("busy.txt", b"data").await.unwrap();
    assert_eq!(
        outcome,
        SaveOutcome::InUse {
            holder: Some("alice".to_string())
        }
    );
    assert!(!outcome.is_saved());
    assert!(!storage.exists("busy.txt").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_saves_get_distinct_names() {
    use tokio::sync::Barrier;

    let (storage, _temp) = setup();
    let storage = Arc::new(storage);

    const NUM_TASKS: usize = 8;
    let barrier = Arc::new(Barrier::new(NUM_TASKS));
    let mut handles = vec![];

    for i in 0..NUM_TASKS {
        let storage = Arc::clone(&storage);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            let content = format!("content from task {}", i);
            barrier.wait().await;

            for attempt in 0..200u64 {
                if attempt > 0 {
                    tokio::time::sleep(Duration::from_millis(5 + attempt)).await;
                }
                match storage.save("same.txt", content.as_bytes()).await.expect("save failed") {
                    SaveOutcome::Saved { name } => return (name, content),
                    SaveOutcome::InUse { .. } => continue,
                }
            }
            panic!("task {} never got to save", i);
        }));
    }

    let mut names = HashSet::new();
    for handle in handles {
        let (name, content) = handle.await.expect("task panicked");
        assert_eq!(
            storage.safe_read(&name).await.unwrap().unwrap(),
            content.as_bytes(),
            "{} holds another caller's content",
            name
        );
        names.insert(name);
    }
    assert_eq!(names.len(), NUM_TASKS);
}

#[tokio::test]
async fn test_lock_and_unlock_through_storage() {
    let (storage, _temp) = setup();

    let first = storage.lock("doc.txt", "alice").await.unwrap();
    assert!(first.acquired);

    let second = storage.lock("doc.txt", "bob").await.unwrap();
    assert!(!second.acquired);
    assert_eq!(second.current_holder.as_deref(), Some("alice"));

    // Not re-entrant
    assert!(!storage.lock("doc.txt", "alice").await.unwrap().acquired);

    let previous = storage.unlock("doc.txt", "bob").await.unwrap();
    assert_eq!(previous.as_deref(), Some("alice"));
    assert!(storage.is_locked("doc.txt").await.unwrap());

    storage.unlock("doc.txt", "alice").await.unwrap();
    assert!(!storage.is_locked("doc.txt").await.unwrap());
}

#[tokio::test]
async fn test_lock_expires_after_ttl() {
    let temp = TempDir::new().unwrap();
    let config = StorageConfig::new(temp.path().join("files")).with_max_lock_seconds(1);
    let storage = open_storage(&temp, config);

    storage.lock("doc.txt", "alice").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert!(!storage.is_locked("doc.txt").await.unwrap());
    assert!(storage.lock("doc.txt", "bob").await.unwrap().acquired);
}

#[tokio::test]
async fn test_append_blocked_by_other_identity() {
    let (storage, _temp) = setup();
    storage.save("log.txt", b"line 1\n").await.unwrap();
    storage.lock("log.txt", "alice").await.unwrap();

    assert!(!storage.append("log.txt", b"from bob\n", "bob").await.unwrap());
    assert_eq!(
        storage.safe_read("log.txt").await.unwrap().unwrap(),
        b"line 1\n"
    );

    // The holder itself may append, and keeps the lock
    assert!(storage.append("log.txt", b"line 2\n", "alice").await.unwrap());
    assert_eq!(
        storage.safe_read("log.txt").await.unwrap().unwrap(),
        b"line 1\nline 2\n"
    );
    assert!(storage.is_locked("log.txt").await.unwrap());
}

#[tokio::test]
async fn test_append_creates_and_releases() {
    let (storage, _temp) = setup();

    assert!(storage.append("new/log.txt", b"a", "alice").await.unwrap());
    assert!(storage.append("new/log.txt", b"b", "bob").await.unwrap());

    assert_eq!(storage.safe_read("new/log.txt").await.unwrap().unwrap(), b"ab");
    assert!(!storage.is_locked("new/log.txt").await.unwrap());
}

#[tokio::test]
async fn test_lock_table_shared_between_instances() {
    let temp = TempDir::new().unwrap();
    let config = StorageConfig::new(temp.path().join("files"));
    let first = open_storage(&temp, config.clone());
    let second = open_storage(&temp, config);

    first.save("shared.txt", b"base").await.unwrap();
    first.lock("shared.txt", "alice").await.unwrap();

    assert!(!second.append("shared.txt", b"!", "bob").await.unwrap());
    assert!(!second.delete("shared.txt", "bob").await.unwrap());
    assert_eq!(second.size("shared.txt").await.unwrap(), 4);
}

#[tokio::test]
async fn test_delete() {
    let (storage, _temp) = setup();
    storage.save("gone.txt", b"bye").await.unwrap();

    assert!(storage.delete("gone.txt", "alice").await.unwrap());
    assert!(!storage.exists("gone.txt").await.unwrap());
    assert!(!storage.delete("gone.txt", "alice").await.unwrap());
    assert!(!storage.is_locked("gone.txt").await.unwrap());
}

#[tokio::test]
async fn test_delete_refused_while_locked() {
    let (storage, _temp) = setup();
    storage.save("kept.txt", b"stay").await.unwrap();
    storage.lock("kept.txt", "alice").await.unwrap();

    assert!(!storage.delete("kept.txt", "bob").await.unwrap());
    assert!(storage.exists("kept.txt").await.unwrap());
}

#[tokio::test]
async fn test_move_requires_lock() {
    let (storage, _temp) = setup();
    storage.save("a.txt", b"moving").await.unwrap();

    // Not locked by anyone
    assert!(!storage.move_to("a.txt", "b.txt", "alice").await.unwrap());

    storage.lock("a.txt", "alice").await.unwrap();
    assert!(!storage.move_to("a.txt", "b.txt", "bob").await.unwrap());
    assert!(storage.exists("a.txt").await.unwrap());
    assert!(!storage.exists("b.txt").await.unwrap());
}

#[tokio::test]
async fn test_move_transfers_content_and_unlocks() {
    let (storage, _temp) = setup();
    storage.save("a.txt", b"moving").await.unwrap();
    storage.lock("a.txt", "alice").await.unwrap();

    assert!(storage.move_to("a.txt", "archive/b.txt", "alice").await.unwrap());

    assert!(!storage.exists("a.txt").await.unwrap());
    assert_eq!(
        storage.safe_read("archive/b.txt").await.unwrap().unwrap(),
        b"moving"
    );
    assert!(!storage.is_locked("a.txt").await.unwrap());
    assert!(!storage.is_locked("archive/b.txt").await.unwrap());
}

#[tokio::test]
async fn test_move_refused_onto_destination_locked_by_other() {
    let (storage, _temp) = setup();
    storage.save("a.txt", b"alice").await.unwrap();
    storage.save("b.txt", b"bob").await.unwrap();
    storage.lock("b.txt", "bob").await.unwrap();
    storage.lock("a.txt", "alice").await.unwrap();

    assert!(!storage.append("b.txt", b"!", "alice").await.unwrap());
    assert!(!storage.move_to("a.txt", "b.txt", "alice").await.unwrap());

    assert_eq!(storage.safe_read("b.txt").await.unwrap().unwrap(), b"bob");
    assert_eq!(storage.safe_read("a.txt").await.unwrap().unwrap(), b"alice");
    let holder = storage.lock("a.txt", "bob").await.unwrap();
    assert_eq!(holder.current_holder.as_deref(), Some("alice"));

    // Allowed once the destination belongs to the mover
    storage.unlock("b.txt", "bob").await.unwrap();
    storage.lock("b.txt", "alice").await.unwrap();
    assert!(storage.move_to("a.txt", "b.txt", "alice").await.unwrap());
    assert_eq!(storage.safe_read("b.txt").await.unwrap().unwrap(), b"alice");
}

#[tokio::test]
async fn test_move_missing_source_fails_and_unlocks() {
    let (storage, _temp) = setup();
    storage.lock("ghost.txt", "alice").await.unwrap();

    let err = storage.move_to("ghost.txt", "b.txt", "alice").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!storage.is_locked("ghost.txt").await.unwrap());
}

#[tokio::test]
async fn test_mk_collection_twice() {
    let (storage, _temp) = setup();

    assert_eq!(
        storage.mk_collection("docs", "alice").await.unwrap(),
        MkColResult::created()
    );
    assert_eq!(
        storage.mk_collection("docs", "alice").await.unwrap(),
        MkColResult::not_created()
    );
    assert!(storage.exists("docs").await.unwrap());
    assert_eq!(storage.size("docs").await.unwrap(), 0);
    assert!(!storage.is_locked("docs").await.unwrap());
}

#[tokio::test]
async fn test_mk_collection_reports_errors_as_data() {
    let (storage, _temp) = setup();
    storage.save("plain", b"x").await.unwrap();

    let result = storage.mk_collection("plain/docs", "alice").await.unwrap();
    assert!(!result.created);
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_mk_collection_refused_while_locked() {
    let (storage, _temp) = setup();
    storage.lock("docs", "bob").await.unwrap();

    let result = storage.mk_collection("docs", "alice").await.unwrap();
    assert_eq!(result, MkColResult::not_created());
    assert!(!storage.exists("docs").await.unwrap());
}

#[tokio::test]
async fn test_propfind() {
    let temp = TempDir::new().unwrap();
    let config = StorageConfig::new(temp.path().join("files")).with_file_permissions_mode(0o640);
    let storage = open_storage(&temp, config);
    storage.save("my report.txt", b"12345").await.unwrap();

    let props = storage.propfind("my report.txt").await.unwrap();
    assert_eq!(props.name, "my report.txt");
    assert_eq!(props.valid_name, "my_report.txt");
    assert_eq!(props.path, storage.path("my report.txt").unwrap());
    assert_eq!(props.entry.size, 5);
    assert_eq!(props.entry.kind, EntryKind::File);
    #[cfg(unix)]
    assert_eq!(props.entry.mode, 0o640);
    assert!(props.entry.modified_at <= chrono::Utc::now());

    assert!(storage.propfind("missing.txt").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_safe_read_missing() {
    let (storage, _temp) = setup();
    assert!(storage.safe_read("missing.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn test_safe_read_chunk_clamps() {
    let (storage, _temp) = setup();
    storage.save("data.bin", b"0123456789").await.unwrap();

    let chunk = storage.safe_read_chunk("data.bin", 2, 3).await.unwrap();
    assert_eq!(chunk.data, b"234");
    assert_eq!(chunk.bytes_read, 3);

    let tail = storage.safe_read_chunk("data.bin", 8, 100).await.unwrap();
    assert_eq!(tail.data, b"89");
    assert_eq!(tail.bytes_read, 2);

    for offset in [10, 11, 1_000] {
        let empty = storage.safe_read_chunk("data.bin", offset, 4).await.unwrap();
        assert!(empty.data.is_empty());
        assert_eq!(empty.bytes_read, 0);
    }

    let missing = storage.safe_read_chunk("missing.bin", 0, 4).await.unwrap();
    assert_eq!(missing.bytes_read, 0);
}

#[tokio::test]
async fn test_download_reassembles_file() {
    let (storage, _temp) = setup();
    let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    storage.save("big.bin", &content).await.unwrap();

    let mut download = storage.download("big.bin", 64).await.unwrap();
    assert_eq!(download.size(), 1000);

    let mut assembled = Vec::new();
    let mut last_offset = 0;
    while let Some(chunk) = download.next_chunk().await.unwrap() {
        assert!(chunk.bytes_read <= 64);
        assert_eq!(chunk.offset, last_offset + chunk.bytes_read as u64);
        last_offset = chunk.offset;
        assembled.extend_from_slice(&chunk.data);
    }

    assert_eq!(assembled, content);
    assert_eq!(last_offset, 1000);
    assert!(!download.has_next());
    assert!(download.next_chunk().await.unwrap().is_none());
}

#[tokio::test]
async fn test_download_stream_and_restart() {
    let (storage, _temp) = setup();
    storage.save("small.txt", b"abcdefg").await.unwrap();

    let chunks: Vec<_> = storage
        .download("small.txt", 3)
        .await
        .unwrap()
        .into_stream()
        .try_collect()
        .await
        .unwrap();
    let sizes: Vec<_> = chunks.iter().map(|c| c.bytes_read).collect();
    assert_eq!(sizes, vec![3, 3, 1]);
    assert_eq!(chunks.last().unwrap().offset, 7);

    // A fresh download starts over from offset 0
    let mut again = storage.download("small.txt", 3).await.unwrap();
    assert_eq!(again.offset(), 0);
    assert_eq!(again.next_chunk().await.unwrap().unwrap().data, b"abc");
}

#[tokio::test]
async fn test_download_ignores_growth() {
    let (storage, _temp) = setup();
    storage.save("grow.txt", b"1234").await.unwrap();

    let mut download = storage.download("grow.txt", 2).await.unwrap();
    download.next_chunk().await.unwrap();
    storage.append("grow.txt", b"5678", "alice").await.unwrap();

    let mut rest = Vec::new();
    while let Some(chunk) = download.next_chunk().await.unwrap() {
        rest.extend_from_slice(&chunk.data);
    }
    assert_eq!(rest, b"34");
    assert_eq!(download.offset(), 4);
}

#[tokio::test]
async fn test_download_argument_errors() {
    let (storage, _temp) = setup();
    storage.save("x.txt", b"x").await.unwrap();

    let err = storage.download("x.txt", 0).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument(_)));
    assert!(storage.download("missing.txt", 8).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_traversal_rejected_before_io() {
    let (storage, temp) = setup();

    let err = storage.save("../escape.txt", b"nope").await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidPath(_)));
    assert!(!temp.path().join("escape.txt").exists());

    assert!(matches!(
        storage.append("../../etc/passwd", b"x", "alice").await,
        Err(StorageError::InvalidPath(_))
    ));
    assert!(matches!(
        storage.safe_read("docs/../../x").await,
        Err(StorageError::InvalidPath(_))
    ));
}

#[tokio::test]
async fn test_url_and_path() {
    let (storage, temp) = setup();

    assert_eq!(
        storage.url("docs/a b.txt").unwrap(),
        "https://files.example.com/media/docs/a%20b.txt"
    );
    assert!(storage.path("docs/a.txt").unwrap().ends_with("files/docs/a.txt"));

    let private = open_storage(&temp, StorageConfig::new(temp.path().join("files")));
    assert!(matches!(
        private.url("a.txt"),
        Err(StorageError::NotPubliclyAccessible(_))
    ));
    assert_eq!(private.backend_name(), "local");
}

#[tokio::test]
async fn test_list_dir_of_file_is_empty() {
    let (storage, _temp) = setup();
    storage.save("only.txt", b"x").await.unwrap();

    let (dirs, files) = storage.list_dir("only.txt").await.unwrap();
    assert!(dirs.is_empty() && files.is_empty());

    let (_, files) = storage.list_dir("").await.unwrap();
    assert_eq!(files, vec!["only.txt".to_string()]);
}

#[tokio::test]
async fn test_times() {
    let (storage, _temp) = setup();
    let before = chrono::Utc::now() - chrono::Duration::seconds(5);
    storage.save("t.txt", b"x").await.unwrap();

    assert!(storage.modified_time("t.txt").await.unwrap() >= before);
    assert!(storage.accessed_time("t.txt").await.unwrap() >= before);
    assert!(storage.created_time("t.txt").await.unwrap() >= before);
}
