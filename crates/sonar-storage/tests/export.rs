//! Export tests for sonar-storage
//!
//! Exports are reopened as stores and compared against the source.

use std::io::Write;
use std::path::Path;

use rand::RngCore;
use sonar_core::{Level, NetworkRequest, NetworkResponse};
use sonar_storage::{
    ContentKey, DocumentKind, EventStore, ExportFormat, ExportOptions, MessageRecord, OpenOptions,
    Query, StoreConfig, StoreError, StoreMessage, StoreRequest,
};
use tempfile::TempDir;

fn random_body(len: usize) -> Vec<u8> {
    let mut body = vec![0u8; len];
    rand::rng().fill_bytes(&mut body);
    body
}

fn config() -> StoreConfig {
    StoreConfig::default().with_inline_limit(256)
}

fn blob_names(store_path: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(store_path.join("blobs"))
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn texts(messages: &[MessageRecord]) -> Vec<String> {
    let mut texts: Vec<String> = messages.iter().map(|m| m.text.clone()).collect();
    texts.sort();
    texts
}

/// A source store with mixed levels and two tasks with file bodies.
/// Returns the store with the bodies of the failed and successful task.
async fn populated(path: &Path) -> (EventStore, Vec<u8>, Vec<u8>) {
    let store = EventStore::open(path, OpenOptions::CREATE, config()).await.unwrap();

    store.store_message(StoreMessage::new(Level::Debug, "app", "noise"));
    store.store_message(StoreMessage::new(Level::Warning, "app", "disk almost full"));
    store.store_message(StoreMessage::new(Level::Critical, "app", "crashed"));

    let failed_body = random_body(1024);
    store.store_request(
        StoreRequest::new(NetworkRequest::new("https://api.example.com/fail"))
            .with_response(NetworkResponse::new(500))
            .with_response_body(failed_body.clone()),
    );
    let ok_body = random_body(1024);
    store.store_request(
        StoreRequest::new(NetworkRequest::new("https://api.example.com/ok"))
            .with_response(NetworkResponse::new(200))
            .with_response_body(ok_body.clone()),
    );
    store.flush().await.unwrap();

    (store, failed_body, ok_body)
}

#[tokio::test]
async fn test_predicate_export_fidelity() {
    let temp = TempDir::new().unwrap();
    let (source, failed_body, _) = populated(&temp.path().join("source.sonar")).await;
    let keep = |m: &MessageRecord| m.level >= Level::Warning;

    let target = temp.path().join("filtered.sonar");
    let info = source
        .export(&target, ExportOptions::new().with_predicate(keep))
        .await
        .unwrap();
    assert_eq!(info.task_count, 1);
    assert_eq!(info.blob_count, 1);
    assert_ne!(info.store_id, source.store_id());

    let expected = texts(&source.messages(&Query::<MessageRecord>::new().filter(keep)).unwrap());
    source.close().await.unwrap();

    let exported = EventStore::open(&target, OpenOptions::empty(), config()).await.unwrap();
    assert_eq!(exported.kind(), Some(DocumentKind::Package));
    assert_eq!(texts(&exported.messages(&Query::new()).unwrap()), expected);

    // Only the failed task's body came along
    let failed_key = ContentKey::from_data(&failed_body);
    assert_eq!(blob_names(&target), vec![failed_key.to_hex()]);
    let data = exported.blob_data(&failed_key).await.unwrap().unwrap();
    assert_eq!(data.as_ref(), failed_body.as_slice());

    exported.close().await.unwrap();
}

#[tokio::test]
async fn test_session_export() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("source.sonar");

    let old_session = {
        let store = EventStore::open(&path, OpenOptions::CREATE, config()).await.unwrap();
        store.store_message(StoreMessage::new(Level::Info, "app", "previous run"));
        store.close().await.unwrap();
        store.session_id()
    };

    let store = EventStore::open(&path, OpenOptions::CREATE, config()).await.unwrap();
    store.store_message(StoreMessage::new(Level::Info, "app", "this run"));

    let target = temp.path().join("current.sonar");
    store
        .export(&target, ExportOptions::new().with_sessions([store.session_id()]))
        .await
        .unwrap();
    let current_session = store.session_id();
    store.close().await.unwrap();

    let exported = EventStore::open(&target, OpenOptions::READONLY, config()).await.unwrap();
    let messages = exported.messages(&Query::new()).unwrap();
    assert_eq!(texts(&messages), vec!["this run".to_string()]);
    let sessions = exported.sessions(&Query::new()).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, current_session);
    assert_ne!(sessions[0].id, old_session);

    exported.close().await.unwrap();
}

#[tokio::test]
async fn test_archive_is_readonly_with_embedded_info() {
    let temp = TempDir::new().unwrap();
    let (source, failed_body, ok_body) = populated(&temp.path().join("source.sonar")).await;

    let target = temp.path().join("export.sonarz");
    let info = source
        .export(&target, ExportOptions::new().with_format(ExportFormat::Archive))
        .await
        .unwrap();
    assert!(info.archived_date.is_some());
    assert_eq!(info.message_count, 3);
    assert_eq!(info.task_count, 2);
    assert!(target.is_file());
    source.close().await.unwrap();

    let archive = EventStore::open(&target, OpenOptions::empty(), config()).await.unwrap();
    assert!(archive.is_readonly());
    assert_eq!(archive.kind(), Some(DocumentKind::Archive));
    assert_eq!(archive.info().await.unwrap(), info);

    assert_eq!(archive.messages(&Query::new()).unwrap().len(), 5);
    for body in [&failed_body, &ok_body] {
        let data = archive.blob_data(&ContentKey::from_data(body)).await.unwrap().unwrap();
        assert_eq!(data.as_ref(), body.as_slice());
    }

    assert!(matches!(archive.sweep().await, Err(StoreError::DocumentReadonly)));
    assert!(matches!(archive.remove_all().await, Err(StoreError::DocumentReadonly)));

    archive.close().await.unwrap();
}

fn extraction_dirs(store_id: uuid::Uuid) -> usize {
    let prefix = format!("sonar-{store_id}-");
    std::fs::read_dir(std::env::temp_dir())
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn test_archive_opened_twice() {
    let temp = TempDir::new().unwrap();
    let (source, _, ok_body) = populated(&temp.path().join("source.sonar")).await;
    let target = temp.path().join("export.sonarz");
    source
        .export(&target, ExportOptions::new().archive())
        .await
        .unwrap();
    source.close().await.unwrap();

    let first = EventStore::open(&target, OpenOptions::empty(), config()).await.unwrap();
    let second = EventStore::open(&target, OpenOptions::empty(), config()).await.unwrap();
    let store_id = first.store_id();
    assert_eq!(second.store_id(), store_id);
    assert_eq!(extraction_dirs(store_id), 2);

    first.close().await.unwrap();
    drop(first);
    assert_eq!(extraction_dirs(store_id), 1);

    // The second copy is unaffected by the first going away
    assert_eq!(second.messages(&Query::new()).unwrap().len(), 5);
    let data = second
        .blob_data(&ContentKey::from_data(&ok_body))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data.as_ref(), ok_body.as_slice());

    second.close().await.unwrap();
    drop(second);
    assert_eq!(extraction_dirs(store_id), 0);
}

#[tokio::test]
async fn test_export_refuses_existing_target() {
    let temp = TempDir::new().unwrap();
    let store = EventStore::in_memory(StoreConfig::default()).await.unwrap();

    let target = temp.path().join("taken");
    std::fs::create_dir(&target).unwrap();
    let err = store.export(&target, ExportOptions::new()).await.unwrap_err();
    assert!(matches!(err, StoreError::FileAlreadyExists(_)));

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_old_archive_is_unsupported() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("ancient.sonarz");

    let manifest = serde_json::json!({
        "storeId": uuid::Uuid::new_v4(),
        "version": "0.3.0",
        "createdDate": "2020-01-01T00:00:00Z",
        "lastSweepDate": null,
    });
    let mut zip = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
    zip.start_file("manifest.json", zip::write::SimpleFileOptions::default())
        .unwrap();
    zip.write_all(manifest.to_string().as_bytes()).unwrap();
    zip.finish().unwrap();

    let err = EventStore::open(&path, OpenOptions::empty(), config()).await.unwrap_err();
    match err {
        StoreError::UnsupportedVersion { found, minimum } => {
            assert_eq!(found, "0.3.0");
            assert_eq!(minimum, "1.0.0");
        }
        other => panic!("unexpected error: {other}"),
    }
}
