use std::io::Cursor;
use std::sync::{Arc, Mutex};

use attachment_queue::db::{self, AttachmentRepository};
use attachment_queue::reconcile::reconcile;
use attachment_queue::store::LocalFileStore;
use attachment_queue::{Attachment, AttachmentState, WatchedAttachmentItem};

fn setup(dir: &std::path::Path) -> (AttachmentRepository, LocalFileStore) {
    let conn = db::open(&dir.join("state.sqlite3")).expect("open db");
    let repo =
        AttachmentRepository::new(Arc::new(Mutex::new(conn)), "attachments").expect("repository");
    let store = LocalFileStore::new(dir.join("attachments")).expect("store");
    (repo, store)
}

fn row(id: &str, state: AttachmentState) -> Attachment {
    Attachment {
        id: id.to_string(),
        filename: format!("{id}.jpg"),
        media_type: None,
        state,
        timestamp: 0,
        size: None,
        has_synced: matches!(state, AttachmentState::Synced | AttachmentState::Archived),
        meta_data: None,
        local_uri: None,
    }
}

fn item(id: &str) -> WatchedAttachmentItem {
    WatchedAttachmentItem {
        id: id.to_string(),
        file_extension: Some("jpg".to_string()),
        media_type: Some("image/jpeg".to_string()),
    }
}

#[test]
fn unknown_referenced_id_is_queued_for_download() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (repo, store) = setup(tmp.path());

    let changed = reconcile(&repo, &store, &[item("b")], true).expect("reconcile");
    assert_eq!(changed.len(), 1);

    let created = repo.get("b").expect("get").expect("row");
    assert_eq!(created.state, AttachmentState::QueuedDownload);
    assert_eq!(created.filename, "b.jpg");
    assert_eq!(created.media_type.as_deref(), Some("image/jpeg"));
    assert!(!created.has_synced);
}

#[test]
fn downloads_are_not_scheduled_when_disabled() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (repo, store) = setup(tmp.path());

    let changed = reconcile(&repo, &store, &[item("b")], false).expect("reconcile");
    assert!(changed.is_empty());
    assert!(repo.get("b").expect("get").is_none());
}

#[test]
fn archived_id_restores_to_synced_when_file_survived() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (repo, store) = setup(tmp.path());

    repo.save(&row("a", AttachmentState::Archived)).expect("save");
    store
        .write("a.jpg", &mut Cursor::new(vec![9u8]))
        .expect("write file");

    reconcile(&repo, &store, &[item("a")], true).expect("reconcile");

    let restored = repo.get("a").expect("get").expect("row");
    assert_eq!(restored.state, AttachmentState::Synced);
    assert!(restored.has_synced);
    assert!(store.exists("a.jpg"));
}

#[test]
fn archived_id_without_file_is_queued_for_download() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (repo, store) = setup(tmp.path());

    repo.save(&row("a", AttachmentState::Archived)).expect("save");

    reconcile(&repo, &store, &[item("a")], true).expect("reconcile");

    let restored = repo.get("a").expect("get").expect("row");
    assert_eq!(restored.state, AttachmentState::QueuedDownload);
}

#[test]
fn unreferenced_rows_archive_drop_or_stay_by_state() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (repo, store) = setup(tmp.path());

    repo.save(&row("synced", AttachmentState::Synced)).expect("save");
    repo.save(&row("pending_dl", AttachmentState::QueuedDownload))
        .expect("save");
    repo.save(&row("pending_up", AttachmentState::QueuedUpload))
        .expect("save");
    repo.save(&row("pending_rm", AttachmentState::QueuedDelete))
        .expect("save");
    repo.save(&row("shelved", AttachmentState::Archived)).expect("save");

    reconcile(&repo, &store, &[], true).expect("reconcile");

    let state = |id: &str| repo.get(id).expect("get").map(|a| a.state);
    assert_eq!(state("synced"), Some(AttachmentState::Archived));
    assert_eq!(state("pending_dl"), None, "queued download is dropped");
    assert_eq!(state("pending_up"), Some(AttachmentState::QueuedUpload));
    assert_eq!(state("pending_rm"), Some(AttachmentState::QueuedDelete));
    assert_eq!(state("shelved"), Some(AttachmentState::Archived));
}

#[test]
fn reconciling_an_unchanged_set_is_a_no_op() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (repo, store) = setup(tmp.path());

    let mut synced = row("a", AttachmentState::Synced);
    synced.has_synced = true;
    repo.save(&synced).expect("save");

    let first = reconcile(&repo, &store, &[item("a")], true).expect("first");
    assert!(first.is_empty());

    let before = repo.get("a").expect("get").expect("row");
    let second = reconcile(&repo, &store, &[item("a")], true).expect("second");
    assert!(second.is_empty());
    let after = repo.get("a").expect("get").expect("row");
    assert_eq!(before.timestamp, after.timestamp, "row untouched");
}

#[test]
fn later_emissions_never_change_an_existing_filename() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (repo, store) = setup(tmp.path());

    repo.save(&row("a", AttachmentState::Synced)).expect("save");

    let mut renamed = item("a");
    renamed.file_extension = Some("png".to_string());
    reconcile(&repo, &store, &[renamed], true).expect("reconcile");

    let unchanged = repo.get("a").expect("get").expect("row");
    assert_eq!(unchanged.filename, "a.jpg");
}
