use std::collections::BTreeSet;
use std::fs;
use std::io::Cursor;

use attachment_queue::store::LocalFileStore;
use attachment_queue::LocalIoKind;

#[test]
fn write_streams_to_final_path_and_reports_size() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = LocalFileStore::new(tmp.path().join("attachments")).expect("store");

    let (path, size) = store
        .write("a.jpg", &mut Cursor::new(vec![1u8, 2, 3]))
        .expect("write");
    assert_eq!(size, 3);
    assert!(path.ends_with("a.jpg"));
    assert!(store.exists("a.jpg"));
    assert_eq!(store.size("a.jpg").expect("size"), 3);
    assert_eq!(store.read("a.jpg").expect("read"), vec![1, 2, 3]);

    let leftovers: Vec<_> = fs::read_dir(store.root())
        .expect("read dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "no temp files survive a write");
}

#[test]
fn remove_tolerates_missing_files() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = LocalFileStore::new(tmp.path().join("attachments")).expect("store");

    store
        .write("a.jpg", &mut Cursor::new(vec![0u8]))
        .expect("write");
    assert!(store.remove("a.jpg").expect("remove"));
    assert!(!store.remove("a.jpg").expect("second remove"));
    assert!(!store.exists("a.jpg"));

    let err = store.read("a.jpg").expect_err("read missing");
    assert_eq!(err.kind, LocalIoKind::NotFound);
}

#[test]
fn sweep_removes_temp_and_unreferenced_files_only() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = LocalFileStore::new(tmp.path().join("attachments")).expect("store");

    store
        .write("kept.jpg", &mut Cursor::new(vec![1u8]))
        .expect("write kept");
    store
        .write("orphan.png", &mut Cursor::new(vec![2u8]))
        .expect("write orphan");
    fs::write(store.root().join(".half-upload.tmp"), [3u8]).expect("write temp");

    let referenced: BTreeSet<String> = [String::from("kept.jpg")].into_iter().collect();
    let removed = store.sweep_orphans(&referenced).expect("sweep");

    assert_eq!(removed, 2);
    assert!(store.exists("kept.jpg"));
    assert!(!store.exists("orphan.png"));
    assert!(!store.root().join(".half-upload.tmp").exists());
}

#[test]
fn clear_empties_the_managed_directory() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = LocalFileStore::new(tmp.path().join("attachments")).expect("store");

    store.write("a", &mut Cursor::new(vec![1u8])).expect("write");
    store.write("b", &mut Cursor::new(vec![2u8])).expect("write");
    store.clear().expect("clear");

    assert!(!store.exists("a"));
    assert!(!store.exists("b"));
}
