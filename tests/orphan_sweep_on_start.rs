use std::io::Cursor;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use attachment_queue::db;
use attachment_queue::remote::InMemoryRemoteStorage;
use attachment_queue::{AttachmentQueue, AttachmentState, QueueConfig, SaveRequest};

#[test]
fn start_sweeps_temp_and_unreferenced_files_then_resumes_queued_work() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let db_path = tmp.path().join("state.sqlite3");
    let dir = tmp.path().join("attachments");

    // First run: queue an upload, then go away without syncing.
    {
        let conn = Arc::new(Mutex::new(db::open(&db_path).expect("open db")));
        let queue = AttachmentQueue::new(
            conn,
            Arc::new(InMemoryRemoteStorage::new()),
            QueueConfig::new(&dir),
        )
        .expect("queue");
        queue
            .save_file(
                &mut Cursor::new(vec![5u8]),
                SaveRequest {
                    id: Some("keep".to_string()),
                    media_type: None,
                    file_extension: Some("jpg".to_string()),
                    meta_data: None,
                },
            )
            .expect("save");
    }

    // Debris from an interrupted transfer and a long-gone row.
    std::fs::write(dir.join(".half-download.tmp"), [9u8]).expect("write temp");
    std::fs::write(dir.join("stale.png"), [9u8]).expect("write stale");

    // Second run over the same database and directory.
    let conn = Arc::new(Mutex::new(db::open(&db_path).expect("open db")));
    let remote = Arc::new(InMemoryRemoteStorage::new());
    let mut config = QueueConfig::new(&dir);
    config.sync_interval = Duration::from_millis(50);
    let queue = AttachmentQueue::new(conn, remote.clone(), config).expect("queue");

    let (_watch_tx, watch_rx) = mpsc::channel();
    queue.start(watch_rx).expect("start");

    // The sweep runs before the loop launches, so this is already settled.
    assert!(dir.join("keep.jpg").exists());
    assert!(!dir.join(".half-download.tmp").exists());
    assert!(!dir.join("stale.png").exists());

    // Restart recovery: the interrupted upload completes as if never stopped.
    for _ in 0..200 {
        let row = queue.get_attachment("keep").expect("get").expect("row");
        if row.state == AttachmentState::Synced {
            break;
        }
        thread::sleep(Duration::from_millis(25));
    }
    let row = queue.get_attachment("keep").expect("get").expect("row");
    assert_eq!(row.state, AttachmentState::Synced);
    assert_eq!(remote.object("keep.jpg"), Some(vec![5u8]));

    queue.stop().expect("stop");
}
