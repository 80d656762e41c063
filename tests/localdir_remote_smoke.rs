use std::io::{Cursor, Read};

use attachment_queue::remote::LocalDirRemoteStorage;
use attachment_queue::{Attachment, AttachmentState, RemoteError, RemoteStorage};

fn fixture(id: &str) -> Attachment {
    Attachment {
        id: id.to_string(),
        filename: format!("{id}.jpg"),
        media_type: Some("image/jpeg".to_string()),
        state: AttachmentState::QueuedUpload,
        timestamp: 0,
        size: Some(3),
        has_synced: false,
        meta_data: None,
        local_uri: None,
    }
}

#[test]
fn localdir_upload_download_delete_round_trip() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let remote = LocalDirRemoteStorage::new(tmp.path().join("bucket")).expect("remote");
    let attachment = fixture("a");

    remote
        .upload_file(&mut Cursor::new(vec![1u8, 2, 3]), &attachment)
        .expect("upload");

    let mut body = remote.download_file(&attachment).expect("download");
    let mut bytes = Vec::new();
    body.read_to_end(&mut bytes).expect("read body");
    assert_eq!(bytes, vec![1, 2, 3]);

    remote.delete_file(&attachment).expect("delete");
    let err = remote.download_file(&attachment).expect_err("gone");
    assert!(matches!(err, RemoteError::NotFound(_)));

    // Deleting again is success: the adapter is idempotent.
    remote.delete_file(&attachment).expect("second delete");
}
