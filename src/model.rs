use serde::{Deserialize, Serialize};

/// Lifecycle state of an attachment row. Stored as lowercase text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    QueuedUpload,
    QueuedDownload,
    QueuedDelete,
    Synced,
    Archived,
}

impl AttachmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentState::QueuedUpload => "queued_upload",
            AttachmentState::QueuedDownload => "queued_download",
            AttachmentState::QueuedDelete => "queued_delete",
            AttachmentState::Synced => "synced",
            AttachmentState::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued_upload" => Some(AttachmentState::QueuedUpload),
            "queued_download" => Some(AttachmentState::QueuedDownload),
            "queued_delete" => Some(AttachmentState::QueuedDelete),
            "synced" => Some(AttachmentState::Synced),
            "archived" => Some(AttachmentState::Archived),
            _ => None,
        }
    }
}

/// One row of the attachment state table.
///
/// Attachments are immutable once created: `filename` is derived from the id
/// and extension at creation time and never changes afterwards. `has_synced`
/// is sticky: once a row has reached `Synced` it stays true for the life of
/// the row, surviving archival and restore.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub media_type: Option<String>,
    pub state: AttachmentState,
    /// Wall-clock ms of the last state transition; set by the repository.
    pub timestamp: i64,
    pub size: Option<i64>,
    pub has_synced: bool,
    /// Opaque to the queue; JSON by convention.
    pub meta_data: Option<String>,
    /// Absolute path of the pending local payload; cleared once synced.
    pub local_uri: Option<String>,
}

/// A referenced attachment as seen by the watcher. Each emission carries the
/// complete current set of these.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedAttachmentItem {
    pub id: String,
    pub file_extension: Option<String>,
    pub media_type: Option<String>,
}

impl WatchedAttachmentItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            file_extension: None,
            media_type: None,
        }
    }
}

/// Derive the managed-directory filename for an attachment.
pub fn filename_for(id: &str, extension: Option<&str>) -> String {
    match extension {
        Some(ext) if !ext.is_empty() => format!("{id}.{ext}"),
        _ => id.to_string(),
    }
}
