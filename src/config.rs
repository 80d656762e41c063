use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_ARCHIVED_CACHE_LIMIT: i64 = 100;
pub const DEFAULT_TABLE_NAME: &str = "attachments";

/// Runtime options for an [`crate::queue::AttachmentQueue`].
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Root directory for local attachment files. Created on demand.
    pub attachments_directory: PathBuf,
    /// Period of the background retry tick. Zero disables periodic retry;
    /// only watcher emissions and explicit triggers drive the worker then.
    pub sync_interval: Duration,
    /// Maximum number of archived rows retained for restore.
    pub archived_cache_limit: i64,
    /// Name of the attachment state table.
    pub attachments_table_name: String,
    /// When false, missing referenced attachments are not scheduled for
    /// download.
    pub download_attachments: bool,
}

impl QueueConfig {
    pub fn new(attachments_directory: impl Into<PathBuf>) -> Self {
        Self {
            attachments_directory: attachments_directory.into(),
            sync_interval: Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS),
            archived_cache_limit: DEFAULT_ARCHIVED_CACHE_LIMIT,
            attachments_table_name: DEFAULT_TABLE_NAME.to_string(),
            download_attachments: true,
        }
    }
}
