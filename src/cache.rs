use crate::db::AttachmentRepository;
use crate::error::QueueError;
use crate::model::Attachment;
use crate::store::LocalFileStore;

/// Evict the oldest archived rows beyond `limit` and unlink their local
/// files. Rows go first (in one transaction); a file whose row is already
/// gone is recovered by the orphan sweep if the unlink is interrupted.
pub fn enforce_archive_limit(
    repo: &AttachmentRepository,
    store: &LocalFileStore,
    limit: i64,
) -> Result<Vec<Attachment>, QueueError> {
    let evicted = repo.evict_oldest_archived(limit)?;
    for attachment in &evicted {
        if let Err(e) = store.remove(&attachment.filename) {
            tracing::warn!(id = %attachment.id, error = %e, "failed to unlink evicted file");
        }
    }
    if !evicted.is_empty() {
        tracing::debug!(count = evicted.len(), "evicted archived attachments");
    }
    Ok(evicted)
}
