use std::collections::BTreeMap;

use crate::db::{self, AttachmentRepository};
use crate::error::QueueError;
use crate::model::{filename_for, Attachment, AttachmentState, WatchedAttachmentItem};
use crate::store::LocalFileStore;

/// Diff the referenced set against the stored set and apply the resulting
/// transitions in a single transaction, so the table never reflects a
/// partial pass. Returns the rows that changed, post-transition.
///
/// Rules, per referenced id:
/// - unknown id: insert as `QueuedDownload` (skipped when downloads are
///   disabled);
/// - archived id: restore, to `Synced` if the local file survived, otherwise
///   `QueuedDownload`;
/// - anything else is left for the worker.
///
/// Per stored row no longer referenced:
/// - `Synced` rows are archived;
/// - `QueuedDownload` rows are dropped (nothing to preserve);
/// - queued uploads and deletes proceed; archived rows stay archived.
pub fn reconcile(
    repo: &AttachmentRepository,
    store: &LocalFileStore,
    items: &[WatchedAttachmentItem],
    download_attachments: bool,
) -> Result<Vec<Attachment>, QueueError> {
    let mut referenced: BTreeMap<&str, &WatchedAttachmentItem> = BTreeMap::new();
    for item in items {
        referenced.entry(item.id.as_str()).or_insert(item);
    }

    let table = repo.table_name().to_string();
    repo.with_tx(|conn| {
        let now = db::now_ms();
        let stored = db::all_rows(conn, &table)?;
        let mut changed = Vec::new();

        let stored_ids: BTreeMap<&str, &Attachment> =
            stored.iter().map(|a| (a.id.as_str(), a)).collect();

        for (id, item) in &referenced {
            match stored_ids.get(id) {
                None => {
                    if !download_attachments {
                        continue;
                    }
                    let attachment = Attachment {
                        id: (*id).to_string(),
                        filename: filename_for(id, item.file_extension.as_deref()),
                        media_type: item.media_type.clone(),
                        state: AttachmentState::QueuedDownload,
                        timestamp: now,
                        size: None,
                        has_synced: false,
                        meta_data: None,
                        local_uri: None,
                    };
                    changed.push(db::upsert_row(conn, &table, &attachment, now)?);
                }
                Some(row) if row.state == AttachmentState::Archived => {
                    let next = if store.exists(&row.filename) {
                        AttachmentState::Synced
                    } else {
                        AttachmentState::QueuedDownload
                    };
                    db::set_row_state(conn, &table, id, next, now)?;
                    if let Some(updated) = db::get_row(conn, &table, id)? {
                        changed.push(updated);
                    }
                }
                Some(_) => {}
            }
        }

        for row in &stored {
            if referenced.contains_key(row.id.as_str()) {
                continue;
            }
            match row.state {
                AttachmentState::Synced => {
                    db::set_row_state(conn, &table, &row.id, AttachmentState::Archived, now)?;
                    if let Some(updated) = db::get_row(conn, &table, &row.id)? {
                        changed.push(updated);
                    }
                }
                AttachmentState::QueuedDownload => {
                    db::delete_row(conn, &table, &row.id)?;
                    tracing::debug!(id = %row.id, "dropped unreferenced queued download");
                }
                AttachmentState::QueuedUpload
                | AttachmentState::QueuedDelete
                | AttachmentState::Archived => {}
            }
        }

        Ok(changed)
    })
}
