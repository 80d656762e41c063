use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::db::{AttachmentRepository, Completion};
use crate::error::{LocalIoError, QueueError, RemoteError};
use crate::model::{Attachment, AttachmentState};
use crate::remote::RemoteStorage;
use crate::store::LocalFileStore;

/// Decides whether a failed remote operation is retried on the next cycle.
/// Returning false gives up: uploads archive the row, downloads and deletes
/// drop it.
pub trait SyncErrorHandler: Send + Sync {
    fn on_upload_error(&self, attachment: &Attachment, error: &RemoteError) -> bool {
        let _ = (attachment, error);
        true
    }

    fn on_download_error(&self, attachment: &Attachment, error: &RemoteError) -> bool {
        let _ = (attachment, error);
        true
    }

    fn on_delete_error(&self, attachment: &Attachment, error: &RemoteError) -> bool {
        let _ = (attachment, error);
        true
    }
}

/// Default error handler: every failure is retried.
pub struct AlwaysRetry;

impl SyncErrorHandler for AlwaysRetry {}

/// Observation hook for test suites. The queue itself stays silent.
pub trait QueueObserver: Send + Sync {
    /// A row committed a state transition.
    fn on_transition(&self, attachment: &Attachment) {
        let _ = attachment;
    }

    /// An archived row was evicted and its file unlinked.
    fn on_evicted(&self, attachment: &Attachment) {
        let _ = attachment;
    }
}

/// Executes pending transitions: one pass drains the three queued state
/// classes, with at most one in-flight operation per class and never two
/// operations on the same id.
pub struct SyncWorker {
    repo: AttachmentRepository,
    store: LocalFileStore,
    remote: Arc<dyn RemoteStorage>,
    error_handler: Arc<dyn SyncErrorHandler>,
    observer: Option<Arc<dyn QueueObserver>>,
    download_attachments: bool,
    in_flight: Mutex<BTreeSet<String>>,
    stop: Arc<AtomicBool>,
}

impl SyncWorker {
    pub fn new(
        repo: AttachmentRepository,
        store: LocalFileStore,
        remote: Arc<dyn RemoteStorage>,
        error_handler: Arc<dyn SyncErrorHandler>,
        observer: Option<Arc<dyn QueueObserver>>,
        download_attachments: bool,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            repo,
            store,
            remote,
            error_handler,
            observer,
            download_attachments,
            in_flight: Mutex::new(BTreeSet::new()),
            stop,
        }
    }

    /// One sync cycle. Each state class gets its own thread so a slow
    /// download does not starve deletes; within a class rows run
    /// oldest-first, one at a time.
    pub fn run_once(&self) {
        thread::scope(|scope| {
            scope.spawn(|| self.drain(AttachmentState::QueuedUpload));
            if self.download_attachments {
                scope.spawn(|| self.drain(AttachmentState::QueuedDownload));
            }
            scope.spawn(|| self.drain(AttachmentState::QueuedDelete));
        });
    }

    fn drain(&self, state: AttachmentState) {
        let rows = match self.repo.get_by_state(state) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(state = state.as_str(), error = %e, "failed to select work");
                return;
            }
        };

        for row in rows {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
            if !self.claim(&row.id) {
                continue;
            }
            let result = self.process(&row);
            self.release(&row.id);
            if let Err(e) = result {
                tracing::warn!(id = %row.id, state = state.as_str(), error = %e,
                    "sync operation failed; will retry next cycle");
            }
        }
    }

    fn claim(&self, id: &str) -> bool {
        let Ok(mut guard) = self.in_flight.lock() else {
            return false;
        };
        guard.insert(id.to_string())
    }

    fn release(&self, id: &str) {
        if let Ok(mut guard) = self.in_flight.lock() {
            guard.remove(id);
        }
    }

    fn process(&self, attachment: &Attachment) -> Result<(), QueueError> {
        match attachment.state {
            AttachmentState::QueuedUpload => self.process_upload(attachment),
            AttachmentState::QueuedDownload => self.process_download(attachment),
            AttachmentState::QueuedDelete => self.process_delete(attachment),
            AttachmentState::Synced | AttachmentState::Archived => Ok(()),
        }
    }

    fn process_upload(&self, attachment: &Attachment) -> Result<(), QueueError> {
        let path = attachment
            .local_uri
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.store.path_for(&attachment.filename));

        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // The payload is gone; this upload can never succeed.
                tracing::warn!(id = %attachment.id, "local file missing for queued upload; archiving");
                return self.finish(
                    attachment,
                    Completion::SetState {
                        state: AttachmentState::Archived,
                        size: None,
                        mark_synced: false,
                        clear_local_uri: true,
                    },
                );
            }
            Err(e) => return Err(LocalIoError::from(e).into()),
        };

        match self.remote.upload_file(&mut file, attachment) {
            Ok(()) => {
                let size = attachment
                    .size
                    .or_else(|| self.store.size(&attachment.filename).ok());
                self.finish(
                    attachment,
                    Completion::SetState {
                        state: AttachmentState::Synced,
                        size,
                        mark_synced: true,
                        clear_local_uri: true,
                    },
                )
            }
            Err(error) => {
                if self.error_handler.on_upload_error(attachment, &error) {
                    tracing::debug!(id = %attachment.id, error = %error, "upload failed; queued for retry");
                    Ok(())
                } else {
                    tracing::warn!(id = %attachment.id, error = %error, "upload abandoned; archiving");
                    self.finish(
                        attachment,
                        Completion::SetState {
                            state: AttachmentState::Archived,
                            size: None,
                            mark_synced: false,
                            clear_local_uri: true,
                        },
                    )
                }
            }
        }
    }

    fn process_download(&self, attachment: &Attachment) -> Result<(), QueueError> {
        let mut body = match self.remote.download_file(attachment) {
            Ok(body) => body,
            Err(error) => {
                return if self.error_handler.on_download_error(attachment, &error) {
                    tracing::debug!(id = %attachment.id, error = %error, "download failed; queued for retry");
                    Ok(())
                } else {
                    tracing::warn!(id = %attachment.id, error = %error, "download abandoned; dropping row");
                    self.finish(attachment, Completion::DeleteRow)
                };
            }
        };

        let (_, size) = self.store.write(&attachment.filename, &mut *body)?;
        self.finish(
            attachment,
            Completion::SetState {
                state: AttachmentState::Synced,
                size: Some(size),
                mark_synced: true,
                clear_local_uri: false,
            },
        )
    }

    fn process_delete(&self, attachment: &Attachment) -> Result<(), QueueError> {
        let result = match self.remote.delete_file(attachment) {
            Ok(()) | Err(RemoteError::NotFound(_)) => Ok(()),
            Err(error) => Err(error),
        };

        match result {
            Ok(()) => {
                let _ = self.store.remove(&attachment.filename);
                self.finish(attachment, Completion::DeleteRow)
            }
            Err(error) => {
                if self.error_handler.on_delete_error(attachment, &error) {
                    tracing::debug!(id = %attachment.id, error = %error, "remote delete failed; queued for retry");
                    Ok(())
                } else {
                    // Local-side forget: the remote object may survive.
                    tracing::warn!(id = %attachment.id, error = %error, "remote delete abandoned; dropping row");
                    let _ = self.store.remove(&attachment.filename);
                    self.finish(attachment, Completion::DeleteRow)
                }
            }
        }
    }

    /// Commit the terminal state. The write is skipped when the row changed
    /// underneath the operation; the next cycle picks the row up again.
    fn finish(&self, snapshot: &Attachment, completion: Completion) -> Result<(), QueueError> {
        let is_delete = matches!(completion, Completion::DeleteRow);
        let applied = self.repo.complete_if_unchanged(snapshot, completion)?;
        if !applied {
            tracing::debug!(id = %snapshot.id, "row changed mid-operation; terminal write skipped");
            return Ok(());
        }
        if let Some(observer) = &self.observer {
            if !is_delete {
                if let Some(updated) = self.repo.get(&snapshot.id)? {
                    observer.on_transition(&updated);
                }
            }
        }
        Ok(())
    }
}
