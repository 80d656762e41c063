use std::collections::BTreeSet;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusqlite::Connection;

use crate::cache;
use crate::config::QueueConfig;
use crate::db::{self, AttachmentRepository};
use crate::error::QueueError;
use crate::model::{filename_for, Attachment, AttachmentState, WatchedAttachmentItem};
use crate::reconcile::reconcile;
use crate::remote::RemoteStorage;
use crate::store::LocalFileStore;
use crate::watcher::{self, ControlMsg};
use crate::worker::{AlwaysRetry, QueueObserver, SyncErrorHandler, SyncWorker};

/// Parameters for [`AttachmentQueue::save_file`].
#[derive(Clone, Debug, Default)]
pub struct SaveRequest {
    /// Attachment id; generated when absent.
    pub id: Option<String>,
    pub media_type: Option<String>,
    pub file_extension: Option<String>,
    /// Opaque to the queue; JSON by convention.
    pub meta_data: Option<String>,
}

struct Runtime {
    control_tx: Sender<ControlMsg>,
    stop: Arc<AtomicBool>,
    worker_thread: JoinHandle<()>,
    forwarder_thread: JoinHandle<()>,
}

/// The queue orchestrator: composes the repository, local store, reconciler,
/// sync worker and archival cache, and owns their lifecycle.
pub struct AttachmentQueue {
    repo: AttachmentRepository,
    store: LocalFileStore,
    remote: Arc<dyn RemoteStorage>,
    error_handler: Arc<dyn SyncErrorHandler>,
    observer: Option<Arc<dyn QueueObserver>>,
    config: QueueConfig,
    runtime: Mutex<Option<Runtime>>,
}

impl AttachmentQueue {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        remote: Arc<dyn RemoteStorage>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        let repo = AttachmentRepository::new(conn, &config.attachments_table_name)?;
        let store = LocalFileStore::new(&config.attachments_directory)?;
        Ok(Self {
            repo,
            store,
            remote,
            error_handler: Arc::new(AlwaysRetry),
            observer: None,
            config,
            runtime: Mutex::new(None),
        })
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn SyncErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Subscribe to the watcher, launch the background loop and kick an
    /// initial sync. Idempotent: a running queue ignores further starts.
    ///
    /// `emissions` is the host's reactive stream: each message is the
    /// complete current set of referenced attachments. Dropping the sender
    /// ends the subscription; the next `start()` after `stop()` takes a
    /// fresh receiver.
    pub fn start(
        &self,
        emissions: Receiver<Vec<WatchedAttachmentItem>>,
    ) -> Result<(), QueueError> {
        let mut runtime = self
            .runtime
            .lock()
            .map_err(|_| QueueError::Database("poisoned runtime lock".to_string()))?;
        if runtime.is_some() {
            return Ok(());
        }

        let referenced: BTreeSet<String> = self
            .repo
            .get_all()?
            .into_iter()
            .map(|a| a.filename)
            .collect();
        let swept = self.store.sweep_orphans(&referenced)?;
        if swept > 0 {
            tracing::debug!(count = swept, "removed orphaned local files");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = mpsc::channel();
        let forwarder_thread =
            watcher::spawn_forwarder(emissions, control_tx.clone(), stop.clone());

        let event_loop = EventLoop {
            worker: SyncWorker::new(
                self.repo.clone(),
                self.store.clone(),
                self.remote.clone(),
                self.error_handler.clone(),
                self.observer.clone(),
                self.config.download_attachments,
                stop.clone(),
            ),
            repo: self.repo.clone(),
            store: self.store.clone(),
            observer: self.observer.clone(),
            download_attachments: self.config.download_attachments,
            archived_cache_limit: self.config.archived_cache_limit,
            sync_interval: self.config.sync_interval,
            control_rx,
            stop: stop.clone(),
        };
        let worker_thread = thread::spawn(move || event_loop.run());

        let _ = control_tx.send(ControlMsg::Trigger);

        *runtime = Some(Runtime {
            control_tx,
            stop,
            worker_thread,
            forwarder_thread,
        });
        Ok(())
    }

    /// Cancel the subscription and the periodic timer, then wait for the
    /// background loop to go quiescent. Idempotent.
    pub fn stop(&self) -> Result<(), QueueError> {
        let runtime = {
            let mut guard = self
                .runtime
                .lock()
                .map_err(|_| QueueError::Database("poisoned runtime lock".to_string()))?;
            guard.take()
        };
        let Some(runtime) = runtime else {
            return Ok(());
        };

        runtime.stop.store(true, Ordering::Relaxed);
        let _ = runtime.control_tx.send(ControlMsg::Stop);
        let _ = runtime.worker_thread.join();
        let _ = runtime.forwarder_thread.join();
        Ok(())
    }

    /// Persist a new attachment payload and queue it for upload.
    ///
    /// The bytes are streamed into the managed directory first; the row is
    /// then upserted in `QueuedUpload` in one transaction. On any failure
    /// before commit the freshly written file is removed, so either both the
    /// row and the file exist or neither does.
    ///
    /// An explicit id may collide with an existing row: while that row is
    /// still in `QueuedUpload` the pending payload is overwritten; any other
    /// state fails with `InvalidState`, since attachments are immutable once
    /// created.
    pub fn save_file(
        &self,
        data: &mut dyn Read,
        request: SaveRequest,
    ) -> Result<Attachment, QueueError> {
        self.save_file_with(data, request, |_, _| Ok(()))
    }

    /// Like [`AttachmentQueue::save_file`], with `link` running inside the
    /// same transaction before commit so the host can atomically assign the
    /// new id to its own rows. A failing callback aborts the save.
    pub fn save_file_with<F>(
        &self,
        data: &mut dyn Read,
        request: SaveRequest,
        link: F,
    ) -> Result<Attachment, QueueError>
    where
        F: FnOnce(&Connection, &Attachment) -> anyhow::Result<()>,
    {
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let existing = self.repo.get(&id)?;
        if let Some(row) = &existing {
            if row.state != AttachmentState::QueuedUpload {
                return Err(QueueError::InvalidState(format!(
                    "attachment {id} is {}; only a pending upload may be overwritten",
                    row.state.as_str()
                )));
            }
        }

        let filename = filename_for(&id, request.file_extension.as_deref());
        let (path, size) = self.store.write(&filename, data)?;

        let attachment = Attachment {
            id,
            filename: filename.clone(),
            media_type: request.media_type,
            state: AttachmentState::QueuedUpload,
            timestamp: db::now_ms(),
            size: Some(size),
            has_synced: existing.as_ref().map(|r| r.has_synced).unwrap_or(false),
            meta_data: request.meta_data,
            local_uri: Some(path.to_string_lossy().into_owned()),
        };

        let saved = match self.repo.save_with(&attachment, link) {
            Ok(saved) => saved,
            Err(e) => {
                if existing.is_none() {
                    let _ = self.store.remove(&filename);
                }
                return Err(e);
            }
        };

        self.trigger();
        Ok(saved)
    }

    /// Queue an attachment for remote and local deletion. Fails with
    /// `NotFound` for an unknown id and `InvalidState` for an archived row.
    pub fn delete_file(&self, id: &str) -> Result<Attachment, QueueError> {
        self.delete_file_with(id, |_, _| Ok(()))
    }

    /// Like [`AttachmentQueue::delete_file`], with `unlink` running inside
    /// the transaction so the host can atomically drop its references.
    pub fn delete_file_with<F>(&self, id: &str, unlink: F) -> Result<Attachment, QueueError>
    where
        F: FnOnce(&Connection, &Attachment) -> anyhow::Result<()>,
    {
        let table = self.repo.table_name().to_string();
        let updated = self.repo.with_tx(|conn| {
            let row = db::get_row(conn, &table, id)?
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
            if row.state == AttachmentState::Archived {
                return Err(QueueError::InvalidState(format!(
                    "attachment {id} is archived and cannot be deleted"
                )));
            }
            db::set_row_state(conn, &table, id, AttachmentState::QueuedDelete, db::now_ms())?;
            let updated = db::get_row(conn, &table, id)?
                .ok_or_else(|| QueueError::Database("updated row vanished".to_string()))?;
            unlink(conn, &updated).map_err(QueueError::Callback)?;
            Ok(updated)
        })?;

        self.trigger();
        Ok(updated)
    }

    pub fn get_attachment(&self, id: &str) -> Result<Option<Attachment>, QueueError> {
        self.repo.get(id)
    }

    /// Ask the background loop for a sync pass now. No-op while stopped.
    pub fn trigger(&self) {
        if let Ok(guard) = self.runtime.lock() {
            if let Some(runtime) = guard.as_ref() {
                let _ = runtime.control_tx.send(ControlMsg::Trigger);
            }
        }
    }

    /// Test hook: drop every row and every managed local file.
    pub fn clear_queue(&self) -> Result<(), QueueError> {
        self.repo.clear_all()?;
        self.store.clear()?;
        Ok(())
    }
}

impl Drop for AttachmentQueue {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

struct EventLoop {
    worker: SyncWorker,
    repo: AttachmentRepository,
    store: LocalFileStore,
    observer: Option<Arc<dyn QueueObserver>>,
    download_attachments: bool,
    archived_cache_limit: i64,
    sync_interval: Duration,
    control_rx: Receiver<ControlMsg>,
    stop: Arc<AtomicBool>,
}

impl EventLoop {
    fn run(self) {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }

            let msg = if self.sync_interval.is_zero() {
                self.control_rx
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected)
            } else {
                self.control_rx.recv_timeout(self.sync_interval)
            };

            match msg {
                Ok(ControlMsg::Emission(items)) => {
                    let (items, stopped) = watcher::coalesce(items, &self.control_rx);
                    if stopped {
                        return;
                    }
                    self.reconcile_pass(&items);
                    self.cache_pass();
                    self.worker.run_once();
                }
                Ok(ControlMsg::Trigger) => {
                    self.worker.run_once();
                }
                Ok(ControlMsg::Stop) => return,
                Err(RecvTimeoutError::Timeout) => {
                    self.worker.run_once();
                    self.cache_pass();
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn reconcile_pass(&self, items: &[WatchedAttachmentItem]) {
        match reconcile(&self.repo, &self.store, items, self.download_attachments) {
            Ok(transitions) => {
                if let Some(observer) = &self.observer {
                    for attachment in &transitions {
                        observer.on_transition(attachment);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "reconciliation failed; will retry on next emission"),
        }
    }

    fn cache_pass(&self) {
        match cache::enforce_archive_limit(&self.repo, &self.store, self.archived_cache_limit) {
            Ok(evicted) => {
                if let Some(observer) = &self.observer {
                    for attachment in &evicted {
                        observer.on_evicted(attachment);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "archive eviction failed"),
        }
    }
}
