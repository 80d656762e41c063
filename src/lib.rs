pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod store;
pub mod watcher;
pub mod worker;

pub use config::QueueConfig;
pub use error::{LocalIoError, LocalIoKind, QueueError, RemoteError};
pub use model::{Attachment, AttachmentState, WatchedAttachmentItem};
pub use queue::{AttachmentQueue, SaveRequest};
pub use remote::RemoteStorage;
pub use worker::{QueueObserver, SyncErrorHandler};
