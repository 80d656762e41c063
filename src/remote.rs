use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use reqwest::blocking::Client;
use reqwest::Method;

use crate::error::RemoteError;
use crate::model::Attachment;

/// Blob-store capability set consumed by the sync worker. Objects are
/// addressed by the attachment's `filename`.
pub trait RemoteStorage: Send + Sync {
    /// Stream the payload to the remote object. A failed transfer is retried
    /// from scratch with a fresh reader.
    fn upload_file(&self, data: &mut dyn Read, attachment: &Attachment) -> Result<(), RemoteError>;

    /// Open the remote object for streaming. The returned reader is finite
    /// and need not be restartable.
    fn download_file(&self, attachment: &Attachment) -> Result<Box<dyn Read + Send>, RemoteError>;

    /// Delete the remote object. Idempotent: a missing object is success.
    fn delete_file(&self, attachment: &Attachment) -> Result<(), RemoteError>;
}

fn poisoned() -> RemoteError {
    RemoteError::Other("poisoned lock".to_string())
}

/// In-memory remote for tests: a map of objects plus operation counters and
/// injectable failures, so transient-error and zero-round-trip behavior can
/// be asserted.
#[derive(Default)]
pub struct InMemoryRemoteStorage {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    uploads: AtomicU64,
    downloads: AtomicU64,
    deletes: AtomicU64,
    upload_failures: AtomicU64,
    download_failures: AtomicU64,
    delete_failures: AtomicU64,
}

impl InMemoryRemoteStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, filename: &str) -> Option<Vec<u8>> {
        self.objects.lock().ok()?.get(filename).cloned()
    }

    /// Seed an object directly, bypassing the upload path and its counters.
    pub fn put_object(&self, filename: &str, bytes: Vec<u8>) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(filename.to_string(), bytes);
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Fail the next `n` uploads with a transport error.
    pub fn fail_next_uploads(&self, n: u64) {
        self.upload_failures.store(n, Ordering::Relaxed);
    }

    pub fn fail_next_downloads(&self, n: u64) {
        self.download_failures.store(n, Ordering::Relaxed);
    }

    pub fn fail_next_deletes(&self, n: u64) {
        self.delete_failures.store(n, Ordering::Relaxed);
    }

    fn take_failure(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RemoteStorage for InMemoryRemoteStorage {
    fn upload_file(&self, data: &mut dyn Read, attachment: &Attachment) -> Result<(), RemoteError> {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        if Self::take_failure(&self.upload_failures) {
            return Err(RemoteError::Transport("injected upload failure".to_string()));
        }

        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        self.objects
            .lock()
            .map_err(|_| poisoned())?
            .insert(attachment.filename.clone(), bytes);
        Ok(())
    }

    fn download_file(&self, attachment: &Attachment) -> Result<Box<dyn Read + Send>, RemoteError> {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        if Self::take_failure(&self.download_failures) {
            return Err(RemoteError::Transport(
                "injected download failure".to_string(),
            ));
        }

        let objects = self.objects.lock().map_err(|_| poisoned())?;
        let bytes = objects
            .get(&attachment.filename)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(attachment.filename.clone()))?;
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    fn delete_file(&self, attachment: &Attachment) -> Result<(), RemoteError> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        if Self::take_failure(&self.delete_failures) {
            return Err(RemoteError::Transport("injected delete failure".to_string()));
        }

        self.objects
            .lock()
            .map_err(|_| poisoned())?
            .remove(&attachment.filename);
        Ok(())
    }
}

/// Remote store over a plain directory, useful for tests and for syncing
/// into a mounted network share.
#[derive(Clone, Debug)]
pub struct LocalDirRemoteStorage {
    root: PathBuf,
}

impl LocalDirRemoteStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, RemoteError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| RemoteError::Other(e.to_string()))?;
        Ok(Self { root })
    }

    fn object_path(&self, attachment: &Attachment) -> PathBuf {
        self.root.join(&attachment.filename)
    }
}

impl RemoteStorage for LocalDirRemoteStorage {
    fn upload_file(&self, data: &mut dyn Read, attachment: &Attachment) -> Result<(), RemoteError> {
        let path = self.object_path(attachment);
        let mut file = File::create(&path).map_err(|e| RemoteError::Other(e.to_string()))?;
        io::copy(data, &mut file).map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(())
    }

    fn download_file(&self, attachment: &Attachment) -> Result<Box<dyn Read + Send>, RemoteError> {
        match File::open(self.object_path(attachment)) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(RemoteError::NotFound(attachment.filename.clone()))
            }
            Err(e) => Err(RemoteError::Other(e.to_string())),
        }
    }

    fn delete_file(&self, attachment: &Attachment) -> Result<(), RemoteError> {
        match fs::remove_file(self.object_path(attachment)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RemoteError::Other(e.to_string())),
        }
    }
}

pub fn join_base_url_and_path(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Remote store over a WebDAV collection. Objects live flat under
/// `base_url`; call [`WebDavRemoteStorage::ensure_collection`] once if the
/// collection may not exist yet.
pub struct WebDavRemoteStorage {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl WebDavRemoteStorage {
    pub fn new(
        base_url: String,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, RemoteError> {
        reqwest::Url::parse(&base_url).map_err(|_| RemoteError::Other("invalid base_url".to_string()))?;
        Ok(Self {
            client: Client::new(),
            base_url,
            username,
            password,
        })
    }

    fn request(&self, method: Method, filename: &str) -> reqwest::blocking::RequestBuilder {
        let url = join_base_url_and_path(&self.base_url, filename);
        let mut builder = self.client.request(method, url);
        if let Some(user) = &self.username {
            builder = builder.basic_auth(user, self.password.as_deref());
        }
        builder
    }

    /// MKCOL the collection. An already-existing collection (405) is fine.
    pub fn ensure_collection(&self) -> Result<(), RemoteError> {
        let method = Method::from_bytes(b"MKCOL")
            .map_err(|e| RemoteError::Other(e.to_string()))?;
        let resp = self
            .request(method, "")
            .send()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() || status.as_u16() == 405 {
            Ok(())
        } else {
            Err(status_error(status, "MKCOL"))
        }
    }
}

fn status_error(status: reqwest::StatusCode, what: &str) -> RemoteError {
    match status.as_u16() {
        401 | 403 => RemoteError::Auth(format!("{what}: HTTP {status}")),
        404 => RemoteError::NotFound(format!("{what}: HTTP {status}")),
        _ => RemoteError::Other(format!("{what}: HTTP {status}")),
    }
}

impl RemoteStorage for WebDavRemoteStorage {
    fn upload_file(&self, data: &mut dyn Read, attachment: &Attachment) -> Result<(), RemoteError> {
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let mut builder = self.request(Method::PUT, &attachment.filename).body(bytes);
        if let Some(media_type) = &attachment.media_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, media_type);
        }
        let resp = builder
            .send()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, "PUT"))
        }
    }

    fn download_file(&self, attachment: &Attachment) -> Result<Box<dyn Read + Send>, RemoteError> {
        let resp = self
            .request(Method::GET, &attachment.filename)
            .send()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(Box::new(resp))
        } else {
            Err(status_error(status, "GET"))
        }
    }

    fn delete_file(&self, attachment: &Attachment) -> Result<(), RemoteError> {
        let resp = self
            .request(Method::DELETE, &attachment.filename)
            .send()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let status = resp.status();
        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else {
            Err(status_error(status, "DELETE"))
        }
    }
}
