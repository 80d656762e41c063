use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::LocalIoError;

const TEMP_SUFFIX: &str = ".tmp";

/// File store confined to a single managed directory.
///
/// Writes stream from the reader into a temp sibling and are published with
/// an atomic rename, so a crash mid-write never leaves a partial file under
/// an attachment's name. Leftover temp files are collected by
/// [`LocalFileStore::sweep_orphans`].
#[derive(Clone, Debug)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, LocalIoError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// Stream `data` into `filename`, returning the final path and byte
    /// count. The payload is never buffered whole.
    pub fn write(
        &self,
        filename: &str,
        data: &mut dyn Read,
    ) -> Result<(PathBuf, i64), LocalIoError> {
        fs::create_dir_all(&self.root)?;
        let temp = self
            .root
            .join(format!(".{}{TEMP_SUFFIX}", uuid::Uuid::new_v4()));

        let result = (|| -> Result<u64, io::Error> {
            let mut file = File::create(&temp)?;
            let written = io::copy(data, &mut file)?;
            file.sync_all()?;
            Ok(written)
        })();

        let written = match result {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(e.into());
            }
        };

        let path = self.path_for(filename);
        if let Err(e) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }

        Ok((path, written as i64))
    }

    pub fn open(&self, filename: &str) -> Result<File, LocalIoError> {
        File::open(self.path_for(filename)).map_err(Into::into)
    }

    pub fn read(&self, filename: &str) -> Result<Vec<u8>, LocalIoError> {
        fs::read(self.path_for(filename)).map_err(Into::into)
    }

    pub fn exists(&self, filename: &str) -> bool {
        self.path_for(filename).is_file()
    }

    pub fn size(&self, filename: &str) -> Result<i64, LocalIoError> {
        let meta = fs::metadata(self.path_for(filename))?;
        Ok(meta.len() as i64)
    }

    /// Remove `filename` if present. Returns whether a file was removed;
    /// a missing file is not an error.
    pub fn remove(&self, filename: &str) -> Result<bool, LocalIoError> {
        match fs::remove_file(self.path_for(filename)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every temp file and every regular file whose name is not in
    /// `referenced`. Returns the number of files removed.
    pub fn sweep_orphans(&self, referenced: &BTreeSet<String>) -> Result<usize, LocalIoError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0usize;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name_os = entry.file_name();
            let Some(name) = name_os.to_str() else {
                continue;
            };
            let orphan = name.ends_with(TEMP_SUFFIX) || !referenced.contains(name);
            if orphan {
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(removed)
    }

    /// Remove every file in the managed directory.
    pub fn clear(&self) -> Result<(), LocalIoError> {
        self.sweep_orphans(&BTreeSet::new())?;
        Ok(())
    }
}
