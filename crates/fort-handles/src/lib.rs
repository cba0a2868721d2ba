// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use fort_core::{HandleMeta, compute_handle, handle_filename};
use std::io::Write as _;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from persisting or reading a handle.
#[derive(Debug, Error)]
pub enum HandleError {
    /// The handles directory could not be created.
    #[error("failed to create handles directory: {0}")]
    CreateDir(#[source] std::io::Error),
    /// The blob or its `.meta` sibling could not be written.
    #[error("failed to write handle: {0}")]
    Write(#[source] std::io::Error),
    /// The blob or its `.meta` sibling could not be read.
    #[error("failed to read handle: {0}")]
    Read(#[source] std::io::Error),
}

/// A freshly persisted handle: its content-addressed name and, when
/// `ttl > 0`, the expiry metadata that was written alongside it.
#[derive(Debug, Clone)]
pub struct PersistedHandle {
    /// `sha256:<hex>` name, as returned in the `X-Fort-Handle` header.
    pub handle: String,
    /// Expiry metadata, if `ttl > 0`.
    pub meta: Option<HandleMeta>,
}

/// Content-addressed handle directory.
pub struct HandleStore {
    dir: PathBuf,
}

impl HandleStore {
    /// Point a store at `dir`. The directory is created lazily on
    /// first write, matching the original deployment's `0700`
    /// directory convention.
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Persist `data` under its content-addressed name, writing a
    /// `.meta` sibling when `ttl_secs > 0`.
    pub fn persist(
        &self,
        data: &[u8],
        ttl_secs: u64,
        now: i64,
    ) -> Result<PersistedHandle, HandleError> {
        std::fs::create_dir_all(&self.dir).map_err(HandleError::CreateDir)?;
        #[cfg(unix)]
        self.tighten_dir_permissions()?;

        let handle = compute_handle(data);
        let blob_path = self.dir.join(handle_filename(&handle));
        self.write_file(&blob_path, data)?;

        let meta = if ttl_secs > 0 {
            let meta = HandleMeta {
                expiry: now + i64::try_from(ttl_secs).unwrap_or(i64::MAX),
                ttl: ttl_secs,
            };
            let meta_path = self.meta_path(&handle);
            let meta_json = serde_json::to_vec_pretty(&meta).map_err(|e| {
                HandleError::Write(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;
            self.write_file(&meta_path, &meta_json)?;
            Some(meta)
        } else {
            None
        };

        Ok(PersistedHandle { handle, meta })
    }

    /// Read a previously persisted blob's bytes.
    pub fn read(&self, handle: &str) -> Result<Vec<u8>, HandleError> {
        let path = self.dir.join(handle_filename(handle));
        std::fs::read(path).map_err(HandleError::Read)
    }

    /// Read a handle's expiry metadata, if it has one.
    pub fn read_meta(&self, handle: &str) -> Result<Option<HandleMeta>, HandleError> {
        let path = self.meta_path(handle);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let meta = serde_json::from_slice(&bytes).map_err(|e| {
                    HandleError::Read(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                })?;
                Ok(Some(meta))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HandleError::Read(e)),
        }
    }

    fn meta_path(&self, handle: &str) -> PathBuf {
        let mut filename = handle_filename(handle);
        filename.push_str(".meta");
        self.dir.join(filename)
    }

    fn write_file(&self, path: &std::path::Path, data: &[u8]) -> Result<(), HandleError> {
        let dir = path.parent().unwrap_or(&self.dir);
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(HandleError::Write)?;
        tmp.write_all(data).map_err(HandleError::Write)?;
        tmp.flush().map_err(HandleError::Write)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(HandleError::Write)?;
        }
        tmp.persist(path).map_err(|e| HandleError::Write(e.error))?;
        Ok(())
    }

    #[cfg(unix)]
    fn tighten_dir_permissions(&self) -> Result<(), HandleError> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))
            .map_err(HandleError::CreateDir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_without_ttl_writes_no_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = HandleStore::new(dir.path().join("handles"));
        let persisted = store.persist(b"hello world", 0, 1_000).unwrap();
        assert!(persisted.handle.starts_with("sha256:"));
        assert!(persisted.meta.is_none());

        let read_back = store.read(&persisted.handle).unwrap();
        assert_eq!(read_back, b"hello world");
        assert!(store.read_meta(&persisted.handle).unwrap().is_none());
    }

    #[test]
    fn persist_with_ttl_writes_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = HandleStore::new(dir.path().join("handles"));
        let persisted = store.persist(b"credential", 3600, 1_000).unwrap();
        let meta = persisted.meta.unwrap();
        assert_eq!(meta.ttl, 3600);
        assert_eq!(meta.expiry, 4600);

        let reread = store.read_meta(&persisted.handle).unwrap().unwrap();
        assert_eq!(reread.expiry, 4600);
    }

    #[test]
    fn same_bytes_converge_on_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = HandleStore::new(dir.path().join("handles"));
        let a = store.persist(b"same", 0, 1).unwrap();
        let b = store.persist(b"same", 0, 2).unwrap();
        assert_eq!(a.handle, b.handle);
    }

    #[test]
    fn filename_maps_colon_to_dash() {
        let dir = tempfile::tempdir().unwrap();
        let store = HandleStore::new(dir.path().join("handles"));
        let persisted = store.persist(b"x", 0, 1).unwrap();
        let filename = handle_filename(&persisted.handle);
        assert!(!filename.contains(':'));
        assert!(dir.path().join("handles").join(&filename).exists());
    }
}
