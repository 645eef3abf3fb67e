// One JSON file per feed url, named by its SHA-256. Keys not read or
// written since `open` are removed by `clean`.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

use crate::document::CachedDocument;
use crate::error::CacheError;

pub struct Cache {
    dir: PathBuf,
    seen: Mutex<HashSet<String>>,
}

impl Cache {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            seen: Mutex::new(HashSet::new()),
        })
    }

    pub fn key(url: &str) -> String {
        format!("{:x}", Sha256::digest(url.as_bytes()))
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn seen(&self) -> MutexGuard<'_, HashSet<String>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn is_seen(&self, url: &str) -> bool {
        self.seen().contains(&Self::key(url))
    }

    /// Looks up the document for `url`. A hit marks it as used this run.
    pub fn get(&self, url: &str) -> Result<Option<CachedDocument>, CacheError> {
        let key = Self::key(url);
        let path = self.path(&key);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        self.seen().insert(key);

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CacheError::Corrupt { path, source })
    }

    /// Stores `document` under `url` and returns what was stored.
    pub fn put(
        &self,
        url: &str,
        document: impl Into<CachedDocument>,
        old_url: Option<&str>,
    ) -> CachedDocument {
        let mut document = document.into();
        document.url = url.to_string();

        let key = Self::key(url);
        self.seen().insert(key.clone());

        if let Err(e) = self.write(&key, &document) {
            error!("Failed to cache {}: {}", url, e);
        }

        if let Some(old_url) = old_url {
            let old_key = Self::key(old_url);
            if old_key != key {
                self.seen().remove(&old_key);
                match fs::remove_file(self.path(&old_key)) {
                    Ok(()) => debug!("Dropped cache entry for {}", old_url),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => error!("Failed to drop cache entry for {}: {}", old_url, e),
                }
            }
        }

        document
    }

    fn write(&self, key: &str, document: &CachedDocument) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(document)?;
        let path = self.path(key);
        write_atomically(&path, &bytes).map_err(|source| CacheError::Io { path, source })
    }

    pub fn clean(&self) -> Result<usize, CacheError> {
        let io_error = |source| CacheError::Io {
            path: self.dir.clone(),
            source,
        };
        let seen = self.seen();

        let mut removed = 0;
        for entry in fs::read_dir(&self.dir).map_err(io_error)? {
            let entry = entry.map_err(io_error)?;
            if !entry.file_type().map_err(io_error)?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if seen.contains(name.to_string_lossy().as_ref()) {
                continue;
            }
            let path = entry.path();
            fs::remove_file(&path).map_err(|source| CacheError::Io {
                path: path.clone(),
                source,
            })?;
            debug!("Evicted {}", path.display());
            removed += 1;
        }

        info!("Removed {} unused cache entries", removed);
        Ok(removed)
    }
}

/// Readers see either the old or the new contents, never a partial write.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
