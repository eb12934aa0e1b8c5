use std::fmt::Write;
use std::fs::{read_dir, remove_dir, remove_file};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use super::{FilesystemStoreConfig, StoreError, ValueStore};

/// A [`ValueStore`] persisting JSON encoded values on the file system.
///
/// Every key maps to a single file, the path of which is derived from the SHA-256 hash of the
/// key. Files are written to a temporary location first and then moved into place, so readers
/// never observe partially written values.
pub struct FilesystemStore<V> {
    path: PathBuf,
    ttl: Option<Duration>,
    _value: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for FilesystemStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemStore")
            .field("path", &self.path)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Statistics of a [`FilesystemStore::cleanup`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl<V> FilesystemStore<V> {
    /// Opens the store, creating its root directory if necessary.
    pub fn from_config(config: &FilesystemStoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.path)?;
        Ok(Self {
            path: config.path.clone(),
            ttl: config.ttl,
            _value: PhantomData,
        })
    }

    /// Returns the root directory of this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the file holding the value for `key`.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `aa/bbccdd/eeff...`
    pub fn value_path(&self, key: &str) -> PathBuf {
        let hash = Sha256::digest(key.as_bytes());

        let mut path = format!("{:02x}/", hash[0]);
        for b in &hash[1..4] {
            write!(path, "{b:02x}").unwrap();
        }
        path.push('/');
        for b in &hash[4..] {
            write!(path, "{b:02x}").unwrap();
        }
        self.path.join(path)
    }

    fn tmp_dir(&self) -> PathBuf {
        self.path.join(".tmp")
    }

    /// Whether a file last modified at `modified` is past its time to live.
    fn is_expired(&self, modified: SystemTime) -> bool {
        match self.ttl {
            Some(ttl) => modified.elapsed().map(|age| age >= ttl).unwrap_or(false),
            None => false,
        }
    }

    /// Removes all expired values from the store, along with directories left empty.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<CleanupStats, StoreError> {
        tracing::info!("Cleaning up filesystem store at `{}`", self.path.display());

        let mut stats = CleanupStats::default();
        self.cleanup_directory_recursive(&self.path, &mut stats, dry_run)?;

        tracing::info!(
            "Retained {} directories and {} files, totaling {} bytes",
            stats.retained_dirs,
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} directories and {} files, totaling {} bytes",
            stats.removed_dirs,
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("coalescer.store.fs.files") = stats.retained_files as u64);
        metric!(gauge("coalescer.store.fs.bytes") = stats.retained_bytes);
        metric!(counter("coalescer.store.fs.files_removed") += stats.removed_files as i64);

        Ok(stats)
    }

    /// Cleans up the directory recursively, returning `true` if the directory is left empty
    /// after cleanup.
    fn cleanup_directory_recursive(
        &self,
        directory: &Path,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> io::Result<bool> {
        let entries = match catch_not_found(|| read_dir(directory))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", directory.display());
                return Ok(true);
            }
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let mut dir_is_empty = self.cleanup_directory_recursive(&path, stats, dry_run)?;
                if dir_is_empty && !dry_run {
                    tracing::debug!("Removing directory `{}`", path.display());
                    if let Err(e) = remove_dir(&path) {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            path = %path.display(),
                            "Failed to remove store directory",
                        );
                        dir_is_empty = false;
                    }
                }
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                match self.try_cleanup_path(&path, stats, dry_run) {
                    Err(e) => {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            path = %path.display(),
                            "Failed to clean store file",
                        );
                        is_empty = false;
                    }
                    Ok(file_removed) => is_empty &= file_removed,
                }
            }
        }

        Ok(is_empty)
    }

    /// Tries to clean up the file at `path`, returning `true` if it was removed.
    fn try_cleanup_path(
        &self,
        path: &Path,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> io::Result<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        let size = metadata.len();

        if self.is_expired(metadata.modified()?) {
            tracing::debug!("Removing file `{}`", path.display());
            if !dry_run {
                catch_not_found(|| remove_file(path))?;
            }

            stats.removed_bytes += size;
            stats.removed_files += 1;

            return Ok(true);
        }
        stats.retained_bytes += size;
        stats.retained_files += 1;

        Ok(false)
    }
}

#[async_trait]
impl<V> ValueStore<V> for FilesystemStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        let path = self.value_path(key);
        tracing::trace!("Reading stored value at `{}`", path.display());

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if self.is_expired(metadata.modified()?) {
            tracing::trace!("Stored value at `{}` expired", path.display());
            return Ok(None);
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            // cleaned up concurrently
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn set(&self, key: &str, value: V) -> Result<bool, StoreError> {
        let path = self.value_path(key);
        let contents = serde_json::to_vec(&value)?;

        let temp_dir = self.tmp_dir();
        tokio::fs::create_dir_all(&temp_dir).await?;
        let temp_file = NamedTempFile::new_in(&temp_dir)?;
        let mut dest = tokio::fs::File::from_std(temp_file.reopen()?);
        dest.write_all(&contents).await?;
        dest.flush().await?;
        drop(dest);

        persist_tempfile(temp_file, &path)?;
        tracing::trace!("Stored value at `{}`", path.display());

        Ok(true)
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist value"))?;

    // A concurrent `cleanup` could remove the parent directories we are operating in, so
    // retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                if retries > MAX_RETRIES {
                    return Err(e.error);
                }
            }
        }
    }
}

fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
