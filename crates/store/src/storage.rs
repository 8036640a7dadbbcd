//! Byte storage capability and its local-disk implementation.
//!
//! Objects are addressed by slash-separated relative keys such as
//! `jobs/{id}/job.json`. Keys are what job records store as locations, so a
//! record never depends on where the storage root is mounted.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

const STAGING_DIR: &str = ".staging";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    fn io(key: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io {
                key: key.to_string(),
                source,
            }
        }
    }
}

/// Durable object storage used for job metadata, inputs and outputs.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Write `bytes` at `key`, replacing any previous object.
    ///
    /// The replacement is atomic for concurrent readers and durable when
    /// this returns.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Read the object at `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Names of the direct children of `prefix`. Empty if `prefix` is absent.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Start streaming a new object to `key`.
    ///
    /// Nothing is visible at `key` until [`ObjectWriter::finish`] succeeds.
    /// Dropping the writer before that discards what was written.
    async fn writer(&self, key: &str) -> Result<Box<dyn ObjectWriter>, StorageError>;

    /// Remove `prefix` and everything below it. Absent prefixes are not an
    /// error.
    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError>;
}

/// Incremental writer returned by [`Storage::writer`].
#[async_trait]
pub trait ObjectWriter: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), StorageError>;

    /// Make the object durable and visible at its key. Writes after a
    /// successful finish are rejected.
    async fn finish(&mut self) -> Result<(), StorageError>;
}

/// [`Storage`] rooted at a local directory.
///
/// Writes go to a uniquely named temporary file in the destination directory,
/// are fsynced, then renamed over the target; the directory is fsynced after
/// the rename so the new entry survives a crash. Streamed objects are staged
/// under `.staging/` at the root until they are finished, so an abandoned
/// upload never creates its destination directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to a path under the root, rejecting anything that could
    /// escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key.contains('\\') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let relative = Path::new(key);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(key, e))?;

        let temp_path = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
        if let Err(e) = write_synced(&temp_path, bytes).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(StorageError::io(key, e));
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(StorageError::io(key, e));
        }
        sync_dir(parent).await.map_err(|e| StorageError::io(key, e))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| StorageError::io(key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io(key, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.resolve(prefix)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(prefix, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(prefix, e))?
        {
            if let Some(name) = entry.file_name().to_str() {
                // Skip in-flight temporary files.
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn writer(&self, key: &str) -> Result<Box<dyn ObjectWriter>, StorageError> {
        let target = self.resolve(key)?;
        let staging = self.root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| StorageError::io(key, e))?;

        let temp = staging.join(format!("{}.tmp", uuid::Uuid::new_v4()));
        let file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| StorageError::io(key, e))?;

        Ok(Box::new(LocalObjectWriter {
            key: key.to_string(),
            file: Some(file),
            temp,
            target,
        }))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        let path = self.resolve(prefix)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(prefix, e)),
        }
    }
}

struct LocalObjectWriter {
    key: String,
    /// `None` once finished.
    file: Option<tokio::fs::File>,
    temp: PathBuf,
    target: PathBuf,
}

impl LocalObjectWriter {
    fn file(&mut self) -> Result<&mut tokio::fs::File, StorageError> {
        self.file.as_mut().ok_or_else(|| StorageError::Io {
            key: self.key.clone(),
            source: io::Error::other("writer already finished"),
        })
    }
}

#[async_trait]
impl ObjectWriter for LocalObjectWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        let key = self.key.clone();
        self.file()?
            .write_all(chunk)
            .await
            .map_err(|e| StorageError::io(&key, e))
    }

    async fn finish(&mut self) -> Result<(), StorageError> {
        let key = self.key.clone();
        self.file()?
            .sync_all()
            .await
            .map_err(|e| StorageError::io(&key, e))?;
        self.file = None;

        let parent = self
            .target
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.clone()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(&key, e))?;
        tokio::fs::rename(&self.temp, &self.target)
            .await
            .map_err(|e| StorageError::io(&key, e))?;
        sync_dir(parent).await.map_err(|e| StorageError::io(&key, e))
    }
}

impl Drop for LocalObjectWriter {
    fn drop(&mut self) {
        // After a successful rename the temp path is gone and this is a no-op.
        let _ = std::fs::remove_file(&self.temp);
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
