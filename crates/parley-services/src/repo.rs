//! File repository: where uploads land and downloads are served from.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncSeekExt;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("{0} not found")]
    NotFound(PathBuf),
    #[error("offset {offset} is past the end of {path} ({len} bytes)")]
    OffsetPastEnd { path: PathBuf, offset: u64, len: u64 },
    #[error("i/o error on {0}: {1}")]
    Io(PathBuf, std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn exists(path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Create `path` and any missing parents. True if it exists afterwards.
    pub async fn create_dir(path: &Path) -> bool {
        match fs::create_dir_all(path).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "create_dir failed");
                false
            }
        }
    }

    pub fn join_path<I, P>(parts: I) -> PathBuf
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        parts.into_iter().fold(PathBuf::new(), |acc, p| acc.join(p))
    }

    /// Create the root directory if it is missing.
    pub async fn ensure(&self) -> Result<(), RepoError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| RepoError::Io(self.root.clone(), e))
    }

    /// Map a client-supplied name to a path inside the root. Only a single
    /// plain path component is accepted.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, RepoError> {
        let invalid = || RepoError::InvalidName(filename.to_string());
        if filename.is_empty() || filename.contains(['/', '\\', '\0']) {
            return Err(invalid());
        }
        let mut components = Path::new(filename).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {
                Ok(Self::join_path([self.root.as_path(), Path::new(filename)]))
            }
            _ => Err(invalid()),
        }
    }

    /// Open `filename` for reading at `offset`. Returns the file and the
    /// number of bytes left to read.
    pub async fn open_read(&self, filename: &str, offset: u64) -> Result<(File, u64), RepoError> {
        let path = self.resolve(filename)?;
        let mut file = File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RepoError::NotFound(path.clone()),
            _ => RepoError::Io(path.clone(), e),
        })?;
        let len = file
            .metadata()
            .await
            .map_err(|e| RepoError::Io(path.clone(), e))?
            .len();
        if offset > len {
            return Err(RepoError::OffsetPastEnd { path, offset, len });
        }
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| RepoError::Io(path.clone(), e))?;
        Ok((file, len - offset))
    }

    /// Open `filename` for writing. Offset 0 truncates; otherwise the file
    /// is kept and writing resumes at `offset`.
    pub async fn open_write(&self, filename: &str, offset: u64) -> Result<File, RepoError> {
        self.ensure().await?;
        let path = self.resolve(filename)?;
        let mut options = OpenOptions::new();
        options.write(true).create(true);
        if offset == 0 {
            options.truncate(true);
        }
        let mut file = options
            .open(&path)
            .await
            .map_err(|e| RepoError::Io(path.clone(), e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| RepoError::Io(path.clone(), e))?;
        }
        Ok(file)
    }
}
