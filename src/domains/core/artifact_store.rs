use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWrite;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Artifact not found: {0}")]
    NotFound(String),
    #[error("Artifact already exists: {0}")]
    AlreadyExists(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Invalid path component: {0}")]
    InvalidPathComponent(String),
}

pub type ArtifactStoreResult<T> = Result<T, ArtifactStoreError>;

/// Sink handed out by [`ArtifactStore::create`].
pub type ArtifactWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Append-only storage for finished export artifacts.
///
/// Every artifact lives under its job id; a reference, once created, is never
/// written again.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Open a brand new artifact for writing, returning its relative reference.
    /// Fails with `AlreadyExists` rather than overwrite.
    async fn create(&self, job_id: Uuid, file_name: &str) -> ArtifactStoreResult<(String, ArtifactWriter)>;

    async fn read(&self, relative_path: &str) -> ArtifactStoreResult<Vec<u8>>;

    /// Remove a partially written artifact that was never published.
    async fn discard(&self, relative_path: &str) -> ArtifactStoreResult<()>;
}

// --- Local File Storage Implementation ---

pub struct LocalArtifactStore {
    base_path: PathBuf,
}

impl LocalArtifactStore {
    /// Creates the store, ensuring the base directory exists.
    pub fn new(base_path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    /// Sanitizes a path component to prevent directory traversal issues.
    fn sanitize_component(component: &str) -> ArtifactStoreResult<String> {
        if component.is_empty()
            || component.contains('/')
            || component.contains('\\')
            || component == "."
            || component == ".."
        {
            Err(ArtifactStoreError::InvalidPathComponent(component.to_string()))
        } else {
            Ok(component.to_string())
        }
    }

    /// Resolve a stored reference, rejecting anything that escapes the base path.
    fn resolve(&self, relative_path: &str) -> ArtifactStoreResult<PathBuf> {
        let mut abs_path = self.base_path.clone();
        for component in Path::new(relative_path).components() {
            match component {
                Component::Normal(part) => abs_path.push(part),
                _ => {
                    return Err(ArtifactStoreError::PermissionDenied(format!(
                        "Reference escapes the artifact root: {}",
                        relative_path
                    )))
                }
            }
        }
        Ok(abs_path)
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn create(&self, job_id: Uuid, file_name: &str) -> ArtifactStoreResult<(String, ArtifactWriter)> {
        let file_name = Self::sanitize_component(file_name)?;
        let relative_path = format!("{}/{}", job_id, file_name);
        let absolute_path = self.resolve(&relative_path)?;

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&absolute_path)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => ArtifactStoreError::AlreadyExists(relative_path.clone()),
                _ => ArtifactStoreError::Io(e),
            })?;

        log::debug!("Created artifact {}", absolute_path.display());
        Ok((relative_path, Box::new(file)))
    }

    async fn read(&self, relative_path: &str) -> ArtifactStoreResult<Vec<u8>> {
        let absolute_path = self.resolve(relative_path)?;
        match fs::read(&absolute_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ArtifactStoreError::NotFound(relative_path.to_string()))
            }
            Err(e) => Err(ArtifactStoreError::Io(e)),
        }
    }

    async fn discard(&self, relative_path: &str) -> ArtifactStoreResult<()> {
        let absolute_path = self.resolve(relative_path)?;
        match fs::remove_file(&absolute_path).await {
            Ok(_) => Ok(()),
            // Already gone counts as discarded
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArtifactStoreError::Io(e)),
        }
    }
}
