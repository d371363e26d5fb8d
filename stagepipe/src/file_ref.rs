//! File references handed between stages.
//!
//! Providers emit references; transformers call [`FileReference::materialize`]
//! to get a local path, whatever the backing store is.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stagepipe_shared::errors::{PipelineError, PipelineResult};

#[async_trait]
pub trait FileReference: Send + Sync {
    /// Identifier of the file in its backing store.
    fn reference(&self) -> &str;

    /// Make the file available locally and return its path.
    async fn materialize(&self) -> PipelineResult<PathBuf>;
}

/// A file already on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    path: PathBuf,
    reference: String,
}

impl LocalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let reference = path.to_string_lossy().into_owned();
        Self { path, reference }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FileReference for LocalFile {
    fn reference(&self) -> &str {
        &self.reference
    }

    async fn materialize(&self) -> PipelineResult<PathBuf> {
        let metadata = tokio::fs::metadata(&self.path).await?;
        if !metadata.is_file() {
            return Err(PipelineError::Storage(format!(
                "{} is not a regular file",
                self.path.display()
            )));
        }
        Ok(self.path.clone())
    }
}
