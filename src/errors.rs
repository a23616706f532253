//! Backend error kinds
//!
//! Every error raised by a backend carries the [`BackendId`] of the backend
//! that produced it, so callers juggling several repositories in one unit of
//! work can tell which one failed.

use crate::artifacts::objects::object_id::ObjectId;
use derive_new::new;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Identifies a backend instance: its flavor tag and repository path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, new)]
pub struct BackendId {
    flavor: String,
    path: PathBuf,
}

impl BackendId {
    pub fn flavor(&self) -> &str {
        &self.flavor
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.flavor, self.path.display())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{backend}: '{path}' {reason}")]
    FileDoesNotExist {
        backend: BackendId,
        path: String,
        reason: String,
    },

    #[error("{backend}: branch '{branch}' does not exist")]
    BranchDoesNotExist { backend: BackendId, branch: String },

    #[error("{backend}: branch '{branch}' already exists")]
    BranchAlreadyExists { backend: BackendId, branch: String },

    #[error("{backend}: commit '{revision}' does not exist")]
    CommitDoesNotExist { backend: BackendId, revision: String },

    #[error(
        "{backend}: ref {reference} moved concurrently (expected {}, found {})",
        display_oid(.expected.as_ref()),
        display_oid(.found.as_ref())
    )]
    StaleRef {
        backend: BackendId,
        reference: String,
        expected: Option<ObjectId>,
        found: Option<ObjectId>,
    },

    #[error("{backend}: invalid path '{path}': {reason}")]
    InvalidPath {
        backend: BackendId,
        path: String,
        reason: String,
    },

    #[error("{backend}: invalid branch name '{name}'")]
    InvalidBranchName { backend: BackendId, name: String },

    #[error("no backend registered for flavor '{0}'")]
    UnknownFlavor(String),

    #[error("{backend}: storage failure: {source:#}")]
    Storage {
        backend: BackendId,
        #[source]
        source: anyhow::Error,
    },
}

impl BackendError {
    /// The backend that raised this error, if any.
    pub fn backend(&self) -> Option<&BackendId> {
        match self {
            BackendError::FileDoesNotExist { backend, .. }
            | BackendError::BranchDoesNotExist { backend, .. }
            | BackendError::BranchAlreadyExists { backend, .. }
            | BackendError::CommitDoesNotExist { backend, .. }
            | BackendError::StaleRef { backend, .. }
            | BackendError::InvalidPath { backend, .. }
            | BackendError::InvalidBranchName { backend, .. }
            | BackendError::Storage { backend, .. } => Some(backend),
            BackendError::UnknownFlavor(_) => None,
        }
    }

    pub fn is_file_does_not_exist(&self) -> bool {
        matches!(self, BackendError::FileDoesNotExist { .. })
    }

    pub fn is_branch_does_not_exist(&self) -> bool {
        matches!(self, BackendError::BranchDoesNotExist { .. })
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Lifts `anyhow` plumbing errors into [`BackendError::Storage`].
pub trait StorageContext<T> {
    fn storage(self, backend: &BackendId) -> BackendResult<T>;
}

impl<T> StorageContext<T> for anyhow::Result<T> {
    fn storage(self, backend: &BackendId) -> BackendResult<T> {
        self.map_err(|source| BackendError::Storage {
            backend: backend.clone(),
            source,
        })
    }
}

fn display_oid(oid: Option<&ObjectId>) -> String {
    oid.map(|oid| oid.to_string())
        .unwrap_or_else(|| "nothing".to_string())
}
