use crate::areas::repository::Repository;
use crate::artifacts::branch::NULL_REVISION;
use crate::artifacts::diff::content_diff::{DEV_NULL, Diff};
use crate::artifacts::diff::tree_diff::changed_paths;
use crate::artifacts::objects::commit::Commit;
use crate::artifacts::objects::object_id::ObjectId;
use crate::errors::{BackendError, BackendId, BackendResult, StorageContext};
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use std::sync::{Arc, OnceLock};

/// A resolved commit of one backend.
///
/// Everything derived from the commit (changed paths, diffs) is computed from
/// the pinned commit id, never from a branch name, so a handle stays
/// consistent while the branch moves on.
#[derive(Debug, Clone)]
pub struct RevisionHandle {
    repository: Arc<Repository>,
    oid: ObjectId,
    commit: Commit,
    paths: OnceLock<Vec<String>>,
}

impl RevisionHandle {
    pub fn new(repository: Arc<Repository>, oid: ObjectId, commit: Commit) -> Self {
        RevisionHandle {
            repository,
            oid,
            commit,
            paths: OnceLock::new(),
        }
    }

    pub fn backend(&self) -> &BackendId {
        self.repository.id()
    }

    pub fn revision(&self) -> &ObjectId {
        &self.oid
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    /// Content of `path` as of this commit.
    pub fn read(&self, path: &str) -> BackendResult<Bytes> {
        self.repository.read(path, Some(&self.oid.to_string()), None)
    }

    /// First parent id, or the null revision for a root commit.
    pub fn parent_revision(&self) -> String {
        self.commit
            .parent()
            .map(ObjectId::to_string)
            .unwrap_or_else(|| NULL_REVISION.to_string())
    }

    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    pub fn message(&self) -> &str {
        self.commit.message()
    }

    pub fn author(&self) -> String {
        self.commit.author().display_name()
    }

    pub fn committer(&self) -> String {
        self.commit.committer().display_name()
    }

    pub fn author_time(&self) -> DateTime<FixedOffset> {
        self.commit.author().timestamp()
    }

    pub fn commit_time(&self) -> DateTime<FixedOffset> {
        self.commit.timestamp()
    }

    /// Files changed relative to the first parent, computed once.
    pub fn paths(&self) -> BackendResult<&[String]> {
        if let Some(paths) = self.paths.get() {
            return Ok(paths);
        }

        let paths = changed_paths(self.repository.database(), &self.commit)
            .storage(self.repository.id())?;
        Ok(self.paths.get_or_init(|| paths))
    }

    /// Diff of one changed path; paths this commit did not touch are rejected.
    pub fn diff(&self, path: &str) -> BackendResult<Diff> {
        if !self.paths()?.iter().any(|changed| changed == path) {
            return Err(BackendError::FileDoesNotExist {
                backend: self.backend().clone(),
                path: path.to_string(),
                reason: format!("was not changed in {}", self.oid.to_short_oid()),
            });
        }

        self.build_diff(path)
    }

    pub fn diffs(&self) -> BackendResult<Vec<Diff>> {
        self.paths()?
            .iter()
            .map(|path| self.build_diff(path))
            .collect()
    }

    /// Unified diff of every changed path, joined by newlines.
    pub fn udiff(&self) -> BackendResult<String> {
        Ok(self
            .diffs()?
            .iter()
            .map(Diff::udiff)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn build_diff(&self, path: &str) -> BackendResult<Diff> {
        let parent_revision = self.parent_revision();
        let revision = self.oid.to_string();

        let (a, fromfile) = self.read_side(path, &parent_revision)?;
        let (b, tofile) = self.read_side(path, &revision)?;

        Ok(Diff::new(a, b, fromfile, tofile, parent_revision, revision))
    }

    /// A path missing at `revision` reads as empty content named `/dev/null`.
    fn read_side(&self, path: &str, revision: &str) -> BackendResult<(Bytes, String)> {
        match self.repository.read(path, Some(revision), None) {
            Ok(content) => Ok((content, path.to_string())),
            Err(error) if error.is_file_does_not_exist() => {
                Ok((Bytes::new(), DEV_NULL.to_string()))
            }
            Err(error) => Err(error),
        }
    }
}

impl PartialEq for RevisionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.oid == other.oid && self.backend() == other.backend()
    }
}

impl Eq for RevisionHandle {}

impl std::fmt::Display for RevisionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.oid.to_short_oid(), self.commit.short_message())
    }
}
