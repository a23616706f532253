//! Record-facing storage backends
//!
//! A backend wraps one repository and one staged change set. Callers stage
//! writes, deletes and renames, then commit them as one revision:
//!
//! - `git`: the backend over the loose-object repository
//! - `revision`: resolved commits with lazily computed paths and diffs
//! - `registry`: flavor tag to backend factory
//! - `context`: backends touched by one unit of work, committed or rolled
//!   back together
//! - `executor`: asynchronous commit worker serialized per branch

pub mod context;
pub mod executor;
pub mod git;
pub mod registry;
pub mod revision;

use crate::areas::repository::Repository;
use crate::artifacts::branch::branch_name::BranchName;
use crate::artifacts::commit::engine::{CommitEngine, CommitRequest};
use crate::artifacts::log::history::HistoryQuery;
use crate::artifacts::staging::change_set::StagedChangeSet;
use crate::artifacts::tree::lookup::WalkEntry;
use crate::config::Encoding;
use crate::errors::{BackendId, BackendResult, StorageContext};
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use revision::RevisionHandle;
use sha1::{Digest, Sha1};
use std::sync::Arc;

/// Arguments of a commit, shared by every backend of a unit of work
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitArgs {
    pub message: String,
    /// Default branch when absent
    pub branch: Option<String>,
    /// Identity string; the configured identity when absent
    pub committer: Option<String>,
    /// Identity string; the committer when absent
    pub author: Option<String>,
    /// Commit even when nothing is staged
    pub force: bool,
    /// Explicit parent revision; the branch tip when absent
    pub parent: Option<String>,
    /// Author and commit time; local time when absent
    pub timestamp: Option<DateTime<FixedOffset>>,
}

impl CommitArgs {
    pub fn new(message: impl Into<String>) -> Self {
        CommitArgs {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn committer(mut self, committer: impl Into<String>) -> Self {
        self.committer = Some(committer.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<FixedOffset>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A commit that is ready to run: a snapshot of the staged changes plus the
/// fully resolved request.
///
/// The backend keeps its own staged set until the job is confirmed, so a
/// failed job can simply be resubmitted.
#[derive(Debug, Clone)]
pub struct CommitJob {
    repository: Arc<Repository>,
    changes: StagedChangeSet,
    request: CommitRequest,
}

impl CommitJob {
    pub fn new(repository: Arc<Repository>, changes: StagedChangeSet, request: CommitRequest) -> Self {
        CommitJob {
            repository,
            changes,
            request,
        }
    }

    pub fn backend(&self) -> &BackendId {
        self.repository.id()
    }

    pub fn branch(&self) -> &BranchName {
        &self.request.branch
    }

    /// Last staged operation included in this job.
    pub fn staged_through(&self) -> u64 {
        self.changes.sequence()
    }

    /// Serialization key: SHA-1 of `flavor#path#branch`.
    pub fn lock_key(&self) -> String {
        let backend = self.repository.id();
        let key = format!(
            "{}#{}#{}",
            backend.flavor(),
            backend.path().display(),
            self.request.branch
        );
        format!("{:x}", Sha1::digest(key.as_bytes()))
    }

    /// Run the commit on the calling thread.
    pub fn run(self) -> BackendResult<RevisionHandle> {
        let engine = CommitEngine::new(&self.repository);
        let (oid, commit) = engine.commit(&self.changes, &self.request)?;
        Ok(RevisionHandle::new(self.repository, oid, commit))
    }
}

/// Storage contract seen by records and adapters.
///
/// Reads never see staged changes. `commit` turns everything staged into one
/// revision; the staged set survives a failed commit.
pub trait Backend: Send + Sync {
    fn id(&self) -> &BackendId;

    fn flavor(&self) -> &str {
        self.id().flavor()
    }

    fn default_encoding(&self) -> Encoding;

    fn read(&self, path: &str, revision: Option<&str>, branch: Option<&str>) -> BackendResult<Bytes>;

    fn read_text(
        &self,
        path: &str,
        revision: Option<&str>,
        branch: Option<&str>,
        encoding: Option<Encoding>,
    ) -> BackendResult<String> {
        let data = self.read(path, revision, branch)?;
        encoding
            .unwrap_or_else(|| self.default_encoding())
            .decode(&data)
            .storage(self.id())
    }

    fn write(&mut self, path: &str, data: Bytes) -> BackendResult<()>;

    fn write_text(&mut self, path: &str, text: &str, encoding: Option<Encoding>) -> BackendResult<()> {
        let data = encoding
            .unwrap_or_else(|| self.default_encoding())
            .encode(text)
            .storage(self.id())?;
        self.write(path, data)
    }

    fn delete(&mut self, path: &str) -> BackendResult<()>;

    fn rename(&mut self, old_path: &str, new_path: &str) -> BackendResult<()>;

    fn rollback(&mut self);

    fn is_dirty(&self) -> bool;

    fn staged(&self) -> &StagedChangeSet;

    /// Resolve `args` against the current state; `None` when there is nothing
    /// to commit and `force` is unset.
    fn prepare_commit(&self, args: &CommitArgs) -> BackendResult<Option<CommitJob>>;

    /// Acknowledge a confirmed commit: operations staged up to
    /// `staged_through` are cleared, later ones stay pending.
    fn commit_confirmed(&mut self, staged_through: u64, revision: &RevisionHandle);

    fn commit(&mut self, args: &CommitArgs) -> BackendResult<Option<RevisionHandle>> {
        let Some(job) = self.prepare_commit(args)? else {
            return Ok(None);
        };

        let staged_through = job.staged_through();
        let revision = job.run()?;
        self.commit_confirmed(staged_through, &revision);
        Ok(Some(revision))
    }

    fn revision(&self, revision: Option<&str>, branch: Option<&str>) -> BackendResult<RevisionHandle>;

    fn history(&self, query: &HistoryQuery) -> BackendResult<Vec<RevisionHandle>>;

    fn walk(&self, path: &str, revision: Option<&str>, branch: Option<&str>) -> BackendResult<Vec<WalkEntry>>;

    fn has_branch(&self, name: &str) -> BackendResult<bool>;

    fn create_branch(&self, name: &str, revision: Option<&str>) -> BackendResult<()>;

    fn delete_branch(&self, name: &str) -> BackendResult<()>;

    fn rename_branch(&self, old_name: &str, new_name: &str) -> BackendResult<()>;

    fn list_branches(&self) -> BackendResult<Vec<String>>;

    fn init_repo(&self) -> BackendResult<()>;

    fn delete_repo(&self) -> BackendResult<()>;

    fn repo_exists(&self) -> bool;
}

/// Run `f` against `backend`, committing on success and rolling back on
/// failure.
pub fn commit_on_success<B, T, F>(backend: &mut B, args: &CommitArgs, f: F) -> BackendResult<T>
where
    B: Backend + ?Sized,
    F: FnOnce(&mut B) -> BackendResult<T>,
{
    match f(backend) {
        Ok(value) => {
            backend.commit(args)?;
            Ok(value)
        }
        Err(error) => {
            backend.rollback();
            Err(error)
        }
    }
}
