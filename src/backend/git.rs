use crate::areas::repository::Repository;
use crate::artifacts::branch::manager::BranchManager;
use crate::artifacts::commit::engine::CommitRequest;
use crate::artifacts::log::history::{HistoryQuery, HistoryWalker};
use crate::artifacts::objects::commit::Author;
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::staging::change_set::StagedChangeSet;
use crate::artifacts::tree::lookup::WalkEntry;
use crate::backend::registry::BackendSettings;
use crate::backend::revision::RevisionHandle;
use crate::backend::{Backend, CommitArgs, CommitJob};
use crate::config::{Encoding, Identity};
use crate::errors::{BackendId, BackendResult};
use bytes::Bytes;
use std::sync::Arc;

/// Identity used when neither the commit nor the configuration names one
pub const FALLBACK_COMMITTER: &str = "vellum <vellum@localhost>";

/// Backend over a bare loose-object repository.
#[derive(Debug)]
pub struct GitBackend {
    repository: Arc<Repository>,
    changes: StagedChangeSet,
    identity: Identity,
    encoding: Encoding,
}

impl GitBackend {
    pub fn open(id: BackendId, settings: &BackendSettings) -> BackendResult<Self> {
        let default_branch = Repository::parse_default_branch(&id, &settings.default_branch)?;

        Ok(GitBackend {
            repository: Arc::new(Repository::open(id, default_branch)),
            changes: StagedChangeSet::default(),
            identity: settings.identity.clone(),
            encoding: settings.default_encoding,
        })
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    fn handle(&self, oid: ObjectId) -> BackendResult<RevisionHandle> {
        let commit = self.repository.load_commit(&oid)?;
        Ok(RevisionHandle::new(Arc::clone(&self.repository), oid, commit))
    }
}

impl Backend for GitBackend {
    fn id(&self) -> &BackendId {
        self.repository.id()
    }

    fn default_encoding(&self) -> Encoding {
        self.encoding
    }

    fn read(&self, path: &str, revision: Option<&str>, branch: Option<&str>) -> BackendResult<Bytes> {
        self.repository.read(path, revision, branch)
    }

    fn write(&mut self, path: &str, data: Bytes) -> BackendResult<()> {
        let path = self.repository.parse_path(path)?;
        self.changes.write(path, data);
        Ok(())
    }

    fn delete(&mut self, path: &str) -> BackendResult<()> {
        let path = self.repository.parse_path(path)?;
        self.changes.delete(path);
        Ok(())
    }

    fn rename(&mut self, old_path: &str, new_path: &str) -> BackendResult<()> {
        let old_path = self.repository.parse_path(old_path)?;
        let new_path = self.repository.parse_path(new_path)?;
        self.changes.rename(old_path, new_path);
        Ok(())
    }

    fn rollback(&mut self) {
        if self.changes.is_dirty() {
            tracing::debug!(backend = %self.id(), discarded = self.changes.len(), "rolled back staged changes");
        }
        self.changes.rollback();
    }

    fn is_dirty(&self) -> bool {
        self.changes.is_dirty()
    }

    fn staged(&self) -> &StagedChangeSet {
        &self.changes
    }

    fn prepare_commit(&self, args: &CommitArgs) -> BackendResult<Option<CommitJob>> {
        if !args.force && !self.changes.is_dirty() {
            return Ok(None);
        }

        let repository = &self.repository;
        let branch = repository.parse_branch(args.branch.as_deref())?;
        let parent = args
            .parent
            .as_deref()
            .map(|parent| repository.resolve_revision(parent))
            .transpose()?;

        let committer = args
            .committer
            .clone()
            .or_else(|| self.identity.committer())
            .unwrap_or_else(|| FALLBACK_COMMITTER.to_string());
        let author = args.author.clone().unwrap_or_else(|| committer.clone());
        let timestamp = args
            .timestamp
            .unwrap_or_else(|| chrono::Local::now().fixed_offset());

        let request = CommitRequest {
            message: args.message.clone(),
            branch,
            author: Author::from_identity(&author, timestamp),
            committer: Author::from_identity(&committer, timestamp),
            parent,
        };

        Ok(Some(CommitJob::new(
            Arc::clone(repository),
            self.changes.clone(),
            request,
        )))
    }

    fn commit_confirmed(&mut self, staged_through: u64, revision: &RevisionHandle) {
        tracing::debug!(backend = %self.id(), revision = %revision, staged_through, "commit confirmed");
        self.changes.clear_through(staged_through);
    }

    fn revision(&self, revision: Option<&str>, branch: Option<&str>) -> BackendResult<RevisionHandle> {
        let oid = self.repository.resolve_commit(revision, branch)?;
        self.handle(oid)
    }

    fn history(&self, query: &HistoryQuery) -> BackendResult<Vec<RevisionHandle>> {
        Ok(HistoryWalker::new(&self.repository)
            .walk(query)?
            .into_iter()
            .map(|(oid, commit)| RevisionHandle::new(Arc::clone(&self.repository), oid, commit))
            .collect())
    }

    fn walk(&self, path: &str, revision: Option<&str>, branch: Option<&str>) -> BackendResult<Vec<WalkEntry>> {
        self.repository.walk(path, revision, branch)
    }

    fn has_branch(&self, name: &str) -> BackendResult<bool> {
        BranchManager::new(&self.repository).has_branch(name)
    }

    fn create_branch(&self, name: &str, revision: Option<&str>) -> BackendResult<()> {
        BranchManager::new(&self.repository).create_branch(name, revision)
    }

    fn delete_branch(&self, name: &str) -> BackendResult<()> {
        BranchManager::new(&self.repository).delete_branch(name)
    }

    fn rename_branch(&self, old_name: &str, new_name: &str) -> BackendResult<()> {
        BranchManager::new(&self.repository).rename_branch(old_name, new_name)
    }

    fn list_branches(&self) -> BackendResult<Vec<String>> {
        Ok(BranchManager::new(&self.repository)
            .list_branches()?
            .into_iter()
            .map(|branch| branch.to_string())
            .collect())
    }

    fn init_repo(&self) -> BackendResult<()> {
        self.repository.init()
    }

    fn delete_repo(&self) -> BackendResult<()> {
        self.repository.delete()
    }

    fn repo_exists(&self) -> bool {
        self.repository.exists()
    }
}
