use crate::areas::refs::RefUpdate;
use crate::areas::repository::Repository;
use crate::artifacts::branch::branch_name::BranchName;
use crate::artifacts::objects::commit::{Author, Commit};
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::staging::change_set::StagedChangeSet;
use crate::artifacts::tree::builder::{TreeBuildError, TreeBuilder};
use crate::errors::{BackendError, BackendResult, StorageContext};

/// Everything a commit needs besides the staged changes
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub message: String,
    pub branch: BranchName,
    pub author: Author,
    pub committer: Author,
    /// Explicit parent; the branch tip when `None`
    pub parent: Option<ObjectId>,
}

/// Turns a staged change set into a commit on a branch.
///
/// Objects are persisted before the ref moves, and the ref only moves if it
/// still points where it did when the commit started.
pub struct CommitEngine<'r> {
    repository: &'r Repository,
}

impl<'r> CommitEngine<'r> {
    pub fn new(repository: &'r Repository) -> Self {
        CommitEngine { repository }
    }

    #[tracing::instrument(
        name = "commit",
        skip_all,
        fields(backend = %self.repository.id(), branch = %request.branch)
    )]
    pub fn commit(
        &self,
        changes: &StagedChangeSet,
        request: &CommitRequest,
    ) -> BackendResult<(ObjectId, Commit)> {
        let repository = self.repository;
        let backend = repository.id();
        let database = repository.database();

        let tip = repository.branch_tip(&request.branch)?;
        let parent = match &request.parent {
            Some(parent) => {
                repository.load_commit(parent)?;
                Some(parent.clone())
            }
            None => tip.clone(),
        };

        if parent.is_none() && &request.branch != repository.default_branch() {
            return Err(BackendError::BranchDoesNotExist {
                backend: backend.clone(),
                branch: request.branch.to_string(),
            });
        }

        let base_tree = match &parent {
            Some(parent) => Some(repository.load_commit(parent)?.tree_oid().clone()),
            None => None,
        };

        let mut builder = TreeBuilder::new(database, base_tree.as_ref()).storage(backend)?;
        builder
            .apply(changes)
            .map_err(|error| self.build_error(error))?;
        let tree_oid = builder.persist().storage(backend)?;

        let commit = Commit::new(
            parent.iter().cloned().collect(),
            tree_oid,
            request.author.clone(),
            request.committer.clone(),
            request.message.clone(),
        );
        let commit_oid = database.store(&commit).storage(backend)?;

        let reference = request.branch.to_sym_ref_name();
        match repository
            .refs()
            .compare_and_swap(&reference, tip.as_ref(), Some(&commit_oid))
            .storage(backend)?
        {
            RefUpdate::Applied => {
                tracing::info!(
                    commit = %commit_oid.to_short_oid(),
                    changes = changes.len(),
                    "committed"
                );
                Ok((commit_oid, commit))
            }
            RefUpdate::Stale { current } => {
                tracing::warn!(
                    expected = ?tip.as_ref().map(ObjectId::to_short_oid),
                    found = ?current.as_ref().map(ObjectId::to_short_oid),
                    "branch moved during commit"
                );
                Err(BackendError::StaleRef {
                    backend: backend.clone(),
                    reference: reference.to_string(),
                    expected: tip,
                    found: current,
                })
            }
        }
    }

    fn build_error(&self, error: anyhow::Error) -> BackendError {
        let backend = self.repository.id().clone();
        match error.downcast_ref::<TreeBuildError>() {
            Some(TreeBuildError::NotADirectory(path)) => BackendError::InvalidPath {
                backend,
                path: path.clone(),
                reason: "a parent segment is a file".to_string(),
            },
            Some(TreeBuildError::MissingSource(path)) => BackendError::FileDoesNotExist {
                backend,
                path: path.clone(),
                reason: "does not exist and cannot be renamed".to_string(),
            },
            None => BackendError::Storage {
                backend,
                source: error,
            },
        }
    }
}
