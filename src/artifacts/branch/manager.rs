use crate::areas::refs::RefUpdate;
use crate::areas::repository::Repository;
use crate::artifacts::branch::branch_name::BranchName;
use crate::errors::{BackendError, BackendResult, StorageContext};

/// Create, delete, rename and check branches of one repository.
pub struct BranchManager<'r> {
    repository: &'r Repository,
}

impl<'r> BranchManager<'r> {
    pub fn new(repository: &'r Repository) -> Self {
        BranchManager { repository }
    }

    pub fn has_branch(&self, name: &str) -> BackendResult<bool> {
        let branch = self.repository.parse_branch(Some(name))?;
        Ok(self.repository.branch_tip(&branch)?.is_some())
    }

    /// Create `name` at `revision`, or at the default branch tip.
    pub fn create_branch(&self, name: &str, revision: Option<&str>) -> BackendResult<()> {
        let branch = self.repository.parse_branch(Some(name))?;
        let source = self.repository.resolve_commit(revision, None)?;

        match self
            .repository
            .refs()
            .create_branch(&branch, &source)
            .storage(self.repository.id())?
        {
            RefUpdate::Applied => {
                tracing::info!(
                    backend = %self.repository.id(),
                    %branch,
                    at = %source.to_short_oid(),
                    "created branch"
                );
                Ok(())
            }
            RefUpdate::Stale { .. } => Err(self.already_exists(&branch)),
        }
    }

    pub fn delete_branch(&self, name: &str) -> BackendResult<()> {
        let branch = self.repository.parse_branch(Some(name))?;

        match self
            .repository
            .refs()
            .delete_branch(&branch)
            .storage(self.repository.id())?
        {
            Some(oid) => {
                tracing::info!(
                    backend = %self.repository.id(),
                    %branch,
                    was = %oid.to_short_oid(),
                    "deleted branch"
                );
                Ok(())
            }
            None => Err(self.does_not_exist(&branch)),
        }
    }

    /// Create `new` at the tip of `old`, then delete `old`.
    pub fn rename_branch(&self, old: &str, new: &str) -> BackendResult<()> {
        let old_branch = self.repository.parse_branch(Some(old))?;
        let new_branch = self.repository.parse_branch(Some(new))?;

        let tip = self
            .repository
            .branch_tip(&old_branch)?
            .ok_or_else(|| self.does_not_exist(&old_branch))?;
        if old_branch == new_branch {
            return Ok(());
        }

        match self
            .repository
            .refs()
            .create_branch(&new_branch, &tip)
            .storage(self.repository.id())?
        {
            RefUpdate::Applied => {}
            RefUpdate::Stale { .. } => return Err(self.already_exists(&new_branch)),
        }

        self.delete_branch(old)
    }

    pub fn list_branches(&self) -> BackendResult<Vec<BranchName>> {
        self.repository
            .refs()
            .list_branches()
            .storage(self.repository.id())
    }

    fn already_exists(&self, branch: &BranchName) -> BackendError {
        BackendError::BranchAlreadyExists {
            backend: self.repository.id().clone(),
            branch: branch.to_string(),
        }
    }

    fn does_not_exist(&self, branch: &BranchName) -> BackendError {
        BackendError::BranchDoesNotExist {
            backend: self.repository.id().clone(),
            branch: branch.to_string(),
        }
    }
}
