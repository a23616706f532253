use crate::backend::revision::RevisionHandle;
use crate::backend::{Backend, CommitArgs, CommitJob};
use crate::errors::{BackendError, BackendResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Runs commit jobs on the blocking pool, one at a time per
/// `(flavor, repository, branch)`.
///
/// The caller awaits the outcome. Dropping that future does not stop a job
/// that already started; cancellation is not supported, and the backend's
/// staged set is only cleared once a job is confirmed, so an unconfirmed
/// commit is retried by committing again.
///
/// A key's lock is dropped from the table once no job holds or awaits it.
#[derive(Debug, Default)]
pub struct CommitExecutor {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CommitExecutor {
    pub fn new() -> Self {
        CommitExecutor::default()
    }

    /// Commit what `backend` has staged and clear it on success.
    pub async fn commit(
        &self,
        backend: &mut dyn Backend,
        args: &CommitArgs,
    ) -> BackendResult<Option<RevisionHandle>> {
        let Some(job) = backend.prepare_commit(args)? else {
            return Ok(None);
        };

        let staged_through = job.staged_through();
        let revision = self.submit(job).await?;
        backend.commit_confirmed(staged_through, &revision);
        Ok(Some(revision))
    }

    pub async fn submit(&self, job: CommitJob) -> BackendResult<RevisionHandle> {
        let key = job.lock_key();
        let lock = self.lock_for(&key);

        let backend = job.backend().clone();
        let result = {
            let _guard = lock.lock().await;
            tracing::debug!(%backend, branch = %job.branch(), %key, "running commit job");

            tokio::task::spawn_blocking(move || job.run())
                .await
                .map_err(|error| BackendError::Storage {
                    backend,
                    source: anyhow::anyhow!("commit worker failed: {error}"),
                })
        };

        drop(lock);
        self.release(&key);
        result?
    }

    /// Number of keys with a live lock.
    pub fn active_keys(&self) -> usize {
        self.table().len()
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.table().entry(key.to_string()).or_default().clone()
    }

    /// Forget `key` when only the table still holds its lock.
    fn release(&self, key: &str) {
        let mut locks = self.table();
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::registry::{BackendSettings, GIT_FLAVOR, Registry};
    use assert_fs::TempDir;
    use bytes::Bytes;

    #[tokio::test]
    async fn staged_changes_survive_until_confirmed() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::with_defaults(BackendSettings::default());
        let mut backend = registry.open(GIT_FLAVOR, dir.path()).unwrap();
        backend.init_repo().unwrap();
        let executor = CommitExecutor::new();

        backend.write("a.txt", Bytes::from_static(b"1")).unwrap();
        let failed = executor
            .commit(backend.as_mut(), &CommitArgs::new("on a missing branch").branch("v1"))
            .await;
        assert!(failed.unwrap_err().is_branch_does_not_exist());
        assert!(backend.is_dirty());

        let revision = executor
            .commit(backend.as_mut(), &CommitArgs::new("first"))
            .await
            .unwrap()
            .unwrap();
        assert!(!backend.is_dirty());
        assert_eq!(backend.read("a.txt", Some(&revision.revision().to_string()), None).unwrap(), "1");
    }

    #[tokio::test]
    async fn locks_are_released_after_each_job() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::with_defaults(BackendSettings::default());
        let mut backend = registry.open(GIT_FLAVOR, dir.path()).unwrap();
        backend.init_repo().unwrap();
        let executor = CommitExecutor::new();

        for round in 0..3 {
            backend.write("a.txt", Bytes::from(format!("{round}"))).unwrap();
            executor
                .commit(backend.as_mut(), &CommitArgs::new("round"))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(executor.active_keys(), 0);
        }

        backend.write("b.txt", Bytes::from_static(b"x")).unwrap();
        let failed = executor
            .commit(backend.as_mut(), &CommitArgs::new("on a missing branch").branch("v1"))
            .await;
        assert!(failed.is_err());
        assert_eq!(executor.active_keys(), 0);
    }

    #[test]
    fn operations_staged_during_a_commit_stay_pending() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::with_defaults(BackendSettings::default());
        let mut backend = registry.open(GIT_FLAVOR, dir.path()).unwrap();
        backend.init_repo().unwrap();

        backend.write("a.txt", Bytes::from_static(b"1")).unwrap();
        let job = backend.prepare_commit(&CommitArgs::new("first")).unwrap().unwrap();
        let staged_through = job.staged_through();
        backend.write("b.txt", Bytes::from_static(b"2")).unwrap();

        let revision = job.run().unwrap();
        backend.commit_confirmed(staged_through, &revision);

        assert!(backend.is_dirty());
        assert_eq!(backend.staged().len(), 1);
        let second = backend.commit(&CommitArgs::new("second")).unwrap().unwrap();
        assert_eq!(second.paths().unwrap(), ["b.txt".to_string()]);
        assert!(!backend.is_dirty());
    }

    #[tokio::test]
    async fn nothing_staged_means_no_job() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::with_defaults(BackendSettings::default());
        let mut backend = registry.open(GIT_FLAVOR, dir.path()).unwrap();
        backend.init_repo().unwrap();

        let revision = CommitExecutor::new()
            .commit(backend.as_mut(), &CommitArgs::new("empty"))
            .await
            .unwrap();
        assert!(revision.is_none());
    }
}
