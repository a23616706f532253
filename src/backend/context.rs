use crate::backend::registry::Registry;
use crate::backend::revision::RevisionHandle;
use crate::backend::{Backend, CommitArgs};
use crate::errors::{BackendError, BackendId, BackendResult};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::path::Path;
use std::sync::Arc;

/// Backends touched during one logical unit of work.
///
/// Each `(flavor, path)` is opened once per context and dropped with it, so
/// staged changes never leak into unrelated work. Committing a context is a
/// best-effort loop over independent repositories, not an atomic commit:
/// one backend failing does not undo the others.
pub struct WorkContext {
    registry: Arc<Registry>,
    backends: BTreeMap<BackendId, Box<dyn Backend>>,
}

/// Outcome of committing every backend of a context
#[derive(Debug, Default)]
pub struct TransactionReport {
    pub committed: Vec<(BackendId, Option<RevisionHandle>)>,
    pub failed: Vec<(BackendId, BackendError)>,
}

impl TransactionReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Revisions actually created; backends with nothing staged are skipped.
    pub fn revisions(&self) -> impl Iterator<Item = &RevisionHandle> {
        self.committed
            .iter()
            .filter_map(|(_, revision)| revision.as_ref())
    }
}

impl WorkContext {
    pub fn new(registry: Arc<Registry>) -> Self {
        WorkContext {
            registry,
            backends: BTreeMap::new(),
        }
    }

    /// Run `f` in a fresh context, then commit every touched backend when it
    /// succeeds or roll them all back when it fails.
    pub fn run<T, F>(registry: Arc<Registry>, args: &CommitArgs, f: F) -> BackendResult<(T, TransactionReport)>
    where
        F: FnOnce(&mut WorkContext) -> BackendResult<T>,
    {
        let mut context = WorkContext::new(registry);
        match f(&mut context) {
            Ok(value) => Ok((value, context.commit_all(args))),
            Err(error) => {
                context.rollback_all();
                Err(error)
            }
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The context's backend for `(flavor, path)`, opened on first use.
    pub fn backend(&mut self, flavor: &str, path: &Path) -> BackendResult<&mut dyn Backend> {
        let id = BackendId::new(flavor.to_string(), path.to_path_buf());
        let backend = match self.backends.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.registry.open(flavor, path)?),
        };

        Ok(backend.as_mut())
    }

    pub fn touched(&self) -> impl Iterator<Item = &BackendId> {
        self.backends.keys()
    }

    pub fn commit_all(&mut self, args: &CommitArgs) -> TransactionReport {
        let mut report = TransactionReport::default();

        for (id, backend) in self.backends.iter_mut() {
            match backend.commit(args) {
                Ok(revision) => report.committed.push((id.clone(), revision)),
                Err(error) => {
                    tracing::warn!(backend = %id, %error, "commit failed, staged changes kept");
                    report.failed.push((id.clone(), error));
                }
            }
        }

        report
    }

    pub fn rollback_all(&mut self) {
        for backend in self.backends.values_mut() {
            backend.rollback();
        }
    }
}

impl std::fmt::Debug for WorkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkContext")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}
