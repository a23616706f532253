use crate::backend::context::WorkContext;
use crate::backend::revision::RevisionHandle;
use crate::sync::notification::{SyncNotification, SyncObserver};
use crate::errors::BackendResult;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;

/// Maps one kind of record onto files of a repository.
pub trait RecordAdapter: Send + Sync {
    type Record;

    fn flavor(&self) -> &str;

    fn repository(&self) -> &Path;

    /// Where the record lives; `None` when it should not be stored at all.
    fn resolve_path(&self, record: &Self::Record) -> Option<String>;

    /// Branch the record is read from; the default branch when `None`.
    fn resolve_branch(&self, record: &Self::Record) -> Option<String> {
        let _ = record;
        None
    }

    fn resolve_data(&self, record: &Self::Record) -> Bytes;

    /// Records currently stored at any of `paths`.
    fn records_at(&self, paths: &[String]) -> anyhow::Result<Vec<Self::Record>>;

    /// Refresh `record` from a pushed revision and persist it. `data` is
    /// `None` when the path no longer exists at `revision`.
    fn apply_synced(
        &self,
        record: &mut Self::Record,
        data: Option<Bytes>,
        revision: &RevisionHandle,
    ) -> anyhow::Result<()>;
}

/// Lifecycle event of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    Created,
    /// `previous_path` is where the record was stored before the update
    Updated { previous_path: Option<String> },
    Deleted,
}

/// Connects an adapter to units of work (outbound) and to sync
/// notifications (inbound).
#[derive(Debug)]
pub struct AdapterBinding<A> {
    adapter: Arc<A>,
}

impl<A> Clone for AdapterBinding<A> {
    fn clone(&self) -> Self {
        AdapterBinding {
            adapter: Arc::clone(&self.adapter),
        }
    }
}

impl<A: RecordAdapter> AdapterBinding<A> {
    pub fn new(adapter: Arc<A>) -> Self {
        AdapterBinding { adapter }
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    /// Stage whatever `event` implies for `record` on the context's backend.
    pub fn on_event(
        &self,
        context: &mut WorkContext,
        record: &A::Record,
        event: &RecordEvent,
    ) -> BackendResult<()> {
        let adapter = self.adapter.as_ref();
        let backend = context.backend(adapter.flavor(), adapter.repository())?;

        let old_path = match event {
            RecordEvent::Created => None,
            RecordEvent::Updated { previous_path } => previous_path.clone(),
            RecordEvent::Deleted => {
                if let Some(path) = adapter.resolve_path(record) {
                    backend.delete(&path)?;
                }
                return Ok(());
            }
        };
        let new_path = adapter.resolve_path(record);
        let renamed = old_path.is_some() && old_path != new_path;

        let branch = adapter.resolve_branch(record);
        let old_data = match &old_path {
            Some(path) => match backend.read(path, None, branch.as_deref()) {
                Ok(data) => Some(data),
                Err(error) if error.is_file_does_not_exist() || error.is_branch_does_not_exist() => None,
                Err(error) => return Err(error),
            },
            None => None,
        };

        match (new_path, old_path) {
            (None, Some(old_path)) => backend.delete(&old_path)?,
            (None, None) => {}
            (Some(new_path), old_path) => {
                let new_data = adapter.resolve_data(record);
                if old_data.as_ref() != Some(&new_data) {
                    backend.write(&new_path, new_data)?;
                    if let Some(old_path) = old_path.filter(|_| renamed) {
                        backend.delete(&old_path)?;
                    }
                } else if let Some(old_path) = old_path.filter(|_| renamed) {
                    backend.rename(&old_path, &new_path)?;
                }
            }
        }

        Ok(())
    }
}

impl<A: RecordAdapter> SyncObserver for AdapterBinding<A> {
    fn flavor(&self) -> &str {
        self.adapter.flavor()
    }

    fn on_sync(&self, notification: &SyncNotification) -> anyhow::Result<()> {
        if notification.repository != self.adapter.repository() {
            return Ok(());
        }

        let data = match notification.revision.read(&notification.path) {
            Ok(data) => Some(data),
            Err(error) if error.is_file_does_not_exist() => None,
            Err(error) => return Err(error.into()),
        };

        let records = self
            .adapter
            .records_at(std::slice::from_ref(&notification.path))?;
        for mut record in records {
            self.adapter
                .apply_synced(&mut record, data.clone(), &notification.revision)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CommitArgs;
    use crate::backend::registry::{BackendSettings, GIT_FLAVOR, Registry};
    use assert_fs::TempDir;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Page {
        slug: Option<String>,
        body: String,
    }

    #[derive(Debug)]
    struct PageAdapter {
        repository: PathBuf,
        synced: Mutex<Vec<(String, Option<String>)>>,
    }

    impl RecordAdapter for PageAdapter {
        type Record = Page;

        fn flavor(&self) -> &str {
            GIT_FLAVOR
        }

        fn repository(&self) -> &Path {
            &self.repository
        }

        fn resolve_path(&self, record: &Page) -> Option<String> {
            record.slug.as_ref().map(|slug| format!("pages/{slug}.md"))
        }

        fn resolve_data(&self, record: &Page) -> Bytes {
            Bytes::from(record.body.clone())
        }

        fn records_at(&self, paths: &[String]) -> anyhow::Result<Vec<Page>> {
            Ok(paths
                .iter()
                .filter_map(|path| path.strip_prefix("pages/")?.strip_suffix(".md"))
                .map(|slug| Page {
                    slug: Some(slug.to_string()),
                    body: String::new(),
                })
                .collect())
        }

        fn apply_synced(
            &self,
            record: &mut Page,
            data: Option<Bytes>,
            _revision: &RevisionHandle,
        ) -> anyhow::Result<()> {
            let body = data.map(|data| String::from_utf8_lossy(&data).into_owned());
            if let Some(body) = &body {
                record.body = body.clone();
            }
            self.synced
                .lock()
                .unwrap()
                .push((record.slug.clone().unwrap_or_default(), body));
            Ok(())
        }
    }

    fn setup() -> (TempDir, Arc<Registry>, AdapterBinding<PageAdapter>) {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(Registry::with_defaults(BackendSettings::default()));
        registry.open(GIT_FLAVOR, dir.path()).unwrap().init_repo().unwrap();
        let binding = AdapterBinding::new(Arc::new(PageAdapter {
            repository: dir.path().to_path_buf(),
            synced: Mutex::new(Vec::new()),
        }));
        (dir, registry, binding)
    }

    fn page(slug: &str, body: &str) -> Page {
        Page {
            slug: Some(slug.to_string()),
            body: body.to_string(),
        }
    }

    fn save(registry: &Arc<Registry>, binding: &AdapterBinding<PageAdapter>, record: &Page, event: RecordEvent) {
        let (_, report) = WorkContext::run(Arc::clone(registry), &CommitArgs::new("save"), |context| {
            binding.on_event(context, record, &event)
        })
        .unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn created_records_are_written() {
        let (dir, registry, binding) = setup();

        save(&registry, &binding, &page("home", "hello"), RecordEvent::Created);

        let backend = registry.open(GIT_FLAVOR, dir.path()).unwrap();
        assert_eq!(backend.read("pages/home.md", None, None).unwrap(), "hello");
    }

    #[test]
    fn renamed_records_with_unchanged_data_are_moved() {
        let (dir, registry, binding) = setup();
        save(&registry, &binding, &page("home", "hello"), RecordEvent::Created);

        save(
            &registry,
            &binding,
            &page("start", "hello"),
            RecordEvent::Updated {
                previous_path: Some("pages/home.md".to_string()),
            },
        );

        let backend = registry.open(GIT_FLAVOR, dir.path()).unwrap();
        assert_eq!(backend.read("pages/start.md", None, None).unwrap(), "hello");
        assert!(backend
            .read("pages/home.md", None, None)
            .unwrap_err()
            .is_file_does_not_exist());
    }

    #[test]
    fn renamed_records_with_new_data_replace_the_old_file() {
        let (dir, registry, binding) = setup();
        save(&registry, &binding, &page("home", "hello"), RecordEvent::Created);

        save(
            &registry,
            &binding,
            &page("start", "welcome"),
            RecordEvent::Updated {
                previous_path: Some("pages/home.md".to_string()),
            },
        );

        let backend = registry.open(GIT_FLAVOR, dir.path()).unwrap();
        assert_eq!(backend.read("pages/start.md", None, None).unwrap(), "welcome");
        assert!(backend.read("pages/home.md", None, None).is_err());
    }

    #[test]
    fn records_losing_their_path_are_deleted() {
        let (dir, registry, binding) = setup();
        save(&registry, &binding, &page("home", "hello"), RecordEvent::Created);
        save(&registry, &binding, &page("other", "keep"), RecordEvent::Created);

        let unpublished = Page {
            slug: None,
            body: "hello".to_string(),
        };
        save(
            &registry,
            &binding,
            &unpublished,
            RecordEvent::Updated {
                previous_path: Some("pages/home.md".to_string()),
            },
        );

        let backend = registry.open(GIT_FLAVOR, dir.path()).unwrap();
        assert!(backend.read("pages/home.md", None, None).is_err());
        assert_eq!(backend.read("pages/other.md", None, None).unwrap(), "keep");
    }

    #[test]
    fn unchanged_records_stage_nothing() {
        let (_dir, registry, binding) = setup();
        save(&registry, &binding, &page("home", "hello"), RecordEvent::Created);

        let mut context = WorkContext::new(Arc::clone(&registry));
        binding
            .on_event(
                &mut context,
                &page("home", "hello"),
                &RecordEvent::Updated {
                    previous_path: Some("pages/home.md".to_string()),
                },
            )
            .unwrap();

        let adapter = binding.adapter();
        let backend = context.backend(adapter.flavor(), adapter.repository()).unwrap();
        assert!(!backend.is_dirty());
    }

    #[test]
    fn sync_refreshes_records_from_the_pushed_revision() {
        let (dir, registry, binding) = setup();
        let mut backend = registry.open(GIT_FLAVOR, dir.path()).unwrap();
        backend.write("pages/home.md", Bytes::from_static(b"pushed")).unwrap();
        let revision = backend.commit(&CommitArgs::new("push")).unwrap().unwrap();

        let notification = SyncNotification {
            flavor: GIT_FLAVOR.to_string(),
            repository: dir.path().to_path_buf(),
            path: "pages/home.md".to_string(),
            revision,
        };
        binding.on_sync(&notification).unwrap();

        let synced = binding.adapter().synced.lock().unwrap().clone();
        assert_eq!(synced, vec![("home".to_string(), Some("pushed".to_string()))]);
    }

    #[test]
    fn sync_ignores_other_repositories() {
        let (dir, registry, binding) = setup();
        let mut backend = registry.open(GIT_FLAVOR, dir.path()).unwrap();
        backend.write("pages/home.md", Bytes::from_static(b"pushed")).unwrap();
        let revision = backend.commit(&CommitArgs::new("push")).unwrap().unwrap();

        let notification = SyncNotification {
            flavor: GIT_FLAVOR.to_string(),
            repository: PathBuf::from("/elsewhere"),
            path: "pages/home.md".to_string(),
            revision,
        };
        binding.on_sync(&notification).unwrap();

        assert!(binding.adapter().synced.lock().unwrap().is_empty());
    }
}
