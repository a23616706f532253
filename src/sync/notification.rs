use crate::backend::revision::RevisionHandle;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// One path changed by an inbound push, with the newest commit that changed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncNotification {
    pub flavor: String,
    pub repository: PathBuf,
    pub path: String,
    pub revision: RevisionHandle,
}

/// Consumer of sync notifications for one flavor.
pub trait SyncObserver: Send + Sync {
    fn flavor(&self) -> &str;

    fn on_sync(&self, notification: &SyncNotification) -> anyhow::Result<()>;
}

/// Observers registered per flavor.
///
/// Dispatch is robust: an observer failing is logged and does not stop the
/// remaining observers or notifications.
#[derive(Default)]
pub struct SyncHub {
    observers: RwLock<BTreeMap<String, Vec<Arc<dyn SyncObserver>>>>,
}

/// Counts from one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

impl SyncHub {
    pub fn new() -> Self {
        SyncHub::default()
    }

    pub fn register(&self, observer: Arc<dyn SyncObserver>) {
        let flavor = observer.flavor().to_string();
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(flavor)
            .or_default()
            .push(observer);
    }

    pub fn observer_count(&self, flavor: &str) -> usize {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(flavor)
            .map_or(0, Vec::len)
    }

    pub fn dispatch(&self, notifications: &[SyncNotification]) -> DispatchReport {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut report = DispatchReport::default();

        for notification in notifications {
            let Some(targets) = observers.get(&notification.flavor) else {
                continue;
            };

            for observer in targets {
                match observer.on_sync(notification) {
                    Ok(()) => report.delivered += 1,
                    Err(error) => {
                        report.failed += 1;
                        tracing::warn!(
                            flavor = %notification.flavor,
                            path = %notification.path,
                            revision = %notification.revision.revision().to_short_oid(),
                            error = format!("{error:#}"),
                            "sync observer failed"
                        );
                    }
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for SyncHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f.debug_struct("SyncHub")
            .field(
                "observers",
                &observers
                    .iter()
                    .map(|(flavor, list)| (flavor.clone(), list.len()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
