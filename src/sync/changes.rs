use crate::areas::repository::Repository;
use crate::artifacts::log::history::{HistoryQuery, HistoryWalker};
use crate::artifacts::objects::object_id::ObjectId;
use crate::backend::revision::RevisionHandle;
use crate::errors::BackendResult;
use crate::sync::notification::SyncNotification;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One accepted ref move of a push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefMove {
    pub reference: String,
    /// Absent for a newly created ref
    pub old: Option<ObjectId>,
    /// Absent for a deleted ref
    pub new: Option<ObjectId>,
}

/// Every path changed by commits reachable from `new` but newer than `old`,
/// mapped to the newest such commit.
///
/// The changes of `old` itself were already seen by whoever pushed it and are
/// left out.
pub fn changed_paths_between(
    repository: &Arc<Repository>,
    old: Option<&ObjectId>,
    new: &ObjectId,
) -> BackendResult<BTreeMap<String, RevisionHandle>> {
    let mut query = HistoryQuery::default().revision(new.to_string());
    if let Some(old) = old {
        query = query.since_revision(old.to_string());
    }

    let mut paths = BTreeMap::new();
    for (oid, commit) in HistoryWalker::new(repository).walk(&query)? {
        if old == Some(&oid) {
            continue;
        }

        let revision = RevisionHandle::new(Arc::clone(repository), oid, commit);
        for path in revision.paths()? {
            // history is newest first, so the first commit seen owns the path
            paths
                .entry(path.clone())
                .or_insert_with(|| revision.clone());
        }
    }

    Ok(paths)
}

/// Notifications for every accepted ref move of one push.
///
/// Deleted refs produce nothing.
pub fn notifications_for_push(
    repository: &Arc<Repository>,
    moves: &[RefMove],
) -> BackendResult<Vec<SyncNotification>> {
    let backend = repository.id();
    let mut notifications = Vec::new();

    for ref_move in moves {
        let Some(new) = &ref_move.new else {
            continue;
        };

        let paths = changed_paths_between(repository, ref_move.old.as_ref(), new)?;
        tracing::debug!(
            %backend,
            reference = %ref_move.reference,
            paths = paths.len(),
            "computed sync notifications"
        );

        notifications.extend(paths.into_iter().map(|(path, revision)| SyncNotification {
            flavor: backend.flavor().to_string(),
            repository: backend.path().to_path_buf(),
            path,
            revision,
        }));
    }

    Ok(notifications)
}
