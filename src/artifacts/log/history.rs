use crate::areas::repository::Repository;
use crate::artifacts::branch::NULL_REVISION;
use crate::artifacts::log::path_filter::PathFilter;
use crate::artifacts::objects::commit::Commit;
use crate::artifacts::objects::object_id::ObjectId;
use crate::errors::{BackendResult, StorageContext};
use chrono::{DateTime, FixedOffset};
use std::collections::{HashSet, VecDeque};

/// Parameters of a history walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Only commits that changed this path
    pub path: Option<String>,
    pub revision: Option<String>,
    pub branch: Option<String>,
    /// Lower bound commit: included itself, its ancestors are not
    pub since_revision: Option<String>,
    /// Commits older than this are dropped and not expanded
    pub since: Option<DateTime<FixedOffset>>,
    /// Newest first by commit time; traversal order otherwise
    pub sort: bool,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        HistoryQuery {
            path: None,
            revision: None,
            branch: None,
            since_revision: None,
            since: None,
            sort: true,
        }
    }
}

impl HistoryQuery {
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn since_revision(mut self, revision: impl Into<String>) -> Self {
        self.since_revision = Some(revision.into());
        self
    }

    pub fn since(mut self, since: DateTime<FixedOffset>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn unsorted(mut self) -> Self {
        self.sort = false;
        self
    }
}

/// Breadth-first walk over the commit graph.
///
/// Starts at one tip when a revision or branch is given, otherwise at every
/// ref. Each commit is visited once however many paths lead to it.
pub struct HistoryWalker<'r> {
    repository: &'r Repository,
}

impl<'r> HistoryWalker<'r> {
    pub fn new(repository: &'r Repository) -> Self {
        HistoryWalker { repository }
    }

    #[tracing::instrument(name = "history", skip_all, fields(backend = %self.repository.id()))]
    pub fn walk(&self, query: &HistoryQuery) -> BackendResult<Vec<(ObjectId, Commit)>> {
        let repository = self.repository;
        let backend = repository.id();

        if query.revision.as_deref() == Some(NULL_REVISION) {
            return Ok(Vec::new());
        }

        let path_filter = match &query.path {
            Some(path) => Some(PathFilter::new(repository.database(), repository.parse_path(path)?)),
            None => None,
        };

        let mut since = query.since;
        let since_oid = match query.since_revision.as_deref() {
            Some(revision) if revision != NULL_REVISION => {
                let oid = repository.resolve_revision(revision)?;
                let commit_time = repository.load_commit(&oid)?.timestamp();
                since = Some(since.map_or(commit_time, |since| since.max(commit_time)));
                Some(oid)
            }
            _ => None,
        };

        let mut pending = VecDeque::new();
        if query.revision.is_some() || query.branch.is_some() {
            pending.push_back(
                repository.resolve_commit(query.revision.as_deref(), query.branch.as_deref())?,
            );
        } else {
            let refs = repository.refs().list_refs().storage(backend)?;
            pending.extend(refs.into_iter().map(|(_, oid)| oid));
        }

        let mut visited = HashSet::new();
        let mut result = Vec::new();

        while let Some(oid) = pending.pop_front() {
            if !visited.insert(oid.clone()) {
                continue;
            }

            let commit = repository.load_commit(&oid)?;
            if since.is_some_and(|since| commit.timestamp() < since) {
                continue;
            }

            if since_oid.as_ref() != Some(&oid) {
                pending.extend(commit.parents().iter().cloned());
            }

            if let Some(filter) = &path_filter
                && !filter.matches(&commit).storage(backend)?
            {
                continue;
            }

            result.push((oid, commit));
        }

        if query.sort {
            result.sort_by(|(_, a), (_, b)| b.timestamp().cmp(&a.timestamp()));
        }

        tracing::debug!(
            visited = visited.len(),
            matched = result.len(),
            "walked history"
        );
        Ok(result)
    }
}
