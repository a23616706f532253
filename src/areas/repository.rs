use crate::areas::database::Database;
use crate::areas::refs::Refs;
use crate::artifacts::branch::NULL_REVISION;
use crate::artifacts::branch::branch_name::BranchName;
use crate::artifacts::branch::revision::Revision;
use crate::artifacts::objects::commit::Commit;
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::tree::lookup::{WalkEntry, get_by_path, walk};
use crate::artifacts::tree::repo_path::RepoPath;
use crate::errors::{BackendError, BackendId, BackendResult, StorageContext};
use anyhow::Context;
use bytes::Bytes;
use std::path::Path;

const BARE_CONFIG: &str = "[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = true\n";

/// A bare repository: object database plus refs, with no working tree.
///
/// Everything here is safe to share across threads; the only mutable state
/// lives on disk behind the ref compare-and-swap.
#[derive(Debug)]
pub struct Repository {
    id: BackendId,
    database: Database,
    refs: Refs,
    default_branch: BranchName,
}

impl Repository {
    pub fn open(id: BackendId, default_branch: BranchName) -> Self {
        let path = id.path().to_path_buf();
        Repository {
            database: Database::new(path.join("objects").into_boxed_path()),
            refs: Refs::new(path.into_boxed_path()),
            id,
            default_branch,
        }
    }

    pub fn parse_default_branch(id: &BackendId, name: &str) -> BackendResult<BranchName> {
        BranchName::try_parse(name.to_string()).map_err(|_| BackendError::InvalidBranchName {
            backend: id.clone(),
            name: name.to_string(),
        })
    }

    /// Create the on-disk layout with HEAD pointing at the default branch.
    pub fn init(&self) -> BackendResult<()> {
        self.init_layout().storage(&self.id)?;
        tracing::info!(backend = %self.id, branch = %self.default_branch, "initialized repository");
        Ok(())
    }

    fn init_layout(&self) -> anyhow::Result<()> {
        let path = self.path();
        for dir in ["objects/info", "objects/pack", "refs/heads", "refs/tags"] {
            std::fs::create_dir_all(path.join(dir))
                .with_context(|| format!("failed to create {}", path.join(dir).display()))?;
        }

        if !self.refs.head_path().exists() {
            self.refs.set_head(&self.default_branch.to_sym_ref_name())?;
        }
        let config_path = path.join("config");
        if !config_path.exists() {
            std::fs::write(&config_path, BARE_CONFIG)
                .with_context(|| format!("failed to write {}", config_path.display()))?;
        }

        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.database.objects_path().is_dir() && self.refs.head_path().is_file()
    }

    pub fn delete(&self) -> BackendResult<()> {
        if self.path().exists() {
            std::fs::remove_dir_all(self.path())
                .with_context(|| format!("failed to remove {}", self.path().display()))
                .storage(&self.id)?;
            tracing::info!(backend = %self.id, "deleted repository");
        }
        Ok(())
    }

    pub fn id(&self) -> &BackendId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        self.id.path()
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn refs(&self) -> &Refs {
        &self.refs
    }

    pub fn default_branch(&self) -> &BranchName {
        &self.default_branch
    }

    pub fn parse_path(&self, path: &str) -> BackendResult<RepoPath> {
        RepoPath::try_parse(path).map_err(|error| BackendError::InvalidPath {
            backend: self.id.clone(),
            path: path.to_string(),
            reason: error.to_string(),
        })
    }

    pub fn parse_branch(&self, branch: Option<&str>) -> BackendResult<BranchName> {
        match branch {
            None => Ok(self.default_branch.clone()),
            Some(name) => BranchName::try_parse(name.to_string()).map_err(|_| {
                BackendError::InvalidBranchName {
                    backend: self.id.clone(),
                    name: name.to_string(),
                }
            }),
        }
    }

    pub fn branch_tip(&self, branch: &BranchName) -> BackendResult<Option<ObjectId>> {
        self.refs.read_branch(branch).storage(&self.id)
    }

    /// Resolve `revision`, or else the tip of `branch` (default branch when absent).
    pub fn resolve_commit(&self, revision: Option<&str>, branch: Option<&str>) -> BackendResult<ObjectId> {
        if let Some(revision) = revision {
            return self.resolve_revision(revision);
        }

        let branch = self.parse_branch(branch)?;
        self.branch_tip(&branch)?
            .ok_or_else(|| BackendError::BranchDoesNotExist {
                backend: self.id.clone(),
                branch: branch.to_string(),
            })
    }

    pub fn resolve_revision(&self, revision: &str) -> BackendResult<ObjectId> {
        let not_found = || BackendError::CommitDoesNotExist {
            backend: self.id.clone(),
            revision: revision.to_string(),
        };

        let parsed = Revision::try_parse(revision).map_err(|_| not_found())?;
        parsed
            .resolve(self)
            .storage(&self.id)?
            .ok_or_else(not_found)
    }

    pub fn load_commit(&self, oid: &ObjectId) -> BackendResult<Commit> {
        self.database
            .parse_object_as_commit(oid)
            .storage(&self.id)?
            .ok_or_else(|| BackendError::CommitDoesNotExist {
                backend: self.id.clone(),
                revision: oid.to_string(),
            })
    }

    /// Content of the regular file at `path` in `commit`.
    pub fn read_file(&self, commit: &ObjectId, path: &RepoPath) -> BackendResult<Bytes> {
        let tree_oid = self.load_commit(commit)?.tree_oid().clone();
        let entry = get_by_path(&self.database, &tree_oid, path.segments()).storage(&self.id)?;

        let missing = |reason: &str| BackendError::FileDoesNotExist {
            backend: self.id.clone(),
            path: path.to_string(),
            reason: format!("{reason} at {}", commit.to_short_oid()),
        };
        match entry {
            None => Err(missing("does not exist")),
            Some(entry) if !entry.mode.is_regular_file() => Err(missing("is not a regular file")),
            Some(entry) => {
                let blob = self
                    .database
                    .parse_object_as_blob(&entry.oid)
                    .storage(&self.id)?
                    .ok_or_else(|| missing("is not a blob"))?;
                Ok(blob.into_content())
            }
        }
    }

    pub fn read(&self, path: &str, revision: Option<&str>, branch: Option<&str>) -> BackendResult<Bytes> {
        if revision == Some(NULL_REVISION) {
            return Err(BackendError::FileDoesNotExist {
                backend: self.id.clone(),
                path: path.to_string(),
                reason: "does not exist before the first revision".to_string(),
            });
        }

        let path = self.parse_path(path)?;
        let commit = self.resolve_commit(revision, branch)?;
        self.read_file(&commit, &path)
    }

    pub fn walk(&self, path: &str, revision: Option<&str>, branch: Option<&str>) -> BackendResult<Vec<WalkEntry>> {
        let dir = RepoPath::try_parse_dir(path).map_err(|error| BackendError::InvalidPath {
            backend: self.id.clone(),
            path: path.to_string(),
            reason: error.to_string(),
        })?;
        let commit = self.resolve_commit(revision, branch)?;
        let tree_oid = self.load_commit(&commit)?.tree_oid().clone();

        match get_by_path(&self.database, &tree_oid, dir.segments()).storage(&self.id)? {
            Some(entry) if entry.is_tree() => walk(&self.database, &entry.oid, &dir).storage(&self.id),
            _ => Err(BackendError::FileDoesNotExist {
                backend: self.id.clone(),
                path: dir.to_string(),
                reason: "is not a directory".to_string(),
            }),
        }
    }
}
