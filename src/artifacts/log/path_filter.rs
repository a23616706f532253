use crate::areas::database::Database;
use crate::artifacts::database::database_entry::DatabaseEntry;
use crate::artifacts::objects::commit::Commit;
use crate::artifacts::objects::entry_mode::EntryMode;
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::tree::lookup::get_by_path;
use crate::artifacts::tree::repo_path::RepoPath;

/// Decides whether a commit touched one literal path.
///
/// Paths are compared segment by segment and the walk stops at the first
/// level where both sides point at the same object, so unchanged subtrees are
/// never loaded. Renames are not followed.
#[derive(Debug)]
pub struct PathFilter<'d> {
    database: &'d Database,
    path: RepoPath,
}

impl<'d> PathFilter<'d> {
    pub fn new(database: &'d Database, path: RepoPath) -> Self {
        PathFilter { database, path }
    }

    pub fn path(&self) -> &RepoPath {
        &self.path
    }

    /// A commit matches when the path differs from at least one parent; a
    /// root commit matches when the path exists in it.
    pub fn matches(&self, commit: &Commit) -> anyhow::Result<bool> {
        let tree_oid = commit.tree_oid();
        if commit.parents().is_empty() {
            return self.exists_in(tree_oid);
        }

        for parent in commit.parents() {
            let parent_commit = self.database.load_commit(parent)?;
            if self.differs(tree_oid, parent_commit.tree_oid())? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    pub fn exists_in(&self, tree_oid: &ObjectId) -> anyhow::Result<bool> {
        Ok(get_by_path(self.database, tree_oid, self.path.segments())?.is_some())
    }

    /// Whether the object at the path differs between two trees. A path
    /// missing on both sides does not differ.
    pub fn differs(&self, tree_a: &ObjectId, tree_b: &ObjectId) -> anyhow::Result<bool> {
        let mut a = DatabaseEntry::new(tree_a.clone(), EntryMode::Directory);
        let mut b = DatabaseEntry::new(tree_b.clone(), EntryMode::Directory);

        for segment in self.path.segments() {
            if a == b {
                return Ok(false);
            }

            match (self.child(&a, segment)?, self.child(&b, segment)?) {
                (Some(child_a), Some(child_b)) => {
                    if child_a.mode != child_b.mode {
                        return Ok(true);
                    }
                    a = child_a;
                    b = child_b;
                }
                (child_a, child_b) => return Ok(child_a.is_some() != child_b.is_some()),
            }
        }

        Ok(a.oid != b.oid)
    }

    fn child(&self, entry: &DatabaseEntry, name: &str) -> anyhow::Result<Option<DatabaseEntry>> {
        if !entry.is_tree() {
            return Ok(None);
        }

        Ok(self.database.load_tree(&entry.oid)?.get(name).cloned())
    }
}
