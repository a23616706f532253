//! In-memory tree mutation with structural sharing.
//!
//! A mutation at `a/b/c.txt` only rebuilds the spine `root -> a -> a/b`.
//! Every other subtree keeps its address. New objects are held in memory
//! until [`TreeBuilder::persist`] writes the ones reachable from the final
//! root, children before parents.

use crate::areas::database::Database;
use crate::artifacts::database::database_entry::DatabaseEntry;
use crate::artifacts::objects::blob::Blob;
use crate::artifacts::objects::entry_mode::{EntryMode, FileMode};
use crate::artifacts::objects::object::Object;
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::tree::Tree;
use crate::artifacts::staging::change_set::{ChangeOp, StagedChangeSet};
use crate::artifacts::tree::repo_path::RepoPath;
use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeBuildError {
    #[error("'{0}' is a file, not a directory")]
    NotADirectory(String),
    #[error("'{0}' does not exist")]
    MissingSource(String),
}

/// One directory level on the path to a mutation
#[derive(Debug, Clone)]
pub struct SpineLevel {
    pub mode: EntryMode,
    pub name: String,
    pub tree: Tree,
}

/// Root-first list of directory levels.
#[derive(Debug, Clone)]
pub struct Spine {
    pub levels: Vec<SpineLevel>,
    /// How many trailing levels did not exist and were synthesized empty
    pub missing: usize,
}

impl Spine {
    fn leaf(&mut self) -> &mut Tree {
        // a spine always holds at least the root level
        let last = self.levels.len() - 1;
        &mut self.levels[last].tree
    }
}

pub struct TreeBuilder<'d> {
    database: &'d Database,
    root: Tree,
    trees: HashMap<ObjectId, Tree>,
    blobs: HashMap<ObjectId, Blob>,
}

impl<'d> TreeBuilder<'d> {
    /// Start from the tree at `root`, or from an empty tree.
    pub fn new(database: &'d Database, root: Option<&ObjectId>) -> anyhow::Result<Self> {
        let mut builder = TreeBuilder {
            database,
            root: Tree::default(),
            trees: HashMap::new(),
            blobs: HashMap::new(),
        };

        match root {
            Some(oid) => builder.root = database.load_tree(oid)?,
            None => {
                let empty = Tree::default();
                builder.trees.insert(empty.object_id()?, empty);
            }
        }

        Ok(builder)
    }

    pub fn root(&self) -> &Tree {
        &self.root
    }

    pub fn root_oid(&self) -> anyhow::Result<ObjectId> {
        self.root.object_id()
    }

    fn load_tree(&self, oid: &ObjectId) -> anyhow::Result<Tree> {
        match self.trees.get(oid) {
            Some(tree) => Ok(tree.clone()),
            None => self.database.load_tree(oid),
        }
    }

    /// Walk `dir` down from `root`, synthesizing empty levels past the deepest
    /// existing directory.
    pub fn collect(&self, root: &Tree, dir: &[String]) -> anyhow::Result<Spine> {
        let mut levels = vec![SpineLevel {
            mode: EntryMode::Directory,
            name: String::new(),
            tree: root.clone(),
        }];
        let mut missing = 0;

        for (depth, segment) in dir.iter().enumerate() {
            let parent = &levels[levels.len() - 1].tree;
            let tree = match parent.get(segment) {
                Some(entry) if missing == 0 && entry.is_tree() => self.load_tree(&entry.oid)?,
                Some(_) if missing == 0 => {
                    return Err(TreeBuildError::NotADirectory(dir[..=depth].join("/")).into());
                }
                _ => {
                    missing += 1;
                    Tree::default()
                }
            };

            levels.push(SpineLevel {
                mode: EntryMode::Directory,
                name: segment.clone(),
                tree,
            });
        }

        tracing::trace!(depth = levels.len(), missing, "collected spine");
        Ok(Spine { levels, missing })
    }

    /// Relink `spine` leaf to root and return the new root tree.
    ///
    /// A level left empty is dropped from its parent instead of linked, so
    /// deletes never leave empty directories behind.
    pub fn link(&mut self, spine: Spine) -> anyhow::Result<Tree> {
        let mut levels = spine.levels;

        while levels.len() > 1 {
            let Some(level) = levels.pop() else { break };
            let last = levels.len() - 1;
            let parent = &mut levels[last].tree;

            if level.tree.is_empty() {
                parent.remove(&level.name);
            } else {
                let oid = level.tree.object_id()?;
                parent.insert(level.name, DatabaseEntry::new(oid.clone(), level.mode));
                self.trees.insert(oid, level.tree);
            }
        }

        let root = levels
            .pop()
            .map(|level| level.tree)
            .unwrap_or_default();
        self.trees.insert(root.object_id()?, root.clone());

        Ok(root)
    }

    pub fn write(&mut self, path: &RepoPath, data: Bytes) -> anyhow::Result<()> {
        let mut spine = self.collect(&self.root, path.parent_segments())?;

        let blob = Blob::new(data);
        let oid = blob.object_id()?;
        self.blobs.insert(oid.clone(), blob);

        let leaf = spine.leaf();
        let mode = match leaf.get(path.file_name()) {
            Some(entry) if entry.mode == EntryMode::File(FileMode::Executable) => entry.mode,
            _ => EntryMode::File(FileMode::Regular),
        };
        leaf.insert(path.file_name(), DatabaseEntry::new(oid, mode));

        self.root = self.link(spine)?;
        Ok(())
    }

    /// Remove the entry at `path`; returns whether anything was removed.
    pub fn delete(&mut self, path: &RepoPath) -> anyhow::Result<bool> {
        let mut spine = self.collect(&self.root, path.parent_segments())?;
        if spine.missing > 0 || spine.leaf().remove(path.file_name()).is_none() {
            return Ok(false);
        }

        self.root = self.link(spine)?;
        Ok(true)
    }

    pub fn rename(&mut self, from: &RepoPath, to: &RepoPath) -> anyhow::Result<()> {
        let mut source = self.collect(&self.root, from.parent_segments())?;
        let entry = match source.missing {
            0 => source.leaf().remove(from.file_name()),
            _ => None,
        }
        .ok_or_else(|| TreeBuildError::MissingSource(from.to_string()))?;
        self.root = self.link(source)?;

        // the destination spine is collected against the updated root
        let mut destination = self.collect(&self.root, to.parent_segments())?;
        destination.leaf().insert(to.file_name(), entry);
        self.root = self.link(destination)?;

        Ok(())
    }

    /// Replay every staged operation, in staging order, on the working root.
    pub fn apply(&mut self, changes: &StagedChangeSet) -> anyhow::Result<()> {
        for (path, op) in changes.in_order() {
            match op {
                ChangeOp::Write(data) => self.write(path, data.clone())?,
                ChangeOp::Delete => {
                    self.delete(path)?;
                }
                ChangeOp::Rename(source) => self.rename(source, path)?,
            }
        }

        Ok(())
    }

    /// Write every new object reachable from the root and return the root id.
    pub fn persist(&self) -> anyhow::Result<ObjectId> {
        let root_oid = self.root_oid()?;
        let mut written = 0;
        self.persist_tree(&root_oid, &mut written)?;

        tracing::debug!(root = %root_oid.to_short_oid(), written, "persisted tree");
        Ok(root_oid)
    }

    fn persist_tree(&self, oid: &ObjectId, written: &mut usize) -> anyhow::Result<()> {
        let Some(tree) = self.trees.get(oid) else {
            return Ok(());
        };

        for (_, entry) in tree.entries() {
            if entry.is_tree() {
                self.persist_tree(&entry.oid, written)?;
            } else if let Some(blob) = self.blobs.get(&entry.oid) {
                self.database.store(blob)?;
                *written += 1;
            }
        }

        self.database.store(tree)?;
        *written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::tree::lookup::get_by_path;
    use assert_fs::TempDir;
    use pretty_assertions::assert_eq;

    fn path(raw: &str) -> RepoPath {
        RepoPath::try_parse(raw).unwrap()
    }

    fn database(dir: &TempDir) -> Database {
        Database::new(dir.path().join("objects").into_boxed_path())
    }

    fn read(database: &Database, root: &ObjectId, raw: &str) -> Option<Bytes> {
        let entry = get_by_path(database, root, path(raw).segments()).unwrap()?;
        Some(database.parse_object_as_blob(&entry.oid).unwrap()?.into_content())
    }

    #[test]
    fn writes_synthesize_missing_directories() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let database = database(&dir);

        let mut builder = TreeBuilder::new(&database, None)?;
        builder.write(&path("a/b/c.txt"), Bytes::from_static(b"deep"))?;
        let root = builder.persist()?;

        assert_eq!(read(&database, &root, "a/b/c.txt"), Some(Bytes::from_static(b"deep")));
        Ok(())
    }

    #[test]
    fn untouched_siblings_keep_their_address() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let database = database(&dir);

        let mut builder = TreeBuilder::new(&database, None)?;
        builder.write(&path("docs/x/one.md"), Bytes::from_static(b"1"))?;
        builder.write(&path("docs/y/two.md"), Bytes::from_static(b"2"))?;
        let first = builder.persist()?;
        let sibling = get_by_path(&database, &first, path("docs/y").segments())?;

        let mut builder = TreeBuilder::new(&database, Some(&first))?;
        builder.write(&path("docs/x/one.md"), Bytes::from_static(b"changed"))?;
        let second = builder.persist()?;

        assert_ne!(first, second);
        assert_eq!(get_by_path(&database, &second, path("docs/y").segments())?, sibling);
        Ok(())
    }

    #[test]
    fn operations_see_earlier_changes() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let database = database(&dir);

        let mut changes = StagedChangeSet::default();
        changes.write(path("a.txt"), Bytes::from_static(b"fresh"));
        changes.rename(path("a.txt"), path("moved/a.txt"));

        let mut builder = TreeBuilder::new(&database, None)?;
        builder.apply(&changes)?;
        let root = builder.persist()?;

        assert_eq!(read(&database, &root, "moved/a.txt"), Some(Bytes::from_static(b"fresh")));
        assert_eq!(read(&database, &root, "a.txt"), None);
        Ok(())
    }

    #[test]
    fn deleting_last_file_prunes_directories() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let database = database(&dir);

        let mut builder = TreeBuilder::new(&database, None)?;
        builder.write(&path("keep.txt"), Bytes::from_static(b"k"))?;
        builder.write(&path("a/b/gone.txt"), Bytes::from_static(b"g"))?;
        assert!(builder.delete(&path("a/b/gone.txt"))?);

        assert!(builder.root().get("a").is_none());
        assert!(builder.root().get("keep.txt").is_some());
        Ok(())
    }

    #[test]
    fn deleting_absent_paths_changes_nothing() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let database = database(&dir);

        let mut builder = TreeBuilder::new(&database, None)?;
        builder.write(&path("a.txt"), Bytes::from_static(b"a"))?;
        let before = builder.root_oid()?;

        assert!(!builder.delete(&path("missing.txt"))?);
        assert!(!builder.delete(&path("no/such/dir/file.txt"))?);
        assert_eq!(builder.root_oid()?, before);
        Ok(())
    }

    #[test]
    fn file_segments_cannot_be_traversed() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let database = database(&dir);

        let mut builder = TreeBuilder::new(&database, None)?;
        builder.write(&path("a.txt"), Bytes::from_static(b"a"))?;
        let error = builder
            .write(&path("a.txt/inner"), Bytes::from_static(b"x"))
            .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<TreeBuildError>(),
            Some(TreeBuildError::NotADirectory(_))
        ));
        Ok(())
    }

    #[test]
    fn renaming_a_missing_source_fails() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let database = database(&dir);

        let mut builder = TreeBuilder::new(&database, None)?;
        let error = builder.rename(&path("ghost"), &path("b")).unwrap_err();

        assert!(matches!(
            error.downcast_ref::<TreeBuildError>(),
            Some(TreeBuildError::MissingSource(_))
        ));
        Ok(())
    }

    #[test]
    fn empty_root_is_persisted() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let database = database(&dir);

        let root = TreeBuilder::new(&database, None)?.persist()?;

        assert_eq!(root.as_ref(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
        assert!(database.exists(&root));
        Ok(())
    }
}
