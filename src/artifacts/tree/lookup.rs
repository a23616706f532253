use crate::areas::database::Database;
use crate::artifacts::database::database_entry::DatabaseEntry;
use crate::artifacts::objects::entry_mode::EntryMode;
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::tree::repo_path::RepoPath;

/// Entry reached by following `segments` down from `tree_oid`.
///
/// The empty path yields the tree itself. A segment that names a file
/// before the last one ends the lookup with `None`.
pub fn get_by_path(
    database: &Database,
    tree_oid: &ObjectId,
    segments: &[String],
) -> anyhow::Result<Option<DatabaseEntry>> {
    let mut entry = DatabaseEntry::new(tree_oid.clone(), EntryMode::Directory);

    for segment in segments {
        if !entry.is_tree() {
            return Ok(None);
        }
        let tree = database.load_tree(&entry.oid)?;
        match tree.get(segment) {
            Some(child) => entry = child.clone(),
            None => return Ok(None),
        }
    }

    Ok(Some(entry))
}

/// One directory visited by [`walk`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub dir: String,
    pub subdirs: Vec<String>,
    pub files: Vec<String>,
}

/// Depth-first listing of a directory tree, parents before children.
pub fn walk(database: &Database, tree_oid: &ObjectId, base: &RepoPath) -> anyhow::Result<Vec<WalkEntry>> {
    let mut entries = Vec::new();
    walk_into(database, tree_oid, base, &mut entries)?;
    Ok(entries)
}

fn walk_into(
    database: &Database,
    tree_oid: &ObjectId,
    dir: &RepoPath,
    entries: &mut Vec<WalkEntry>,
) -> anyhow::Result<()> {
    let tree = database.load_tree(tree_oid)?;

    let (subdirs, files): (Vec<_>, Vec<_>) = tree.entries().partition(|(_, entry)| entry.is_tree());
    entries.push(WalkEntry {
        dir: dir.to_string(),
        subdirs: subdirs.iter().map(|(name, _)| name.to_string()).collect(),
        files: files.iter().map(|(name, _)| name.to_string()).collect(),
    });

    for (name, entry) in subdirs {
        walk_into(database, &entry.oid, &dir.join(name), entries)?;
    }

    Ok(())
}
