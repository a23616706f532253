//! Tree object
//!
//! Trees are immutable directory listings: each entry maps a name to a mode
//! and the address of a blob (file) or another tree (directory).
//!
//! ## Format
//!
//! On disk: `tree <size>\0<entries>`
//! Each entry: `<mode> <name>\0<20-byte-sha1>`
//!
//! Entries are serialized in git order, where a directory sorts as if its
//! name carried a trailing `/`. Keeping that order makes our ids identical to
//! the ones git computes for the same content.

use crate::artifacts::database::database_entry::DatabaseEntry;
use crate::artifacts::objects::entry_mode::EntryMode;
use crate::artifacts::objects::object::Unpackable;
use crate::artifacts::objects::object::{Object, Packable};
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::object_type::ObjectType;
use anyhow::Context;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::{BufRead, Write};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<String, DatabaseEntry>,
}

impl Tree {
    pub fn get(&self, name: &str) -> Option<&DatabaseEntry> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: DatabaseEntry) -> Option<DatabaseEntry> {
        self.entries.insert(name.into(), entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<DatabaseEntry> {
        self.entries.remove(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries in name order (not git serialization order).
    pub fn entries(&self) -> impl Iterator<Item = (&String, &DatabaseEntry)> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> impl Iterator<Item = (String, DatabaseEntry)> {
        self.entries.into_iter()
    }

    fn sort_key(name: &str, entry: &DatabaseEntry) -> Vec<u8> {
        let mut key = name.as_bytes().to_vec();
        if entry.is_tree() {
            key.push(b'/');
        }
        key
    }

    fn git_ordered(&self) -> Vec<(&String, &DatabaseEntry)> {
        let mut ordered = self.entries.iter().collect::<Vec<_>>();
        ordered.sort_by_cached_key(|(name, entry)| Self::sort_key(name, entry));
        ordered
    }
}

impl Packable for Tree {
    fn serialize(&self) -> anyhow::Result<Bytes> {
        let mut content_bytes = Vec::new();
        for (name, entry) in self.git_ordered() {
            let header = format!("{} {}", entry.mode.as_str(), name);
            content_bytes.write_all(header.as_bytes())?;
            content_bytes.push(0);
            entry.oid.write_h40_to(&mut content_bytes)?;
        }

        let mut tree_bytes = Vec::new();
        let header = format!("{} {}\0", self.object_type().as_str(), content_bytes.len());
        tree_bytes.write_all(header.as_bytes())?;
        tree_bytes.write_all(&content_bytes)?;

        Ok(Bytes::from(tree_bytes))
    }
}

impl Unpackable for Tree {
    fn deserialize(reader: impl BufRead) -> anyhow::Result<Self> {
        let mut entries = BTreeMap::new();
        let mut reader = reader;

        let mut mode_bytes = Vec::new();
        let mut name_bytes = Vec::new();

        loop {
            mode_bytes.clear();
            // "mode " (space-delimited)
            let n = reader.read_until(b' ', &mut mode_bytes)?;
            if n == 0 {
                break;
            }
            if mode_bytes.pop() != Some(b' ') {
                return Err(anyhow::anyhow!("unexpected EOF in mode"));
            }

            let mode_str = std::str::from_utf8(&mode_bytes)?;
            let mode = EntryMode::from_octal_str(mode_str)?;

            // "name\0"
            name_bytes.clear();
            reader.read_until(b'\0', &mut name_bytes)?;
            if name_bytes.pop() != Some(b'\0') {
                return Err(anyhow::anyhow!("unexpected EOF in name"));
            }
            let name = std::str::from_utf8(&name_bytes)
                .context("tree entry name is not valid UTF-8")?
                .to_owned();

            let oid =
                ObjectId::read_h40_from(&mut reader).context("unexpected EOF in object id")?;

            entries.insert(name, DatabaseEntry::new(oid, mode));
        }

        Ok(Tree { entries })
    }
}

impl Object for Tree {
    fn object_type(&self) -> ObjectType {
        ObjectType::Tree
    }

    fn display(&self) -> String {
        self.git_ordered()
            .into_iter()
            .map(|(name, entry)| {
                let object_type = if entry.is_tree() {
                    ObjectType::Tree
                } else {
                    ObjectType::Blob
                };
                format!(
                    "{} {} {}\t{}",
                    entry.mode.as_str(),
                    object_type.as_str(),
                    entry.oid,
                    name
                )
            })
            .collect::<Vec<String>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::objects::entry_mode::FileMode;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn oid(hex: &str) -> ObjectId {
        ObjectId::try_parse(hex.repeat(40 / hex.len())).unwrap()
    }

    #[test]
    fn empty_tree_has_well_known_id() {
        assert_eq!(
            Tree::default().object_id().unwrap().as_ref(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
    }

    #[test]
    fn directories_sort_as_if_suffixed_with_slash() {
        let mut tree = Tree::default();
        tree.insert("a.txt", DatabaseEntry::new(oid("1"), FileMode::Regular.into()));
        tree.insert("a", DatabaseEntry::new(oid("2"), EntryMode::Directory));
        tree.insert("a-b", DatabaseEntry::new(oid("3"), FileMode::Regular.into()));

        let names = tree
            .git_ordered()
            .into_iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>();

        // '-' (0x2d) < '.' (0x2e) < '/' (0x2f)
        assert_eq!(names, vec!["a-b", "a.txt", "a"]);
    }

    #[test]
    fn serialized_tree_parses_back() {
        let mut tree = Tree::default();
        tree.insert("run.sh", DatabaseEntry::new(oid("ab"), FileMode::Executable.into()));
        tree.insert("docs", DatabaseEntry::new(oid("cd"), EntryMode::Directory));

        let serialized = tree.serialize().unwrap();
        let mut reader = Cursor::new(serialized.to_vec());
        ObjectType::parse_header(&mut reader).unwrap();

        assert_eq!(Tree::deserialize(reader).unwrap(), tree);
    }
}
