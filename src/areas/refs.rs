//! References (branches and HEAD)
//!
//! References are the only mutable state in a repository. A ref file holds
//! either a 40-hex object id or `ref: <path>` for a symbolic ref such as
//! HEAD.
//!
//! Every ref mutation is a compare-and-swap: the current value is re-read
//! under an exclusive lock, compared with what the caller expects, and only
//! then replaced through a synced temp file and a rename. Locks are taken
//! both in-process (fcntl locks are per process, so threads of one process
//! would not exclude each other) and on a lock file for other processes.

use crate::artifacts::branch::branch_name::{BranchName, REF_PREFIX, SymRefName};
use crate::artifacts::objects::object_id::ObjectId;
use anyhow::Context;
use derive_new::new;
use fake::rand;
use file_guard::Lock;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use walkdir::WalkDir;

/// Per ref-lock-file mutexes shared by every `Refs` in the process
static REF_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(Default::default);

const SYMREF_REGEX: &str = r"^ref: (.+)$";

pub const HEAD_REF_NAME: &str = "HEAD";

#[derive(Debug, new)]
pub struct Refs {
    /// Repository root (the directory holding `HEAD` and `refs/`)
    path: Box<Path>,
}

#[derive(Debug, Clone)]
enum SymRefOrOid {
    SymRef { sym_ref_name: SymRefName },
    Oid(ObjectId),
}

impl SymRefOrOid {
    fn read_symref_or_oid(path: &Path) -> anyhow::Result<Option<SymRefOrOid>> {
        if !path.is_file() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ref file at {:?}", path))?;
        let content = content.trim();

        if content.is_empty() {
            return Ok(None);
        }

        let symref_match = regex::Regex::new(SYMREF_REGEX)?.captures(content);
        if let Some(symref_match) = symref_match {
            Ok(Some(SymRefOrOid::SymRef {
                sym_ref_name: SymRefName::new(symref_match[1].to_string()),
            }))
        } else {
            Ok(Some(SymRefOrOid::Oid(ObjectId::try_parse(
                content.to_string(),
            )?)))
        }
    }
}

/// Outcome of a compare-and-swap on a ref
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefUpdate {
    Applied,
    /// The ref no longer holds the expected value
    Stale { current: Option<ObjectId> },
}

impl Refs {
    /// Resolve a ref to an object id, following symbolic refs.
    pub fn read_ref(&self, name: &SymRefName) -> anyhow::Result<Option<ObjectId>> {
        self.read_symref(&self.path.join(name.as_ref_path()), 0)
    }

    pub fn read_branch(&self, branch_name: &BranchName) -> anyhow::Result<Option<ObjectId>> {
        self.read_ref(&branch_name.to_sym_ref_name())
    }

    pub fn read_head(&self) -> anyhow::Result<Option<ObjectId>> {
        self.read_symref(&self.head_path(), 0)
    }

    /// The ref HEAD points at, when HEAD is symbolic.
    pub fn head_target(&self) -> anyhow::Result<Option<SymRefName>> {
        match SymRefOrOid::read_symref_or_oid(&self.head_path())? {
            Some(SymRefOrOid::SymRef { sym_ref_name }) => Ok(Some(sym_ref_name)),
            _ => Ok(None),
        }
    }

    pub fn set_head(&self, target: &SymRefName) -> anyhow::Result<()> {
        let head = SymRefName::new(HEAD_REF_NAME.to_string());
        self.with_ref_lock(&head, || {
            self.write_ref_file(
                &self.head_path(),
                &format!("ref: {}\n", target.as_ref_path()),
            )
        })
    }

    fn read_symref(&self, path: &Path, depth: usize) -> anyhow::Result<Option<ObjectId>> {
        if depth > 5 {
            anyhow::bail!("symbolic ref chain too deep at {:?}", path);
        }

        match SymRefOrOid::read_symref_or_oid(path)? {
            Some(SymRefOrOid::SymRef { sym_ref_name }) => {
                self.read_symref(&self.path.join(sym_ref_name.as_ref_path()), depth + 1)
            }
            Some(SymRefOrOid::Oid(oid)) => Ok(Some(oid)),
            None => Ok(None),
        }
    }

    /// Move `name` from `expected` to `new` atomically.
    ///
    /// `None` as `expected` means the ref must not exist yet; `None` as `new`
    /// deletes the ref.
    pub fn compare_and_swap(
        &self,
        name: &SymRefName,
        expected: Option<&ObjectId>,
        new: Option<&ObjectId>,
    ) -> anyhow::Result<RefUpdate> {
        if !name.as_ref_path().starts_with("refs/") {
            anyhow::bail!("refusing to update non-ref path {}", name);
        }

        let ref_path = self.path.join(name.as_ref_path());
        self.with_ref_lock(name, || {
            let current = self.read_symref(&ref_path, 0)?;
            if current.as_ref() != expected {
                return Ok(RefUpdate::Stale { current });
            }

            match new {
                Some(oid) => self.write_ref_file(&ref_path, &format!("{oid}\n"))?,
                None if current.is_some() => {
                    std::fs::remove_file(&ref_path)
                        .with_context(|| format!("failed to delete ref file at {:?}", ref_path))?;
                    self.prune_empty_parent_dirs(&ref_path)?;
                }
                None => {}
            }

            tracing::debug!(
                reference = %name,
                from = ?expected.map(ObjectId::to_short_oid),
                to = ?new.map(ObjectId::to_short_oid),
                "ref updated"
            );
            Ok(RefUpdate::Applied)
        })
    }

    /// Create a branch that must not exist yet.
    pub fn create_branch(&self, name: &BranchName, source_oid: &ObjectId) -> anyhow::Result<RefUpdate> {
        self.compare_and_swap(&name.to_sym_ref_name(), None, Some(source_oid))
    }

    /// Delete a branch, returning the id it pointed at, or `None` if absent.
    pub fn delete_branch(&self, name: &BranchName) -> anyhow::Result<Option<ObjectId>> {
        let sym_ref_name = name.to_sym_ref_name();

        loop {
            let Some(current) = self.read_ref(&sym_ref_name)? else {
                return Ok(None);
            };

            match self.compare_and_swap(&sym_ref_name, Some(&current), None)? {
                RefUpdate::Applied => return Ok(Some(current)),
                RefUpdate::Stale { .. } => continue,
            }
        }
    }

    pub fn list_branches(&self) -> anyhow::Result<Vec<BranchName>> {
        Ok(self
            .list_refs()?
            .into_iter()
            .filter_map(|(name, _)| BranchName::try_parse_sym_ref_name(&name).ok())
            .collect())
    }

    /// Every direct ref under `refs/` with its target, sorted by name.
    pub fn list_refs(&self) -> anyhow::Result<Vec<(SymRefName, ObjectId)>> {
        let mut refs = WalkDir::new(self.refs_path())
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| !entry.file_name().to_string_lossy().ends_with(".lock"))
            .filter_map(|entry| {
                let relative_path = entry.path().strip_prefix(self.path.as_ref()).ok()?;
                let name = relative_path
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let oid = self.read_symref(entry.path(), 0).ok()??;
                Some((SymRefName::new(name), oid))
            })
            .collect::<Vec<_>>();

        refs.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(refs)
    }

    fn with_ref_lock<T>(
        &self,
        name: &SymRefName,
        f: impl FnOnce() -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let locks_path = self.locks_path();
        let lock_path = locks_path.join(format!(
            "{:x}.lock",
            Sha1::digest(name.as_ref_path().as_bytes())
        ));

        let process_lock = REF_LOCKS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(lock_path.clone())
            .or_default()
            .clone();
        let _process_guard = process_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        std::fs::create_dir_all(&locks_path)
            .with_context(|| format!("failed to create lock directory at {:?}", locks_path))?;
        let mut lock_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("failed to open lock file at {:?}", lock_path))?;
        let _file_guard = file_guard::lock(&mut lock_file, Lock::Exclusive, 0, 1)
            .with_context(|| format!("failed to lock {:?}", lock_path))?;

        f()
    }

    fn write_ref_file(&self, path: &Path, content: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(path.parent().with_context(|| {
            format!("failed to create parent directories for ref file at {:?}", path)
        })?)?;

        let temp_path = self.path.join(format!("tmp-ref-{}", rand::random::<u32>()));
        let mut temp_file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .with_context(|| format!("failed to open temp ref file at {:?}", temp_path))?;
        temp_file.write_all(content.as_bytes())?;
        temp_file.sync_all()?;

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("failed to move ref file into {:?}", path))?;

        Ok(())
    }

    fn prune_empty_parent_dirs(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent()
            && parent != self.heads_path().as_ref()
            && parent != self.refs_path().as_ref()
            && parent.read_dir()?.next().is_none()
        {
            std::fs::remove_dir(parent)
                .with_context(|| format!("failed to remove empty ref directory at {:?}", parent))?;
            self.prune_empty_parent_dirs(parent)?;
        }

        Ok(())
    }

    pub fn head_path(&self) -> Box<Path> {
        self.path.join(HEAD_REF_NAME).into_boxed_path()
    }

    pub fn refs_path(&self) -> Box<Path> {
        self.path.join("refs").into_boxed_path()
    }

    pub fn heads_path(&self) -> Box<Path> {
        self.path
            .join(REF_PREFIX.trim_end_matches('/'))
            .into_boxed_path()
    }

    fn locks_path(&self) -> PathBuf {
        self.path.join("locks")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;
    use std::sync::Barrier;

    fn oid(digit: &str) -> ObjectId {
        ObjectId::try_parse(digit.repeat(40)).unwrap()
    }

    fn branch(name: &str) -> BranchName {
        BranchName::try_parse(name.to_string()).unwrap()
    }

    fn refs(dir: &TempDir) -> Refs {
        std::fs::create_dir_all(dir.path().join("refs/heads")).unwrap();
        Refs::new(dir.path().to_path_buf().into_boxed_path())
    }

    #[test]
    fn head_follows_its_branch() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let refs = refs(&dir);

        refs.set_head(&branch("master").to_sym_ref_name())?;
        assert_eq!(refs.read_head()?, None);

        refs.create_branch(&branch("master"), &oid("a"))?;
        assert_eq!(refs.read_head()?, Some(oid("a")));
        assert_eq!(
            refs.head_target()?,
            Some(SymRefName::new("refs/heads/master".to_string()))
        );
        Ok(())
    }

    #[test]
    fn stale_expectation_leaves_ref_untouched() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let refs = refs(&dir);
        let name = branch("master").to_sym_ref_name();

        refs.compare_and_swap(&name, None, Some(&oid("a")))?;
        let outcome = refs.compare_and_swap(&name, Some(&oid("b")), Some(&oid("c")))?;

        assert_eq!(outcome, RefUpdate::Stale { current: Some(oid("a")) });
        assert_eq!(refs.read_ref(&name)?, Some(oid("a")));
        Ok(())
    }

    #[test]
    fn creating_an_existing_branch_is_stale() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let refs = refs(&dir);

        assert_eq!(refs.create_branch(&branch("v1"), &oid("a"))?, RefUpdate::Applied);
        assert!(matches!(
            refs.create_branch(&branch("v1"), &oid("b"))?,
            RefUpdate::Stale { .. }
        ));
        Ok(())
    }

    #[test]
    fn deleting_nested_branch_prunes_directories() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let refs = refs(&dir);

        refs.create_branch(&branch("feature/deep/x"), &oid("a"))?;
        refs.create_branch(&branch("main"), &oid("b"))?;

        assert_eq!(refs.delete_branch(&branch("feature/deep/x"))?, Some(oid("a")));
        assert_eq!(refs.delete_branch(&branch("feature/deep/x"))?, None);
        assert!(!dir.path().join("refs/heads/feature").exists());
        assert_eq!(refs.list_branches()?, vec![branch("main")]);
        Ok(())
    }

    #[test]
    fn concurrent_swaps_from_same_value_admit_one_winner() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let refs = Arc::new(refs(&dir));
        let name = branch("master").to_sym_ref_name();
        refs.compare_and_swap(&name, None, Some(&oid("0")))?;

        let barrier = Arc::new(Barrier::new(8));
        let handles = (1..=8)
            .map(|digit| {
                let refs = refs.clone();
                let name = name.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    refs.compare_and_swap(&name, Some(&oid("0")), Some(&oid(&digit.to_string())))
                        .unwrap()
                })
            })
            .collect::<Vec<_>>();

        let applied = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|outcome| *outcome == RefUpdate::Applied)
            .count();

        assert_eq!(applied, 1);
        Ok(())
    }
}
