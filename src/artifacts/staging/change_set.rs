//! Pending operations accumulated by a backend between commits.

use crate::artifacts::tree::repo_path::RepoPath;
use bytes::Bytes;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOp {
    Write(Bytes),
    Delete,
    /// Move the entry currently at the given source path here
    Rename(RepoPath),
}

/// Last-write-wins map of path to pending operation.
///
/// Each entry remembers when it was staged so the commit engine can replay
/// operations in the order they were issued.
#[derive(Debug, Clone, Default)]
pub struct StagedChangeSet {
    ops: BTreeMap<RepoPath, (u64, ChangeOp)>,
    sequence: u64,
}

impl StagedChangeSet {
    pub fn write(&mut self, path: RepoPath, data: Bytes) {
        self.stage(path, ChangeOp::Write(data));
    }

    pub fn delete(&mut self, path: RepoPath) {
        self.stage(path, ChangeOp::Delete);
    }

    /// Stage a move of `old` to `new`, folding in whatever is already pending
    /// for `old`.
    pub fn rename(&mut self, old: RepoPath, new: RepoPath) {
        if old == new {
            return;
        }

        match self.ops.get(&old).map(|(_, op)| op.clone()) {
            Some(ChangeOp::Write(data)) => {
                self.stage(new, ChangeOp::Write(data));
                self.stage(old, ChangeOp::Delete);
            }
            Some(ChangeOp::Rename(source)) => {
                self.ops.remove(&old);
                self.stage(new, ChangeOp::Rename(source));
            }
            Some(ChangeOp::Delete) | None => self.stage(new, ChangeOp::Rename(old)),
        }
    }

    pub fn rollback(&mut self) {
        self.ops.clear();
    }

    /// Sequence number of the most recently staged operation.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Drop the operations staged up to and including `sequence`, keeping
    /// anything staged after it.
    pub fn clear_through(&mut self, sequence: u64) {
        self.ops.retain(|_, (staged, _)| *staged > sequence);
    }

    pub fn is_dirty(&self) -> bool {
        !self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn get(&self, path: &RepoPath) -> Option<&ChangeOp> {
        self.ops.get(path).map(|(_, op)| op)
    }

    /// Pending operations in the order they were staged.
    pub fn in_order(&self) -> Vec<(&RepoPath, &ChangeOp)> {
        let mut ordered = self
            .ops
            .iter()
            .map(|(path, (sequence, op))| (*sequence, path, op))
            .collect::<Vec<_>>();
        ordered.sort_by_key(|(sequence, _, _)| *sequence);

        ordered.into_iter().map(|(_, path, op)| (path, op)).collect()
    }

    fn stage(&mut self, path: RepoPath, op: ChangeOp) {
        self.sequence += 1;
        self.ops.insert(path, (self.sequence, op));
    }
}
