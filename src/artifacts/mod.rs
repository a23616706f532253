//! Git data structures and algorithms
//!
//! - `branch`: branch names, revision expressions and branch management
//! - `commit`: turning staged changes into commits
//! - `database`: database entry types
//! - `diff`: structural tree diff and unified content diff
//! - `log`: commit history traversal and path filtering
//! - `objects`: object types (blob, tree, commit)
//! - `staging`: pending writes, deletes and renames
//! - `tree`: path lookup and copy-on-write tree building

pub mod branch;
pub mod commit;
pub mod database;
pub mod diff;
pub mod log;
pub mod objects;
pub mod staging;
pub mod tree;
