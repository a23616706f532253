//! Structural and content diffs
//!
//! - `tree_diff`: which file paths differ between two trees
//! - `content_diff`: unified line diff of one file between two revisions

pub mod content_diff;
pub mod tree_diff;
