//! Commit history traversal
//!
//! - `history`: breadth-first walk with time bounds and a lower-bound commit
//! - `path_filter`: keeps only commits that changed a given path

pub mod history;
pub mod path_filter;
