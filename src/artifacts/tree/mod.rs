//! Tree navigation and mutation

pub mod builder;
pub mod lookup;
pub mod repo_path;
