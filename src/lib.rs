//! Record-to-file mapping on a git-compatible object store
//!
//! Records are written as files into bare repositories through a
//! [`backend::Backend`]; every commit rewrites only the tree spine above the
//! changed paths. Pushes arriving over smart HTTP are mirrored back to the
//! record layer as [`sync::notification::SyncNotification`]s.

pub mod areas;
pub mod artifacts;
pub mod backend;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod protocol;
pub mod sync;
