//! Object types
//!
//! All content lives in immutable, content-addressed objects:
//!
//! - **Blob**: file content (raw bytes)
//! - **Tree**: directory listing (names, modes and object ids)
//! - **Commit**: snapshot with metadata (tree, parents, author, committer, message)
//!
//! Every object serializes to `<type> <size>\0<content>` and is addressed by
//! the SHA-1 of that framing.

pub mod blob;
pub mod commit;
pub mod entry_mode;
pub mod object;
pub mod object_id;
pub mod object_type;
pub mod tree;

/// Length of a SHA-1 hash in hexadecimal format
pub const OBJECT_ID_LENGTH: usize = 40;
