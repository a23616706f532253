//! Database entry types
//!
//! A database entry is a tree slot: the address of a child object together
//! with the mode that says whether it is a file or a directory.

pub mod database_entry;
