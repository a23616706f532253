//! On-disk stores of a bare repository
//!
//! - `database`: loose object database for blobs, trees and commits
//! - `refs`: branch and HEAD references, updated by compare-and-swap
//! - `repository`: both stores together, plus path and revision resolution

pub mod database;
pub mod refs;
pub mod repository;
