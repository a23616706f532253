//! Record synchronization
//!
//! Outbound, record events become staged writes, deletes and renames on the
//! unit-of-work backend. Inbound, every path changed by an accepted push is
//! announced to the observers registered for the repository's flavor.
//!
//! - `notification`: sync notifications, observers and the hub dispatching them
//! - `changes`: which paths a ref update changed, and at which revision
//! - `adapter`: per record kind mapping between records and files

pub mod adapter;
pub mod changes;
pub mod notification;
