#![forbid(unsafe_code)]
//! Asynchronous 9P2000 file server with virtual users.
//!
//! This crate exports a subtree of the host filesystem over the classic
//! 9P2000 protocol, layering its own identity and access-control model on
//! top of the host: owners and groups are *virtual users* defined in
//! `<root>/adm/users`, and each exported object's ownership is recorded in
//! a `<path>.vufs` sidecar file rather than in host uids/gids.
//!
//! # Overview
//!
//! 1. [`VuFs::new`](srv::VuFs::new) loads the virtual user registry and
//!    walks the export root into an in-memory file tree.
//! 2. [`VuFs::serve`](srv::VuFs::serve) binds a TCP listener and starts
//!    the server: one accept task, one reader task per connection, and a
//!    single dispatcher that serializes every request in arrival order.
//! 3. Clients attach as a virtual user and operate on the tree through the
//!    twelve 9P2000 requests; permission checks compare virtual owners and
//!    groups, never host ones.
//!
//! ```no_run
//! use vufs::srv::VuFs;
//!
//! #[tokio::main]
//! async fn main() -> vufs::Result<()> {
//!     let fs = VuFs::new("/srv/export").await?;
//!     let server = fs.serve("0.0.0.0:5001").await?;
//!     server.join().await
//! }
//! ```
//!
//! # Protocol Details
//!
//! Only the `9P2000` dialect is spoken. `Tauth` is always refused; clients
//! attach with `afid = NOFID` and `aname = "/"`. Message framing, limits
//! and mode bits live in [`fcall`]; the wire codec lives in [`serialize`].
//!
//! # Concurrency
//!
//! All mutable state (the tree, every connection's fid table, the open
//! host handles) belongs to the dispatcher task alone, so handlers run
//! without locks and responses on a connection are emitted in the order
//! its requests were processed.
pub mod error;
pub mod fcall;
pub mod ownership;
pub mod serialize;
pub mod srv;
pub mod tree;
pub mod users;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::utils::Result;
