//! # pagedb — Embedded Paged Record Store
//!
//! The persistent core of a relational database: one heap file, organized
//! as pages of 128-byte blocks, holding the records of any number of
//! logical storages (one per table or index). The crate provides block
//! allocation with free-list reuse, a write-back record cache, a persistent
//! free-page bitmap, and a page-image undo log that makes checkpoints the
//! durability boundary.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use pagedb::{LenPrefixReader, PageStore, Record, Session};
//!
//! let store = PageStore::builder()
//!     .path("./data.db")
//!     .page_size(1024)
//!     .open()?;
//!
//! let session = Session::new(1);
//! let users = store.get_storage(7, Arc::new(LenPrefixReader));
//!
//! let mut record = Record::new(LenPrefixReader::encode(b"alice"));
//! let pos = users.add_record(&session, &mut record, None)?;
//! assert_eq!(users.get_record(&session, pos)?.payload(), record.payload());
//!
//! store.checkpoint()?;   // everything added above is now durable
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  Storage          (per-object facade)       │
//! ├────────────────────────────────────────────┤
//! │  PageStore        (file coordinator)        │
//! │  RecordCache │ PageLog │ PageFreeList       │
//! ├────────────────────────────────────────────┤
//! │  DataPage / FileStore   (page & byte I/O)   │
//! └────────────────────────────────────────────┘
//! ```
//!
//! Records live in the cache until eviction or a checkpoint writes them
//! back; every page write is preceded by an undo entry of the page's old
//! content. Reopening after a crash replays the undo log, rolling the file
//! back to its last checkpoint.
//!
//! ## Module Overview
//!
//! - [`store`]: the storage engine (file, pages, cache, log, storages)
//! - [`session`]: the session identity threaded through operations
//! - [`config`]: geometry and policy constants
//! - [`error`]: the typed error kinds callers match on
//! - [`util`]: bit set and integer array primitives

#[macro_use]
mod macros;

pub mod config;
pub mod error;
pub mod session;
pub mod store;
pub mod util;

pub use error::StoreError;
pub use session::Session;
pub use store::{
    CachePolicy, DataPage, LenPrefixReader, PageStore, Record, RecordReader, Storage,
    StoreBuilder,
};
