//! Core types and traits for the buffer hibernator
//!
//! This crate defines the foundational types shared by the codec, the
//! snapshot writer, the restorer and the orchestrator:
//! - Identifiers: Oid, ForkNumber, BlockNumber, JobId
//! - PageKey: identity of one resident cache page
//! - PendingJob: one save-file waiting to be restored
//! - CancelFlag: cooperative cancellation shared with restore workers
//! - Error: error type hierarchy
//! - Traits: narrow interfaces onto the host (buffer pool, sessions, relations)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::{BufferPool, RelationReader, Session, SessionProvider};
pub use types::{
    BlockNumber, CancelFlag, ForkNumber, JobId, Oid, PageKey, PendingJob, GLOBAL_DATABASE_NAME,
    INVALID_OID,
};
