//! Testing utilities
//!
//! This module provides an in-memory host for exercising the saver and the
//! restorer without a real database engine:
//!
//! - **MemoryHost**: a buffer pool, catalog and storage manager in one, which
//!   records partition lock order, connections and every block read
//!
//! # Example
//!
//! ```ignore
//! use hibernator_durability::testing::MemoryHost;
//!
//! let host = MemoryHost::new(4);
//! host.add_database(16384, "app");
//! host.add_relation("app", 16400, 16400, &[(0, 10)]);
//! host.load_pages(&[PageKey::new(16384, 16400, 0, 3)]);
//! ```

mod memory_host;

pub use memory_host::{BlockRead, LockEvent, MemoryHost};
