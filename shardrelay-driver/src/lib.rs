//! Driver abstraction for ShardRelay
//!
//! The proxy only needs to open connections and execute statements on them;
//! concrete database drivers plug in through [`Connector`].

pub mod connection;
pub mod memory;

/// Re-export main types
pub use connection::*;
pub use memory::*;
