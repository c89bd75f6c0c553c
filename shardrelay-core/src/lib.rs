//! Core types and interfaces for the ShardRelay sharding proxy

pub mod error;
pub mod record;
pub mod statement;
pub mod types;

pub use error::*;
pub use record::*;
pub use statement::*;
/// Re-export commonly used types
pub use types::*;
