//! Configuration management for ShardRelay

pub mod config;
pub mod loader;
pub mod topology;
pub mod validator;

/// Re-export main types
pub use config::*;
pub use loader::*;
pub use topology::*;
pub use validator::*;
