//! Allocator internals
//!
//! - `extent`, `format`: on-media and in-memory record types
//! - `pool`: persistent tables and the transaction manager
//! - `space`: the allocator proper

pub mod clock;
pub mod config;
pub mod error;
pub mod extent;
pub mod format;
pub mod pool;
pub mod space;
