//! Repository layer for database access.
//!
//! This module implements the Repository Pattern to abstract all database interactions,
//! creating a clean and maintainable data access layer.

pub mod channel;
pub mod job;
pub mod video;

pub use channel::*;
pub use job::*;
pub use video::*;
