//! Database models for shortforge.
//!
//! These models map directly to the database schema and handle
//! serialization/deserialization of JSON fields.

pub mod channel;
pub mod job;
pub mod video;

pub use channel::*;
pub use job::*;
pub use video::*;
