//! shortforge library crate.
//!
//! An automated short-form video production pipeline: trend-checked topics
//! become scripted, voiced, assembled and thumbnailed videos that wait for
//! human approval before uploading on each channel's schedule.

pub mod approval;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod providers;
pub mod quality;
pub mod resilience;
pub mod scheduler;
pub mod upload;

pub use error::{Error, Result};
