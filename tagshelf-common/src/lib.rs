//! # tagshelf common library
//!
//! Shared code for the tagshelf services:
//! - Error type and result alias
//! - Bootstrap TOML configuration and root folder resolution
//! - Catalog database initialization
//! - Ingest event types and the broadcast event bus
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
