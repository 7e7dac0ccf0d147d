//! # Relink Common Library
//!
//! Shared code for the Relink reconciliation services including:
//! - Error types (`Error`, `Result`)
//! - Event types (`RelinkEvent`) and the broadcast `EventBus`
//! - Configuration file loading and root folder resolution
//! - Timestamp and UUID utilities

pub mod config;
pub mod error;
pub mod events;
pub mod time;
pub mod uuid_utils;

pub use error::{Error, Result};
