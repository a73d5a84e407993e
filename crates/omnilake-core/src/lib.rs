//! # omnilake-core
//!
//! Core types, traits, and abstractions for the OmniLake knowledge lake.
//!
//! This crate provides the data structures (jobs, archives, entries, lake
//! requests, chains, queue events) and the repository and inference traits
//! that the other OmniLake crates implement and consume.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
pub use uuid_utils::{extract_timestamp, is_v7, new_v7};
