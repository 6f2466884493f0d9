// src/errors.rs

//! Crate-wide error aliases.
//!
//! Application plumbing uses `anyhow`; the structured domain errors
//! (capability parsing) live next to their types as `thiserror` enums.

pub use anyhow::{Error, Result};
