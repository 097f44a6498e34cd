//! `tw-domain`: configuration and shared error types for toolwire.
//!
//! Kept separate from the client so that an application's own config
//! deserializer can embed [`config::ToolServersConfig`] without pulling in
//! the process and dispatch machinery.

pub mod config;
pub mod error;

pub use error::{Error, Result};
