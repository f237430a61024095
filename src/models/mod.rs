//! Data models for the execution engine.
//!
//! This module re-exports the plain data types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{Actor, ConnectionConfigError, DataSource, NestedState};
pub use query::{Delta, Outcome, Row, Value};
