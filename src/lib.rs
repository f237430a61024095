//! poolsql
//!
//! A pooled MySQL execution engine: single-use execution contexts over
//! pooled drivers, explicit transactions, task-scoped nested transactions
//! that span every data source a task writes to, and cached active records
//! that write only what changed.

pub mod ar;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use cache::{Cache, MemoryCache};
pub use config::Config;
pub use db::{Database, Registry};
pub use error::{DbError, DbResult};
