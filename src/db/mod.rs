//! Database access layer.
//!
//! - Drivers wrap one physical session behind the [`driver::Backend`] seam
//! - Pools lend drivers out and take them back
//! - Connections are single-use execution contexts over a borrowed driver
//! - Transactions keep a driver across statements
//! - The nested coordinator spans one transaction per data source
//! - Database facades and the registry hand all of the above out

pub mod bind;
pub mod connection;
pub mod database;
pub mod driver;
pub mod mysql;
pub mod nested;
pub mod pool;
pub mod query;
pub mod scripted;
pub mod transaction;
pub mod types;

pub use bind::{Bindings, Prepared};
pub use connection::Connection;
pub use database::{ConnectorFactory, Database, JoinedLease, Lease, Registry, TableQuery, Written};
pub use driver::{Backend, Connector, PhysicalDriver};
pub use mysql::MySqlConnector;
pub use nested::{scope, Coordinator, FinishReport, Point, PointError};
pub use pool::{DriverPool, PoolStats, SimplePool, SinglePool};
pub use query::{Order, QueryBuilder, Statement};
pub use scripted::ScriptedConnector;
pub use transaction::Transaction;
