//! Physical drivers.
//!
//! A [`PhysicalDriver`] wraps exactly one real database handle. It is owned by
//! the pool while idle and by exactly one [`Connection`](super::Connection)
//! while borrowed; ownership moves by value, so a driver can never be
//! referenced by two contexts at once.

use crate::db::bind::Prepared;
use crate::error::DbResult;
use crate::models::Outcome;
use futures_util::future::BoxFuture;
use std::time::{Duration, Instant};
use tracing::debug;

/// Wire-level operations a database handle must support.
pub trait Backend: Send {
    /// Open the underlying connection.
    fn connect(&mut self) -> BoxFuture<'_, DbResult<()>>;

    /// Close the underlying connection. Never fails; errors are logged.
    fn close(&mut self) -> BoxFuture<'_, ()>;

    fn ping(&mut self) -> BoxFuture<'_, DbResult<()>>;

    /// Run a prepared statement, fetching rows when it returns a result set.
    fn run<'a>(&'a mut self, statement: &'a Prepared) -> BoxFuture<'a, DbResult<Outcome>>;

    fn begin(&mut self) -> BoxFuture<'_, DbResult<()>>;

    fn commit(&mut self) -> BoxFuture<'_, DbResult<()>>;

    fn rollback(&mut self) -> BoxFuture<'_, DbResult<()>>;
}

/// Factory for fresh, not yet connected backends.
pub trait Connector: Send + Sync {
    fn create(&self) -> Box<dyn Backend>;

    /// Display-safe description of the target (no credentials).
    fn describe(&self) -> String;
}

pub struct PhysicalDriver {
    id: u64,
    /// Name of the pool this driver belongs to.
    pool: String,
    backend: Box<dyn Backend>,
    connected: bool,
    created_at: Instant,
    last_used: Instant,
    last_ping: Option<Instant>,
}

impl PhysicalDriver {
    pub fn new(id: u64, pool: impl Into<String>, backend: Box<dyn Backend>) -> Self {
        let now = Instant::now();
        Self {
            id,
            pool: pool.into(),
            backend,
            connected: false,
            created_at: now,
            last_used: now,
            last_ping: None,
        }
    }

    pub async fn connect(&mut self) -> DbResult<()> {
        self.backend.connect().await?;
        self.connected = true;
        self.last_used = Instant::now();
        debug!(driver_id = self.id, pool = %self.pool, "Driver connected");
        Ok(())
    }

    pub async fn close(&mut self) {
        if self.connected {
            self.backend.close().await;
            self.connected = false;
            debug!(driver_id = self.id, pool = %self.pool, "Driver closed");
        }
    }

    /// Close and reopen the underlying handle.
    pub async fn reconnect(&mut self) -> DbResult<()> {
        self.close().await;
        self.connect().await
    }

    pub async fn ping(&mut self) -> DbResult<()> {
        self.backend.ping().await?;
        let now = Instant::now();
        self.last_ping = Some(now);
        self.last_used = now;
        Ok(())
    }

    /// Access the raw handle, marking the driver as used.
    pub fn instance(&mut self) -> &mut dyn Backend {
        self.last_used = Instant::now();
        self.backend.as_mut()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn last_ping(&self) -> Option<Instant> {
        self.last_ping
    }

    /// Check whether this driver has outlived the pool's max lifetime.
    pub fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        max_lifetime.is_some_and(|limit| self.created_at.elapsed() >= limit)
    }
}

impl std::fmt::Debug for PhysicalDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDriver")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("connected", &self.connected)
            .field("created_at", &self.created_at)
            .field("last_used", &self.last_used)
            .field("last_ping", &self.last_ping)
            .finish_non_exhaustive()
    }
}
