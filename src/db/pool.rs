//! Driver pools.
//!
//! The engine only needs three things from a pool: `borrow`, `give_back` and
//! `discard`. [`SimplePool`] is the default implementation; [`SinglePool`]
//! backs data sources configured with `pool=false`.
//!
//! # Concurrency Safety
//!
//! - The open-driver limit is a `tokio::sync::Semaphore`. A permit is held by
//!   every driver that exists outside the idle queue and is handed back on
//!   return or discard, so `max_open` can never be exceeded.
//! - The idle queue is a `std::sync::Mutex`, never held across an await, so
//!   `give_back`/`discard` stay synchronous and can run from `Drop`.
//! - A borrow that is cancelled while connecting releases its permit through
//!   the permit's own drop.

use crate::config::PoolOptions;
use crate::db::driver::{Connector, PhysicalDriver};
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

/// The pool surface the engine consumes.
pub trait DriverPool: Send + Sync {
    /// Take a connected driver, waiting up to the pool's wait timeout.
    fn borrow(&self) -> BoxFuture<'_, DbResult<PhysicalDriver>>;

    /// Hand a healthy driver back for reuse.
    fn give_back(&self, driver: PhysicalDriver);

    /// Close a driver that must not be reused.
    fn discard(&self, driver: PhysicalDriver);

    fn stats(&self) -> PoolStats;

    fn options(&self) -> &PoolOptions;

    /// Close idle drivers and refuse further borrows.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_open: u32,
    pub idle: usize,
    pub created: u64,
    pub borrowed: u64,
    pub returned: u64,
    pub discarded: u64,
}

impl PoolStats {
    /// Drivers currently held by callers.
    pub fn in_use(&self) -> u64 {
        self.borrowed
            .saturating_sub(self.returned)
            .saturating_sub(self.discarded)
    }
}

#[derive(Default)]
struct Counters {
    next_id: AtomicU64,
    created: AtomicU64,
    borrowed: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

impl Counters {
    fn snapshot(&self, max_open: u32, idle: usize) -> PoolStats {
        PoolStats {
            max_open,
            idle,
            created: self.created.load(Ordering::Acquire),
            borrowed: self.borrowed.load(Ordering::Acquire),
            returned: self.returned.load(Ordering::Acquire),
            discarded: self.discarded.load(Ordering::Acquire),
        }
    }
}

/// Bounded pool with an idle queue and per-driver lifetime.
pub struct SimplePool {
    name: String,
    connector: Arc<dyn Connector>,
    options: PoolOptions,
    permits: Semaphore,
    idle: Mutex<VecDeque<PhysicalDriver>>,
    closed: AtomicBool,
    counters: Counters,
}

impl SimplePool {
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>, options: PoolOptions) -> Self {
        let name = name.into();
        let max_open = options.max_open_or_default() as usize;
        debug!(
            pool = %name,
            target = %connector.describe(),
            max_open,
            max_idle = options.max_idle_or_default(),
            "Creating driver pool"
        );
        Self {
            name,
            connector,
            options,
            permits: Semaphore::new(max_open),
            idle: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn take_idle(&self) -> Option<PhysicalDriver> {
        let lifetime = self.options.max_lifetime_or_default();
        loop {
            let candidate = lock(&self.idle).pop_front()?;
            if candidate.is_expired(lifetime) {
                debug!(pool = %self.name, driver_id = candidate.id(), "Closing expired idle driver");
                retire(candidate);
                continue;
            }
            return Some(candidate);
        }
    }

    async fn borrow_inner(&self) -> DbResult<PhysicalDriver> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error(&self.name));
        }

        let permit = acquire(&self.permits, self.options.wait_timeout_or_default(), &self.name).await?;

        let driver = match self.take_idle() {
            Some(driver) => driver,
            None => {
                let id = self.counters.next_id.fetch_add(1, Ordering::AcqRel) + 1;
                let mut driver = PhysicalDriver::new(id, self.name.clone(), self.connector.create());
                // On failure the permit is released by its drop
                driver.connect().await?;
                self.counters.created.fetch_add(1, Ordering::AcqRel);
                driver
            }
        };

        permit.forget();
        self.counters.borrowed.fetch_add(1, Ordering::AcqRel);
        Ok(driver)
    }
}

impl DriverPool for SimplePool {
    fn borrow(&self) -> BoxFuture<'_, DbResult<PhysicalDriver>> {
        Box::pin(self.borrow_inner())
    }

    fn give_back(&self, driver: PhysicalDriver) {
        self.counters.returned.fetch_add(1, Ordering::AcqRel);

        let keep = !self.closed.load(Ordering::Acquire)
            && driver.is_connected()
            && !driver.is_expired(self.options.max_lifetime_or_default());
        if keep {
            let mut idle = lock(&self.idle);
            if idle.len() < self.options.max_idle_or_default() as usize {
                idle.push_back(driver);
                drop(idle);
                self.permits.add_permits(1);
                return;
            }
        }

        retire(driver);
        self.permits.add_permits(1);
    }

    fn discard(&self, driver: PhysicalDriver) {
        self.counters.discarded.fetch_add(1, Ordering::AcqRel);
        warn!(pool = %self.name, driver_id = driver.id(), "Discarding driver");
        retire(driver);
        self.permits.add_permits(1);
    }

    fn stats(&self) -> PoolStats {
        let idle = lock(&self.idle).len();
        self.counters
            .snapshot(self.options.max_open_or_default(), idle)
    }

    fn options(&self) -> &PoolOptions {
        &self.options
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            let drained: Vec<PhysicalDriver> = lock(&self.idle).drain(..).collect();
            let count = drained.len();
            for mut driver in drained {
                driver.close().await;
            }
            info!(pool = %self.name, closed = count, "Driver pool closed");
        })
    }
}

/// One driver, reused for every borrow. Selected with `pool=false`.
pub struct SinglePool {
    name: String,
    connector: Arc<dyn Connector>,
    options: PoolOptions,
    permit: Semaphore,
    slot: Mutex<Option<PhysicalDriver>>,
    closed: AtomicBool,
    counters: Counters,
}

impl SinglePool {
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>, options: PoolOptions) -> Self {
        Self {
            name: name.into(),
            connector,
            options,
            permit: Semaphore::new(1),
            slot: Mutex::new(None),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    async fn borrow_inner(&self) -> DbResult<PhysicalDriver> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error(&self.name));
        }

        let permit = acquire(&self.permit, self.options.wait_timeout_or_default(), &self.name).await?;

        let cached = lock(&self.slot).take();
        let driver = match cached {
            Some(driver) => driver,
            None => {
                let id = self.counters.next_id.fetch_add(1, Ordering::AcqRel) + 1;
                let mut driver = PhysicalDriver::new(id, self.name.clone(), self.connector.create());
                driver.connect().await?;
                self.counters.created.fetch_add(1, Ordering::AcqRel);
                driver
            }
        };

        permit.forget();
        self.counters.borrowed.fetch_add(1, Ordering::AcqRel);
        Ok(driver)
    }
}

impl DriverPool for SinglePool {
    fn borrow(&self) -> BoxFuture<'_, DbResult<PhysicalDriver>> {
        Box::pin(self.borrow_inner())
    }

    fn give_back(&self, driver: PhysicalDriver) {
        self.counters.returned.fetch_add(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) || !driver.is_connected() {
            retire(driver);
        } else {
            *lock(&self.slot) = Some(driver);
        }
        self.permit.add_permits(1);
    }

    fn discard(&self, driver: PhysicalDriver) {
        self.counters.discarded.fetch_add(1, Ordering::AcqRel);
        warn!(pool = %self.name, driver_id = driver.id(), "Discarding unpooled driver");
        retire(driver);
        self.permit.add_permits(1);
    }

    fn stats(&self) -> PoolStats {
        let idle = usize::from(lock(&self.slot).is_some());
        self.counters.snapshot(1, idle)
    }

    fn options(&self) -> &PoolOptions {
        &self.options
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            let cached = lock(&self.slot).take();
            if let Some(mut driver) = cached {
                driver.close().await;
            }
            info!(pool = %self.name, "Unpooled driver closed");
        })
    }
}

async fn acquire<'a>(
    permits: &'a Semaphore,
    wait: Option<Duration>,
    pool: &str,
) -> DbResult<SemaphorePermit<'a>> {
    let acquired = match wait {
        Some(limit) => tokio::time::timeout(limit, permits.acquire())
            .await
            .map_err(|_| {
                warn!(pool = %pool, wait_secs = limit.as_secs(), "Timed out waiting for a driver");
                DbError::timeout(format!("borrow from pool '{}'", pool), limit.as_secs())
            })?,
        None => permits.acquire().await,
    };
    acquired.map_err(|_| closed_error(pool))
}

fn closed_error(pool: &str) -> DbError {
    DbError::connection(
        format!("Pool '{}' is closed", pool),
        "Borrow from the database again to get a fresh pool",
    )
}

/// Close a driver in the background; drivers leave the pool synchronously.
fn retire(mut driver: PhysicalDriver) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                driver.close().await;
            });
        }
        Err(_) => drop(driver),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::scripted::ScriptedConnector;

    fn pool_with(options: PoolOptions) -> (SimplePool, ScriptedConnector) {
        let connector = ScriptedConnector::new();
        let pool = SimplePool::new("main/master", Arc::new(connector.clone()), options);
        (pool, connector)
    }

    #[tokio::test]
    async fn test_borrow_and_return_reuses_driver() {
        let (pool, connector) = pool_with(PoolOptions::default());

        let driver = pool.borrow().await.unwrap();
        let id = driver.id();
        pool.give_back(driver);

        let again = pool.borrow().await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(connector.connects(), 1);

        pool.give_back(again);
        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.borrowed, 2);
        assert_eq!(stats.returned, 2);
        assert_eq!(stats.in_use(), 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_discarded_driver_is_not_reused() {
        let (pool, connector) = pool_with(PoolOptions::default());

        let driver = pool.borrow().await.unwrap();
        let id = driver.id();
        pool.discard(driver);

        let fresh = pool.borrow().await.unwrap();
        assert_ne!(fresh.id(), id);
        assert_eq!(connector.connects(), 2);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_borrow_times_out_when_exhausted() {
        let (pool, _) = pool_with(PoolOptions {
            max_open: Some(1),
            wait_timeout_secs: Some(1),
            ..Default::default()
        });

        let held = pool.borrow().await.unwrap();
        let err = pool.borrow().await.unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }));

        pool.give_back(held);
        assert!(pool.borrow().await.is_ok());
    }

    #[tokio::test]
    async fn test_idle_capped_at_max_idle() {
        let (pool, _) = pool_with(PoolOptions {
            max_open: Some(4),
            max_idle: Some(1),
            ..Default::default()
        });

        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        pool.give_back(a);
        pool.give_back(b);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_failed_connect_releases_permit() {
        let (pool, connector) = pool_with(PoolOptions {
            max_open: Some(1),
            wait_timeout_secs: Some(1),
            ..Default::default()
        });
        connector.fail_connects(1);

        assert!(pool.borrow().await.is_err());
        assert!(pool.borrow().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_borrow() {
        let (pool, _) = pool_with(PoolOptions::default());
        let driver = pool.borrow().await.unwrap();
        pool.give_back(driver);

        pool.close().await;
        assert_eq!(pool.stats().idle, 0);
        assert!(pool.borrow().await.is_err());
    }

    #[tokio::test]
    async fn test_single_pool_reuses_one_driver() {
        let connector = ScriptedConnector::new();
        let pool = SinglePool::new(
            "main/master",
            Arc::new(connector.clone()),
            PoolOptions {
                wait_timeout_secs: Some(1),
                ..Default::default()
            },
        );

        let first = pool.borrow().await.unwrap();
        let id = first.id();
        assert!(matches!(
            pool.borrow().await,
            Err(DbError::Timeout { .. })
        ));
        pool.give_back(first);

        let second = pool.borrow().await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(connector.connects(), 1);
        assert_eq!(pool.stats().max_open, 1);
    }
}
