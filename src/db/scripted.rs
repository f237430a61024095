//! In-process backend.
//!
//! [`ScriptedConnector`] produces backends that never touch the network.
//! Every statement they run is recorded, and results come from a responder
//! closure. Failures (lost connections, statement errors, failed commits)
//! can be injected to exercise the engine's recovery paths. The binary uses
//! it for `--dry-run`, and the test-suite drives the whole engine through it.

use crate::db::bind::Prepared;
use crate::db::driver::{Backend, Connector};
use crate::error::{DbError, DbResult};
use crate::models::Outcome;
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type Responder = dyn Fn(&Prepared) -> DbResult<Outcome> + Send + Sync;

/// Message used for injected disconnects; matches a known lost-connection signature.
pub const GONE_AWAY: &str = "MySQL server has gone away";

struct Shared {
    label: String,
    responder: Box<Responder>,
    log: Mutex<Vec<Prepared>>,
    failures: Mutex<VecDeque<DbError>>,
    connect_failures: AtomicUsize,
    fail_commits: AtomicBool,
    next_insert_id: AtomicU64,
    connects: AtomicUsize,
    closes: AtomicUsize,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// Factory for scripted backends; clones share the same log and counters.
#[derive(Clone)]
pub struct ScriptedConnector {
    shared: Arc<Shared>,
}

impl ScriptedConnector {
    /// Backend that answers queries with no rows and writes with one affected
    /// row. Inserts get increasing ids starting at 1.
    pub fn new() -> Self {
        Self::build("scripted", None)
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&Prepared) -> DbResult<Outcome> + Send + Sync + 'static,
    {
        Self::build("scripted", Some(Box::new(responder)))
    }

    /// Set the label shown by [`Connector::describe`].
    pub fn labeled(self, label: impl Into<String>) -> Self {
        match Arc::try_unwrap(self.shared) {
            Ok(mut shared) => {
                shared.label = label.into();
                Self {
                    shared: Arc::new(shared),
                }
            }
            Err(shared) => Self { shared },
        }
    }

    fn build(label: &str, responder: Option<Box<Responder>>) -> Self {
        let responder = responder.unwrap_or_else(|| {
            Box::new(|_: &Prepared| -> DbResult<Outcome> { Ok(Outcome::default()) })
        });
        Self {
            shared: Arc::new(Shared {
                label: label.to_string(),
                responder,
                log: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
                connect_failures: AtomicUsize::new(0),
                fail_commits: AtomicBool::new(false),
                next_insert_id: AtomicU64::new(1),
                connects: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                begins: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next `count` statements fail with a lost-connection error.
    pub fn fail_disconnects(&self, count: usize) {
        let mut failures = lock(&self.shared.failures);
        for _ in 0..count {
            failures.push_back(DbError::disconnected(GONE_AWAY));
        }
    }

    /// Make the next statement fail with an ordinary statement error.
    pub fn fail_next(&self, message: impl Into<String>) {
        lock(&self.shared.failures).push_back(DbError::statement(message, None));
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_connects(&self, count: usize) {
        self.shared.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Make every COMMIT fail until switched off.
    pub fn fail_commits(&self, enabled: bool) {
        self.shared.fail_commits.store(enabled, Ordering::SeqCst);
    }

    /// Statements run so far, in order.
    pub fn statements(&self) -> Vec<Prepared> {
        lock(&self.shared.log).clone()
    }

    /// SQL text of the statements run so far.
    pub fn sql_log(&self) -> Vec<String> {
        lock(&self.shared.log).iter().map(|p| p.sql.clone()).collect()
    }

    pub fn clear(&self) {
        lock(&self.shared.log).clear();
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn begins(&self) -> usize {
        self.shared.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.shared.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.shared.rollbacks.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for ScriptedConnector {
    fn create(&self) -> Box<dyn Backend> {
        Box::new(ScriptedBackend {
            shared: Arc::clone(&self.shared),
            connected: false,
        })
    }

    fn describe(&self) -> String {
        format!("scripted://{}", self.shared.label)
    }
}

struct ScriptedBackend {
    shared: Arc<Shared>,
    connected: bool,
}

impl ScriptedBackend {
    fn ensure_connected(&self) -> DbResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(DbError::disconnected("no connection to the server"))
        }
    }
}

impl Backend for ScriptedBackend {
    fn connect(&mut self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async move {
            let failing = self
                .shared
                .connect_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(DbError::connection(
                    "Can't connect to scripted server",
                    "Check the data source configuration",
                ));
            }
            self.shared.connects.fetch_add(1, Ordering::SeqCst);
            self.connected = true;
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.connected {
                self.connected = false;
                self.shared.closes.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    fn ping(&mut self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async move { self.ensure_connected() })
    }

    fn run<'a>(&'a mut self, statement: &'a Prepared) -> BoxFuture<'a, DbResult<Outcome>> {
        Box::pin(async move {
            self.ensure_connected()?;
            lock(&self.shared.log).push(statement.clone());

            if let Some(err) = lock(&self.shared.failures).pop_front() {
                if err.is_disconnect() {
                    self.connected = false;
                }
                return Err(err);
            }

            let mut outcome = (self.shared.responder)(statement)?;
            if outcome.last_insert_id.is_none()
                && statement
                    .sql
                    .trim_start()
                    .get(..6)
                    .is_some_and(|head| head.eq_ignore_ascii_case("INSERT"))
            {
                if outcome.rows_affected == 0 {
                    outcome.rows_affected = 1;
                }
                outcome.last_insert_id =
                    Some(self.shared.next_insert_id.fetch_add(1, Ordering::SeqCst));
            }
            Ok(outcome)
        })
    }

    fn begin(&mut self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async move {
            self.ensure_connected()?;
            self.shared.begins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn commit(&mut self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async move {
            self.ensure_connected()?;
            if self.shared.fail_commits.load(Ordering::SeqCst) {
                return Err(DbError::statement("Deadlock found when trying to get lock", None));
            }
            self.shared.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn rollback(&mut self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async move {
            self.ensure_connected()?;
            self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
